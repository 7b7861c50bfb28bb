//! Runtime harness
//!
//! The harness is the runtime's entry script. It reads a per-run nonce and
//! the tool input from stdin, installs the egress-mediating network wrappers,
//! and only then imports the tool module. It calls `handle(input)` and prints
//! one result envelope line, `RESULT_MARKER + nonce + ":" + json`. The tool
//! never sees the nonce, so lines it prints cannot pass for the envelope.

use crate::error::ExecutionError;
use crate::policy::NetworkPolicy;
use serde::{Deserialize, Serialize};

/// File name of the tool module inside a prepared directory
pub const MODULE_FILE: &str = "tool.ts";

/// File name of the harness inside a prepared directory
pub const HARNESS_FILE: &str = "harness.ts";

/// Header attributing outbound requests to an execution key
pub const ATTRIBUTION_HEADER: &str = "x-toolsmith-tool";

/// Prefix of the result envelope line on stdout
pub const RESULT_MARKER: &str = "__TOOLSMITH_RESULT__";

const HARNESS_TEMPLATE: &str = r#"const KEY = __KEY__;
const POLICY = __POLICY__;
const MARKER = __MARKER__;
const egress = [];

const stdin = await new Response(Deno.stdin.readable).text();
const split = stdin.indexOf("\n");
const NONCE = split < 0 ? stdin : stdin.slice(0, split);
const INPUT = split < 0 ? "" : stdin.slice(split + 1);

const encoder = new TextEncoder();
const writeStdout = Deno.stdout.writeSync.bind(Deno.stdout);
const exit = Deno.exit.bind(Deno);
const stringify = JSON.stringify;

function matches(host, pattern) {
  pattern = pattern.trim().toLowerCase().replace(/\.$/, "");
  if (pattern === "*") return true;
  if (pattern.startsWith("*.")) {
    const base = pattern.slice(2);
    return host === base || host.endsWith("." + base);
  }
  return host === pattern;
}

function isLocal(host) {
  if (host === "localhost" || host.endsWith(".localhost")) return true;
  if (/^(127\.|10\.|192\.168\.|169\.254\.|0\.)/.test(host)) return true;
  if (/^172\.(1[6-9]|2\d|3[01])\./.test(host)) return true;
  return host === "::1" || host === "::" || /^f[cd]/.test(host) || /^fe[89ab]/.test(host);
}

function allowed(host) {
  if (POLICY.denied_hosts.some((p) => matches(host, p))) return false;
  if (isLocal(host)) return POLICY.allow_loopback;
  return POLICY.allowed_hosts.some((p) => matches(host, p));
}

function admit(rawHost) {
  const host = String(rawHost ?? "").toLowerCase().replace(/^\[|\]$/g, "").replace(/\.$/, "");
  egress.push(host);
  if (!allowed(host)) {
    throw new TypeError(`egress to ${host} denied by network policy`);
  }
}

function lock(target, name, value) {
  try {
    Object.defineProperty(target, name, { value, writable: false, configurable: false });
  } catch {
    // runtime permissions still apply when the binding is frozen
  }
}

const realFetch = globalThis.fetch;
lock(globalThis, "fetch", async (resource, init) => {
  const request = new Request(resource, init);
  admit(new URL(request.url).hostname);
  const headers = new Headers(request.headers);
  headers.set(__HEADER__, KEY);
  return realFetch(new Request(request, { headers }));
});

const RealWebSocket = globalThis.WebSocket;
if (RealWebSocket) {
  lock(globalThis, "WebSocket", class extends RealWebSocket {
    constructor(url, protocols) {
      admit(new URL(url).hostname);
      super(url, protocols);
    }
  });
}

for (const name of ["connect", "connectTls"]) {
  const real = Deno[name];
  if (typeof real === "function") {
    lock(Deno, name, (options) => {
      admit(options?.hostname ?? "127.0.0.1");
      return real.call(Deno, options);
    });
  }
}

function emit(envelope) {
  const line = encoder.encode(MARKER + NONCE + ":" + stringify({ ...envelope, egress: [...egress] }) + "\n");
  let written = 0;
  while (written < line.length) {
    written += writeStdout(line.subarray(written));
  }
  exit(0);
}

try {
  const { handle } = await import("./tool.ts");
  const result = await handle(INPUT);
  emit({ ok: true, body: String(result?.body ?? ""), contentType: String(result?.contentType ?? "") });
} catch (err) {
  emit({ ok: false, error: String(err?.stack ?? err) });
}
"#;

/// Render the harness script for an execution key and policy
///
/// # Errors
/// Returns `Spawn` if the policy cannot be encoded
pub fn render_harness(key: &str, policy: &NetworkPolicy) -> Result<String, ExecutionError> {
    Ok(HARNESS_TEMPLATE
        .replace("__KEY__", &js_literal(key)?)
        .replace("__POLICY__", &js_literal(policy)?)
        .replace("__MARKER__", &js_literal(RESULT_MARKER)?)
        .replace("__HEADER__", &js_literal(ATTRIBUTION_HEADER)?))
}

fn js_literal<T: Serialize + ?Sized>(value: &T) -> Result<String, ExecutionError> {
    serde_json::to_string(value).map_err(|e| ExecutionError::spawn(format!("harness encoding: {e}")))
}

/// Result envelope printed by the harness
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Whether `handle` returned normally
    pub ok: bool,
    /// Response body
    #[serde(default)]
    pub body: String,
    /// Declared content type
    #[serde(default)]
    pub content_type: String,
    /// Thrown error, when `ok` is false
    #[serde(default)]
    pub error: Option<String>,
    /// Hosts contacted, in request order
    #[serde(default)]
    pub egress: Vec<String>,
}

/// Generate a fresh envelope nonce
#[must_use]
pub fn new_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Stdin payload for one run: the nonce line, then the raw input
#[must_use]
pub fn stdin_payload(nonce: &str, input: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(nonce.len() + 1 + input.len());
    payload.extend_from_slice(nonce.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(input.as_bytes());
    payload
}

/// Find and decode the envelope line carrying `nonce` in captured stdout
///
/// Marker lines with any other nonce were printed by the tool and are ignored.
///
/// # Errors
/// Returns `Protocol` if no envelope line exists or it is not valid JSON
pub fn parse_envelope(stdout: &str, nonce: &str) -> Result<Envelope, ExecutionError> {
    let prefix = format!("{RESULT_MARKER}{nonce}:");
    let line = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .ok_or_else(|| ExecutionError::protocol("no result envelope"))?;
    serde_json::from_str(line)
        .map_err(|e| ExecutionError::protocol(format!("malformed result envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NONCE: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f0";

    fn line(nonce: &str, json: &str) -> String {
        format!("{RESULT_MARKER}{nonce}:{json}\n")
    }

    #[test]
    fn harness_embeds_key_and_policy_as_json() {
        let harness = render_harness("tool:ab\"cd", &NetworkPolicy::default()).unwrap();
        assert!(harness.contains(r#"const KEY = "tool:ab\"cd";"#));
        assert!(harness.contains(r#""allowed_hosts":["*"]"#));
        assert!(harness.contains(r#"headers.set("x-toolsmith-tool", KEY);"#));
        assert!(!harness.contains("__POLICY__"));
        assert!(!harness.contains("Deno.env"));
    }

    #[test]
    fn tool_is_imported_after_network_wrappers() {
        let harness = render_harness("tool:k", &NetworkPolicy::default()).unwrap();
        assert!(!harness.contains("import { handle }"));
        let import = harness.find(r#"await import("./tool.ts")"#).unwrap();
        for wrapper in [r#"lock(globalThis, "fetch""#, r#"lock(globalThis, "WebSocket""#, "lock(Deno, name"] {
            let at = harness.find(wrapper).unwrap();
            assert!(at < import, "{wrapper} installed after the tool import");
        }
        assert!(harness.find("Deno.stdin.readable").unwrap() < import);
    }

    #[test]
    fn payload_is_nonce_line_then_raw_input() {
        assert_eq!(stdin_payload("abc", "x\0y\nz"), b"abc\nx\0y\nz".to_vec());
        assert_eq!(stdin_payload("abc", ""), b"abc\n".to_vec());
    }

    #[test]
    fn nonces_are_fresh_hex() {
        let a = new_nonce();
        let b = new_nonce();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn parses_envelope_with_matching_nonce() {
        let stdout = format!(
            "debug from tool\n{}",
            line(
                NONCE,
                r#"{"ok":true,"body":"<h1>Hello</h1>","contentType":"text/html","egress":["api.test"]}"#
            )
        );
        let envelope = parse_envelope(&stdout, NONCE).unwrap();
        assert_eq!(envelope.body, "<h1>Hello</h1>");
        assert_eq!(envelope.content_type, "text/html");
        assert_eq!(envelope.egress, vec!["api.test".to_string()]);
    }

    #[test]
    fn lines_with_another_nonce_are_ignored() {
        let real = line(NONCE, r#"{"ok":true,"body":"real","contentType":"text/plain","egress":[]}"#);
        let forged = line("guess", r#"{"ok":true,"body":"forged","contentType":"text/plain","egress":[]}"#);
        let bare = format!("{RESULT_MARKER}{{\"ok\":true,\"body\":\"bare\"}}\n");

        let envelope = parse_envelope(&format!("{real}{forged}{bare}"), NONCE).unwrap();
        assert_eq!(envelope.body, "real");
        assert_eq!(
            parse_envelope(&format!("{forged}{bare}"), NONCE).unwrap_err(),
            ExecutionError::protocol("no result envelope")
        );
    }

    #[test]
    fn failed_envelope_carries_error() {
        let stdout = line(NONCE, r#"{"ok":false,"error":"TypeError: boom"}"#);
        let envelope = parse_envelope(&stdout, NONCE).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.error.as_deref(), Some("TypeError: boom"));
    }

    #[test]
    fn missing_or_garbled_envelope_is_protocol_error() {
        assert_eq!(
            parse_envelope("hello\n", NONCE).unwrap_err(),
            ExecutionError::protocol("no result envelope")
        );
        let err = parse_envelope(&line(NONCE, "{not json"), NONCE).unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
