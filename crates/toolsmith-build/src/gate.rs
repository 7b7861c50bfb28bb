//! Package compatibility gate
//!
//! A static knowledge base of packages known to work (or known not to work)
//! inside the isolated runtime, and the pre-compile gate that classifies a
//! module's imports against it.
//!
//! Unknown packages are allowed optimistically and reported as warnings.
//! Known-incompatible packages block the pipeline before compilation.

use crate::error::KnowledgeBaseError;
use crate::imports::package_root;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

/// Built-in edge-compatible packages: (name, description, usage hint, example).
/// Sorted ascending by name — verified by unit test.
static COMPATIBLE: &[(&str, &str, &str, &str)] = &[
    ("chroma-js", "Color conversions and scales", "import chroma from \"chroma-js\"", "chroma(\"#ff0000\").darken().hex()"),
    ("crypto-js", "Pure-JS hashing and ciphers", "import CryptoJS from \"crypto-js\"", "CryptoJS.SHA256(text).toString()"),
    ("d3-scale", "Numeric and ordinal scales", "import { scaleLinear } from \"d3-scale\"", "scaleLinear().domain([0, 1]).range([0, 100])"),
    ("d3-shape", "SVG path generators", "import { line } from \"d3-shape\"", "line()([[0, 0], [10, 10]])"),
    ("date-fns", "Date formatting and arithmetic", "import { format } from \"date-fns\"", "format(new Date(), \"yyyy-MM-dd\")"),
    ("dayjs", "Small date library", "import dayjs from \"dayjs\"", "dayjs().add(1, \"day\").format()"),
    ("fast-xml-parser", "XML parsing and building", "import { XMLParser } from \"fast-xml-parser\"", "new XMLParser().parse(xml)"),
    ("he", "HTML entity encoding", "import he from \"he\"", "he.encode(text)"),
    ("highlight.js", "Syntax highlighting to HTML", "import hljs from \"highlight.js\"", "hljs.highlightAuto(code).value"),
    ("js-yaml", "YAML parsing and dumping", "import yaml from \"js-yaml\"", "yaml.load(text)"),
    ("jsbarcode", "Barcode rendering", "import JsBarcode from \"jsbarcode\"", "JsBarcode(svgNode, value)"),
    ("lodash", "General utilities", "import _ from \"lodash\"", "_.chunk(items, 2)"),
    ("marked", "Markdown to HTML", "import { marked } from \"marked\"", "await marked.parse(markdown)"),
    ("mathjs", "Expression evaluation and math", "import { evaluate } from \"mathjs\"", "evaluate(\"sqrt(16) + 2\")"),
    ("nanoid", "Short unique ids", "import { nanoid } from \"nanoid\"", "nanoid(12)"),
    ("papaparse", "CSV parsing and unparsing", "import Papa from \"papaparse\"", "Papa.parse(csv, { header: true }).data"),
    ("qrcode", "QR codes as SVG or data URL", "import QRCode from \"qrcode\"", "await QRCode.toString(text, { type: \"svg\" })"),
    ("slugify", "URL slugs", "import slugify from \"slugify\"", "slugify(title, { lower: true })"),
    ("uuid", "RFC 4122 UUIDs", "import { v4 as uuidv4 } from \"uuid\"", "uuidv4()"),
    ("yaml", "YAML parsing and stringifying", "import YAML from \"yaml\"", "YAML.parse(text)"),
    ("zod", "Schema validation", "import { z } from \"zod\"", "z.string().email().parse(input)"),
];

/// Built-in incompatible packages: (name, reason, alternative).
/// Sorted ascending by name — verified by unit test.
static INCOMPATIBLE: &[(&str, &str, Option<&str>)] = &[
    ("bcrypt", "native add-on; cannot load in the isolate", Some("bcryptjs")),
    ("better-sqlite3", "native add-on with file-system database", None),
    ("canvas", "native add-on (Cairo bindings)", Some("an SVG string")),
    ("child_process", "Node.js built-in; process spawning is unavailable", None),
    ("cluster", "Node.js built-in; process management is unavailable", None),
    ("crypto", "Node.js built-in crypto module", Some("globalThis.crypto (Web Crypto)")),
    ("dgram", "Node.js built-in; raw UDP sockets are unavailable", None),
    ("dns", "Node.js built-in; DNS resolution is unavailable", Some("fetch")),
    ("fs", "Node.js built-in; there is no file system in the isolate", Some("in-memory data or fetch")),
    ("http", "Node.js built-in server/client", Some("fetch")),
    ("https", "Node.js built-in server/client", Some("fetch")),
    ("net", "Node.js built-in; raw TCP sockets are unavailable", Some("fetch")),
    ("os", "Node.js built-in; host information is unavailable", None),
    ("path", "Node.js built-in path utilities", Some("URL")),
    ("playwright", "drives a local browser binary", None),
    ("process", "Node.js built-in process object", None),
    ("puppeteer", "drives a local browser binary", None),
    ("readline", "Node.js built-in; there is no interactive terminal", None),
    ("sharp", "native add-on (libvips bindings)", Some("an SVG string")),
    ("sqlite3", "native add-on with file-system database", None),
    ("stream", "Node.js built-in streams", Some("web streams (ReadableStream)")),
    ("tls", "Node.js built-in; raw TLS sockets are unavailable", Some("fetch")),
    ("vm", "Node.js built-in script sandboxing", None),
    ("worker_threads", "Node.js built-in threads", None),
    ("zlib", "Node.js built-in compression", Some("CompressionStream")),
];

/// Runtime contract handed to the generator with every request
const RUNTIME_CONTRACT: &str = "\
Runtime contract:
- The module runs in an isolated JavaScript runtime with web-standard APIs only \
(fetch, Request, Response, URL, TextEncoder, crypto.subtle).
- Export `default { async fetch(request) { ... } }`.
- Read the tool input with `new URL(request.url).searchParams.get(\"input\")`.
- Return a Response whose content-type header matches the output.
- Import packages by bare name; they are resolved from a module CDN.
- Node.js built-ins and native add-ons are unavailable.
";

/// Compatibility knowledge for one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCompatibilityRecord {
    /// Whether the package works inside the isolate
    pub compatible: bool,
    /// How to import and use the package
    #[serde(default, alias = "usageHint", skip_serializing_if = "Option::is_none")]
    pub usage_hint: Option<String>,
    /// Short usage example
    #[serde(default, alias = "exampleSnippet", skip_serializing_if = "Option::is_none")]
    pub example_snippet: Option<String>,
    /// What the package does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Why the package is incompatible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Suggested replacement for an incompatible package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative: Option<String>,
}

impl PackageCompatibilityRecord {
    /// Record for a compatible package
    #[must_use]
    pub fn compatible(description: impl Into<String>) -> Self {
        Self {
            compatible: true,
            usage_hint: None,
            example_snippet: None,
            description: Some(description.into()),
            reason: None,
            alternative: None,
        }
    }

    /// Record for an incompatible package
    #[must_use]
    pub fn incompatible(reason: impl Into<String>, alternative: Option<&str>) -> Self {
        Self {
            compatible: false,
            usage_hint: None,
            example_snippet: None,
            description: None,
            reason: Some(reason.into()),
            alternative: alternative.map(str::to_string),
        }
    }

    /// With usage hint
    #[must_use]
    pub fn with_usage(mut self, hint: impl Into<String>, snippet: impl Into<String>) -> Self {
        self.usage_hint = Some(hint.into());
        self.example_snippet = Some(snippet.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct KnowledgeBaseFile {
    #[serde(default)]
    packages: BTreeMap<String, PackageCompatibilityRecord>,
}

/// Read-only package knowledge base
///
/// Configuration data: built once at startup and shared, never mutated by
/// request traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeBase {
    records: BTreeMap<String, PackageCompatibilityRecord>,
}

impl KnowledgeBase {
    /// Empty knowledge base (every package unknown)
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Knowledge base populated from the built-in tables
    #[must_use]
    pub fn builtin() -> Self {
        let mut records = BTreeMap::new();
        for (name, description, hint, snippet) in COMPATIBLE {
            records.insert(
                (*name).to_string(),
                PackageCompatibilityRecord::compatible(*description).with_usage(*hint, *snippet),
            );
        }
        for (name, reason, alternative) in INCOMPATIBLE {
            records.insert(
                (*name).to_string(),
                PackageCompatibilityRecord::incompatible(*reason, *alternative),
            );
        }
        Self { records }
    }

    /// Insert or replace a record
    pub fn insert(&mut self, name: &str, record: PackageCompatibilityRecord) {
        self.records.insert(package_root(name), record);
    }

    /// Look up a package by specifier or name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PackageCompatibilityRecord> {
        self.records.get(&package_root(name))
    }

    /// Number of known packages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no packages are known
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge records from a TOML document (`[packages.<name>]` tables) over this base
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML of the expected shape
    pub fn merge_toml_str(&mut self, document: &str) -> Result<(), KnowledgeBaseError> {
        let file: KnowledgeBaseFile = toml::from_str(document)?;
        self.merge(file);
        Ok(())
    }

    /// Merge records from a JSON document (`{"packages": {...}}`) over this base
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON of the expected shape
    pub fn merge_json_str(&mut self, document: &str) -> Result<(), KnowledgeBaseError> {
        let file: KnowledgeBaseFile = serde_json::from_str(document)?;
        self.merge(file);
        Ok(())
    }

    /// Built-ins merged with the records in a `.toml` or `.json` file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, KnowledgeBaseError> {
        let document = std::fs::read_to_string(path).map_err(|source| KnowledgeBaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut kb = Self::builtin();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            kb.merge_json_str(&document)?;
        } else {
            kb.merge_toml_str(&document)?;
        }
        Ok(kb)
    }

    fn merge(&mut self, file: KnowledgeBaseFile) {
        for (name, record) in file.packages {
            self.insert(&name, record);
        }
    }

    /// Environment/documentation context for a generation request
    ///
    /// Always includes the runtime contract. Adds usage notes for every known
    /// compatible package the prompt mentions, and lists the unavailable ones.
    #[must_use]
    pub fn context_for(&self, prompt: &str) -> String {
        let lowered = prompt.to_lowercase();
        let words: BTreeSet<&str> = lowered
            .split(|c: char| !(c.is_ascii_alphanumeric() || "._@/-".contains(c)))
            .map(|w| w.trim_matches(|c: char| c == '.' || c == '-'))
            .filter(|w| !w.is_empty())
            .collect();

        let mut context = String::from(RUNTIME_CONTRACT);

        let mentioned: Vec<(&String, &PackageCompatibilityRecord)> = self
            .records
            .iter()
            .filter(|(name, record)| record.compatible && words.contains(name.as_str()))
            .collect();
        if !mentioned.is_empty() {
            context.push_str("\nPackages mentioned in the request:\n");
            for (name, record) in mentioned {
                let _ = write!(context, "- {name}");
                if let Some(description) = &record.description {
                    let _ = write!(context, ": {description}");
                }
                context.push('\n');
                if let Some(hint) = &record.usage_hint {
                    let _ = writeln!(context, "  usage: {hint}");
                }
                if let Some(snippet) = &record.example_snippet {
                    let _ = writeln!(context, "  example: {snippet}");
                }
            }
        }

        let unavailable: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| !record.compatible)
            .map(|(name, record)| match &record.alternative {
                Some(alt) => format!("{name} (use {alt})"),
                None => name.clone(),
            })
            .collect();
        if !unavailable.is_empty() {
            let _ = writeln!(context, "\nUnavailable packages: {}", unavailable.join(", "));
        }

        context
    }
}

/// A package the gate refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompatiblePackage {
    /// Package name as imported
    pub name: String,
    /// Why it cannot run in the isolate
    pub reason: String,
    /// Suggested replacement
    pub alternative: Option<String>,
}

/// Outcome of a compatibility check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    /// Packages allowed through (known-compatible and unknown)
    pub compatible: Vec<String>,
    /// Packages known not to work
    pub incompatible: Vec<IncompatiblePackage>,
    /// Human-readable notes (incompatibilities and unknowns)
    pub warnings: Vec<String>,
}

impl CompatibilityReport {
    /// Whether compilation may proceed
    #[inline]
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.incompatible.is_empty()
    }

    /// Names of the incompatible packages
    #[must_use]
    pub fn incompatible_names(&self) -> Vec<String> {
        self.incompatible.iter().map(|p| p.name.clone()).collect()
    }
}

/// Pre-compile gate over a shared knowledge base
#[derive(Debug, Clone, Default)]
pub struct CompatibilityGate {
    knowledge: std::sync::Arc<KnowledgeBase>,
}

impl CompatibilityGate {
    /// Create gate over knowledge base
    #[inline]
    #[must_use]
    pub fn new(knowledge: std::sync::Arc<KnowledgeBase>) -> Self {
        Self { knowledge }
    }

    /// Gate over the built-in knowledge base
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(std::sync::Arc::new(KnowledgeBase::builtin()))
    }

    /// Knowledge base backing this gate
    #[inline]
    #[must_use]
    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    /// Classify package names
    ///
    /// Pure lookup; never fails. Duplicate names are reported once.
    #[must_use]
    pub fn check(&self, packages: &[String]) -> CompatibilityReport {
        let mut report = CompatibilityReport::default();
        let mut seen = BTreeSet::new();

        for name in packages {
            let root = package_root(name);
            if root.is_empty() || !seen.insert(root.clone()) {
                continue;
            }
            match self.knowledge.get(&root) {
                Some(record) if record.compatible => report.compatible.push(root),
                Some(record) => {
                    let reason = record
                        .reason
                        .clone()
                        .unwrap_or_else(|| "not supported in the isolate".to_string());
                    let mut warning = format!("{root} is incompatible: {reason}");
                    if let Some(alt) = &record.alternative {
                        let _ = write!(warning, " (try {alt})");
                    }
                    report.warnings.push(warning);
                    report.incompatible.push(IncompatiblePackage {
                        name: root,
                        reason,
                        alternative: record.alternative.clone(),
                    });
                }
                None => {
                    report.warnings.push(format!("{root}: compatibility unknown"));
                    report.compatible.push(root);
                }
            }
        }

        report
    }
}
