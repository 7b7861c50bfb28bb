//! Static import scanning
//!
//! Parses generated module source with the tree-sitter TypeScript grammar
//! (a superset of the JavaScript the generator emits) and records:
//! - every module specifier the module loads, with its byte range
//! - the shape of the module's entry point
//!
//! Relative and URL specifiers are loaded as-is; every other specifier is a
//! package dependency.

use crate::error::CompileError;
use std::ops::Range;
use toolsmith_artifact::ToolEntry;
use tree_sitter::{Node, Parser, Tree};

/// URL schemes that are loaded directly and never treated as packages
const URL_SCHEMES: &[&str] = &["http:", "https:", "data:", "blob:", "file:"];

/// Runtime prefixes stripped before package lookup (`node:fs` → `fs`)
const PACKAGE_PREFIXES: &[&str] = &["node:", "npm:"];

/// How a specifier was loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportForm {
    /// `import x from "pkg"` or `import "pkg"`
    Static,
    /// `export { x } from "pkg"`
    ReExport,
    /// `import("pkg")`
    Dynamic,
    /// `require("pkg")`
    Require,
}

/// One module specifier occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSite {
    /// Specifier text (without quotes)
    pub specifier: String,
    /// Byte range of the specifier text inside the source
    pub range: Range<usize>,
    /// How the specifier was loaded
    pub form: ImportForm,
}

impl ImportSite {
    /// Whether the specifier names a package (not relative, not a URL)
    #[inline]
    #[must_use]
    pub fn is_package(&self) -> bool {
        is_bare_specifier(&self.specifier)
    }
}

/// Location of the module's default export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultExport {
    /// `export default` prefix, up to the exported value
    pub prefix: Range<usize>,
    /// End of the whole export statement
    pub statement_end: usize,
    /// Classified entry shape
    pub entry: ToolEntry,
}

/// Everything the bundler needs to know about a module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportScan {
    /// Specifier occurrences in source order
    pub sites: Vec<ImportSite>,
    /// Default export, if any
    pub default_export: Option<DefaultExport>,
    /// Name range of an exported `handle` binding, if any
    pub named_handle: Option<Range<usize>>,
}

impl ImportScan {
    /// Distinct package roots in first-import order
    #[must_use]
    pub fn packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = Vec::new();
        for site in self.sites.iter().filter(|s| s.is_package()) {
            let root = package_root(&site.specifier);
            if !root.is_empty() && !packages.contains(&root) {
                packages.push(root);
            }
        }
        packages
    }

    /// Entry shape; the default export wins over a named `handle`
    #[inline]
    #[must_use]
    pub fn entry(&self) -> Option<ToolEntry> {
        self.default_export
            .as_ref()
            .map(|d| d.entry)
            .or(self.named_handle.as_ref().map(|_| ToolEntry::NamedHandle))
    }
}

/// Whether a specifier names a package rather than a relative path or URL
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    let spec = specifier.trim();
    if spec.is_empty() || spec == "." || spec == ".." {
        return false;
    }
    if spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('/') {
        return false;
    }
    let lowered = spec.to_ascii_lowercase();
    !URL_SCHEMES.iter().any(|scheme| lowered.starts_with(scheme))
}

/// Reduce a specifier to its package root
///
/// `lodash/fp` → `lodash`, `@scope/pkg/sub` → `@scope/pkg`,
/// `uuid@9.0.1` → `uuid`, `node:fs` → `fs`. Result is lowercase.
#[must_use]
pub fn package_root(specifier: &str) -> String {
    let mut spec = specifier.trim();
    for prefix in PACKAGE_PREFIXES {
        if let Some(rest) = spec.strip_prefix(prefix) {
            spec = rest;
            break;
        }
    }

    let mut parts = spec.split('/');
    let root = if spec.starts_with('@') {
        match (parts.next(), parts.next()) {
            (Some(scope), Some(name)) => format!("{scope}/{name}"),
            (Some(scope), None) => scope.to_string(),
            _ => String::new(),
        }
    } else {
        parts.next().unwrap_or_default().to_string()
    };

    strip_version(&root).to_ascii_lowercase()
}

/// Strip the specifier's module prefix, keeping any sub-path and version
#[must_use]
pub fn cdn_path(specifier: &str) -> &str {
    let spec = specifier.trim();
    PACKAGE_PREFIXES
        .iter()
        .find_map(|prefix| spec.strip_prefix(prefix))
        .unwrap_or(spec)
}

fn strip_version(root: &str) -> &str {
    let search_from = usize::from(root.starts_with('@'));
    match root[search_from..].find('@') {
        Some(i) => &root[..search_from + i],
        None => root,
    }
}

/// Scan module source for imports and its entry point
///
/// # Errors
/// Returns `CompileFailed` naming line and column of the first syntax error
pub fn scan_imports(source: &str) -> Result<ImportScan, CompileError> {
    let tree = parse(source)?;
    let root = tree.root_node();

    if root.has_error() {
        let detail = match first_error(root) {
            Some(node) => {
                let at = node.start_position();
                let what = if node.is_missing() {
                    format!("missing `{}`", node.kind())
                } else {
                    "unexpected token".to_string()
                };
                format!("syntax error at {}:{}: {what}", at.row + 1, at.column + 1)
            }
            None => "syntax error".to_string(),
        };
        return Err(CompileError::compile_failed(detail));
    }

    let mut scan = ImportScan {
        sites: collect_sites(root, source)?,
        ..ImportScan::default()
    };

    let mut cursor = root.walk();
    for node in root.named_children(&mut cursor) {
        if node.kind() != "export_statement" {
            continue;
        }
        if has_token(node, "default") {
            let value = node
                .child_by_field_name("value")
                .or_else(|| node.child_by_field_name("declaration"))
                .ok_or_else(|| CompileError::compile_failed("default export has no value"))?;
            scan.default_export = Some(DefaultExport {
                prefix: node.start_byte()..value.start_byte(),
                statement_end: node.end_byte(),
                entry: classify_default(value, source)?,
            });
        } else if let Some(decl) = node.child_by_field_name("declaration") {
            if let Some(name) = exported_handle_name(decl, source) {
                scan.named_handle = Some(name);
            }
        }
    }

    Ok(scan)
}

fn parse(source: &str) -> Result<Tree, CompileError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into())
        .map_err(|e| CompileError::compile_failed(format!("parser setup failed: {e}")))?;
    parser
        .parse(source, None)
        .ok_or_else(|| CompileError::compile_failed("parser produced no syntax tree"))
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}

fn collect_sites(root: Node<'_>, source: &str) -> Result<Vec<ImportSite>, CompileError> {
    let mut sites = Vec::new();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        match node.kind() {
            "import_statement" => {
                if let Some(site) = site_from(node.child_by_field_name("source"), source, ImportForm::Static) {
                    sites.push(site);
                }
            }
            "export_statement" => {
                if let Some(site) = site_from(node.child_by_field_name("source"), source, ImportForm::ReExport) {
                    sites.push(site);
                }
            }
            "call_expression" => {
                let form = match node.child_by_field_name("function") {
                    Some(f) if f.kind() == "import" => Some(ImportForm::Dynamic),
                    Some(f) if f.kind() == "identifier" && text(f, source) == "require" => {
                        Some(ImportForm::Require)
                    }
                    _ => None,
                };
                if let Some(form) = form {
                    let first_arg = node.child_by_field_name("arguments").and_then(|args| {
                        let mut cursor = args.walk();
                        let first = args.named_children(&mut cursor).next();
                        first
                    });
                    match site_from(first_arg, source, form) {
                        Some(site) => sites.push(site),
                        None => {
                            let at = node.start_position();
                            let call = if form == ImportForm::Require { "require" } else { "import" };
                            return Err(CompileError::compile_failed(format!(
                                "computed module specifier at {}:{}: {call}() must load a string literal",
                                at.row + 1,
                                at.column + 1,
                            )));
                        }
                    }
                }
            }
            _ => {}
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }

    sites.sort_by_key(|s| s.range.start);
    Ok(sites)
}

fn site_from(node: Option<Node<'_>>, source: &str, form: ImportForm) -> Option<ImportSite> {
    let node = node?;
    let literal = match node.kind() {
        "string" => true,
        "template_string" => node.named_child_count() == 0 || only_fragments(node),
        _ => false,
    };
    if !literal || node.end_byte() < node.start_byte() + 2 {
        return None;
    }
    let range = node.start_byte() + 1..node.end_byte() - 1;
    Some(ImportSite {
        specifier: source[range.clone()].to_string(),
        range,
        form,
    })
}

fn only_fragments(node: Node<'_>) -> bool {
    let mut cursor = node.walk();
    let fragments = node
        .named_children(&mut cursor)
        .all(|c| c.kind() == "string_fragment");
    fragments
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    &source[node.byte_range()]
}

fn has_token(node: Node<'_>, token: &str) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|c| !c.is_named() && c.kind() == token);
    found
}

fn unwrap_expression(mut node: Node<'_>) -> Node<'_> {
    while matches!(
        node.kind(),
        "parenthesized_expression" | "satisfies_expression" | "as_expression"
    ) {
        match node.named_child(0) {
            Some(inner) => node = inner,
            None => break,
        }
    }
    node
}

fn classify_default(value: Node<'_>, source: &str) -> Result<ToolEntry, CompileError> {
    let value = unwrap_expression(value);
    match value.kind() {
        "object" => {
            if object_has_fetch(value, source) {
                Ok(ToolEntry::DefaultFetch)
            } else {
                Err(CompileError::compile_failed(
                    "default export object has no fetch method",
                ))
            }
        }
        "function_expression"
        | "function"
        | "function_declaration"
        | "generator_function"
        | "generator_function_declaration"
        | "arrow_function" => Ok(ToolEntry::DefaultFunction),
        // Identifiers and calls are dispatched at runtime; fetch objects dominate.
        _ => Ok(ToolEntry::DefaultFetch),
    }
}

fn object_has_fetch(object: Node<'_>, source: &str) -> bool {
    let mut cursor = object.walk();
    let has_fetch = object.named_children(&mut cursor).any(|member| match member.kind() {
        "method_definition" => member
            .child_by_field_name("name")
            .is_some_and(|name| text(name, source) == "fetch"),
        "pair" => member.child_by_field_name("key").is_some_and(|key| {
            text(key, source).trim_matches(|c| c == '"' || c == '\'') == "fetch"
        }),
        "shorthand_property_identifier" => text(member, source) == "fetch",
        _ => false,
    });
    has_fetch
}

fn exported_handle_name(decl: Node<'_>, source: &str) -> Option<Range<usize>> {
    match decl.kind() {
        "function_declaration" | "generator_function_declaration" => decl
            .child_by_field_name("name")
            .filter(|name| text(*name, source) == "handle")
            .map(|name| name.byte_range()),
        "lexical_declaration" | "variable_declaration" => {
            let mut cursor = decl.walk();
            let found = decl
                .named_children(&mut cursor)
                .filter(|d| d.kind() == "variable_declarator")
                .filter_map(|d| d.child_by_field_name("name"))
                .find(|name| text(*name, source) == "handle")
                .map(|name| name.byte_range());
            found
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FETCH_TOOL: &str = r#"
import { v4 as uuidv4 } from "uuid";
import "./polyfill.js";

export default {
  async fetch(request) {
    return new Response(JSON.stringify({ id: uuidv4() }), {
      headers: { "content-type": "application/json" },
    });
  },
};
"#;

    #[test]
    fn scans_static_imports_and_entry() {
        let scan = scan_imports(FETCH_TOOL).unwrap();
        let specifiers: Vec<&str> = scan.sites.iter().map(|s| s.specifier.as_str()).collect();
        assert_eq!(specifiers, vec!["uuid", "./polyfill.js"]);
        assert_eq!(scan.packages(), vec!["uuid".to_string()]);
        assert_eq!(scan.entry(), Some(ToolEntry::DefaultFetch));
    }

    #[test]
    fn site_range_points_at_specifier_text() {
        let scan = scan_imports(FETCH_TOOL).unwrap();
        let site = &scan.sites[0];
        assert_eq!(&FETCH_TOOL[site.range.clone()], "uuid");
        assert_eq!(site.form, ImportForm::Static);
    }

    #[test]
    fn scans_reexports_dynamic_imports_and_require() {
        let source = r#"
export { marked } from "marked";
const qr = await import("qrcode");
const fs = require("node:fs");
const local = await import("./local.js");
export default async function (input) { return input; }
"#;
        let scan = scan_imports(source).unwrap();
        let forms: Vec<ImportForm> = scan.sites.iter().map(|s| s.form).collect();
        assert_eq!(
            forms,
            vec![
                ImportForm::ReExport,
                ImportForm::Dynamic,
                ImportForm::Require,
                ImportForm::Dynamic
            ]
        );
        assert_eq!(scan.packages(), vec!["marked", "qrcode", "fs"]);
        assert_eq!(scan.entry(), Some(ToolEntry::DefaultFunction));
    }

    #[test]
    fn computed_specifiers_are_rejected() {
        for source in [
            "const name = \"fs\";\nconst m = await import(name);\nexport default () => m;\n",
            "export default (input) => require(\"n\" + input);\n",
            "export default async (input) => import(`./${input}.js`);\n",
        ] {
            let err = scan_imports(source).unwrap_err();
            assert!(
                err.to_string().contains("must load a string literal"),
                "unexpected error for {source:?}: {err}"
            );
        }
    }

    #[test]
    fn plain_template_specifier_is_a_site() {
        let scan = scan_imports("const m = await import(`uuid`);\nexport default () => m;\n").unwrap();
        assert_eq!(scan.packages(), vec!["uuid"]);
    }

    #[test]
    fn url_and_relative_specifiers_are_not_packages() {
        assert!(!is_bare_specifier("./util.js"));
        assert!(!is_bare_specifier("../shared/mod.ts"));
        assert!(!is_bare_specifier("/abs/mod.js"));
        assert!(!is_bare_specifier("https://esm.sh/uuid"));
        assert!(!is_bare_specifier("data:text/javascript,export default 1"));
        assert!(is_bare_specifier("uuid"));
        assert!(is_bare_specifier("node:fs"));
        assert!(is_bare_specifier("@scope/pkg"));
    }

    #[test]
    fn package_root_normalization() {
        assert_eq!(package_root("lodash/fp"), "lodash");
        assert_eq!(package_root("@Scope/Pkg/sub/path"), "@scope/pkg");
        assert_eq!(package_root("uuid@9.0.1"), "uuid");
        assert_eq!(package_root("@scope/pkg@2"), "@scope/pkg");
        assert_eq!(package_root("node:fs"), "fs");
        assert_eq!(package_root("npm:marked@12/lib"), "marked");
    }

    #[test]
    fn cdn_path_keeps_subpath_and_version() {
        assert_eq!(cdn_path("npm:marked@12"), "marked@12");
        assert_eq!(cdn_path("date-fns/format"), "date-fns/format");
    }

    #[test]
    fn packages_are_deduplicated_in_first_import_order() {
        let source = r#"
import { format } from "date-fns/format";
import { z } from "zod";
import { parseISO } from "date-fns";
export function handle(input) { return format(parseISO(input), "PPP"); }
"#;
        let scan = scan_imports(source).unwrap();
        assert_eq!(scan.packages(), vec!["date-fns", "zod"]);
        assert_eq!(scan.entry(), Some(ToolEntry::NamedHandle));
    }

    #[test]
    fn named_handle_as_const_arrow() {
        let source = "export const handle = async (input) => input.toUpperCase();\n";
        let scan = scan_imports(source).unwrap();
        let range = scan.named_handle.clone().unwrap();
        assert_eq!(&source[range], "handle");
    }

    #[test]
    fn default_export_with_satisfies_is_unwrapped() {
        let source = r#"
export default {
  fetch(req: Request): Response { return new Response("ok"); },
} satisfies { fetch: (r: Request) => Response };
"#;
        let scan = scan_imports(source).unwrap();
        assert_eq!(scan.entry(), Some(ToolEntry::DefaultFetch));
    }

    #[test]
    fn default_export_object_without_fetch_is_rejected() {
        let err = scan_imports("export default { run() { return 1; } };\n").unwrap_err();
        assert!(err.to_string().contains("no fetch method"));
    }

    #[test]
    fn module_without_entry_has_none() {
        let scan = scan_imports("export const value = 1;\n").unwrap();
        assert_eq!(scan.entry(), None);
    }

    #[test]
    fn syntax_error_reports_position() {
        let err = scan_imports("import { x from \"uuid\";\nexport default {").unwrap_err();
        match err {
            CompileError::CompileFailed { detail } => assert!(detail.starts_with("syntax error")),
            other => panic!("expected CompileFailed, got {other:?}"),
        }
    }
}
