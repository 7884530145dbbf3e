//! Structural outlines: tree-sitter symbol extraction plus a fixed pattern
//! set for framework call sites (HTTP routes, test harness calls, event
//! listener registrations). Feature-gated behind `treesitter`; without a
//! parser for the language, outlines are empty and snippet extraction falls
//! back to head-of-file.

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::types::{now_unix, SymbolKind};

/// One structural symbol with its span and display signature.
#[derive(Debug, Clone, Serialize)]
pub struct OutlineSymbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based start line.
    pub start_line: u32,
    /// 1-based end line, inclusive.
    pub end_line: u32,
    pub signature: String,
}

// ---------------------------------------------------------------------------
// Tree-sitter extraction
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
mod ts {
    use super::OutlineSymbol;
    use crate::types::SymbolKind;
    use tree_sitter::{Language, Node, Parser};

    fn language_for_ext(ext: &str) -> Option<Language> {
        match ext {
            "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
            "ts" | "tsx" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
            "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
            "go" => Some(tree_sitter_go::LANGUAGE.into()),
            _ => None,
        }
    }

    /// Map a node kind to the closed symbol set. Container-like nodes all
    /// become Class; value/type aliases are not outlined.
    fn classify_node(kind: &str) -> Option<SymbolKind> {
        match kind {
            "function_item" | "function_declaration" | "function_definition" => {
                Some(SymbolKind::Function)
            }
            "method_definition" | "method_declaration" => Some(SymbolKind::Method),
            "class_declaration" | "class_definition" | "struct_item" | "enum_item"
            | "trait_item" | "impl_item" | "interface_declaration" => Some(SymbolKind::Class),
            _ => None,
        }
    }

    fn extract_name(node: &Node, source: &[u8]) -> Option<String> {
        for field in ["name", "type"] {
            if let Some(name_node) = node.child_by_field_name(field) {
                if let Ok(text) = name_node.utf8_text(source) {
                    let name = text.trim().to_string();
                    if !name.is_empty() {
                        return Some(name);
                    }
                }
            }
        }
        None
    }

    fn extract_signature(node: &Node, source: &[u8], ext: &str) -> String {
        let text = node.utf8_text(source).unwrap_or("");
        let first_line = text.lines().next().unwrap_or("").trim();
        let sig = if ext == "py" || ext == "pyi" {
            match first_line.find(':') {
                Some(colon) => &first_line[..=colon],
                None => first_line,
            }
        } else {
            match first_line.find('{') {
                Some(brace) => first_line[..brace].trim_end(),
                None => first_line,
            }
        };
        if sig.len() > 200 {
            format!("{}...", &sig[..sig.floor_char_boundary(200)])
        } else {
            sig.to_string()
        }
    }

    fn walk_node(node: &Node, source: &[u8], ext: &str, inside: bool, out: &mut Vec<OutlineSymbol>) {
        if let Some(kind) = classify_node(node.kind()) {
            let name = extract_name(node, source).unwrap_or_default();
            // Functions nested inside a class/impl are methods.
            let kind = if inside && kind == SymbolKind::Function && ext != "go" {
                SymbolKind::Method
            } else {
                kind
            };
            if !name.is_empty() {
                out.push(OutlineSymbol {
                    name,
                    kind,
                    start_line: node.start_position().row as u32 + 1,
                    end_line: node.end_position().row as u32 + 1,
                    signature: extract_signature(node, source, ext),
                });
            }
            let nested = inside || kind == SymbolKind::Class;
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                walk_node(&child, source, ext, nested, out);
            }
        } else {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                walk_node(&child, source, ext, inside, out);
            }
        }
    }

    /// Parse a file's content into symbols. None means no parser for this
    /// language or a parse failure.
    pub fn parse(content: &str, ext: &str) -> Option<Vec<OutlineSymbol>> {
        let lang = language_for_ext(ext)?;
        let mut parser = Parser::new();
        parser.set_language(&lang).ok()?;
        let tree = parser.parse(content, None)?;

        let mut symbols = Vec::new();
        let source = content.as_bytes();
        let root = tree.root_node();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            walk_node(&child, source, ext, false, &mut symbols);
        }
        Some(symbols)
    }
}

// ---------------------------------------------------------------------------
// Framework pattern set
// ---------------------------------------------------------------------------

struct FrameworkPatterns {
    route: Regex,
    js_test: Regex,
    py_test: Regex,
    listener: Regex,
}

fn patterns() -> &'static FrameworkPatterns {
    static PATTERNS: OnceLock<FrameworkPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| FrameworkPatterns {
        route: Regex::new(
            r#"(?:@(?:app|router|blueprint|api)|\b(?:app|router))\.(get|post|put|delete|patch|route)\(\s*['"]([^'"]+)"#,
        )
        .unwrap(),
        js_test: Regex::new(r#"(?:^|\s)(it|test|describe)\(\s*['"]([^'"]+)"#).unwrap(),
        py_test: Regex::new(r"^\s*def\s+(test_\w+)").unwrap(),
        listener: Regex::new(r#"(?:addEventListener|\.on)\(\s*['"]([\w:.-]+)"#).unwrap(),
    })
}

/// Scan content line-by-line for framework call sites, emitting synthetic
/// symbols like `"GET /users"` or `"it: logs in"`.
fn framework_symbols(content: &str) -> Vec<OutlineSymbol> {
    let p = patterns();
    let mut symbols = Vec::new();
    let mut prev_was_test_attr = false;

    for (i, line) in content.lines().enumerate() {
        let line_no = i as u32 + 1;

        if let Some(cap) = p.route.captures(line) {
            let method = cap[1].to_uppercase();
            let name = format!("{method} {}", &cap[2]);
            symbols.push(OutlineSymbol {
                name,
                kind: SymbolKind::Route,
                start_line: line_no,
                end_line: line_no,
                signature: line.trim().to_string(),
            });
        }

        if let Some(cap) = p.js_test.captures(line) {
            symbols.push(OutlineSymbol {
                name: format!("{}: {}", &cap[1], &cap[2]),
                kind: SymbolKind::Test,
                start_line: line_no,
                end_line: line_no,
                signature: line.trim().to_string(),
            });
        } else if let Some(cap) = p.py_test.captures(line) {
            symbols.push(OutlineSymbol {
                name: format!("test: {}", &cap[1]),
                kind: SymbolKind::Test,
                start_line: line_no,
                end_line: line_no,
                signature: line.trim().to_string(),
            });
        } else if prev_was_test_attr {
            if let Some(name) = line.trim().strip_prefix("fn ").and_then(|rest| {
                rest.split(|c: char| c == '(' || c.is_whitespace()).next()
            }) {
                symbols.push(OutlineSymbol {
                    name: format!("test: {name}"),
                    kind: SymbolKind::Test,
                    start_line: line_no,
                    end_line: line_no,
                    signature: line.trim().to_string(),
                });
            }
        }

        if let Some(cap) = p.listener.captures(line) {
            symbols.push(OutlineSymbol {
                name: format!("on: {}", &cap[1]),
                kind: SymbolKind::Route,
                start_line: line_no,
                end_line: line_no,
                signature: line.trim().to_string(),
            });
        }

        prev_was_test_attr = line.trim() == "#[test]" || line.trim() == "#[tokio::test]";
    }
    symbols
}

// ---------------------------------------------------------------------------
// Public entry
// ---------------------------------------------------------------------------

/// Outline a file's content. Node-type extraction plus the framework pattern
/// set when a parser exists for the language; empty otherwise.
pub fn outline_file(content: &str, ext: &str) -> Vec<OutlineSymbol> {
    #[cfg(feature = "treesitter")]
    {
        match ts::parse(content, ext) {
            Some(mut symbols) => {
                symbols.extend(framework_symbols(content));
                symbols.sort_by_key(|s| (s.start_line, s.end_line));
                symbols
            }
            None => Vec::new(),
        }
    }
    #[cfg(not(feature = "treesitter"))]
    {
        let _ = (content, ext);
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Agent-supplied symbol enrichment
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FileEnrichment {
    /// symbol -> tag -> times supplied
    symbols: HashMap<String, HashMap<String, u32>>,
    last_ts: u64,
}

#[derive(Clone, Serialize)]
pub struct EnrichedSymbol {
    pub symbol: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<HashMap<String, u32>>,
}

/// Stores agent-supplied tags on outline symbols, deduplicated with counts.
#[derive(Default)]
pub struct EnrichmentStore {
    files: DashMap<(String, String), FileEnrichment>,
}

impl EnrichmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record tags for symbols of one file. Repeated tags bump their count.
    pub fn add(&self, project: &str, file: &str, entries: &[(String, Vec<String>)]) {
        let mut enrichment = self
            .files
            .entry((project.to_string(), file.to_string()))
            .or_default();
        for (symbol, tags) in entries {
            let slot = enrichment.symbols.entry(symbol.clone()).or_default();
            for tag in tags {
                let tag = crate::intent::canonical_tag(tag);
                if !tag.is_empty() {
                    *slot.entry(tag).or_insert(0) += 1;
                }
            }
        }
        enrichment.last_ts = now_unix();
    }

    pub fn tags_for(&self, project: &str, file: &str, with_counts: bool) -> Vec<EnrichedSymbol> {
        let Some(enrichment) = self.files.get(&(project.to_string(), file.to_string())) else {
            return Vec::new();
        };
        let mut result: Vec<EnrichedSymbol> = enrichment
            .symbols
            .iter()
            .map(|(symbol, tags)| {
                let mut tag_names: Vec<String> = tags.keys().cloned().collect();
                tag_names.sort();
                EnrichedSymbol {
                    symbol: symbol.clone(),
                    tags: tag_names,
                    counts: with_counts.then(|| tags.clone()),
                }
            })
            .collect();
        result.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        result
    }

    /// Last enrichment timestamp per file, for the pending-files query.
    pub fn last_enriched(&self, project: &str, file: &str) -> Option<u64> {
        self.files
            .get(&(project.to_string(), file.to_string()))
            .map(|e| e.last_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "treesitter")]
    #[test]
    fn outlines_rust_symbols() {
        let src = r#"
pub fn fetch(url: &str) -> String {
    String::new()
}

struct Client {
    base: String,
}

impl Client {
    fn request(&self) -> bool {
        true
    }
}
"#;
        let symbols = outline_file(src, "rs");
        assert!(symbols.iter().any(|s| s.name == "fetch" && s.kind == SymbolKind::Function));
        assert!(symbols.iter().any(|s| s.name == "Client" && s.kind == SymbolKind::Class));
        assert!(symbols.iter().any(|s| s.name == "request" && s.kind == SymbolKind::Method));

        let fetch = symbols.iter().find(|s| s.name == "fetch").unwrap();
        assert_eq!(fetch.start_line, 2);
        assert_eq!(fetch.end_line, 4);
        assert!(fetch.signature.contains("pub fn fetch"));
        assert!(!fetch.signature.contains('{'));
    }

    #[cfg(feature = "treesitter")]
    #[test]
    fn outlines_python_routes_and_tests() {
        let src = r#"
@app.route("/users")
def list_users():
    return []

def test_list_users():
    assert list_users() == []
"#;
        let symbols = outline_file(src, "py");
        assert!(symbols.iter().any(|s| s.name == "ROUTE /users" && s.kind == SymbolKind::Route));
        assert!(symbols
            .iter()
            .any(|s| s.name == "test: test_list_users" && s.kind == SymbolKind::Test));
        assert!(symbols.iter().any(|s| s.name == "list_users" && s.kind == SymbolKind::Function));
    }

    #[test]
    fn unsupported_language_is_empty() {
        assert!(outline_file("# just a readme", "md").is_empty());
        assert!(outline_file("key = value", "toml").is_empty());
    }

    #[test]
    fn framework_patterns_find_js_tests_and_listeners() {
        let src = r#"
it('logs in with valid credentials', () => {});
button.addEventListener('click', handler);
router.get('/health', handler);
"#;
        let symbols = framework_symbols(src);
        assert!(symbols.iter().any(|s| s.name == "it: logs in with valid credentials"));
        assert!(symbols.iter().any(|s| s.name == "on: click"));
        assert!(symbols.iter().any(|s| s.name == "GET /health"));
    }

    #[test]
    fn enrichment_dedupes_with_counts() {
        let store = EnrichmentStore::new();
        store.add("p", "src/auth.rs", &[("login".to_string(), vec!["#auth".to_string()])]);
        store.add(
            "p",
            "src/auth.rs",
            &[("login".to_string(), vec!["auth".to_string(), "session".to_string()])],
        );

        let plain = store.tags_for("p", "src/auth.rs", false);
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].tags, vec!["auth", "session"]);
        assert!(plain[0].counts.is_none());

        let counted = store.tags_for("p", "src/auth.rs", true);
        let counts = counted[0].counts.as_ref().unwrap();
        assert_eq!(counts["auth"], 2);
        assert_eq!(counts["session"], 1);

        assert!(store.last_enriched("p", "src/auth.rs").is_some());
        assert!(store.last_enriched("p", "other.rs").is_none());
    }
}
