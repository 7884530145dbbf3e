//! Per-language behavior behind a single strategy trait.
//!
//! Each language contributes its file extensions and an import detector.
//! Adding a language means adding a strategy here, not editing the index.

use regex::Regex;
use std::sync::OnceLock;

/// Language-specific behavior used by the index.
pub trait LanguageStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extensions(&self) -> &'static [&'static str];
    /// Extract raw import target strings from file content. Resolution to
    /// indexed files happens in the index, not here.
    fn detect_imports(&self, content: &str) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

struct RustLang {
    import_re: Regex,
}

impl LanguageStrategy for RustLang {
    fn name(&self) -> &'static str {
        "rust"
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }
    fn detect_imports(&self, content: &str) -> Vec<String> {
        self.import_re
            .captures_iter(content)
            .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

struct PythonLang {
    import_re: Regex,
}

impl LanguageStrategy for PythonLang {
    fn name(&self) -> &'static str {
        "python"
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }
    fn detect_imports(&self, content: &str) -> Vec<String> {
        self.import_re
            .captures_iter(content)
            .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

struct TypeScriptLang {
    import_re: Regex,
}

impl LanguageStrategy for TypeScriptLang {
    fn name(&self) -> &'static str {
        "typescript"
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx"]
    }
    fn detect_imports(&self, content: &str) -> Vec<String> {
        js_style_imports(&self.import_re, content)
    }
}

struct JavaScriptLang {
    import_re: Regex,
}

impl LanguageStrategy for JavaScriptLang {
    fn name(&self) -> &'static str {
        "javascript"
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["js", "jsx", "mjs", "cjs"]
    }
    fn detect_imports(&self, content: &str) -> Vec<String> {
        js_style_imports(&self.import_re, content)
    }
}

struct GoLang {
    import_re: Regex,
}

impl LanguageStrategy for GoLang {
    fn name(&self) -> &'static str {
        "go"
    }
    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }
    fn detect_imports(&self, content: &str) -> Vec<String> {
        self.import_re
            .captures_iter(content)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

fn js_style_imports(re: &Regex, content: &str) -> Vec<String> {
    re.captures_iter(content)
        .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

fn registry() -> &'static [Box<dyn LanguageStrategy>] {
    static REGISTRY: OnceLock<Vec<Box<dyn LanguageStrategy>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![
            Box::new(RustLang {
                import_re: Regex::new(r"(?:use\s+(?:crate|super|self)::(\w+)|\bmod\s+(\w+)\s*;)")
                    .unwrap(),
            }),
            Box::new(PythonLang {
                import_re: Regex::new(r"(?m)(?:^from\s+([\w.]+)\s+import|^import\s+([\w.]+))")
                    .unwrap(),
            }),
            Box::new(TypeScriptLang {
                import_re: Regex::new(
                    r#"(?:from\s+['"]([^'"]+)['"]|require\s*\(\s*['"]([^'"]+)['"]\s*\))"#,
                )
                .unwrap(),
            }),
            Box::new(JavaScriptLang {
                import_re: Regex::new(
                    r#"(?:from\s+['"]([^'"]+)['"]|require\s*\(\s*['"]([^'"]+)['"]\s*\))"#,
                )
                .unwrap(),
            }),
            Box::new(GoLang {
                import_re: Regex::new(r#"import\s+(?:\(\s*)?"([^"]+)""#).unwrap(),
            }),
        ]
    })
}

/// Resolve the strategy for a file extension. None means the file is not
/// eligible for indexing.
pub fn language_for_ext(ext: &str) -> Option<&'static dyn LanguageStrategy> {
    registry().iter().find(|s| s.extensions().contains(&ext)).map(|b| b.as_ref())
}

/// Extensions that indicate binary or otherwise unsnippetable content.
pub fn is_binary_ext(ext: &str) -> bool {
    matches!(
        ext,
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "ico" | "pdf" | "zip" | "tar" | "gz"
            | "zst" | "exe" | "dll" | "so" | "dylib" | "bin" | "wasm" | "woff" | "woff2"
            | "ttf" | "otf" | "mp3" | "mp4" | "sqlite" | "db"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_resolution() {
        assert_eq!(language_for_ext("rs").map(|l| l.name()), Some("rust"));
        assert_eq!(language_for_ext("py").map(|l| l.name()), Some("python"));
        assert_eq!(language_for_ext("tsx").map(|l| l.name()), Some("typescript"));
        assert_eq!(language_for_ext("mjs").map(|l| l.name()), Some("javascript"));
        assert!(language_for_ext("exe").is_none());
        assert!(language_for_ext("").is_none());
    }

    #[test]
    fn python_imports() {
        let lang = language_for_ext("py").unwrap();
        let imports = lang.detect_imports("from auth.session import login\nimport helpers\n");
        assert!(imports.contains(&"auth.session".to_string()));
        assert!(imports.contains(&"helpers".to_string()));
    }

    #[test]
    fn typescript_imports() {
        let lang = language_for_ext("ts").unwrap();
        let imports = lang.detect_imports(
            "import { login } from './auth'\nconst x = require('../config')\n",
        );
        assert_eq!(imports, vec!["./auth".to_string(), "../config".to_string()]);
    }

    #[test]
    fn rust_imports() {
        let lang = language_for_ext("rs").unwrap();
        let imports = lang.detect_imports("use crate::scorer::Scorer;\nmod watch;\n");
        assert!(imports.contains(&"scorer".to_string()));
        assert!(imports.contains(&"watch".to_string()));
    }

    #[test]
    fn binary_extensions() {
        assert!(is_binary_ext("png"));
        assert!(is_binary_ext("wasm"));
        assert!(!is_binary_ext("rs"));
    }
}
