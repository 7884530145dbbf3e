//! Snippet extraction for predicted files.
//!
//! Prefers the body of the outline symbol that best matches the query
//! keywords; falls back to the head of the file. Binary-like extensions are
//! skipped entirely. A file deleted between ranking and snippet read yields
//! no snippet but the file stays listed.

use std::fs;
use std::path::Path;

use crate::language;
use crate::outline::{self, OutlineSymbol};
use crate::types::SymbolKind;

const MAX_LINE_LEN: usize = 200;

/// How well a symbol name matches a keyword: exact beats substring beats
/// reverse-substring. Ties lean toward functions, classes, and methods.
fn match_level(symbol: &OutlineSymbol, keywords: &[String]) -> u32 {
    let name_lower = symbol.name.to_lowercase();
    let mut best = 0;
    for keyword in keywords {
        let level = if name_lower == *keyword {
            3
        } else if name_lower.contains(keyword.as_str()) {
            2
        } else if keyword.contains(&name_lower) {
            1
        } else {
            0
        };
        best = best.max(level);
    }
    best
}

fn kind_preference(kind: SymbolKind) -> u32 {
    match kind {
        SymbolKind::Function | SymbolKind::Class | SymbolKind::Method => 1,
        _ => 0,
    }
}

fn comment_prefix(ext: &str) -> &'static str {
    match ext {
        "py" | "pyi" | "sh" => "#",
        _ => "//",
    }
}

/// Extract a snippet for `rel_path` under `root`, bounded to `line_budget`
/// lines. Keywords must already be lowercased.
pub fn extract(
    root: &Path,
    rel_path: &str,
    keywords: &[String],
    line_budget: usize,
) -> Option<String> {
    let ext = rel_path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    if language::is_binary_ext(ext) {
        return None;
    }

    let abs = root.join(rel_path);
    let bytes = fs::read(&abs).ok()?;
    let content = String::from_utf8_lossy(&bytes);
    let budget = line_budget.max(1);

    // Smart path: best-matching outline symbol's body with a header line.
    if !keywords.is_empty() {
        let symbols = outline::outline_file(&content, ext);
        let best = symbols
            .iter()
            .filter(|s| match_level(s, keywords) > 0)
            .max_by_key(|s| {
                (match_level(s, keywords), kind_preference(s.kind), std::cmp::Reverse(s.start_line))
            });
        if let Some(symbol) = best {
            let start = symbol.start_line.saturating_sub(1) as usize;
            let end = (symbol.end_line as usize).min(start + budget);
            let body: Vec<&str> = content.lines().skip(start).take(end - start).collect();
            if !body.is_empty() {
                let header = format!(
                    "{} {} {} (lines {}-{})",
                    comment_prefix(ext),
                    symbol.kind.label(),
                    symbol.name,
                    symbol.start_line,
                    symbol.end_line,
                );
                return Some(format!("{header}\n{}", body.join("\n")));
            }
        }
    }

    // Fallback: head of file with long-line truncation.
    let head: Vec<String> = content
        .lines()
        .take(budget)
        .map(|line| {
            if line.len() > MAX_LINE_LEN {
                format!("{}...", &line[..line.floor_char_boundary(MAX_LINE_LEN)])
            } else {
                line.to_string()
            }
        })
        .collect();
    if head.is_empty() {
        return Some(String::new());
    }
    Some(head.join("\n"))
}
