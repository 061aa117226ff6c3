//! Attack-step extraction from Mermaid attack trees.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Pull the attack-step labels out of a Mermaid diagram.
///
/// Accepts either raw Mermaid source or Markdown containing a fenced
/// ```` ```mermaid ```` block. Each `["label"]` node contributes the text
/// before its first `<br>`; duplicates are dropped, first occurrence wins.
pub fn extract_attack_steps(source: &str) -> Vec<String> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```mermaid\n(.*?)\n```").expect("valid regex"));
    static NODE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"\["([^"]+)"\]"#).expect("valid regex"));
    static BREAK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<br/?>.*").expect("valid regex"));

    let mermaid = FENCE_RE
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(source);

    let mut seen = HashSet::new();
    let mut steps = Vec::new();
    for line in mermaid.lines() {
        for caps in NODE_RE.captures_iter(line) {
            let label = BREAK_RE.replace(&caps[1], "");
            let label = label.trim();
            if !label.is_empty() && seen.insert(label.to_string()) {
                steps.push(label.to_string());
            }
        }
    }
    steps
}
