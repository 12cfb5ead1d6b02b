//! FTS5 match-expression helpers.
//!
//! FTS5 treats bare `-`, `:`, `*` and unbalanced quotes as syntax, so a
//! plain-text query cannot be passed to MATCH verbatim. When the CJK
//! tokenizer extension is loaded its `simple_query()` SQL function does this
//! conversion engine-side; this module is the fallback for the built-in
//! tokenizers.

/// Convert plain text into a safe FTS5 match expression.
///
/// Each whitespace-separated token is stripped of embedded double quotes and
/// emitted as a quoted phrase; tokens are joined with implicit AND. Returns
/// `None` when nothing searchable remains.
pub fn sanitize_match_query(query: &str) -> Option<String> {
    let mut tokens = Vec::new();
    for raw in query.split_whitespace() {
        let cleaned: String = raw.chars().filter(|c| *c != '"').collect();
        if !cleaned.is_empty() {
            tokens.push(format!("\"{cleaned}\""));
        }
    }
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_each_token() {
        assert_eq!(
            sanitize_match_query("hello world").as_deref(),
            Some("\"hello\" \"world\"")
        );
    }

    #[test]
    fn strips_embedded_quotes() {
        assert_eq!(
            sanitize_match_query("say \"hi\" now").as_deref(),
            Some("\"say\" \"hi\" \"now\"")
        );
    }

    #[test]
    fn neutralizes_operators() {
        // would otherwise parse as column filter / NOT / prefix syntax
        assert_eq!(
            sanitize_match_query("col:x -neg pre*").as_deref(),
            Some("\"col:x\" \"-neg\" \"pre*\"")
        );
    }

    #[test]
    fn keeps_cjk_text() {
        assert_eq!(sanitize_match_query("你好 世界").as_deref(), Some("\"你好\" \"世界\""));
    }

    #[test]
    fn empty_input_yields_none() {
        assert_eq!(sanitize_match_query(""), None);
        assert_eq!(sanitize_match_query("   "), None);
        assert_eq!(sanitize_match_query("\"\""), None);
    }
}
