//! Best-effort extraction of the active ad count and page name from raw
//! ad-library markup.
//!
//! The target embeds its data as JSON, sometimes escaped inside script
//! strings, and the shape changes without notice. Each field is read with
//! an ordered cascade of patterns from most to least specific; the first
//! match wins. Nothing here fails: an unreadable field is `None`.

use std::sync::LazyLock;

use regex::Regex;

/// Count patterns, most specific first.
const COUNT_PATTERNS: &[&str] = &[
    // Escaped JSON inside a script string.
    r#"\\"search_results_connection\\"\s*:\s*\{\s*\\"count\\"\s*:\s*(\d[\d,]*)"#,
    r#"\\"(?:total_count|totalCount|ad_count)\\"\s*:\s*(\d[\d,]*)"#,
    // Plain JSON.
    r#""search_results_connection"\s*:\s*\{\s*"count"\s*:\s*(\d[\d,]*)"#,
    r#""(?:total_count|totalCount|ad_count)"\s*:\s*(\d[\d,]*)"#,
    // A bare count shortly after an ad/result keyword.
    r#"(?is)\b(?:ads?|results?)\b.{0,80}?"count"\s*:\s*(\d[\d,]*)"#,
    // Rendered text such as "~1,200 results".
    r"(?i)~?\s*(\d[\d,]*)\s+(?:results?|ads)\b",
];

// Escaped JSON values: `\"` terminates, `\\\"` is an inner quote.
const ESCAPED_NAME_PATTERN: &str =
    r#"\\"page_name\\"\s*:\s*\\"((?:[^"\\]|\\\\\\"|\\\\|\\[^"\\])*)\\""#;
const PLAIN_NAME_PATTERN: &str = r#""page_name"\s*:\s*"((?:[^"\\]|\\.)*)""#;

static COUNT_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    COUNT_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("static count pattern is valid"))
        .collect()
});

static ESCAPED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ESCAPED_NAME_PATTERN).expect("static name pattern is valid"));

static PLAIN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLAIN_NAME_PATTERN).expect("static name pattern is valid"));

/// Fields read from one page. Either may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub active_count: Option<u64>,
    pub display_name: Option<String>,
}

/// Run both cascades over `html`.
pub fn extract(html: &str, subject_id: &str) -> Extraction {
    Extraction {
        active_count: extract_active_count(html),
        display_name: extract_display_name(html, subject_id),
    }
}

/// First count found by the cascade.
pub fn extract_active_count(html: &str) -> Option<u64> {
    COUNT_REGEXES.iter().find_map(|re| {
        re.captures_iter(html)
            .find_map(|caps| caps.get(1).and_then(|m| parse_count(m.as_str())))
    })
}

/// First non-empty page name found by the cascade.
///
/// Falls back to a `"name"` field sitting right after an id equal to
/// `subject_id`.
pub fn extract_display_name(html: &str, subject_id: &str) -> Option<String> {
    let escaped = ESCAPED_NAME
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(&unescape(m.as_str())));
    if let Some(name) = non_empty(escaped) {
        return Some(name);
    }

    let plain = PLAIN_NAME
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(m.as_str()));
    if let Some(name) = non_empty(plain) {
        return Some(name);
    }

    let subject_id = subject_id.trim();
    if subject_id.is_empty() {
        return None;
    }
    let adjacent = Regex::new(&format!(
        r#"\\?"(?:page_id|id)\\?"\s*:\s*\\?"?{id}\\?"?\s*,\s*\\?"name\\?"\s*:\s*\\?"((?:[^"\\]|\\.)*?)\\?""#,
        id = regex::escape(subject_id)
    ))
    .ok()?;
    non_empty(
        adjacent
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|m| unescape(m.as_str())),
    )
}

fn parse_count(raw: &str) -> Option<u64> {
    raw.replace(',', "").parse().ok()
}

fn non_empty(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Undo one level of JSON string escaping.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => {
                let hex: String = chars.clone().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) if hex.len() == 4 => {
                        out.push(decoded);
                        chars.nth(3);
                    }
                    _ => out.push_str("\\u"),
                }
            }
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile() {
        assert_eq!(COUNT_REGEXES.len(), COUNT_PATTERNS.len());
        assert!(ESCAPED_NAME.is_match(r#"\"page_name\":\"x\""#));
        assert!(PLAIN_NAME.is_match(r#""page_name":"x""#));
    }

    #[test]
    fn reads_escaped_search_results_count() {
        let html = r#"<script>require("x", "{\"search_results_connection\":{\"count\":42,\"edges\":[]}}")</script>"#;
        assert_eq!(extract_active_count(html), Some(42));
    }

    #[test]
    fn reads_escaped_total_count() {
        let html = r#"<script>"{\"totalCount\":17}"</script>"#;
        assert_eq!(extract_active_count(html), Some(17));
    }

    #[test]
    fn reads_plain_nested_count() {
        let html = r#"{"ad_library_main":{"search_results_connection": {"count": 1205}}}"#;
        assert_eq!(extract_active_count(html), Some(1205));
    }

    #[test]
    fn reads_loose_count_near_keyword() {
        let html = r#"<div>Active ads</div><script>{"foo":1,"count":9}</script>"#;
        assert_eq!(extract_active_count(html), Some(9));
    }

    #[test]
    fn reads_rendered_result_text_with_separators() {
        let html = "<div role=\"heading\">~1,234 results</div>";
        assert_eq!(extract_active_count(html), Some(1234));
    }

    #[test]
    fn escaped_json_beats_loose_fallback() {
        let html = r#"<div>7 results</div><p>ads "count": 3</p><script>"{\"search_results_connection\":{\"count\":42}}"</script>"#;
        assert_eq!(extract_active_count(html), Some(42));
    }

    #[test]
    fn nested_form_beats_loose_fallback() {
        let html = r#"<div>5 ads</div>{"search_results_connection":{"count":80}}"#;
        assert_eq!(extract_active_count(html), Some(80));
    }

    #[test]
    fn missing_count_is_none() {
        assert_eq!(extract_active_count("<html><body>Log in</body></html>"), None);
        assert_eq!(extract_active_count(""), None);
    }

    #[test]
    fn zero_is_a_real_count() {
        let html = r#"{"search_results_connection":{"count":0}}"#;
        assert_eq!(extract_active_count(html), Some(0));
    }

    #[test]
    fn reads_escaped_page_name_with_inner_quotes_and_unicode() {
        let html = r#""{\"page_name\":\"Caf\\u00e9 \\\"Lux\\\"\",\"page_id\":\"1\"}""#;
        assert_eq!(
            extract_display_name(html, "1").as_deref(),
            Some("Café \"Lux\"")
        );
    }

    #[test]
    fn reads_plain_page_name() {
        let html = r#"{"page_name":"Acme \"Outlet\" \\ Co","page_id":"55"}"#;
        assert_eq!(
            extract_display_name(html, "55").as_deref(),
            Some("Acme \"Outlet\" \\ Co")
        );
    }

    #[test]
    fn falls_back_to_name_next_to_subject_id() {
        let html = r#"{"id":"98765","name":"Neighbour Shop"} {"id":"987","name":"Other"}"#;
        assert_eq!(
            extract_display_name(html, "98765").as_deref(),
            Some("Neighbour Shop")
        );
        assert_eq!(extract_display_name(html, "987").as_deref(), Some("Other"));
        assert_eq!(extract_display_name(html, "111"), None);
    }

    #[test]
    fn empty_name_falls_through() {
        let html = r#"{"page_name":"  ","page_id":"7","name":"Real Name"}"#;
        assert_eq!(extract_display_name(html, "7").as_deref(), Some("Real Name"));
    }

    #[test]
    fn extract_combines_both_cascades() {
        let html = r#"{"page_name":"Acme","search_results_connection":{"count":3}}"#;
        assert_eq!(
            extract(html, "1"),
            Extraction {
                active_count: Some(3),
                display_name: Some("Acme".into()),
            }
        );
        assert_eq!(extract("garbage", "1"), Extraction::default());
    }

    #[test]
    fn unescape_handles_escapes() {
        assert_eq!(unescape(r#"a\"b\\c\/d"#), r#"a"b\c/d"#);
        assert_eq!(unescape(r"A\u00"), "A\\u00");
        assert_eq!(unescape(r"end\"), "end\\");
    }
}
