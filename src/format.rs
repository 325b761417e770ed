//! Result formatting: match highlighting, pagination, summaries.
//!
//! Highlighting is applied to string columns only. Cell text is HTML-escaped
//! first so angle brackets arriving in user data are inert, then matched
//! query tokens are wrapped in a configurable marker pair (`«…»` by
//! default). Tokenization splits on whitespace and on CJK script boundaries
//! so a Hangul name embedded in Latin text still matches.

use crate::models::{PageInfo, ResultSummary, Strategy};

#[derive(Debug, Clone)]
pub struct HighlightOptions {
    pub marker_open: String,
    pub marker_close: String,
    /// Cap on wrapped matches per field, to bound pathological rows.
    pub max_per_field: usize,
}

impl Default for HighlightOptions {
    fn default() -> Self {
        Self {
            marker_open: "«".to_string(),
            marker_close: "»".to_string(),
            max_per_field: 10,
        }
    }
}

/// Split a query into highlightable tokens: whitespace-separated chunks,
/// further split where the script changes between CJK and non-CJK. Tokens
/// shorter than two characters are dropped.
pub fn tokenize_query(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for chunk in query.split_whitespace() {
        let mut current = String::new();
        let mut current_cjk: Option<bool> = None;
        for ch in chunk.chars() {
            let cjk = is_cjk(ch);
            if current_cjk.is_some() && current_cjk != Some(cjk) {
                push_token(&mut tokens, &current);
                current.clear();
            }
            current_cjk = Some(cjk);
            current.push(ch);
        }
        push_token(&mut tokens, &current);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, token: &str) {
    let trimmed: String = token
        .chars()
        .filter(|c| c.is_alphanumeric() || is_cjk(*c))
        .collect();
    if trimmed.chars().count() >= 2 && !tokens.iter().any(|t| t == &trimmed) {
        tokens.push(trimmed);
    }
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{AC00}'..='\u{D7AF}'   // Hangul syllables
        | '\u{1100}'..='\u{11FF}' // Hangul jamo
        | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
        | '\u{3040}'..='\u{30FF}' // Hiragana + Katakana
    )
}

/// Escape text for safe embedding in HTML output.
pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

/// Highlight query tokens in every string column of every row. Non-string
/// values pass through untouched; string values are escaped even when
/// nothing matches, so output is uniformly HTML-safe.
pub fn highlight_rows(
    rows: &[serde_json::Map<String, serde_json::Value>],
    query: &str,
    options: &HighlightOptions,
) -> Vec<serde_json::Map<String, serde_json::Value>> {
    let tokens: Vec<String> = tokenize_query(query)
        .into_iter()
        .map(|t| html_escape(&t))
        .collect();

    rows.iter()
        .map(|row| {
            row.iter()
                .map(|(column, value)| {
                    let formatted = match value {
                        serde_json::Value::String(s) => serde_json::Value::String(
                            highlight_field(&html_escape(s), &tokens, options),
                        ),
                        other => other.clone(),
                    };
                    (column.clone(), formatted)
                })
                .collect()
        })
        .collect()
}

/// Wrap matches of any token in one escaped field. Match ranges are merged
/// before wrapping so overlapping tokens produce one marker pair.
fn highlight_field(escaped: &str, tokens: &[String], options: &HighlightOptions) -> String {
    // ASCII-only lowering keeps byte offsets aligned with the original text;
    // CJK has no case to fold anyway.
    let lower = escaped.to_ascii_lowercase();
    let mut ranges: Vec<(usize, usize)> = Vec::new();

    for token in tokens {
        let token_lower = token.to_ascii_lowercase();
        if token_lower.is_empty() {
            continue;
        }
        let mut start = 0;
        while let Some(idx) = lower[start..].find(&token_lower) {
            let abs = start + idx;
            ranges.push((abs, abs + token_lower.len()));
            start = abs + token_lower.len();
        }
    }

    if ranges.is_empty() {
        return escaped.to_string();
    }

    ranges.sort();
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (s, e) in ranges {
        match merged.last_mut() {
            Some(last) if s <= last.1 => last.1 = last.1.max(e),
            _ => merged.push((s, e)),
        }
    }
    merged.truncate(options.max_per_field);

    let mut out = String::with_capacity(escaped.len() + merged.len() * 4);
    let mut cursor = 0;
    for (s, e) in merged {
        out.push_str(&escaped[cursor..s]);
        out.push_str(&options.marker_open);
        out.push_str(&escaped[s..e]);
        out.push_str(&options.marker_close);
        cursor = e;
    }
    out.push_str(&escaped[cursor..]);
    out
}

/// Compute the pagination block for a slice of `total` rows.
pub fn paginate(total: i64, offset: i64, limit: i64) -> PageInfo {
    let limit = limit.max(1);
    let offset = offset.max(0);
    let pages = (total + limit - 1) / limit;
    PageInfo {
        offset,
        limit,
        total,
        page: offset / limit + 1,
        pages,
        has_next: offset + limit < total,
        has_prev: offset > 0,
    }
}

/// Build the compact result summary.
pub fn summarize(
    rows: &[serde_json::Map<String, serde_json::Value>],
    strategy: Strategy,
    execution_time_ms: f64,
) -> ResultSummary {
    ResultSummary {
        row_count: rows.len() as i64,
        columns: rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default(),
        strategy_used: strategy,
        execution_time_ms,
    }
}
