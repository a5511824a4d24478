//! JSON extraction utilities for parsing completion responses.
//!
//! Responses may wrap the JSON object in markdown code blocks or surround it
//! with explanatory prose. The extraction tries, in order:
//! 1. Direct JSON (content starts with '{')
//! 2. JSON in a ```json code block
//! 3. The first balanced `{...}` span anywhere in the content
//!
//! # Example
//!
//! ```
//! use stage_forge::utils::json_extraction::extract_json_object;
//!
//! let response = "Verdict follows: {\"is_valid\": true} -- end";
//! assert_eq!(extract_json_object(response).as_deref(), Some("{\"is_valid\": true}"));
//! ```

use regex::Regex;
use std::sync::LazyLock;

static JSON_CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").expect("Invalid regex: JSON_CODE_BLOCK")
});

/// Extract the first JSON object from a response, if any.
pub fn extract_json_object(content: &str) -> Option<String> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return Some(trimmed[..=end].to_string());
        }
    }

    if let Some(caps) = JSON_CODE_BLOCK.captures(trimmed) {
        let block = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if let Some(start) = block.find('{') {
            if let Some(end) = find_matching_brace(&block[start..]) {
                return Some(block[start..=start + end].to_string());
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = find_matching_brace(&trimmed[start..])?;
    Some(trimmed[start..=start + end].to_string())
}

/// Find the index of the brace closing the object that opens at the start of `s`.
///
/// String literals and escape sequences are skipped so braces inside JSON
/// strings do not affect the depth count.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}
