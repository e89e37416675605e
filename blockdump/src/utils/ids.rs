//! Page identifier normalization and filesystem-safe naming.

use crate::utils::errors::{EngineError, Result};
use regex::Regex;
use std::sync::OnceLock;

fn hex32() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9a-fA-F]{32}").expect("valid regex"))
}

fn uuid_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("valid regex")
    })
}

fn hyphenate(hex: &str) -> String {
    let h = hex.to_ascii_lowercase();
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

/// Normalize a page reference into the canonical 8-4-4-4-12 form.
///
/// Accepts a hyphenated id, a bare 32-hex id, or a share URL carrying the id
/// in its path or in a `p`/`pageId`/`page_id` query parameter.
pub fn normalize_page_id(input: &str) -> Result<String> {
    let s = input.trim();
    if s.is_empty() {
        return Err(EngineError::Validation("page id must not be empty".into()));
    }

    if uuid_like().is_match(s) {
        return Ok(s.to_ascii_lowercase());
    }

    if s.len() == 32 && hex32().is_match(s) {
        return Ok(hyphenate(s));
    }

    if let Some(rest) = ["https://", "http://", "notion://"]
        .iter()
        .find_map(|scheme| s.strip_prefix(scheme))
    {
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, q.split('#').next().unwrap_or("")),
            None => (rest.split('#').next().unwrap_or(rest), ""),
        };
        // Skip the host so a hex-looking domain never matches.
        let path = path.split_once('/').map(|(_, p)| p).unwrap_or("");
        let compact: String = path.chars().filter(|c| *c != '-').collect();
        if let Some(m) = hex32().find(path).or_else(|| hex32().find(&compact)) {
            return Ok(hyphenate(m.as_str()));
        }
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if matches!(key, "p" | "pageId" | "page_id")
                    && value.len() == 32
                    && hex32().is_match(value)
                {
                    return Ok(hyphenate(value));
                }
            }
        }
        return Err(EngineError::Validation(format!(
            "no 32-character page id found in URL: {s}"
        )));
    }

    Err(EngineError::Validation(format!(
        "not a valid page id or page URL: {s}"
    )))
}

/// Turn a page title into a directory-name fragment.
pub fn slugify(text: &str, default: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = false;
    for c in text.trim().chars() {
        if c.is_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let slug: String = out.chars().take(60).collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        default.to_string()
    } else {
        slug.to_string()
    }
}

/// Keep only characters that are safe inside a single path segment.
pub fn sanitize_segment(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}
