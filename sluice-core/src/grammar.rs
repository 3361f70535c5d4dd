//! Structured output grammar
//!
//! The target shape every StructuredText session must satisfy once its
//! deltas are concatenated:
//!
//! ```text
//! [<preamble>...</preamble>]
//! <thinking>
//!   <phase id="1"><title>...</title>...</phase>
//!   <phase id="2">...</phase>
//! </thinking>
//! <final>...<!--serp_queries:["q1","q2"]--></final>
//! ```
//!
//! Only the fixed keyword set may appear as tag-like substrings; anything
//! else is plain text. The checker here is the test oracle for the
//! sanitizer; the sanitizer itself never calls it.

/// Grammar keyword set. Tag names outside this set are plain text and get
/// escaped by the sanitizer.
pub const KEYWORDS: &[&str] = &["preamble", "thinking", "phase", "title", "final"];

/// Opening literal of the machine-readable query trailer.
pub const SERP_OPEN: &str = "<!--serp_queries:";
pub const SERP_CLOSE: &str = "-->";

/// Maximum entries in the query trailer after deduplication.
pub const MAX_SERP_QUERIES: usize = 5;

/// Reserved internal error marker. Upstream text is never allowed to carry
/// it verbatim; the sanitizer escapes any occurrence.
pub const INTERNAL_ERROR_MARKER: &str = "<|gateway_error|>";

/// Whether `doc` satisfies the structured output grammar.
pub fn is_well_formed(doc: &str) -> bool {
    let doc = doc.trim();
    let mut rest = doc;

    // Optional preamble, strictly before the thinking region.
    if let Some(after_open) = rest.strip_prefix("<preamble>") {
        let Some(close) = after_open.find("</preamble>") else {
            return false;
        };
        rest = &after_open[close + "</preamble>".len()..];
    }

    let rest = rest.trim_start();
    let Some(think_body_start) = rest.strip_prefix("<thinking>") else {
        return false;
    };
    let Some(think_close) = think_body_start.find("</thinking>") else {
        return false;
    };
    let think_body = &think_body_start[..think_close];
    let after_thinking = &think_body_start[think_close + "</thinking>".len()..];

    if !phases_well_formed(think_body) {
        return false;
    }

    // Nothing but whitespace between the regions.
    let after_thinking = after_thinking.trim_start();
    let Some(final_body_start) = after_thinking.strip_prefix("<final>") else {
        return false;
    };
    let Some(final_close) = final_body_start.find("</final>") else {
        return false;
    };
    let final_body = &final_body_start[..final_close];
    let trailer = &final_body_start[final_close + "</final>".len()..];
    if !trailer.trim().is_empty() {
        return false;
    }

    if !final_trailer_well_formed(final_body) {
        return false;
    }

    // Exactly one of each region marker in the whole document.
    for marker in ["<thinking>", "</thinking>", "<final>", "</final>"] {
        if doc.matches(marker).count() != 1 {
            return false;
        }
    }

    only_keyword_tags(doc)
}

fn phases_well_formed(body: &str) -> bool {
    let mut expected = 1u32;
    let mut rest = body;
    while let Some(start) = rest.find("<phase id=\"") {
        let after = &rest[start + "<phase id=\"".len()..];
        let Some(id_end) = after.find("\">") else {
            return false;
        };
        let Ok(id) = after[..id_end].parse::<u32>() else {
            return false;
        };
        if id != expected {
            return false;
        }
        let phase_body_start = &after[id_end + 2..];
        let Some(close) = phase_body_start.find("</phase>") else {
            return false;
        };
        let phase_body = &phase_body_start[..close];
        if phase_body.contains("<phase id=\"") {
            return false; // nesting
        }
        if phase_body.matches("<title>").count() != 1
            || phase_body.matches("</title>").count() != 1
        {
            return false;
        }
        expected += 1;
        rest = &phase_body_start[close + "</phase>".len()..];
    }
    true
}

fn final_trailer_well_formed(final_body: &str) -> bool {
    let trimmed = final_body.trim_end();
    let Some(open) = trimmed.rfind(SERP_OPEN) else {
        return false;
    };
    let tail = &trimmed[open + SERP_OPEN.len()..];
    let Some(json_end) = tail.rfind(SERP_CLOSE) else {
        return false;
    };
    if !tail[json_end + SERP_CLOSE.len()..].is_empty() {
        return false;
    }
    let Ok(serde_json::Value::Array(items)) =
        serde_json::from_str::<serde_json::Value>(&tail[..json_end])
    else {
        return false;
    };
    if items.len() > MAX_SERP_QUERIES {
        return false;
    }
    let mut seen = std::collections::HashSet::new();
    for item in &items {
        let Some(s) = item.as_str() else { return false };
        if !seen.insert(s) {
            return false;
        }
    }
    true
}

/// Scan for tag-like substrings whose name is not a grammar keyword.
/// Comments (`<!`…) are not tags.
fn only_keyword_tags(doc: &str) -> bool {
    let bytes = doc.as_bytes();
    let mut i = 0;
    while let Some(off) = doc[i..].find('<') {
        let start = i + off;
        let mut j = start + 1;
        if j < bytes.len() && bytes[j] == b'!' {
            i = start + 1;
            continue;
        }
        if j < bytes.len() && bytes[j] == b'/' {
            j += 1;
        }
        let name_start = j;
        while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
            j += 1;
        }
        if j == name_start {
            i = start + 1;
            continue; // `<` followed by non-name, plain text
        }
        // Tag-like only if the name is terminated by `>` or attributes.
        let Some(close) = doc[j..].find('>') else {
            i = start + 1;
            continue;
        };
        if doc[j..j + close].contains('<') {
            i = start + 1;
            continue;
        }
        let name = doc[name_start..j].to_ascii_lowercase();
        if !KEYWORDS.contains(&name.as_str()) {
            return false;
        }
        i = j + close + 1;
    }
    true
}

/// Normalize the query trailer of an assembled document: parse, deduplicate
/// and cap an existing trailer, or insert an empty one before `</final>`
/// when the upstream never produced it.
pub fn finalize_document(doc: &str) -> String {
    let Some(final_close) = doc.rfind("</final>") else {
        return doc.to_string();
    };
    let body = &doc[..final_close];

    if let Some(open) = body.rfind(SERP_OPEN) {
        let tail = &body[open + SERP_OPEN.len()..];
        if let Some(json_end) = tail.find(SERP_CLOSE) {
            let normalized = normalize_queries(&tail[..json_end]);
            let mut out = String::with_capacity(doc.len());
            out.push_str(&body[..open]);
            out.push_str(SERP_OPEN);
            out.push_str(&normalized);
            out.push_str(SERP_CLOSE);
            out.push_str(&tail[json_end + SERP_CLOSE.len()..]);
            out.push_str(&doc[final_close..]);
            return out;
        }
    }

    let mut out = String::with_capacity(doc.len() + 24);
    out.push_str(body);
    out.push_str(SERP_OPEN);
    out.push_str("[]");
    out.push_str(SERP_CLOSE);
    out.push_str(&doc[final_close..]);
    out
}

fn normalize_queries(json: &str) -> String {
    let items = match serde_json::from_str::<serde_json::Value>(json) {
        Ok(serde_json::Value::Array(items)) => items,
        _ => return "[]".to_string(),
    };
    let mut seen = std::collections::HashSet::new();
    let mut queries = Vec::new();
    for item in items {
        if let Some(s) = item.as_str() {
            if seen.insert(s.to_string()) {
                queries.push(serde_json::Value::String(s.to_string()));
            }
        }
        if queries.len() == MAX_SERP_QUERIES {
            break;
        }
    }
    serde_json::Value::Array(queries).to_string()
}
