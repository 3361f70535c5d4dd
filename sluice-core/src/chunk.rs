//! Outbound fragment re-splitting
//!
//! Upstreams chunk however they like; the broker re-fragments anything
//! oversized so no single outbound frame is unbounded. Cuts prefer natural
//! boundaries (newline, sentence end, whitespace) in the back half of the
//! fragment and fall back to a hard cut. Concatenating the fragments always
//! reproduces the input exactly.

/// Default per-fragment character budget shared by structured-text and
/// raw-passthrough increments.
pub const DEFAULT_CHUNK_MAX_CHARS: usize = 1800;

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Split `text` into fragments of at most `max_chars` characters.
///
/// A `max_chars` of 0 disables splitting.
pub fn split_chunk(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut fragments = Vec::new();
    let mut start = 0;

    while chars.len() - start > max_chars {
        let window = &chars[start..start + max_chars];
        let cut = boundary_cut(window, max_chars).unwrap_or(max_chars);
        fragments.push(chars[start..start + cut].iter().collect());
        start += cut;
    }
    fragments.push(chars[start..].iter().collect());
    fragments
}

/// Find a preferred cut position in `window`, searching only the back half.
/// The cut falls after the boundary character so it stays with the leading
/// fragment. Returns `None` when the window is one boundary-free run.
fn boundary_cut(window: &[char], max_chars: usize) -> Option<usize> {
    let floor = max_chars / 2;
    let last_matching = |pred: fn(char) -> bool| {
        window
            .iter()
            .rposition(|&c| pred(c))
            .filter(|&i| i >= floor)
            .map(|i| i + 1)
    };

    last_matching(|c| c == '\n')
        .or_else(|| last_matching(|c| SENTENCE_ENDS.contains(&c)))
        .or_else(|| last_matching(char::is_whitespace))
}
