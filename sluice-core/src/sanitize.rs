//! Streaming output sanitizer
//!
//! A per-session state machine that repairs a stream of text increments so
//! their concatenation satisfies the structured output grammar. It operates
//! strictly incrementally: no increment is held back longer than the length
//! of the longest recognized marker minus one character, via small pending
//! buffers that survive increment boundaries.
//!
//! The machine is pure (no I/O, no allocation beyond the output string), so
//! every transition is unit-testable against literal input/output pairs.
//! The broker owns one [`SanitizeState`] per session and is the only caller.

use crate::grammar::{INTERNAL_ERROR_MARKER, SERP_CLOSE, SERP_OPEN};

/// Placeholder title synthesized for a phase the upstream forgot to title.
pub const UNTITLED: &str = "Untitled";

/// Emitted-character budget during which the next region-close marker after
/// an escaped region-open is treated as part of the same illustrative
/// snippet. Swallowing one close ends the window early; a later close is
/// the real one again.
const LITERAL_WINDOW: usize = 160;

/// Upper bound on the unknown-tag pending buffer; anything longer cannot be
/// a sane tag and is flushed as plain text.
const MAX_TAG_PENDING: usize = 64;

const PHASE_OPEN_PREFIX: &str = "<phase id=\"";
const MAX_PHASE_DIGITS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    PreambleOpen,
    PreambleClose,
    ThinkingOpen,
    ThinkingClose,
    PhaseOpen,
    PhaseClose,
    TitleOpen,
    TitleClose,
    FinalOpen,
    FinalClose,
}

enum Classify {
    Match(Marker),
    Prefix,
    None,
}

const FIXED_MARKERS: &[(&str, Marker)] = &[
    ("<preamble>", Marker::PreambleOpen),
    ("</preamble>", Marker::PreambleClose),
    ("<thinking>", Marker::ThinkingOpen),
    ("</thinking>", Marker::ThinkingClose),
    ("</phase>", Marker::PhaseClose),
    ("<title>", Marker::TitleOpen),
    ("<Title>", Marker::TitleOpen),
    ("<TITLE>", Marker::TitleOpen),
    ("</title>", Marker::TitleClose),
    ("</Title>", Marker::TitleClose),
    ("</TITLE>", Marker::TitleClose),
    ("<final>", Marker::FinalOpen),
    ("</final>", Marker::FinalClose),
];

fn classify(s: &str) -> Classify {
    let mut prefix = false;
    for (lit, marker) in FIXED_MARKERS {
        if *lit == s {
            return Classify::Match(*marker);
        }
        if lit.starts_with(s) {
            prefix = true;
        }
    }
    match classify_phase_open(s) {
        Classify::Match(m) => return Classify::Match(m),
        Classify::Prefix => prefix = true,
        Classify::None => {}
    }
    if prefix {
        Classify::Prefix
    } else {
        Classify::None
    }
}

fn classify_phase_open(s: &str) -> Classify {
    if s.len() <= PHASE_OPEN_PREFIX.len() {
        return if PHASE_OPEN_PREFIX.starts_with(s) {
            Classify::Prefix
        } else {
            Classify::None
        };
    }
    let Some(rest) = s.strip_prefix(PHASE_OPEN_PREFIX) else {
        return Classify::None;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 || digits > MAX_PHASE_DIGITS {
        return Classify::None;
    }
    match &rest[digits..] {
        "" | "\"" => Classify::Prefix,
        "\">" => Classify::Match(Marker::PhaseOpen),
        _ => Classify::None,
    }
}

fn phase_id(lit: &str) -> Option<u32> {
    lit.strip_prefix(PHASE_OPEN_PREFIX)?
        .strip_suffix("\">")?
        .parse()
        .ok()
}

#[derive(Debug, Clone)]
enum FenceState {
    /// Still deciding whether the stream opens with a code fence; holds
    /// leading whitespace and backticks seen so far.
    Probing(String),
    /// Inside the fence line; dropping through the newline.
    Skipping,
    Done,
}

/// Sanitizer state, owned exclusively by one session and mutated only by the
/// broker on that session's events.
#[derive(Debug)]
pub struct SanitizeState {
    in_preamble: bool,
    preamble_seen: bool,
    in_thinking: bool,
    thinking_seen: bool,
    in_final: bool,
    final_seen: bool,
    /// Once the final-close marker is legitimately matched, all state
    /// freezes and every subsequent character is dropped.
    final_done: bool,
    /// Currently open phase id, already renumbered to the canonical value.
    phase: Option<u32>,
    last_phase: u32,
    title_open: bool,
    title_done: bool,
    serp_seen: bool,
    serp_probe: usize,
    /// Marker-prefix lookahead across increment boundaries.
    pending: String,
    literal_window: usize,
    fence: FenceState,
    err_pending: String,
    tag_pending: String,
}

impl Default for SanitizeState {
    fn default() -> Self {
        Self::new()
    }
}

impl SanitizeState {
    pub fn new() -> Self {
        Self {
            in_preamble: false,
            preamble_seen: false,
            in_thinking: false,
            thinking_seen: false,
            in_final: false,
            final_seen: false,
            final_done: false,
            phase: None,
            last_phase: 0,
            title_open: false,
            title_done: false,
            serp_seen: false,
            serp_probe: 0,
            pending: String::new(),
            literal_window: 0,
            fence: FenceState::Probing(String::new()),
            err_pending: String::new(),
            tag_pending: String::new(),
        }
    }

    /// Whether the grammar has been fully closed and the stream is frozen.
    pub fn is_frozen(&self) -> bool {
        self.final_done
    }

    fn emit(&mut self, s: &str, out: &mut String) {
        for c in s.chars() {
            out.push(c);
            if self.literal_window > 0 {
                self.literal_window -= 1;
            }
            if self.in_final && !self.serp_seen {
                self.serp_advance(c);
            }
        }
    }

    fn serp_advance(&mut self, c: char) {
        let expected = SERP_OPEN.as_bytes()[self.serp_probe] as char;
        if c == expected {
            self.serp_probe += 1;
            if self.serp_probe == SERP_OPEN.len() {
                self.serp_seen = true;
            }
        } else {
            self.serp_probe = usize::from(c == '<');
        }
    }

    fn escape(&mut self, lit: &str, out: &mut String) {
        let mut esc = String::with_capacity(lit.len() + 6);
        for c in lit.chars() {
            match c {
                '<' => esc.push_str("&lt;"),
                '>' => esc.push_str("&gt;"),
                other => esc.push(other),
            }
        }
        self.emit(&esc, out);
    }

    /// Escape an out-of-place region-open marker and open the literal
    /// window, so a close marker belonging to the same illustrative snippet
    /// is not taken for the real region close.
    fn escape_open(&mut self, lit: &str, out: &mut String) {
        self.escape(lit, out);
        self.literal_window = LITERAL_WINDOW;
    }

    /// Escape a suppressed region-close marker. The window has consumed the
    /// snippet's own close, so it ends here.
    fn escape_close(&mut self, lit: &str, out: &mut String) {
        self.literal_window = 0;
        self.escape(lit, out);
    }

    fn ensure_title_closed(&mut self, out: &mut String) {
        if self.title_open {
            self.emit("</title>", out);
            self.title_open = false;
            self.title_done = true;
        } else if !self.title_done {
            self.emit(&format!("<title>{UNTITLED}</title>"), out);
            self.title_done = true;
        }
    }

    fn close_open_phase(&mut self, out: &mut String) {
        if self.phase.is_some() {
            self.ensure_title_closed(out);
            self.emit("</phase>", out);
            self.phase = None;
        }
    }

    fn dispatch(&mut self, marker: Marker, lit: &str, out: &mut String) {
        match marker {
            Marker::PreambleOpen => {
                if !self.preamble_seen && !self.thinking_seen && !self.in_final {
                    self.in_preamble = true;
                    self.preamble_seen = true;
                    self.emit("<preamble>", out);
                } else {
                    self.escape_open(lit, out);
                }
            }
            Marker::PreambleClose => {
                if self.in_preamble {
                    self.in_preamble = false;
                    self.emit("</preamble>", out);
                } else {
                    self.escape(lit, out);
                }
            }
            Marker::ThinkingOpen => {
                if !self.thinking_seen && !self.in_final {
                    if self.in_preamble {
                        self.in_preamble = false;
                        self.emit("</preamble>", out);
                    }
                    self.in_thinking = true;
                    self.thinking_seen = true;
                    self.emit("<thinking>", out);
                } else {
                    self.escape_open(lit, out);
                }
            }
            Marker::ThinkingClose => {
                if self.in_thinking && self.literal_window == 0 {
                    self.close_open_phase(out);
                    self.in_thinking = false;
                    self.emit("</thinking>", out);
                } else {
                    self.escape_close(lit, out);
                }
            }
            Marker::PhaseOpen => {
                if self.in_thinking {
                    self.close_open_phase(out);
                    let id = self.last_phase + 1;
                    self.phase = Some(id);
                    self.last_phase = id;
                    self.title_open = false;
                    self.title_done = false;
                    self.emit(&format!("<phase id=\"{id}\">"), out);
                    if phase_id(lit) != Some(id) {
                        tracing::debug!(got = lit, expected = id, "renumbered phase marker");
                    }
                } else {
                    self.escape(lit, out);
                }
            }
            Marker::PhaseClose => {
                if self.phase.is_some() {
                    self.ensure_title_closed(out);
                    self.emit("</phase>", out);
                    self.phase = None;
                } else {
                    self.escape(lit, out);
                }
            }
            Marker::TitleOpen => {
                if self.phase.is_some() && !self.title_open && !self.title_done {
                    self.title_open = true;
                    self.emit("<title>", out);
                } else {
                    self.escape(lit, out);
                }
            }
            Marker::TitleClose => {
                if self.title_open {
                    self.title_open = false;
                    self.title_done = true;
                    self.emit("</title>", out);
                } else {
                    self.escape(lit, out);
                }
            }
            Marker::FinalOpen => {
                if self.thinking_seen && !self.final_seen {
                    if self.in_thinking {
                        self.close_open_phase(out);
                        self.in_thinking = false;
                        self.emit("</thinking>", out);
                    }
                    self.in_final = true;
                    self.final_seen = true;
                    self.emit("<final>", out);
                } else {
                    self.escape_open(lit, out);
                }
            }
            Marker::FinalClose => {
                if self.in_final && self.literal_window == 0 {
                    if !self.serp_seen {
                        self.emit(SERP_OPEN, out);
                        self.emit("[]", out);
                        self.emit(SERP_CLOSE, out);
                    }
                    self.in_final = false;
                    self.final_done = true;
                    self.emit("</final>", out);
                } else {
                    self.escape_close(lit, out);
                }
            }
        }
    }

    fn machine_feed(&mut self, c: char, out: &mut String) {
        if self.final_done {
            return;
        }
        self.pending.push(c);
        loop {
            match classify(&self.pending) {
                Classify::Match(marker) => {
                    let lit = std::mem::take(&mut self.pending);
                    self.dispatch(marker, &lit, out);
                    break;
                }
                Classify::Prefix => break,
                Classify::None => {
                    let first = self.pending.remove(0);
                    let mut buf = String::new();
                    buf.push(first);
                    self.emit(&buf, out);
                    if self.pending.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    /// Pass a character through the leading code-fence filter. Returns the
    /// characters to feed into the marker machine (possibly none while the
    /// filter is still deciding, possibly several when it gives up).
    fn fence_filter(&mut self, c: char) -> String {
        match &mut self.fence {
            FenceState::Done => c.to_string(),
            FenceState::Skipping => {
                if c == '\n' {
                    self.fence = FenceState::Done;
                }
                String::new()
            }
            FenceState::Probing(buf) => {
                let ticks = buf.chars().filter(|b| *b == '`').count();
                if c == '`' {
                    if ticks == 2 {
                        self.fence = FenceState::Skipping;
                    } else {
                        buf.push(c);
                    }
                    String::new()
                } else if c.is_whitespace() && ticks == 0 {
                    buf.push(c);
                    String::new()
                } else {
                    let mut held = std::mem::take(buf);
                    self.fence = FenceState::Done;
                    held.push(c);
                    held
                }
            }
        }
    }

    fn scan_error_marker(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            self.err_pending.push(c);
            while !INTERNAL_ERROR_MARKER.starts_with(self.err_pending.as_str()) {
                out.push(self.err_pending.remove(0));
            }
            if self.err_pending == INTERNAL_ERROR_MARKER {
                self.err_pending.clear();
                out.push_str("&lt;|gateway_error|&gt;");
            }
        }
        out
    }

    fn scan_unknown_tags(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            self.tag_feed(c, &mut out);
        }
        out
    }

    fn tag_feed(&mut self, c: char, out: &mut String) {
        if self.tag_pending.is_empty() {
            if c == '<' {
                self.tag_pending.push(c);
            } else {
                out.push(c);
            }
            return;
        }
        if c == '<' {
            out.push_str(&std::mem::take(&mut self.tag_pending));
            self.tag_pending.push(c);
            return;
        }
        self.tag_pending.push(c);
        if self.tag_pending.len() == 2 {
            // Comments/doctype are not tags; neither is `<` followed by
            // anything that cannot start a name.
            if c == '!' || !(c == '/' || c.is_ascii_alphabetic()) {
                out.push_str(&std::mem::take(&mut self.tag_pending));
            }
            return;
        }
        if self.tag_pending.len() == 3 && self.tag_pending.starts_with("</") {
            if !c.is_ascii_alphabetic() {
                out.push_str(&std::mem::take(&mut self.tag_pending));
            }
            return;
        }
        if c == '>' {
            let tag = std::mem::take(&mut self.tag_pending);
            self.finish_tag(&tag, out);
            return;
        }
        if self.tag_pending.len() > MAX_TAG_PENDING {
            out.push_str(&std::mem::take(&mut self.tag_pending));
        }
    }

    fn finish_tag(&mut self, tag: &str, out: &mut String) {
        // The marker machine upstream consumes every exact marker spelling,
        // so an exact spelling seen here was legitimately emitted by it.
        // Anything else, keyword-named or not, is plain text.
        let known = FIXED_MARKERS.iter().any(|(lit, _)| *lit == tag)
            || matches!(classify_phase_open(tag), Classify::Match(_));
        if known {
            out.push_str(tag);
        } else {
            for ch in tag.chars() {
                match ch {
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    other => out.push(other),
                }
            }
        }
    }
}

/// Repair one text increment. Returns the (possibly empty, possibly longer)
/// corrected increment; an empty return means everything was consumed into
/// internal buffering and nothing is visible yet.
pub fn sanitize_chunk(state: &mut SanitizeState, input: &str) -> String {
    let mut machine_out = String::new();
    for ch in input.chars() {
        let released = state.fence_filter(ch);
        for c in released.chars() {
            state.machine_feed(c, &mut machine_out);
        }
    }
    let after_err = state.scan_error_marker(&machine_out);
    state.scan_unknown_tags(&after_err)
}

/// Drain every pending buffer at end of stream so no held-back text is
/// silently lost, then close out a truncated document: once a thinking
/// region was opened, whatever closures never arrived (title, phase,
/// thinking, the final region with its query trailer) are synthesized so
/// the concatenated output still parses. A frozen stream flushes to
/// nothing.
pub fn sanitize_flush(state: &mut SanitizeState) -> String {
    if state.final_done {
        state.pending.clear();
        state.err_pending.clear();
        state.tag_pending.clear();
        return String::new();
    }

    let mut machine_out = String::new();
    if let FenceState::Probing(buf) = &mut state.fence {
        let held = std::mem::take(buf);
        state.fence = FenceState::Done;
        for c in held.chars() {
            state.machine_feed(c, &mut machine_out);
        }
    } else {
        state.fence = FenceState::Done;
    }

    let held = std::mem::take(&mut state.pending);
    state.emit(&held, &mut machine_out);

    if state.thinking_seen {
        if state.in_thinking {
            state.close_open_phase(&mut machine_out);
            state.in_thinking = false;
            state.emit("</thinking>", &mut machine_out);
        }
        if !state.final_seen {
            state.in_final = true;
            state.final_seen = true;
            state.emit("<final>", &mut machine_out);
        }
        if state.in_final {
            if !state.serp_seen {
                state.emit(SERP_OPEN, &mut machine_out);
                state.emit("[]", &mut machine_out);
                state.emit(SERP_CLOSE, &mut machine_out);
            }
            state.in_final = false;
            state.final_done = true;
            state.emit("</final>", &mut machine_out);
        }
    }

    let mut after_err = state.scan_error_marker(&machine_out);
    after_err.push_str(&std::mem::take(&mut state.err_pending));
    let mut out = state.scan_unknown_tags(&after_err);
    out.push_str(&std::mem::take(&mut state.tag_pending));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::is_well_formed;

    fn run(chunks: &[&str]) -> String {
        let mut state = SanitizeState::new();
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&sanitize_chunk(&mut state, chunk));
        }
        out.push_str(&sanitize_flush(&mut state));
        out
    }

    fn run_char_by_char(input: &str) -> String {
        let mut state = SanitizeState::new();
        let mut out = String::new();
        let mut buf = [0u8; 4];
        for c in input.chars() {
            out.push_str(&sanitize_chunk(&mut state, c.encode_utf8(&mut buf)));
        }
        out.push_str(&sanitize_flush(&mut state));
        out
    }

    const WELL_FORMED: &str = concat!(
        "<thinking><phase id=\"1\"><title>Plan</title>think</phase></thinking>",
        "<final>done<!--serp_queries:[\"q\"]--></final>"
    );

    #[test]
    fn passes_well_formed_input_through() {
        assert_eq!(run(&[WELL_FORMED]), WELL_FORMED);
    }

    #[test]
    fn boundary_insensitivity() {
        let cases = [
            WELL_FORMED.to_string(),
            "<thinking><phase id=\"1\">no title</phase></thinking><final>x</final>".into(),
            "plain text with a <div>tag</div> and <|gateway_error|> inside".into(),
            "<thinking>dup <thinking> and </thinking> later</thinking><final>y</final>".into(),
            format!("```json\n{WELL_FORMED}"),
            "unterminated <thin".into(),
        ];
        for case in &cases {
            let whole = run(&[case]);
            let charwise = run_char_by_char(case);
            assert_eq!(whole, charwise, "case: {case}");
        }
    }

    #[test]
    fn scenario_untitled_phase_gets_placeholder() {
        let input = concat!(
            "<thinking><phase id=\"1\">body</phase></thinking>",
            "<final>OK<!--serp_queries:[]--></final>"
        );
        // Delivered as 3 arbitrary-length fragments.
        let out = run(&[&input[..13], &input[13..40], &input[40..]]);
        assert!(out.contains("<title>Untitled</title>"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn duplicate_thinking_open_is_escaped() {
        let out = run(&[
            "<thinking><phase id=\"1\"><title>t</title>use <thinking> here</phase>",
            "</thinking><final>x</final>",
        ]);
        assert!(out.contains("use &lt;thinking&gt; here"));
        assert_eq!(out.matches("<thinking>").count(), 1);
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn literal_window_suppresses_snippet_close() {
        let input = concat!(
            "<thinking><phase id=\"1\"><title>t</title>",
            "example: <thinking>abc</thinking> end of example</phase>",
            "</thinking><final>x</final>"
        );
        let out = run(&[input]);
        // Both halves of the snippet are escaped; the real close still works.
        assert!(out.contains("&lt;thinking&gt;abc&lt;/thinking&gt;"));
        assert_eq!(out.matches("</thinking>").count(), 1);
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn snippet_final_pair_inside_final_is_escaped() {
        let input = concat!(
            "<thinking><phase id=\"1\"><title>t</title>x</phase></thinking>",
            "<final>see <final>demo</final> done</final>"
        );
        let out = run(&[input]);
        assert!(out.contains("see &lt;final&gt;demo&lt;/final&gt; done"));
        assert_eq!(out.matches("</final>").count(), 1);
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn phase_two_while_one_open_synthesizes_closure() {
        let input = concat!(
            "<thinking><phase id=\"1\"><title>a</title>one",
            "<phase id=\"2\"><title>b</title>two</phase></thinking><final>x</final>"
        );
        let out = run(&[input]);
        assert!(out.contains("one</phase><phase id=\"2\">"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn out_of_sequence_phase_is_renumbered() {
        let input = concat!(
            "<thinking><phase id=\"7\"><title>a</title>x</phase>",
            "<phase id=\"9\"><title>b</title>y</phase></thinking><final>z</final>"
        );
        let out = run(&[input]);
        assert!(out.contains("<phase id=\"1\">"));
        assert!(out.contains("<phase id=\"2\">"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn second_title_in_phase_is_escaped() {
        let input = concat!(
            "<thinking><phase id=\"1\"><title>a</title><Title>b</Title>x</phase>",
            "</thinking><final>y</final>"
        );
        let out = run(&[input]);
        assert!(out.contains("&lt;Title&gt;b&lt;/Title&gt;"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn title_synonyms_are_canonicalized() {
        let input = concat!(
            "<thinking><phase id=\"1\"><TITLE>a</TITLE>x</phase>",
            "</thinking><final>y</final>"
        );
        let out = run(&[input]);
        assert!(out.contains("<title>a</title>"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn unclosed_phase_at_thinking_close_is_repaired() {
        let input = "<thinking><phase id=\"1\"><title>a</title>body</thinking><final>x</final>";
        let out = run(&[input]);
        assert!(out.contains("body</phase></thinking>"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn everything_after_final_close_is_dropped() {
        let input = format!("{WELL_FORMED} trailing garbage <thinking>more</thinking>");
        let out = run(&[&input]);
        assert_eq!(out, WELL_FORMED);
    }

    #[test]
    fn missing_serp_trailer_is_injected() {
        let input = "<thinking><phase id=\"1\"><title>a</title>x</phase></thinking><final>answer</final>";
        let out = run(&[input]);
        assert!(out.ends_with("answer<!--serp_queries:[]--></final>"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn leading_code_fence_is_stripped() {
        let input = format!("```xml\n{WELL_FORMED}");
        assert_eq!(run(&[&input]), WELL_FORMED);

        let split = format!("``` \n{WELL_FORMED}");
        let halves = split.split_at(2);
        assert_eq!(run(&[halves.0, halves.1]), WELL_FORMED);
    }

    #[test]
    fn lone_backticks_are_not_a_fence() {
        let out = run(&["`x` is code"]);
        assert_eq!(out, "`x` is code");
    }

    #[test]
    fn error_marker_is_escaped_across_boundary() {
        let out = run(&["before <|gateway", "_error|> after"]);
        assert_eq!(out, "before &lt;|gateway_error|&gt; after");
    }

    #[test]
    fn unknown_tag_is_escaped_across_boundary() {
        let out = run(&["a <scr", "ipt>b</script> c"]);
        assert_eq!(out, "a &lt;script&gt;b&lt;/script&gt; c");
    }

    #[test]
    fn serp_comment_passes_unescaped() {
        let out = run(&["x <!--serp_queries:[\"a\"]--> y"]);
        assert_eq!(out, "x <!--serp_queries:[\"a\"]--> y");
    }

    #[test]
    fn flush_drains_partial_marker() {
        let mut state = SanitizeState::new();
        let mut out = sanitize_chunk(&mut state, "text <thin");
        assert_eq!(out, "text ");
        out.push_str(&sanitize_flush(&mut state));
        assert_eq!(out, "text <thin");
    }

    #[test]
    fn truncated_thinking_region_is_closed_at_flush() {
        // Upstream died mid-phase; flush owes the client a parseable document.
        let out = run(&["<thinking><phase id=\"1\"><title>t</title>half a thought"]);
        assert!(out.contains("half a thought</phase></thinking><final>"));
        assert!(out.ends_with("</final>"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn truncated_final_region_is_closed_at_flush() {
        let input = concat!(
            "<thinking><phase id=\"1\"><title>t</title>x</phase></thinking>",
            "<final>half an answ"
        );
        let out = run(&[input]);
        assert!(out.ends_with("half an answ<!--serp_queries:[]--></final>"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn untitled_open_phase_is_completed_at_flush() {
        let out = run(&["<thinking><phase id=\"1\">body"]);
        assert!(out.contains("body<title>Untitled</title></phase>"));
        assert!(is_well_formed(&out), "got: {out}");
    }

    #[test]
    fn close_without_open_is_escaped() {
        let out = run(&["</thinking> and </final> and </phase>"]);
        assert_eq!(
            out,
            "&lt;/thinking&gt; and &lt;/final&gt; and &lt;/phase&gt;"
        );
    }

    #[test]
    fn phase_marker_single_quotes_not_recognized() {
        let out = run(&["<thinking><phase id='1'>x</thinking><final>y</final>"]);
        assert!(out.contains("&lt;phase id='1'&gt;"));
    }
}
