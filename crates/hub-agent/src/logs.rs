use std::sync::OnceLock;

use regex::Regex;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI and OSC, possibly cut off at the end of the text, then escapes
        // with optional intermediates (charset selection, keypad modes), then
        // any ESC left over.
        Regex::new(concat!(
            r"\x1b\[[0-?]*[ -/]*(?:[@-~]|$)",
            r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\|$)",
            r"|\x1b[ -/]*[0-~]",
            r"|\x1b",
        ))
        .expect("valid ansi regex")
    })
}

/// Removes terminal control sequences so the result is plain text.
pub fn strip_ansi(text: &str) -> String {
    if !text.contains('\x1b') {
        return text.to_string();
    }
    ansi_re().replace_all(text, "").into_owned()
}

/// Keeps at most the last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    // Drop a trailing empty line if the text ends with a newline.
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.len() > max_lines {
        lines.drain(0..(lines.len() - max_lines));
    }
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

pub(crate) fn line_count(text: &str) -> usize {
    text.lines().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_runs() {
        let raw = "\x1b[32m0|api  | \x1b[39m\x1b[1mlistening\x1b[22m on :3000\x1b[0m\n";
        let clean = strip_ansi(raw);
        assert_eq!(clean, "0|api  | listening on :3000\n");
        assert!(!clean.contains('\x1b'));
    }

    #[test]
    fn strips_osc_and_256_colors() {
        let raw = "\x1b]0;title\x07\x1b[38;5;39mblue\x1b[0m \x1b]8;;http://x\x1b\\link\x1b]8;;\x1b\\";
        assert_eq!(strip_ansi(raw), "blue link");
    }

    #[test]
    fn strips_charset_and_keypad_escapes() {
        let raw = "\x1b[31mfail\x1b(B\x1b[m done\n";
        assert_eq!(strip_ansi(raw), "fail done\n");
        assert_eq!(strip_ansi("\x1b7saved\x1b8 \x1b=keypad\x1b>"), "saved keypad");
    }

    #[test]
    fn strips_sequences_cut_off_at_the_end() {
        assert_eq!(strip_ansi("ready\x1b[3"), "ready");
        assert_eq!(strip_ansi("ready\x1b]0;tit"), "ready");
        assert_eq!(strip_ansi("ready\x1b"), "ready");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_ansi("GET / 200 4ms"), "GET / 200 4ms");
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd\n", 2), "c\nd\n");
        assert_eq!(tail_lines("a\nb", 5), "a\nb\n");
        assert_eq!(tail_lines("", 5), "");
    }
}
