//! Logging helpers that keep message bodies and modem traffic on a single log line.

/// Longest preview of a body or response, in characters.
const MAX_PREVIEW: usize = 300;

/// Render `s` the way AT traffic is usually read on a terminal:
/// - CR and LF become `<CR>` and `<LF>`
/// - other C0 controls use caret notation, so the CMGS terminator shows as `^Z`
/// - DEL becomes `^?`
///
/// Anything past [`MAX_PREVIEW`] characters is cut and the number of dropped
/// characters noted.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 16);
    let mut shown = 0;
    for ch in s.chars() {
        if shown == MAX_PREVIEW {
            let rest = s.chars().count() - MAX_PREVIEW;
            out.push_str(&format!("…(+{} chars)", rest));
            break;
        }
        match ch {
            '\r' => out.push_str("<CR>"),
            '\n' => out.push_str("<LF>"),
            '\u{7F}' => out.push_str("^?"),
            c if (c as u32) < 0x20 => {
                out.push('^');
                out.push(char::from(b'@' + c as u8));
            }
            c => out.push(c),
        }
        shown += 1;
    }
    out
}
