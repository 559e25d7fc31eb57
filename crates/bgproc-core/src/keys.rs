//! Terminal input encoding for injected keystrokes and pastes.
//!
//! Key tokens follow tmux `send-keys` naming: named keys (`Enter`, `Tab`,
//! `Up`, ...), control chords (`C-c`) and meta chords (`M-x`). Tokens that
//! are not recognised are sent as literal text.

/// Start marker of a bracketed paste.
pub const PASTE_START: &str = "\x1b[200~";
/// End marker of a bracketed paste.
pub const PASTE_END: &str = "\x1b[201~";

/// Encode a single key token into the bytes a terminal would send.
pub fn encode_key(token: &str) -> Vec<u8> {
    if let Some(bytes) = named_key(token) {
        return bytes.to_vec();
    }

    if let Some(ch) = chord(token, "C-") {
        if let Some(byte) = control_byte(ch) {
            return vec![byte];
        }
    }

    if let Some(ch) = chord(token, "M-") {
        let mut bytes = vec![0x1b];
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        return bytes;
    }

    token.as_bytes().to_vec()
}

/// Encode an ordered list of key tokens, concatenated.
pub fn encode_keys<S: AsRef<str>>(tokens: &[S]) -> Vec<u8> {
    tokens
        .iter()
        .flat_map(|t| encode_key(t.as_ref()))
        .collect()
}

/// Render paste text the way it is delivered to the process.
pub fn render_paste(text: &str, bracketed: bool) -> String {
    if bracketed {
        format!("{PASTE_START}{text}{PASTE_END}")
    } else {
        text.to_string()
    }
}

fn named_key(token: &str) -> Option<&'static [u8]> {
    let bytes: &'static [u8] = match token {
        "Enter" | "Return" => b"\r",
        "Tab" => b"\t",
        "BTab" => b"\x1b[Z",
        "Escape" | "Esc" => b"\x1b",
        "Space" => b" ",
        "BSpace" | "Backspace" => b"\x7f",
        "Up" => b"\x1b[A",
        "Down" => b"\x1b[B",
        "Right" => b"\x1b[C",
        "Left" => b"\x1b[D",
        "Home" => b"\x1b[H",
        "End" => b"\x1b[F",
        "PageUp" | "PPage" => b"\x1b[5~",
        "PageDown" | "NPage" => b"\x1b[6~",
        "Delete" | "DC" => b"\x1b[3~",
        "Insert" | "IC" => b"\x1b[2~",
        _ => return None,
    };
    Some(bytes)
}

/// `C-c` -> `'c'`; only single-character chords qualify.
fn chord(token: &str, prefix: &str) -> Option<char> {
    let rest = token.strip_prefix(prefix)?;
    let mut chars = rest.chars();
    let ch = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    Some(ch)
}

fn control_byte(ch: char) -> Option<u8> {
    match ch {
        '?' => Some(0x7f),
        ' ' | '@' => Some(0x00),
        c if c.is_ascii_alphabetic() => Some((c.to_ascii_lowercase() as u8) & 0x1f),
        '[' | '\\' | ']' | '^' | '_' => Some((ch as u8) & 0x1f),
        _ => None,
    }
}
