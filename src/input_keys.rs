//! Translate normalised keys into the byte sequences the application in a
//! pane expects, honouring the pane's cursor/keypad modes, the mouse
//! reporting mode it enabled, and bracketed paste.

use crate::keys::{mods_to_xterm, Key, KeyEvent, MouseEvent, MouseKind, MOD_CTRL, MOD_META};
use crate::screen::{
    ALL_MOUSE_MODES, MODE_BRACKETPASTE, MODE_FOCUSON, MODE_KCURSOR, MODE_KKEYPAD,
    MODE_MOUSE_ANY, MODE_MOUSE_BUTTON, MODE_MOUSE_SGR, MODE_MOUSE_UTF8, MODE_MOUSE_X10,
};

/// Translate one key for a pane with the given screen mode. Returns the
/// bytes to write to the pty, empty when the key has no encoding.
pub fn translate_key(key: KeyEvent, mode: u32) -> Vec<u8> {
    let mut out = Vec::new();

    match key.key {
        Key::Char(ch) => {
            if key.mods & MOD_META != 0 {
                out.push(0x1b);
            }
            if key.mods & MOD_CTRL != 0 {
                if let Some(b) = ctrl_byte(ch) {
                    out.push(b);
                    return out;
                }
            }
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        }
        Key::Enter => out.push(b'\r'),
        Key::Escape => out.push(0x1b),
        Key::Backspace => out.push(0x7f),
        Key::Tab => out.push(b'\t'),
        Key::BackTab => out.extend_from_slice(b"\x1b[Z"),

        Key::Up | Key::Down | Key::Right | Key::Left => {
            let ch = match key.key {
                Key::Up => b'A',
                Key::Down => b'B',
                Key::Right => b'C',
                _ => b'D',
            };
            if key.mods != 0 {
                out.extend_from_slice(
                    format!("\x1b[1;{}{}", mods_to_xterm(key.mods), ch as char).as_bytes(),
                );
            } else if mode & MODE_KCURSOR != 0 {
                out.extend_from_slice(&[0x1b, b'O', ch]);
            } else {
                out.extend_from_slice(&[0x1b, b'[', ch]);
            }
        }

        Key::Home | Key::End => {
            let ch = if key.key == Key::Home { b'H' } else { b'F' };
            if key.mods != 0 {
                out.extend_from_slice(
                    format!("\x1b[1;{}{}", mods_to_xterm(key.mods), ch as char).as_bytes(),
                );
            } else if mode & MODE_KCURSOR != 0 {
                out.extend_from_slice(&[0x1b, b'O', ch]);
            } else {
                out.extend_from_slice(&[0x1b, b'[', ch]);
            }
        }

        Key::Insert => out.extend_from_slice(&tilde_seq(2, key.mods)),
        Key::Delete => out.extend_from_slice(&tilde_seq(3, key.mods)),
        Key::PageUp => out.extend_from_slice(&tilde_seq(5, key.mods)),
        Key::PageDown => out.extend_from_slice(&tilde_seq(6, key.mods)),

        Key::F(n) => out.extend_from_slice(&function_key(n, key.mods)),

        Key::KpEnter => {
            if mode & MODE_KKEYPAD != 0 {
                out.extend_from_slice(b"\x1bOM");
            } else {
                out.push(b'\r');
            }
        }
        Key::Kp(ch) => {
            if mode & MODE_KKEYPAD != 0 {
                let app = match ch {
                    '0'..='9' => Some(b'p' + (ch as u8 - b'0')),
                    '.' => Some(b'n'),
                    '+' => Some(b'k'),
                    '-' => Some(b'm'),
                    '*' => Some(b'j'),
                    '/' => Some(b'o'),
                    _ => None,
                };
                match app {
                    Some(b) => out.extend_from_slice(&[0x1b, b'O', b]),
                    None => out.push(ch as u8),
                }
            } else {
                out.push(ch as u8);
            }
        }
    }
    out
}

fn ctrl_byte(ch: char) -> Option<u8> {
    match ch {
        'a'..='z' => Some(ch as u8 - b'a' + 1),
        'A'..='Z' => Some(ch as u8 - b'A' + 1),
        ' ' | '@' => Some(0),
        '[' => Some(0x1b),
        '\\' => Some(0x1c),
        ']' => Some(0x1d),
        '^' => Some(0x1e),
        '_' => Some(0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

fn tilde_seq(n: u16, mods: u8) -> Vec<u8> {
    if mods != 0 {
        format!("\x1b[{};{}~", n, mods_to_xterm(mods)).into_bytes()
    } else {
        format!("\x1b[{}~", n).into_bytes()
    }
}

fn function_key(n: u8, mods: u8) -> Vec<u8> {
    // F1-F4 are SS3 without modifiers, CSI 1;mP.. with.
    if (1..=4).contains(&n) {
        let ch = [b'P', b'Q', b'R', b'S'][(n - 1) as usize];
        if mods != 0 {
            return format!("\x1b[1;{}{}", mods_to_xterm(mods), ch as char).into_bytes();
        }
        return vec![0x1b, b'O', ch];
    }
    let code = match n {
        5 => 15,
        6 => 17,
        7 => 18,
        8 => 19,
        9 => 20,
        10 => 21,
        11 => 23,
        12 => 24,
        _ => return Vec::new(),
    };
    tilde_seq(code, mods)
}

/// Encode a mouse event for the application, in whichever reporting mode it
/// enabled. Returns empty when the pane is not listening for this event.
pub fn translate_mouse(m: MouseEvent, mode: u32) -> Vec<u8> {
    if mode & ALL_MOUSE_MODES == 0 {
        return Vec::new();
    }
    // Motion needs any-event mode; drags need at least button-event mode.
    match m.kind {
        MouseKind::Move => {
            if mode & MODE_MOUSE_ANY == 0 {
                return Vec::new();
            }
        }
        MouseKind::Drag => {
            if mode & (MODE_MOUSE_BUTTON | MODE_MOUSE_ANY) == 0 {
                return Vec::new();
            }
        }
        MouseKind::Up => {
            // X10 mode reports presses only.
            if mode & MODE_MOUSE_X10 != 0 {
                return Vec::new();
            }
        }
        _ => {}
    }

    let mut b: u16 = match m.kind {
        MouseKind::WheelUp => 64,
        MouseKind::WheelDown => 65,
        MouseKind::Move => 32 + 3,
        MouseKind::Drag => 32 + m.button as u16,
        MouseKind::Up | MouseKind::Down => m.button as u16,
    };
    if m.mods & crate::keys::MOD_SHIFT != 0 {
        b += 4;
    }
    if m.mods & MOD_META != 0 {
        b += 8;
    }
    if m.mods & MOD_CTRL != 0 {
        b += 16;
    }

    // SGR (1006) keeps the release button distinguishable, but only use it
    // when the originating terminal spoke SGR too: a legacy release has no
    // button to report.
    if mode & MODE_MOUSE_SGR != 0 && m.sgr {
        let ch = if m.kind == MouseKind::Up { 'm' } else { 'M' };
        return format!("\x1b[<{};{};{}{}", b, m.x + 1, m.y + 1, ch).into_bytes();
    }

    let b = if m.kind == MouseKind::Up { 3 } else { b };
    if mode & MODE_MOUSE_UTF8 != 0 {
        let mut out = b"\x1b[M".to_vec();
        utf8_split(b + 32, &mut out);
        utf8_split(m.x + 33, &mut out);
        utf8_split(m.y + 33, &mut out);
        return out;
    }

    if b > 223 || m.x > 222 || m.y > 222 {
        return Vec::new();
    }
    vec![0x1b, b'[', b'M', (b + 32) as u8, (m.x + 33) as u8, (m.y + 33) as u8]
}

/// The UTF-8 (1005) two-byte coordinate encoding.
fn utf8_split(v: u16, out: &mut Vec<u8>) {
    if v < 0x80 {
        out.push(v as u8);
    } else {
        out.push(0xc0 | (v >> 6) as u8);
        out.push(0x80 | (v & 0x3f) as u8);
    }
}

/// Wrap bulk input per the pane's bracketed-paste mode.
pub fn translate_paste(data: &[u8], mode: u32) -> Vec<u8> {
    if mode & MODE_BRACKETPASTE != 0 {
        let mut out = b"\x1b[200~".to_vec();
        out.extend_from_slice(data);
        out.extend_from_slice(b"\x1b[201~");
        out
    } else {
        data.to_vec()
    }
}

/// Forward a focus change when the application asked for focus reporting.
pub fn translate_focus(gained: bool, mode: u32) -> Vec<u8> {
    if mode & MODE_FOCUSON == 0 {
        return Vec::new();
    }
    if gained {
        b"\x1b[I".to_vec()
    } else {
        b"\x1b[O".to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MOD_SHIFT;

    #[test]
    fn arrows_follow_cursor_mode() {
        let k = KeyEvent::plain(Key::Up);
        assert_eq!(translate_key(k, 0), b"\x1b[A");
        assert_eq!(translate_key(k, MODE_KCURSOR), b"\x1bOA");
    }

    #[test]
    fn modified_arrow_uses_xterm_parameter() {
        let k = KeyEvent::with(Key::Right, MOD_CTRL);
        assert_eq!(translate_key(k, MODE_KCURSOR), b"\x1b[1;5C");
    }

    #[test]
    fn ctrl_char_collapses_to_control_byte() {
        let k = KeyEvent::with(Key::Char('c'), MOD_CTRL);
        assert_eq!(translate_key(k, 0), vec![0x03]);
    }

    #[test]
    fn meta_char_gets_escape_prefix() {
        let k = KeyEvent::with(Key::Char('x'), MOD_META);
        assert_eq!(translate_key(k, 0), b"\x1bx");
    }

    #[test]
    fn keypad_application_mode() {
        let k = KeyEvent::plain(Key::Kp('5'));
        assert_eq!(translate_key(k, 0), b"5");
        assert_eq!(translate_key(k, MODE_KKEYPAD), b"\x1bOu");
    }

    #[test]
    fn function_keys_fixed_sequences() {
        assert_eq!(translate_key(KeyEvent::plain(Key::F(1)), 0), b"\x1bOP");
        assert_eq!(translate_key(KeyEvent::plain(Key::F(5)), 0), b"\x1b[15~");
        assert_eq!(
            translate_key(KeyEvent::with(Key::F(5), MOD_SHIFT), 0),
            b"\x1b[15;2~"
        );
    }

    #[test]
    fn mouse_requires_a_reporting_mode() {
        let m = MouseEvent { kind: MouseKind::Down, button: 0, x: 4, y: 2, mods: 0, sgr: true };
        assert!(translate_mouse(m, 0).is_empty());
        assert_eq!(
            translate_mouse(m, crate::screen::MODE_MOUSE_STANDARD),
            vec![0x1b, b'[', b'M', 32, 33 + 4, 33 + 2]
        );
    }

    #[test]
    fn sgr_mouse_when_both_sides_speak_it() {
        let m = MouseEvent { kind: MouseKind::Up, button: 0, x: 4, y: 2, mods: 0, sgr: true };
        let mode = crate::screen::MODE_MOUSE_STANDARD | MODE_MOUSE_SGR;
        assert_eq!(translate_mouse(m, mode), b"\x1b[<0;5;3m");
        // Legacy release cannot be upgraded to SGR.
        let legacy = MouseEvent { sgr: false, ..m };
        assert_eq!(
            translate_mouse(legacy, mode),
            vec![0x1b, b'[', b'M', 3 + 32, 33 + 4, 33 + 2]
        );
    }

    #[test]
    fn paste_wrapping() {
        assert_eq!(translate_paste(b"hi", 0), b"hi");
        assert_eq!(
            translate_paste(b"hi", MODE_BRACKETPASTE),
            b"\x1b[200~hi\x1b[201~"
        );
    }
}
