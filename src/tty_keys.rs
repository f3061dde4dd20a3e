//! Decode the byte stream from a client's terminal into normalised key
//! events: CSI/SS3 keyboard sequences with xterm modifiers, SGR and X10
//! mouse reports, bracketed paste blocks, and Alt-prefixed characters.
//!
//! A lone ESC is held until either more bytes arrive or the escape-time
//! timer fires and the server calls `flush_escape`.

use crate::keys::{
    mods_from_xterm, InputEvent, Key, KeyEvent, MouseEvent, MouseKind, MOD_CTRL, MOD_META,
    MOD_SHIFT,
};

#[derive(Clone, Copy, PartialEq)]
enum State {
    Ground,
    Escape,
    CsiEntry,
    CsiParam,
    X10Mouse,
    Ss3,
    Paste,
}

pub struct TtyKeys {
    state: State,
    params: [u16; 8],
    pidx: usize,
    cur: u16,
    priv_ch: u8,
    x10: [u8; 3],
    x10_n: usize,
    paste: Vec<u8>,
    /// Pending UTF-8 continuation bytes for ground characters.
    utf8: Vec<u8>,
}

impl TtyKeys {
    pub fn new() -> Self {
        TtyKeys {
            state: State::Ground,
            params: [0; 8],
            pidx: 0,
            cur: 0,
            priv_ch: 0,
            x10: [0; 3],
            x10_n: 0,
            paste: Vec::new(),
            utf8: Vec::new(),
        }
    }

    fn reset_csi(&mut self) {
        self.params = [0; 8];
        self.pidx = 0;
        self.cur = 0;
        self.priv_ch = 0;
    }

    fn finish_param(&mut self) {
        if self.pidx < self.params.len() {
            self.params[self.pidx] = self.cur;
            self.pidx += 1;
        }
        self.cur = 0;
    }

    /// True while a lone ESC is held, awaiting either a sequence tail or
    /// the escape timeout.
    pub fn pending_escape(&self) -> bool {
        self.state == State::Escape
    }

    /// The escape timer fired: the held ESC was a real Escape key.
    pub fn flush_escape(&mut self) -> Option<InputEvent> {
        if self.state == State::Escape {
            self.state = State::Ground;
            Some(InputEvent::Key(KeyEvent::plain(Key::Escape)))
        } else {
            None
        }
    }

    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<InputEvent>) {
        for &b in bytes {
            self.byte(b, out);
        }
    }

    fn byte(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        match self.state {
            State::Ground => self.ground(b, out),
            State::Escape => self.escape(b, out),
            State::CsiEntry => self.csi_entry(b, out),
            State::CsiParam => self.csi_param(b, out),
            State::X10Mouse => self.x10_byte(b, out),
            State::Ss3 => self.ss3(b, out),
            State::Paste => self.paste_byte(b, out),
        }
    }

    fn ground(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        // Reassemble multi-byte UTF-8 characters.
        if !self.utf8.is_empty() {
            if b & 0xc0 == 0x80 {
                self.utf8.push(b);
                if let Ok(s) = std::str::from_utf8(&self.utf8) {
                    if let Some(ch) = s.chars().next() {
                        out.push(InputEvent::Key(KeyEvent::plain(Key::Char(ch))));
                    }
                    self.utf8.clear();
                }
                if self.utf8.len() >= 4 {
                    self.utf8.clear();
                }
                return;
            }
            self.utf8.clear();
        }
        match b {
            0x1b => self.state = State::Escape,
            b'\r' | b'\n' => out.push(InputEvent::Key(KeyEvent::plain(Key::Enter))),
            b'\t' => out.push(InputEvent::Key(KeyEvent::plain(Key::Tab))),
            0x7f | 0x08 => out.push(InputEvent::Key(KeyEvent::plain(Key::Backspace))),
            0 => out.push(InputEvent::Key(KeyEvent::with(Key::Char(' '), MOD_CTRL))),
            1..=26 => {
                let letter = (b'a' + b - 1) as char;
                out.push(InputEvent::Key(KeyEvent::with(Key::Char(letter), MOD_CTRL)));
            }
            28 => out.push(InputEvent::Key(KeyEvent::with(Key::Char('\\'), MOD_CTRL))),
            29 => out.push(InputEvent::Key(KeyEvent::with(Key::Char(']'), MOD_CTRL))),
            30 => out.push(InputEvent::Key(KeyEvent::with(Key::Char('^'), MOD_CTRL))),
            31 => out.push(InputEvent::Key(KeyEvent::with(Key::Char('_'), MOD_CTRL))),
            0x20..=0x7e => {
                out.push(InputEvent::Key(KeyEvent::plain(Key::Char(b as char))))
            }
            0xc2..=0xf4 => self.utf8.push(b),
            _ => {}
        }
    }

    fn escape(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        match b {
            b'[' => {
                self.reset_csi();
                self.state = State::CsiEntry;
            }
            b'O' => self.state = State::Ss3,
            0x1b => {
                // Double ESC: one Escape out, stay armed.
                out.push(InputEvent::Key(KeyEvent::plain(Key::Escape)));
            }
            0x20..=0x7e => {
                // Meta-prefixed printable.
                out.push(InputEvent::Key(KeyEvent::with(Key::Char(b as char), MOD_META)));
                self.state = State::Ground;
            }
            _ => {
                out.push(InputEvent::Key(KeyEvent::plain(Key::Escape)));
                self.state = State::Ground;
                self.ground(b, out);
            }
        }
    }

    fn csi_entry(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        match b {
            b'<' | b'?' => {
                self.priv_ch = b;
                self.state = State::CsiParam;
            }
            b'0'..=b'9' => {
                self.cur = (b - b'0') as u16;
                self.state = State::CsiParam;
            }
            b';' => {
                self.finish_param();
                self.state = State::CsiParam;
            }
            b'M' => {
                self.x10_n = 0;
                self.state = State::X10Mouse;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'~' => {
                // No parameters were seen.
                self.dispatch_csi(b, out);
            }
            0x1b => self.state = State::Escape,
            _ => self.state = State::Ground,
        }
    }

    fn csi_param(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        match b {
            b'0'..=b'9' => {
                self.cur = self.cur.saturating_mul(10).saturating_add((b - b'0') as u16);
            }
            b';' | b':' => self.finish_param(),
            b'A'..=b'Z' | b'a'..=b'z' | b'~' => {
                self.finish_param();
                self.dispatch_csi(b, out);
            }
            0x1b => self.state = State::Escape,
            _ => self.state = State::Ground,
        }
    }

    fn dispatch_csi(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        self.state = State::Ground;

        if self.priv_ch == b'<' {
            self.sgr_mouse(b, out);
            return;
        }
        if self.priv_ch == b'?' {
            return;
        }
        if b == b'~' && self.pidx >= 1 && self.params[0] == 200 {
            self.paste.clear();
            self.state = State::Paste;
            return;
        }

        let mods = if self.pidx >= 2 { mods_from_xterm(self.params[1]) } else { 0 };
        let key = match b {
            b'A' => Some(Key::Up),
            b'B' => Some(Key::Down),
            b'C' => Some(Key::Right),
            b'D' => Some(Key::Left),
            b'H' => Some(Key::Home),
            b'F' => Some(Key::End),
            b'P' => Some(Key::F(1)),
            b'Q' => Some(Key::F(2)),
            b'R' => Some(Key::F(3)),
            b'S' => Some(Key::F(4)),
            b'Z' => Some(Key::BackTab),
            b'I' if self.pidx == 0 => {
                out.push(InputEvent::Focus(true));
                None
            }
            b'O' if self.pidx == 0 => {
                out.push(InputEvent::Focus(false));
                None
            }
            b'~' => self.tilde_key(),
            _ => None,
        };
        if let Some(key) = key {
            let mods = if key == Key::BackTab { mods | MOD_SHIFT } else { mods };
            out.push(InputEvent::Key(KeyEvent::with(key, mods)));
        }
    }

    fn tilde_key(&self) -> Option<Key> {
        match self.params[0] {
            1 | 7 => Some(Key::Home),
            2 => Some(Key::Insert),
            3 => Some(Key::Delete),
            4 | 8 => Some(Key::End),
            5 => Some(Key::PageUp),
            6 => Some(Key::PageDown),
            11..=15 => Some(Key::F((self.params[0] - 10) as u8)),
            17..=21 => Some(Key::F((self.params[0] - 11) as u8)),
            23 | 24 => Some(Key::F((self.params[0] - 12) as u8)),
            // 27 and 30 are unassigned in the vt220 scheme.
            25 | 26 => Some(Key::F((self.params[0] - 12) as u8)),
            28 | 29 => Some(Key::F((self.params[0] - 13) as u8)),
            31..=34 => Some(Key::F((self.params[0] - 14) as u8)),
            _ => None,
        }
    }

    fn sgr_mouse(&mut self, final_byte: u8, out: &mut Vec<InputEvent>) {
        if self.pidx < 3 {
            return;
        }
        let b = self.params[0];
        let x = self.params[1].saturating_sub(1);
        let y = self.params[2].saturating_sub(1);
        let mut mods = 0;
        if b & 4 != 0 {
            mods |= MOD_SHIFT;
        }
        if b & 8 != 0 {
            mods |= MOD_META;
        }
        if b & 16 != 0 {
            mods |= MOD_CTRL;
        }
        let button = (b & 3) as u8 | (((b >> 6) & 1) as u8) << 2;
        let kind = if b & 64 != 0 {
            if b & 1 != 0 { MouseKind::WheelDown } else { MouseKind::WheelUp }
        } else if b & 32 != 0 {
            if b & 3 == 3 { MouseKind::Move } else { MouseKind::Drag }
        } else if final_byte == b'm' {
            MouseKind::Up
        } else {
            MouseKind::Down
        };
        out.push(InputEvent::Mouse(MouseEvent {
            kind,
            button: button & 3,
            x,
            y,
            mods,
            sgr: true,
        }));
    }

    fn x10_byte(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        self.x10[self.x10_n] = b;
        self.x10_n += 1;
        if self.x10_n < 3 {
            return;
        }
        self.state = State::Ground;
        let cb = self.x10[0].wrapping_sub(32);
        let x = self.x10[1].wrapping_sub(33) as u16;
        let y = self.x10[2].wrapping_sub(33) as u16;
        let kind = match cb & 3 {
            3 => MouseKind::Up,
            _ if cb & 64 != 0 => {
                if cb & 1 != 0 { MouseKind::WheelDown } else { MouseKind::WheelUp }
            }
            _ if cb & 32 != 0 => MouseKind::Drag,
            _ => MouseKind::Down,
        };
        out.push(InputEvent::Mouse(MouseEvent {
            kind,
            button: cb & 3,
            x,
            y,
            mods: 0,
            sgr: false,
        }));
    }

    fn ss3(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        self.state = State::Ground;
        let key = match b {
            b'A' => Some(Key::Up),
            b'B' => Some(Key::Down),
            b'C' => Some(Key::Right),
            b'D' => Some(Key::Left),
            b'H' => Some(Key::Home),
            b'F' => Some(Key::End),
            b'P' => Some(Key::F(1)),
            b'Q' => Some(Key::F(2)),
            b'R' => Some(Key::F(3)),
            b'S' => Some(Key::F(4)),
            b'M' => Some(Key::KpEnter),
            _ => None,
        };
        if let Some(key) = key {
            out.push(InputEvent::Key(KeyEvent::plain(key)));
        }
    }

    fn paste_byte(&mut self, b: u8, out: &mut Vec<InputEvent>) {
        self.paste.push(b);
        // Watch for the terminator \x1b[201~ inside the accumulated bytes.
        const END: &[u8] = b"\x1b[201~";
        if self.paste.ends_with(END) {
            self.paste.truncate(self.paste.len() - END.len());
            out.push(InputEvent::Paste(std::mem::take(&mut self.paste)));
            self.state = State::Ground;
        }
    }
}

impl Default for TtyKeys {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(bytes: &[u8]) -> Vec<InputEvent> {
        let mut tk = TtyKeys::new();
        let mut out = Vec::new();
        tk.feed(bytes, &mut out);
        out
    }

    #[test]
    fn plain_and_control_chars() {
        assert_eq!(feed(b"a"), vec![InputEvent::Key(KeyEvent::plain(Key::Char('a')))]);
        assert_eq!(
            feed(&[0x03]),
            vec![InputEvent::Key(KeyEvent::with(Key::Char('c'), MOD_CTRL))]
        );
    }

    #[test]
    fn arrows_with_modifiers() {
        assert_eq!(feed(b"\x1b[A"), vec![InputEvent::Key(KeyEvent::plain(Key::Up))]);
        assert_eq!(
            feed(b"\x1b[1;5C"),
            vec![InputEvent::Key(KeyEvent::with(Key::Right, MOD_CTRL))]
        );
        assert_eq!(feed(b"\x1bOB"), vec![InputEvent::Key(KeyEvent::plain(Key::Down))]);
    }

    #[test]
    fn function_and_editing_keys() {
        assert_eq!(feed(b"\x1b[15~"), vec![InputEvent::Key(KeyEvent::plain(Key::F(5)))]);
        assert_eq!(feed(b"\x1b[3~"), vec![InputEvent::Key(KeyEvent::plain(Key::Delete))]);
        assert_eq!(
            feed(b"\x1b[Z"),
            vec![InputEvent::Key(KeyEvent::with(Key::BackTab, MOD_SHIFT))]
        );
    }

    #[test]
    fn tilde_function_key_table() {
        // The vt220 numbering has gaps: 16, 22, 27, and 30 are unassigned.
        let expected = [
            (11, 1),
            (12, 2),
            (13, 3),
            (14, 4),
            (15, 5),
            (17, 6),
            (18, 7),
            (19, 8),
            (20, 9),
            (21, 10),
            (23, 11),
            (24, 12),
            (25, 13),
            (26, 14),
            (28, 15),
            (29, 16),
            (31, 17),
            (32, 18),
            (33, 19),
            (34, 20),
        ];
        for (code, f) in expected {
            assert_eq!(
                feed(format!("\x1b[{}~", code).as_bytes()),
                vec![InputEvent::Key(KeyEvent::plain(Key::F(f)))],
                "CSI {code}~"
            );
        }
        for code in [16, 22, 27, 30] {
            assert!(feed(format!("\x1b[{}~", code).as_bytes()).is_empty(), "CSI {code}~");
        }
    }

    #[test]
    fn meta_prefixed_char() {
        assert_eq!(
            feed(b"\x1bx"),
            vec![InputEvent::Key(KeyEvent::with(Key::Char('x'), MOD_META))]
        );
    }

    #[test]
    fn lone_escape_held_until_flush() {
        let mut tk = TtyKeys::new();
        let mut out = Vec::new();
        tk.feed(b"\x1b", &mut out);
        assert!(out.is_empty());
        assert!(tk.pending_escape());
        assert_eq!(
            tk.flush_escape(),
            Some(InputEvent::Key(KeyEvent::plain(Key::Escape)))
        );
    }

    #[test]
    fn sgr_mouse_press_release() {
        let events = feed(b"\x1b[<0;10;5M\x1b[<0;10;5m");
        assert_eq!(events.len(), 2);
        match &events[0] {
            InputEvent::Mouse(m) => {
                assert_eq!(m.kind, MouseKind::Down);
                assert_eq!((m.x, m.y), (9, 4));
                assert!(m.sgr);
            }
            other => panic!("expected mouse, got {other:?}"),
        }
        assert!(matches!(
            &events[1],
            InputEvent::Mouse(MouseEvent { kind: MouseKind::Up, .. })
        ));
    }

    #[test]
    fn x10_mouse() {
        let events = feed(&[0x1b, b'[', b'M', 32, 33 + 9, 33 + 4]);
        match &events[0] {
            InputEvent::Mouse(m) => {
                assert_eq!(m.kind, MouseKind::Down);
                assert_eq!((m.x, m.y), (9, 4));
                assert!(!m.sgr);
            }
            other => panic!("expected mouse, got {other:?}"),
        }
    }

    #[test]
    fn bracketed_paste_collected() {
        let events = feed(b"\x1b[200~hello\nworld\x1b[201~");
        assert_eq!(events, vec![InputEvent::Paste(b"hello\nworld".to_vec())]);
    }

    #[test]
    fn utf8_char_reassembled() {
        assert_eq!(
            feed("é".as_bytes()),
            vec![InputEvent::Key(KeyEvent::plain(Key::Char('é')))]
        );
    }

    #[test]
    fn focus_events() {
        assert_eq!(feed(b"\x1b[I"), vec![InputEvent::Focus(true)]);
        assert_eq!(feed(b"\x1b[O"), vec![InputEvent::Focus(false)]);
    }
}
