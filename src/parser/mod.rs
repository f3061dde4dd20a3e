//! The VT/ANSI input parser: a table-driven state machine that turns the
//! byte stream from a pty into terminal operations. Purely reactive, owns no
//! grid state, and never fails: malformed input is dropped or surfaces as
//! the replacement character.

pub mod ops;
pub mod tables;

use ops::{Charset, EraseMode, Param, TermOp};
use tables::{Action, State};

/// String payload cap. Overflow keeps absorbing but sets the truncation
/// flag on the emitted operation.
pub const STRING_LIMIT: usize = 65536;

/// At most sixteen numeric parameters are collected; the rest are dropped.
pub const MAX_PARAMS: usize = 16;

const MAX_INTERMEDIATES: usize = 4;

#[derive(Default)]
struct Utf8Collect {
    want: u8,
    have: u8,
    buf: [u8; 4],
}

/// Parser state. One instance per pane; not restartable mid-operation.
pub struct Parser {
    state: State,
    utf8_enabled: bool,

    param_list: Vec<Param>,
    cur_param: Param,
    cur: Option<u32>,
    param_seen: bool,

    intermediates: [u8; MAX_INTERMEDIATES],
    interm_len: usize,
    interm_overflow: bool,
    private: u8,

    buf: Vec<u8>,
    buf_truncated: bool,
    dcs_final: u8,
    dcs_data_start: usize,

    utf8: Utf8Collect,
}

impl Parser {
    pub fn new(utf8_enabled: bool) -> Self {
        Parser {
            state: State::Ground,
            utf8_enabled,
            param_list: Vec::new(),
            cur_param: Vec::new(),
            cur: None,
            param_seen: false,
            intermediates: [0; MAX_INTERMEDIATES],
            interm_len: 0,
            interm_overflow: false,
            private: 0,
            buf: Vec::new(),
            buf_truncated: false,
            dcs_final: 0,
            dcs_data_start: 0,
            utf8: Utf8Collect::default(),
        }
    }

    /// Feed a chunk of pty output, emitting operations into the sink. A
    /// partial escape sequence or UTF-8 character at the end of the chunk is
    /// held in the parser state for the next call.
    pub fn advance(&mut self, bytes: &[u8], sink: &mut impl FnMut(TermOp)) {
        for &b in bytes {
            self.advance_byte(b, sink);
        }
    }

    fn advance_byte(&mut self, b: u8, sink: &mut impl FnMut(TermOp)) {
        if self.utf8.want > 0 {
            if b & 0xc0 == 0x80 {
                self.utf8.buf[self.utf8.have as usize] = b;
                self.utf8.have += 1;
                if self.utf8.have == self.utf8.want {
                    let len = self.utf8.want as usize;
                    let ch = std::str::from_utf8(&self.utf8.buf[..len])
                        .ok()
                        .and_then(|s| s.chars().next())
                        .unwrap_or('\u{fffd}');
                    self.utf8 = Utf8Collect::default();
                    self.deliver_char(ch, sink);
                }
                return;
            }
            // Truncated sequence: replacement character, then reprocess.
            self.utf8 = Utf8Collect::default();
            self.deliver_char('\u{fffd}', sink);
        }

        if self.utf8_enabled
            && (self.state == State::Ground || self.state.collects_string())
        {
            let want = match b {
                0xc2..=0xdf => 2,
                0xe0..=0xef => 3,
                0xf0..=0xf4 => 4,
                _ => 0,
            };
            if want > 0 {
                self.utf8.want = want;
                self.utf8.have = 1;
                self.utf8.buf[0] = b;
                return;
            }
            if b >= 0xa0 || b == 0xc0 || b == 0xc1 {
                // Not a valid UTF-8 lead byte.
                self.deliver_char('\u{fffd}', sink);
                return;
            }
        }

        self.step(b, sink);
    }

    /// A decoded character lands in whatever the current state wants it for.
    fn deliver_char(&mut self, ch: char, sink: &mut impl FnMut(TermOp)) {
        if self.state == State::Ground {
            sink(TermOp::Print(ch));
        } else if self.state.collects_string() {
            let mut enc = [0u8; 4];
            for &eb in ch.encode_utf8(&mut enc).as_bytes() {
                self.push_string_byte(eb);
            }
        }
    }

    fn step(&mut self, b: u8, sink: &mut impl FnMut(TermOp)) {
        let tables::Step(action, next) = tables::table(self.state)[b as usize];

        // Leaving a string-collecting state emits the gathered payload,
        // except on CAN/SUB which abort it.
        if let Some(ns) = next {
            if ns != self.state && self.state.collects_string() {
                let abort = b == 0x18 || b == 0x1a;
                if !abort {
                    self.emit_string(sink);
                }
            }
        }

        match action {
            Action::Ignore => {}
            Action::Print => sink(TermOp::Print(b as char)),
            Action::Execute => self.execute(b, sink),
            Action::Collect => {
                if self.state == State::DcsEntry
                    || self.state == State::DcsParam
                    || self.state == State::DcsIntermediate
                {
                    self.push_string_byte(b);
                }
                if self.interm_len < MAX_INTERMEDIATES {
                    self.intermediates[self.interm_len] = b;
                    self.interm_len += 1;
                } else {
                    self.interm_overflow = true;
                }
            }
            Action::Private => {
                if matches!(self.state, State::DcsEntry) {
                    self.push_string_byte(b);
                }
                if self.private == 0 {
                    self.private = b;
                }
            }
            Action::Param => {
                if matches!(self.state, State::DcsEntry | State::DcsParam) {
                    self.push_string_byte(b);
                }
                self.accumulate_param(b);
            }
            Action::EscDispatch => self.esc_dispatch(b, sink),
            Action::CsiDispatch => self.csi_dispatch(b, sink),
            Action::Hook => {
                self.push_string_byte(b);
                self.dcs_final = b;
                self.dcs_data_start = self.buf.len();
            }
            Action::Put | Action::OscPut | Action::StrPut => self.push_string_byte(b),
        }

        if let Some(ns) = next {
            let entering = ns != self.state;
            self.state = ns;
            if entering {
                match ns {
                    State::Escape | State::CsiEntry | State::DcsEntry => {
                        self.clear();
                        if ns == State::DcsEntry {
                            self.buf.clear();
                            self.buf_truncated = false;
                            self.dcs_final = 0;
                            self.dcs_data_start = 0;
                        }
                    }
                    State::OscString | State::SosString | State::PmString | State::ApcString => {
                        self.buf.clear();
                        self.buf_truncated = false;
                    }
                    _ => {}
                }
            }
        }
    }

    fn clear(&mut self) {
        self.param_list.clear();
        self.cur_param.clear();
        self.cur = None;
        self.param_seen = false;
        self.interm_len = 0;
        self.interm_overflow = false;
        self.private = 0;
    }

    fn push_string_byte(&mut self, b: u8) {
        if self.buf.len() < STRING_LIMIT {
            self.buf.push(b);
        } else {
            self.buf_truncated = true;
        }
    }

    fn accumulate_param(&mut self, b: u8) {
        self.param_seen = true;
        if self.param_list.len() >= MAX_PARAMS {
            return;
        }
        match b {
            b'0'..=b'9' => {
                let d = (b - b'0') as u32;
                self.cur = Some(self.cur.unwrap_or(0).saturating_mul(10).saturating_add(d));
            }
            b':' => self.cur_param.push(self.cur.take()),
            b';' => {
                self.cur_param.push(self.cur.take());
                self.param_list.push(std::mem::take(&mut self.cur_param));
            }
            _ => {}
        }
    }

    /// Close out parameter accumulation at dispatch time.
    fn finish_params(&mut self) {
        if self.param_seen && self.param_list.len() < MAX_PARAMS {
            self.cur_param.push(self.cur.take());
            self.param_list.push(std::mem::take(&mut self.cur_param));
        }
    }

    fn param(&self, i: usize, default: u32) -> u32 {
        self.param_list
            .get(i)
            .and_then(|p| p.first().copied().flatten())
            .unwrap_or(default)
    }

    fn param_u16(&self, i: usize, default: u32) -> u16 {
        self.param(i, default).min(u16::MAX as u32) as u16
    }

    /// A count parameter: missing or zero means one.
    fn count(&self, i: usize) -> u16 {
        let n = self.param(i, 1);
        if n == 0 { 1 } else { n.min(u16::MAX as u32) as u16 }
    }

    fn execute(&mut self, b: u8, sink: &mut impl FnMut(TermOp)) {
        let op = match b {
            0x05 => Some(TermOp::Enquiry),
            0x07 => Some(TermOp::Bell),
            0x08 => Some(TermOp::Backspace),
            0x09 => Some(TermOp::Tab),
            0x0a | 0x0b | 0x0c => Some(TermOp::LineFeed),
            0x0d => Some(TermOp::CarriageReturn),
            0x0e => Some(TermOp::ShiftOut),
            0x0f => Some(TermOp::ShiftIn),
            // C1 controls arriving as raw 8-bit bytes.
            0x84 => Some(TermOp::Index),
            0x85 => Some(TermOp::NextLine),
            0x88 => Some(TermOp::TabSet),
            0x8d => Some(TermOp::ReverseIndex),
            0x8e => Some(TermOp::SingleShift(2)),
            0x8f => Some(TermOp::SingleShift(3)),
            _ => None,
        };
        if let Some(op) = op {
            sink(op);
        }
    }

    fn esc_dispatch(&mut self, b: u8, sink: &mut impl FnMut(TermOp)) {
        if self.interm_overflow {
            return;
        }
        let interm = &self.intermediates[..self.interm_len];
        let op = match (interm, b) {
            ([], b'7') => Some(TermOp::SaveCursor),
            ([], b'8') => Some(TermOp::RestoreCursor),
            ([], b'c') => Some(TermOp::FullReset),
            ([], b'D') => Some(TermOp::Index),
            ([], b'E') => Some(TermOp::NextLine),
            ([], b'H') => Some(TermOp::TabSet),
            ([], b'M') => Some(TermOp::ReverseIndex),
            ([], b'N') => Some(TermOp::SingleShift(2)),
            ([], b'O') => Some(TermOp::SingleShift(3)),
            ([], b'n') => Some(TermOp::LockingShift(2)),
            ([], b'o') => Some(TermOp::LockingShift(3)),
            ([], b'=') => Some(TermOp::KeypadApplication(true)),
            ([], b'>') => Some(TermOp::KeypadApplication(false)),
            ([], b'Z') => Some(TermOp::DeviceAttributes(0)),
            ([], b'\\') => None, // ST: any pending string already emitted
            ([b'#'], b'8') => Some(TermOp::AlignmentTest),
            ([b'%'], b'G') if self.utf8_enabled => Some(TermOp::SelectUtf8(true)),
            ([b'%'], b'@') if self.utf8_enabled => Some(TermOp::SelectUtf8(false)),
            (&[marker @ (b'(' | b')' | b'*' | b'+')], f) => {
                let slot = match marker {
                    b'(' => 0,
                    b')' => 1,
                    b'*' => 2,
                    _ => 3,
                };
                charset_94(f).map(|charset| TermOp::DesignateCharset { slot, charset })
            }
            (&[marker @ (b'-' | b'.' | b'/')], f) if (0x30..=0x7e).contains(&f) => {
                let slot = match marker {
                    b'-' => 1,
                    b'.' => 2,
                    _ => 3,
                };
                Some(TermOp::DesignateCharset { slot, charset: Charset::Iso96(f) })
            }
            _ => None,
        };
        if let Some(op) = op {
            sink(op);
        }
    }

    fn csi_dispatch(&mut self, b: u8, sink: &mut impl FnMut(TermOp)) {
        if self.interm_overflow {
            return;
        }
        self.finish_params();
        let interm = &self.intermediates[..self.interm_len];

        match (self.private, interm, b) {
            (0, [], b'@') => sink(TermOp::InsertCharacter(self.count(0))),
            (0, [], b'A') => sink(TermOp::CursorUp(self.count(0))),
            (0, [], b'B' | b'e') => sink(TermOp::CursorDown(self.count(0))),
            (0, [], b'C' | b'a') => sink(TermOp::CursorForward(self.count(0))),
            (0, [], b'D') => sink(TermOp::CursorBackward(self.count(0))),
            (0, [], b'E') => sink(TermOp::CursorNextLine(self.count(0))),
            (0, [], b'F') => sink(TermOp::CursorPreviousLine(self.count(0))),
            (0, [], b'G' | b'`') => {
                sink(TermOp::CursorHorizontalAbsolute(self.count(0)))
            }
            (0, [], b'H' | b'f') => sink(TermOp::CursorPosition {
                row: self.count(0),
                col: self.count(1),
            }),
            (0, [], b'I') => sink(TermOp::HorizontalTab(self.count(0))),
            (0, [], b'J') => {
                if let Some(mode) = EraseMode::from_param(self.param(0, 0)) {
                    sink(TermOp::EraseDisplay(mode));
                }
            }
            (0, [], b'K') => {
                if let Some(mode) = EraseMode::from_param(self.param(0, 0)) {
                    sink(TermOp::EraseLine(mode));
                }
            }
            (0, [], b'L') => sink(TermOp::InsertLine(self.count(0))),
            (0, [], b'M') => sink(TermOp::DeleteLine(self.count(0))),
            (0, [], b'P') => sink(TermOp::DeleteCharacter(self.count(0))),
            (0, [], b'S') => sink(TermOp::ScrollUp(self.count(0))),
            (0, [], b'T') => sink(TermOp::ScrollDown(self.count(0))),
            (0, [], b'X') => sink(TermOp::EraseCharacter(self.count(0))),
            (0, [], b'Z') => sink(TermOp::BackTab(self.count(0))),
            (0, [], b'c') => sink(TermOp::DeviceAttributes(self.param_u16(0, 0))),
            (b'>', [], b'c') => {
                sink(TermOp::SecondaryDeviceAttributes(self.param_u16(0, 0)))
            }
            (0, [], b'd') => sink(TermOp::CursorVerticalAbsolute(self.count(0))),
            (0, [], b'g') => sink(TermOp::TabClear(self.param_u16(0, 0))),
            (0, [], b'h') => {
                for i in 0..self.param_list.len().max(1) {
                    sink(TermOp::SetMode(self.param_u16(i, 0)));
                }
            }
            (b'?', [], b'h') => {
                for i in 0..self.param_list.len().max(1) {
                    sink(TermOp::DecPrivateSet(self.param_u16(i, 0)));
                }
            }
            (0, [], b'l') => {
                for i in 0..self.param_list.len().max(1) {
                    sink(TermOp::ResetMode(self.param_u16(i, 0)));
                }
            }
            (b'?', [], b'l') => {
                for i in 0..self.param_list.len().max(1) {
                    sink(TermOp::DecPrivateReset(self.param_u16(i, 0)));
                }
            }
            (0, [], b'm') => {
                sink(TermOp::SelectGraphicRendition(std::mem::take(
                    &mut self.param_list,
                )))
            }
            (0, [], b'n') => sink(TermOp::DeviceStatusReport(self.param_u16(0, 0))),
            (0, [b'$'], b'p') => sink(TermOp::RequestMode(self.param_u16(0, 0))),
            (b'?', [b'$'], b'p') => {
                sink(TermOp::RequestPrivateMode(self.param_u16(0, 0)))
            }
            (0, [], b'r') => sink(TermOp::SetScrollRegion {
                upper: self.count(0) - 1,
                lower: self.param_u16(1, u16::MAX as u32).saturating_sub(1),
            }),
            (0, [], b's') => sink(TermOp::SaveCursor),
            (0, [], b'u') => sink(TermOp::RestoreCursor),
            // Unknown finals are dropped silently.
            _ => {}
        }
    }

    fn emit_string(&mut self, sink: &mut impl FnMut(TermOp)) {
        let truncated = self.buf_truncated;
        let payload = std::mem::take(&mut self.buf);
        self.buf_truncated = false;
        match self.state {
            State::OscString => sink(TermOp::OperatingSystemCommand { payload, truncated }),
            State::SosString => sink(TermOp::StartOfString { payload, truncated }),
            State::PmString => sink(TermOp::PrivacyMessage { payload, truncated }),
            State::ApcString => {
                sink(TermOp::ApplicationProgramCommand { payload, truncated })
            }
            State::DcsPassthrough => {
                self.finish_params();
                if self.dcs_final == b'q' && self.interm_len == 0 && self.private == 0 {
                    let data = payload[self.dcs_data_start.min(payload.len())..].to_vec();
                    let background = self.param_u16(1, 0);
                    sink(TermOp::Sixel { payload: data, background, truncated });
                } else {
                    sink(TermOp::DeviceControlString { payload, truncated });
                }
            }
            _ => {}
        }
    }
}

fn charset_94(f: u8) -> Option<Charset> {
    match f {
        b'B' => Some(Charset::Ascii),
        b'A' => Some(Charset::Uk),
        b'0' => Some(Charset::DecGraphics),
        b'>' => Some(Charset::DecTechnical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Vec<TermOp> {
        let mut p = Parser::new(true);
        let mut out = Vec::new();
        p.advance(bytes, &mut |op| out.push(op));
        out
    }

    #[test]
    fn plain_text_prints() {
        let ops = parse(b"hi");
        assert_eq!(ops, vec![TermOp::Print('h'), TermOp::Print('i')]);
    }

    #[test]
    fn cursor_position_defaults_to_one() {
        assert_eq!(parse(b"\x1b[H"), vec![TermOp::CursorPosition { row: 1, col: 1 }]);
        assert_eq!(
            parse(b"\x1b[5;10H"),
            vec![TermOp::CursorPosition { row: 5, col: 10 }]
        );
    }

    #[test]
    fn sgr_collects_subparams() {
        let ops = parse(b"\x1b[38:2:255:128:0m");
        assert_eq!(
            ops,
            vec![TermOp::SelectGraphicRendition(vec![vec![
                Some(38),
                Some(2),
                Some(255),
                Some(128),
                Some(0)
            ]])]
        );
    }

    #[test]
    fn sgr_empty_is_empty_list() {
        assert_eq!(parse(b"\x1b[m"), vec![TermOp::SelectGraphicRendition(vec![])]);
    }

    #[test]
    fn private_modes_fan_out() {
        let ops = parse(b"\x1b[?1049;25h");
        assert_eq!(
            ops,
            vec![TermOp::DecPrivateSet(1049), TermOp::DecPrivateSet(25)]
        );
    }

    #[test]
    fn osc_terminated_by_bel_and_st() {
        let ops = parse(b"\x1b]0;title\x07");
        assert_eq!(
            ops,
            vec![TermOp::OperatingSystemCommand { payload: b"0;title".to_vec(), truncated: false }]
        );
        let ops = parse(b"\x1b]2;other\x1b\\");
        assert_eq!(
            ops,
            vec![TermOp::OperatingSystemCommand { payload: b"2;other".to_vec(), truncated: false }]
        );
    }

    #[test]
    fn can_aborts_csi_and_string() {
        assert_eq!(parse(b"\x1b[12\x18m"), vec![TermOp::Print('m')]);
        assert_eq!(parse(b"\x1b]0;junk\x18x"), vec![TermOp::Print('x')]);
    }

    #[test]
    fn c1_csi_alias() {
        let mut p = Parser::new(false);
        let mut out = Vec::new();
        p.advance(&[0x9b, b'3', b'A'], &mut |op| out.push(op));
        assert_eq!(out, vec![TermOp::CursorUp(3)]);
    }

    #[test]
    fn utf8_survives_chunk_split() {
        let mut p = Parser::new(true);
        let mut out = Vec::new();
        let bytes = "あ".as_bytes();
        p.advance(&bytes[..1], &mut |op| out.push(op));
        assert!(out.is_empty());
        p.advance(&bytes[1..], &mut |op| out.push(op));
        assert_eq!(out, vec![TermOp::Print('あ')]);
    }

    #[test]
    fn malformed_utf8_is_replacement() {
        let ops = parse(&[0xe3, b'x']);
        assert_eq!(ops, vec![TermOp::Print('\u{fffd}'), TermOp::Print('x')]);
    }

    #[test]
    fn sixel_dcs_is_recognised() {
        let ops = parse(b"\x1bP0;1;0q#0;2;0;0;0-\x1b\\");
        match &ops[0] {
            TermOp::Sixel { payload, background, truncated } => {
                assert_eq!(payload, b"#0;2;0;0;0-");
                assert_eq!(*background, 1);
                assert!(!truncated);
            }
            other => panic!("expected sixel, got {other:?}"),
        }
    }

    #[test]
    fn generic_dcs_keeps_header() {
        let ops = parse(b"\x1bP1$r0m\x1b\\");
        assert_eq!(
            ops,
            vec![TermOp::DeviceControlString { payload: b"1$r0m".to_vec(), truncated: false }]
        );
    }

    #[test]
    fn charset_designation() {
        assert_eq!(
            parse(b"\x1b(0"),
            vec![TermOp::DesignateCharset { slot: 0, charset: Charset::DecGraphics }]
        );
        assert_eq!(
            parse(b"\x1b-A"),
            vec![TermOp::DesignateCharset { slot: 1, charset: Charset::Iso96(b'A') }]
        );
    }

    #[test]
    fn params_cap_at_sixteen() {
        let mut seq = b"\x1b[".to_vec();
        for i in 0..40 {
            if i > 0 {
                seq.push(b';');
            }
            seq.extend_from_slice(b"1");
        }
        seq.push(b'm');
        let ops = parse(&seq);
        match &ops[0] {
            TermOp::SelectGraphicRendition(params) => assert_eq!(params.len(), MAX_PARAMS),
            other => panic!("expected SGR, got {other:?}"),
        }
    }

    #[test]
    fn scroll_region_parses() {
        assert_eq!(
            parse(b"\x1b[2;4r"),
            vec![TermOp::SetScrollRegion { upper: 1, lower: 3 }]
        );
    }
}
