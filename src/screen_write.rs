//! The screen-write layer: applies parser operations to a screen, enforcing
//! cursor policy, autowrap, scroll regions, and the wide/combining character
//! rules. Grid mutations go through grid_view; replies to queries are
//! buffered for the pane to write back to its pty.

use unicode_width::UnicodeWidthChar;

use crate::grid::{
    Cell, Colour, ATTR_BLINK, ATTR_BRIGHT, ATTR_DIM, ATTR_HIDDEN, ATTR_ITALICS, ATTR_REVERSE,
    ATTR_UNDERSCORE, ATTR_UNDERSCORE_2, FLAG_COMBINED, FLAG_PADDING, FLAG_SIXEL, FLAG_WIDE,
};
use crate::grid_view;
use crate::parser::ops::{Charset, EraseMode, Param, TermOp};
use crate::screen::{
    Screen, ALL_MOUSE_MODES, MODE_BRACKETPASTE, MODE_CURSOR, MODE_FOCUSON, MODE_INSERT,
    MODE_KCURSOR, MODE_KKEYPAD, MODE_MOUSE_ANY, MODE_MOUSE_BUTTON, MODE_MOUSE_SGR,
    MODE_MOUSE_STANDARD, MODE_MOUSE_UTF8, MODE_MOUSE_X10, MODE_ORIGIN, MODE_WRAP,
};
use crate::sixel;

/// Per-row damage record drained by the renderer each tick.
#[derive(Debug, Clone, Default)]
pub struct Damage {
    all: bool,
    rows: Vec<bool>,
}

impl Damage {
    pub fn new(sy: u16) -> Self {
        Damage { all: true, rows: vec![false; sy as usize] }
    }

    pub fn mark_all(&mut self) {
        self.all = true;
    }

    pub fn mark_row(&mut self, y: u16) {
        if let Some(r) = self.rows.get_mut(y as usize) {
            *r = true;
        }
    }

    fn mark_rows(&mut self, y: u16, ny: u16) {
        for yy in y..y.saturating_add(ny) {
            self.mark_row(yy);
        }
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    pub fn row_dirty(&self, y: u16) -> bool {
        self.all || self.rows.get(y as usize).copied().unwrap_or(false)
    }

    pub fn any(&self) -> bool {
        self.all || self.rows.iter().any(|r| *r)
    }

    pub fn clear(&mut self) {
        self.all = false;
        self.rows.iter_mut().for_each(|r| *r = false);
    }

    pub fn resize(&mut self, sy: u16) {
        self.rows = vec![false; sy as usize];
        self.all = true;
    }
}

/// Persistent writer state for one pane: the pen, charset slots, the delayed
/// wrap flag, buffered query replies, and alert markers.
pub struct ScreenWriter {
    /// The pen: attributes applied to the next printed cell.
    pub cell: Cell,
    charsets: [Charset; 4],
    gl: usize,
    single_shift: Option<usize>,
    wrap_pending: bool,
    /// Replies (DSR, DA, DECRPM) waiting to be written to the pty.
    pub responses: Vec<u8>,
    /// A BEL arrived since the alert was last drained.
    pub bell: bool,
    /// The screen title changed since the last render.
    pub title_dirty: bool,
    pub damage: Damage,
}

impl ScreenWriter {
    pub fn new(sy: u16) -> Self {
        ScreenWriter {
            cell: Cell::default(),
            charsets: [Charset::Ascii; 4],
            gl: 0,
            single_shift: None,
            wrap_pending: false,
            responses: Vec::new(),
            bell: false,
            title_dirty: false,
            damage: Damage::new(sy),
        }
    }

    pub fn apply(&mut self, s: &mut Screen, op: &TermOp) {
        match op {
            TermOp::Print(ch) => self.print(s, *ch),

            TermOp::Bell => self.bell = true,
            TermOp::Backspace => {
                self.wrap_pending = false;
                if s.cx > 0 {
                    s.cx -= 1;
                }
            }
            TermOp::Tab => {
                self.wrap_pending = false;
                s.cx = s.next_tab(s.cx);
            }
            TermOp::LineFeed => self.linefeed(s, false),
            TermOp::CarriageReturn => {
                self.wrap_pending = false;
                s.cx = 0;
            }
            // ENQ: the answerback string, which is empty here.
            TermOp::Enquiry => {}
            TermOp::ShiftIn => self.gl = 0,
            TermOp::ShiftOut => self.gl = 1,

            TermOp::CursorUp(n) => {
                self.wrap_pending = false;
                let n = (*n).min(s.cy);
                s.cy -= n;
            }
            TermOp::CursorDown(n) => {
                self.wrap_pending = false;
                let max = s.sy() - 1 - s.cy;
                s.cy += (*n).min(max);
            }
            TermOp::CursorForward(n) => {
                self.wrap_pending = false;
                let max = s.sx() - 1 - s.cx;
                s.cx += (*n).min(max);
            }
            TermOp::CursorBackward(n) => {
                self.wrap_pending = false;
                let n = (*n).min(s.cx);
                s.cx -= n;
            }
            TermOp::CursorNextLine(n) => {
                self.wrap_pending = false;
                let max = s.sy() - 1 - s.cy;
                s.cy += (*n).min(max);
                s.cx = 0;
            }
            TermOp::CursorPreviousLine(n) => {
                self.wrap_pending = false;
                let n = (*n).min(s.cy);
                s.cy -= n;
                s.cx = 0;
            }
            TermOp::CursorHorizontalAbsolute(n) => {
                self.wrap_pending = false;
                s.cx = (n - 1).min(s.sx() - 1);
            }
            TermOp::CursorVerticalAbsolute(n) => {
                self.wrap_pending = false;
                s.cy = self.clamp_row(s, *n - 1);
            }
            TermOp::CursorPosition { row, col } => {
                self.wrap_pending = false;
                s.cy = self.clamp_row(s, *row - 1);
                s.cx = (*col - 1).min(s.sx() - 1);
            }
            TermOp::HorizontalTab(n) => {
                self.wrap_pending = false;
                for _ in 0..*n {
                    s.cx = s.next_tab(s.cx);
                }
            }
            TermOp::BackTab(n) => {
                self.wrap_pending = false;
                for _ in 0..*n {
                    s.cx = s.prev_tab(s.cx);
                }
            }
            TermOp::Index => self.linefeed(s, false),
            TermOp::NextLine => {
                self.linefeed(s, false);
                s.cx = 0;
            }
            TermOp::ReverseIndex => {
                self.wrap_pending = false;
                if s.cy == s.rupper {
                    s.invalidate_selection(s.rupper, s.rlower - s.rupper + 1);
                    let (rupper, rlower) = (s.rupper, s.rlower);
                    grid_view::scroll_region_down(s.grid_mut(), rupper, rlower);
                    self.damage.mark_rows(s.rupper, s.rlower - s.rupper + 1);
                } else if s.cy > 0 {
                    s.cy -= 1;
                }
            }

            TermOp::EraseLine(mode) => self.erase_line(s, *mode),
            TermOp::EraseDisplay(mode) => self.erase_display(s, *mode),
            TermOp::EraseCharacter(n) => {
                self.wrap_pending = false;
                let nx = (*n).min(s.sx() - s.cx);
                s.invalidate_selection(s.cy, 1);
                let (cx, cy) = (s.cx, s.cy);
                grid_view::clear(s.grid_mut(), cx, cy, nx, 1);
                self.damage.mark_row(s.cy);
            }

            TermOp::InsertLine(n) => self.insert_line(s, *n),
            TermOp::DeleteLine(n) => self.delete_line(s, *n),
            TermOp::InsertCharacter(n) => {
                self.wrap_pending = false;
                let nx = (*n).min(s.sx() - 1 - s.cx);
                if nx > 0 {
                    s.invalidate_selection(s.cy, 1);
                    let (cx, cy) = (s.cx, s.cy);
                    grid_view::insert_cells(s.grid_mut(), cx, cy, nx);
                    self.damage.mark_row(s.cy);
                }
            }
            TermOp::DeleteCharacter(n) => {
                self.wrap_pending = false;
                let nx = (*n).min(s.sx() - 1 - s.cx);
                if nx > 0 {
                    s.invalidate_selection(s.cy, 1);
                    let (cx, cy) = (s.cx, s.cy);
                    grid_view::delete_cells(s.grid_mut(), cx, cy, nx);
                    self.damage.mark_row(s.cy);
                }
            }
            TermOp::ScrollUp(n) => {
                self.wrap_pending = false;
                s.invalidate_selection(s.rupper, s.rlower - s.rupper + 1);
                let (rupper, rlower) = (s.rupper, s.rlower);
                for _ in 0..*n {
                    grid_view::scroll_region_up(s.grid_mut(), rupper, rlower);
                }
                self.damage.mark_rows(s.rupper, s.rlower - s.rupper + 1);
            }
            TermOp::ScrollDown(n) => {
                self.wrap_pending = false;
                s.invalidate_selection(s.rupper, s.rlower - s.rupper + 1);
                let (rupper, rlower) = (s.rupper, s.rlower);
                for _ in 0..*n {
                    grid_view::scroll_region_down(s.grid_mut(), rupper, rlower);
                }
                self.damage.mark_rows(s.rupper, s.rlower - s.rupper + 1);
            }
            TermOp::SetScrollRegion { upper, lower } => {
                self.wrap_pending = false;
                let upper = (*upper).min(s.sy() - 1);
                let lower = (*lower).min(s.sy() - 1);
                if upper < lower {
                    s.rupper = upper;
                    s.rlower = lower;
                    s.cx = 0;
                    s.cy = if s.mode & MODE_ORIGIN != 0 { upper } else { 0 };
                }
            }

            TermOp::SelectGraphicRendition(params) => self.apply_sgr(params),

            TermOp::SetMode(code) => self.ansi_mode(s, *code, true),
            TermOp::ResetMode(code) => self.ansi_mode(s, *code, false),
            TermOp::DecPrivateSet(code) => self.dec_mode(s, *code, true),
            TermOp::DecPrivateReset(code) => self.dec_mode(s, *code, false),
            TermOp::RequestMode(code) => {
                let value = match *code {
                    4 => mode_value(s.mode & MODE_INSERT != 0),
                    _ => 0,
                };
                self.responses
                    .extend_from_slice(format!("\x1b[{};{}$y", code, value).as_bytes());
            }
            TermOp::RequestPrivateMode(code) => {
                let value = match *code {
                    1 => mode_value(s.mode & MODE_KCURSOR != 0),
                    7 => mode_value(s.mode & MODE_WRAP != 0),
                    25 => mode_value(s.mode & MODE_CURSOR != 0),
                    1000 => mode_value(s.mode & MODE_MOUSE_STANDARD != 0),
                    1002 => mode_value(s.mode & MODE_MOUSE_BUTTON != 0),
                    1003 => mode_value(s.mode & MODE_MOUSE_ANY != 0),
                    1006 => mode_value(s.mode & MODE_MOUSE_SGR != 0),
                    1049 => mode_value(s.alternate_on()),
                    2004 => mode_value(s.mode & MODE_BRACKETPASTE != 0),
                    _ => 0,
                };
                self.responses
                    .extend_from_slice(format!("\x1b[?{};{}$y", code, value).as_bytes());
            }

            TermOp::OperatingSystemCommand { payload, .. } => self.osc(s, payload),
            TermOp::DeviceControlString { .. }
            | TermOp::ApplicationProgramCommand { .. }
            | TermOp::PrivacyMessage { .. }
            | TermOp::StartOfString { .. } => {}

            TermOp::Sixel { payload, background, .. } => {
                self.sixel(s, payload, *background)
            }

            TermOp::DesignateCharset { slot, charset } => {
                self.charsets[*slot as usize] = *charset;
            }
            TermOp::LockingShift(n) => self.gl = *n as usize,
            TermOp::SingleShift(n) => self.single_shift = Some(*n as usize),
            TermOp::SelectUtf8(_) => {}

            TermOp::DeviceAttributes(_) => {
                self.responses.extend_from_slice(b"\x1b[?1;2c");
            }
            TermOp::SecondaryDeviceAttributes(_) => {
                self.responses.extend_from_slice(b"\x1b[>84;0;0c");
            }
            TermOp::DeviceStatusReport(what) => match *what {
                5 => self.responses.extend_from_slice(b"\x1b[0n"),
                6 => {
                    let row = if s.mode & MODE_ORIGIN != 0 { s.cy - s.rupper } else { s.cy };
                    self.responses
                        .extend_from_slice(format!("\x1b[{};{}R", row + 1, s.cx + 1).as_bytes());
                }
                _ => {}
            },

            TermOp::SaveCursor => {
                s.saved_cx = s.cx;
                s.saved_cy = s.cy;
                s.saved_cell = self.cell;
            }
            TermOp::RestoreCursor => {
                s.cx = s.saved_cx.min(s.sx() - 1);
                s.cy = s.saved_cy.min(s.sy() - 1);
                self.cell = s.saved_cell;
                self.wrap_pending = false;
            }
            TermOp::TabSet => s.set_tab(s.cx),
            TermOp::TabClear(mode) => match mode {
                0 => s.clear_tab(s.cx),
                3 => s.clear_tabs(),
                _ => {}
            },
            TermOp::KeypadApplication(on) => {
                set_mode_bit(s, MODE_KKEYPAD, *on);
            }
            TermOp::AlignmentTest => {
                self.wrap_pending = false;
                let cell = Cell { data: crate::grid::CellData::from_char('E'), ..Cell::default() };
                for y in 0..s.sy() {
                    for x in 0..s.sx() {
                        grid_view::set_cell(s.grid_mut(), x, y, cell);
                    }
                }
                s.clear_selection();
                self.damage.mark_all();
            }
            TermOp::FullReset => self.full_reset(s),
        }
    }

    fn clamp_row(&self, s: &Screen, row: u16) -> u16 {
        if s.mode & MODE_ORIGIN != 0 {
            (s.rupper + row).min(s.rlower)
        } else {
            row.min(s.sy() - 1)
        }
    }

    fn linefeed(&mut self, s: &mut Screen, wrapped: bool) {
        self.wrap_pending = false;
        if wrapped {
            let cy = s.cy;
            grid_view::set_line_wrapped(s.grid_mut(), cy, true);
        }
        if s.cy == s.rlower {
            s.invalidate_selection(s.rupper, s.rlower - s.rupper + 1);
            let (rupper, rlower) = (s.rupper, s.rlower);
            grid_view::scroll_region_up(s.grid_mut(), rupper, rlower);
            self.damage.mark_rows(s.rupper, s.rlower - s.rupper + 1);
        } else if s.cy < s.sy() - 1 {
            s.cy += 1;
        }
    }

    fn print(&mut self, s: &mut Screen, ch: char) {
        let ch = self.map_charset(ch);
        let width = ch.width().unwrap_or(0) as u16;

        // Width zero: combine into the previously written cell.
        if width == 0 {
            let (tx, ty) = if self.wrap_pending {
                (s.sx() - 1, s.cy)
            } else if s.cx > 0 {
                (s.cx - 1, s.cy)
            } else {
                return;
            };
            // Skip back over padding to the owning wide cell.
            let mut tx = tx;
            while tx > 0 && grid_view::peek(s.grid(), tx, ty).flags & FLAG_PADDING != 0 {
                tx -= 1;
            }
            if let Some(cell) = grid_view::get(s.grid_mut(), tx, ty) {
                if cell.data.combine(ch) {
                    cell.flags |= FLAG_COMBINED;
                }
            }
            self.damage.mark_row(ty);
            return;
        }

        // Wider than the screen: print a placeholder instead.
        let (ch, width) = if width > s.sx() { ('_', 1) } else { (ch, width) };

        if self.wrap_pending {
            if s.mode & MODE_WRAP != 0 {
                let cy = s.cy;
                grid_view::set_line_wrapped(s.grid_mut(), cy, true);
                self.linefeed(s, true);
                s.cx = 0;
            }
            self.wrap_pending = false;
        }

        // A wide character that no longer fits forces an early wrap.
        if s.cx + width > s.sx() {
            if s.mode & MODE_WRAP != 0 {
                let cy = s.cy;
                grid_view::set_line_wrapped(s.grid_mut(), cy, true);
                self.linefeed(s, true);
                s.cx = 0;
            } else {
                s.cx = s.sx() - width;
            }
        }

        if s.mode & MODE_INSERT != 0 {
            let nx = width.min(s.sx() - 1 - s.cx);
            if nx > 0 {
                let (cx, cy) = (s.cx, s.cy);
                grid_view::insert_cells(s.grid_mut(), cx, cy, nx);
            }
        }

        self.overwrite(s);

        s.invalidate_selection(s.cy, 1);
        let cell = Cell {
            data: crate::grid::CellData::from_char(ch),
            attr: self.cell.attr,
            flags: if width > 1 { FLAG_WIDE } else { 0 },
            fg: self.cell.fg,
            bg: self.cell.bg,
        };
        let (x0, cy) = (s.cx, s.cy);
        grid_view::set_cell(s.grid_mut(), x0, cy, cell);
        for xx in x0 + 1..x0 + width {
            let mut pad = Cell::padding();
            pad.fg = self.cell.fg;
            pad.bg = self.cell.bg;
            grid_view::set_cell(s.grid_mut(), xx, cy, pad);
        }
        self.damage.mark_row(cy);

        self.single_shift = None;

        let end = x0 + width;
        if end >= s.sx() {
            s.cx = s.sx() - 1;
            self.wrap_pending = s.mode & MODE_WRAP != 0;
        } else {
            s.cx = end;
        }
    }

    /// Writing over half of a wide character releases the whole character:
    /// the other half becomes a space.
    fn overwrite(&mut self, s: &mut Screen) {
        let (cx, cy) = (s.cx, s.cy);
        let gc = grid_view::peek(s.grid(), cx, cy);
        if gc.flags & FLAG_PADDING != 0 {
            // Clear padding back to the owning cell, the cell itself, and
            // any padding that follows.
            let mut xx = cx;
            while xx > 0 {
                xx -= 1;
                let c = grid_view::peek(s.grid(), xx, cy);
                let is_pad = c.flags & FLAG_PADDING != 0;
                grid_view::set_cell(s.grid_mut(), xx, cy, Cell::default());
                if !is_pad {
                    break;
                }
            }
            let mut xx = cx + 1;
            while xx < s.sx() {
                if grid_view::peek(s.grid(), xx, cy).flags & FLAG_PADDING == 0 {
                    break;
                }
                grid_view::set_cell(s.grid_mut(), xx, cy, Cell::default());
                xx += 1;
            }
        } else if gc.flags & FLAG_WIDE != 0 {
            // Overwriting the left half: release the padding to the right.
            let mut xx = cx + 1;
            while xx < s.sx() {
                if grid_view::peek(s.grid(), xx, cy).flags & FLAG_PADDING == 0 {
                    break;
                }
                grid_view::set_cell(s.grid_mut(), xx, cy, Cell::default());
                xx += 1;
            }
        }
    }

    fn map_charset(&mut self, ch: char) -> char {
        let slot = self.single_shift.unwrap_or(self.gl);
        match self.charsets.get(slot).copied().unwrap_or(Charset::Ascii) {
            Charset::Ascii => ch,
            Charset::Uk => {
                if ch == '#' {
                    '£'
                } else {
                    ch
                }
            }
            Charset::DecGraphics => acs_map(ch),
            Charset::DecTechnical | Charset::Iso96(_) => ch,
        }
    }

    fn erase_line(&mut self, s: &mut Screen, mode: EraseMode) {
        self.wrap_pending = false;
        s.invalidate_selection(s.cy, 1);
        let (sx, cx, cy) = (s.sx(), s.cx, s.cy);
        match mode {
            EraseMode::ToEnd => grid_view::clear(s.grid_mut(), cx, cy, sx - cx, 1),
            EraseMode::FromStart => {
                grid_view::clear(s.grid_mut(), 0, cy, (cx + 1).min(sx), 1)
            }
            EraseMode::All | EraseMode::Scrollback => {
                grid_view::clear(s.grid_mut(), 0, cy, sx, 1)
            }
        }
        self.damage.mark_row(cy);
    }

    fn erase_display(&mut self, s: &mut Screen, mode: EraseMode) {
        self.wrap_pending = false;
        let (sx, sy, cx, cy) = (s.sx(), s.sy(), s.cx, s.cy);
        match mode {
            EraseMode::ToEnd => {
                s.invalidate_selection(cy, sy - cy);
                grid_view::clear(s.grid_mut(), cx, cy, sx - cx, 1);
                if cy + 1 < sy {
                    grid_view::clear(s.grid_mut(), 0, cy + 1, sx, sy - cy - 1);
                }
            }
            EraseMode::FromStart => {
                s.invalidate_selection(0, cy + 1);
                if cy > 0 {
                    grid_view::clear(s.grid_mut(), 0, 0, sx, cy);
                }
                grid_view::clear(s.grid_mut(), 0, cy, (cx + 1).min(sx), 1);
            }
            EraseMode::All => {
                s.clear_selection();
                grid_view::clear(s.grid_mut(), 0, 0, sx, sy);
            }
            EraseMode::Scrollback => {
                s.grid_mut().clear_history();
            }
        }
        self.damage.mark_all();
    }

    fn insert_line(&mut self, s: &mut Screen, n: u16) {
        self.wrap_pending = false;
        if s.cy < s.rupper || s.cy > s.rlower {
            return;
        }
        let space = s.rlower + 1 - s.cy;
        let ny = n.min(space);
        if ny == 0 {
            return;
        }
        s.invalidate_selection(s.cy, s.rlower - s.cy + 1);
        let (rlower, cy) = (s.rlower, s.cy);
        grid_view::insert_lines(s.grid_mut(), rlower, cy, ny);
        self.damage.mark_rows(cy, rlower - cy + 1);
    }

    fn delete_line(&mut self, s: &mut Screen, n: u16) {
        self.wrap_pending = false;
        if s.cy < s.rupper || s.cy > s.rlower {
            return;
        }
        let space = s.rlower + 1 - s.cy;
        let ny = n.min(space);
        if ny == 0 {
            return;
        }
        s.invalidate_selection(s.cy, s.rlower - s.cy + 1);
        let (rlower, cy) = (s.rlower, s.cy);
        grid_view::delete_lines(s.grid_mut(), rlower, cy, ny);
        self.damage.mark_rows(cy, rlower - cy + 1);
    }

    fn ansi_mode(&mut self, s: &mut Screen, code: u16, on: bool) {
        if code == 4 {
            set_mode_bit(s, MODE_INSERT, on);
        }
    }

    fn dec_mode(&mut self, s: &mut Screen, code: u16, on: bool) {
        match code {
            1 => set_mode_bit(s, MODE_KCURSOR, on),
            6 => {
                set_mode_bit(s, MODE_ORIGIN, on);
                s.cx = 0;
                s.cy = if on { s.rupper } else { 0 };
            }
            7 => {
                set_mode_bit(s, MODE_WRAP, on);
                if !on {
                    self.wrap_pending = false;
                }
            }
            9 => self.mouse_mode(s, MODE_MOUSE_X10, on),
            25 => set_mode_bit(s, MODE_CURSOR, on),
            47 | 1047 => {
                if on {
                    s.alternate_enter(self.cell);
                } else if let Some(cell) = s.alternate_exit() {
                    self.cell = cell;
                }
                self.damage.mark_all();
            }
            1000 => self.mouse_mode(s, MODE_MOUSE_STANDARD, on),
            1002 => self.mouse_mode(s, MODE_MOUSE_BUTTON, on),
            1003 => self.mouse_mode(s, MODE_MOUSE_ANY, on),
            1004 => set_mode_bit(s, MODE_FOCUSON, on),
            1005 => set_mode_bit(s, MODE_MOUSE_UTF8, on),
            1006 => set_mode_bit(s, MODE_MOUSE_SGR, on),
            1048 => {
                if on {
                    s.saved_cx = s.cx;
                    s.saved_cy = s.cy;
                    s.saved_cell = self.cell;
                } else {
                    s.cx = s.saved_cx.min(s.sx() - 1);
                    s.cy = s.saved_cy.min(s.sy() - 1);
                    self.cell = s.saved_cell;
                }
            }
            1049 => {
                if on {
                    s.saved_cx = s.cx;
                    s.saved_cy = s.cy;
                    s.saved_cell = self.cell;
                    s.alternate_enter(self.cell);
                    s.cx = 0;
                    s.cy = 0;
                } else {
                    if let Some(cell) = s.alternate_exit() {
                        self.cell = cell;
                    }
                    s.cx = s.saved_cx.min(s.sx() - 1);
                    s.cy = s.saved_cy.min(s.sy() - 1);
                }
                self.wrap_pending = false;
                self.damage.mark_all();
            }
            2004 => set_mode_bit(s, MODE_BRACKETPASTE, on),
            _ => {}
        }
    }

    fn mouse_mode(&mut self, s: &mut Screen, bit: u32, on: bool) {
        if on {
            s.mode &= !ALL_MOUSE_MODES;
            s.mode |= bit;
        } else {
            s.mode &= !bit;
        }
    }

    fn osc(&mut self, s: &mut Screen, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let (code, rest) = match text.split_once(';') {
            Some((c, r)) => (c, r),
            None => (text.as_ref(), ""),
        };
        match code {
            "0" | "1" | "2" => {
                if s.title != rest {
                    s.title = rest.to_string();
                    self.title_dirty = true;
                }
            }
            _ => {}
        }
    }

    fn sixel(&mut self, s: &mut Screen, payload: &[u8], background: u16) {
        let image = match sixel::SixelImage::parse(payload, background != 1) {
            Some(img) => img,
            None => return,
        };
        let (_cols, rows) = image.cell_size();
        let (px, py) = (s.cx, s.cy);
        if let Some(cell) = grid_view::get(s.grid_mut(), px, py) {
            cell.flags |= FLAG_SIXEL;
        }
        s.images.push(crate::screen::ImagePlacement { px, py, image });
        // The cursor lands on the line following the image.
        for _ in 0..rows.min(s.sy() as u32) {
            self.linefeed(s, false);
        }
        s.cx = 0;
        self.damage.mark_all();
    }

    fn apply_sgr(&mut self, params: &[Param]) {
        if params.is_empty() {
            self.cell = Cell::default();
            return;
        }
        let mut i = 0;
        while i < params.len() {
            let parts = &params[i];
            let n = parts.first().copied().flatten().unwrap_or(0);
            // Colon sub-parameter forms carry everything in one entry.
            if parts.len() > 1 {
                match n {
                    4 => {
                        let kind = parts.get(1).copied().flatten().unwrap_or(1);
                        self.cell.attr &= !(ATTR_UNDERSCORE | ATTR_UNDERSCORE_2);
                        match kind {
                            0 => {}
                            2 => self.cell.attr |= ATTR_UNDERSCORE_2,
                            _ => self.cell.attr |= ATTR_UNDERSCORE,
                        }
                    }
                    38 | 48 => {
                        if let Some(colour) = colour_from_parts(&parts[1..]) {
                            if n == 38 {
                                self.cell.fg = colour;
                            } else {
                                self.cell.bg = colour;
                            }
                        }
                    }
                    _ => {}
                }
                i += 1;
                continue;
            }
            match n {
                0 => self.cell = Cell::default(),
                1 => self.cell.attr |= ATTR_BRIGHT,
                2 => self.cell.attr |= ATTR_DIM,
                3 => self.cell.attr |= ATTR_ITALICS,
                4 => self.cell.attr |= ATTR_UNDERSCORE,
                5 => self.cell.attr |= ATTR_BLINK,
                7 => self.cell.attr |= ATTR_REVERSE,
                8 => self.cell.attr |= ATTR_HIDDEN,
                21 => self.cell.attr |= ATTR_UNDERSCORE_2,
                22 => self.cell.attr &= !(ATTR_BRIGHT | ATTR_DIM),
                23 => self.cell.attr &= !ATTR_ITALICS,
                24 => self.cell.attr &= !(ATTR_UNDERSCORE | ATTR_UNDERSCORE_2),
                25 => self.cell.attr &= !ATTR_BLINK,
                27 => self.cell.attr &= !ATTR_REVERSE,
                28 => self.cell.attr &= !ATTR_HIDDEN,
                30..=37 => self.cell.fg = Colour::Indexed(n as u8 - 30),
                39 => self.cell.fg = Colour::Default,
                40..=47 => self.cell.bg = Colour::Indexed(n as u8 - 40),
                49 => self.cell.bg = Colour::Default,
                90..=97 => self.cell.fg = Colour::Indexed(n as u8 - 90 + 8),
                100..=107 => self.cell.bg = Colour::Indexed(n as u8 - 100 + 8),
                38 | 48 => {
                    // Semicolon form: the colour spec is spread over the
                    // following parameters.
                    let kind = params
                        .get(i + 1)
                        .and_then(|p| p.first().copied().flatten())
                        .unwrap_or(0);
                    let consumed = match kind {
                        2 => {
                            let r = params.get(i + 2).and_then(|p| p.first().copied().flatten());
                            let g = params.get(i + 3).and_then(|p| p.first().copied().flatten());
                            let b = params.get(i + 4).and_then(|p| p.first().copied().flatten());
                            if let (Some(r), Some(g), Some(b)) = (r, g, b) {
                                let colour = Colour::Rgb(r as u8, g as u8, b as u8);
                                if n == 38 {
                                    self.cell.fg = colour;
                                } else {
                                    self.cell.bg = colour;
                                }
                            }
                            4
                        }
                        5 => {
                            if let Some(idx) =
                                params.get(i + 2).and_then(|p| p.first().copied().flatten())
                            {
                                let colour = Colour::Indexed(idx as u8);
                                if n == 38 {
                                    self.cell.fg = colour;
                                } else {
                                    self.cell.bg = colour;
                                }
                            }
                            2
                        }
                        _ => 0,
                    };
                    i += consumed;
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn full_reset(&mut self, s: &mut Screen) {
        let _ = s.alternate_exit();
        self.cell = Cell::default();
        self.charsets = [Charset::Ascii; 4];
        self.gl = 0;
        self.single_shift = None;
        self.wrap_pending = false;
        s.cx = 0;
        s.cy = 0;
        s.rupper = 0;
        s.rlower = s.sy() - 1;
        s.mode = MODE_CURSOR | MODE_WRAP;
        s.clear_selection();
        let (sx, sy) = (s.sx(), s.sy());
        grid_view::clear(s.grid_mut(), 0, 0, sx, sy);
        self.damage.mark_all();
    }
}

fn set_mode_bit(s: &mut Screen, bit: u32, on: bool) {
    if on {
        s.mode |= bit;
    } else {
        s.mode &= !bit;
    }
}

fn mode_value(set: bool) -> u16 {
    if set {
        1
    } else {
        2
    }
}

fn colour_from_parts(parts: &[Option<u32>]) -> Option<Colour> {
    match parts.first().copied().flatten()? {
        2 => {
            // 38:2:r:g:b or 38:2:colourspace:r:g:b.
            let vals: Vec<u32> = parts[1..].iter().map(|p| p.unwrap_or(0)).collect();
            match vals.as_slice() {
                [r, g, b] => Some(Colour::Rgb(*r as u8, *g as u8, *b as u8)),
                [_, r, g, b, ..] => Some(Colour::Rgb(*r as u8, *g as u8, *b as u8)),
                _ => None,
            }
        }
        5 => parts
            .get(1)
            .copied()
            .flatten()
            .map(|idx| Colour::Indexed(idx as u8)),
        _ => None,
    }
}

/// DEC line-drawing set, the subset applications actually use.
fn acs_map(ch: char) -> char {
    match ch {
        'j' => '┘',
        'k' => '┐',
        'l' => '┌',
        'm' => '└',
        'n' => '┼',
        'q' => '─',
        't' => '├',
        'u' => '┤',
        'v' => '┴',
        'w' => '┬',
        'x' => '│',
        '~' => '·',
        'a' => '▒',
        'f' => '°',
        'g' => '±',
        'o' => '⎺',
        's' => '⎽',
        '0' => '█',
        _ => ch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn feed(s: &mut Screen, w: &mut ScreenWriter, bytes: &[u8]) {
        let mut parser = Parser::new(true);
        let mut ops = Vec::new();
        parser.advance(bytes, &mut |op| ops.push(op));
        for op in &ops {
            w.apply(s, op);
        }
    }

    fn row_text(s: &Screen, y: u16) -> String {
        let mut out = String::new();
        let mut x = 0;
        while x < s.sx() {
            let c = grid_view::peek(s.grid(), x, y);
            if c.flags & FLAG_PADDING == 0 {
                out.push_str(c.data.as_str());
            }
            x += 1;
        }
        out.trim_end().to_string()
    }

    #[test]
    fn basic_print_and_wrap() {
        // Scenario: 10x3, "hello world!" wraps onto the second row.
        let mut s = Screen::new(10, 3, 0);
        let mut w = ScreenWriter::new(3);
        feed(&mut s, &mut w, b"hello world!");
        assert_eq!(row_text(&s, 0), "hello worl");
        assert_eq!(row_text(&s, 1), "d!");
        assert_eq!((s.cx, s.cy), (2, 1));
        assert!(grid_view::line_wrapped(s.grid(), 0));
    }

    #[test]
    fn scroll_region_linefeed() {
        let mut s = Screen::new(10, 5, 0);
        let mut w = ScreenWriter::new(5);
        for y in 0..5u16 {
            feed(&mut s, &mut w, format!("\x1b[{};1Hline{}", y + 1, y).as_bytes());
        }
        // Region rows 1..3, cursor to last region row, then LF.
        feed(&mut s, &mut w, b"\x1b[2;4r\x1b[4;1H\n");
        assert_eq!(row_text(&s, 0), "line0");
        assert_eq!(row_text(&s, 1), "line2");
        assert_eq!(row_text(&s, 2), "line3");
        assert_eq!(row_text(&s, 3), "");
        assert_eq!(row_text(&s, 4), "line4");
    }

    #[test]
    fn sgr_truecolour() {
        let mut s = Screen::new(10, 3, 0);
        let mut w = ScreenWriter::new(3);
        feed(&mut s, &mut w, b"\x1b[38;2;255;128;0;48;2;0;0;0mX");
        let c = grid_view::peek(s.grid(), 0, 0);
        assert_eq!(c.fg, Colour::Rgb(255, 128, 0));
        assert_eq!(c.bg, Colour::Rgb(0, 0, 0));
        assert_eq!(c.attr, 0);
    }

    #[test]
    fn alt_screen_round_trip() {
        let mut s = Screen::new(10, 3, 50);
        let mut w = ScreenWriter::new(3);
        feed(&mut s, &mut w, b"base");
        feed(&mut s, &mut w, b"\x1b[?1049h");
        assert!(s.alternate_on());
        feed(&mut s, &mut w, b"ABC");
        assert_eq!(row_text(&s, 0), "ABC");
        feed(&mut s, &mut w, b"\x1b[?1049l");
        assert!(!s.alternate_on());
        assert_eq!(row_text(&s, 0), "base");
        assert_eq!((s.cx, s.cy), (4, 0));
    }

    #[test]
    fn wide_char_overwrite_releases_partner() {
        // Scenario: write wide at column 0, then ASCII at column 1.
        let mut s = Screen::new(5, 2, 0);
        let mut w = ScreenWriter::new(2);
        feed(&mut s, &mut w, "あ".as_bytes());
        assert!(grid_view::peek(s.grid(), 0, 0).flags & FLAG_WIDE != 0);
        assert!(grid_view::peek(s.grid(), 1, 0).flags & FLAG_PADDING != 0);
        feed(&mut s, &mut w, b"\x1b[1;2H!");
        assert_eq!(grid_view::peek(s.grid(), 0, 0).data.as_str(), " ");
        assert_eq!(grid_view::peek(s.grid(), 1, 0).data.as_str(), "!");
        assert!(grid_view::peek(s.grid(), 0, 0).flags & FLAG_WIDE == 0);
    }

    #[test]
    fn combining_mark_joins_previous_cell() {
        let mut s = Screen::new(10, 2, 0);
        let mut w = ScreenWriter::new(2);
        feed(&mut s, &mut w, "e\u{0301}".as_bytes());
        let c = grid_view::peek(s.grid(), 0, 0);
        assert_eq!(c.data.as_str(), "e\u{0301}");
        assert!(c.flags & FLAG_COMBINED != 0);
        assert_eq!(s.cx, 1);
    }

    #[test]
    fn insert_mode_shifts_right() {
        let mut s = Screen::new(10, 2, 0);
        let mut w = ScreenWriter::new(2);
        feed(&mut s, &mut w, b"abc\x1b[1;1H\x1b[4hX");
        assert_eq!(row_text(&s, 0), "Xabc");
    }

    #[test]
    fn origin_mode_clamps_to_region() {
        let mut s = Screen::new(10, 6, 0);
        let mut w = ScreenWriter::new(6);
        feed(&mut s, &mut w, b"\x1b[2;4r\x1b[?6h\x1b[1;1HX");
        assert_eq!(row_text(&s, 1), "X");
        feed(&mut s, &mut w, b"\x1b[99;1HY");
        assert_eq!(row_text(&s, 3), "Y");
    }

    #[test]
    fn cursor_position_report() {
        let mut s = Screen::new(10, 5, 0);
        let mut w = ScreenWriter::new(5);
        feed(&mut s, &mut w, b"\x1b[3;4H\x1b[6n");
        assert_eq!(w.responses, b"\x1b[3;4R");
    }

    #[test]
    fn osc_sets_title() {
        let mut s = Screen::new(10, 5, 0);
        let mut w = ScreenWriter::new(5);
        feed(&mut s, &mut w, b"\x1b]2;hello\x07");
        assert_eq!(s.title, "hello");
        assert!(w.title_dirty);
    }

    #[test]
    fn dec_graphics_charset_maps_lines() {
        let mut s = Screen::new(10, 2, 0);
        let mut w = ScreenWriter::new(2);
        feed(&mut s, &mut w, b"\x1b(0qx\x1b(Bq");
        assert_eq!(grid_view::peek(s.grid(), 0, 0).data.as_str(), "─");
        assert_eq!(grid_view::peek(s.grid(), 1, 0).data.as_str(), "│");
        assert_eq!(grid_view::peek(s.grid(), 2, 0).data.as_str(), "q");
    }

    #[test]
    fn erase_scrollback_only_clears_history() {
        let mut s = Screen::new(4, 2, 50);
        let mut w = ScreenWriter::new(2);
        feed(&mut s, &mut w, b"a\r\nb\r\nc\r\nd");
        assert!(s.hsize() > 0);
        feed(&mut s, &mut w, b"\x1b[3J");
        assert_eq!(s.hsize(), 0);
        assert_eq!(row_text(&s, 0), "c");
    }
}
