//! The output driver for one attached client's terminal. Buffers bytes
//! until the descriptor is writable, tracks the terminal's cursor and pen
//! so redundant escapes are skipped, and degrades colour output to what the
//! client's capability flags allow.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::grid::{
    Cell, Colour, ATTR_BLINK, ATTR_BRIGHT, ATTR_DIM, ATTR_HIDDEN, ATTR_ITALICS, ATTR_REVERSE,
    ATTR_UNDERSCORE, ATTR_UNDERSCORE_2,
};
use crate::protocol::{CAP_256COLOURS, CAP_ALTSCREEN, CAP_RGB, CAP_TITLE, CAP_UTF8};

/// Output buffered beyond this marks the client congested.
pub const HIGH_WATER: usize = 4 * 1024 * 1024;
/// Full redraws resume below this.
pub const LOW_WATER: usize = 1024 * 1024;

pub struct Tty {
    fd: OwnedFd,
    pub out: Vec<u8>,
    caps: u32,
    /// Cached cursor position, None when unknown.
    cursor: Option<(u16, u16)>,
    /// The pen the terminal currently has applied.
    attr: Cell,
    attr_known: bool,
    congested: bool,
}

impl Tty {
    pub fn new(fd: OwnedFd, caps: u32) -> Self {
        Tty {
            fd,
            out: Vec::new(),
            caps,
            cursor: None,
            attr: Cell::default(),
            attr_known: false,
            congested: false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn caps(&self) -> u32 {
        self.caps
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Take over the client terminal: alternate screen, cleared, cursor
    /// hidden until the first render places it.
    pub fn setup(&mut self) {
        if self.caps & CAP_ALTSCREEN != 0 {
            self.put(b"\x1b[?1049h");
        }
        self.put(b"\x1b[H\x1b[2J\x1b[?25l");
        self.cursor = Some((0, 0));
        self.attr_known = false;
    }

    /// Hand the terminal back the way we found it.
    pub fn teardown(&mut self) {
        self.put(b"\x1b[?1000l\x1b[?1006l\x1b[0m\x1b[?25h");
        if self.caps & CAP_ALTSCREEN != 0 {
            self.put(b"\x1b[?1049l");
        } else {
            self.put(b"\x1b[H\x1b[2J");
        }
        self.cursor = None;
    }

    pub fn cursor_move(&mut self, x: u16, y: u16) {
        if self.cursor == Some((x, y)) {
            return;
        }
        self.put(format!("\x1b[{};{}H", y + 1, x + 1).as_bytes());
        self.cursor = Some((x, y));
    }

    pub fn cursor_show(&mut self, show: bool) {
        self.put(if show { b"\x1b[?25h" } else { b"\x1b[?25l" });
    }

    pub fn set_title(&mut self, title: &str) {
        if self.caps & CAP_TITLE != 0 {
            self.put(format!("\x1b]0;{}\x07", title).as_bytes());
        }
    }

    /// Emit the SGR state for a cell if it differs from what the terminal
    /// already has.
    pub fn set_attr(&mut self, cell: &Cell) {
        if self.attr_known
            && self.attr.attr == cell.attr
            && self.attr.fg == cell.fg
            && self.attr.bg == cell.bg
        {
            return;
        }
        let mut seq = String::from("\x1b[0");
        let a = cell.attr;
        if a & ATTR_BRIGHT != 0 {
            seq.push_str(";1");
        }
        if a & ATTR_DIM != 0 {
            seq.push_str(";2");
        }
        if a & ATTR_ITALICS != 0 {
            seq.push_str(";3");
        }
        if a & ATTR_UNDERSCORE != 0 {
            seq.push_str(";4");
        }
        if a & ATTR_BLINK != 0 {
            seq.push_str(";5");
        }
        if a & ATTR_REVERSE != 0 {
            seq.push_str(";7");
        }
        if a & ATTR_HIDDEN != 0 {
            seq.push_str(";8");
        }
        if a & ATTR_UNDERSCORE_2 != 0 {
            seq.push_str(";21");
        }
        self.colour_seq(cell.fg, true, &mut seq);
        self.colour_seq(cell.bg, false, &mut seq);
        seq.push('m');
        self.put(seq.as_bytes());
        self.attr = *cell;
        self.attr_known = true;
    }

    fn colour_seq(&self, colour: Colour, fg: bool, seq: &mut String) {
        let colour = self.degrade(colour);
        match colour {
            Colour::Default => {}
            Colour::Indexed(n) if n < 8 => {
                let base = if fg { 30 } else { 40 };
                seq.push_str(&format!(";{}", base + n as u16));
            }
            Colour::Indexed(n) if n < 16 => {
                let base = if fg { 90 } else { 100 };
                seq.push_str(&format!(";{}", base + (n - 8) as u16));
            }
            Colour::Indexed(n) => {
                seq.push_str(&format!(";{};5;{}", if fg { 38 } else { 48 }, n));
            }
            Colour::Rgb(r, g, b) => {
                seq.push_str(&format!(";{};2;{};{};{}", if fg { 38 } else { 48 }, r, g, b));
            }
        }
    }

    /// Reduce a colour to something the client terminal can show.
    fn degrade(&self, colour: Colour) -> Colour {
        match colour {
            Colour::Rgb(r, g, b) if self.caps & CAP_RGB == 0 => {
                if self.caps & CAP_256COLOURS != 0 {
                    Colour::Indexed(rgb_to_256(r, g, b))
                } else {
                    Colour::Indexed(rgb_to_8(r, g, b))
                }
            }
            Colour::Indexed(n) if n > 15 && self.caps & CAP_256COLOURS == 0 => {
                Colour::Indexed(n & 7)
            }
            c => c,
        }
    }

    /// Write one cell's character at the current position, advancing the
    /// cached cursor by the cell width.
    pub fn put_cell_text(&mut self, text: &str, width: u16, sx: u16) {
        if self.caps & CAP_UTF8 == 0 && !text.is_ascii() {
            for _ in 0..width.max(1) {
                self.out.push(b'_');
            }
        } else {
            self.out.extend_from_slice(text.as_bytes());
        }
        if let Some((x, y)) = self.cursor {
            let nx = x + width.max(1);
            // Never trust the terminal's wrap behaviour.
            self.cursor = if nx >= sx { None } else { Some((nx, y)) };
        }
    }

    /// Flush buffered output; stops cleanly when the descriptor would
    /// block. Returns false when the tty is gone.
    pub fn flush(&mut self) -> bool {
        while !self.out.is_empty() {
            let fd = unsafe { BorrowedFd::borrow_raw(self.fd.as_raw_fd()) };
            match rustix::io::write(fd, &self.out) {
                Ok(0) => return false,
                Ok(n) => {
                    self.out.drain(..n);
                }
                Err(rustix::io::Errno::AGAIN) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(_) => return false,
            }
        }
        if self.congested && self.out.len() < LOW_WATER {
            self.congested = false;
        }
        true
    }

    pub fn wants_write(&self) -> bool {
        !self.out.is_empty()
    }

    /// Over the high-water mark the renderer drops decorative redraws.
    pub fn congested(&mut self) -> bool {
        if self.out.len() > HIGH_WATER {
            self.congested = true;
        }
        self.congested
    }

    /// Forget the cached cursor and pen, forcing explicit re-emission.
    pub fn invalidate(&mut self) {
        self.cursor = None;
        self.attr_known = false;
    }

    /// Forget only the cursor position; the pen cache stays valid.
    pub fn invalidate_cursor_only(&mut self) {
        self.cursor = None;
    }
}

fn rgb_to_256(r: u8, g: u8, b: u8) -> u8 {
    // Greyscale ramp when the channels are close.
    if r.abs_diff(g) < 8 && g.abs_diff(b) < 8 {
        let v = (r as u16 + g as u16 + b as u16) / 3;
        if v < 8 {
            return 16;
        }
        if v > 238 {
            return 231;
        }
        return 232 + ((v - 8) / 10) as u8;
    }
    let q = |v: u8| -> u8 {
        if v < 48 {
            0
        } else if v < 114 {
            1
        } else {
            ((v as u16 - 35) / 40) as u8
        }
    };
    16 + 36 * q(r) + 6 * q(g) + q(b)
}

fn rgb_to_8(r: u8, g: u8, b: u8) -> u8 {
    (((r > 127) as u8) | (((g > 127) as u8) << 1) | (((b > 127) as u8) << 2)) & 7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greyscale_maps_to_ramp() {
        assert_eq!(rgb_to_256(128, 128, 128), 244);
        assert_eq!(rgb_to_256(0, 0, 0), 16);
        assert_eq!(rgb_to_256(255, 255, 255), 231);
    }

    #[test]
    fn primary_colours_map_to_cube() {
        let red = rgb_to_256(255, 0, 0);
        assert_eq!(red, 16 + 36 * 5);
        assert_eq!(rgb_to_8(255, 10, 10), 1);
        assert_eq!(rgb_to_8(10, 255, 10), 2);
    }
}
