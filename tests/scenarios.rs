//! End-to-end scenarios: byte streams into a fresh screen, checked against
//! the expected grid, plus the split/resize flow on the layout tree.

use rsmux::grid::{Colour, FLAG_PADDING, FLAG_WIDE};
use rsmux::grid_view;
use rsmux::layout::{self, LayoutCell, SizeSpec, SplitKind};
use rsmux::parser::Parser;
use rsmux::screen::Screen;
use rsmux::screen_write::ScreenWriter;

struct Term {
    parser: Parser,
    writer: ScreenWriter,
    screen: Screen,
}

impl Term {
    fn new(sx: u16, sy: u16, hlimit: usize) -> Self {
        Term {
            parser: Parser::new(true),
            writer: ScreenWriter::new(sy),
            screen: Screen::new(sx, sy, hlimit),
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        let Term { parser, writer, screen } = self;
        parser.advance(bytes, &mut |op| writer.apply(screen, &op));
    }

    fn row(&self, y: u16) -> String {
        let mut out = String::new();
        for x in 0..self.screen.sx() {
            let c = grid_view::peek(self.screen.grid(), x, y);
            if c.flags & FLAG_PADDING == 0 {
                out.push_str(c.data.as_str());
            }
        }
        out.trim_end().to_string()
    }
}

#[test]
fn basic_print_and_wrap() {
    let mut t = Term::new(10, 3, 0);
    t.feed(b"hello world!");
    assert_eq!(t.row(0), "hello worl");
    assert_eq!(t.row(1), "d!");
    assert_eq!((t.screen.cx, t.screen.cy), (2, 1));
    assert!(grid_view::line_wrapped(t.screen.grid(), 0));
}

#[test]
fn scroll_region_confines_linefeed() {
    let mut t = Term::new(10, 5, 0);
    for y in 0..5 {
        t.feed(format!("\x1b[{};1Hline{}", y + 1, y).as_bytes());
    }
    t.feed(b"\x1b[2;4r\x1b[4;1H\n");
    assert_eq!(t.row(0), "line0");
    assert_eq!(t.row(1), "line2");
    assert_eq!(t.row(2), "line3");
    assert_eq!(t.row(3), "");
    assert_eq!(t.row(4), "line4");
}

#[test]
fn sgr_truecolour_print() {
    let mut t = Term::new(10, 3, 0);
    t.feed(b"\x1b[38;2;255;128;0;48;2;0;0;0mX");
    let c = grid_view::peek(t.screen.grid(), 0, 0);
    assert_eq!(c.data.as_str(), "X");
    assert_eq!(c.fg, Colour::Rgb(255, 128, 0));
    assert_eq!(c.bg, Colour::Rgb(0, 0, 0));
    assert_eq!(c.attr, 0);
}

#[test]
fn alternate_screen_restores_primary() {
    let mut t = Term::new(10, 3, 50);
    t.feed(b"primary");
    let cursor_before = (t.screen.cx, t.screen.cy);
    t.feed(b"\x1b[31m");
    t.feed(b"\x1b[?1049h");
    assert!(t.screen.alternate_on());
    assert_eq!(t.screen.hsize(), 0);
    t.feed(b"ABC");
    assert_eq!(t.row(0), "ABC");
    t.feed(b"\x1b[?1049l");
    assert!(!t.screen.alternate_on());
    assert_eq!(t.row(0), "primary");
    assert_eq!((t.screen.cx, t.screen.cy), cursor_before);
    // The pen saved on enter came back on exit.
    t.feed(b"Y");
    let c = grid_view::peek(t.screen.grid(), cursor_before.0, 0);
    assert_eq!(c.fg, Colour::Indexed(1));
}

#[test]
fn wide_char_overwrite() {
    let mut t = Term::new(5, 2, 0);
    t.feed("あ".as_bytes());
    assert!(grid_view::peek(t.screen.grid(), 0, 0).flags & FLAG_WIDE != 0);
    assert!(grid_view::peek(t.screen.grid(), 1, 0).flags & FLAG_PADDING != 0);
    t.feed(b"xyz");
    // Fill remaining columns so 2-4 are occupied, then overwrite col 1.
    t.feed(b"\x1b[1;2H!");
    assert_eq!(grid_view::peek(t.screen.grid(), 0, 0).data.as_str(), " ");
    assert!(grid_view::peek(t.screen.grid(), 0, 0).flags & FLAG_WIDE == 0);
    assert_eq!(grid_view::peek(t.screen.grid(), 1, 0).data.as_str(), "!");
    assert_eq!(grid_view::peek(t.screen.grid(), 2, 0).data.as_str(), "x");
    assert_eq!(grid_view::peek(t.screen.grid(), 3, 0).data.as_str(), "y");
    assert_eq!(grid_view::peek(t.screen.grid(), 4, 0).data.as_str(), "z");
}

#[test]
fn split_resize_and_restore() {
    let mut root = LayoutCell::leaf(1, 80, 24);
    layout::split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Half, 2, false).unwrap();
    let rects = root.pane_rects();
    assert_eq!(rects[0].1.sx + rects[1].1.sx + 1, 80);
    assert_eq!(rects[0].1.sx.max(rects[1].1.sx), 40);
    assert_eq!(rects[0].1.sx.min(rects[1].1.sx), 39);
    assert_eq!(rects[0].1.sy, 24);

    // Shrink hard: both panes survive at or above the minimum.
    layout::resize(&mut root, 40, 24).unwrap();
    for (_, r) in root.pane_rects() {
        assert!(r.sx >= layout::PANE_MIN);
    }

    // Enlarging restores the even split.
    layout::resize(&mut root, 80, 24).unwrap();
    let rects = root.pane_rects();
    assert_eq!(rects[0].1.sx.max(rects[1].1.sx), 40);
    assert_eq!(rects[0].1.sx.min(rects[1].1.sx), 39);
}

#[test]
fn scrollback_accumulates_and_is_bounded() {
    let mut t = Term::new(8, 4, 20);
    for i in 0..100 {
        t.feed(format!("line{}\r\n", i).as_bytes());
    }
    let gd = t.screen.grid();
    assert!(gd.hsize() <= 20);
    assert!(gd.hsize() > 0);
    assert_eq!(gd.total_lines(), gd.hsize() + 4);
    // The visible region shows the most recent lines.
    assert_eq!(t.row(2), "line99");
}

#[test]
fn osc_title_and_bell() {
    let mut t = Term::new(10, 3, 0);
    t.feed(b"\x1b]0;my title\x07\x07");
    assert_eq!(t.screen.title, "my title");
    assert!(t.writer.bell);
}
