//! Property tests for the grid and parser invariants: storage shape,
//! wide/padding pairing, history bounds, and chunk-split independence of
//! the parser.

use proptest::prelude::*;

use rsmux::grid::{FLAG_PADDING, FLAG_WIDE};
use rsmux::parser::Parser;
use rsmux::screen::Screen;
use rsmux::screen_write::ScreenWriter;

fn apply_bytes(sx: u16, sy: u16, hlimit: usize, chunks: &[&[u8]]) -> (Screen, ScreenWriter) {
    let mut screen = Screen::new(sx, sy, hlimit);
    let mut writer = ScreenWriter::new(sy);
    let mut parser = Parser::new(true);
    for chunk in chunks {
        let mut ops = Vec::new();
        parser.advance(chunk, &mut |op| ops.push(op));
        for op in &ops {
            writer.apply(&mut screen, op);
        }
    }
    (screen, writer)
}

/// A byte soup that leans towards escape sequences and printables.
fn terminal_bytes() -> impl Strategy<Value = Vec<u8>> {
    let fragment = prop_oneof![
        // Plain printable runs.
        "[ -~]{1,12}".prop_map(|s| s.into_bytes()),
        // Wide and combining characters.
        Just("あい".as_bytes().to_vec()),
        Just("e\u{0301}".as_bytes().to_vec()),
        // Cursor motion and erase sequences.
        (1u16..30, 1u16..30).prop_map(|(r, c)| format!("\x1b[{};{}H", r, c).into_bytes()),
        (0u16..3).prop_map(|m| format!("\x1b[{}J", m).into_bytes()),
        (0u16..3).prop_map(|m| format!("\x1b[{}K", m).into_bytes()),
        (1u16..5).prop_map(|n| format!("\x1b[{}L", n).into_bytes()),
        (1u16..5).prop_map(|n| format!("\x1b[{}M", n).into_bytes()),
        (1u16..5).prop_map(|n| format!("\x1b[{}@", n).into_bytes()),
        (1u16..5).prop_map(|n| format!("\x1b[{}P", n).into_bytes()),
        (1u16..10, 1u16..12).prop_map(|(a, b)| format!("\x1b[{};{}r", a, b).into_bytes()),
        // SGR and modes.
        prop::collection::vec(0u16..108, 0..4)
            .prop_map(|ps| {
                let inner: Vec<String> = ps.iter().map(|p| p.to_string()).collect();
                format!("\x1b[{}m", inner.join(";")).into_bytes()
            }),
        Just(b"\x1b[?1049h".to_vec()),
        Just(b"\x1b[?1049l".to_vec()),
        Just(b"\r".to_vec()),
        Just(b"\n".to_vec()),
        Just(b"\t".to_vec()),
        Just(b"\x08".to_vec()),
        // Raw noise, including truncated escapes.
        prop::collection::vec(any::<u8>(), 1..6),
    ];
    prop::collection::vec(fragment, 0..40).prop_map(|v| v.concat())
}

proptest! {
    /// The grid always holds exactly hsize + sy lines, and history never
    /// exceeds its limit.
    #[test]
    fn grid_shape_invariants(bytes in terminal_bytes()) {
        let (screen, _) = apply_bytes(12, 6, 30, &[&bytes]);
        let gd = screen.grid();
        prop_assert_eq!(gd.total_lines(), gd.hsize() + gd.sy() as usize);
        prop_assert!(gd.hsize() <= gd.hlimit());
    }

    /// A wide cell is always followed by its padding partner, and padding
    /// never appears without a wide cell to its left.
    #[test]
    fn wide_padding_pairing(bytes in terminal_bytes()) {
        let (screen, _) = apply_bytes(12, 6, 30, &[&bytes]);
        let gd = screen.grid();
        for y in 0..gd.total_lines() {
            for x in 0..gd.sx() {
                let cell = gd.peek(x, y);
                if cell.flags & FLAG_WIDE != 0 {
                    prop_assert!(x + 1 < gd.sx(), "wide cell at last column");
                    let partner = gd.peek(x + 1, y);
                    prop_assert!(
                        partner.flags & FLAG_PADDING != 0,
                        "wide at ({x},{y}) lacks padding"
                    );
                }
                if cell.flags & FLAG_PADDING != 0 {
                    prop_assert!(x > 0, "padding at column zero");
                    let owner = gd.peek(x - 1, y);
                    prop_assert!(
                        owner.flags & (FLAG_WIDE | FLAG_PADDING) != 0,
                        "padding at ({x},{y}) has no owner"
                    );
                }
            }
        }
    }

    /// Line storage is trimmed: the last stored cell is never default.
    #[test]
    fn line_storage_trimmed(bytes in terminal_bytes()) {
        let (screen, _) = apply_bytes(12, 6, 30, &[&bytes]);
        let gd = screen.grid();
        for y in 0..gd.total_lines() {
            let size = gd.line(y).map(|l| l.cellsize()).unwrap_or(0);
            prop_assert!(size <= gd.sx() as usize);
            if size > 0 {
                prop_assert!(
                    !gd.peek(size as u16 - 1, y).is_default(),
                    "line {y} stores trailing default cells"
                );
            }
        }
    }

    /// Parsing a stream in one piece or split at arbitrary boundaries
    /// produces the same final grid and cursor.
    #[test]
    fn chunking_is_invisible(bytes in terminal_bytes(), cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..6)) {
        let (whole, _) = apply_bytes(12, 6, 30, &[&bytes]);

        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
        points.push(0);
        points.push(bytes.len());
        points.sort_unstable();
        points.dedup();
        let chunks: Vec<&[u8]> = points
            .windows(2)
            .map(|w| &bytes[w[0]..w[1]])
            .collect();
        let (split, _) = apply_bytes(12, 6, 30, &chunks);

        prop_assert_eq!(whole.grid(), split.grid());
        prop_assert_eq!((whole.cx, whole.cy), (split.cx, split.cy));
        prop_assert_eq!(whole.mode, split.mode);
    }
}
