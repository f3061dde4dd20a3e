//! Textual layout form: `csum,WxH,X,Y{...}` with `{}` for left-right splits
//! and `[]` for top-bottom, leaves as `WxH,X,Y,pane-id`. Dumping and
//! re-parsing a tree yields an identical tree, positions and proportions
//! included.

use crate::layout::{CellKind, LayoutCell, SplitKind};
use crate::window::PaneId;

/// The rolling 16-bit checksum prefixed to the layout string.
pub fn checksum(body: &str) -> u16 {
    let mut csum: u16 = 0;
    for b in body.bytes() {
        csum = (csum >> 1) | ((csum & 1) << 15);
        csum = csum.wrapping_add(b as u16);
    }
    csum
}

pub fn dump(root: &LayoutCell) -> String {
    let mut body = String::new();
    dump_cell(root, &mut body);
    format!("{:04x},{}", checksum(&body), body)
}

fn dump_cell(cell: &LayoutCell, out: &mut String) {
    out.push_str(&format!("{}x{},{},{}", cell.sx, cell.sy, cell.xoff, cell.yoff));
    match &cell.kind {
        CellKind::Leaf(p) => out.push_str(&format!(",{}", p)),
        CellKind::Split { kind, children } => {
            let (open, close) = match kind {
                SplitKind::LeftRight => ('{', '}'),
                SplitKind::TopBottom => ('[', ']'),
            };
            out.push(open);
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                dump_cell(child, out);
            }
            out.push(close);
        }
    }
}

/// Parse a layout string back into a tree. The checksum must match.
pub fn parse(s: &str) -> Option<LayoutCell> {
    let (csum_str, body) = s.trim().split_once(',')?;
    let csum = u16::from_str_radix(csum_str, 16).ok()?;
    if csum != checksum(body) {
        return None;
    }
    let mut p = ParseState { bytes: body.as_bytes(), pos: 0 };
    let cell = p.cell()?;
    if p.pos != p.bytes.len() {
        return None;
    }
    Some(cell)
}

struct ParseState<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl ParseState<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn number(&mut self) -> Option<u32> {
        let start = self.pos;
        while self.peek().map(|b| b.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).ok()?.parse().ok()
    }

    fn expect(&mut self, b: u8) -> Option<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    fn cell(&mut self) -> Option<LayoutCell> {
        let sx = self.number()? as u16;
        self.expect(b'x')?;
        let sy = self.number()? as u16;
        self.expect(b',')?;
        let xoff = self.number()? as u16;
        self.expect(b',')?;
        let yoff = self.number()? as u16;

        let kind = match self.peek() {
            Some(b'{') => {
                let children = self.children(b'{', b'}')?;
                CellKind::Split { kind: SplitKind::LeftRight, children }
            }
            Some(b'[') => {
                let children = self.children(b'[', b']')?;
                CellKind::Split { kind: SplitKind::TopBottom, children }
            }
            Some(b',') => {
                self.pos += 1;
                let id = self.number()? as PaneId;
                CellKind::Leaf(id)
            }
            _ => return None,
        };
        let mut cell = LayoutCell { kind, weight: 1, xoff, yoff, sx, sy };
        // Proportions are the dumped extents, so a resize after parsing
        // behaves as it did before dumping.
        if let CellKind::Split { kind, children } = &mut cell.kind {
            for child in children {
                child.weight = match kind {
                    SplitKind::LeftRight => child.sx as u32,
                    SplitKind::TopBottom => child.sy as u32,
                };
            }
        }
        Some(cell)
    }

    fn children(&mut self, open: u8, close: u8) -> Option<Vec<LayoutCell>> {
        self.expect(open)?;
        let mut out = Vec::new();
        loop {
            out.push(self.cell()?);
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b) if b == close => {
                    self.pos += 1;
                    break;
                }
                _ => return None,
            }
        }
        if out.len() < 2 {
            return None;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{self, SizeSpec};

    #[test]
    fn leaf_round_trip() {
        let root = LayoutCell::leaf(7, 80, 24);
        let s = dump(&root);
        let parsed = parse(&s).unwrap();
        assert_eq!(parsed.rect(), root.rect());
        assert_eq!(parsed.panes(), vec![7]);
    }

    #[test]
    fn nested_round_trip_preserves_geometry() {
        let mut root = LayoutCell::leaf(0, 120, 40);
        layout::split_pane(&mut root, 0, SplitKind::LeftRight, SizeSpec::Half, 1, false)
            .unwrap();
        layout::split_pane(&mut root, 1, SplitKind::TopBottom, SizeSpec::Percent(30), 2, false)
            .unwrap();
        let s = dump(&root);
        let parsed = parse(&s).unwrap();
        assert_eq!(parsed.pane_rects(), root.pane_rects());
        // Dumping the parse gives the identical string.
        assert_eq!(dump(&parsed), s);
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let root = LayoutCell::leaf(0, 80, 24);
        let s = dump(&root);
        let bad = format!("0000,{}", s.split_once(',').unwrap().1);
        if bad != s {
            assert!(parse(&bad).is_none());
        }
    }

    #[test]
    fn garbage_rejected() {
        assert!(parse("zzzz").is_none());
        assert!(parse("0000,80x24").is_none());
    }

    #[test]
    fn known_form() {
        let mut root = LayoutCell::leaf(0, 80, 24);
        layout::split_pane(&mut root, 0, SplitKind::LeftRight, SizeSpec::Half, 1, false)
            .unwrap();
        let s = dump(&root);
        let body = s.split_once(',').unwrap().1;
        assert_eq!(body, "80x24,0,0{40x24,0,0,0,39x24,41,0,1}");
    }
}
