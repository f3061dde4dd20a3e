//! Property tests for the layout tree: area accounting, split/kill
//! inverses, minima, and the textual round-trip.

use proptest::prelude::*;

use rsmux::layout::{
    self, CellKind, LayoutCell, SizeSpec, SplitKind, PANE_MIN,
};
use rsmux::layout_string;

#[derive(Debug, Clone)]
enum Op {
    Split { target: usize, kind: SplitKind, pct: u8 },
    Kill { target: usize },
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        3 => (any::<prop::sample::Index>(), any::<bool>(), 10u8..90).prop_map(|(t, h, pct)| Op::Split {
            target: t.index(64),
            kind: if h { SplitKind::LeftRight } else { SplitKind::TopBottom },
            pct,
        }),
        1 => any::<prop::sample::Index>().prop_map(|t| Op::Kill { target: t.index(64) }),
    ];
    prop::collection::vec(op, 0..12)
}

/// Drive a tree through a random history of splits and kills.
fn build(ops: &[Op], sx: u16, sy: u16) -> LayoutCell {
    let mut root = LayoutCell::leaf(0, sx, sy);
    let mut next = 1;
    for op in ops {
        let panes = root.panes();
        match op {
            Op::Split { target, kind, pct } => {
                let pane = panes[target % panes.len()];
                if layout::split_pane(
                    &mut root,
                    pane,
                    *kind,
                    SizeSpec::Percent(*pct),
                    next,
                    false,
                )
                .is_ok()
                {
                    next += 1;
                }
            }
            Op::Kill { target } => {
                if panes.len() > 1 {
                    let pane = panes[target % panes.len()];
                    let _ = layout::remove_pane(&mut root, pane);
                }
            }
        }
    }
    root
}

/// Sum of pane areas plus separator cells equals the window area.
fn separator_area(root: &LayoutCell) -> u32 {
    fn rec(cell: &LayoutCell, acc: &mut u32) {
        if let CellKind::Split { kind, children } = &cell.kind {
            let seps = children.len() as u32 - 1;
            match kind {
                SplitKind::LeftRight => *acc += seps * cell.sy as u32,
                SplitKind::TopBottom => *acc += seps * cell.sx as u32,
            }
            for c in children {
                rec(c, acc);
            }
        }
    }
    let mut acc = 0;
    rec(root, &mut acc);
    acc
}

proptest! {
    /// Window area is pane areas plus separator lines, exactly.
    #[test]
    fn areas_account_for_separators(ops in ops()) {
        let root = build(&ops, 160, 50);
        let pane_area: u32 = root
            .pane_rects()
            .iter()
            .map(|(_, r)| r.sx as u32 * r.sy as u32)
            .sum();
        prop_assert_eq!(pane_area + separator_area(&root), 160 * 50);
    }

    /// No pane ever shrinks below the minimum extent.
    #[test]
    fn minima_respected(ops in ops()) {
        let root = build(&ops, 160, 50);
        for (pane, rect) in root.pane_rects() {
            prop_assert!(rect.sx >= PANE_MIN, "pane {pane} is {} wide", rect.sx);
            prop_assert!(rect.sy >= PANE_MIN, "pane {pane} is {} tall", rect.sy);
        }
    }

    /// Splitting then killing the new pane restores the tree.
    #[test]
    fn split_then_kill_is_identity(ops in ops(), h in any::<bool>(), pct in 10u8..90) {
        let mut root = build(&ops, 160, 50);
        let before = root.clone();
        let target = root.panes()[0];
        let kind = if h { SplitKind::LeftRight } else { SplitKind::TopBottom };
        if layout::split_pane(&mut root, target, kind, SizeSpec::Percent(pct), 9999, false).is_ok() {
            layout::remove_pane(&mut root, 9999).unwrap();
            prop_assert_eq!(root, before);
        }
    }

    /// The textual form round-trips: positions, sizes, and a second dump
    /// are all identical.
    #[test]
    fn layout_string_round_trip(ops in ops()) {
        let root = build(&ops, 160, 50);
        let dumped = layout_string::dump(&root);
        let parsed = layout_string::parse(&dumped);
        prop_assert!(parsed.is_some(), "failed to parse {dumped}");
        let parsed = parsed.unwrap();
        prop_assert_eq!(parsed.pane_rects(), root.pane_rects());
        prop_assert_eq!(layout_string::dump(&parsed), dumped);
    }

    /// Resizing down then back up restores the original geometry.
    #[test]
    fn resize_down_up_restores(ops in ops()) {
        let mut root = build(&ops, 160, 50);
        let before = root.pane_rects();
        if layout::resize(&mut root, 90, 30).is_ok() {
            layout::resize(&mut root, 160, 50).unwrap();
            prop_assert_eq!(root.pane_rects(), before);
        }
    }
}
