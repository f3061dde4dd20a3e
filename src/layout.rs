//! The layout tree: how a window's rectangle is tiled between its panes.
//! Leaves reference panes by identifier; splits carry proportional weights
//! that survive resizes, so shrinking and re-enlarging a window restores
//! the original ratios.

use thiserror::Error;

use crate::window::PaneId;

/// Minimum pane extent along a split axis.
pub const PANE_MIN: u16 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("size too small for layout")]
    TooSmall,
    #[error("pane not in layout")]
    UnknownPane,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    LeftRight,
    TopBottom,
}

/// How much of the split the new pane receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Half,
    Percent(u8),
    Cells(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub xoff: u16,
    pub yoff: u16,
    pub sx: u16,
    pub sy: u16,
}

impl Rect {
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x >= self.xoff && x < self.xoff + self.sx && y >= self.yoff && y < self.yoff + self.sy
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellKind {
    Leaf(PaneId),
    Split { kind: SplitKind, children: Vec<LayoutCell> },
}

/// One node of the tiling tree. Extents and offsets are recomputed from the
/// weights whenever the window resizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutCell {
    pub kind: CellKind,
    pub weight: u32,
    pub xoff: u16,
    pub yoff: u16,
    pub sx: u16,
    pub sy: u16,
}

impl LayoutCell {
    pub fn leaf(pane: PaneId, sx: u16, sy: u16) -> Self {
        LayoutCell { kind: CellKind::Leaf(pane), weight: 1, xoff: 0, yoff: 0, sx, sy }
    }

    pub fn rect(&self) -> Rect {
        Rect { xoff: self.xoff, yoff: self.yoff, sx: self.sx, sy: self.sy }
    }

    /// Smallest extent this subtree can be squeezed into.
    pub fn min_size(&self) -> (u16, u16) {
        match &self.kind {
            CellKind::Leaf(_) => (PANE_MIN, PANE_MIN),
            CellKind::Split { kind, children } => {
                let mins: Vec<(u16, u16)> = children.iter().map(|c| c.min_size()).collect();
                let seps = children.len().saturating_sub(1) as u16;
                match kind {
                    SplitKind::LeftRight => (
                        mins.iter().map(|m| m.0).sum::<u16>() + seps,
                        mins.iter().map(|m| m.1).max().unwrap_or(PANE_MIN),
                    ),
                    SplitKind::TopBottom => (
                        mins.iter().map(|m| m.0).max().unwrap_or(PANE_MIN),
                        mins.iter().map(|m| m.1).sum::<u16>() + seps,
                    ),
                }
            }
        }
    }

    pub fn panes(&self) -> Vec<PaneId> {
        let mut out = Vec::new();
        self.collect_panes(&mut out);
        out
    }

    fn collect_panes(&self, out: &mut Vec<PaneId>) {
        match &self.kind {
            CellKind::Leaf(p) => out.push(*p),
            CellKind::Split { children, .. } => {
                for c in children {
                    c.collect_panes(out);
                }
            }
        }
    }

    pub fn pane_rects(&self) -> Vec<(PaneId, Rect)> {
        let mut out = Vec::new();
        self.collect_rects(&mut out);
        out
    }

    fn collect_rects(&self, out: &mut Vec<(PaneId, Rect)>) {
        match &self.kind {
            CellKind::Leaf(p) => out.push((*p, self.rect())),
            CellKind::Split { children, .. } => {
                for c in children {
                    c.collect_rects(out);
                }
            }
        }
    }

    pub fn find_pane(&self, pane: PaneId) -> Option<&LayoutCell> {
        match &self.kind {
            CellKind::Leaf(p) if *p == pane => Some(self),
            CellKind::Leaf(_) => None,
            CellKind::Split { children, .. } => {
                children.iter().find_map(|c| c.find_pane(pane))
            }
        }
    }

    fn find_pane_mut(&mut self, pane: PaneId) -> Option<&mut LayoutCell> {
        let is_match = matches!(&self.kind, CellKind::Leaf(p) if *p == pane);
        if is_match {
            return Some(self);
        }
        match &mut self.kind {
            CellKind::Leaf(_) => None,
            CellKind::Split { children, .. } => {
                children.iter_mut().find_map(|c| c.find_pane_mut(pane))
            }
        }
    }

    fn axis_extent(&self, kind: SplitKind) -> u16 {
        match kind {
            SplitKind::LeftRight => self.sx,
            SplitKind::TopBottom => self.sy,
        }
    }
}

/// Resize the whole tree to the given extent. Best-effort: if the minima
/// cannot be satisfied the tree is left untouched and an error returned.
pub fn resize(root: &mut LayoutCell, sx: u16, sy: u16) -> Result<(), LayoutError> {
    let (mx, my) = root.min_size();
    if sx < mx || sy < my {
        return Err(LayoutError::TooSmall);
    }
    assign(root, 0, 0, sx, sy);
    Ok(())
}

/// Fix extents and positions top-down: each split divides its extent in the
/// saved proportions, then redistributes any deficit one cell at a time,
/// shrinking the largest share or growing the smallest.
fn assign(cell: &mut LayoutCell, xoff: u16, yoff: u16, sx: u16, sy: u16) {
    cell.xoff = xoff;
    cell.yoff = yoff;
    cell.sx = sx;
    cell.sy = sy;
    let (kind, children) = match &mut cell.kind {
        CellKind::Leaf(_) => return,
        CellKind::Split { kind, children } => (*kind, children),
    };

    let seps = children.len().saturating_sub(1) as u16;
    let axis_total = match kind {
        SplitKind::LeftRight => sx - seps,
        SplitKind::TopBottom => sy - seps,
    };
    let weights: Vec<u32> = children.iter().map(|c| c.weight.max(1)).collect();
    let mins: Vec<u16> = children
        .iter()
        .map(|c| {
            let (mx, my) = c.min_size();
            match kind {
                SplitKind::LeftRight => mx,
                SplitKind::TopBottom => my,
            }
        })
        .collect();
    let shares = divide(axis_total, &weights, &mins);

    let mut pos = match kind {
        SplitKind::LeftRight => xoff,
        SplitKind::TopBottom => yoff,
    };
    for (child, share) in children.iter_mut().zip(shares) {
        match kind {
            SplitKind::LeftRight => assign(child, pos, yoff, share, sy),
            SplitKind::TopBottom => assign(child, xoff, pos, sx, share),
        }
        pos += share + 1;
    }
}

/// Split `total` in proportion to `weights`, then enforce the minima: while
/// over budget take a cell from the largest share, while under give one to
/// the smallest.
fn divide(total: u16, weights: &[u32], mins: &[u16]) -> Vec<u16> {
    let wsum: u64 = weights.iter().map(|w| *w as u64).sum::<u64>().max(1);
    let mut shares: Vec<u16> = Vec::with_capacity(weights.len());
    let mut used: u64 = 0;
    let mut acc: u64 = 0;
    for &w in weights {
        acc += w as u64;
        let upto = (total as u64 * acc) / wsum;
        shares.push((upto - used) as u16);
        used = upto;
    }
    for (share, &min) in shares.iter_mut().zip(mins) {
        if *share < min {
            *share = min;
        }
    }
    loop {
        let sum: u32 = shares.iter().map(|s| *s as u32).sum();
        if sum > total as u32 {
            let victim = shares
                .iter()
                .enumerate()
                .filter(|(i, s)| **s > mins[*i])
                .max_by_key(|(_, s)| **s)
                .map(|(i, _)| i);
            match victim {
                Some(i) => shares[i] -= 1,
                None => break,
            }
        } else if sum < total as u32 {
            if let Some(i) = shares
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| **s)
                .map(|(i, _)| i)
            {
                shares[i] += 1;
            } else {
                break;
            }
        } else {
            break;
        }
    }
    shares
}

/// Insert `new_pane` adjacent to `pane` along `kind`. Fails if the target
/// cell cannot hold two panes plus the separator line.
pub fn split_pane(
    root: &mut LayoutCell,
    pane: PaneId,
    kind: SplitKind,
    spec: SizeSpec,
    new_pane: PaneId,
    before: bool,
) -> Result<(), LayoutError> {
    let cell = root.find_pane_mut(pane).ok_or(LayoutError::UnknownPane)?;
    let extent = cell.axis_extent(kind);
    if extent < PANE_MIN * 2 + 1 {
        return Err(LayoutError::TooSmall);
    }
    let avail = extent - 1;
    let new_size = match spec {
        SizeSpec::Half => avail / 2,
        SizeSpec::Percent(p) => (avail as u32 * p.min(100) as u32 / 100) as u16,
        SizeSpec::Cells(n) => n,
    }
    .clamp(PANE_MIN, avail - PANE_MIN);
    let old_size = avail - new_size;

    let rect = cell.rect();
    let weight = cell.weight;
    let old = std::mem::replace(cell, LayoutCell::leaf(new_pane, 0, 0));
    let mut first = LayoutCell { weight: old_size as u32, ..old };
    let mut second = LayoutCell::leaf(new_pane, 0, 0);
    second.weight = new_size as u32;
    if before {
        std::mem::swap(&mut first, &mut second);
    }
    *cell = LayoutCell {
        kind: CellKind::Split { kind, children: vec![first, second] },
        weight,
        xoff: 0,
        yoff: 0,
        sx: 0,
        sy: 0,
    };
    assign(cell, rect.xoff, rect.yoff, rect.sx, rect.sy);
    Ok(())
}

/// Remove a pane's leaf. The sibling collapses into the parent split and
/// inherits the freed extent. Returns false when the pane was the root
/// leaf; the caller destroys the window instead.
pub fn remove_pane(root: &mut LayoutCell, pane: PaneId) -> Result<bool, LayoutError> {
    if matches!(root.kind, CellKind::Leaf(p) if p == pane) {
        return Ok(false);
    }
    if !remove_in(root, pane) {
        return Err(LayoutError::UnknownPane);
    }
    let rect = root.rect();
    assign(root, rect.xoff, rect.yoff, rect.sx, rect.sy);
    Ok(true)
}

fn remove_in(cell: &mut LayoutCell, pane: PaneId) -> bool {
    let children = match &mut cell.kind {
        CellKind::Leaf(_) => return false,
        CellKind::Split { children, .. } => children,
    };
    if let Some(idx) = children
        .iter()
        .position(|c| matches!(c.kind, CellKind::Leaf(p) if p == pane))
    {
        children.remove(idx);
        if children.len() == 1 {
            // Collapse the split: the lone child takes this cell's place.
            let mut child = children.remove(0);
            child.weight = cell.weight;
            *cell = LayoutCell {
                kind: child.kind,
                weight: child.weight,
                xoff: cell.xoff,
                yoff: cell.yoff,
                sx: cell.sx,
                sy: cell.sy,
            };
        }
        return true;
    }
    children.iter_mut().any(|c| remove_in(c, pane))
}

/// Grow or shrink a pane by `delta` cells along the nearest ancestor split
/// of the given kind, adjusting sibling weights so the change persists.
pub fn resize_pane(
    root: &mut LayoutCell,
    pane: PaneId,
    kind: SplitKind,
    delta: i32,
) -> Result<(), LayoutError> {
    let rect = root.rect();
    if !resize_pane_in(root, pane, kind, delta) {
        return Err(LayoutError::UnknownPane);
    }
    assign(root, rect.xoff, rect.yoff, rect.sx, rect.sy);
    Ok(())
}

fn resize_pane_in(cell: &mut LayoutCell, pane: PaneId, kind: SplitKind, delta: i32) -> bool {
    let (skind, children) = match &mut cell.kind {
        CellKind::Leaf(_) => return false,
        CellKind::Split { kind, children } => (*kind, children),
    };
    if skind == kind && children.len() > 1 {
        if let Some(idx) = children.iter().position(|c| c.find_pane(pane).is_some()) {
            let take_from = if idx + 1 < children.len() { idx + 1 } else { idx - 1 };
            let cur = children[idx].axis_extent(kind) as i32;
            let other = children[take_from].axis_extent(kind) as i32;
            let delta = delta
                .min(other - PANE_MIN as i32)
                .max(-(cur - PANE_MIN as i32));
            children[idx].weight = (cur + delta).max(PANE_MIN as i32) as u32;
            children[take_from].weight = (other - delta).max(PANE_MIN as i32) as u32;
            return true;
        }
    }
    children.iter_mut().any(|c| resize_pane_in(c, pane, kind, delta))
}

/// Rebuild the tree as one of the preset layouts over the same panes.
pub fn apply_preset(root: &mut LayoutCell, preset: &str) -> bool {
    let panes = root.panes();
    if panes.len() < 2 {
        return false;
    }
    let rect = root.rect();
    let built = match preset {
        "even-horizontal" => even(panes, SplitKind::LeftRight),
        "even-vertical" => even(panes, SplitKind::TopBottom),
        "main-horizontal" => main_split(panes, SplitKind::TopBottom, SplitKind::LeftRight),
        "main-vertical" => main_split(panes, SplitKind::LeftRight, SplitKind::TopBottom),
        "tiled" => tiled(panes),
        _ => return false,
    };
    *root = built;
    assign(root, rect.xoff, rect.yoff, rect.sx, rect.sy);
    true
}

pub const PRESET_LAYOUTS: [&str; 5] = [
    "even-horizontal",
    "even-vertical",
    "main-horizontal",
    "main-vertical",
    "tiled",
];

fn even(panes: Vec<PaneId>, kind: SplitKind) -> LayoutCell {
    let children = panes.into_iter().map(|p| LayoutCell::leaf(p, 0, 0)).collect();
    LayoutCell {
        kind: CellKind::Split { kind, children },
        weight: 1,
        xoff: 0,
        yoff: 0,
        sx: 0,
        sy: 0,
    }
}

fn main_split(mut panes: Vec<PaneId>, outer: SplitKind, inner: SplitKind) -> LayoutCell {
    let main = panes.remove(0);
    let mut main_cell = LayoutCell::leaf(main, 0, 0);
    main_cell.weight = 3;
    let mut rest = if panes.len() == 1 {
        LayoutCell::leaf(panes[0], 0, 0)
    } else {
        even(panes, inner)
    };
    rest.weight = 2;
    LayoutCell {
        kind: CellKind::Split { kind: outer, children: vec![main_cell, rest] },
        weight: 1,
        xoff: 0,
        yoff: 0,
        sx: 0,
        sy: 0,
    }
}

fn tiled(mut panes: Vec<PaneId>) -> LayoutCell {
    if panes.len() == 1 {
        return LayoutCell::leaf(panes.remove(0), 0, 0);
    }
    let mid = panes.len() / 2;
    let right = panes.split_off(mid);
    let children = vec![tiled(panes), tiled(right)];
    LayoutCell {
        kind: CellKind::Split { kind: SplitKind::LeftRight, children },
        weight: 1,
        xoff: 0,
        yoff: 0,
        sx: 0,
        sy: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_half_leaves_separator() {
        let mut root = LayoutCell::leaf(1, 80, 24);
        split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Half, 2, false).unwrap();
        let rects = root.pane_rects();
        assert_eq!(rects.len(), 2);
        let (_, a) = rects[0];
        let (_, b) = rects[1];
        assert_eq!(a.sx + b.sx + 1, 80);
        assert_eq!(a.sy, 24);
        assert_eq!(b.xoff, a.sx + 1);
        // The two panes come out 40 and 39 columns.
        assert_eq!(a.sx.max(b.sx), 40);
        assert_eq!(a.sx.min(b.sx), 39);
    }

    #[test]
    fn shrink_then_enlarge_restores_ratio() {
        let mut root = LayoutCell::leaf(1, 80, 24);
        split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Half, 2, false).unwrap();
        resize(&mut root, 40, 24).unwrap();
        let rects = root.pane_rects();
        assert_eq!(rects[0].1.sx + rects[1].1.sx + 1, 40);
        resize(&mut root, 80, 24).unwrap();
        let rects = root.pane_rects();
        assert_eq!(rects[0].1.sx.max(rects[1].1.sx), 40);
        assert_eq!(rects[0].1.sx.min(rects[1].1.sx), 39);
    }

    #[test]
    fn resize_below_minimum_fails_untouched() {
        let mut root = LayoutCell::leaf(1, 80, 24);
        split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Half, 2, false).unwrap();
        let before = root.clone();
        assert_eq!(resize(&mut root, 4, 24), Err(LayoutError::TooSmall));
        assert_eq!(root, before);
    }

    #[test]
    fn split_and_kill_restores_tree() {
        let mut root = LayoutCell::leaf(1, 80, 24);
        let before = root.clone();
        split_pane(&mut root, 1, SplitKind::TopBottom, SizeSpec::Half, 2, false).unwrap();
        assert!(remove_pane(&mut root, 2).unwrap());
        assert_eq!(root, before);
    }

    #[test]
    fn window_area_accounts_for_separators() {
        let mut root = LayoutCell::leaf(1, 80, 24);
        split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Half, 2, false).unwrap();
        split_pane(&mut root, 2, SplitKind::TopBottom, SizeSpec::Half, 3, false).unwrap();
        let rects = root.pane_rects();
        let area: u32 = rects.iter().map(|(_, r)| r.sx as u32 * r.sy as u32).sum();
        let right_sx = rects[1].1.sx;
        assert_eq!(area + 24 + right_sx as u32, 80 * 24);
    }

    #[test]
    fn too_small_split_rejected() {
        let mut root = LayoutCell::leaf(1, 4, 24);
        assert_eq!(
            split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Half, 2, false),
            Err(LayoutError::TooSmall)
        );
    }

    #[test]
    fn percentage_split() {
        let mut root = LayoutCell::leaf(1, 81, 24);
        split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Percent(25), 2, false)
            .unwrap();
        let rects = root.pane_rects();
        assert_eq!(rects[1].1.sx, 20);
        assert_eq!(rects[0].1.sx, 60);
    }

    #[test]
    fn kill_redistributes_extent() {
        let mut root = LayoutCell::leaf(1, 80, 24);
        split_pane(&mut root, 1, SplitKind::LeftRight, SizeSpec::Half, 2, false).unwrap();
        split_pane(&mut root, 2, SplitKind::LeftRight, SizeSpec::Half, 3, false).unwrap();
        remove_pane(&mut root, 3).unwrap();
        let rects = root.pane_rects();
        assert_eq!(rects.len(), 2);
        assert_eq!(rects.iter().map(|(_, r)| r.sx as u32).sum::<u32>() + 1, 80);
    }
}
