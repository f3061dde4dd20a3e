use crate::grid::{Cell, Grid};

/// Screen mode bits.
pub const MODE_CURSOR: u32 = 0x1;
pub const MODE_INSERT: u32 = 0x2;
pub const MODE_KCURSOR: u32 = 0x4;
pub const MODE_KKEYPAD: u32 = 0x8;
pub const MODE_WRAP: u32 = 0x10;
pub const MODE_MOUSE_X10: u32 = 0x20;
pub const MODE_MOUSE_STANDARD: u32 = 0x40;
pub const MODE_MOUSE_BUTTON: u32 = 0x80;
pub const MODE_MOUSE_ANY: u32 = 0x100;
pub const MODE_MOUSE_UTF8: u32 = 0x200;
pub const MODE_MOUSE_SGR: u32 = 0x400;
pub const MODE_BRACKETPASTE: u32 = 0x800;
pub const MODE_ORIGIN: u32 = 0x1000;
pub const MODE_FOCUSON: u32 = 0x2000;

pub const ALL_MOUSE_MODES: u32 =
    MODE_MOUSE_X10 | MODE_MOUSE_STANDARD | MODE_MOUSE_BUTTON | MODE_MOUSE_ANY;

/// Selection overlay: a logical range of cells rendered with the selection
/// style. Mutations under the range invalidate it.
#[derive(Debug, Clone, Copy)]
pub struct Selection {
    pub sx: u16,
    pub sy: u16,
    pub ex: u16,
    pub ey: u16,
    pub rect: bool,
}

impl Selection {
    pub fn contains(&self, x: u16, y: u16) -> bool {
        let (top, bot) = if self.sy <= self.ey { (self.sy, self.ey) } else { (self.ey, self.sy) };
        if y < top || y > bot {
            return false;
        }
        if self.rect {
            let (l, r) = if self.sx <= self.ex { (self.sx, self.ex) } else { (self.ex, self.sx) };
            return x >= l && x <= r;
        }
        // Linear selection: partial first and last rows, full rows between.
        let (fx, lx) = if (self.sy, self.sx) <= (self.ey, self.ex) {
            (self.sx, self.ex)
        } else {
            (self.ex, self.sx)
        };
        if top == bot {
            let (l, r) = if fx <= lx { (fx, lx) } else { (lx, fx) };
            return x >= l && x <= r;
        }
        if y == top {
            return x >= fx;
        }
        if y == bot {
            return x <= lx;
        }
        true
    }
}

/// State saved while the alternate screen is active, restored on exit.
struct AltScreen {
    grid: Grid,
    cx: u16,
    cy: u16,
    cell: Cell,
}

/// A sixel image anchored to a cell of the visible region.
pub struct ImagePlacement {
    pub px: u16,
    pub py: u16,
    pub image: crate::sixel::SixelImage,
}

/// A grid plus render state: cursor, scroll region, modes, tab stops, title,
/// selection overlay, and the optional alternate screen.
pub struct Screen {
    pub title: String,
    grid: Grid,
    pub cx: u16,
    pub cy: u16,
    pub rupper: u16,
    pub rlower: u16,
    pub mode: u32,
    tabs: Vec<bool>,
    pub sel: Option<Selection>,
    saved: Option<Box<AltScreen>>,
    /// Cursor and pen saved by DECSC, restored by DECRC.
    pub saved_cx: u16,
    pub saved_cy: u16,
    pub saved_cell: Cell,
    /// Sixel images anchored on cells of this screen.
    pub images: Vec<ImagePlacement>,
}

impl Screen {
    pub fn new(sx: u16, sy: u16, hlimit: usize) -> Self {
        Screen {
            title: String::new(),
            grid: Grid::new(sx, sy, hlimit),
            cx: 0,
            cy: 0,
            rupper: 0,
            rlower: sy.saturating_sub(1),
            mode: MODE_CURSOR | MODE_WRAP,
            tabs: default_tabs(sx),
            sel: None,
            saved: None,
            saved_cx: 0,
            saved_cy: 0,
            saved_cell: Cell::default(),
            images: Vec::new(),
        }
    }

    pub fn sx(&self) -> u16 {
        self.grid.sx()
    }

    pub fn sy(&self) -> u16 {
        self.grid.sy()
    }

    pub fn hsize(&self) -> usize {
        self.grid.hsize()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    pub fn alternate_on(&self) -> bool {
        self.saved.is_some()
    }

    /// Enter the alternate buffer: stash the primary grid, cursor and pen,
    /// and start on a fresh grid with no history.
    pub fn alternate_enter(&mut self, cell: Cell) {
        if self.saved.is_some() {
            return;
        }
        let alt = Grid::new(self.sx(), self.sy(), 0);
        let primary = std::mem::replace(&mut self.grid, alt);
        self.saved = Some(Box::new(AltScreen { grid: primary, cx: self.cx, cy: self.cy, cell }));
        self.sel = None;
    }

    /// Leave the alternate buffer, restoring the saved grid, cursor and pen.
    /// Returns the pen to reinstate, if the alternate screen was active.
    pub fn alternate_exit(&mut self) -> Option<Cell> {
        let saved = self.saved.take()?;
        let mut primary = saved.grid;
        // The window may have been resized while the application held the
        // alternate screen.
        primary.resize(self.grid.sx(), self.grid.sy());
        self.grid = primary;
        self.cx = saved.cx.min(self.sx().saturating_sub(1));
        self.cy = saved.cy.min(self.sy().saturating_sub(1));
        self.sel = None;
        Some(saved.cell)
    }

    pub fn resize(&mut self, sx: u16, sy: u16) {
        if sx == self.sx() && sy == self.sy() {
            return;
        }
        // Keep the cursor on an existing line when the top scrolls away.
        let shrink = (self.sy() as usize).saturating_sub(sy as usize);
        self.grid.resize(sx, sy);
        if let Some(saved) = self.saved.as_mut() {
            saved.grid.resize(sx, sy);
        }
        self.cy = self.cy.saturating_sub(shrink as u16).min(sy.saturating_sub(1));
        self.cx = self.cx.min(sx.saturating_sub(1));
        self.rupper = 0;
        self.rlower = sy.saturating_sub(1);
        self.tabs = default_tabs(sx);
        self.sel = None;
        self.images.clear();
    }

    pub fn set_selection(&mut self, sel: Selection) {
        self.sel = Some(sel);
    }

    pub fn clear_selection(&mut self) {
        self.sel = None;
    }

    /// Whether a cell sits inside the current selection overlay.
    pub fn check_selection(&self, x: u16, y: u16) -> bool {
        self.sel.map(|s| s.contains(x, y)).unwrap_or(false)
    }

    /// Drop the selection if a mutation touched rows [py, py+ny).
    pub fn invalidate_selection(&mut self, py: u16, ny: u16) {
        if let Some(s) = self.sel {
            let (top, bot) = if s.sy <= s.ey { (s.sy, s.ey) } else { (s.ey, s.sy) };
            if py <= bot && py + ny > top {
                self.sel = None;
            }
        }
    }

    pub fn set_tab(&mut self, x: u16) {
        if let Some(t) = self.tabs.get_mut(x as usize) {
            *t = true;
        }
    }

    pub fn clear_tab(&mut self, x: u16) {
        if let Some(t) = self.tabs.get_mut(x as usize) {
            *t = false;
        }
    }

    pub fn clear_tabs(&mut self) {
        self.tabs.iter_mut().for_each(|t| *t = false);
    }

    /// The next tab stop right of x, or the last column.
    pub fn next_tab(&self, x: u16) -> u16 {
        let sx = self.sx();
        for xx in x + 1..sx {
            if self.tabs.get(xx as usize).copied().unwrap_or(false) {
                return xx;
            }
        }
        sx.saturating_sub(1)
    }

    /// The previous tab stop left of x, or column zero.
    pub fn prev_tab(&self, x: u16) -> u16 {
        for xx in (0..x).rev() {
            if self.tabs.get(xx as usize).copied().unwrap_or(false) {
                return xx;
            }
        }
        0
    }
}

fn default_tabs(sx: u16) -> Vec<bool> {
    (0..sx).map(|x| x != 0 && x % 8 == 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CellData;
    use crate::grid_view;

    #[test]
    fn tabs_default_every_eight() {
        let s = Screen::new(30, 4, 0);
        assert_eq!(s.next_tab(0), 8);
        assert_eq!(s.next_tab(8), 16);
        assert_eq!(s.next_tab(25), 29);
        assert_eq!(s.prev_tab(20), 16);
        assert_eq!(s.prev_tab(3), 0);
    }

    #[test]
    fn alternate_screen_preserves_primary() {
        let mut s = Screen::new(10, 4, 50);
        grid_view::set_cell(
            s.grid_mut(),
            0,
            0,
            Cell { data: CellData::from_char('p'), ..Cell::default() },
        );
        s.cx = 3;
        s.cy = 1;
        s.alternate_enter(Cell::default());
        assert!(s.alternate_on());
        assert!(grid_view::peek(s.grid(), 0, 0).is_default());
        grid_view::set_cell(
            s.grid_mut(),
            0,
            0,
            Cell { data: CellData::from_char('a'), ..Cell::default() },
        );
        s.cx = 7;
        s.cy = 3;
        s.alternate_exit();
        assert!(!s.alternate_on());
        assert_eq!(grid_view::peek(s.grid(), 0, 0).data.as_str(), "p");
        assert_eq!((s.cx, s.cy), (3, 1));
    }

    #[test]
    fn linear_selection_spans_rows() {
        let sel = Selection { sx: 5, sy: 1, ex: 2, ey: 3, rect: false };
        assert!(sel.contains(5, 1));
        assert!(sel.contains(9, 1));
        assert!(!sel.contains(4, 1));
        assert!(sel.contains(0, 2));
        assert!(sel.contains(2, 3));
        assert!(!sel.contains(3, 3));
    }

    #[test]
    fn mutation_inside_selection_invalidates() {
        let mut s = Screen::new(10, 5, 0);
        s.set_selection(Selection { sx: 0, sy: 1, ex: 9, ey: 2, rect: false });
        s.invalidate_selection(4, 1);
        assert!(s.sel.is_some());
        s.invalidate_selection(2, 1);
        assert!(s.sel.is_none());
    }
}
