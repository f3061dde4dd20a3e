//! Visible-region adapters over the grid. Everything here takes coordinates
//! relative to the visible screen area and translates by the history size
//! before touching the grid proper.

use crate::grid::{Cell, Grid};

#[inline]
fn view_y(gd: &Grid, y: u16) -> usize {
    gd.hsize() + y as usize
}

pub fn peek<'a>(gd: &'a Grid, x: u16, y: u16) -> &'a Cell {
    gd.peek(x, view_y(gd, y))
}

pub fn get<'a>(gd: &'a mut Grid, x: u16, y: u16) -> Option<&'a mut Cell> {
    let yy = view_y(gd, y);
    gd.get(x, yy)
}

pub fn set_cell(gd: &mut Grid, x: u16, y: u16, cell: Cell) {
    let yy = view_y(gd, y);
    gd.set_cell(x, yy, cell);
}

pub fn clear(gd: &mut Grid, x: u16, y: u16, nx: u16, ny: u16) {
    let yy = view_y(gd, y);
    gd.clear(x, yy, nx, ny as usize);
}

pub fn line_wrapped(gd: &Grid, y: u16) -> bool {
    gd.line(view_y(gd, y)).map(|l| l.wrapped).unwrap_or(false)
}

pub fn set_line_wrapped(gd: &mut Grid, y: u16, wrapped: bool) {
    let yy = view_y(gd, y);
    if let Some(line) = gd.line_mut(yy) {
        line.wrapped = wrapped;
    }
}

pub fn line_cellsize(gd: &Grid, y: u16) -> usize {
    gd.line(view_y(gd, y)).map(|l| l.cellsize()).unwrap_or(0)
}

/// Scroll the region up one line. A full-height region archives the top
/// line when history is on; a partial region always discards it.
pub fn scroll_region_up(gd: &mut Grid, rupper: u16, rlower: u16) {
    if gd.history_enabled() && rupper == 0 && rlower == gd.sy() - 1 {
        gd.scroll_history();
    } else {
        let top = view_y(gd, rupper);
        let bot = view_y(gd, rlower);
        if gd.history_enabled() {
            gd.scroll_history_region(top, bot);
        } else {
            gd.clear_lines(top, 1);
            gd.move_lines(top, top + 1, bot - top);
            gd.clear_lines(bot, 1);
        }
    }
}

/// Scroll the region down one line; the bottom line is lost.
pub fn scroll_region_down(gd: &mut Grid, rupper: u16, rlower: u16) {
    let top = view_y(gd, rupper);
    let bot = view_y(gd, rlower);
    gd.clear_lines(bot, 1);
    gd.move_lines(top + 1, top, bot - top);
    gd.clear_lines(top, 1);
}

/// Insert blank lines at py inside [py, rlower], pushing lines down.
pub fn insert_lines(gd: &mut Grid, rlower: u16, py: u16, ny: u16) {
    let bot = view_y(gd, rlower);
    let top = view_y(gd, py);
    let keep = bot + 1 - top - ny as usize;
    if keep > 0 {
        gd.move_lines(top + ny as usize, top, keep);
    }
    gd.clear_lines(top, (ny as usize).min(bot + 1 - top));
}

/// Delete ny lines at py inside [py, rlower], pulling lines up.
pub fn delete_lines(gd: &mut Grid, rlower: u16, py: u16, ny: u16) {
    let bot = view_y(gd, rlower);
    let top = view_y(gd, py);
    let keep = bot + 1 - top - ny as usize;
    if keep > 0 {
        gd.move_lines(top, top + ny as usize, keep);
    }
    gd.clear_lines(top + keep, ny as usize);
}

/// Insert blank cells at the cursor, shifting the rest of the line right.
pub fn insert_cells(gd: &mut Grid, px: u16, py: u16, nx: u16) {
    let yy = view_y(gd, py);
    let sx = gd.sx();
    if px >= sx - 1 || px + nx >= sx {
        gd.clear(px, yy, sx - px, 1);
    } else {
        gd.move_cells(px + nx, px, yy, sx - px - nx);
        gd.clear_cells(px, yy, nx);
    }
}

/// Delete cells at the cursor, shifting the rest of the line left.
pub fn delete_cells(gd: &mut Grid, px: u16, py: u16, nx: u16) {
    let yy = view_y(gd, py);
    let sx = gd.sx();
    if px + nx >= sx {
        gd.clear(px, yy, sx - px, 1);
    } else {
        gd.move_cells(px, px + nx, yy, sx - px - nx);
        gd.clear_cells(sx - nx, yy, nx);
    }
}

/// Scroll every used visible line into history, leaving the view blank.
pub fn clear_into_history(gd: &mut Grid) {
    let mut last = 0;
    for y in 0..gd.sy() {
        if line_cellsize(gd, y) != 0 {
            last = y + 1;
        }
    }
    for _ in 0..last {
        gd.scroll_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CellData;

    fn put(gd: &mut Grid, x: u16, y: u16, ch: char) {
        set_cell(gd, x, y, Cell { data: CellData::from_char(ch), ..Cell::default() });
    }

    fn at(gd: &Grid, x: u16, y: u16) -> String {
        peek(gd, x, y).data.as_str().to_string()
    }

    #[test]
    fn insert_lines_pushes_down_within_region() {
        let mut gd = Grid::new(4, 4, 0);
        for y in 0..4 {
            put(&mut gd, 0, y, (b'a' + y as u8) as char);
        }
        insert_lines(&mut gd, 3, 1, 1);
        assert_eq!(at(&gd, 0, 0), "a");
        assert_eq!(at(&gd, 0, 1), " ");
        assert_eq!(at(&gd, 0, 2), "b");
        assert_eq!(at(&gd, 0, 3), "c");
    }

    #[test]
    fn delete_cells_shifts_left_and_blanks_tail() {
        let mut gd = Grid::new(6, 1, 0);
        for x in 0..6 {
            put(&mut gd, x, 0, (b'0' + x as u8) as char);
        }
        delete_cells(&mut gd, 1, 0, 2);
        assert_eq!(at(&gd, 0, 0), "0");
        assert_eq!(at(&gd, 1, 0), "3");
        assert_eq!(at(&gd, 3, 0), "5");
        assert_eq!(at(&gd, 4, 0), " ");
    }

    #[test]
    fn full_region_scroll_archives_top_line() {
        let mut gd = Grid::new(4, 3, 10);
        put(&mut gd, 0, 0, 'a');
        put(&mut gd, 0, 1, 'b');
        scroll_region_up(&mut gd, 0, 2);
        assert_eq!(gd.hsize(), 1);
        assert_eq!(gd.peek(0, 0).data.as_str(), "a");
        assert_eq!(at(&gd, 0, 0), "b");
    }
}
