//! The renderer: projects the active window of a client's session onto the
//! client terminal. Full redraws repaint every cell; incremental redraws
//! replay each pane's damage rows. Borders, the status row, the message
//! overlay, and the selection overlay are drawn here.

use crate::grid::{Cell, Colour, ATTR_REVERSE, FLAG_PADDING};
use crate::grid_view;
use crate::layout::Rect;
use crate::pane::Pane;
use crate::protocol::CAP_SIXEL;
use crate::screen::MODE_CURSOR;
use crate::session::{ALERT_ACTIVITY, ALERT_BELL, ALERT_SILENCE};
use crate::tree::Tree;
use crate::tty::Tty;
use crate::window::WindowId;

/// Where the status row sits, when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPosition {
    Top,
    Bottom,
    Off,
}

pub struct StatusConfig {
    pub position: StatusPosition,
}

impl StatusConfig {
    /// Rows of the client terminal given to the window area.
    pub fn window_rows(&self, client_sy: u16) -> u16 {
        match self.position {
            StatusPosition::Off => client_sy,
            _ => client_sy.saturating_sub(1),
        }
    }

    /// Vertical offset of the window area on the client terminal.
    pub fn window_offset(&self) -> u16 {
        match self.position {
            StatusPosition::Top => 1,
            _ => 0,
        }
    }
}

/// Repaint everything: every window cell, borders, status, cursor.
pub fn full_redraw(
    tty: &mut Tty,
    tree: &Tree,
    window_id: WindowId,
    status: &StatusConfig,
    status_text: Option<&str>,
    client_sy: u16,
) {
    let window = match tree.windows.get(&window_id) {
        Some(w) => w,
        None => return,
    };
    tty.invalidate();
    let yoff = status.window_offset();
    let rects = window.layout.pane_rects();

    for wy in 0..window.sy.min(status.window_rows(client_sy)) {
        draw_window_row(tty, tree, window_id, &rects, wy, yoff);
    }
    draw_images(tty, tree, &rects, yoff);
    if status.position != StatusPosition::Off {
        draw_status_row(tty, status_text, status.position, client_sy, window.sx);
    }
    place_cursor(tty, tree, window_id, yoff);
}

/// Replay accumulated per-pane damage as row repaints.
pub fn incremental_redraw(
    tty: &mut Tty,
    tree: &Tree,
    window_id: WindowId,
    status: &StatusConfig,
) {
    let window = match tree.windows.get(&window_id) {
        Some(w) => w,
        None => return,
    };
    let yoff = status.window_offset();
    let rects = window.layout.pane_rects();
    for (pane_id, rect) in &rects {
        let pane = match tree.panes.get(pane_id) {
            Some(p) => p,
            None => continue,
        };
        if !pane.writer.damage.any() {
            continue;
        }
        for py in 0..rect.sy {
            if pane.writer.damage.row_dirty(py) {
                draw_pane_row(tty, pane, *rect, py, yoff);
            }
        }
    }
    draw_images(tty, tree, &rects, yoff);
    place_cursor(tty, tree, window_id, yoff);
}

/// Repaint one pane's full region.
pub fn pane_redraw(tty: &mut Tty, pane: &Pane, yoff: u16) {
    for py in 0..pane.rect.sy {
        draw_pane_row(tty, pane, pane.rect, py, yoff);
    }
}

fn draw_window_row(
    tty: &mut Tty,
    tree: &Tree,
    window_id: WindowId,
    rects: &[(usize, Rect)],
    wy: u16,
    yoff: u16,
) {
    let window = match tree.windows.get(&window_id) {
        Some(w) => w,
        None => return,
    };
    // Panes covering this row paint their slices; everything else on the
    // row is border.
    let mut covered = vec![false; window.sx as usize];
    for (pane_id, rect) in rects {
        if wy < rect.yoff || wy >= rect.yoff + rect.sy {
            continue;
        }
        if let Some(pane) = tree.panes.get(pane_id) {
            draw_pane_row(tty, pane, *rect, wy - rect.yoff, yoff);
        }
        for x in rect.xoff..rect.xoff + rect.sx {
            if let Some(c) = covered.get_mut(x as usize) {
                *c = true;
            }
        }
    }
    for x in 0..window.sx {
        if covered[x as usize] {
            continue;
        }
        let ch = border_char(rects, x, wy);
        tty.cursor_move(x, wy + yoff);
        tty.set_attr(&Cell::default());
        tty.put_cell_text(ch, 1, window.sx);
    }
}

/// Pick the separator glyph from which neighbours are pane cells.
fn border_char(rects: &[(usize, Rect)], x: u16, y: u16) -> &'static str {
    let covered = |x: i32, y: i32| -> bool {
        if x < 0 || y < 0 {
            return false;
        }
        rects.iter().any(|(_, r)| r.contains(x as u16, y as u16))
    };
    let horiz = covered(x as i32 - 1, y as i32) || covered(x as i32 + 1, y as i32);
    let vert = covered(x as i32, y as i32 - 1) || covered(x as i32, y as i32 + 1);
    match (horiz, vert) {
        (true, true) => "┼",
        (true, false) => "│",
        (false, true) => "─",
        (false, false) => "┼",
    }
}

fn draw_pane_row(tty: &mut Tty, pane: &Pane, rect: Rect, py: u16, yoff: u16) {
    let screen = &pane.screen;
    let gd = screen.grid();
    tty.cursor_move(rect.xoff, rect.yoff + py + yoff);
    let mut px = 0;
    while px < rect.sx {
        let cell = grid_view::peek(gd, px, py);
        if cell.flags & FLAG_PADDING != 0 {
            px += 1;
            continue;
        }
        let mut shown = *cell;
        if screen.check_selection(px, py) {
            shown.attr ^= ATTR_REVERSE;
        }
        if pane.dead {
            shown.fg = Colour::Indexed(1);
        }
        tty.set_attr(&shown);
        let width = cell.data.width().max(1) as u16;
        // Clip a wide character that would cross the pane edge.
        if px + width > rect.sx {
            tty.put_cell_text(" ", 1, rect.xoff + rect.sx);
            px += 1;
            continue;
        }
        tty.put_cell_text(cell.data.as_str(), width, u16::MAX);
        px += width;
    }
    // The terminal cursor is somewhere inside the row now; re-anchor.
    tty.invalidate_cursor_only();
}

fn draw_images(tty: &mut Tty, tree: &Tree, rects: &[(usize, Rect)], yoff: u16) {
    for (pane_id, rect) in rects {
        let pane = match tree.panes.get(pane_id) {
            Some(p) => p,
            None => continue,
        };
        for placement in &pane.screen.images {
            let (cols, rows) = placement.image.cell_size();
            let px = rect.xoff + placement.px;
            let py = rect.yoff + placement.py + yoff;
            if tty.caps() & CAP_SIXEL != 0 {
                // Pass the image through, cropped to what fits in the pane.
                let avail_cols = rect.sx.saturating_sub(placement.px) as u32;
                let avail_rows = rect.sy.saturating_sub(placement.py) as u32;
                let cropped = if cols > avail_cols || rows > avail_rows {
                    placement.image.crop(0, 0, avail_cols, avail_rows)
                } else {
                    None
                };
                let data = match &cropped {
                    Some(img) => img.encode(),
                    None => placement.image.encode(),
                };
                tty.cursor_move(px, py);
                tty.put(&data);
                tty.invalidate();
            } else {
                // Boxed placeholder, the anchor cell marked.
                let cols = (cols as u16).min(rect.sx.saturating_sub(placement.px));
                let rows = (rows as u16).min(rect.sy.saturating_sub(placement.py));
                for iy in 0..rows {
                    tty.cursor_move(px, py + iy);
                    tty.set_attr(&Cell { attr: ATTR_REVERSE, ..Cell::default() });
                    for ix in 0..cols {
                        let ch = if ix == 0 && iy == 0 { "*" } else { " " };
                        tty.put_cell_text(ch, 1, u16::MAX);
                    }
                }
                tty.invalidate_cursor_only();
            }
        }
    }
}

/// Repaint only the status row.
pub fn status_redraw(
    tty: &mut Tty,
    text: Option<&str>,
    position: StatusPosition,
    client_sy: u16,
    sx: u16,
) {
    if position == StatusPosition::Off {
        return;
    }
    draw_status_row(tty, text, position, client_sy, sx);
}

fn draw_status_row(
    tty: &mut Tty,
    text: Option<&str>,
    position: StatusPosition,
    client_sy: u16,
    sx: u16,
) {
    let row = match position {
        StatusPosition::Top => 0,
        _ => client_sy.saturating_sub(1),
    };
    tty.cursor_move(0, row);
    let style = Cell { attr: ATTR_REVERSE, ..Cell::default() };
    tty.set_attr(&style);
    let text = text.unwrap_or("");
    let mut width = 0u16;
    for ch in text.chars() {
        let w = unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0) as u16;
        if width + w > sx {
            break;
        }
        let mut buf = [0u8; 4];
        tty.put_cell_text(ch.encode_utf8(&mut buf), w, u16::MAX);
        width += w;
    }
    for _ in width..sx {
        tty.put_cell_text(" ", 1, u16::MAX);
    }
    tty.invalidate_cursor_only();
}

/// The fixed status-line form: session name, then the window list with
/// current/last markers and alert flags.
pub fn status_text(tree: &Tree, session_id: usize) -> String {
    let session = match tree.sessions.get(&session_id) {
        Some(s) => s,
        None => return String::new(),
    };
    let mut out = format!("[{}] ", session.name);
    for (idx, wl) in &session.winlinks {
        let name = tree
            .windows
            .get(&wl.window)
            .map(|w| w.name.as_str())
            .unwrap_or("?");
        let marker = if session.current == Some(*idx) {
            "*"
        } else if session.last_stack.last() == Some(idx) {
            "-"
        } else {
            ""
        };
        let alert = if wl.alerts & ALERT_BELL != 0 {
            "!"
        } else if wl.alerts & ALERT_ACTIVITY != 0 {
            "#"
        } else if wl.alerts & ALERT_SILENCE != 0 {
            "~"
        } else {
            ""
        };
        out.push_str(&format!("{}:{}{}{} ", idx, name, marker, alert));
    }
    out
}

fn place_cursor(tty: &mut Tty, tree: &Tree, window_id: WindowId, yoff: u16) {
    let window = match tree.windows.get(&window_id) {
        Some(w) => w,
        None => return,
    };
    let pane = match tree.panes.get(&window.active) {
        Some(p) => p,
        None => return,
    };
    let screen = &pane.screen;
    let visible = screen.mode & MODE_CURSOR != 0 && !pane.dead;
    if visible {
        tty.cursor_move(pane.rect.xoff + screen.cx, pane.rect.yoff + screen.cy + yoff);
    }
    tty.cursor_show(visible);
}
