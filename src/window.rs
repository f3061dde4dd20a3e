//! Windows: a named set of panes arranged by a layout tree. Windows are
//! stored in an arena keyed by id and reference-counted by the winlinks
//! pointing at them; the last unlink destroys the window and its panes.

use crate::layout::LayoutCell;

pub type WindowId = usize;
pub type PaneId = usize;

pub struct Window {
    pub id: WindowId,
    pub name: String,
    pub layout: LayoutCell,
    pub active: PaneId,
    pub last_active: Option<PaneId>,
    /// Number of winlinks referencing this window.
    pub refs: usize,
    pub sx: u16,
    pub sy: u16,
    /// A manual size overrides the attached-client minimum.
    pub manual_size: Option<(u16, u16)>,
    /// The name was set explicitly and must not track the active pane.
    pub manual_name: bool,
    /// Position in the preset-layout cycle.
    pub layout_preset: usize,
}

impl Window {
    pub fn new(id: WindowId, name: String, layout: LayoutCell, active: PaneId, sx: u16, sy: u16) -> Self {
        Window {
            id,
            name,
            layout,
            active,
            last_active: None,
            refs: 0,
            sx,
            sy,
            manual_size: None,
            manual_name: false,
            layout_preset: 0,
        }
    }

    pub fn panes(&self) -> Vec<PaneId> {
        self.layout.panes()
    }

    pub fn has_pane(&self, pane: PaneId) -> bool {
        self.layout.find_pane(pane).is_some()
    }

    /// Make a pane current, remembering the previous one for toggling.
    pub fn select_pane(&mut self, pane: PaneId) {
        if pane == self.active {
            return;
        }
        if self.has_pane(pane) {
            self.last_active = Some(self.active);
            self.active = pane;
        }
    }

    /// After a pane goes away, move the active marker somewhere valid.
    pub fn fix_active(&mut self) {
        if self.has_pane(self.active) {
            return;
        }
        if let Some(last) = self.last_active.take() {
            if self.has_pane(last) {
                self.active = last;
                return;
            }
        }
        if let Some(first) = self.panes().first() {
            self.active = *first;
        }
    }
}
