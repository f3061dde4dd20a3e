//! Sessions and winlinks. A session is an ordered set of winlinks keyed by
//! index; each winlink is one window's appearance in that session, carrying
//! the session-local index and the alert flags. Alert flags stay with the
//! winlink and are never transferred when a window is linked elsewhere.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Local};

use crate::options::Options;
use crate::window::WindowId;

pub type SessionId = usize;

/// Winlink alert flags.
pub const ALERT_BELL: u8 = 0x1;
pub const ALERT_ACTIVITY: u8 = 0x2;
pub const ALERT_SILENCE: u8 = 0x4;
pub const ALERT_CONTENT: u8 = 0x8;

pub struct Winlink {
    pub idx: usize,
    pub window: WindowId,
    pub alerts: u8,
}

pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub winlinks: BTreeMap<usize, Winlink>,
    pub current: Option<usize>,
    /// Previously-current indices, most recent last.
    pub last_stack: Vec<usize>,
    pub created: DateTime<Local>,
    pub activity: DateTime<Local>,
    pub environ: HashMap<String, String>,
    pub options: Options,
}

impl Session {
    pub fn new(id: SessionId, name: String) -> Self {
        Session {
            id,
            name,
            winlinks: BTreeMap::new(),
            current: None,
            last_stack: Vec::new(),
            created: Local::now(),
            activity: Local::now(),
            environ: HashMap::new(),
            options: Options::new(),
        }
    }

    /// The lowest free index at or above `base`.
    pub fn next_index(&self, base: usize) -> usize {
        let mut idx = base;
        while self.winlinks.contains_key(&idx) {
            idx += 1;
        }
        idx
    }

    /// A fresh winlink starts with clear alert flags, even when the window
    /// is shared from another session.
    pub fn link(&mut self, idx: usize, window: WindowId) {
        self.winlinks.insert(idx, Winlink { idx, window, alerts: 0 });
        if self.current.is_none() {
            self.current = Some(idx);
        }
    }

    pub fn unlink(&mut self, idx: usize) -> Option<Winlink> {
        let wl = self.winlinks.remove(&idx)?;
        self.last_stack.retain(|i| *i != idx);
        if self.current == Some(idx) {
            self.current = self.last_stack.pop().or_else(|| self.winlinks.keys().next().copied());
        }
        Some(wl)
    }

    pub fn current_window(&self) -> Option<WindowId> {
        let idx = self.current?;
        self.winlinks.get(&idx).map(|wl| wl.window)
    }

    /// Switch the current winlink, pushing the old one on the last-used
    /// stack and clearing the new one's alerts.
    pub fn select(&mut self, idx: usize) -> bool {
        if !self.winlinks.contains_key(&idx) || self.current == Some(idx) {
            return self.winlinks.contains_key(&idx);
        }
        if let Some(old) = self.current {
            self.last_stack.retain(|i| *i != old);
            self.last_stack.push(old);
        }
        self.current = Some(idx);
        if let Some(wl) = self.winlinks.get_mut(&idx) {
            wl.alerts = 0;
        }
        self.activity = Local::now();
        true
    }

    /// Toggle back to the previously used window.
    pub fn select_last(&mut self) -> bool {
        match self.last_stack.last().copied() {
            Some(idx) => self.select(idx),
            None => false,
        }
    }

    pub fn next_window(&mut self) -> bool {
        let cur = match self.current {
            Some(c) => c,
            None => return false,
        };
        let next = self
            .winlinks
            .range(cur + 1..)
            .next()
            .or_else(|| self.winlinks.iter().next())
            .map(|(i, _)| *i);
        match next {
            Some(idx) => self.select(idx),
            None => false,
        }
    }

    pub fn previous_window(&mut self) -> bool {
        let cur = match self.current {
            Some(c) => c,
            None => return false,
        };
        let prev = self
            .winlinks
            .range(..cur)
            .next_back()
            .or_else(|| self.winlinks.iter().next_back())
            .map(|(i, _)| *i);
        match prev {
            Some(idx) => self.select(idx),
            None => false,
        }
    }

    /// Indices of winlinks referencing a window.
    pub fn indices_of(&self, window: WindowId) -> Vec<usize> {
        self.winlinks
            .values()
            .filter(|wl| wl.window == window)
            .map(|wl| wl.idx)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_index_skips_used() {
        let mut s = Session::new(0, "main".into());
        s.link(0, 10);
        s.link(1, 11);
        s.link(3, 12);
        assert_eq!(s.next_index(0), 2);
        assert_eq!(s.next_index(3), 4);
    }

    #[test]
    fn select_pushes_last_stack() {
        let mut s = Session::new(0, "main".into());
        s.link(0, 10);
        s.link(1, 11);
        s.link(2, 12);
        assert_eq!(s.current, Some(0));
        s.select(2);
        s.select(1);
        assert!(s.select_last());
        assert_eq!(s.current, Some(2));
    }

    #[test]
    fn unlink_current_falls_back() {
        let mut s = Session::new(0, "main".into());
        s.link(0, 10);
        s.link(1, 11);
        s.select(1);
        s.unlink(1);
        assert_eq!(s.current, Some(0));
    }

    #[test]
    fn select_clears_alerts() {
        let mut s = Session::new(0, "main".into());
        s.link(0, 10);
        s.link(1, 11);
        s.winlinks.get_mut(&1).unwrap().alerts = ALERT_BELL | ALERT_ACTIVITY;
        s.select(1);
        assert_eq!(s.winlinks[&1].alerts, 0);
    }

    #[test]
    fn next_window_wraps() {
        let mut s = Session::new(0, "main".into());
        s.link(0, 10);
        s.link(2, 11);
        assert!(s.next_window());
        assert_eq!(s.current, Some(2));
        assert!(s.next_window());
        assert_eq!(s.current, Some(0));
    }
}
