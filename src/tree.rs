//! The session/window/pane tree. Everything lives in arenas keyed by stable
//! identifiers: winlinks name windows by id, layout leaves name panes by id,
//! and windows are destroyed when their last winlink goes away. Mutated only
//! from the server's single thread.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::layout::{self, LayoutCell, LayoutError, Rect, SizeSpec, SplitKind};
use crate::pane::Pane;
use crate::pty::PtyError;
use crate::session::{Session, SessionId};
use crate::window::{PaneId, Window, WindowId};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("session not found")]
    NoSession,
    #[error("window not found")]
    NoWindow,
    #[error("pane not found")]
    NoPane,
    #[error("index in use")]
    IndexInUse,
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// What collides at a requested window index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCollision {
    Fail,
    Replace,
    Shift,
}

/// Everything needed to start a pane's child.
#[derive(Clone)]
pub struct SpawnParams {
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub term: String,
    pub hlimit: usize,
}

#[derive(Default)]
pub struct Tree {
    pub sessions: HashMap<SessionId, Session>,
    pub windows: HashMap<WindowId, Window>,
    pub panes: HashMap<PaneId, Pane>,
    next_session: SessionId,
    next_window: WindowId,
    next_pane: PaneId,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    pub fn session_by_name(&self, name: &str) -> Option<&Session> {
        self.sessions.values().find(|s| s.name == name)
    }

    pub fn window_of_pane(&self, pane: PaneId) -> Option<WindowId> {
        self.windows
            .values()
            .find(|w| w.has_pane(pane))
            .map(|w| w.id)
    }

    pub fn sessions_with_window(&self, window: WindowId) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.winlinks.values().any(|wl| wl.window == window))
            .map(|s| s.id)
            .collect()
    }

    /// Create a session with one window running the given command.
    pub fn new_session(
        &mut self,
        name: String,
        sx: u16,
        sy: u16,
        params: &SpawnParams,
    ) -> Result<SessionId, TreeError> {
        let id = self.next_session;
        self.next_session += 1;
        let session = Session::new(id, name);
        let base = session.options.number("base-index").max(0) as usize;
        self.sessions.insert(id, session);

        match self.create_window(sx, sy, params) {
            Ok(window) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.link(base, window);
                }
                if let Some(w) = self.windows.get_mut(&window) {
                    w.refs = 1;
                }
                info!(session = id, "created session");
                Ok(id)
            }
            Err(e) => {
                self.sessions.remove(&id);
                Err(e)
            }
        }
    }

    fn create_window(&mut self, sx: u16, sy: u16, params: &SpawnParams) -> Result<WindowId, TreeError> {
        let pane_id = self.next_pane;
        self.next_pane += 1;
        let rect = Rect { xoff: 0, yoff: 0, sx, sy };
        let pane = Pane::new(
            pane_id,
            rect,
            params.shell.clone(),
            params.args.clone(),
            params.cwd.clone(),
            &params.env,
            &params.term,
            params.hlimit,
        )?;
        self.panes.insert(pane_id, pane);

        let id = self.next_window;
        self.next_window += 1;
        let name = std::path::Path::new(&params.shell)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("shell")
            .to_string();
        let layout = LayoutCell::leaf(pane_id, sx, sy);
        self.windows
            .insert(id, Window::new(id, name, layout, pane_id, sx, sy));
        Ok(id)
    }

    /// Add a window to a session. The index is the lowest free one at or
    /// above the base, or the caller's choice with the collision rule
    /// applied.
    pub fn new_window(
        &mut self,
        session: SessionId,
        index: Option<usize>,
        collision: IndexCollision,
        params: &SpawnParams,
    ) -> Result<usize, TreeError> {
        let s = self.sessions.get(&session).ok_or(TreeError::NoSession)?;
        let base = s.options.number("base-index").max(0) as usize;
        let (sx, sy) = self
            .sessions
            .get(&session)
            .and_then(|s| s.current_window())
            .and_then(|w| self.windows.get(&w))
            .map(|w| (w.sx, w.sy))
            .unwrap_or((80, 24));

        let idx = self.resolve_index(session, index, collision, base)?;
        let window = self.create_window(sx, sy, params)?;
        if let Some(w) = self.windows.get_mut(&window) {
            w.refs += 1;
        }
        let s = self.sessions.get_mut(&session).ok_or(TreeError::NoSession)?;
        s.link(idx, window);
        s.select(idx);
        Ok(idx)
    }

    fn resolve_index(
        &mut self,
        session: SessionId,
        index: Option<usize>,
        collision: IndexCollision,
        base: usize,
    ) -> Result<usize, TreeError> {
        let s = self.sessions.get(&session).ok_or(TreeError::NoSession)?;
        let idx = match index {
            None => return Ok(s.next_index(base)),
            Some(idx) => idx,
        };
        if !s.winlinks.contains_key(&idx) {
            return Ok(idx);
        }
        match collision {
            IndexCollision::Fail => Err(TreeError::IndexInUse),
            IndexCollision::Replace => {
                self.unlink_window(session, idx)?;
                Ok(idx)
            }
            IndexCollision::Shift => {
                // Shift the occupant (and any chain above it) up by one.
                let s = self.sessions.get_mut(&session).ok_or(TreeError::NoSession)?;
                let mut to_move = Vec::new();
                let mut probe = idx;
                while s.winlinks.contains_key(&probe) {
                    to_move.push(probe);
                    probe += 1;
                }
                for i in to_move.into_iter().rev() {
                    if let Some(mut wl) = s.winlinks.remove(&i) {
                        wl.idx = i + 1;
                        if s.current == Some(i) {
                            s.current = Some(i + 1);
                        }
                        s.winlinks.insert(i + 1, wl);
                    }
                }
                Ok(idx)
            }
        }
    }

    /// Share an existing window into another session by reference.
    pub fn link_window(
        &mut self,
        window: WindowId,
        dst_session: SessionId,
        dst_index: Option<usize>,
        collision: IndexCollision,
    ) -> Result<usize, TreeError> {
        if !self.windows.contains_key(&window) {
            return Err(TreeError::NoWindow);
        }
        let base = self
            .sessions
            .get(&dst_session)
            .ok_or(TreeError::NoSession)?
            .options
            .number("base-index")
            .max(0) as usize;
        let idx = self.resolve_index(dst_session, dst_index, collision, base)?;
        let s = self.sessions.get_mut(&dst_session).ok_or(TreeError::NoSession)?;
        s.link(idx, window);
        if let Some(w) = self.windows.get_mut(&window) {
            w.refs += 1;
        }
        Ok(idx)
    }

    /// Drop a winlink. When the window's reference count reaches zero the
    /// window and its panes are destroyed, pending pty writes discarded.
    pub fn unlink_window(&mut self, session: SessionId, idx: usize) -> Result<(), TreeError> {
        let s = self.sessions.get_mut(&session).ok_or(TreeError::NoSession)?;
        let wl = s.unlink(idx).ok_or(TreeError::NoWindow)?;
        let window = wl.window;
        let w = self.windows.get_mut(&window).ok_or(TreeError::NoWindow)?;
        w.refs = w.refs.saturating_sub(1);
        if w.refs == 0 {
            self.destroy_window(window);
        }
        Ok(())
    }

    fn destroy_window(&mut self, window: WindowId) {
        if let Some(w) = self.windows.remove(&window) {
            for pane in w.panes() {
                if let Some(mut p) = self.panes.remove(&pane) {
                    p.kill();
                }
            }
            debug!(window, "destroyed window");
        }
    }

    /// Destroy a session: unlink everything it references. Returns windows
    /// that survived because they are linked elsewhere.
    pub fn destroy_session(&mut self, session: SessionId) {
        let indices: Vec<usize> = match self.sessions.get(&session) {
            Some(s) => s.winlinks.keys().copied().collect(),
            None => return,
        };
        for idx in indices {
            let _ = self.unlink_window(session, idx);
        }
        self.sessions.remove(&session);
        info!(session, "destroyed session");
    }

    /// Split a pane, inserting the new pane adjacent to it. The new pane
    /// inherits the window's size constraints through the layout.
    pub fn split_pane(
        &mut self,
        pane: PaneId,
        kind: SplitKind,
        spec: SizeSpec,
        before: bool,
        params: &SpawnParams,
    ) -> Result<PaneId, TreeError> {
        let window = self.window_of_pane(pane).ok_or(TreeError::NoPane)?;
        let new_id = self.next_pane;

        {
            let w = self.windows.get_mut(&window).ok_or(TreeError::NoWindow)?;
            layout::split_pane(&mut w.layout, pane, kind, spec, new_id, before)?;
        }
        self.next_pane += 1;

        let rects = self.windows[&window].layout.pane_rects();
        let new_rect = rects
            .iter()
            .find(|(p, _)| *p == new_id)
            .map(|(_, r)| *r)
            .ok_or(TreeError::NoPane)?;

        let new_pane = Pane::new(
            new_id,
            new_rect,
            params.shell.clone(),
            params.args.clone(),
            params.cwd.clone(),
            &params.env,
            &params.term,
            params.hlimit,
        );
        let new_pane = match new_pane {
            Ok(p) => p,
            Err(e) => {
                // Spawn failed: put the layout back the way it was.
                if let Some(w) = self.windows.get_mut(&window) {
                    let _ = layout::remove_pane(&mut w.layout, new_id);
                }
                return Err(e.into());
            }
        };
        self.panes.insert(new_id, new_pane);
        self.apply_layout_rects(window, 0, 0);

        if let Some(w) = self.windows.get_mut(&window) {
            w.select_pane(new_id);
        }
        Ok(new_id)
    }

    /// Kill a pane. Always succeeds for a known pane; killing the last pane
    /// destroys the window (and any session left windowless).
    pub fn kill_pane(&mut self, pane: PaneId) -> Result<(), TreeError> {
        let window = self.window_of_pane(pane).ok_or(TreeError::NoPane)?;
        let collapsed = {
            let w = self.windows.get_mut(&window).ok_or(TreeError::NoWindow)?;
            layout::remove_pane(&mut w.layout, pane)?
        };
        if let Some(mut p) = self.panes.remove(&pane) {
            p.kill();
        }
        if !collapsed {
            // The pane was the window's root leaf.
            self.kill_window_everywhere(window);
            return Ok(());
        }
        self.apply_layout_rects(window, 0, 0);
        if let Some(w) = self.windows.get_mut(&window) {
            w.fix_active();
        }
        Ok(())
    }

    /// Remove every winlink referencing a window, destroying it, and drop
    /// sessions that end up empty.
    pub fn kill_window_everywhere(&mut self, window: WindowId) {
        let sessions = self.sessions_with_window(window);
        for sid in sessions {
            let indices: Vec<usize> = self.sessions[&sid].indices_of(window);
            for idx in indices {
                let _ = self.unlink_window(sid, idx);
            }
        }
        let empty: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.winlinks.is_empty())
            .map(|s| s.id)
            .collect();
        for sid in empty {
            self.destroy_session(sid);
        }
    }

    /// Resize a window, recomputing the layout proportionally. Best-effort:
    /// on failure the window keeps its previous layout.
    pub fn resize_window(
        &mut self,
        window: WindowId,
        sx: u16,
        sy: u16,
        xpixel: u16,
        ypixel: u16,
    ) -> Result<(), TreeError> {
        let w = self.windows.get_mut(&window).ok_or(TreeError::NoWindow)?;
        if w.sx == sx && w.sy == sy {
            return Ok(());
        }
        layout::resize(&mut w.layout, sx, sy)?;
        w.sx = sx;
        w.sy = sy;
        self.apply_layout_rects(window, xpixel, ypixel);
        Ok(())
    }

    /// Push the layout's rects down to the panes; panes whose size changed
    /// get a new pty winsize.
    pub fn apply_layout_rects(&mut self, window: WindowId, xpixel: u16, ypixel: u16) {
        let rects = match self.windows.get(&window) {
            Some(w) => w.layout.pane_rects(),
            None => return,
        };
        for (pane, rect) in rects {
            if let Some(p) = self.panes.get_mut(&pane) {
                p.resize(rect, xpixel, ypixel);
            }
        }
    }

    pub fn select_window(&mut self, session: SessionId, idx: usize) -> Result<(), TreeError> {
        let s = self.sessions.get_mut(&session).ok_or(TreeError::NoSession)?;
        if s.select(idx) {
            Ok(())
        } else {
            Err(TreeError::NoWindow)
        }
    }

    pub fn select_pane(&mut self, window: WindowId, pane: PaneId) -> Result<(), TreeError> {
        let w = self.windows.get_mut(&window).ok_or(TreeError::NoWindow)?;
        if !w.has_pane(pane) {
            return Err(TreeError::NoPane);
        }
        w.select_pane(pane);
        Ok(())
    }

    /// The pane input should go to for a session: the active pane of the
    /// current window.
    pub fn active_pane(&self, session: SessionId) -> Option<PaneId> {
        let s = self.sessions.get(&session)?;
        let w = self.windows.get(&s.current_window()?)?;
        Some(w.active)
    }

    /// Reap dead panes across the tree. Returns the panes that died this
    /// call; the caller decides (per remain-on-exit) whether to collapse.
    pub fn check_dead_panes(&mut self) -> Vec<PaneId> {
        let mut dead = Vec::new();
        for (id, pane) in self.panes.iter_mut() {
            if pane.check_dead() {
                dead.push(*id);
            }
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SpawnParams {
        SpawnParams {
            shell: "/bin/sh".into(),
            args: vec!["-c".into(), "sleep 600".into()],
            cwd: None,
            env: Vec::new(),
            term: "screen-256color".into(),
            hlimit: 100,
        }
    }

    #[test]
    fn session_window_pane_lifecycle() {
        let mut tree = Tree::new();
        let sid = tree.new_session("main".into(), 80, 24, &params()).unwrap();
        assert_eq!(tree.sessions.len(), 1);
        assert_eq!(tree.windows.len(), 1);
        assert_eq!(tree.panes.len(), 1);

        let wid = tree.sessions[&sid].current_window().unwrap();
        let active = tree.active_pane(sid).unwrap();
        let new = tree
            .split_pane(active, SplitKind::LeftRight, SizeSpec::Half, false, &params())
            .unwrap();
        assert_eq!(tree.panes.len(), 2);
        assert_eq!(tree.windows[&wid].active, new);

        tree.kill_pane(new).unwrap();
        assert_eq!(tree.panes.len(), 1);
        assert_eq!(tree.windows[&wid].active, active);

        // Killing the last pane destroys the window and the session.
        tree.kill_pane(active).unwrap();
        assert!(tree.windows.is_empty());
        assert!(tree.sessions.is_empty());
    }

    #[test]
    fn linked_window_survives_one_unlink() {
        let mut tree = Tree::new();
        let a = tree.new_session("a".into(), 80, 24, &params()).unwrap();
        let b = tree.new_session("b".into(), 80, 24, &params()).unwrap();
        let wid = tree.sessions[&a].current_window().unwrap();
        tree.link_window(wid, b, None, IndexCollision::Fail).unwrap();
        assert_eq!(tree.windows[&wid].refs, 2);

        let idx = tree.sessions[&a].indices_of(wid)[0];
        tree.unlink_window(a, idx).unwrap();
        assert!(tree.windows.contains_key(&wid));
        assert_eq!(tree.windows[&wid].refs, 1);
    }

    #[test]
    fn index_collision_fail_and_shift() {
        let mut tree = Tree::new();
        let sid = tree.new_session("main".into(), 80, 24, &params()).unwrap();
        let first = *tree.sessions[&sid].winlinks.keys().next().unwrap();
        assert!(matches!(
            tree.new_window(sid, Some(first), IndexCollision::Fail, &params()),
            Err(TreeError::IndexInUse)
        ));
        tree.new_window(sid, Some(first), IndexCollision::Shift, &params()).unwrap();
        let indices: Vec<usize> = tree.sessions[&sid].winlinks.keys().copied().collect();
        assert_eq!(indices, vec![first, first + 1]);
    }

    #[test]
    fn resize_window_failure_keeps_layout() {
        let mut tree = Tree::new();
        let sid = tree.new_session("main".into(), 80, 24, &params()).unwrap();
        let active = tree.active_pane(sid).unwrap();
        tree.split_pane(active, SplitKind::LeftRight, SizeSpec::Half, false, &params())
            .unwrap();
        let wid = tree.sessions[&sid].current_window().unwrap();
        let before = tree.windows[&wid].layout.clone();
        assert!(tree.resize_window(wid, 3, 24, 0, 0).is_err());
        assert_eq!(tree.windows[&wid].layout, before);
    }
}
