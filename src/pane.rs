//! A pane: one pty, one parser, one screen pair. The pane feeds pty bytes
//! through its parser into the screen-write layer and buffers bytes going
//! the other way until the descriptor is writable.

use std::time::Instant;

use tracing::debug;

use crate::layout::Rect;
use crate::parser::Parser;
use crate::pty::{Pty, PtyError, SpawnContext};
use crate::screen::Screen;
use crate::screen_write::ScreenWriter;
use crate::window::PaneId;

/// Cap on the bytes parsed from one pane in a single loop turn, so one busy
/// pane cannot starve the rest.
pub const READ_BUDGET: usize = 65536;

pub struct Pane {
    pub id: PaneId,
    pub pty: Option<Pty>,
    pub parser: Parser,
    pub writer: ScreenWriter,
    pub screen: Screen,
    /// The pane's rectangle inside its window.
    pub rect: Rect,
    /// Child exited; the pane may linger visibly when remain-on-exit is set.
    pub dead: bool,
    pub exit_code: Option<i32>,
    pub last_output: Instant,
    /// Bytes queued for the pty, flushed when it polls writable.
    pub out_buf: Vec<u8>,

    // What the pane runs, kept for respawn.
    shell: String,
    args: Vec<String>,
    cwd: Option<String>,
    term: String,
}

impl Pane {
    pub fn new(
        id: PaneId,
        rect: Rect,
        shell: String,
        args: Vec<String>,
        cwd: Option<String>,
        env: &[(String, String)],
        term: &str,
        hlimit: usize,
    ) -> Result<Self, PtyError> {
        let ctx = SpawnContext {
            shell: &shell,
            args: &args,
            cwd: cwd.as_deref(),
            env,
            term,
        };
        let pty = Pty::spawn(&ctx, rect.sx, rect.sy)?;
        Ok(Pane {
            id,
            pty: Some(pty),
            parser: Parser::new(true),
            writer: ScreenWriter::new(rect.sy),
            screen: Screen::new(rect.sx, rect.sy, hlimit),
            rect,
            dead: false,
            exit_code: None,
            last_output: Instant::now(),
            out_buf: Vec::new(),
            shell,
            args,
            cwd,
            term: term.to_string(),
        })
    }

    /// Run pty output through the parser into the screen. Query replies the
    /// screen-write layer produced are queued back to the pty.
    pub fn feed(&mut self, bytes: &[u8]) {
        let Pane { parser, writer, screen, .. } = self;
        parser.advance(bytes, &mut |op| writer.apply(screen, &op));
        if !self.writer.responses.is_empty() {
            let responses = std::mem::take(&mut self.writer.responses);
            self.queue_write(&responses);
        }
        self.last_output = Instant::now();
    }

    pub fn queue_write(&mut self, bytes: &[u8]) {
        if self.dead {
            return;
        }
        self.out_buf.extend_from_slice(bytes);
    }

    /// Flush as much of the output buffer as the pty will take.
    pub fn flush_writes(&mut self) {
        let pty = match &mut self.pty {
            Some(p) => p,
            None => {
                self.out_buf.clear();
                return;
            }
        };
        while !self.out_buf.is_empty() {
            match pty.write(&self.out_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.out_buf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.out_buf.clear();
                    break;
                }
            }
        }
    }

    pub fn wants_write(&self) -> bool {
        !self.out_buf.is_empty() && !self.dead && self.pty.is_some()
    }

    pub fn fd(&self) -> Option<std::os::fd::RawFd> {
        self.pty.as_ref().map(|p| p.raw_fd())
    }

    pub fn resize(&mut self, rect: Rect, xpixel: u16, ypixel: u16) {
        let size_changed = rect.sx != self.rect.sx || rect.sy != self.rect.sy;
        self.rect = rect;
        if !size_changed {
            return;
        }
        self.screen.resize(rect.sx, rect.sy);
        self.writer.damage.resize(rect.sy);
        if let Some(pty) = &mut self.pty {
            if let Err(e) = pty.resize(rect.sx, rect.sy, xpixel, ypixel) {
                debug!(pane = self.id, "winsize update failed: {e}");
            }
        }
    }

    /// Check for child exit. Returns true the first time death is seen.
    pub fn check_dead(&mut self) -> bool {
        if self.dead {
            return false;
        }
        if let Some(pty) = &mut self.pty {
            if let Some(code) = pty.try_wait() {
                self.dead = true;
                self.exit_code = Some(code);
                self.out_buf.clear();
                return true;
            }
        }
        false
    }

    /// Restart the pane's command in place. The parser is not restartable
    /// mid-stream, so a fresh instance replaces it.
    pub fn respawn(&mut self, env: &[(String, String)], hlimit: usize) -> Result<(), PtyError> {
        if let Some(mut pty) = self.pty.take() {
            pty.kill();
        }
        let ctx = SpawnContext {
            shell: &self.shell,
            args: &self.args,
            cwd: self.cwd.as_deref(),
            env,
            term: &self.term,
        };
        let pty = Pty::spawn(&ctx, self.rect.sx, self.rect.sy)?;
        self.pty = Some(pty);
        self.parser = Parser::new(true);
        self.writer = ScreenWriter::new(self.rect.sy);
        self.screen = Screen::new(self.rect.sx, self.rect.sy, hlimit);
        self.dead = false;
        self.exit_code = None;
        self.out_buf.clear();
        Ok(())
    }

    /// Kill the child and drop the pty. Queued output is discarded.
    pub fn kill(&mut self) {
        if let Some(mut pty) = self.pty.take() {
            pty.kill();
        }
        self.out_buf.clear();
        self.dead = true;
    }

    pub fn title(&self) -> &str {
        &self.screen.title
    }
}
