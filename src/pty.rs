//! Pseudo-terminal allocation and child shell management.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use rustix::termios::{tcsetwinsize, Winsize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(std::io::Error),

    #[error("failed to spawn shell: {0}")]
    Spawn(std::io::Error),

    #[error("failed to set window size: {0}")]
    Winsize(rustix::io::Errno),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The master side of one pane's pty plus its child process.
pub struct Pty {
    master: File,
    child: Child,
    winsize: Winsize,
    exited: Option<i32>,
}

/// What to run in a new pane.
pub struct SpawnContext<'a> {
    pub shell: &'a str,
    pub args: &'a [String],
    pub cwd: Option<&'a str>,
    pub env: &'a [(String, String)],
    pub term: &'a str,
}

impl Pty {
    /// Open a master/slave pair, set the winsize, and spawn the command with
    /// the slave as its controlling terminal.
    pub fn spawn(ctx: &SpawnContext, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let winsize = Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };

        let master_fd = rustix::pty::openpt(
            rustix::pty::OpenptFlags::RDWR | rustix::pty::OpenptFlags::NOCTTY,
        )
        .map_err(|e| PtyError::Open(std::io::Error::from_raw_os_error(e.raw_os_error())))?;
        rustix::pty::grantpt(&master_fd)
            .map_err(|e| PtyError::Open(std::io::Error::from_raw_os_error(e.raw_os_error())))?;
        rustix::pty::unlockpt(&master_fd)
            .map_err(|e| PtyError::Open(std::io::Error::from_raw_os_error(e.raw_os_error())))?;

        let slave_path = rustix::pty::ptsname(&master_fd, Vec::new())
            .map_err(|e| PtyError::Open(std::io::Error::from_raw_os_error(e.raw_os_error())))?;
        let slave_path = slave_path.to_string_lossy().into_owned();

        tcsetwinsize(&master_fd, winsize).map_err(PtyError::Winsize)?;

        let slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&slave_path)
            .map_err(PtyError::Open)?;
        let slave_fd = slave.into_raw_fd();

        // Each Stdio must own a distinct descriptor.
        let slave_out = unsafe { libc::dup(slave_fd) };
        let slave_err = unsafe { libc::dup(slave_fd) };
        if slave_out < 0 || slave_err < 0 {
            unsafe {
                libc::close(slave_fd);
                if slave_out >= 0 {
                    libc::close(slave_out);
                }
            }
            return Err(PtyError::Open(std::io::Error::last_os_error()));
        }

        let mut cmd = Command::new(ctx.shell);
        cmd.args(ctx.args);
        cmd.env("TERM", ctx.term);
        for (k, v) in ctx.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = ctx.cwd {
            if std::path::Path::new(cwd).is_dir() {
                cmd.current_dir(cwd);
            }
        }

        let child = unsafe {
            cmd.stdin(Stdio::from_raw_fd(slave_fd))
                .stdout(Stdio::from_raw_fd(slave_out))
                .stderr(Stdio::from_raw_fd(slave_err))
                .pre_exec(move || {
                    // New session, and make the slave the controlling tty.
                    libc::setsid();
                    libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);
                    Ok(())
                })
                .spawn()
                .map_err(PtyError::Spawn)?
        };
        debug!(pid = child.id(), shell = ctx.shell, "spawned pane child");

        let raw = master_fd.into_raw_fd();
        let master = unsafe { File::from_raw_fd(raw) };
        set_nonblocking(master.as_raw_fd());

        Ok(Pty { master, child, winsize, exited: None })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn child_pid(&self) -> u32 {
        self.child.id()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.master.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.master.write(buf)
    }

    /// Send the child the new winsize in cells plus the pixel metrics the
    /// attached client advertised (zero when unknown).
    pub fn resize(&mut self, cols: u16, rows: u16, xpixel: u16, ypixel: u16) -> Result<(), PtyError> {
        self.winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: cols.saturating_mul(xpixel),
            ws_ypixel: rows.saturating_mul(ypixel),
        };
        tcsetwinsize(&self.master, self.winsize).map_err(PtyError::Winsize)
    }

    /// Non-blocking check for child exit. Remembers the status once seen.
    pub fn try_wait(&mut self) -> Option<i32> {
        if let Some(code) = self.exited {
            return Some(code);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                self.exited = Some(code);
                Some(code)
            }
            _ => None,
        }
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if self.exited.is_none() {
            let _ = self.child.kill();
        }
        let _ = self.child.try_wait();
    }
}

pub fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Resolve the shell for new panes: the default-shell option, $SHELL, or
/// the first common shell on PATH.
pub fn default_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured {
        if !shell.is_empty() {
            return shell.to_string();
        }
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for candidate in ["zsh", "bash", "sh"] {
        if let Ok(path) = which::which(candidate) {
            return path.to_string_lossy().into_owned();
        }
    }
    "/bin/sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_prefers_configured() {
        assert_eq!(default_shell(Some("/bin/dash")), "/bin/dash");
    }

    #[test]
    fn default_shell_never_empty() {
        assert!(!default_shell(None).is_empty());
    }
}
