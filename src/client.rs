//! The client process: connects to the server socket, hands over its
//! terminal descriptors with Identify, and then mostly waits. The server
//! reads keys from and renders to the passed descriptors directly; the
//! client's job is the protocol handshake, window-size changes, and
//! restoring the terminal on the way out.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use rustix::termios::{self, OptionalActions, Termios};
use tracing::debug;

use crate::event_loop::{self, PollSource, SignalPipe};
use crate::protocol::{
    self, FrameCodec, IdentifyData, Message, ProtocolError, CAP_256COLOURS, CAP_ALTSCREEN,
    CAP_BRACKETPASTE, CAP_FOCUS, CAP_MOUSE_SGR, CAP_MOUSE_UTF8, CAP_MOUSE_X10, CAP_RGB,
    CAP_SIXEL, CAP_TITLE, CAP_UTF8,
};

/// Why the client stopped; maps onto the process exit code.
pub enum ClientExit {
    Normal,
    Error(String),
    CommandFailed(i32),
    NoServer,
}

impl ClientExit {
    pub fn code(&self) -> i32 {
        match self {
            ClientExit::Normal => 0,
            ClientExit::Error(_) => 1,
            ClientExit::CommandFailed(code) => *code,
            ClientExit::NoServer => 3,
        }
    }
}

/// Guess capability flags from the environment, the way the terminal would
/// have advertised them.
pub fn detect_caps() -> u32 {
    let term = std::env::var("TERM").unwrap_or_default();
    let mut caps = 0;
    if term.contains("256color") {
        caps |= CAP_256COLOURS;
    }
    let colorterm = std::env::var("COLORTERM").unwrap_or_default();
    if colorterm == "truecolor" || colorterm == "24bit" {
        caps |= CAP_RGB | CAP_256COLOURS;
    }
    let lang = std::env::var("LC_ALL")
        .or_else(|_| std::env::var("LC_CTYPE"))
        .or_else(|_| std::env::var("LANG"))
        .unwrap_or_default();
    if lang.to_lowercase().contains("utf-8") || lang.to_lowercase().contains("utf8") {
        caps |= CAP_UTF8;
    }
    if term.starts_with("xterm") || term.starts_with("screen") || term.starts_with("tmux") {
        caps |= CAP_FOCUS
            | CAP_BRACKETPASTE
            | CAP_MOUSE_X10
            | CAP_MOUSE_UTF8
            | CAP_MOUSE_SGR
            | CAP_TITLE
            | CAP_ALTSCREEN;
    }
    if term.contains("sixel") || std::env::var("RSMUX_SIXEL").is_ok() {
        caps |= CAP_SIXEL;
    }
    caps
}

fn connect(path: &Path) -> std::io::Result<OwnedFd> {
    let sock = rustix::net::socket_with(
        rustix::net::AddressFamily::UNIX,
        rustix::net::SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    )
    .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
    let addr = rustix::net::SocketAddrUnix::new(path)
        .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
    rustix::net::connect_unix(&sock, &addr)
        .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
    Ok(sock)
}

/// Connect, autostarting a server first when asked.
pub fn connect_or_start(path: &Path, autostart: bool) -> Result<OwnedFd, ClientExit> {
    if let Ok(sock) = connect(path) {
        return Ok(sock);
    }
    if !autostart {
        return Err(ClientExit::NoServer);
    }
    let exe = std::env::current_exe()
        .map_err(|e| ClientExit::Error(format!("cannot find own binary: {e}")))?;
    match std::process::Command::new(exe)
        .arg("-S")
        .arg(path)
        .arg("server")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_) => {}
        Err(e) => return Err(ClientExit::Error(format!("cannot start server: {e}"))),
    }
    // The server needs a moment to bind its socket.
    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(20));
        if let Ok(sock) = connect(path) {
            return Ok(sock);
        }
    }
    Err(ClientExit::NoServer)
}

struct RawGuard {
    saved: Option<Termios>,
}

impl RawGuard {
    fn enter() -> Self {
        let stdin = std::io::stdin();
        let saved = termios::tcgetattr(stdin.as_fd()).ok();
        if let Some(saved) = &saved {
            let mut raw = saved.clone();
            raw.make_raw();
            let _ = termios::tcsetattr(stdin.as_fd(), OptionalActions::Flush, &raw);
        }
        RawGuard { saved }
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(stdin.as_fd(), OptionalActions::Flush, saved);
        }
    }
}

fn terminal_size() -> (u16, u16) {
    let stdout = std::io::stdout();
    match termios::tcgetwinsize(stdout.as_fd()) {
        Ok(ws) if ws.ws_col > 0 && ws.ws_row > 0 => (ws.ws_col, ws.ws_row),
        _ => (80, 24),
    }
}

fn identify_data(attach: bool) -> IdentifyData {
    let (sx, sy) = terminal_size();
    IdentifyData {
        term: std::env::var("TERM").unwrap_or_else(|_| "unknown".to_string()),
        sx,
        sy,
        xpixel: 0,
        ypixel: 0,
        caps: detect_caps(),
        cwd: std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
        env: std::env::vars().collect(),
        attach,
    }
}

fn send_handshake(sock: BorrowedFd, attach: bool, argv: &[String]) -> Result<(), ClientExit> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    let fds = [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()];
    protocol::send(sock, &Message::Identify(identify_data(attach)), &fds)
        .map_err(|e| ClientExit::Error(e.to_string()))?;
    protocol::send(sock, &Message::Command { argv: argv.to_vec() }, &[])
        .map_err(|e| ClientExit::Error(e.to_string()))?;
    Ok(())
}

/// Attach to the server: raw terminal, then sit on the socket until the
/// server detaches us or shuts down. SIGWINCH turns into Resize messages.
pub fn run_attached(sock: OwnedFd, argv: &[String]) -> ClientExit {
    let signals = match SignalPipe::install() {
        Ok(s) => s,
        Err(e) => return ClientExit::Error(e.to_string()),
    };
    let _raw = RawGuard::enter();
    if let Err(e) = send_handshake(sock.as_fd(), true, argv) {
        return e;
    }

    let mut codec = FrameCodec::new();
    loop {
        let sources = [
            PollSource { fd: sock.as_raw_fd(), read: true, write: false },
            PollSource { fd: signals.fd(), read: true, write: false },
        ];
        let ready = match event_loop::wait(&sources, -1) {
            Ok(r) => r,
            Err(e) => return ClientExit::Error(e.to_string()),
        };

        if ready[1].0 {
            for signo in signals.drain() {
                if signo == libc::SIGWINCH {
                    let (sx, sy) = terminal_size();
                    let _ = protocol::send(
                        sock.as_fd(),
                        &Message::Resize { sx, sy, xpixel: 0, ypixel: 0 },
                        &[],
                    );
                } else if signo == libc::SIGTERM || signo == libc::SIGHUP {
                    return ClientExit::Normal;
                }
            }
        }

        if ready[0].0 || ready[0].2 {
            match codec.read_from(sock.as_fd()) {
                Ok(0) => return ClientExit::Error("server closed connection".to_string()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return ClientExit::Error(e.to_string()),
            }
            loop {
                match codec.next_frame() {
                    Ok(Some(frame)) => match frame.msg {
                        Message::Detach { reason } => {
                            debug!("detached: {reason}");
                            return ClientExit::Normal;
                        }
                        Message::Shutdown => return ClientExit::Normal,
                        Message::Stderr { data } => {
                            // Shown after the terminal is restored.
                            let text = String::from_utf8_lossy(&data).into_owned();
                            return ClientExit::Error(text);
                        }
                        _ => {}
                    },
                    Ok(None) => break,
                    Err(ProtocolError::VersionMismatch { theirs, ours }) => {
                        return ClientExit::Error(format!(
                            "server speaks protocol {theirs}, this client {ours}"
                        ));
                    }
                    Err(e) => return ClientExit::Error(e.to_string()),
                }
            }
        }
    }
}

/// One-shot mode: run a command against the server and relay its output.
pub fn run_control(sock: OwnedFd, argv: &[String]) -> ClientExit {
    if let Err(e) = send_handshake(sock.as_fd(), false, argv) {
        return e;
    }
    let mut codec = FrameCodec::new();
    loop {
        match codec.read_from(sock.as_fd()) {
            Ok(0) => return ClientExit::Error("server closed connection".to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return ClientExit::Error(e.to_string()),
        }
        loop {
            match codec.next_frame() {
                Ok(Some(frame)) => match frame.msg {
                    Message::Stdout { data } => {
                        use std::io::Write;
                        let _ = std::io::stdout().write_all(&data);
                    }
                    Message::Stderr { data } => {
                        use std::io::Write;
                        let _ = std::io::stderr().write_all(&data);
                    }
                    Message::CommandExit { code } => {
                        return if code == 0 {
                            ClientExit::Normal
                        } else {
                            ClientExit::CommandFailed(code)
                        };
                    }
                    Message::Shutdown | Message::Detach { .. } => return ClientExit::Normal,
                    _ => {}
                },
                Ok(None) => break,
                Err(ProtocolError::VersionMismatch { theirs, ours }) => {
                    return ClientExit::Error(format!(
                        "server speaks protocol {theirs}, this client {ours}"
                    ));
                }
                Err(e) => return ClientExit::Error(e.to_string()),
            }
        }
    }
}
