//! Server-side state for one connected client: the socket with its frame
//! codec, the terminal handed over during identify, key-decode state, and
//! the per-client overlay and redraw flags.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Instant;

use tracing::debug;

use crate::event_loop::TimerId;
use crate::protocol::{self, FrameCodec, IdentifyData, Message};
use crate::session::SessionId;
use crate::tty::Tty;
use crate::tty_keys::TtyKeys;

pub type ClientId = usize;

pub const CLIENT_ATTACHED: u32 = 0x1;
pub const CLIENT_DEAD: u32 = 0x2;
pub const CLIENT_BAD: u32 = 0x4;
pub const CLIENT_SUSPENDED: u32 = 0x8;
pub const CLIENT_READONLY: u32 = 0x10;
pub const CLIENT_IDENTIFIED: u32 = 0x20;
/// Everything must be repainted at the next render tick.
pub const CLIENT_REDRAW: u32 = 0x40;
/// Only the status row needs repainting.
pub const CLIENT_STATUS: u32 = 0x80;

pub struct Connection {
    pub id: ClientId,
    sock: OwnedFd,
    pub codec: FrameCodec,
    /// Socket frames waiting for writability.
    pub sock_out: Vec<u8>,
    pub flags: u32,
    pub session: Option<SessionId>,

    // Populated by Identify.
    pub term: String,
    pub caps: u32,
    pub sx: u16,
    pub sy: u16,
    pub xpixel: u16,
    pub ypixel: u16,
    pub cwd: String,
    pub tty: Option<Tty>,
    pub tty_in: Option<OwnedFd>,

    pub keys: TtyKeys,
    /// The prefix key was seen; the next key is looked up in the prefix
    /// table.
    pub prefix_armed: bool,
    /// Armed by a repeat-flagged binding until the repeat timer fires.
    pub repeat_armed: bool,
    pub repeat_timer: Option<TimerId>,
    pub escape_timer: Option<TimerId>,

    /// Message overlay shown on the status row, with its dismiss timer.
    pub message: Option<String>,
    pub message_timer: Option<TimerId>,

    pub last_activity: Instant,
}

impl Connection {
    pub fn new(id: ClientId, sock: OwnedFd) -> Self {
        Connection {
            id,
            sock,
            codec: FrameCodec::new(),
            sock_out: Vec::new(),
            flags: 0,
            session: None,
            term: String::new(),
            caps: 0,
            sx: 80,
            sy: 24,
            xpixel: 0,
            ypixel: 0,
            cwd: String::new(),
            tty: None,
            tty_in: None,
            keys: TtyKeys::new(),
            prefix_armed: false,
            repeat_armed: false,
            repeat_timer: None,
            escape_timer: None,
            message: None,
            message_timer: None,
            last_activity: Instant::now(),
        }
    }

    pub fn sock_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn attached(&self) -> bool {
        self.flags & CLIENT_ATTACHED != 0 && self.flags & CLIENT_DEAD == 0
    }

    /// Absorb an Identify message: capabilities, size, and the passed
    /// descriptors (stdin for keys, stdout for rendering).
    pub fn identify(&mut self, data: IdentifyData, mut fds: Vec<OwnedFd>) {
        self.term = data.term;
        self.caps = data.caps;
        self.sx = data.sx.max(1);
        self.sy = data.sy.max(1);
        self.xpixel = data.xpixel;
        self.ypixel = data.ypixel;
        self.cwd = data.cwd;
        // The descriptors stay blocking until attach: a control client keeps
        // using its own stdio and shares the open file descriptions with us.
        if !fds.is_empty() {
            self.tty_in = Some(fds.remove(0));
        }
        if !fds.is_empty() {
            self.tty = Some(Tty::new(fds.remove(0), self.caps));
        }
        self.flags |= CLIENT_IDENTIFIED;
        debug!(client = self.id, term = %self.term, "client identified");
    }

    /// Queue a protocol message for the client.
    pub fn send(&mut self, msg: &Message) {
        match protocol::encode(msg, 0) {
            Ok(bytes) => self.sock_out.extend_from_slice(&bytes),
            Err(e) => debug!(client = self.id, "encode failed: {e}"),
        }
    }

    /// Flush pending socket frames; false when the socket died.
    pub fn flush_sock(&mut self) -> bool {
        while !self.sock_out.is_empty() {
            let fd = unsafe { BorrowedFd::borrow_raw(self.sock.as_raw_fd()) };
            match rustix::io::write(fd, &self.sock_out) {
                Ok(0) => return false,
                Ok(n) => {
                    self.sock_out.drain(..n);
                }
                Err(rustix::io::Errno::AGAIN) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(_) => return false,
            }
        }
        true
    }

    pub fn wants_sock_write(&self) -> bool {
        !self.sock_out.is_empty()
    }

    pub fn set_message(&mut self, text: String) {
        self.message = Some(text);
        self.flags |= CLIENT_STATUS;
    }

    pub fn clear_message(&mut self) {
        if self.message.take().is_some() {
            self.flags |= CLIENT_STATUS;
        }
    }

    /// Rows available to the window area once the status row is reserved.
    pub fn window_rows(&self, status_on: bool) -> u16 {
        if status_on {
            self.sy.saturating_sub(1).max(1)
        } else {
            self.sy
        }
    }
}
