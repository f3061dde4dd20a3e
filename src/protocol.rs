//! Client/server message framing: a fixed little-endian header
//! `{ type, peer_version, payload_len, fd_count }`, a JSON payload, and
//! descriptors passed out-of-band with SCM_RIGHTS.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{BorrowedFd, OwnedFd};

use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bumped whenever the wire format changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this mark the peer bad.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

pub const HEADER_LEN: usize = 16;

/// Client capability flags carried by Identify.
pub const CAP_256COLOURS: u32 = 0x1;
pub const CAP_RGB: u32 = 0x2;
pub const CAP_UTF8: u32 = 0x4;
pub const CAP_FOCUS: u32 = 0x8;
pub const CAP_BRACKETPASTE: u32 = 0x10;
pub const CAP_MOUSE_X10: u32 = 0x20;
pub const CAP_MOUSE_UTF8: u32 = 0x40;
pub const CAP_MOUSE_SGR: u32 = 0x80;
pub const CAP_TITLE: u32 = 0x100;
pub const CAP_ALTSCREEN: u32 = 0x200;
pub const CAP_SIXEL: u32 = 0x400;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer speaks protocol {theirs}, we speak {ours}")]
    VersionMismatch { theirs: u32, ours: u32 },
    #[error("oversize message ({0} bytes)")]
    Oversize(usize),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyData {
    pub term: String,
    pub sx: u16,
    pub sy: u16,
    pub xpixel: u16,
    pub ypixel: u16,
    pub caps: u32,
    pub cwd: String,
    pub env: Vec<(String, String)>,
    /// The client wants to attach (rather than only run a command).
    pub attach: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    Version { version: u32 },
    Identify(IdentifyData),
    Ready,
    Command { argv: Vec<String> },
    CommandExit { code: i32 },
    Stdin { data: Vec<u8> },
    Stdout { data: Vec<u8> },
    Stderr { data: Vec<u8> },
    Resize { sx: u16, sy: u16, xpixel: u16, ypixel: u16 },
    Detach { reason: String },
    Shutdown,
}

impl Message {
    fn type_code(&self) -> u32 {
        match self {
            Message::Version { .. } => 1,
            Message::Identify(_) => 2,
            Message::Ready => 3,
            Message::Command { .. } => 4,
            Message::CommandExit { .. } => 5,
            Message::Stdin { .. } => 6,
            Message::Stdout { .. } => 7,
            Message::Stderr { .. } => 8,
            Message::Resize { .. } => 9,
            Message::Detach { .. } => 10,
            Message::Shutdown => 11,
        }
    }
}

/// Encode one frame. Descriptors ride in the same sendmsg call, not the
/// byte stream.
pub fn encode(msg: &Message, fd_count: u32) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&msg.type_code().to_le_bytes());
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&fd_count.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Send a frame with its descriptors in one go.
pub fn send(fd: BorrowedFd, msg: &Message, fds: &[BorrowedFd]) -> Result<(), ProtocolError> {
    let bytes = encode(msg, fds.len() as u32)?;
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(4))];
    let mut anc = SendAncillaryBuffer::new(&mut space);
    if !fds.is_empty() {
        anc.push(SendAncillaryMessage::ScmRights(fds));
    }
    let mut sent = 0;
    while sent < bytes.len() {
        let iov = [IoSlice::new(&bytes[sent..])];
        let n = if sent == 0 {
            sendmsg(fd, &iov, &mut anc, SendFlags::empty())
        } else {
            sendmsg(fd, &iov, &mut SendAncillaryBuffer::default(), SendFlags::empty())
        };
        match n {
            Ok(n) => sent += n,
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(std::io::Error::from_raw_os_error(e.raw_os_error()).into()),
        }
    }
    Ok(())
}

/// A parsed frame plus whatever descriptors arrived with it.
pub struct Frame {
    pub msg: Message,
    pub fds: Vec<OwnedFd>,
}

/// Streaming decoder: buffers socket bytes and a descriptor queue, yields
/// complete frames.
#[derive(Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec::default()
    }

    /// Pull bytes (and any passed descriptors) from the socket. Returns the
    /// byte count; zero means the peer closed.
    pub fn read_from(&mut self, fd: BorrowedFd) -> std::io::Result<usize> {
        let mut data = [0u8; 65536];
        let mut space = [0u8; rustix::cmsg_space!(ScmRights(4))];
        let mut anc = RecvAncillaryBuffer::new(&mut space);
        let n = loop {
            match recvmsg(
                fd,
                &mut [IoSliceMut::new(&mut data)],
                &mut anc,
                RecvFlags::CMSG_CLOEXEC,
            ) {
                Ok(r) => break r.bytes,
                Err(rustix::io::Errno::AGAIN) => {
                    return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
                }
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(std::io::Error::from_raw_os_error(e.raw_os_error())),
            }
        };
        for msg in anc.drain() {
            if let RecvAncillaryMessage::ScmRights(received) = msg {
                for fd in received {
                    self.fds.push_back(fd);
                }
            }
        }
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    /// Decode the next complete frame out of the buffer, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let type_code = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let peer_version =
            u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        let payload_len =
            u32::from_le_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]) as usize;
        let fd_count =
            u32::from_le_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]]) as usize;

        if peer_version > PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                theirs: peer_version,
                ours: PROTOCOL_VERSION,
            });
        }
        if payload_len > MAX_PAYLOAD {
            return Err(ProtocolError::Oversize(payload_len));
        }
        if self.buf.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }
        if fd_count > 0 && self.fds.len() < fd_count {
            // The descriptors travel with the payload bytes; wait for them.
            return Ok(None);
        }

        let payload = &self.buf[HEADER_LEN..HEADER_LEN + payload_len];
        let msg: Message = serde_json::from_slice(payload)?;
        if msg.type_code() != type_code {
            return Err(ProtocolError::UnknownType(type_code));
        }
        let fds: Vec<OwnedFd> = (0..fd_count).filter_map(|_| self.fds.pop_front()).collect();
        self.buf.drain(..HEADER_LEN + payload_len);
        Ok(Some(Frame { msg, fds }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let msg = Message::Resize { sx: 80, sy: 24, xpixel: 8, ypixel: 16 };
        let bytes = encode(&msg, 0).unwrap();
        let mut codec = FrameCodec::new();
        codec.buf.extend_from_slice(&bytes);
        let frame = codec.next_frame().unwrap().unwrap();
        assert_eq!(frame.msg, msg);
        assert!(codec.next_frame().unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits() {
        let msg = Message::Command { argv: vec!["new-window".into()] };
        let bytes = encode(&msg, 0).unwrap();
        let mut codec = FrameCodec::new();
        codec.buf.extend_from_slice(&bytes[..bytes.len() - 3]);
        assert!(codec.next_frame().unwrap().is_none());
        codec.buf.extend_from_slice(&bytes[bytes.len() - 3..]);
        assert!(codec.next_frame().unwrap().is_some());
    }

    #[test]
    fn newer_version_rejected() {
        let msg = Message::Ready;
        let mut bytes = encode(&msg, 0).unwrap();
        bytes[4..8].copy_from_slice(&(PROTOCOL_VERSION + 1).to_le_bytes());
        let mut codec = FrameCodec::new();
        codec.buf.extend_from_slice(&bytes);
        assert!(matches!(
            codec.next_frame(),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn oversize_rejected() {
        let msg = Message::Ready;
        let mut bytes = encode(&msg, 0).unwrap();
        bytes[8..12].copy_from_slice(&((MAX_PAYLOAD + 1) as u32).to_le_bytes());
        let mut codec = FrameCodec::new();
        codec.buf.extend_from_slice(&bytes);
        assert!(matches!(codec.next_frame(), Err(ProtocolError::Oversize(_))));
    }

    #[test]
    fn identify_payload_survives() {
        let id = IdentifyData {
            term: "xterm-256color".into(),
            sx: 120,
            sy: 40,
            xpixel: 8,
            ypixel: 16,
            caps: CAP_UTF8 | CAP_RGB | CAP_MOUSE_SGR,
            cwd: "/tmp".into(),
            env: vec![("LANG".into(), "C.UTF-8".into())],
            attach: true,
        };
        let bytes = encode(&Message::Identify(id.clone()), 3).unwrap();
        let mut codec = FrameCodec::new();
        codec.buf.extend_from_slice(&bytes);
        // Three descriptors are promised but have not arrived yet.
        assert!(codec.next_frame().unwrap().is_none());
    }
}
