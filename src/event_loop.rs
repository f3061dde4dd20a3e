//! Reactor plumbing for the single-threaded server loop: a cancellable
//! timer heap, the self-pipe signal funnel, and a thin wrapper over poll.
//! The server assembles its descriptor set fresh each turn; nothing here
//! blocks past the computed timeout.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use rustix::event::{PollFd, PollFlags};
use tracing::debug;

pub type TimerId = u64;

/// Cancellable one-shot timers. Cancellation is lazy: dead entries are
/// skipped when they surface.
#[derive(Default)]
pub struct Timers {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    cancelled: HashSet<TimerId>,
    next: TimerId,
}

impl Timers {
    pub fn new() -> Self {
        Timers::default()
    }

    pub fn schedule_at(&mut self, at: Instant) -> TimerId {
        let id = self.next;
        self.next += 1;
        self.heap.push(Reverse((at, id)));
        id
    }

    pub fn schedule_in(&mut self, after: std::time::Duration) -> TimerId {
        self.schedule_at(Instant::now() + after)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Milliseconds until the earliest live timer, None when idle.
    pub fn timeout_ms(&mut self, now: Instant) -> Option<i32> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if self.cancelled.remove(&id) {
                self.heap.pop();
                continue;
            }
            if at <= now {
                return Some(0);
            }
            let ms = at.duration_since(now).as_millis().min(i32::MAX as u128) as i32;
            return Some(ms.max(1));
        }
        None
    }

    /// Timers that have come due.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut out = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if !self.cancelled.remove(&id) {
                out.push(id);
            }
        }
        out
    }
}

static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(signo: libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// The self-pipe: signal handlers write the signal number, the loop polls
/// the read end and reacts on its own schedule.
pub struct SignalPipe {
    read: OwnedFd,
    // Kept only so the descriptor stays alive for the handlers.
    _write: OwnedFd,
}

impl SignalPipe {
    pub fn install() -> std::io::Result<Self> {
        let (read, write) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::NONBLOCK | rustix::pipe::PipeFlags::CLOEXEC)
            .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
        SIGNAL_PIPE_WRITE.store(write.as_raw_fd(), Ordering::Relaxed);

        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = signal_handler as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            for signo in [libc::SIGCHLD, libc::SIGTERM, libc::SIGHUP, libc::SIGWINCH, libc::SIGUSR1]
            {
                libc::sigaction(signo, &sa, std::ptr::null_mut());
            }
            // Broken pipes surface as EPIPE on the write path instead.
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        debug!("signal funnel installed");
        Ok(SignalPipe { read, _write: write })
    }

    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Drain pending signal numbers.
    pub fn drain(&self) -> Vec<i32> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match rustix::io::read(&self.read, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend(buf[..n].iter().map(|b| *b as i32)),
                Err(_) => break,
            }
        }
        out
    }
}

/// One readiness source for a poll turn.
pub struct PollSource {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

/// Poll the sources. Returns per-source (readable, writable, error) flags.
pub fn wait(sources: &[PollSource], timeout_ms: i32) -> std::io::Result<Vec<(bool, bool, bool)>> {
    let mut fds: Vec<PollFd> = sources
        .iter()
        .map(|s| {
            let mut flags = PollFlags::empty();
            if s.read {
                flags |= PollFlags::IN;
            }
            if s.write {
                flags |= PollFlags::OUT;
            }
            PollFd::from_borrowed_fd(unsafe { BorrowedFd::borrow_raw(s.fd) }, flags)
        })
        .collect();
    loop {
        match rustix::event::poll(&mut fds, timeout_ms) {
            Ok(_) => break,
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(std::io::Error::from_raw_os_error(e.raw_os_error())),
        }
    }
    Ok(fds
        .iter()
        .map(|fd| {
            let r = fd.revents();
            (
                r.intersects(PollFlags::IN | PollFlags::HUP),
                r.contains(PollFlags::OUT),
                r.intersects(PollFlags::ERR | PollFlags::NVAL),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timers_fire_in_order() {
        let mut t = Timers::new();
        let now = Instant::now();
        let a = t.schedule_at(now + Duration::from_millis(10));
        let b = t.schedule_at(now + Duration::from_millis(5));
        assert!(t.expired(now).is_empty());
        let fired = t.expired(now + Duration::from_millis(7));
        assert_eq!(fired, vec![b]);
        let fired = t.expired(now + Duration::from_millis(20));
        assert_eq!(fired, vec![a]);
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let mut t = Timers::new();
        let now = Instant::now();
        let a = t.schedule_at(now + Duration::from_millis(1));
        t.cancel(a);
        assert!(t.expired(now + Duration::from_millis(5)).is_empty());
        assert_eq!(t.timeout_ms(now), None);
    }

    #[test]
    fn timeout_reflects_earliest() {
        let mut t = Timers::new();
        let now = Instant::now();
        t.schedule_at(now + Duration::from_millis(50));
        let ms = t.timeout_ms(now).unwrap();
        assert!(ms > 0 && ms <= 50);
    }
}
