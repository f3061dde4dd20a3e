//! The server: owns every session, window, pane, and client, and the one
//! event loop that mediates between them. Nothing in here blocks; all I/O
//! is non-blocking and bounded per turn.

pub mod connection;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustix::fs::Mode;
use rustix::net::{
    accept, bind_unix, listen, socket_with, AddressFamily, SocketAddrUnix, SocketFlags,
    SocketType,
};
use tracing::{debug, info, warn};

use crate::command::{
    parse_command, CmdResult, Command, CommandQueue, ExternalRegistry, QueuedCommand, WakeToken,
};
use crate::event_loop::{self, PollSource, SignalPipe, TimerId, Timers};
use crate::input_keys;
use crate::keys::{InputEvent, Key, KeyEvent, MouseEvent, MOD_CTRL};
use crate::layout;
use crate::layout_string;
use crate::options::{Options, OptionValue};
use crate::pane::READ_BUDGET;
use crate::protocol::{Message, ProtocolError, PROTOCOL_VERSION};
use crate::render::{self, StatusConfig, StatusPosition};
use crate::session::{SessionId, ALERT_ACTIVITY, ALERT_BELL, ALERT_SILENCE};
use crate::tree::{IndexCollision, SpawnParams, Tree};
use crate::window::{PaneId, WindowId};

pub use connection::{
    ClientId, Connection, CLIENT_ATTACHED, CLIENT_BAD, CLIENT_DEAD, CLIENT_IDENTIFIED,
    CLIENT_READONLY, CLIENT_REDRAW, CLIENT_STATUS, CLIENT_SUSPENDED,
};

/// What a fired timer was for.
enum TimerRole {
    EscapeFlush(ClientId),
    MessageDismiss(ClientId),
    RepeatExpire(ClientId),
    StatusRefresh,
    SilenceCheck,
    ShutdownDeadline,
}

/// One default key binding in the prefix table.
struct Bind {
    key: KeyEvent,
    command: &'static str,
    repeat: bool,
}

/// The default prefix-table bindings; the command side is an ordinary
/// command string handed to the parser.
static PREFIX_TABLE: &[Bind] = &[
    Bind { key: KeyEvent { key: Key::Char('c'), mods: 0 }, command: "new-window", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('"'), mods: 0 }, command: "split-window -v", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('%'), mods: 0 }, command: "split-window -h", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('x'), mods: 0 }, command: "kill-pane", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('&'), mods: 0 }, command: "kill-window", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('d'), mods: 0 }, command: "detach-client", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('n'), mods: 0 }, command: "next-window", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('p'), mods: 0 }, command: "previous-window", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('l'), mods: 0 }, command: "last-window", repeat: false },
    Bind { key: KeyEvent { key: Key::Char('o'), mods: 0 }, command: "select-pane -t +", repeat: false },
    Bind { key: KeyEvent { key: Key::Char(';'), mods: 0 }, command: "last-pane", repeat: false },
    Bind { key: KeyEvent { key: Key::Char(' '), mods: 0 }, command: "next-layout", repeat: false },
    Bind { key: KeyEvent { key: Key::Char(']'), mods: 0 }, command: "paste-buffer", repeat: false },
    Bind { key: KeyEvent { key: Key::Left, mods: 0 }, command: "resize-pane -L 1", repeat: true },
    Bind { key: KeyEvent { key: Key::Right, mods: 0 }, command: "resize-pane -R 1", repeat: true },
    Bind { key: KeyEvent { key: Key::Up, mods: 0 }, command: "resize-pane -U 1", repeat: true },
    Bind { key: KeyEvent { key: Key::Down, mods: 0 }, command: "resize-pane -D 1", repeat: true },
];

pub struct Server {
    pub tree: Tree,
    pub clients: HashMap<ClientId, Connection>,
    pub options: Options,
    pub queue: CommandQueue,
    pub external: ExternalRegistry,
    /// Named paste buffers, most recent last.
    pub paste_buffers: Vec<(String, Vec<u8>)>,

    listener: OwnedFd,
    socket_path: PathBuf,
    timers: Timers,
    timer_roles: HashMap<TimerId, TimerRole>,
    signals: SignalPipe,
    next_client: ClientId,
    running: bool,
    /// Children spawned by run-shell, keyed by pid for SIGCHLD wakeups.
    shell_jobs: HashMap<u32, std::process::Child>,
    /// Startup-file diagnostics, shown to the first client that attaches.
    causelist: Vec<String>,
}

impl Server {
    pub fn new(socket_path: PathBuf) -> std::io::Result<Self> {
        let listener = bind_listener(&socket_path)?;
        let signals = SignalPipe::install()?;
        let mut timers = Timers::new();
        let mut timer_roles = HashMap::new();
        let t = timers.schedule_in(Duration::from_secs(1));
        timer_roles.insert(t, TimerRole::StatusRefresh);
        let t = timers.schedule_in(Duration::from_secs(1));
        timer_roles.insert(t, TimerRole::SilenceCheck);
        info!(path = %socket_path.display(), "server listening");
        Ok(Server {
            tree: Tree::new(),
            clients: HashMap::new(),
            options: Options::new(),
            queue: CommandQueue::default(),
            external: ExternalRegistry::default(),
            paste_buffers: Vec::new(),
            listener,
            socket_path,
            timers,
            timer_roles,
            signals,
            next_client: 0,
            running: true,
            shell_jobs: HashMap::new(),
            causelist: Vec::new(),
        })
    }

    /// Run each line of a startup file as a command. Failures do not stop
    /// the server; they accumulate and are shown after the first attach.
    pub fn load_startup_file(&mut self, path: &Path) {
        let (commands, causes) = crate::command::parse_startup_file(path);
        for cmd in commands {
            self.queue.push(QueuedCommand { client: None, cmd });
        }
        self.causelist.extend(causes);
    }

    pub fn spawn_params(&self, session: Option<SessionId>, cwd: Option<String>) -> SpawnParams {
        let shell = crate::pty::default_shell(Some(&self.options.string("default-shell")));
        let hlimit = self.options.number("history-limit").max(0) as usize;
        let term = self.options.string("default-terminal");
        let mut env: Vec<(String, String)> = Vec::new();
        if let Some(sid) = session {
            if let Some(s) = self.tree.sessions.get(&sid) {
                env.extend(s.environ.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            env.push((
                "RSMUX".to_string(),
                format!("{},{},{}", self.socket_path.display(), std::process::id(), sid),
            ));
        }
        SpawnParams { shell, args: Vec::new(), cwd, env, term, hlimit }
    }

    /// The single server loop. Within one turn all ready pty reads are
    /// parsed before any render is dispatched, so every attached client
    /// sees a consistent view.
    pub fn run(&mut self) -> std::io::Result<()> {
        while self.running {
            let sources = self.build_sources();
            let timeout = self
                .timers
                .timeout_ms(Instant::now())
                .unwrap_or(1000);
            let ready = event_loop::wait(&sources.list, timeout)?;

            self.handle_signals(&sources, &ready);
            self.handle_ready(&sources, &ready);
            self.fire_timers();
            self.run_queue();
            self.reap_panes();
            self.recompute_sizes();
            self.collect_alerts();
            self.render_clients();
            self.flush_all();
            self.drop_dead_clients();
        }
        self.shutdown();
        Ok(())
    }

    // ── poll source assembly ────────────────────────────────────────────

    fn build_sources(&self) -> Sources {
        let mut list = Vec::new();
        let mut tags = Vec::new();

        list.push(PollSource { fd: self.signals.fd(), read: true, write: false });
        tags.push(Tag::Signals);
        list.push(PollSource { fd: self.listener.as_raw_fd(), read: true, write: false });
        tags.push(Tag::Listener);

        for (id, c) in &self.clients {
            if c.flags & CLIENT_DEAD != 0 {
                continue;
            }
            list.push(PollSource { fd: c.sock_fd(), read: true, write: c.wants_sock_write() });
            tags.push(Tag::ClientSock(*id));
            if let Some(tty_in) = &c.tty_in {
                if c.attached() && c.flags & CLIENT_SUSPENDED == 0 {
                    list.push(PollSource { fd: tty_in.as_raw_fd(), read: true, write: false });
                    tags.push(Tag::ClientTtyIn(*id));
                }
            }
            if let Some(tty) = &c.tty {
                if tty.wants_write() {
                    list.push(PollSource { fd: tty.raw_fd(), read: false, write: true });
                    tags.push(Tag::ClientTtyOut(*id));
                }
            }
        }

        for (id, pane) in &self.tree.panes {
            if let Some(fd) = pane.fd() {
                if !pane.dead {
                    list.push(PollSource { fd, read: true, write: pane.wants_write() });
                    tags.push(Tag::Pane(*id));
                }
            }
        }

        Sources { list, tags }
    }

    fn handle_signals(&mut self, sources: &Sources, ready: &[(bool, bool, bool)]) {
        let idx = match sources.tags.iter().position(|t| matches!(t, Tag::Signals)) {
            Some(i) => i,
            None => return,
        };
        if !ready[idx].0 {
            return;
        }
        for signo in self.signals.drain() {
            match signo {
                s if s == libc::SIGCHLD => {
                    self.check_shell_jobs();
                }
                s if s == libc::SIGTERM || s == libc::SIGHUP => {
                    info!("terminating on signal {signo}");
                    self.running = false;
                }
                s if s == libc::SIGUSR1 => {
                    self.recreate_socket();
                }
                _ => {}
            }
        }
    }

    fn handle_ready(&mut self, sources: &Sources, ready: &[(bool, bool, bool)]) {
        for (i, tag) in sources.tags.iter().enumerate() {
            let (readable, writable, errored) = ready[i];
            match tag {
                Tag::Signals => {}
                Tag::Listener => {
                    if readable {
                        self.accept_clients();
                    }
                }
                Tag::ClientSock(id) => {
                    if readable || errored {
                        self.client_sock_read(*id);
                    }
                    if writable {
                        if let Some(c) = self.clients.get_mut(id) {
                            if !c.flush_sock() {
                                c.flags |= CLIENT_DEAD;
                            }
                        }
                    }
                }
                Tag::ClientTtyIn(id) => {
                    if readable || errored {
                        self.client_tty_read(*id);
                    }
                }
                Tag::ClientTtyOut(id) => {
                    if writable {
                        if let Some(c) = self.clients.get_mut(id) {
                            if let Some(tty) = &mut c.tty {
                                if !tty.flush() {
                                    c.flags |= CLIENT_DEAD;
                                }
                            }
                        }
                    }
                }
                Tag::Pane(id) => {
                    if readable || errored {
                        self.pane_read(*id);
                    }
                    if writable {
                        if let Some(p) = self.tree.panes.get_mut(id) {
                            p.flush_writes();
                        }
                    }
                }
            }
        }
    }

    // ── clients ─────────────────────────────────────────────────────────

    fn accept_clients(&mut self) {
        loop {
            match accept(&self.listener) {
                Ok(sock) => {
                    crate::pty::set_nonblocking(sock.as_raw_fd());
                    let id = self.next_client;
                    self.next_client += 1;
                    let mut conn = Connection::new(id, sock);
                    conn.send(&Message::Version { version: PROTOCOL_VERSION });
                    self.clients.insert(id, conn);
                    debug!(client = id, "accepted client");
                }
                Err(rustix::io::Errno::AGAIN) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn client_sock_read(&mut self, id: ClientId) {
        loop {
            let conn = match self.clients.get_mut(&id) {
                Some(c) => c,
                None => return,
            };
            let fd = unsafe { BorrowedFd::borrow_raw(conn.sock_fd()) };
            match conn.codec.read_from(fd) {
                Ok(0) => {
                    conn.flags |= CLIENT_DEAD;
                    return;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    conn.flags |= CLIENT_DEAD;
                    return;
                }
            }
        }
        loop {
            let conn = match self.clients.get_mut(&id) {
                Some(c) => c,
                None => return,
            };
            match conn.codec.next_frame() {
                Ok(Some(frame)) => self.handle_message(id, frame.msg, frame.fds),
                Ok(None) => break,
                Err(ProtocolError::VersionMismatch { theirs, ours }) => {
                    warn!(client = id, theirs, ours, "protocol version mismatch");
                    conn.send(&Message::Version { version: PROTOCOL_VERSION });
                    conn.flags |= CLIENT_BAD | CLIENT_DEAD;
                    break;
                }
                Err(e) => {
                    warn!(client = id, "protocol error: {e}");
                    conn.send(&Message::Stderr { data: format!("{e}\n").into_bytes() });
                    conn.flags |= CLIENT_BAD | CLIENT_DEAD;
                    break;
                }
            }
        }
    }

    fn handle_message(&mut self, id: ClientId, msg: Message, fds: Vec<OwnedFd>) {
        match msg {
            Message::Version { version } => {
                if version != PROTOCOL_VERSION {
                    if let Some(c) = self.clients.get_mut(&id) {
                        c.send(&Message::Version { version: PROTOCOL_VERSION });
                        c.flags |= CLIENT_BAD | CLIENT_DEAD;
                    }
                }
            }
            Message::Identify(data) => {
                if let Some(c) = self.clients.get_mut(&id) {
                    c.identify(data, fds);
                    c.send(&Message::Ready);
                }
            }
            Message::Command { argv } => {
                let identified = self
                    .clients
                    .get(&id)
                    .map(|c| c.flags & CLIENT_IDENTIFIED != 0)
                    .unwrap_or(false);
                if !identified {
                    if let Some(c) = self.clients.get_mut(&id) {
                        c.send(&Message::Stderr {
                            data: b"identify before sending commands\n".to_vec(),
                        });
                        c.flags |= CLIENT_BAD | CLIENT_DEAD;
                    }
                    return;
                }
                match parse_command(&argv) {
                    Ok(cmd) => {
                        self.queue.push(QueuedCommand { client: Some(id), cmd });
                    }
                    Err(e) => {
                        // Maybe an externally registered handler knows it.
                        if let Some(name) = argv.first() {
                            if self.external.find(name).is_some() {
                                self.run_external(id, &argv);
                                return;
                            }
                        }
                        if let Some(c) = self.clients.get_mut(&id) {
                            c.send(&Message::Stderr { data: format!("{e}\n").into_bytes() });
                            c.send(&Message::CommandExit { code: 2 });
                        }
                    }
                }
            }
            Message::Resize { sx, sy, xpixel, ypixel } => {
                if let Some(c) = self.clients.get_mut(&id) {
                    c.sx = sx.max(1);
                    c.sy = sy.max(1);
                    c.xpixel = xpixel;
                    c.ypixel = ypixel;
                    c.flags |= CLIENT_REDRAW;
                }
            }
            Message::Stdin { data } => {
                // Bulk input from a control client lands on the active pane
                // as a paste.
                if let Some(sid) = self.clients.get(&id).and_then(|c| c.session) {
                    self.paste_to_session(sid, &data);
                }
            }
            Message::Detach { .. } | Message::Shutdown => {
                // Client-originated copies of server-only messages.
                if let Some(c) = self.clients.get_mut(&id) {
                    c.flags |= CLIENT_DEAD;
                }
            }
            Message::Ready | Message::CommandExit { .. } | Message::Stdout { .. }
            | Message::Stderr { .. } => {}
        }
    }

    fn run_external(&mut self, id: ClientId, argv: &[String]) {
        let result = match self.external.find(&argv[0]) {
            Some(handler) => match handler.parse_args(&argv[1..]) {
                Ok(()) => handler.exec(argv),
                Err(e) => CmdResult::Error(e),
            },
            None => CmdResult::Error(format!("unknown command: {}", argv[0])),
        };
        self.finish_command(Some(id), result);
    }

    fn client_tty_read(&mut self, id: ClientId) {
        let mut events = Vec::new();
        {
            let conn = match self.clients.get_mut(&id) {
                Some(c) => c,
                None => return,
            };
            let tty_in = match &conn.tty_in {
                Some(fd) => fd,
                None => return,
            };
            let mut buf = [0u8; 4096];
            loop {
                match rustix::io::read(tty_in, &mut buf) {
                    Ok(0) => {
                        conn.flags |= CLIENT_DEAD;
                        break;
                    }
                    Ok(n) => conn.keys.feed(&buf[..n], &mut events),
                    Err(rustix::io::Errno::AGAIN) => break,
                    Err(rustix::io::Errno::INTR) => continue,
                    Err(_) => {
                        conn.flags |= CLIENT_DEAD;
                        break;
                    }
                }
            }
            conn.last_activity = Instant::now();
            // Hold a trailing lone ESC for escape-time.
            if conn.keys.pending_escape() && conn.escape_timer.is_none() {
                let escape_ms = self.options.number("escape-time").max(0) as u64;
                let t = self.timers.schedule_in(Duration::from_millis(escape_ms));
                self.timer_roles.insert(t, TimerRole::EscapeFlush(id));
                conn.escape_timer = Some(t);
            }
        }
        for ev in events {
            self.dispatch_input(id, ev);
        }
    }

    // ── input routing ───────────────────────────────────────────────────

    fn dispatch_input(&mut self, id: ClientId, event: InputEvent) {
        match event {
            InputEvent::Key(key) => self.dispatch_key(id, key),
            InputEvent::Mouse(m) => self.dispatch_mouse(id, m),
            InputEvent::Paste(data) => {
                if let Some(sid) = self.clients.get(&id).and_then(|c| c.session) {
                    self.paste_to_session(sid, &data);
                }
            }
            InputEvent::Focus(gained) => {
                if let Some(pane) = self.active_pane_of_client(id) {
                    if let Some(p) = self.tree.panes.get_mut(&pane) {
                        let bytes = input_keys::translate_focus(gained, p.screen.mode);
                        p.queue_write(&bytes);
                    }
                }
            }
        }
    }

    fn dispatch_key(&mut self, id: ClientId, key: KeyEvent) {
        let conn = match self.clients.get_mut(&id) {
            Some(c) => c,
            None => return,
        };
        if conn.flags & CLIENT_READONLY != 0 {
            return;
        }
        conn.clear_message();

        let prefix = KeyEvent { key: Key::Char('b'), mods: MOD_CTRL };
        let armed = conn.prefix_armed || conn.repeat_armed;
        if !armed {
            if key == prefix {
                conn.prefix_armed = true;
                return;
            }
            self.key_to_pane(id, key);
            return;
        }

        conn.prefix_armed = false;
        // Prefix twice sends the prefix through.
        if key == prefix && !conn.repeat_armed {
            self.key_to_pane(id, key);
            return;
        }
        // Digits select windows directly.
        if let Key::Char(d @ '0'..='9') = key.key {
            if key.mods == 0 {
                let idx = (d as u8 - b'0') as usize;
                self.queue.push(QueuedCommand {
                    client: Some(id),
                    cmd: Command::SelectWindow { index: idx },
                });
                return;
            }
        }
        if let Some(bind) = PREFIX_TABLE.iter().find(|b| b.key == key) {
            let argv: Vec<String> =
                bind.command.split_whitespace().map(str::to_string).collect();
            if let Ok(cmd) = parse_command(&argv) {
                self.queue.push(QueuedCommand { client: Some(id), cmd });
            }
            if bind.repeat {
                self.arm_repeat(id);
            } else if let Some(c) = self.clients.get_mut(&id) {
                c.repeat_armed = false;
            }
            return;
        }
        // Unbound key after the prefix is dropped; a repeat chain ends.
        if let Some(c) = self.clients.get_mut(&id) {
            if c.repeat_armed {
                c.repeat_armed = false;
                self.key_to_pane(id, key);
            }
        }
    }

    /// Keep the prefix table live for repeat-time after a repeat binding.
    fn arm_repeat(&mut self, id: ClientId) {
        let repeat_ms = self.options.number("repeat-time").max(0) as u64;
        if let Some(c) = self.clients.get_mut(&id) {
            c.repeat_armed = true;
            if let Some(t) = c.repeat_timer.take() {
                self.timers.cancel(t);
            }
            let t = self.timers.schedule_in(Duration::from_millis(repeat_ms));
            self.timer_roles.insert(t, TimerRole::RepeatExpire(id));
            c.repeat_timer = Some(t);
        }
    }

    fn key_to_pane(&mut self, id: ClientId, key: KeyEvent) {
        if let Some(pane) = self.active_pane_of_client(id) {
            if let Some(p) = self.tree.panes.get_mut(&pane) {
                let bytes = input_keys::translate_key(key, p.screen.mode);
                p.queue_write(&bytes);
            }
        }
    }

    fn dispatch_mouse(&mut self, id: ClientId, m: MouseEvent) {
        let (sid, yoff) = {
            let conn = match self.clients.get(&id) {
                Some(c) => c,
                None => return,
            };
            let sid = match conn.session {
                Some(s) => s,
                None => return,
            };
            (sid, self.status_config().window_offset())
        };
        let window_id = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
            Some(w) => w,
            None => return,
        };
        let window = match self.tree.windows.get(&window_id) {
            Some(w) => w,
            None => return,
        };
        if m.y < yoff {
            return;
        }
        let wy = m.y - yoff;
        let hit = window
            .layout
            .pane_rects()
            .into_iter()
            .find(|(_, r)| r.contains(m.x, wy));
        let (pane_id, rect) = match hit {
            Some(h) => h,
            None => return,
        };
        // A click moves the active pane.
        if matches!(m.kind, crate::keys::MouseKind::Down) {
            let _ = self.tree.select_pane(window_id, pane_id);
        }
        let local = MouseEvent { x: m.x - rect.xoff, y: wy - rect.yoff, ..m };
        if let Some(p) = self.tree.panes.get_mut(&pane_id) {
            let bytes = input_keys::translate_mouse(local, p.screen.mode);
            p.queue_write(&bytes);
        }
    }

    fn paste_to_session(&mut self, sid: SessionId, data: &[u8]) {
        if let Some(pane) = self.tree.active_pane(sid) {
            if let Some(p) = self.tree.panes.get_mut(&pane) {
                let bytes = input_keys::translate_paste(data, p.screen.mode);
                p.queue_write(&bytes);
            }
        }
    }

    fn active_pane_of_client(&self, id: ClientId) -> Option<PaneId> {
        let sid = self.clients.get(&id)?.session?;
        self.tree.active_pane(sid)
    }

    // ── panes ───────────────────────────────────────────────────────────

    fn pane_read(&mut self, id: PaneId) {
        let pane = match self.tree.panes.get_mut(&id) {
            Some(p) => p,
            None => return,
        };
        let mut total = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            if total >= READ_BUDGET {
                break;
            }
            let pty = match &mut pane.pty {
                Some(p) => p,
                None => return,
            };
            match pty.read(&mut buf) {
                Ok(0) => {
                    pane.check_dead();
                    break;
                }
                Ok(n) => {
                    pane.feed(&buf[..n]);
                    total += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    // EIO from a pty means the child side closed.
                    pane.check_dead();
                    break;
                }
            }
        }
    }

    fn reap_panes(&mut self) {
        let dead = self.tree.check_dead_panes();
        if dead.is_empty() {
            return;
        }
        let remain = self.options.number("remain-on-exit") != 0;
        for pane in dead {
            if remain {
                self.redraw_window_of_pane(pane);
                continue;
            }
            debug!(pane, "pane died, collapsing");
            let _ = self.tree.kill_pane(pane);
            self.full_redraw_all();
        }
        // Sessions may have vanished under their clients.
        let live: Vec<SessionId> = self.tree.sessions.keys().copied().collect();
        for c in self.clients.values_mut() {
            if let Some(sid) = c.session {
                if !live.contains(&sid) {
                    c.session = None;
                    c.send(&Message::Detach { reason: "session closed".to_string() });
                    c.flags |= CLIENT_DEAD;
                }
            }
        }
    }

    fn redraw_window_of_pane(&mut self, pane: PaneId) {
        if let Some(wid) = self.tree.window_of_pane(pane) {
            for c in self.clients.values_mut() {
                if let Some(sid) = c.session {
                    if self
                        .tree
                        .sessions
                        .get(&sid)
                        .map(|s| s.current_window() == Some(wid))
                        .unwrap_or(false)
                    {
                        c.flags |= CLIENT_REDRAW;
                    }
                }
            }
        }
    }

    fn full_redraw_all(&mut self) {
        for c in self.clients.values_mut() {
            if c.attached() {
                c.flags |= CLIENT_REDRAW;
            }
        }
    }

    // ── alerts ──────────────────────────────────────────────────────────

    fn collect_alerts(&mut self) {
        let monitor_activity = self.options.number("monitor-activity") != 0;
        let mut bells: Vec<WindowId> = Vec::new();
        let mut activity: Vec<WindowId> = Vec::new();
        for (pane_id, pane) in self.tree.panes.iter_mut() {
            let rang = std::mem::take(&mut pane.writer.bell);
            let moved = pane.writer.damage.any();
            if !rang && !moved {
                continue;
            }
            if let Some(wid) = self
                .tree
                .windows
                .values()
                .find(|w| w.has_pane(*pane_id))
                .map(|w| w.id)
            {
                if rang {
                    bells.push(wid);
                }
                if moved && monitor_activity {
                    activity.push(wid);
                }
            }
        }
        for (wid, flag) in bells
            .iter()
            .map(|w| (*w, ALERT_BELL))
            .chain(activity.iter().map(|w| (*w, ALERT_ACTIVITY)))
        {
            for session in self.tree.sessions.values_mut() {
                for wl in session.winlinks.values_mut() {
                    if wl.window == wid && session.current != Some(wl.idx) {
                        wl.alerts |= flag;
                    }
                }
            }
        }
        // A bell in the current window rings the client terminal.
        for wid in bells {
            for c in self.clients.values_mut() {
                let current = c
                    .session
                    .and_then(|sid| self.tree.sessions.get(&sid))
                    .and_then(|s| s.current_window());
                if current == Some(wid) {
                    if let Some(tty) = &mut c.tty {
                        tty.put(b"\x07");
                    }
                }
                c.flags |= CLIENT_STATUS;
            }
        }
    }

    fn check_silence(&mut self) {
        let silence = self.options.number("monitor-silence").max(0) as u64;
        if silence == 0 {
            return;
        }
        let cutoff = Duration::from_secs(silence);
        let mut silent: Vec<WindowId> = Vec::new();
        for (pane_id, pane) in &self.tree.panes {
            if pane.last_output.elapsed() >= cutoff {
                if let Some(wid) = self.tree.window_of_pane(*pane_id) {
                    silent.push(wid);
                }
            }
        }
        for wid in silent {
            for session in self.tree.sessions.values_mut() {
                for wl in session.winlinks.values_mut() {
                    if wl.window == wid && session.current != Some(wl.idx) {
                        wl.alerts |= ALERT_SILENCE;
                    }
                }
            }
        }
    }

    // ── sizing ──────────────────────────────────────────────────────────

    /// Each window is sized to the smallest attached client of any session
    /// linking it, unless a manual size overrides.
    fn recompute_sizes(&mut self) {
        let status_on = self.status_config().position != StatusPosition::Off;
        let mut wanted: HashMap<WindowId, (u16, u16, u16, u16)> = HashMap::new();
        for c in self.clients.values() {
            if !c.attached() {
                continue;
            }
            let sid = match c.session {
                Some(s) => s,
                None => continue,
            };
            let rows = c.window_rows(status_on);
            let session = match self.tree.sessions.get(&sid) {
                Some(s) => s,
                None => continue,
            };
            for wl in session.winlinks.values() {
                let entry = wanted
                    .entry(wl.window)
                    .or_insert((c.sx, rows, c.xpixel, c.ypixel));
                entry.0 = entry.0.min(c.sx);
                entry.1 = entry.1.min(rows);
            }
        }
        for (wid, (sx, sy, xp, yp)) in wanted {
            let (sx, sy) = match self.tree.windows.get(&wid) {
                Some(w) => w.manual_size.unwrap_or((sx, sy)),
                None => continue,
            };
            if let Err(e) = self.tree.resize_window(wid, sx, sy, xp, yp) {
                debug!(window = wid, "resize failed: {e}");
            }
        }
    }

    // ── timers ──────────────────────────────────────────────────────────

    fn fire_timers(&mut self) {
        for t in self.timers.expired(Instant::now()) {
            match self.timer_roles.remove(&t) {
                Some(TimerRole::EscapeFlush(id)) => {
                    let mut events = Vec::new();
                    if let Some(c) = self.clients.get_mut(&id) {
                        c.escape_timer = None;
                        if let Some(ev) = c.keys.flush_escape() {
                            events.push(ev);
                        }
                    }
                    for ev in events {
                        self.dispatch_input(id, ev);
                    }
                }
                Some(TimerRole::MessageDismiss(id)) => {
                    if let Some(c) = self.clients.get_mut(&id) {
                        c.message_timer = None;
                        c.clear_message();
                    }
                }
                Some(TimerRole::RepeatExpire(id)) => {
                    if let Some(c) = self.clients.get_mut(&id) {
                        c.repeat_timer = None;
                        c.repeat_armed = false;
                    }
                }
                Some(TimerRole::StatusRefresh) => {
                    for c in self.clients.values_mut() {
                        if c.attached() {
                            c.flags |= CLIENT_STATUS;
                        }
                    }
                    let t = self.timers.schedule_in(Duration::from_secs(1));
                    self.timer_roles.insert(t, TimerRole::StatusRefresh);
                }
                Some(TimerRole::SilenceCheck) => {
                    self.check_silence();
                    let t = self.timers.schedule_in(Duration::from_secs(1));
                    self.timer_roles.insert(t, TimerRole::SilenceCheck);
                }
                Some(TimerRole::ShutdownDeadline) => {
                    self.running = false;
                }
                None => {}
            }
        }
    }

    // ── command execution ───────────────────────────────────────────────

    fn run_queue(&mut self) {
        while let Some(item) = self.queue.pop() {
            let result = self.exec_command(item.client, &item.cmd);
            match result {
                CmdResult::Wait(token) => {
                    self.queue.park(token, item);
                    break;
                }
                other => self.finish_command(item.client, other),
            }
        }
    }

    fn finish_command(&mut self, client: Option<ClientId>, result: CmdResult) {
        match result {
            CmdResult::Normal => {
                if let Some(c) = client.and_then(|id| self.clients.get_mut(&id)) {
                    if !c.attached() {
                        c.send(&Message::CommandExit { code: 0 });
                    }
                }
            }
            CmdResult::Error(e) => {
                if let Some(id) = client {
                    let attached =
                        self.clients.get(&id).map(|c| c.attached()).unwrap_or(false);
                    if attached {
                        self.post_message(id, e);
                    } else if let Some(c) = self.clients.get_mut(&id) {
                        c.send(&Message::Stderr { data: format!("{e}\n").into_bytes() });
                        c.send(&Message::CommandExit { code: 1 });
                    }
                }
            }
            CmdResult::Stop => {
                self.queue.flush();
                self.begin_shutdown();
            }
            CmdResult::Wait(_) => {}
        }
    }

    /// Reply text for a command: the message overlay for attached clients,
    /// a Stdout frame for control clients.
    fn reply(&mut self, client: Option<ClientId>, text: String) {
        let id = match client {
            Some(id) => id,
            None => return,
        };
        let attached = self.clients.get(&id).map(|c| c.attached()).unwrap_or(false);
        if attached {
            self.post_message(id, text);
        } else if let Some(c) = self.clients.get_mut(&id) {
            c.send(&Message::Stdout { data: text.into_bytes() });
        }
    }

    fn post_message(&mut self, id: ClientId, text: String) {
        let display_ms = self.options.number("display-time").max(0) as u64;
        let t = self.timers.schedule_in(Duration::from_millis(display_ms));
        self.timer_roles.insert(t, TimerRole::MessageDismiss(id));
        if let Some(c) = self.clients.get_mut(&id) {
            if let Some(old) = c.message_timer.replace(t) {
                self.timers.cancel(old);
            }
            c.set_message(text);
        }
    }

    fn client_session(&self, client: Option<ClientId>) -> Option<SessionId> {
        client
            .and_then(|id| self.clients.get(&id))
            .and_then(|c| c.session)
            .or_else(|| self.tree.sessions.keys().min().copied())
    }

    fn exec_command(&mut self, client: Option<ClientId>, cmd: &Command) -> CmdResult {
        match cmd {
            Command::AttachSession { target } => self.cmd_attach(client, target.as_deref()),
            Command::DetachClient => {
                if let Some(id) = client {
                    self.detach_client(id, "detached");
                }
                CmdResult::Normal
            }
            Command::NewSession { name, detach } => self.cmd_new_session(client, name.clone(), *detach),
            Command::KillSession { target } => {
                let sid = match target {
                    Some(name) => self.tree.session_by_name(name).map(|s| s.id),
                    None => self.client_session(client),
                };
                match sid {
                    Some(sid) => {
                        self.tree.destroy_session(sid);
                        self.detach_session_clients(sid, "session killed");
                        CmdResult::Normal
                    }
                    None => CmdResult::Error("no such session".into()),
                }
            }
            Command::RenameSession { name } => {
                match self.client_session(client) {
                    Some(sid) => {
                        if let Some(s) = self.tree.sessions.get_mut(&sid) {
                            s.name = name.clone();
                        }
                        self.status_redraw_all();
                        CmdResult::Normal
                    }
                    None => CmdResult::Error("no current session".into()),
                }
            }
            Command::ListSessions => {
                let mut out = String::new();
                let mut ids: Vec<&SessionId> = self.tree.sessions.keys().collect();
                ids.sort();
                for sid in ids {
                    let s = &self.tree.sessions[sid];
                    let attached = self
                        .clients
                        .values()
                        .filter(|c| c.session == Some(s.id) && c.attached())
                        .count();
                    out.push_str(&format!(
                        "{}: {} windows (created {}){}\n",
                        s.name,
                        s.winlinks.len(),
                        s.created.format("%a %b %e %T %Y"),
                        if attached > 0 { " (attached)" } else { "" },
                    ));
                }
                self.reply(client, out);
                CmdResult::Normal
            }
            Command::NewWindow { index, replace, command } => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let mut params = self.spawn_params(Some(sid), None);
                if !command.is_empty() {
                    params.args = vec!["-c".to_string(), command.join(" ")];
                }
                let collision = if *replace { IndexCollision::Replace } else { IndexCollision::Shift };
                match self.tree.new_window(sid, *index, collision, &params) {
                    Ok(_) => {
                        self.full_redraw_session(sid);
                        CmdResult::Normal
                    }
                    Err(e) => CmdResult::Error(e.to_string()),
                }
            }
            Command::KillWindow => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let idx = match self.tree.sessions.get(&sid).and_then(|s| s.current) {
                    Some(i) => i,
                    None => return CmdResult::Error("no current window".into()),
                };
                match self.tree.unlink_window(sid, idx) {
                    Ok(()) => {
                        if self
                            .tree
                            .sessions
                            .get(&sid)
                            .map(|s| s.winlinks.is_empty())
                            .unwrap_or(false)
                        {
                            self.tree.destroy_session(sid);
                            self.detach_session_clients(sid, "session closed");
                        }
                        self.full_redraw_session(sid);
                        CmdResult::Normal
                    }
                    Err(e) => CmdResult::Error(e.to_string()),
                }
            }
            Command::RenameWindow { name } => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                if let Some(wid) = self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                    if let Some(w) = self.tree.windows.get_mut(&wid) {
                        w.name = name.clone();
                        w.manual_name = true;
                    }
                }
                self.status_redraw_all();
                CmdResult::Normal
            }
            Command::SelectWindow { index } => self.session_op(client, |s| s.select(*index)),
            Command::NextWindow => self.session_op(client, |s| s.next_window()),
            Command::PreviousWindow => self.session_op(client, |s| s.previous_window()),
            Command::LastWindow => self.session_op(client, |s| s.select_last()),
            Command::LinkWindow { src, dst_index } => {
                let dst = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let src_window = self.resolve_window_target(src);
                match src_window {
                    Some(wid) => match self.tree.link_window(wid, dst, *dst_index, IndexCollision::Fail) {
                        Ok(_) => {
                            self.full_redraw_session(dst);
                            CmdResult::Normal
                        }
                        Err(e) => CmdResult::Error(e.to_string()),
                    },
                    None => CmdResult::Error(format!("window not found: {src}")),
                }
            }
            Command::UnlinkWindow => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let idx = match self.tree.sessions.get(&sid).and_then(|s| s.current) {
                    Some(i) => i,
                    None => return CmdResult::Error("no current window".into()),
                };
                match self.tree.unlink_window(sid, idx) {
                    Ok(()) => {
                        self.full_redraw_session(sid);
                        CmdResult::Normal
                    }
                    Err(e) => CmdResult::Error(e.to_string()),
                }
            }
            Command::ListWindows => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let mut out = String::new();
                if let Some(s) = self.tree.sessions.get(&sid) {
                    for (idx, wl) in &s.winlinks {
                        if let Some(w) = self.tree.windows.get(&wl.window) {
                            out.push_str(&format!(
                                "{}: {} ({} panes) [{}x{}] [layout {}]{}\n",
                                idx,
                                w.name,
                                w.panes().len(),
                                w.sx,
                                w.sy,
                                layout_string::dump(&w.layout),
                                if s.current == Some(*idx) { " (active)" } else { "" },
                            ));
                        }
                    }
                }
                self.reply(client, out);
                CmdResult::Normal
            }
            Command::SplitWindow { kind, spec, before, command } => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let pane = match self.tree.active_pane(sid) {
                    Some(p) => p,
                    None => return CmdResult::Error("no current pane".into()),
                };
                let mut params = self.spawn_params(Some(sid), None);
                if !command.is_empty() {
                    params.args = vec!["-c".to_string(), command.join(" ")];
                }
                match self.tree.split_pane(pane, *kind, *spec, *before, &params) {
                    Ok(_) => {
                        self.full_redraw_session(sid);
                        CmdResult::Normal
                    }
                    Err(e) => CmdResult::Error(e.to_string()),
                }
            }
            Command::KillPane => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                match self.tree.active_pane(sid) {
                    Some(pane) => match self.tree.kill_pane(pane) {
                        Ok(()) => {
                            self.full_redraw_all();
                            self.drop_clients_of_dead_sessions();
                            CmdResult::Normal
                        }
                        Err(e) => CmdResult::Error(e.to_string()),
                    },
                    None => CmdResult::Error("no current pane".into()),
                }
            }
            Command::SelectPane { target } => self.cmd_select_pane(client, target),
            Command::LastPane => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let wid = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                    Some(w) => w,
                    None => return CmdResult::Error("no current window".into()),
                };
                if let Some(w) = self.tree.windows.get_mut(&wid) {
                    if let Some(last) = w.last_active {
                        w.select_pane(last);
                    }
                }
                self.full_redraw_session(sid);
                CmdResult::Normal
            }
            Command::ResizePane { kind, delta } => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let wid = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                    Some(w) => w,
                    None => return CmdResult::Error("no current window".into()),
                };
                let pane = match self.tree.windows.get(&wid).map(|w| w.active) {
                    Some(p) => p,
                    None => return CmdResult::Error("no current pane".into()),
                };
                let result = {
                    let w = match self.tree.windows.get_mut(&wid) {
                        Some(w) => w,
                        None => return CmdResult::Error("no current window".into()),
                    };
                    layout::resize_pane(&mut w.layout, pane, *kind, *delta)
                };
                match result {
                    Ok(()) => {
                        let (xp, yp) = self.pixel_metrics(sid);
                        self.tree.apply_layout_rects(wid, xp, yp);
                        self.full_redraw_session(sid);
                        CmdResult::Normal
                    }
                    Err(e) => CmdResult::Error(e.to_string()),
                }
            }
            Command::RespawnPane => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let pane = match self.tree.active_pane(sid) {
                    Some(p) => p,
                    None => return CmdResult::Error("no current pane".into()),
                };
                let params = self.spawn_params(Some(sid), None);
                let hlimit = params.hlimit;
                match self.tree.panes.get_mut(&pane) {
                    Some(p) => match p.respawn(&params.env, hlimit) {
                        Ok(()) => {
                            self.full_redraw_session(sid);
                            CmdResult::Normal
                        }
                        Err(e) => CmdResult::Error(e.to_string()),
                    },
                    None => CmdResult::Error("no current pane".into()),
                }
            }
            Command::ListPanes => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let mut out = String::new();
                if let Some(wid) = self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                    if let Some(w) = self.tree.windows.get(&wid) {
                        for (i, (pid, rect)) in w.layout.pane_rects().iter().enumerate() {
                            let dead = self.tree.panes.get(pid).map(|p| p.dead).unwrap_or(true);
                            out.push_str(&format!(
                                "{}: [{}x{}] [history {}] %{}{}{}\n",
                                i,
                                rect.sx,
                                rect.sy,
                                self.tree.panes.get(pid).map(|p| p.screen.hsize()).unwrap_or(0),
                                pid,
                                if *pid == w.active { " (active)" } else { "" },
                                if dead { " (dead)" } else { "" },
                            ));
                        }
                    }
                }
                self.reply(client, out);
                CmdResult::Normal
            }
            Command::ResizeWindow { sx, sy } => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let wid = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                    Some(w) => w,
                    None => return CmdResult::Error("no current window".into()),
                };
                let (cur_sx, cur_sy) = match self.tree.windows.get(&wid) {
                    Some(w) => (w.sx, w.sy),
                    None => return CmdResult::Error("no current window".into()),
                };
                let nsx = sx.unwrap_or(cur_sx);
                let nsy = sy.unwrap_or(cur_sy);
                let (xp, yp) = self.pixel_metrics(sid);
                match self.tree.resize_window(wid, nsx, nsy, xp, yp) {
                    Ok(()) => {
                        if let Some(w) = self.tree.windows.get_mut(&wid) {
                            w.manual_size = Some((nsx, nsy));
                        }
                        self.full_redraw_session(sid);
                        CmdResult::Normal
                    }
                    Err(e) => CmdResult::Error(e.to_string()),
                }
            }
            Command::SelectLayout { name } => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let wid = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                    Some(w) => w,
                    None => return CmdResult::Error("no current window".into()),
                };
                let applied = match self.tree.windows.get_mut(&wid) {
                    Some(w) => {
                        // A layout string restores an exact arrangement; a
                        // preset name rebuilds one.
                        if let Some(parsed) = layout_string::parse(name) {
                            let panes_match = parsed.panes().len() == w.panes().len();
                            if panes_match {
                                w.layout = parsed;
                                layout::resize(&mut w.layout, w.sx, w.sy).is_ok()
                            } else {
                                false
                            }
                        } else {
                            layout::apply_preset(&mut w.layout, name)
                        }
                    }
                    None => false,
                };
                if applied {
                    let (xp, yp) = self.pixel_metrics(sid);
                    self.tree.apply_layout_rects(wid, xp, yp);
                    self.full_redraw_session(sid);
                    CmdResult::Normal
                } else {
                    CmdResult::Error(format!("bad layout: {name}"))
                }
            }
            Command::NextLayout => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                let wid = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                    Some(w) => w,
                    None => return CmdResult::Error("no current window".into()),
                };
                if let Some(w) = self.tree.windows.get_mut(&wid) {
                    w.layout_preset = (w.layout_preset + 1) % layout::PRESET_LAYOUTS.len();
                    let preset = layout::PRESET_LAYOUTS[w.layout_preset];
                    layout::apply_preset(&mut w.layout, preset);
                }
                let (xp, yp) = self.pixel_metrics(sid);
                self.tree.apply_layout_rects(wid, xp, yp);
                self.full_redraw_session(sid);
                CmdResult::Normal
            }
            Command::SendKeys { literal } => {
                let sid = match self.client_session(client) {
                    Some(s) => s,
                    None => return CmdResult::Error("no current session".into()),
                };
                match self.tree.active_pane(sid) {
                    Some(pane) => {
                        let data = literal.join(" ");
                        if let Some(p) = self.tree.panes.get_mut(&pane) {
                            p.queue_write(data.as_bytes());
                        }
                        CmdResult::Normal
                    }
                    None => CmdResult::Error("no current pane".into()),
                }
            }
            Command::SetOption { name, value, global } => {
                let value = match value.parse::<i64>() {
                    Ok(n) => OptionValue::Number(n),
                    Err(_) => OptionValue::String(value.clone()),
                };
                let ok = if *global {
                    self.options.set(name, value)
                } else {
                    match self.client_session(client) {
                        Some(sid) => match self.tree.sessions.get_mut(&sid) {
                            Some(s) => s.options.set(name, value),
                            None => false,
                        },
                        None => self.options.set(name, value),
                    }
                };
                if ok {
                    self.full_redraw_all();
                    CmdResult::Normal
                } else {
                    CmdResult::Error(format!("unknown option: {name}"))
                }
            }
            Command::ShowOptions { global } => {
                let entries = if *global {
                    self.options.entries()
                } else {
                    self.client_session(client)
                        .and_then(|sid| self.tree.sessions.get(&sid))
                        .map(|s| s.options.entries())
                        .unwrap_or_default()
                };
                let out: String = entries
                    .into_iter()
                    .map(|(k, v)| format!("{} {}\n", k, v))
                    .collect();
                self.reply(client, out);
                CmdResult::Normal
            }
            Command::SetBuffer { data } => {
                let name = format!("buffer{:04}", self.paste_buffers.len());
                self.paste_buffers.push((name, data.clone().into_bytes()));
                CmdResult::Normal
            }
            Command::ShowBuffer => {
                let out = self
                    .paste_buffers
                    .last()
                    .map(|(_, d)| String::from_utf8_lossy(d).into_owned())
                    .unwrap_or_default();
                self.reply(client, out);
                CmdResult::Normal
            }
            Command::PasteBuffer => {
                let data = match self.paste_buffers.last() {
                    Some((_, d)) => d.clone(),
                    None => return CmdResult::Error("no buffer".into()),
                };
                match self.client_session(client) {
                    Some(sid) => {
                        self.paste_to_session(sid, &data);
                        CmdResult::Normal
                    }
                    None => CmdResult::Error("no current session".into()),
                }
            }
            Command::DisplayMessage { text } => {
                self.reply(client, text.clone());
                CmdResult::Normal
            }
            Command::RunShell { command } => self.cmd_run_shell(client, command),
            Command::KillServer => CmdResult::Stop,
        }
    }

    fn session_op(
        &mut self,
        client: Option<ClientId>,
        op: impl FnOnce(&mut crate::session::Session) -> bool,
    ) -> CmdResult {
        let sid = match self.client_session(client) {
            Some(s) => s,
            None => return CmdResult::Error("no current session".into()),
        };
        let ok = match self.tree.sessions.get_mut(&sid) {
            Some(s) => op(s),
            None => false,
        };
        if ok {
            self.full_redraw_session(sid);
            CmdResult::Normal
        } else {
            CmdResult::Error("no such window".into())
        }
    }

    fn cmd_attach(&mut self, client: Option<ClientId>, target: Option<&str>) -> CmdResult {
        let id = match client {
            Some(id) => id,
            None => return CmdResult::Error("attach needs a client".into()),
        };
        let sid = match target {
            Some(spec) => {
                let parsed = crate::cli::parse_target(spec);
                let name = parsed.session.as_deref().unwrap_or(spec);
                let sid = match self.tree.session_by_name(name) {
                    Some(s) => s.id,
                    None => return CmdResult::Error(format!("no such session: {name}")),
                };
                // A window part of the target selects that window too.
                if let Some(idx) = parsed.window {
                    let _ = self.tree.select_window(sid, idx);
                }
                sid
            }
            None => match self.tree.sessions.keys().min().copied() {
                Some(s) => s,
                None => return CmdResult::Error("no sessions".into()),
            },
        };
        self.attach(id, sid);
        CmdResult::Normal
    }

    fn cmd_new_session(
        &mut self,
        client: Option<ClientId>,
        name: Option<String>,
        detach: bool,
    ) -> CmdResult {
        let name = name.unwrap_or_else(|| format!("{}", self.tree.sessions.len()));
        if self.tree.session_by_name(&name).is_some() {
            return CmdResult::Error(format!("duplicate session: {name}"));
        }
        let (sx, sy, cwd) = match client.and_then(|id| self.clients.get(&id)) {
            Some(c) => {
                let status_on = self.status_config().position != StatusPosition::Off;
                (c.sx, c.window_rows(status_on), Some(c.cwd.clone()))
            }
            None => (80, 24, None),
        };
        let params = self.spawn_params(None, cwd);
        match self.tree.new_session(name, sx.max(2), sy.max(2), &params) {
            Ok(sid) => {
                if !detach {
                    if let Some(id) = client {
                        self.attach(id, sid);
                    }
                }
                CmdResult::Normal
            }
            Err(e) => CmdResult::Error(e.to_string()),
        }
    }

    fn cmd_select_pane(&mut self, client: Option<ClientId>, target: &str) -> CmdResult {
        let sid = match self.client_session(client) {
            Some(s) => s,
            None => return CmdResult::Error("no current session".into()),
        };
        let wid = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
            Some(w) => w,
            None => return CmdResult::Error("no current window".into()),
        };
        let panes = match self.tree.windows.get(&wid) {
            Some(w) => w.panes(),
            None => return CmdResult::Error("no current window".into()),
        };
        let chosen = if target == "+" {
            // Cycle to the next pane in layout order.
            let active = self.tree.windows.get(&wid).map(|w| w.active);
            active.and_then(|a| {
                let pos = panes.iter().position(|p| *p == a)?;
                panes.get((pos + 1) % panes.len()).copied()
            })
        } else if let Some(idx) = target.strip_prefix('%') {
            idx.parse::<PaneId>().ok().filter(|p| panes.contains(p))
        } else {
            target
                .parse::<usize>()
                .ok()
                .and_then(|i| panes.get(i).copied())
        };
        match chosen {
            Some(pane) => {
                let _ = self.tree.select_pane(wid, pane);
                self.full_redraw_session(sid);
                CmdResult::Normal
            }
            None => CmdResult::Error(format!("no such pane: {target}")),
        }
    }

    /// run-shell: spawn the command and park the queue on the child's exit,
    /// the poll-style suspension the queue is built around.
    fn cmd_run_shell(&mut self, _client: Option<ClientId>, command: &str) -> CmdResult {
        let shell = crate::pty::default_shell(None);
        match std::process::Command::new(shell)
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => {
                let pid = child.id();
                self.shell_jobs.insert(pid, child);
                CmdResult::Wait(WakeToken::Child(pid))
            }
            Err(e) => CmdResult::Error(format!("run-shell failed: {e}")),
        }
    }

    /// SIGCHLD arrived: finish any run-shell children and wake the queue.
    fn check_shell_jobs(&mut self) {
        let pids: Vec<u32> = self.shell_jobs.keys().copied().collect();
        for pid in pids {
            let done = self
                .shell_jobs
                .get_mut(&pid)
                .and_then(|c| c.try_wait().ok())
                .flatten();
            if let Some(status) = done {
                if let Some(mut child) = self.shell_jobs.remove(&pid) {
                    let mut output = String::new();
                    if let Some(mut out) = child.stdout.take() {
                        use std::io::Read;
                        let _ = out.read_to_string(&mut output);
                    }
                    if let Some(item) = self.queue.wake(WakeToken::Child(pid)) {
                        let result = if status.success() {
                            if !output.is_empty() {
                                self.reply(item.client, output);
                            }
                            CmdResult::Normal
                        } else {
                            CmdResult::Error(format!(
                                "command exited with {}",
                                status.code().unwrap_or(-1)
                            ))
                        };
                        self.finish_command(item.client, result);
                    }
                }
            }
        }
    }

    fn resolve_window_target(&self, target: &str) -> Option<WindowId> {
        if let Some(id) = target.strip_prefix('@') {
            let wid: WindowId = id.parse().ok()?;
            return self.tree.windows.contains_key(&wid).then_some(wid);
        }
        // session:index or a bare session name's current window.
        let (session, index) = match target.split_once(':') {
            Some((s, i)) => (s, Some(i)),
            None => (target, None),
        };
        let s = self.tree.session_by_name(session)?;
        match index {
            Some(i) => {
                let idx: usize = i.parse().ok()?;
                s.winlinks.get(&idx).map(|wl| wl.window)
            }
            None => s.current_window(),
        }
    }

    // ── attach / detach ─────────────────────────────────────────────────

    fn attach(&mut self, id: ClientId, sid: SessionId) {
        if let Some(c) = self.clients.get_mut(&id) {
            c.session = Some(sid);
            c.flags |= CLIENT_ATTACHED | CLIENT_REDRAW;
            if let Some(fd) = &c.tty_in {
                crate::pty::set_nonblocking(fd.as_raw_fd());
            }
            if let Some(tty) = &mut c.tty {
                crate::pty::set_nonblocking(tty.raw_fd());
                tty.setup();
                // Ask the client terminal for everything we route.
                tty.put(b"\x1b[?1000h\x1b[?1002h\x1b[?1006h\x1b[?2004h\x1b[?1004h");
            }
            info!(client = id, session = sid, "client attached");
        }
        if !self.causelist.is_empty() {
            let text = std::mem::take(&mut self.causelist).join("; ");
            self.post_message(id, text);
        }
        self.update_socket_mode();
    }

    fn detach_client(&mut self, id: ClientId, reason: &str) {
        if let Some(c) = self.clients.get_mut(&id) {
            if let Some(tty) = &mut c.tty {
                tty.teardown();
                tty.flush();
            }
            c.flags &= !CLIENT_ATTACHED;
            c.session = None;
            c.send(&Message::Detach { reason: reason.to_string() });
            c.flags |= CLIENT_DEAD;
        }
        self.update_socket_mode();
    }

    fn detach_session_clients(&mut self, sid: SessionId, reason: &str) {
        let ids: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.session == Some(sid))
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.detach_client(id, reason);
        }
    }

    fn drop_clients_of_dead_sessions(&mut self) {
        let live: Vec<SessionId> = self.tree.sessions.keys().copied().collect();
        let gone: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.session.map(|s| !live.contains(&s)).unwrap_or(false))
            .map(|c| c.id)
            .collect();
        for id in gone {
            self.detach_client(id, "session closed");
        }
    }

    fn drop_dead_clients(&mut self) {
        let dead: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.flags & CLIENT_DEAD != 0 && !c.wants_sock_write())
            .map(|c| c.id)
            .collect();
        for id in dead {
            if let Some(c) = self.clients.remove(&id) {
                if let Some(t) = c.escape_timer {
                    self.timers.cancel(t);
                }
                if let Some(t) = c.message_timer {
                    self.timers.cancel(t);
                }
                if let Some(t) = c.repeat_timer {
                    self.timers.cancel(t);
                }
                debug!(client = id, "client gone");
            }
        }
        self.update_socket_mode();
    }

    // ── rendering ───────────────────────────────────────────────────────

    fn status_config(&self) -> StatusConfig {
        let position = if self.options.number("status") == 0 {
            StatusPosition::Off
        } else if self.options.string("status-position") == "top" {
            StatusPosition::Top
        } else {
            StatusPosition::Bottom
        };
        StatusConfig { position }
    }

    fn status_redraw_all(&mut self) {
        for c in self.clients.values_mut() {
            if c.attached() {
                c.flags |= CLIENT_STATUS;
            }
        }
    }

    fn full_redraw_session(&mut self, sid: SessionId) {
        for c in self.clients.values_mut() {
            if c.session == Some(sid) {
                c.flags |= CLIENT_REDRAW;
            }
        }
    }

    fn pixel_metrics(&self, sid: SessionId) -> (u16, u16) {
        self.clients
            .values()
            .find(|c| c.session == Some(sid) && c.attached())
            .map(|c| (c.xpixel, c.ypixel))
            .unwrap_or((0, 0))
    }

    fn render_clients(&mut self) {
        let status = self.status_config();
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        let mut rendered_windows: Vec<WindowId> = Vec::new();

        for id in ids {
            let (sid, flags, congested, sy) = {
                let c = match self.clients.get_mut(&id) {
                    Some(c) => c,
                    None => continue,
                };
                if !c.attached() || c.tty.is_none() {
                    continue;
                }
                let congested = c.tty.as_mut().map(|t| t.congested()).unwrap_or(false);
                let sid = match c.session {
                    Some(s) => s,
                    None => continue,
                };
                (sid, c.flags, congested, c.sy)
            };
            let wid = match self.tree.sessions.get(&sid).and_then(|s| s.current_window()) {
                Some(w) => w,
                None => continue,
            };
            let status_line = {
                let base = render::status_text(&self.tree, sid);
                let c = &self.clients[&id];
                match &c.message {
                    Some(m) => m.clone(),
                    None => base,
                }
            };

            let any_damage = self
                .tree
                .windows
                .get(&wid)
                .map(|w| {
                    w.panes()
                        .iter()
                        .any(|p| self.tree.panes.get(p).map(|p| p.writer.damage.any()).unwrap_or(false))
                })
                .unwrap_or(false);

            // Title follows the active pane.
            let title: Option<String> = self
                .tree
                .windows
                .get(&wid)
                .and_then(|w| self.tree.panes.get(&w.active))
                .filter(|p| !p.screen.title.is_empty() && p.writer.title_dirty)
                .map(|p| p.screen.title.clone());
            let client_sx = self.clients.get(&id).map(|c| c.sx).unwrap_or(80);

            let c = match self.clients.get_mut(&id) {
                Some(c) => c,
                None => continue,
            };
            let tty = match &mut c.tty {
                Some(t) => t,
                None => continue,
            };

            if congested {
                // Over the high-water mark: the status row only.
                if flags & CLIENT_STATUS != 0 {
                    render::status_redraw(tty, Some(&status_line), status.position, sy, client_sx);
                }
                c.flags &= !CLIENT_STATUS;
                continue;
            }

            if flags & CLIENT_REDRAW != 0 {
                render::full_redraw(tty, &self.tree, wid, &status, Some(&status_line), sy);
                c.flags &= !(CLIENT_REDRAW | CLIENT_STATUS);
                rendered_windows.push(wid);
            } else {
                if any_damage {
                    render::incremental_redraw(tty, &self.tree, wid, &status);
                    rendered_windows.push(wid);
                }
                if flags & CLIENT_STATUS != 0 {
                    render::status_redraw(tty, Some(&status_line), status.position, sy, client_sx);
                    c.flags &= !CLIENT_STATUS;
                }
            }

            if let Some(title) = title {
                if let Some(tty) = &mut c.tty {
                    tty.set_title(&title);
                }
            }
        }

        // Damage is drained only after every attached client has seen it.
        rendered_windows.sort_unstable();
        rendered_windows.dedup();
        for wid in rendered_windows {
            if let Some(w) = self.tree.windows.get(&wid) {
                for pid in w.panes() {
                    if let Some(p) = self.tree.panes.get_mut(&pid) {
                        p.writer.damage.clear();
                        p.writer.title_dirty = false;
                    }
                }
            }
        }
    }

    fn flush_all(&mut self) {
        for c in self.clients.values_mut() {
            if !c.flush_sock() {
                c.flags |= CLIENT_DEAD;
            }
            if let Some(tty) = &mut c.tty {
                if !tty.flush() {
                    c.flags |= CLIENT_DEAD;
                }
            }
        }
        for p in self.tree.panes.values_mut() {
            p.flush_writes();
        }
    }

    // ── socket lifecycle ────────────────────────────────────────────────

    /// Mode 0600 detached, 0700 while any client is attached.
    fn update_socket_mode(&self) {
        let attached = self.clients.values().any(|c| c.attached());
        let mode = if attached { Mode::from_raw_mode(0o700) } else { Mode::from_raw_mode(0o600) };
        let _ = rustix::fs::chmod(&self.socket_path, mode);
    }

    /// SIGUSR1: unlink and rebind the listener, for socket migration.
    fn recreate_socket(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
        match bind_listener(&self.socket_path) {
            Ok(listener) => {
                self.listener = listener;
                self.update_socket_mode();
                info!("socket recreated");
            }
            Err(e) => warn!("socket recreation failed: {e}"),
        }
    }

    fn begin_shutdown(&mut self) {
        info!("shutting down");
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            if let Some(c) = self.clients.get_mut(&id) {
                if let Some(tty) = &mut c.tty {
                    tty.teardown();
                    tty.flush();
                }
                c.send(&Message::Shutdown);
            }
        }
        // A bounded grace period for the shutdown frames to drain.
        let t = self.timers.schedule_in(Duration::from_millis(500));
        self.timer_roles.insert(t, TimerRole::ShutdownDeadline);
    }

    fn shutdown(&mut self) {
        for c in self.clients.values_mut() {
            let _ = c.flush_sock();
        }
        let sessions: Vec<SessionId> = self.tree.sessions.keys().copied().collect();
        for sid in sessions {
            self.tree.destroy_session(sid);
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

struct Sources {
    list: Vec<PollSource>,
    tags: Vec<Tag>,
}

enum Tag {
    Signals,
    Listener,
    ClientSock(ClientId),
    ClientTtyIn(ClientId),
    ClientTtyOut(ClientId),
    Pane(PaneId),
}

/// The per-user socket directory, created mode 0700.
pub fn socket_dir() -> PathBuf {
    let base = std::env::var("RSMUX_TMPDIR")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            let uid = unsafe { libc::getuid() };
            format!("/tmp/rsmux-{uid}")
        });
    PathBuf::from(base)
}

pub fn socket_path(name: &str) -> PathBuf {
    socket_dir().join(name)
}

fn bind_listener(path: &Path) -> std::io::Result<OwnedFd> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
        let _ = rustix::fs::chmod(dir, Mode::from_raw_mode(0o700));
    }
    let _ = std::fs::remove_file(path);

    // The umask keeps the socket private from birth; chmod then sets the
    // exact mode.
    let old_umask = unsafe { libc::umask(0o177) };
    let result: std::io::Result<OwnedFd> = (|| {
        let sock = socket_with(
            AddressFamily::UNIX,
            SocketType::STREAM,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )
        .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
        let addr = SocketAddrUnix::new(path)
            .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
        bind_unix(&sock, &addr).map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
        listen(&sock, 128).map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
        Ok(sock)
    })();
    unsafe { libc::umask(old_umask) };
    let sock = result?;
    let _ = rustix::fs::chmod(path, Mode::from_raw_mode(0o600));
    Ok(sock)
}
