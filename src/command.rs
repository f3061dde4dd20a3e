//! Commands: a compile-time registry mapping names (and their historical
//! aliases) to strongly-typed parsers, the typed result commands return,
//! and the queue that runs them one at a time. Long-running commands
//! suspend with a wake token and are resumed by the matching event.

use std::collections::{HashMap, VecDeque};

use crate::layout::{SizeSpec, SplitKind};

/// What a finished (or suspended) command tells the queue.
pub enum CmdResult {
    Normal,
    Error(String),
    /// Suspend the queue until the wake token's event arrives.
    Wait(WakeToken),
    /// Flush the queue; used by kill-server.
    Stop,
}

/// Events a suspended command may be waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeToken {
    /// A child process (by pid) exiting.
    Child(u32),
    /// A timer firing.
    Timer(u64),
}

/// The known commands as a tagged variant. Execution lives with the server,
/// which owns all the state commands touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AttachSession { target: Option<String> },
    DetachClient,
    NewSession { name: Option<String>, detach: bool },
    KillSession { target: Option<String> },
    RenameSession { name: String },
    ListSessions,
    NewWindow { index: Option<usize>, replace: bool, command: Vec<String> },
    KillWindow,
    RenameWindow { name: String },
    SelectWindow { index: usize },
    NextWindow,
    PreviousWindow,
    LastWindow,
    LinkWindow { src: String, dst_index: Option<usize> },
    UnlinkWindow,
    ListWindows,
    SplitWindow { kind: SplitKind, spec: SizeSpec, before: bool, command: Vec<String> },
    KillPane,
    SelectPane { target: String },
    LastPane,
    ResizePane { kind: SplitKind, delta: i32 },
    RespawnPane,
    ListPanes,
    ResizeWindow { sx: Option<u16>, sy: Option<u16> },
    SelectLayout { name: String },
    NextLayout,
    SendKeys { literal: Vec<String> },
    SetOption { name: String, value: String, global: bool },
    ShowOptions { global: bool },
    SetBuffer { data: String },
    ShowBuffer,
    PasteBuffer,
    DisplayMessage { text: String },
    RunShell { command: String },
    KillServer,
}

type ParseFn = fn(&ParsedArgs) -> Result<Command, String>;

pub struct CmdEntry {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    /// The getopt-style flag spec; letters followed by ':' take a value.
    pub flag_spec: &'static str,
    pub parse: ParseFn,
}

/// The compile-time command table, in name order.
pub static COMMAND_TABLE: &[CmdEntry] = &[
    CmdEntry { name: "attach-session", alias: Some("attach"), flag_spec: "t:d", parse: parse_attach },
    CmdEntry { name: "detach-client", alias: Some("detach"), flag_spec: "", parse: |_| Ok(Command::DetachClient) },
    CmdEntry { name: "display-message", alias: Some("display"), flag_spec: "", parse: parse_display },
    CmdEntry { name: "kill-pane", alias: Some("killp"), flag_spec: "t:", parse: |_| Ok(Command::KillPane) },
    CmdEntry { name: "kill-server", alias: None, flag_spec: "", parse: |_| Ok(Command::KillServer) },
    CmdEntry { name: "kill-session", alias: None, flag_spec: "t:", parse: parse_kill_session },
    CmdEntry { name: "kill-window", alias: Some("killw"), flag_spec: "t:", parse: |_| Ok(Command::KillWindow) },
    CmdEntry { name: "last-pane", alias: Some("lastp"), flag_spec: "", parse: |_| Ok(Command::LastPane) },
    CmdEntry { name: "last-window", alias: Some("last"), flag_spec: "", parse: |_| Ok(Command::LastWindow) },
    CmdEntry { name: "link-window", alias: Some("linkw"), flag_spec: "s:t:", parse: parse_link_window },
    CmdEntry { name: "list-panes", alias: Some("lsp"), flag_spec: "", parse: |_| Ok(Command::ListPanes) },
    CmdEntry { name: "list-sessions", alias: Some("ls"), flag_spec: "", parse: |_| Ok(Command::ListSessions) },
    CmdEntry { name: "list-windows", alias: Some("lsw"), flag_spec: "", parse: |_| Ok(Command::ListWindows) },
    CmdEntry { name: "new-session", alias: Some("new"), flag_spec: "s:d", parse: parse_new_session },
    CmdEntry { name: "new-window", alias: Some("neww"), flag_spec: "t:k", parse: parse_new_window },
    CmdEntry { name: "next-layout", alias: Some("nextl"), flag_spec: "", parse: |_| Ok(Command::NextLayout) },
    CmdEntry { name: "next-window", alias: Some("next"), flag_spec: "", parse: |_| Ok(Command::NextWindow) },
    CmdEntry { name: "paste-buffer", alias: Some("pasteb"), flag_spec: "", parse: |_| Ok(Command::PasteBuffer) },
    CmdEntry { name: "previous-window", alias: Some("prev"), flag_spec: "", parse: |_| Ok(Command::PreviousWindow) },
    CmdEntry { name: "rename-session", alias: Some("rename"), flag_spec: "", parse: parse_rename_session },
    CmdEntry { name: "rename-window", alias: Some("renamew"), flag_spec: "", parse: parse_rename_window },
    CmdEntry { name: "resize-pane", alias: Some("resizep"), flag_spec: "LRUD", parse: parse_resize_pane },
    CmdEntry { name: "resize-window", alias: Some("resizew"), flag_spec: "x:y:", parse: parse_resize_window },
    CmdEntry { name: "respawn-pane", alias: Some("respawnp"), flag_spec: "", parse: |_| Ok(Command::RespawnPane) },
    CmdEntry { name: "run-shell", alias: Some("run"), flag_spec: "", parse: parse_run_shell },
    CmdEntry { name: "select-layout", alias: Some("selectl"), flag_spec: "", parse: parse_select_layout },
    CmdEntry { name: "select-pane", alias: Some("selectp"), flag_spec: "t:", parse: parse_select_pane },
    CmdEntry { name: "select-window", alias: Some("selectw"), flag_spec: "t:", parse: parse_select_window },
    CmdEntry { name: "send-keys", alias: Some("send"), flag_spec: "l", parse: parse_send_keys },
    CmdEntry { name: "set-buffer", alias: Some("setb"), flag_spec: "", parse: parse_set_buffer },
    CmdEntry { name: "set-option", alias: Some("set"), flag_spec: "g", parse: parse_set_option },
    CmdEntry { name: "show-buffer", alias: Some("showb"), flag_spec: "", parse: |_| Ok(Command::ShowBuffer) },
    CmdEntry { name: "show-options", alias: Some("show"), flag_spec: "g", parse: parse_show_options },
    CmdEntry { name: "split-window", alias: Some("splitw"), flag_spec: "hvbl:p:", parse: parse_split_window },
    CmdEntry { name: "unlink-window", alias: Some("unlinkw"), flag_spec: "", parse: |_| Ok(Command::UnlinkWindow) },
];

/// Parsed argv: single-letter flags, their values, and what remains.
pub struct ParsedArgs {
    flags: HashMap<char, Option<String>>,
    pub positional: Vec<String>,
}

impl ParsedArgs {
    pub fn has(&self, flag: char) -> bool {
        self.flags.contains_key(&flag)
    }

    pub fn value(&self, flag: char) -> Option<&str> {
        self.flags.get(&flag).and_then(|v| v.as_deref())
    }
}

/// getopt in miniature: `-x`, `-x value`, and `--` ending flag parsing.
pub fn parse_flags(args: &[String], spec: &str) -> Result<ParsedArgs, String> {
    let takes_value = |flag: char| {
        spec.char_indices()
            .find(|(_, c)| *c == flag)
            .map(|(i, _)| spec[i + 1..].starts_with(':'))
    };
    let mut flags = HashMap::new();
    let mut positional = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            positional.extend(iter.cloned());
            break;
        }
        if let Some(flag_str) = arg.strip_prefix('-') {
            if flag_str.is_empty() {
                positional.push(arg.clone());
                continue;
            }
            for (i, flag) in flag_str.chars().enumerate() {
                match takes_value(flag) {
                    None => return Err(format!("unknown flag: -{}", flag)),
                    Some(false) => {
                        flags.insert(flag, None);
                    }
                    Some(true) => {
                        // Value is the rest of this argument or the next one.
                        let rest = &flag_str[i + flag.len_utf8()..];
                        let value = if !rest.is_empty() {
                            rest.to_string()
                        } else {
                            iter.next()
                                .cloned()
                                .ok_or_else(|| format!("-{} requires a value", flag))?
                        };
                        flags.insert(flag, Some(value));
                        break;
                    }
                }
            }
        } else {
            positional.push(arg.clone());
        }
    }
    Ok(ParsedArgs { flags, positional })
}

/// Look up a command by name or alias and parse its arguments.
pub fn parse_command(argv: &[String]) -> Result<Command, String> {
    let name = argv.first().ok_or("empty command")?;
    let entry = COMMAND_TABLE
        .iter()
        .find(|e| e.name == name || e.alias == Some(name.as_str()))
        .ok_or_else(|| format!("unknown command: {}", name))?;
    let args = parse_flags(&argv[1..], entry.flag_spec)?;
    (entry.parse)(&args)
}

/// Parse a startup command file: one command per line, `#` comments and
/// blank lines skipped. Bad lines never stop the run; their diagnostics
/// come back alongside the commands that did parse, each tagged with the
/// file and line number.
pub fn parse_startup_file(path: &std::path::Path) -> (Vec<Command>, Vec<String>) {
    let mut commands = Vec::new();
    let mut causes = Vec::new();
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            causes.push(format!("{}: {e}", path.display()));
            return (commands, causes);
        }
    };
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        match parse_command(&argv) {
            Ok(cmd) => commands.push(cmd),
            Err(e) => causes.push(format!("{}:{}: {e}", path.display(), lineno + 1)),
        }
    }
    (commands, causes)
}

fn parse_attach(args: &ParsedArgs) -> Result<Command, String> {
    Ok(Command::AttachSession { target: args.value('t').map(str::to_string) })
}

fn parse_new_session(args: &ParsedArgs) -> Result<Command, String> {
    Ok(Command::NewSession {
        name: args.value('s').map(str::to_string),
        detach: args.has('d'),
    })
}

fn parse_kill_session(args: &ParsedArgs) -> Result<Command, String> {
    Ok(Command::KillSession { target: args.value('t').map(str::to_string) })
}

fn parse_rename_session(args: &ParsedArgs) -> Result<Command, String> {
    let name = args.positional.first().ok_or("rename-session needs a name")?;
    Ok(Command::RenameSession { name: name.clone() })
}

fn parse_new_window(args: &ParsedArgs) -> Result<Command, String> {
    let index = match args.value('t') {
        Some(t) => Some(t.parse().map_err(|_| "bad window index".to_string())?),
        None => None,
    };
    Ok(Command::NewWindow {
        index,
        replace: args.has('k'),
        command: args.positional.clone(),
    })
}

fn parse_rename_window(args: &ParsedArgs) -> Result<Command, String> {
    let name = args.positional.first().ok_or("rename-window needs a name")?;
    Ok(Command::RenameWindow { name: name.clone() })
}

fn parse_select_window(args: &ParsedArgs) -> Result<Command, String> {
    let target = args
        .value('t')
        .or_else(|| args.positional.first().map(|s| s.as_str()))
        .ok_or("select-window needs a target")?;
    let index = target.parse().map_err(|_| "bad window index".to_string())?;
    Ok(Command::SelectWindow { index })
}

fn parse_link_window(args: &ParsedArgs) -> Result<Command, String> {
    let src = args.value('s').ok_or("link-window needs -s")?;
    let dst_index = match args.value('t') {
        Some(t) => Some(t.parse().map_err(|_| "bad window index".to_string())?),
        None => None,
    };
    Ok(Command::LinkWindow { src: src.to_string(), dst_index })
}

fn parse_split_window(args: &ParsedArgs) -> Result<Command, String> {
    let kind = if args.has('h') { SplitKind::LeftRight } else { SplitKind::TopBottom };
    let spec = if let Some(p) = args.value('p') {
        let pct: u8 = p.parse().map_err(|_| "bad percentage".to_string())?;
        SizeSpec::Percent(pct)
    } else if let Some(l) = args.value('l') {
        let cells: u16 = l.parse().map_err(|_| "bad size".to_string())?;
        SizeSpec::Cells(cells)
    } else {
        SizeSpec::Half
    };
    Ok(Command::SplitWindow {
        kind,
        spec,
        before: args.has('b'),
        command: args.positional.clone(),
    })
}

fn parse_select_pane(args: &ParsedArgs) -> Result<Command, String> {
    let target = args
        .value('t')
        .or_else(|| args.positional.first().map(|s| s.as_str()))
        .ok_or("select-pane needs a target")?;
    Ok(Command::SelectPane { target: target.to_string() })
}

fn parse_resize_pane(args: &ParsedArgs) -> Result<Command, String> {
    let amount: i32 = args
        .positional
        .first()
        .map(|s| s.parse().map_err(|_| "bad adjustment".to_string()))
        .transpose()?
        .unwrap_or(1);
    let (kind, delta) = if args.has('L') {
        (SplitKind::LeftRight, -amount)
    } else if args.has('R') {
        (SplitKind::LeftRight, amount)
    } else if args.has('U') {
        (SplitKind::TopBottom, -amount)
    } else if args.has('D') {
        (SplitKind::TopBottom, amount)
    } else {
        return Err("resize-pane needs one of -L -R -U -D".to_string());
    };
    Ok(Command::ResizePane { kind, delta })
}

fn parse_resize_window(args: &ParsedArgs) -> Result<Command, String> {
    let parse_dim = |v: Option<&str>| -> Result<Option<u16>, String> {
        v.map(|s| s.parse().map_err(|_| "bad size".to_string())).transpose()
    };
    let sx = parse_dim(args.value('x'))?;
    let sy = parse_dim(args.value('y'))?;
    if sx.is_none() && sy.is_none() {
        return Err("resize-window needs -x or -y".to_string());
    }
    Ok(Command::ResizeWindow { sx, sy })
}

fn parse_select_layout(args: &ParsedArgs) -> Result<Command, String> {
    let name = args.positional.first().ok_or("select-layout needs a layout")?;
    Ok(Command::SelectLayout { name: name.clone() })
}

fn parse_send_keys(args: &ParsedArgs) -> Result<Command, String> {
    if !args.has('l') {
        return Err("send-keys supports literal (-l) input only".to_string());
    }
    Ok(Command::SendKeys { literal: args.positional.clone() })
}

fn parse_set_option(args: &ParsedArgs) -> Result<Command, String> {
    let name = args.positional.first().ok_or("set-option needs a name")?;
    let value = args.positional.get(1).cloned().unwrap_or_default();
    Ok(Command::SetOption { name: name.clone(), value, global: args.has('g') })
}

fn parse_show_options(args: &ParsedArgs) -> Result<Command, String> {
    Ok(Command::ShowOptions { global: args.has('g') })
}

fn parse_set_buffer(args: &ParsedArgs) -> Result<Command, String> {
    let data = args.positional.join(" ");
    Ok(Command::SetBuffer { data })
}

fn parse_display(args: &ParsedArgs) -> Result<Command, String> {
    Ok(Command::DisplayMessage { text: args.positional.join(" ") })
}

fn parse_run_shell(args: &ParsedArgs) -> Result<Command, String> {
    let command = args.positional.join(" ");
    if command.is_empty() {
        return Err("run-shell needs a command".to_string());
    }
    Ok(Command::RunShell { command })
}

/// Externally registered handlers: a second registry behind a small
/// capability interface, consulted after the built-in table misses.
pub trait ExternalCommand {
    fn name(&self) -> &str;
    fn parse_args(&self, args: &[String]) -> Result<(), String>;
    fn exec(&self, argv: &[String]) -> CmdResult;
}

#[derive(Default)]
pub struct ExternalRegistry {
    handlers: Vec<Box<dyn ExternalCommand>>,
}

impl ExternalRegistry {
    pub fn register(&mut self, handler: Box<dyn ExternalCommand>) {
        self.handlers.push(handler);
    }

    pub fn find(&self, name: &str) -> Option<&dyn ExternalCommand> {
        self.handlers.iter().find(|h| h.name() == name).map(|h| h.as_ref())
    }
}

/// One queued command with the client it reports back to.
pub struct QueuedCommand {
    pub client: Option<crate::server::ClientId>,
    pub cmd: Command,
}

/// The command queue. Commands run in order; a Wait result parks the whole
/// queue behind a wake token until the matching event arrives.
#[derive(Default)]
pub struct CommandQueue {
    items: VecDeque<QueuedCommand>,
    waiting: Option<(WakeToken, QueuedCommand)>,
}

impl CommandQueue {
    pub fn push(&mut self, item: QueuedCommand) {
        self.items.push_back(item);
    }

    /// The next runnable command, unless the queue is parked.
    pub fn pop(&mut self) -> Option<QueuedCommand> {
        if self.waiting.is_some() {
            return None;
        }
        self.items.pop_front()
    }

    pub fn park(&mut self, token: WakeToken, item: QueuedCommand) {
        self.waiting = Some((token, item));
    }

    /// An event arrived: if it matches the parked token, hand the command
    /// back for its next poll.
    pub fn wake(&mut self, token: WakeToken) -> Option<QueuedCommand> {
        match &self.waiting {
            Some((t, _)) if *t == token => self.waiting.take().map(|(_, c)| c),
            _ => None,
        }
    }

    pub fn waiting_on(&self) -> Option<WakeToken> {
        self.waiting.as_ref().map(|(t, _)| *t)
    }

    /// Stop: drop everything queued or parked.
    pub fn flush(&mut self) {
        self.items.clear();
        self.waiting = None;
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.waiting.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn aliases_resolve() {
        let a = parse_command(&argv(&["split-window", "-h"])).unwrap();
        let b = parse_command(&argv(&["splitw", "-h"])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn split_window_size_specs() {
        match parse_command(&argv(&["split-window", "-v", "-p", "30"])).unwrap() {
            Command::SplitWindow { kind, spec, .. } => {
                assert_eq!(kind, SplitKind::TopBottom);
                assert_eq!(spec, SizeSpec::Percent(30));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match parse_command(&argv(&["split-window", "-h", "-l", "15"])).unwrap() {
            Command::SplitWindow { spec, .. } => assert_eq!(spec, SizeSpec::Cells(15)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_and_flag_error() {
        assert!(parse_command(&argv(&["frobnicate"])).is_err());
        assert!(parse_command(&argv(&["kill-pane", "-z"])).is_err());
    }

    #[test]
    fn flag_values_attached_or_separate() {
        let a = parse_command(&argv(&["select-window", "-t", "3"])).unwrap();
        let b = parse_command(&argv(&["select-window", "-t3"])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Command::SelectWindow { index: 3 });
    }

    #[test]
    fn double_dash_ends_flags() {
        match parse_command(&argv(&["new-window", "--", "-not-a-flag"])).unwrap() {
            Command::NewWindow { command, .. } => {
                assert_eq!(command, vec!["-not-a-flag".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn startup_file_parses_and_collects_causes() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# startup commands").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "set-option -g history-limit 5000").unwrap();
        writeln!(file, "frobnicate-window").unwrap();
        writeln!(file, "split-window -h -p 200").unwrap();
        writeln!(file, "new-window").unwrap();
        file.flush().unwrap();

        let (commands, causes) = parse_startup_file(file.path());
        assert_eq!(commands.len(), 3);
        assert!(matches!(commands[0], Command::SetOption { .. }));
        assert!(matches!(commands[2], Command::NewWindow { .. }));
        // Only the unknown command failed, tagged with its line number.
        assert_eq!(causes.len(), 1);
        assert!(causes[0].contains(":4:"), "got {:?}", causes[0]);
        assert!(causes[0].contains("frobnicate-window"));
    }

    #[test]
    fn missing_startup_file_is_one_cause() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-file.conf");
        let (commands, causes) = parse_startup_file(&path);
        assert!(commands.is_empty());
        assert_eq!(causes.len(), 1);
    }

    #[test]
    fn queue_parks_and_wakes() {
        let mut q = CommandQueue::default();
        q.push(QueuedCommand { client: None, cmd: Command::NextWindow });
        q.push(QueuedCommand { client: None, cmd: Command::PreviousWindow });
        let first = q.pop().unwrap();
        q.park(WakeToken::Child(42), first);
        assert!(q.pop().is_none());
        assert!(q.wake(WakeToken::Child(7)).is_none());
        let resumed = q.wake(WakeToken::Child(42)).unwrap();
        assert_eq!(resumed.cmd, Command::NextWindow);
        assert!(q.pop().is_some());
    }
}
