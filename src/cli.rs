//! Command-line surface of the binary: global flags, the subcommand words
//! passed through to the server, and target-string parsing.

use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "rsmux".to_string())
}

/// Parsed invocation.
pub struct Invocation {
    /// -L name under the default socket directory.
    pub socket_name: String,
    /// -S full path, overriding -L.
    pub socket_path: Option<PathBuf>,
    /// -f startup command file.
    pub config: Option<PathBuf>,
    pub show_version: bool,
    pub show_help: bool,
    /// Everything after the flags, handed to the command parser.
    pub command: Vec<String>,
}

pub fn parse(args: &[String]) -> Result<Invocation, String> {
    let mut inv = Invocation {
        socket_name: "default".to_string(),
        socket_path: None,
        config: None,
        show_version: false,
        show_help: false,
        command: Vec::new(),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-L" => {
                inv.socket_name = iter.next().ok_or("-L requires a socket name")?.clone();
            }
            "-S" => {
                inv.socket_path = Some(PathBuf::from(iter.next().ok_or("-S requires a path")?));
            }
            "-f" => {
                inv.config = Some(PathBuf::from(iter.next().ok_or("-f requires a path")?));
            }
            "-V" | "--version" => inv.show_version = true,
            "-h" | "--help" => inv.show_help = true,
            _ => {
                inv.command.push(arg.clone());
                inv.command.extend(iter.cloned());
                break;
            }
        }
    }
    Ok(inv)
}

pub fn print_help() {
    let prog = program_name();
    println!(
        r#"{prog} - terminal multiplexer

USAGE:
    {prog} [-L socket-name] [-S socket-path] [-f file] [COMMAND [ARGS]]

COMMANDS:
    (no command)        Attach to the most recent session, or start one
    new-session (new)   Create a new session
        -s <name>       Session name
        -d              Start detached
    attach-session (attach)
                        Attach to an existing session
        -t <name>       Target session name
    ls, list-sessions   List sessions on the server
    kill-server         Stop the server and every session
    server              Run the server in the foreground (internal)
    start-server        Start a detached server

    Any other command word is sent to the running server.

OPTIONS:
    -L <name>           Socket name under the default directory
    -S <path>           Full socket path
    -f <file>           Run commands from file at server start
    -V, --version       Show version
    -h, --help          Show this help

KEY BINDINGS (prefix: Ctrl+B):
    c   new window          "   split top/bottom
    %   split left/right    x   kill pane
    n   next window         p   previous window
    l   last window         d   detach
    0-9 select window       o   next pane
    arrows (repeat)         resize pane

EXIT CODES:
    0 success, 1 error, 2 command syntax error, 3 no running server
"#
    );
}

pub fn print_version() {
    println!(
        "{} {} (protocol {})",
        program_name(),
        VERSION,
        crate::protocol::PROTOCOL_VERSION
    );
}

/// A parsed `session:window.pane` target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTarget {
    pub session: Option<String>,
    pub window: Option<usize>,
    pub pane: Option<usize>,
    pub pane_is_id: bool,
    pub window_is_id: bool,
}

/// Understand tmux-style targets: `name`, `name:2`, `:2.1`, `%5`, `@3`.
pub fn parse_target(target: &str) -> ParsedTarget {
    let mut result = ParsedTarget::default();

    if let Some(id) = target.strip_prefix('%') {
        if let Ok(pid) = id.parse() {
            result.pane = Some(pid);
            result.pane_is_id = true;
        }
        return result;
    }
    if let Some(id) = target.strip_prefix('@') {
        if let Ok(wid) = id.parse() {
            result.window = Some(wid);
            result.window_is_id = true;
        }
        return result;
    }

    let (session_part, rest) = match target.find(':') {
        Some(pos) => {
            let session = if pos == 0 { None } else { Some(target[..pos].to_string()) };
            (session, Some(&target[pos + 1..]))
        }
        None if target.starts_with('.') => (None, Some(target)),
        // A bare word is always a session name, even when numeric.
        None => (Some(target.to_string()), None),
    };
    result.session = session_part;

    if let Some(rest) = rest {
        match rest.find('.') {
            Some(dot) => {
                if dot > 0 {
                    result.window = rest[..dot].parse().ok();
                }
                result.pane = rest[dot + 1..].parse().ok();
            }
            None => result.window = rest.parse().ok(),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_then_command() {
        let args: Vec<String> = ["-L", "work", "new-session", "-s", "dev"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let inv = parse(&args).unwrap();
        assert_eq!(inv.socket_name, "work");
        assert_eq!(inv.command, vec!["new-session", "-s", "dev"]);
    }

    #[test]
    fn bare_name_is_session() {
        let t = parse_target("0");
        assert_eq!(t.session.as_deref(), Some("0"));
        assert_eq!(t.window, None);
    }

    #[test]
    fn session_window_pane_forms() {
        let t = parse_target("main:2.1");
        assert_eq!(t.session.as_deref(), Some("main"));
        assert_eq!(t.window, Some(2));
        assert_eq!(t.pane, Some(1));

        let t = parse_target(":3");
        assert_eq!(t.session, None);
        assert_eq!(t.window, Some(3));
    }

    #[test]
    fn id_forms() {
        let t = parse_target("%7");
        assert!(t.pane_is_id);
        assert_eq!(t.pane, Some(7));
        let t = parse_target("@2");
        assert!(t.window_is_id);
        assert_eq!(t.window, Some(2));
    }
}
