use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use rsmux::cli;
use rsmux::client::{self, ClientExit};
use rsmux::server::{self, Server};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    std::process::exit(run(&args));
}

fn run(args: &[String]) -> i32 {
    let inv = match cli::parse(args) {
        Ok(inv) => inv,
        Err(e) => {
            eprintln!("{}: {}", cli::program_name(), e);
            return 2;
        }
    };
    if inv.show_help {
        cli::print_help();
        return 0;
    }
    if inv.show_version {
        cli::print_version();
        return 0;
    }

    let socket_path = inv
        .socket_path
        .clone()
        .unwrap_or_else(|| server::socket_path(&inv.socket_name));

    let word = inv.command.first().map(|s| s.as_str()).unwrap_or("");
    match word {
        "server" => match run_server(socket_path, inv.config.clone()) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{}: {:#}", cli::program_name(), e);
                1
            }
        },
        "start-server" | "start" => {
            match client::connect_or_start(&socket_path, true) {
                Ok(_) => 0,
                Err(exit) => report(exit),
            }
        }
        _ => run_client(&socket_path, &inv.command),
    }
}

fn run_server(socket_path: PathBuf, config: Option<PathBuf>) -> anyhow::Result<()> {
    init_server_logging(&socket_path);
    // Detach from the starting client's terminal and session.
    unsafe {
        libc::setsid();
    }
    let mut server = Server::new(socket_path).context("cannot bind server socket")?;
    if let Some(config) = config {
        server.load_startup_file(&config);
    }
    server.run().context("server loop failed")?;
    Ok(())
}

fn run_client(socket_path: &PathBuf, command: &[String]) -> i32 {
    init_client_logging();
    let (argv, attach): (Vec<String>, bool) = match command.first().map(|s| s.as_str()) {
        None | Some("") => {
            // Attach when a server is up, otherwise start one session.
            match client::connect_or_start(socket_path, false) {
                Ok(sock) => {
                    drop(sock);
                    (vec!["attach-session".to_string()], true)
                }
                Err(_) => (vec!["new-session".to_string()], true),
            }
        }
        Some("attach-session") | Some("attach") => (command.to_vec(), true),
        Some("new-session") | Some("new") => {
            let detach = command.iter().any(|a| a == "-d");
            (command.to_vec(), !detach)
        }
        Some(_) => (command.to_vec(), false),
    };

    // Only commands that can create a session may start the server.
    let autostart = matches!(argv.first().map(|s| s.as_str()), Some("new-session"));
    let sock = match client::connect_or_start(socket_path, autostart) {
        Ok(s) => s,
        Err(exit) => return report(exit),
    };

    let exit = if attach {
        client::run_attached(sock, &argv)
    } else {
        client::run_control(sock, &argv)
    };
    report(exit)
}

fn report(exit: ClientExit) -> i32 {
    match &exit {
        ClientExit::Error(msg) => eprintln!("{}: {}", cli::program_name(), msg.trim_end()),
        ClientExit::NoServer => eprintln!("{}: no server running", cli::program_name()),
        _ => {}
    }
    exit.code()
}

fn init_server_logging(socket_path: &std::path::Path) {
    let filter = EnvFilter::try_from_env("RSMUX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(dir) = socket_path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let log_path = socket_path.with_extension("log");
    match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn init_client_logging() {
    if std::env::var("RSMUX_LOG").is_ok() {
        let filter =
            EnvFilter::try_from_env("RSMUX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
