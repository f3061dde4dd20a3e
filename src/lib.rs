//! rsmux: a terminal multiplexer core. A detached server owns sessions,
//! windows, and panes; clients attach over a Unix socket and hand the
//! server their terminal. Each pane's output runs through an in-tree
//! VT/ANSI parser into a cell grid with scrollback.

pub mod cli;
pub mod client;
pub mod command;
pub mod event_loop;
pub mod grid;
pub mod grid_view;
pub mod input_keys;
pub mod keys;
pub mod layout;
pub mod layout_string;
pub mod options;
pub mod pane;
pub mod parser;
pub mod protocol;
pub mod pty;
pub mod render;
pub mod screen;
pub mod screen_write;
pub mod server;
pub mod session;
pub mod sixel;
pub mod tree;
pub mod tty;
pub mod tty_keys;
pub mod window;
