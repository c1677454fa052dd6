//! Process-wide tunables, resolved once at startup from the command line.

use std::path::PathBuf;

use clap::Parser;

/// Native child-process helper daemon.
///
/// Connects back to the client on `socket_path`, hands that connection to the service loop as
/// the main channel, and spawns/reaps/signals children on the client's behalf until the main
/// channel closes or `SIGQUIT` arrives.
#[derive(Debug, Parser)]
#[command(name = "childproc-helperd", version)]
pub struct Config {
    /// Path of the Unix domain socket the client is listening on.
    pub socket_path: PathBuf,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Config {
    /// The `log`/`env_logger` filter level implied by `verbosity`, used only when `RUST_LOG`
    /// isn't set.
    pub fn default_log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
