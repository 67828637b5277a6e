// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::remote::RemoteFileStat;

pub const DEFAULT_LINE_COUNT: u64 = 100;

#[derive(Debug, Parser)]
#[command(
    name = "abacusd",
    version,
    about,
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < ABACUS_CONFIG_PATH < command-line flags.\n\
If --config is omitted, abacusd tries ABACUS_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Logging is controlled by ABACUS_LOG, ABACUS_LOG_FORMAT, ABACUS_LOG_SPAN_EVENTS and ABACUS_LOG_FILE."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, abacusd uses ABACUS_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to the SQLite database file. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "How often to poll the scheduler accounting. Overrides `poll_interval_secs` from the config file."
    )]
    pub poll_interval_secs: Option<u64>,
    #[arg(
        long,
        value_name = "N",
        help = "Maximum number of concurrent SSH sessions. Overrides `pool_size` from the config file."
    )]
    pub pool_size: Option<usize>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the daemon (default).
    Serve,
    /// Print the persisted job history of an owner as JSON.
    History {
        #[arg(value_name = "OWNER")]
        owner: String,
    },
    /// Print a window of lines from a text file on the cluster.
    Lines {
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,
        #[arg(long, default_value_t = 1, help = "First line to print, 1-based.")]
        start: u64,
        #[arg(long, default_value_t = DEFAULT_LINE_COUNT, help = "Maximum number of lines to print.")]
        count: u64,
    },
    /// List a directory on the cluster.
    Ls {
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,
    },
}

impl Opts {
    pub fn selected_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    <Opts as CommandFactory>::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let verbose_override = if matches.get_flag("verbose") {
        Some(true)
    } else {
        None
    };
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts {
        opts,
        verbose_override,
    }
}

/// One `ls` row: octal mode, size, mtime in unix seconds, path. Unknown fields print as `-`.
pub fn format_listing_entry(entry: &RemoteFileStat) -> String {
    let mode = entry
        .permissions
        .map(|bits| format!("{:04o}", bits & 0o7777))
        .unwrap_or_else(|| "-".into());
    let modified = entry
        .modified_at
        .map(|secs| secs.to_string())
        .unwrap_or_else(|| "-".into());
    let suffix = if entry.is_dir { "/" } else { "" };
    format!(
        "{mode} {:>12} {modified:>10} {}{suffix}",
        entry.size, entry.path
    )
}
