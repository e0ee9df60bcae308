// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, os::unix::fs::OpenOptionsExt as _, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod attach;
mod autostart;
pub mod consts;
mod create;
pub mod daemon;
mod destroy;
mod list;
mod list_servers;
pub mod protocol;
mod render;
pub mod runtime;
mod status;
mod tty;

/// The command line arguments that pane expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if pane is
running in server mode, the logs will go to stderr by default."
    )]
    pub log: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(long, action, help = "Never launch a server on demand")]
    pub no_auto_start: bool,

    // How auto-started servers are launched; not part of the user
    // facing surface.
    #[clap(long, action, hide = true)]
    pub server: bool,

    #[clap(subcommand)]
    pub command: Option<Commands>,
}

/// The subcommands that pane supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Run the server that hosts the shell sessions, in the foreground")]
    Server,

    #[clap(about = "Report which server is answering on the control socket")]
    Status,

    #[clap(about = "List live servers found in the runtime directory")]
    ListServers,

    #[clap(about = "Create a new session

Runs your login shell unless a command is given after `--`.")]
    Create {
        #[clap(help = "An optional human name for the session")]
        name: Option<String>,
        #[clap(last = true, help = "Command to run instead of the default shell")]
        command: Vec<String>,
    },

    #[clap(about = "List the sessions on the server")]
    List,

    #[clap(about = "Attach to a session and drive it live

With no session id, attaches to the only running session.
While attached, ctrl-b d detaches, ctrl-b c creates and switches
to a fresh session, and ctrl-b n / ctrl-b p cycle through the
running sessions.")]
    Attach {
        #[clap(help = "The id of the session to attach to")]
        session_id: Option<String>,
    },

    #[clap(about = "Terminate a session and remove it from the server")]
    Destroy {
        #[clap(help = "The id of the session to destroy")]
        session_id: String,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Some(Commands::Version))
    }
}

/// Run the pane tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let server_mode = args.server || matches!(args.command, Some(Commands::Server));

    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log.clone() {
        let file = fs::File::options()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&log_file)
            .with_context(|| format!("opening log file {:?}", log_file))?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if server_mode {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let runtime_dir = runtime::dir();
    runtime::ensure_dir(&runtime_dir)?;
    let socket = runtime::socket_path(&runtime_dir);

    let auto_start = !args.no_auto_start;
    let log = args.log.as_deref();

    let res: anyhow::Result<()> = if server_mode {
        daemon::run(runtime_dir, socket)
    } else {
        match args.command {
            None => Err(anyhow!("no subcommand given, try `pane list`")),
            Some(Commands::Version) => Err(anyhow!("wrapper binary must handle version")),
            Some(Commands::Server) => unreachable!("server mode handled above"),
            Some(Commands::Status) => status::run(&socket, &runtime_dir, auto_start, log),
            Some(Commands::ListServers) => list_servers::run(&runtime_dir),
            Some(Commands::Create { name, command }) => {
                create::run(name, command, &socket, &runtime_dir, auto_start, log)
            }
            Some(Commands::List) => list::run(&socket, &runtime_dir, auto_start, log),
            Some(Commands::Attach { session_id }) => {
                attach::run(session_id, &socket, &runtime_dir, auto_start, log)
            }
            Some(Commands::Destroy { session_id }) => {
                destroy::run(session_id, &socket, &runtime_dir, auto_start, log)
            }
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        eprintln!("pane: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
