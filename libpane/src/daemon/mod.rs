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

use std::{
    fs,
    os::unix::fs::PermissionsExt as _,
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
};

use anyhow::{bail, Context};
use tracing::{info, instrument};

use crate::runtime;

pub mod emulator;
pub mod registry;
pub mod server;
mod signals;
pub mod session;
pub mod subscriber;

/// Bring the server up on the given socket and serve until told to
/// terminate.
#[instrument(skip_all)]
pub fn run(runtime_dir: PathBuf, socket: PathBuf) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING SERVER ============================\n\n");

    signals::ignore_sigpipe()?;

    runtime::ensure_dir(&runtime_dir)?;
    runtime::check_socket_path(&socket)?;

    // If a live server already owns this socket, stealing it would
    // leave two daemons fighting over one path. Racing auto-starts
    // funnel through this probe.
    if UnixStream::connect(&socket).is_ok() {
        bail!("another pane server is already running on {:?}", socket);
    }
    if socket.exists() {
        info!("removing stale socket {:?}", socket);
        fs::remove_file(&socket).context("removing stale socket")?;
    }

    let listener = UnixListener::bind(&socket).context("binding to socket")?;
    fs::set_permissions(&socket, fs::Permissions::from_mode(0o600))
        .context("locking down socket")?;

    runtime::write_pid_file(&runtime_dir)?;

    signals::Handler::new(socket.clone(), runtime::pid_file_path(&runtime_dir)).spawn()?;

    let server = server::Server::new(socket.clone());
    server::Server::serve(server, listener)?;

    fs::remove_file(&socket).context("cleaning up socket on exit")?;
    runtime::remove_pid_file(&runtime_dir);

    Ok(())
}
