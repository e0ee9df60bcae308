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

//! Client side server bootstrapping: if the connect fails because no
//! server is listening, fork one in the background and retry.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process, thread,
};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info};

use crate::{consts, protocol::Client, runtime};

/// Dial the server, auto-starting it if permitted.
///
/// ENOENT and ECONNREFUSED mean "no server yet": with auto-start
/// allowed we clean up any stale socket, spawn the server detached,
/// and retry on a fixed budget. Any other connect error propagates
/// immediately.
pub fn dial(
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<Client> {
    let err = match Client::connect(socket) {
        Ok(client) => return Ok(client),
        Err(err) => err,
    };
    if !is_no_server(&err) {
        return Err(err);
    }
    if !auto_start {
        bail!("No server running");
    }

    info!("no server on {:?}, starting one", socket);
    if socket.exists() {
        debug!("removing stale socket {:?}", socket);
        let _ = fs::remove_file(socket);
    }
    spawn_server(runtime_dir, log_file)?;

    for _ in 0..consts::CONNECT_RETRIES {
        match Client::connect(socket) {
            Ok(client) => {
                info!("connected to freshly started server");
                return Ok(client);
            }
            Err(err) if is_no_server(&err) => {
                thread::sleep(consts::CONNECT_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }

    Err(anyhow!("started a server, but its socket never came up"))
}

fn is_no_server(err: &anyhow::Error) -> bool {
    match err.root_cause().downcast_ref::<io::Error>() {
        Some(io_err) => {
            io_err.kind() == io::ErrorKind::NotFound
                || io_err.kind() == io::ErrorKind::ConnectionRefused
        }
        None => false,
    }
}

/// Fork the server executable with stdio pointed at the null device.
/// The child is its own process; we never wait on it.
fn spawn_server(runtime_dir: &Path, log_file: Option<&str>) -> anyhow::Result<()> {
    let arg0 = env::args().next().ok_or(anyhow!("no arg0 to resolve the server binary from"))?;
    let cwd = env::current_dir().context("getting cwd")?;
    let exe = resolve_executable(&arg0, &cwd, env::var_os("PATH").as_deref())
        .ok_or(anyhow!("could not resolve '{}' to a server binary", arg0))?;

    let mut cmd = process::Command::new(exe);
    cmd.arg("--server");
    let log = match log_file {
        Some(log) => String::from(log),
        None => runtime::log_file_path(runtime_dir).to_string_lossy().into_owned(),
    };
    cmd.arg("--log").arg(log);
    cmd.stdin(process::Stdio::null())
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::null())
        .spawn()
        .context("launching background server")?;
    info!("launched background server");

    Ok(())
}

/// arg0 resolution: absolute paths pass through, anything with a
/// separator resolves against the cwd, a bare name gets a PATH
/// search.
fn resolve_executable(
    arg0: &str,
    cwd: &Path,
    path_var: Option<&std::ffi::OsStr>,
) -> Option<PathBuf> {
    let candidate = Path::new(arg0);
    if candidate.is_absolute() {
        return Some(candidate.to_path_buf());
    }
    if arg0.contains('/') {
        return Some(cwd.join(candidate));
    }
    for dir in env::split_paths(path_var?) {
        let full = dir.join(candidate);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}
