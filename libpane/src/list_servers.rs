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

use std::{fs, os::unix::fs::FileTypeExt as _, path::Path};

use anyhow::Context;
use pane_protocol::{Command, Request};
use tracing::debug;

use crate::protocol::Client;

/// Scan the runtime directory for sockets and ping whoever is
/// listening on each. Dead sockets are reported as stale rather than
/// cleaned up; the next server start unlinks them.
pub fn run(runtime_dir: &Path) -> anyhow::Result<()> {
    println!("PID\tSTARTED_AT\tSOCKET");

    let entries = match fs::read_dir(runtime_dir) {
        Ok(entries) => entries,
        Err(_) => {
            // no runtime dir at all means no servers have ever run
            return Ok(());
        }
    };

    for entry in entries {
        let entry = entry.context("reading runtime dir entry")?;
        let file_type = entry.file_type().context("stating runtime dir entry")?;
        if !file_type.is_socket() {
            continue;
        }
        let path = entry.path();

        let server = Client::connect(&path)
            .and_then(|client| client.request(Request::new(Command::Ping)))
            .ok()
            .and_then(|response| response.server);
        match server {
            Some(server) => {
                println!("{}\t{}\t{}", server.pid, server.started_at.to_rfc3339(), server.socket_path)
            }
            None => {
                debug!("socket {:?} did not answer a ping", path);
                println!("-\t-\t{} (stale)", path.display())
            }
        }
    }

    Ok(())
}
