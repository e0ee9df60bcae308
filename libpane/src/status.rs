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

use std::path::Path;

use anyhow::{anyhow, Context};
use pane_protocol::{Command, Request};

use crate::autostart;

/// Ping the server and report who answered.
pub fn run(
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<()> {
    let client = autostart::dial(socket, runtime_dir, auto_start, log_file)?;

    let response = client.request(Request::new(Command::Ping)).context("pinging server")?;
    if !response.ok {
        return Err(anyhow!("{}", response.message.unwrap_or_else(|| String::from("ping failed"))));
    }

    match response.server {
        Some(server) => {
            println!("pid: {}", server.pid);
            println!("started at: {}", server.started_at.to_rfc3339());
            println!("socket: {}", server.socket_path);
        }
        None => println!("server answered but did not identify itself"),
    }

    Ok(())
}
