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

pub fn run(
    name: Option<String>,
    command_line: Vec<String>,
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<()> {
    let client = autostart::dial(socket, runtime_dir, auto_start, log_file)?;

    let mut request = Request::new(Command::CreateSession);
    request.name = name;
    if !command_line.is_empty() {
        request.command_line = Some(command_line);
    }

    let response = client.request(request).context("creating session")?;
    if !response.ok {
        return Err(anyhow!(
            "{}",
            response.message.unwrap_or_else(|| String::from("create failed"))
        ));
    }

    let session = response.session.ok_or(anyhow!("create response carried no session"))?;
    match &session.name {
        Some(name) => println!("created session {} ({})", session.id, name),
        None => println!("created session {}", session.id),
    }

    Ok(())
}
