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
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<()> {
    let client = autostart::dial(socket, runtime_dir, auto_start, log_file)?;

    let response =
        client.request(Request::new(Command::ListSessions)).context("listing sessions")?;
    if !response.ok {
        return Err(anyhow!("{}", response.message.unwrap_or_else(|| String::from("list failed"))));
    }

    println!("ID\tNAME\tCREATED_AT\tSTATUS\tPID");
    for session in response.sessions.unwrap_or_default() {
        let status = if session.is_running {
            String::from("running")
        } else {
            match session.exit_code {
                Some(code) => format!("exited({})", code),
                None => String::from("exited"),
            }
        };
        println!(
            "{}\t{}\t{}\t{}\t{}",
            session.id,
            session.name.as_deref().unwrap_or("-"),
            session.created_at.to_rfc3339(),
            status,
            session.process_id.map(|p| p.to_string()).unwrap_or_else(|| String::from("-")),
        );
    }

    Ok(())
}
