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
    session_id: String,
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<()> {
    let client = autostart::dial(socket, runtime_dir, auto_start, log_file)?;

    let mut request = Request::new(Command::DestroySession);
    request.session_id = Some(session_id.clone());

    let response = client.request(request).context("destroying session")?;
    if !response.ok {
        return Err(anyhow!(
            "{}",
            response.message.unwrap_or_else(|| String::from("destroy failed"))
        ));
    }

    println!("destroyed session {}", session_id);
    Ok(())
}
