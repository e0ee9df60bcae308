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

//! An in-process pane server on a throwaway socket, so the suite
//! stays hermetic and needs no prebuilt binaries.

#![allow(dead_code)]

use std::{os::unix::net::UnixListener, path::PathBuf, sync::Arc, thread};

use anyhow::{anyhow, bail, Context};
use libpane::{daemon::server::Server, protocol::Client, protocol::FramedConnection};
use pane_protocol::{Cell, Command, Request, Response, Snapshot, WireMessage};

pub struct TestServer {
    // dropping the tempdir tears the socket down with it
    _dir: tempfile::TempDir,
    pub socket: PathBuf,
    pub server: Arc<Server>,
}

impl TestServer {
    /// Bind a fresh socket in a tempdir and serve on a background
    /// thread. The thread dies with the test process.
    pub fn spawn() -> anyhow::Result<TestServer> {
        let dir = tempfile::tempdir().context("creating test runtime dir")?;
        let socket = dir.path().join("default");
        let listener = UnixListener::bind(&socket).context("binding test socket")?;
        let server = Server::new(socket.clone());

        let serving = Arc::clone(&server);
        thread::spawn(move || {
            let _ = Server::serve(serving, listener);
        });

        Ok(TestServer { _dir: dir, socket, server })
    }

    pub fn client(&self) -> anyhow::Result<Client> {
        Client::connect(&self.socket)
    }

    /// One request, one response, connection closed.
    pub fn request(&self, request: Request) -> anyhow::Result<Response> {
        self.client()?.request(request)
    }

    /// Create a session running `command` and hand back its id.
    pub fn create_session(&self, name: &str, command: &[&str]) -> anyhow::Result<String> {
        let mut request = Request::new(Command::CreateSession);
        request.name = Some(String::from(name));
        request.command_line = Some(command.iter().map(|s| String::from(*s)).collect());
        let response = self.request(request)?;
        if !response.ok {
            bail!("create failed: {:?}", response.message);
        }
        response.session.map(|s| s.id).ok_or(anyhow!("create response carried no session"))
    }

    /// Run the attach handshake. On a refusal the response comes back
    /// with no snapshot; on success the initial snapshot has already
    /// been read off the stream.
    pub fn attach(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<(FramedConnection, Response, Option<Snapshot>)> {
        let conn = self.client()?.into_connection();
        let mut request = Request::new(Command::AttachSession);
        request.session_id = Some(String::from(session_id));
        request.cols = Some(cols);
        request.rows = Some(rows);
        conn.send(&WireMessage::Request(request)).context("writing attach request")?;

        let response = match conn.read_message().context("reading attach response")? {
            Some(WireMessage::Response(response)) => response,
            other => bail!("expected an attach response, got {:?}", other),
        };
        if !response.ok {
            return Ok((conn, response, None));
        }

        let snapshot = match conn.read_message().context("reading initial snapshot")? {
            Some(WireMessage::Snapshot(snapshot)) => snapshot,
            other => bail!("expected the initial snapshot, got {:?}", other),
        };
        Ok((conn, response, Some(snapshot)))
    }
}

/// Flatten screen rows into the text they display.
pub fn screen_text(lines: &[Vec<Cell>]) -> String {
    lines.iter().flat_map(|line| line.iter()).map(|cell| cell.ch.as_str()).collect()
}

/// The messages a test cares about from the streaming half.
pub enum ScreenEvent {
    Snapshot(Snapshot),
    Delta(pane_protocol::Delta),
}

/// Read screen traffic until `pred` accepts an event. Relies on the
/// per-test timeout to bound a server that never delivers.
pub fn read_screen_until<F>(conn: &FramedConnection, mut pred: F) -> anyhow::Result<ScreenEvent>
where
    F: FnMut(&ScreenEvent) -> bool,
{
    loop {
        let event = match conn.read_message()? {
            Some(WireMessage::Snapshot(snapshot)) => ScreenEvent::Snapshot(snapshot),
            Some(WireMessage::Delta(delta)) => ScreenEvent::Delta(delta),
            Some(_) => continue,
            None => bail!("connection closed before the expected screen update"),
        };
        if pred(&event) {
            return Ok(event);
        }
    }
}
