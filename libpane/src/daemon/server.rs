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

//! The accept loop and command dispatch.
//!
//! Every connection carries exactly one request. Control commands get
//! one response and a close; a successful attach converts the
//! connection into a persistent subscriber stream instead.

use std::{
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    process,
    sync::Arc,
    thread,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pane_protocol::{Command, Request, Response, ServerInfo, WireMessage};
use tracing::{error, info, instrument, warn};

use crate::{
    consts,
    daemon::{registry::Registry, subscriber::Subscriber},
    protocol::FramedConnection,
};

pub struct Server {
    registry: Registry,
    socket_path: PathBuf,
    started_at: DateTime<Utc>,
    pid: i32,
}

impl Server {
    pub fn new(socket_path: PathBuf) -> Arc<Self> {
        Arc::new(Server {
            registry: Registry::new(),
            socket_path,
            started_at: Utc::now(),
            pid: process::id() as i32,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        let mut conn_counter = 0u64;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    info!("socket got a new connection");
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_conn(stream, conn_id) {
                            error!("handling new connection: {:?}", err)
                        }
                    });
                }
                Err(err) => {
                    error!("accepting stream: {:?}", err);
                }
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, stream: UnixStream, conn_id: u64) -> anyhow::Result<()> {
        // Don't let a stalled client tie the handler thread up
        // forever during the handshake.
        stream
            .set_read_timeout(Some(consts::SOCK_STREAM_TIMEOUT))
            .context("setting read timeout on inbound connection")?;
        let conn = FramedConnection::new(stream)?;

        let msg = match conn.read_message() {
            Ok(msg) => msg,
            Err(err) => {
                // a codec error is fatal to the connection; there is
                // no request to answer
                conn.close();
                return Err(err).context("reading request");
            }
        };
        let request = match msg {
            // presence probe, nothing to do
            None => return Ok(()),
            Some(WireMessage::Request(request)) => request,
            Some(other) => {
                info!("first frame was a {:?}, not a request", other.message_type());
                return self.respond_and_close(&conn, Response::error("invalid request"));
            }
        };

        // The handshake is over; streaming connections legitimately
        // sit idle for long stretches.
        conn.set_read_timeout(None).context("unsetting read timeout on inbound connection")?;

        info!("dispatching {:?}", request.command);
        match request.command {
            Command::Ping => {
                let mut response = Response::ok();
                response.message = Some(String::from("pong"));
                self.respond_and_close(&conn, response)
            }
            Command::CreateSession => {
                let response = self.handle_create(&request);
                self.respond_and_close(&conn, response)
            }
            Command::ListSessions => {
                let response = self.handle_list();
                self.respond_and_close(&conn, response)
            }
            Command::DestroySession => {
                let response = self.handle_destroy(&request);
                self.respond_and_close(&conn, response)
            }
            Command::AttachSession => self.handle_attach(conn, conn_id, request),
        }
    }

    fn handle_create(&self, request: &Request) -> Response {
        match self.registry.create(request.name.clone(), request.command_line.clone()) {
            Ok(session) => {
                let mut response = Response::ok();
                response.session = Some(session.info());
                response
            }
            Err(err) => {
                error!("creating session: {:?}", err);
                Response::error("create session failed")
            }
        }
    }

    fn handle_list(&self) -> Response {
        let mut response = Response::ok();
        response.sessions =
            Some(self.registry.list().iter().map(|session| session.info()).collect());
        response
    }

    fn handle_destroy(&self, request: &Request) -> Response {
        let session_id = match &request.session_id {
            Some(id) => id,
            None => return Response::error("session id required"),
        };
        match self.registry.destroy(session_id) {
            Some(session) => {
                // terminate outside the registry lock; destroy
                // already released it
                session.terminate();
                Response::ok()
            }
            None => Response::error("session not found"),
        }
    }

    /// Upgrade the connection into a subscriber stream: register the
    /// subscriber, apply the client's declared size, and queue the
    /// response plus the initial snapshot before any delta can pass.
    /// The connection stays open until the subscriber closes it.
    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_attach(
        &self,
        conn: FramedConnection,
        conn_id: u64,
        request: Request,
    ) -> anyhow::Result<()> {
        let session_id = match &request.session_id {
            Some(id) => id.clone(),
            None => return self.respond_and_close(&conn, Response::error("session id required")),
        };
        let session = match self.registry.lookup(&session_id) {
            Some(session) => session,
            None => return self.respond_and_close(&conn, Response::error("session not found")),
        };

        let conn = Arc::new(conn);
        let subscriber = Subscriber::spawn(conn_id, Arc::clone(&conn))?;

        let unlink_target = Arc::downgrade(&session);
        subscriber.set_on_close(Box::new(move |id| {
            if let Some(session) = unlink_target.upgrade() {
                session.remove_subscriber(id);
            }
        }));

        let mut response = Response::ok();
        response.session = Some(session.info());
        let response = WireMessage::Response(self.decorate(response));

        let size = request.cols.zip(request.rows);
        if let Err(err) = session.attach(Arc::clone(&subscriber), size, &response) {
            warn!("wiring subscriber: {:?}", err);
            subscriber.close();
            return Ok(());
        }
        subscriber.start_recv_loop(session)?;

        info!("subscriber {} attached to session {}", conn_id, session_id);
        Ok(())
    }

    fn respond_and_close(&self, conn: &FramedConnection, response: Response) -> anyhow::Result<()> {
        let response = self.decorate(response);
        let result = conn.send(&WireMessage::Response(response)).context("writing response");
        conn.close();
        result
    }

    /// Every response leaving the server says which server it came
    /// from.
    fn decorate(&self, mut response: Response) -> Response {
        response.server = Some(self.server_info());
        response
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            pid: self.pid,
            started_at: self.started_at,
            socket_path: self.socket_path.to_string_lossy().into_owned(),
        }
    }
}
