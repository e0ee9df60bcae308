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

//! `pane attach`: the client side streaming loop.
//!
//! After the handshake the connection is a plain duplex stream:
//! stdin bytes go up as input frames (minus the ctrl-b command
//! prefix), snapshots and deltas come down and get painted. Commands
//! behind the prefix switch sessions by tearing this loop down and
//! running it again against a new target.

use std::{
    io::{self, Read},
    path::Path,
    sync::{Arc, Mutex},
    thread, time,
};

use anyhow::{anyhow, bail, Context};
use pane_protocol::{Command, Input, Request, Resize, SessionInfo, WireMessage};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    autostart, consts,
    protocol::FramedConnection,
    render::Renderer,
    tty,
};

/// The command prefix key, ctrl-b.
const PREFIX_KEY: u8 = 0x02;

const JOIN_HANGUP_DUR: time::Duration = time::Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Detach,
    Create,
    Next,
    Prev,
}

pub fn run(
    session_id: Option<String>,
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING ATTACH ============================\n\n");

    let mut target = match session_id {
        Some(id) => id,
        None => only_running_session(socket, runtime_dir, auto_start, log_file)?,
    };

    // One SIGWINCH pump for the whole process; it always talks to
    // whichever connection is currently attached.
    let active_conn: Arc<Mutex<Option<Arc<FramedConnection>>>> = Arc::new(Mutex::new(None));
    spawn_winch_handler(Arc::clone(&active_conn))?;

    loop {
        let outcome =
            attach_once(&target, socket, runtime_dir, auto_start, log_file, &active_conn)?;
        target = match outcome {
            Outcome::Detach => {
                println!("detached from session {}", target);
                return Ok(());
            }
            Outcome::Create => {
                let created = create_session(socket, runtime_dir, auto_start, log_file)?;
                info!("switching to new session {}", created);
                created
            }
            Outcome::Next => neighbor_session(&target, 1, socket, runtime_dir, auto_start, log_file)?,
            Outcome::Prev => {
                neighbor_session(&target, -1, socket, runtime_dir, auto_start, log_file)?
            }
        };
    }
}

#[instrument(skip_all, fields(s = target))]
fn attach_once(
    target: &str,
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
    active_conn: &Arc<Mutex<Option<Arc<FramedConnection>>>>,
) -> anyhow::Result<Outcome> {
    let client = autostart::dial(socket, runtime_dir, auto_start, log_file)?;

    let (cols, rows) = match tty::window_size(consts::STDIN_FD) {
        Ok(size) => size,
        Err(e) => {
            warn!("stdin is not a tty, using default size (err: {:?})", e);
            (consts::DEFAULT_COLS, consts::DEFAULT_ROWS)
        }
    };

    let mut request = Request::new(Command::AttachSession);
    request.session_id = Some(String::from(target));
    request.cols = Some(cols);
    request.rows = Some(rows);

    let conn = client.into_connection();
    conn.send(&WireMessage::Request(request)).context("writing attach request")?;

    let response = match conn.read_message().context("reading attach response")? {
        Some(WireMessage::Response(response)) => response,
        _ => bail!("invalid attach response"),
    };
    if !response.ok {
        bail!("{}", response.message.unwrap_or_else(|| String::from("attach failed")));
    }
    let snapshot = match conn.read_message().context("reading initial snapshot")? {
        Some(WireMessage::Snapshot(snapshot)) => snapshot,
        _ => bail!("missing snapshot"),
    };
    info!("attached, initial screen is {}x{}", snapshot.cols, snapshot.rows);

    let conn = Arc::new(conn);
    *active_conn.lock().unwrap() = Some(Arc::clone(&conn));

    let mut tty_guard = Some(tty::raw_mode()?);

    let mut renderer = Renderer::new();
    {
        let mut stdout = io::stdout().lock();
        renderer.apply_snapshot(&mut stdout, &snapshot).context("painting initial snapshot")?;
    }

    let outcome = thread::scope(|s| -> anyhow::Result<Outcome> {
        // stdin -> sock
        let stdin_conn = Arc::clone(&conn);
        let stdin_to_sock_h = s.spawn(move || stdin_to_sock(stdin_conn));

        // sock -> stdout
        let sock_conn = Arc::clone(&conn);
        let sock_to_stdout_h = s.spawn(move || sock_to_stdout(sock_conn, renderer));

        loop {
            if stdin_to_sock_h.is_finished() {
                // drop the server connection so the render thread
                // unblocks on EOF
                conn.close();
                break;
            }
            if sock_to_stdout_h.is_finished() {
                // The server hung up on us (session ended or was
                // destroyed). The stdin thread sits in a blocking
                // read we cannot cancel, so restore the terminal and
                // hard-exit the process like any pager would.
                thread::sleep(JOIN_HANGUP_DUR);
                if !stdin_to_sock_h.is_finished() {
                    drop(tty_guard.take());
                    println!("\nsession {} ended", target);
                    std::process::exit(0);
                }
                conn.close();
                break;
            }
            thread::sleep(consts::JOIN_POLL_DURATION);
        }

        let outcome = match stdin_to_sock_h.join() {
            Ok(outcome) => outcome?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        };
        match sock_to_stdout_h.join() {
            Ok(result) => result?,
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        }

        drop(tty_guard.take());
        Ok(outcome)
    })?;

    *active_conn.lock().unwrap() = None;
    // leave the prompt on a fresh line after raw mode
    println!();
    Ok(outcome)
}

fn stdin_to_sock(conn: Arc<FramedConnection>) -> anyhow::Result<Outcome> {
    let mut stdin = io::stdin().lock();
    let mut buf = vec![0u8; consts::BUF_SIZE];
    let mut scanner = PrefixScanner::new();
    let mut forward = Vec::with_capacity(consts::BUF_SIZE);

    loop {
        let n = stdin.read(&mut buf).context("reading stdin from user")?;
        if n == 0 {
            return Ok(Outcome::Detach);
        }
        debug!("read {} bytes", n);

        forward.clear();
        let action = scanner.scan(&buf[..n], &mut forward);

        if !forward.is_empty() {
            let msg = WireMessage::Input(Input { data: forward.clone() });
            if conn.send_binary(&msg).is_err() {
                // the connection went away under us; the render
                // thread reports why
                return Ok(Outcome::Detach);
            }
        }

        match action {
            Some(PrefixAction::Detach) => return Ok(Outcome::Detach),
            Some(PrefixAction::Create) => return Ok(Outcome::Create),
            Some(PrefixAction::Next) => return Ok(Outcome::Next),
            Some(PrefixAction::Prev) => return Ok(Outcome::Prev),
            None => {}
        }
    }
}

fn sock_to_stdout(conn: Arc<FramedConnection>, mut renderer: Renderer) -> anyhow::Result<()> {
    loop {
        let msg = match conn.read_message() {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(()),
            Err(e) => {
                if conn.is_closed() {
                    return Ok(());
                }
                error!("reading from server: {:?}", e);
                return Err(e);
            }
        };
        let mut stdout = io::stdout().lock();
        match msg {
            WireMessage::Snapshot(snapshot) => {
                renderer.apply_snapshot(&mut stdout, &snapshot).context("painting snapshot")?
            }
            WireMessage::Delta(delta) => {
                renderer.apply_delta(&mut stdout, &delta).context("painting delta")?
            }
            other => debug!("ignoring {:?} from server", other.message_type()),
        }
    }
}

/// Forward local terminal size changes to the session.
fn spawn_winch_handler(
    active_conn: Arc<Mutex<Option<Arc<FramedConnection>>>>,
) -> anyhow::Result<()> {
    use signal_hook::{consts::SIGWINCH, iterator::Signals};

    let mut signals = Signals::new([SIGWINCH]).context("creating signal iterator")?;
    thread::spawn(move || {
        for _ in &mut signals {
            let conn = match active_conn.lock().unwrap().clone() {
                Some(conn) => conn,
                None => continue,
            };
            let (cols, rows) = match tty::window_size(consts::STDIN_FD) {
                Ok(size) => size,
                Err(e) => {
                    warn!("getting tty size on SIGWINCH: {:?}", e);
                    continue;
                }
            };
            info!("forwarding resize to (cols={}, rows={})", cols, rows);
            let msg = WireMessage::Resize(Resize { cols, rows });
            if let Err(e) = conn.send_binary(&msg) {
                debug!("sending resize: {:?}", e);
            }
        }
    });

    Ok(())
}

//
// target selection
//

fn fetch_sessions(
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<Vec<SessionInfo>> {
    let client = autostart::dial(socket, runtime_dir, auto_start, log_file)?;
    let response = client.request(Request::new(Command::ListSessions))?;
    if !response.ok {
        bail!("{}", response.message.unwrap_or_else(|| String::from("list failed")));
    }
    Ok(response.sessions.unwrap_or_default())
}

fn only_running_session(
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<String> {
    let sessions = fetch_sessions(socket, runtime_dir, auto_start, log_file)?;
    let mut running = sessions.into_iter().filter(|s| s.is_running);
    match (running.next(), running.next()) {
        (Some(only), None) => Ok(only.id),
        (None, _) => Err(anyhow!("no running sessions (specify session id)")),
        (Some(_), Some(_)) => Err(anyhow!("multiple running sessions (specify session id)")),
    }
}

fn create_session(
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<String> {
    let client = autostart::dial(socket, runtime_dir, auto_start, log_file)?;
    let response = client.request(Request::new(Command::CreateSession))?;
    if !response.ok {
        bail!("{}", response.message.unwrap_or_else(|| String::from("create failed")));
    }
    response.session.map(|s| s.id).ok_or(anyhow!("create response carried no session"))
}

/// The running session `step` places away from `current` in the
/// server's list order, wrapping around.
fn neighbor_session(
    current: &str,
    step: i64,
    socket: &Path,
    runtime_dir: &Path,
    auto_start: bool,
    log_file: Option<&str>,
) -> anyhow::Result<String> {
    let sessions = fetch_sessions(socket, runtime_dir, auto_start, log_file)?;
    let running: Vec<&SessionInfo> = sessions.iter().filter(|s| s.is_running).collect();
    if running.is_empty() {
        bail!("no running sessions (specify session id)");
    }
    let position = running.iter().position(|s| s.id == current).unwrap_or(0);
    let next = (position as i64 + step).rem_euclid(running.len() as i64) as usize;
    Ok(running[next].id.clone())
}

//
// prefix key scanning
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefixAction {
    Detach,
    Create,
    Next,
    Prev,
}

/// A byte-at-a-time scanner for the ctrl-b command prefix. Bytes that
/// turn out not to be commands are flushed through to the session;
/// ctrl-b ctrl-b sends a literal ctrl-b.
struct PrefixScanner {
    pending: bool,
}

impl PrefixScanner {
    fn new() -> Self {
        PrefixScanner { pending: false }
    }

    /// Scan one input chunk. Forwardable bytes are appended to
    /// `forward`; the first recognized command stops the scan and any
    /// bytes after it in the chunk are dropped.
    fn scan(&mut self, input: &[u8], forward: &mut Vec<u8>) -> Option<PrefixAction> {
        for &byte in input.iter() {
            if !self.pending {
                if byte == PREFIX_KEY {
                    self.pending = true;
                } else {
                    forward.push(byte);
                }
                continue;
            }

            self.pending = false;
            let action = match byte {
                b'd' => Some(PrefixAction::Detach),
                b'c' => Some(PrefixAction::Create),
                b'n' => Some(PrefixAction::Next),
                b'p' => Some(PrefixAction::Prev),
                PREFIX_KEY => {
                    forward.push(PREFIX_KEY);
                    None
                }
                other => {
                    // not a command after all, let both bytes through
                    forward.push(PREFIX_KEY);
                    forward.push(other);
                    None
                }
            };
            if action.is_some() {
                return action;
            }
        }
        None
    }
}
