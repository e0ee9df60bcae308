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

//! A session: one child process on a pty, the screen model fed from
//! it, and the set of subscribers watching it.

use std::{
    collections::HashMap,
    env,
    io::{Read, Write},
    os::unix::process::CommandExt as _,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread, time,
};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use nix::{poll, sys::signal, unistd::Pid};
use pane_protocol::{Cell, Delta, SessionInfo, Snapshot, WireMessage};
use tracing::{debug, error, info, instrument, span, trace, warn, Level};

use crate::{
    consts,
    daemon::{
        emulator::{Emulator, Vt100Emulator},
        subscriber::Subscriber,
    },
    protocol, tty,
};

/// One live (or recently exited) pty session.
///
/// All mutable per-session state sits behind the single `inner`
/// mutex: the screen model, the subscriber set, and the pty handles.
/// The pty read pump and `send_input` both enter that critical
/// section; reads of the pty fd itself happen outside it.
pub struct Session {
    pub id: u64,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub child_pid: libc::pid_t,
    child_exit: Arc<ChildExit>,
    running: AtomicBool,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    emulator: Box<dyn Emulator>,
    subscribers: HashMap<u64, Arc<Subscriber>>,
    /// Owns the pty fds. Dropped when the child is reaped.
    pty: Option<shpool_pty::fork::Fork>,
    /// Copyable write handle onto the pty master.
    master: Option<shpool_pty::fork::Master>,
    exit_code: Option<i32>,
}

impl Session {
    /// Fork a child on a fresh pty and spin up the watcher and pump
    /// threads. The child runs `command_line` if given, otherwise
    /// `$SHELL`, otherwise /bin/sh.
    #[instrument(skip_all, fields(s = id))]
    pub fn spawn(
        id: u64,
        name: Option<String>,
        command_line: Option<Vec<String>>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut cmd = match &command_line {
            Some(parts) if !parts.is_empty() => {
                info!("running cmd: {:?}", parts);
                let mut cmd = process::Command::new(&parts[0]);
                cmd.args(&parts[1..]);
                cmd
            }
            Some(_) => return Err(anyhow!("no command to run")),
            None => {
                let shell = env::var("SHELL").unwrap_or_else(|_| String::from("/bin/sh"));
                info!("running default shell: {}", shell);
                process::Command::new(shell)
            }
        };
        cmd.stdin(process::Stdio::inherit())
            .stdout(process::Stdio::inherit())
            .stderr(process::Stdio::inherit())
            .env("TERM", "xterm-256color");

        let fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
        if fork.is_child().is_ok() {
            let open_max = match nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX) {
                Ok(Some(v)) => v as i32,
                _ => 1024,
            };
            for fd in consts::STDERR_FD + 1..open_max {
                let _ = nix::unistd::close(fd);
            }
            let err = cmd.exec();
            eprintln!("child exec err: {err:?}");
            std::process::exit(1);
        }

        let master = fork.is_parent().context("getting master side of pty fork")?;
        let child_pid = fork.child_pid().ok_or(anyhow!("missing child pid"))?;

        // until the first attach declares a real size, the shell runs
        // at the default geometry rather than the kernel's 0x0
        match master.raw_fd() {
            Some(fd) => {
                if let Err(e) =
                    tty::set_window_size(*fd, consts::DEFAULT_COLS, consts::DEFAULT_ROWS)
                {
                    warn!("presizing pty: {:?}", e);
                }
            }
            None => warn!("no master fd to presize"),
        }

        let session = Arc::new(Session {
            id,
            name,
            created_at: Utc::now(),
            child_pid,
            child_exit: Arc::new(ChildExit::new()),
            running: AtomicBool::new(true),
            inner: Mutex::new(SessionInner {
                emulator: Box::new(Vt100Emulator::new(consts::DEFAULT_COLS, consts::DEFAULT_ROWS)),
                subscribers: HashMap::new(),
                pty: Some(fork),
                master: Some(master),
                exit_code: None,
            }),
        });

        session.spawn_child_watcher()?;
        session.spawn_pump(master)?;

        Ok(session)
    }

    /// Reap the child when it exits and wake anyone waiting on the
    /// exit status. The watcher only needs the pid, never the pty fd.
    fn spawn_child_watcher(self: &Arc<Self>) -> anyhow::Result<()> {
        let waitable_child_pid = self.child_pid;
        let session_id = self.id;
        let child_exit = Arc::clone(&self.child_exit);
        thread::Builder::new()
            .name(format!("child-watch({})", session_id))
            .spawn(move || {
                let _s = span!(Level::INFO, "child_watcher", s = session_id).entered();

                let mut status = 0;
                let mut unpacked_status = None;
                loop {
                    // Safety: all basic ffi, the pid stays valid until waitpid
                    // returns.
                    unsafe {
                        match libc::waitpid(waitable_child_pid, &mut status, 0) {
                            0 => continue,
                            -1 => break,
                            _ => {
                                if libc::WIFEXITED(status) {
                                    unpacked_status = Some(libc::WEXITSTATUS(status));
                                }
                                break;
                            }
                        }
                    }
                }
                match unpacked_status {
                    Some(status) => {
                        info!("child exited with status {}", status);
                        child_exit.record(status);
                    }
                    None => {
                        info!("child exited without status, using 1");
                        child_exit.record(1);
                    }
                }
            })
            .map_err(|e| anyhow!("{:?}", e))?;
        Ok(())
    }

    /// The pty read pump: shuffle output bytes from the pty into the
    /// screen model and fan resulting deltas out to subscribers.
    fn spawn_pump(self: &Arc<Self>, master: shpool_pty::fork::Master) -> anyhow::Result<()> {
        let session = Arc::clone(self);
        thread::Builder::new()
            .name(format!("pty-pump({})", self.id))
            .spawn(move || {
                let _s = span!(Level::INFO, "pty_pump", s = session.id).entered();
                if let Err(e) = session.pump(master) {
                    warn!("pty pump exited with error: {:?}", e);
                }
                session.finalize();
            })
            .map_err(|e| anyhow!("{:?}", e))?;
        Ok(())
    }

    fn pump(&self, master: shpool_pty::fork::Master) -> anyhow::Result<()> {
        let mut reader = master;
        let watchable_master = master;
        let mut buf: Vec<u8> = vec![0; consts::BUF_SIZE];
        let mut poll_fds = [poll::PollFd::new(
            watchable_master.borrow_fd().ok_or(anyhow!("no master fd"))?,
            poll::PollFlags::POLLIN,
        )];

        loop {
            let child_exited = self.child_exit.poll().is_some();

            let nready = match poll::poll(&mut poll_fds, consts::PUMP_POLL_MS) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("polling pty master"),
            };
            if nready == 0 {
                if child_exited {
                    // the shell is gone and the pty has drained
                    return Ok(());
                }
                continue;
            }

            let len = match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(len) => len,
                // EIO is how the pty tells us the child side hung up
                Err(e) => {
                    debug!("pty master read ended: {:?}", e);
                    return Ok(());
                }
            };
            trace!("read pty master len={}", len);
            self.feed_and_publish(&buf[..len]);
        }
    }

    /// Push one batch of output through the screen model and publish
    /// the resulting delta, if any. The dirty range is cleared even
    /// with no subscribers so it cannot grow without bound.
    fn feed_and_publish(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.emulator.feed(bytes);

        if let Some((start, end)) = inner.emulator.dirty_range() {
            if !inner.subscribers.is_empty() {
                let rows = inner.emulator.rows();
                let clipped_end = if rows == 0 { 0 } else { end.min(rows - 1) };
                if rows > 0 && start < rows && start <= clipped_end {
                    let delta = inner.build_delta(start, clipped_end);
                    inner.fan_out(&WireMessage::Delta(delta));
                }
            }
            inner.emulator.clear_update_range();
        }
    }

    /// Wire a new subscriber in. The handshake response and the
    /// initial snapshot are enqueued and the subscriber registered
    /// inside one critical section, so no delta can slip in between
    /// the snapshot and the subscriber seeing live updates.
    pub fn attach(
        &self,
        subscriber: Arc<Subscriber>,
        size: Option<(u16, u16)>,
        response: &WireMessage,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((cols, rows)) = size {
            if cols > 0 && rows > 0 {
                inner.apply_resize(cols, rows);
            }
        }
        subscriber.send(response).context("queueing attach response")?;
        let snapshot = WireMessage::Snapshot(inner.snapshot());
        subscriber.send_binary(&snapshot).context("queueing initial snapshot")?;
        inner.subscribers.insert(subscriber.id(), subscriber);
        Ok(())
    }

    pub fn remove_subscriber(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.subscribers.remove(&id).is_some() {
            debug!("unlinked subscriber {}", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Write input bytes to the child's stdin via the pty master.
    pub fn send_input(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut master = match inner.master.as_mut() {
            Some(m) => *m,
            None => bail!("session {} is not running", self.id),
        };
        master.write_all(data).context("writing input to pty master")?;
        master.flush().context("flushing pty master")?;
        Ok(())
    }

    /// Resize the screen model and the pty. A zero dimension is a
    /// no-op. All current subscribers get a fresh snapshot at the new
    /// size, so every attached client converges on the same geometry.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.apply_resize(cols, rows);
    }

    /// Ask the child to go away: SIGHUP first (shells treat SIGTERM
    /// as something to forward rather than act on), SIGKILL if it is
    /// still around after the grace period.
    #[instrument(skip_all, fields(s = self.id))]
    pub fn terminate(&self) {
        if let Err(e) =
            signal::kill(Pid::from_raw(self.child_pid), Some(signal::Signal::SIGHUP))
        {
            debug!("SIGHUP: {:?}", e);
        }
        if self.child_exit.wait_for(consts::CHILD_KILL_TIMEOUT).is_none() {
            info!("child failed to exit within kill timeout, no longer being polite");
            if let Err(e) =
                signal::kill(Pid::from_raw(self.child_pid), Some(signal::Signal::SIGKILL))
            {
                debug!("SIGKILL: {:?}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().unwrap();
        SessionInfo {
            id: self.id.to_string(),
            name: self.name.clone(),
            created_at: self.created_at,
            is_running: self.is_running(),
            process_id: Some(self.child_pid),
            exit_code: inner.exit_code,
        }
    }

    /// Runs once, after the pump has drained the pty: record the exit
    /// status, release the pty, and hang up on every subscriber.
    fn finalize(&self) {
        let exit_code = self.child_exit.poll();
        self.running.store(false, Ordering::Release);

        let orphans = {
            let mut inner = self.inner.lock().unwrap();
            inner.exit_code = exit_code;
            inner.master = None;
            inner.pty = None;
            inner.subscribers.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };
        // closed outside the lock: close runs the unlink callback,
        // which takes the lock again
        for subscriber in orphans {
            subscriber.close();
        }
        info!("session {} finished with exit code {:?}", self.id, exit_code);
    }
}

impl SessionInner {
    fn apply_resize(&mut self, cols: u16, rows: u16) {
        self.emulator.resize(cols, rows);
        if let Some(master) = &self.master {
            match master.raw_fd() {
                Some(fd) => {
                    if let Err(e) = tty::set_window_size(*fd, cols, rows) {
                        warn!("error resizing pty: {:?}", e);
                    }
                }
                None => warn!("no master fd to resize"),
            }
        }
        info!("resized to (cols={}, rows={})", cols, rows);

        let snapshot = WireMessage::Snapshot(self.snapshot());
        self.fan_out(&snapshot);
        self.emulator.clear_update_range();
    }

    fn snapshot(&self) -> Snapshot {
        let emulator = self.emulator.as_ref();
        let (cursor_x, cursor_y) = emulator.cursor();
        let rows = emulator.rows();
        let lines = (0..rows).map(|y| build_line(emulator, y)).collect();
        Snapshot {
            cols: emulator.cols(),
            rows,
            cursor_x,
            cursor_y,
            is_alternate: emulator.alternate_screen(),
            lines,
        }
    }

    fn build_delta(&self, start_y: u16, end_y: u16) -> Delta {
        let emulator = self.emulator.as_ref();
        let (cursor_x, cursor_y) = emulator.cursor();
        let lines = (start_y..=end_y).map(|y| build_line(emulator, y)).collect();
        Delta { start_y, end_y, cursor_x, cursor_y, lines }
    }

    /// Send a screen-plane message to every subscriber. Encoded once;
    /// enqueueing never blocks. A subscriber that has already closed
    /// just misses the frame, its unlink callback does the cleanup.
    fn fan_out(&self, msg: &WireMessage) {
        let payload = match protocol::encode_binary(msg) {
            Ok(p) => p,
            Err(e) => {
                error!("encoding fan-out message: {:?}", e);
                return;
            }
        };
        for subscriber in self.subscribers.values() {
            if let Err(e) = subscriber.send_frame(protocol::FORMAT_BINARY, payload.clone()) {
                debug!("fan-out to closed subscriber {}: {:?}", subscriber.id(), e);
            }
        }
    }
}

/// Build the wire form of one emulator row: exactly `cols` cells,
/// empty and NUL characters normalized to a space (except the width 0
/// companions of wide cells, which stay empty).
fn build_line(emulator: &dyn Emulator, y: u16) -> Vec<Cell> {
    let cols = emulator.cols() as usize;
    let mut cells = emulator.row_cells(y);
    cells.truncate(cols);
    for cell in cells.iter_mut() {
        if cell.width != 0 && (cell.ch.is_empty() || cell.ch == "\0") {
            cell.ch = String::from(" ");
        }
    }
    while cells.len() < cols {
        cells.push(Cell::blank());
    }
    cells
}

/// Where the child watcher parks the exit code once the shell has
/// been reaped. The pump checks it once per tick; `terminate` blocks
/// on it for the kill grace period.
#[derive(Debug)]
struct ChildExit {
    state: Mutex<ChildState>,
    reaped: Condvar,
}

#[derive(Debug, Clone, Copy)]
enum ChildState {
    Running,
    Exited(i32),
}

impl ChildExit {
    fn new() -> Self {
        ChildExit { state: Mutex::new(ChildState::Running), reaped: Condvar::new() }
    }

    /// Record the exit code. Called once, by the watcher thread.
    fn record(&self, code: i32) {
        let mut state = self.state.lock().unwrap();
        *state = ChildState::Exited(code);
        self.reaped.notify_all();
    }

    /// Non-blocking: the exit code, if the child has been reaped yet.
    fn poll(&self) -> Option<i32> {
        match *self.state.lock().unwrap() {
            ChildState::Running => None,
            ChildState::Exited(code) => Some(code),
        }
    }

    /// Park until the child is reaped, giving up after `grace`.
    fn wait_for(&self, grace: time::Duration) -> Option<i32> {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .reaped
            .wait_timeout_while(state, grace, |s| matches!(s, ChildState::Running))
            .unwrap();
        match *state {
            ChildState::Running => None,
            ChildState::Exited(code) => Some(code),
        }
    }
}
