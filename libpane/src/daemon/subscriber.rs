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

//! The server side adapter for one attached client.
//!
//! A subscriber has two lanes: a serialized sender (an unbounded
//! queue drained by a dedicated thread, so enqueueing never blocks
//! the session) and a receive loop that turns incoming input and
//! resize messages into session calls. The subscriber never holds a
//! strong reference back to its session; teardown runs through a
//! close callback that the server installs at attach time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread;

use anyhow::{anyhow, bail, Context};
use pane_protocol::WireMessage;
use tracing::{debug, info, span, warn, Level};

use crate::{daemon::session::Session, protocol, protocol::FramedConnection};

enum Outbound {
    Frame(u8, Vec<u8>),
    Shutdown,
}

pub struct Subscriber {
    id: u64,
    conn: Arc<FramedConnection>,
    outgoing: crossbeam_channel::Sender<Outbound>,
    closed: AtomicBool,
    on_close: Mutex<Option<Box<dyn FnOnce(u64) + Send>>>,
}

impl Subscriber {
    /// Wrap a connection and start the sender thread.
    pub fn spawn(id: u64, conn: Arc<FramedConnection>) -> anyhow::Result<Arc<Self>> {
        let (outgoing_tx, outgoing_rx) = crossbeam_channel::unbounded();
        let subscriber = Arc::new(Subscriber {
            id,
            conn,
            outgoing: outgoing_tx,
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        });

        let sender = Arc::clone(&subscriber);
        thread::Builder::new()
            .name(format!("sub-send({})", id))
            .spawn(move || sender.drain_outgoing(outgoing_rx))
            .map_err(|e| anyhow!("{:?}", e))?;

        Ok(subscriber)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Install the callback the session uses to unlink this
    /// subscriber. Fired exactly once, on close.
    pub fn set_on_close(&self, callback: Box<dyn FnOnce(u64) + Send>) {
        let mut slot = self.on_close.lock().unwrap();
        *slot = Some(callback);
    }

    /// Queue a message in JSON form.
    pub fn send(&self, msg: &WireMessage) -> anyhow::Result<()> {
        let payload = protocol::encode_json(msg)?;
        self.send_frame(protocol::FORMAT_JSON, payload)
    }

    /// Queue a screen-plane message in binary form.
    pub fn send_binary(&self, msg: &WireMessage) -> anyhow::Result<()> {
        let payload = protocol::encode_binary(msg)?;
        self.send_frame(protocol::FORMAT_BINARY, payload)
    }

    /// Queue a pre-encoded payload. Never blocks; fails once the
    /// subscriber has closed.
    pub fn send_frame(&self, format: u8, payload: Vec<u8>) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("subscriber {} is closed", self.id);
        }
        self.outgoing
            .send(Outbound::Frame(format, payload))
            .map_err(|_| anyhow!("subscriber {} send queue is gone", self.id))
    }

    fn drain_outgoing(self: Arc<Self>, outgoing: crossbeam_channel::Receiver<Outbound>) {
        let _s = span!(Level::INFO, "sub_send", sub = self.id).entered();
        for item in outgoing.iter() {
            match item {
                Outbound::Frame(format, payload) => {
                    if let Err(e) = self.conn.send_frame(format, &payload) {
                        info!("write failed, hanging up: {:?}", e);
                        break;
                    }
                }
                Outbound::Shutdown => break,
            }
        }
        self.close();
    }

    /// Read messages off the connection until EOF or error,
    /// dispatching each to the session.
    pub fn start_recv_loop(self: &Arc<Self>, session: Arc<Session>) -> anyhow::Result<()> {
        let subscriber = Arc::clone(self);
        thread::Builder::new()
            .name(format!("sub-recv({})", self.id))
            .spawn(move || {
                let _s = span!(Level::INFO, "sub_recv", sub = subscriber.id).entered();
                subscriber.recv_loop(session);
                subscriber.close();
            })
            .map_err(|e| anyhow!("{:?}", e))?;
        Ok(())
    }

    fn recv_loop(&self, session: Arc<Session>) {
        loop {
            let msg = match self.conn.read_message() {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("client hung up");
                    return;
                }
                Err(e) => {
                    warn!("read failed, hanging up: {:?}", e);
                    return;
                }
            };
            match msg {
                WireMessage::Input(input) => {
                    if let Err(e) = session.send_input(&input.data).context("forwarding input") {
                        debug!("{:?}", e);
                    }
                }
                WireMessage::Resize(resize) => {
                    session.resize(resize.cols, resize.rows);
                }
                // tolerated for forward compatibility
                other => debug!("ignoring {:?} from client", other.message_type()),
            }
        }
    }

    /// Tear the subscriber down. Idempotent. Shuts the connection so
    /// both pump threads unwind, then fires the unlink callback.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.close();
        let _ = self.outgoing.send(Outbound::Shutdown);

        let callback = self.on_close.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(self.id);
        }
        info!("subscriber {} closed", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use std::{os::unix::net::UnixStream, sync::atomic::AtomicUsize, time};

    use super::*;

    #[test]
    fn close_fires_callback_exactly_once() {
        let (tx, _rx) = UnixStream::pair().expect("socketpair");
        let conn = Arc::new(FramedConnection::new(tx).expect("conn"));
        let subscriber = Subscriber::spawn(7, conn).expect("subscriber");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        subscriber.set_on_close(Box::new(move |id| {
            assert_eq!(id, 7);
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        }));

        subscriber.close();
        subscriber.close();
        assert!(subscriber.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // sends fail after close
        assert!(subscriber.send_frame(protocol::FORMAT_JSON, vec![]).is_err());
    }

    #[test]
    fn queued_frames_reach_the_wire_in_order() {
        let (tx, rx) = UnixStream::pair().expect("socketpair");
        let conn = Arc::new(FramedConnection::new(tx).expect("conn"));
        let peer = FramedConnection::new(rx).expect("conn");
        let subscriber = Subscriber::spawn(1, conn).expect("subscriber");

        for i in 0..5u8 {
            let msg = WireMessage::Input(pane_protocol::Input { data: vec![i] });
            subscriber.send_binary(&msg).expect("send");
        }

        for i in 0..5u8 {
            let msg = peer.read_message().expect("read").expect("message");
            match msg {
                WireMessage::Input(input) => assert_eq!(input.data, vec![i]),
                other => panic!("unexpected {:?}", other.message_type()),
            }
        }

        subscriber.close();
        // peer sees EOF once the subscriber hangs up
        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        loop {
            match peer.read_message() {
                Ok(None) | Err(_) => break,
                Ok(Some(_)) => {
                    assert!(time::Instant::now() < deadline, "no EOF after close");
                }
            }
        }
    }
}
