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

use std::{thread, time};

use ntest::timeout;
use pane_protocol::{Command, Input, Request, Resize, WireMessage};

mod support;

use support::ScreenEvent;

#[test]
#[timeout(30000)]
fn attach_handshake_and_snapshot_shape() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;
    let id = server.create_session("shape", &["/bin/cat"])?;

    let (_conn, response, snapshot) = server.attach(&id, 80, 24)?;
    assert!(response.ok);
    assert_eq!(response.session.expect("session info").id, id);
    assert!(response.server.is_some());

    let snapshot = snapshot.expect("initial snapshot follows the response");
    assert_eq!(snapshot.cols, 80);
    assert_eq!(snapshot.rows, 24);
    assert!(!snapshot.is_alternate);
    assert_eq!((snapshot.cursor_x, snapshot.cursor_y), (0, 0));

    assert_eq!(snapshot.lines.len(), 24);
    for line in &snapshot.lines {
        assert_eq!(line.len(), 80);
        let width_sum: i32 = line.iter().map(|c| c.width as i32).sum();
        assert_eq!(width_sum, 80);
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn input_echoes_back_as_deltas() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;
    let id = server.create_session("echo", &["/bin/cat"])?;

    let (conn, response, snapshot) = server.attach(&id, 80, 24)?;
    assert!(response.ok);
    assert!(snapshot.is_some());

    // input in its JSON form; the server takes either encoding
    conn.send(&WireMessage::Input(Input { data: b"hello".to_vec() }))?;

    // the pty echoes the input; watch the delta stream for it
    let event = support::read_screen_until(&conn, |event| match event {
        ScreenEvent::Delta(delta) => support::screen_text(&delta.lines).contains("hello"),
        ScreenEvent::Snapshot(snapshot) => {
            support::screen_text(&snapshot.lines).contains("hello")
        }
    })?;

    if let ScreenEvent::Delta(delta) = event {
        assert!(delta.end_y >= delta.start_y);
        assert_eq!(delta.lines.len(), (delta.end_y - delta.start_y + 1) as usize);
        assert!(delta.cursor_x > 0, "cursor should have advanced past the echo");
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn resize_reaches_every_subscriber() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;
    let id = server.create_session("resize", &["/bin/cat"])?;

    let (first, response, _) = server.attach(&id, 80, 24)?;
    assert!(response.ok);
    let (second, response, _) = server.attach(&id, 80, 24)?;
    assert!(response.ok);

    first.send_binary(&WireMessage::Resize(Resize { cols: 100, rows: 30 }))?;

    // both ends converge on the new geometry
    for conn in [&first, &second] {
        let event = support::read_screen_until(conn, |event| match event {
            ScreenEvent::Snapshot(snapshot) => snapshot.cols == 100 && snapshot.rows == 30,
            ScreenEvent::Delta(_) => false,
        })?;
        if let ScreenEvent::Snapshot(snapshot) = event {
            assert_eq!(snapshot.lines.len(), 30);
            for line in &snapshot.lines {
                assert_eq!(line.len(), 100);
            }
        }
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn zero_size_resize_is_ignored() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;
    let id = server.create_session("stubborn", &["/bin/cat"])?;

    let (conn, _, _) = server.attach(&id, 80, 24)?;
    conn.send_binary(&WireMessage::Resize(Resize { cols: 0, rows: 30 }))?;
    conn.send_binary(&WireMessage::Input(Input { data: b"x".to_vec() }))?;

    // the echo still arrives at the old geometry
    let event = support::read_screen_until(&conn, |event| match event {
        ScreenEvent::Delta(delta) => support::screen_text(&delta.lines).contains('x'),
        ScreenEvent::Snapshot(_) => false,
    })?;
    if let ScreenEvent::Delta(delta) = event {
        assert_eq!(delta.lines[0].len(), 80);
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn one_subscriber_hanging_up_leaves_the_rest_streaming() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;
    let id = server.create_session("isolation", &["/bin/cat"])?;

    let (doomed, response, _) = server.attach(&id, 80, 24)?;
    assert!(response.ok);
    let (survivor, response, _) = server.attach(&id, 80, 24)?;
    assert!(response.ok);

    doomed.close();
    // give the server a beat to notice the hangup
    thread::sleep(time::Duration::from_millis(200));

    survivor.send_binary(&WireMessage::Input(Input { data: b"still-here".to_vec() }))?;
    support::read_screen_until(&survivor, |event| match event {
        ScreenEvent::Delta(delta) => support::screen_text(&delta.lines).contains("still-here"),
        ScreenEvent::Snapshot(snapshot) => {
            support::screen_text(&snapshot.lines).contains("still-here")
        }
    })?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn attach_requires_an_id() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;

    let conn = server.client()?.into_connection();
    conn.send(&WireMessage::Request(Request::new(Command::AttachSession)))?;
    let response = match conn.read_message()? {
        Some(WireMessage::Response(response)) => response,
        other => panic!("expected a response, got {:?}", other),
    };
    assert!(!response.ok);
    assert_eq!(response.message.as_deref(), Some("session id required"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn dead_session_still_serves_its_final_screen() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;
    let id = server.create_session("ghost", &["/bin/sh", "-c", "echo leftover; exit 0"])?;

    // wait for the child to be reaped
    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    loop {
        let response = server.request(Request::new(Command::ListSessions))?;
        let sessions = response.sessions.expect("sessions");
        let session = sessions.iter().find(|s| s.id == id).expect("session stays listed");
        if !session.is_running {
            break;
        }
        assert!(time::Instant::now() < deadline, "session never exited");
        thread::sleep(time::Duration::from_millis(50));
    }

    let (_conn, response, snapshot) = server.attach(&id, 80, 24)?;
    assert!(response.ok, "attaching to an exited session still succeeds");
    let snapshot = snapshot.expect("final screen snapshot");
    assert!(support::screen_text(&snapshot.lines).contains("leftover"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn destroying_an_attached_session_hangs_up() -> anyhow::Result<()> {
    let server = support::TestServer::spawn()?;
    let id = server.create_session("vanishing", &["/bin/cat"])?;

    let (conn, response, _) = server.attach(&id, 80, 24)?;
    assert!(response.ok);

    let mut request = Request::new(Command::DestroySession);
    request.session_id = Some(id);
    let response = server.request(request)?;
    assert!(response.ok, "destroy failed: {:?}", response.message);

    // the subscriber observes EOF once the session tears down
    loop {
        match conn.read_message() {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => break,
        }
    }

    Ok(())
}
