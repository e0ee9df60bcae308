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

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every message that crosses a pane socket is one of these.
///
/// On the wire a message travels inside a frame (4 byte big endian
/// length, then a 1 byte format tag, then the payload). The JSON
/// payload form is an envelope object with a `type` discriminator and
/// the matching body field populated, which is what the serde
/// attributes below produce. The binary payload form is defined by
/// the codec in libpane.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub enum WireMessage {
    Request(Request),
    Response(Response),
    Snapshot(Snapshot),
    Delta(Delta),
    Input(Input),
    Resize(Resize),
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Request(_) => MessageType::Request,
            WireMessage::Response(_) => MessageType::Response,
            WireMessage::Snapshot(_) => MessageType::Snapshot,
            WireMessage::Delta(_) => MessageType::Delta,
            WireMessage::Input(_) => MessageType::Input,
            WireMessage::Resize(_) => MessageType::Resize,
        }
    }
}

/// The message type discriminator. The numeric values double as the
/// leading tag byte of the binary payload encoding and must not be
/// renumbered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Snapshot = 2,
    Delta = 3,
    Input = 4,
    Resize = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Response),
            2 => Ok(MessageType::Snapshot),
            3 => Ok(MessageType::Delta),
            4 => Ok(MessageType::Input),
            5 => Ok(MessageType::Resize),
            _ => Err(anyhow!("unknown MessageType {}", v)),
        }
    }
}

/// The JSON object form of a WireMessage: a `type` field plus the
/// matching body field. Kept private so the rest of the code works
/// with the plain enum.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<Request>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    snapshot: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<Delta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<Input>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resize: Option<Resize>,
}

impl From<WireMessage> for WireEnvelope {
    fn from(msg: WireMessage) -> Self {
        let mut envelope = WireEnvelope {
            kind: msg.message_type(),
            request: None,
            response: None,
            snapshot: None,
            delta: None,
            input: None,
            resize: None,
        };
        match msg {
            WireMessage::Request(b) => envelope.request = Some(b),
            WireMessage::Response(b) => envelope.response = Some(b),
            WireMessage::Snapshot(b) => envelope.snapshot = Some(b),
            WireMessage::Delta(b) => envelope.delta = Some(b),
            WireMessage::Input(b) => envelope.input = Some(b),
            WireMessage::Resize(b) => envelope.resize = Some(b),
        }
        envelope
    }
}

impl TryFrom<WireEnvelope> for WireMessage {
    type Error = anyhow::Error;

    fn try_from(envelope: WireEnvelope) -> anyhow::Result<Self> {
        let missing = |field: &str| anyhow!("wire message missing {} body", field);
        match envelope.kind {
            MessageType::Request => {
                Ok(WireMessage::Request(envelope.request.ok_or_else(|| missing("request"))?))
            }
            MessageType::Response => {
                Ok(WireMessage::Response(envelope.response.ok_or_else(|| missing("response"))?))
            }
            MessageType::Snapshot => {
                Ok(WireMessage::Snapshot(envelope.snapshot.ok_or_else(|| missing("snapshot"))?))
            }
            MessageType::Delta => {
                Ok(WireMessage::Delta(envelope.delta.ok_or_else(|| missing("delta"))?))
            }
            MessageType::Input => {
                Ok(WireMessage::Input(envelope.input.ok_or_else(|| missing("input"))?))
            }
            MessageType::Resize => {
                Ok(WireMessage::Resize(envelope.resize.ok_or_else(|| missing("resize"))?))
            }
        }
    }
}

/// The commands a client can ask the server to run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    Ping,
    CreateSession,
    ListSessions,
    AttachSession,
    DestroySession,
}

/// A request from a client. Exactly one of these is read per control
/// connection; for attach the same connection is then repurposed for
/// the streaming protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub command: Command,
    /// Human name for createSession. Names are not unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Command to run instead of the default shell, argv style.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<Vec<String>>,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The attaching client's terminal size, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Request {
            command,
            name: None,
            command_line: None,
            session_id: None,
            cols: None,
            rows: None,
        }
    }
}

/// The single reply the server sends for every request. `server` is
/// populated on every response so clients can tell which server
/// instance answered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
}

impl Response {
    pub fn ok() -> Self {
        Response { ok: true, message: None, session: None, sessions: None, server: None }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Response {
            ok: false,
            message: Some(message.into()),
            session: None,
            sessions: None,
            server: None,
        }
    }
}

/// Metadata describing one session, as reported by the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_running: bool,
    #[serde(rename = "processID", default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Identifies the server process that produced a response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub socket_path: String,
}

/// A full screen capture. Sent exactly once per attach, before any
/// deltas. `lines` always has `rows` entries and every row carries
/// `cols` cells whose widths sum to `cols`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub cols: u16,
    pub rows: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub is_alternate: bool,
    pub lines: Vec<Vec<Cell>>,
}

/// A contiguous range of changed rows. The range is inclusive on both
/// ends and `lines.len() == end_y - start_y + 1`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub start_y: u16,
    pub end_y: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub lines: Vec<Vec<Cell>>,
}

/// Keyboard (or pasted) bytes bound for the session's pty. The JSON
/// form carries the bytes as a string; the binary form is a u32
/// length followed by the raw bytes, so arbitrary byte sequences
/// survive only the binary path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Input {
    #[serde(with = "input_data")]
    pub data: Vec<u8>,
}

/// A terminal size announcement from a client.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

mod input_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.into_bytes())
    }
}

/// One screen position: a grapheme, its east asian width in cells
/// (0, 1, or 2), and the attribute it is drawn with. A width 2 cell
/// is always followed by a width 0 companion cell.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cell {
    #[serde(rename = "char")]
    pub ch: String,
    pub width: i8,
    pub attribute: Attribute,
}

impl Cell {
    /// A plain space with default attributes, used to pad short rows.
    pub fn blank() -> Self {
        Cell { ch: String::from(" "), width: 1, attribute: Attribute::default() }
    }
}

/// How a cell is drawn.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub fg: Color,
    pub bg: Color,
    /// Style bitmask, see the `style` module. Unknown bits are
    /// carried opaquely.
    pub style: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underline_color: Option<Color>,
}

impl Default for Attribute {
    fn default() -> Self {
        Attribute {
            fg: Color::DefaultColor,
            bg: Color::DefaultColor,
            style: 0,
            underline_color: None,
        }
    }
}

/// Style bits for `Attribute::style`. The values for bold, underline,
/// blink, invert, and dim are fixed by the wire contract; the rest
/// may grow, and decoders must pass through bits they do not know.
pub mod style {
    pub const BOLD: u8 = 1;
    pub const UNDERLINE: u8 = 2;
    pub const BLINK: u8 = 4;
    pub const INVERT: u8 = 8;
    pub const INVISIBLE: u8 = 16;
    pub const DIM: u8 = 32;
    pub const ITALIC: u8 = 64;
    pub const CROSSED_OUT: u8 = 128;
}

/// A terminal color. The numeric codes are the binary wire variant
/// tags and must not be renumbered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Color {
    DefaultColor,
    DefaultInvertedColor,
    Ansi { index: u8 },
    TrueColor { r: u8, g: u8, b: u8 },
}

impl Color {
    pub fn code(&self) -> u8 {
        match self {
            Color::DefaultColor => 0,
            Color::DefaultInvertedColor => 1,
            Color::Ansi { .. } => 2,
            Color::TrueColor { .. } => 3,
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::DefaultColor
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_envelope_shape() {
        let msg = WireMessage::Request(Request::new(Command::Ping));
        let json = serde_json::to_string(&msg).expect("serialize to succeed");
        assert_eq!(json, r#"{"type":"request","request":{"command":"ping"}}"#);
    }

    #[test]
    fn request_json_identity() {
        let mut request = Request::new(Command::AttachSession);
        request.session_id = Some(String::from("7"));
        request.cols = Some(80);
        request.rows = Some(24);
        let msg = WireMessage::Request(request);

        let json = serde_json::to_string(&msg).expect("serialize to succeed");
        assert!(json.contains(r#""sessionID":"7""#));
        let round_tripped: WireMessage =
            serde_json::from_str(&json).expect("deserialize to succeed");
        assert_eq!(msg, round_tripped);
    }

    #[test]
    fn response_json_identity() {
        let mut response = Response::ok();
        response.message = Some(String::from("pong"));
        response.server = Some(ServerInfo {
            pid: 42,
            started_at: chrono::Utc::now(),
            socket_path: String::from("/tmp/pane-0/default"),
        });
        let msg = WireMessage::Response(response);

        let json = serde_json::to_string(&msg).expect("serialize to succeed");
        let round_tripped: WireMessage =
            serde_json::from_str(&json).expect("deserialize to succeed");
        assert_eq!(msg, round_tripped);
    }

    #[test]
    fn envelope_body_mismatch_rejected() {
        let json = r#"{"type":"request","response":{"ok":true}}"#;
        assert!(serde_json::from_str::<WireMessage>(json).is_err());
    }

    #[test]
    fn color_json_forms() {
        let cases = vec![
            (Color::DefaultColor, r#"{"type":"defaultColor"}"#),
            (Color::DefaultInvertedColor, r#"{"type":"defaultInvertedColor"}"#),
            (Color::Ansi { index: 3 }, r#"{"type":"ansi","index":3}"#),
            (Color::TrueColor { r: 1, g: 2, b: 3 }, r#"{"type":"trueColor","r":1,"g":2,"b":3}"#),
        ];

        for (color, want) in cases {
            let json = serde_json::to_string(&color).expect("serialize to succeed");
            assert_eq!(json, want);
            let round_tripped: Color =
                serde_json::from_str(&json).expect("deserialize to succeed");
            assert_eq!(color, round_tripped);
        }
    }

    #[test]
    fn session_info_field_names() {
        let info = SessionInfo {
            id: String::from("1"),
            name: Some(String::from("build")),
            created_at: chrono::Utc::now(),
            is_running: true,
            process_id: Some(1234),
            exit_code: None,
        };
        let json = serde_json::to_string(&info).expect("serialize to succeed");
        assert!(json.contains(r#""processID":1234"#));
        assert!(json.contains(r#""isRunning":true"#));
        assert!(json.contains(r#""createdAt":"#));
    }

    #[test]
    fn style_bits_are_stable() {
        // these five are fixed by the wire contract
        assert_eq!(style::BOLD, 1);
        assert_eq!(style::UNDERLINE, 2);
        assert_eq!(style::BLINK, 4);
        assert_eq!(style::INVERT, 8);
        assert_eq!(style::DIM, 32);
    }

    #[test]
    fn message_type_tag_round_trip() {
        for tag in 0u8..=5 {
            let kind = MessageType::try_from(tag).expect("tag to parse");
            assert_eq!(kind as u8, tag);
        }
        assert!(MessageType::try_from(6).is_err());
    }
}
