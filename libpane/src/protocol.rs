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

//! The wire codec and the framed connection.
//!
//! Every frame on a pane socket is a 4 byte big endian length, a 1
//! byte format tag (0 = JSON, 1 = binary), then `length - 1` payload
//! bytes. Requests and responses always travel as JSON; snapshots and
//! deltas sent by the server always travel in the compact binary
//! form; inputs and resizes from clients are accepted in either.

use std::{
    fmt,
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, bail, Context};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use pane_protocol::{
    Attribute, Cell, Color, Delta, Input, Request, Resize, Response, Snapshot, WireMessage,
};
use tracing::trace;

use crate::consts;

/// Frame format tags.
pub const FORMAT_JSON: u8 = 0;
pub const FORMAT_BINARY: u8 = 1;

/// The ways a payload can fail to decode. All of them are fatal to
/// the connection that produced the bytes; none of them leave any
/// partially applied state behind because decoding is a pure
/// slice-to-value function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The payload ended before the structure it promised.
    UnexpectedEnd,
    /// An unknown message, color, or format tag.
    InvalidTag(u8),
    /// A string field holding bytes that are not UTF-8.
    InvalidUtf8,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnexpectedEnd => write!(f, "unexpected end of payload"),
            CodecError::InvalidTag(tag) => write!(f, "invalid tag {}", tag),
            CodecError::InvalidUtf8 => write!(f, "invalid utf8 in string field"),
        }
    }
}

impl std::error::Error for CodecError {}

//
// JSON codec
//

pub fn encode_json(msg: &WireMessage) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(msg).context("serializing message")
}

pub fn decode_json(buf: &[u8]) -> anyhow::Result<WireMessage> {
    serde_json::from_slice(buf).context("parsing json payload")
}

//
// Binary codec
//

/// Encode a screen-plane message into the compact binary payload
/// form. Requests and responses are control plane only and refuse
/// this encoding.
pub fn encode_binary(msg: &WireMessage) -> anyhow::Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::with_capacity(consts::BUF_SIZE);
    buf.write_u8(msg.message_type() as u8)?;
    match msg {
        WireMessage::Snapshot(snapshot) => {
            buf.write_u16::<BigEndian>(snapshot.cols)?;
            buf.write_u16::<BigEndian>(snapshot.rows)?;
            buf.write_u16::<BigEndian>(snapshot.cursor_x)?;
            buf.write_u16::<BigEndian>(snapshot.cursor_y)?;
            buf.write_u8(snapshot.is_alternate as u8)?;
            write_lines(&mut buf, &snapshot.lines)?;
        }
        WireMessage::Delta(delta) => {
            buf.write_u16::<BigEndian>(delta.start_y)?;
            buf.write_u16::<BigEndian>(delta.end_y)?;
            buf.write_u16::<BigEndian>(delta.cursor_x)?;
            buf.write_u16::<BigEndian>(delta.cursor_y)?;
            write_lines(&mut buf, &delta.lines)?;
        }
        WireMessage::Input(input) => {
            // Input data carries a u32 length since it is arbitrary
            // bytes; cell characters use a u8 length since they hold a
            // single grapheme. The asymmetry is part of the wire
            // contract.
            buf.write_u32::<BigEndian>(input.data.len() as u32)?;
            buf.write_all(&input.data)?;
        }
        WireMessage::Resize(resize) => {
            buf.write_u16::<BigEndian>(resize.cols)?;
            buf.write_u16::<BigEndian>(resize.rows)?;
        }
        WireMessage::Request(_) | WireMessage::Response(_) => {
            bail!("{:?} messages must be sent as JSON", msg.message_type());
        }
    }
    Ok(buf)
}

fn write_lines(buf: &mut Vec<u8>, lines: &[Vec<Cell>]) -> anyhow::Result<()> {
    buf.write_u16::<BigEndian>(lines.len() as u16)?;
    for line in lines {
        buf.write_u16::<BigEndian>(line.len() as u16)?;
        for cell in line {
            write_cell(buf, cell)?;
        }
    }
    Ok(())
}

fn write_cell(buf: &mut Vec<u8>, cell: &Cell) -> anyhow::Result<()> {
    if cell.ch.len() > u8::MAX as usize {
        bail!("cell grapheme of {} bytes does not fit a u8 length", cell.ch.len());
    }
    buf.write_u8(cell.ch.len() as u8)?;
    buf.write_all(cell.ch.as_bytes())?;
    buf.write_i8(cell.width)?;
    write_attribute(buf, &cell.attribute)?;
    Ok(())
}

fn write_attribute(buf: &mut Vec<u8>, attribute: &Attribute) -> anyhow::Result<()> {
    write_color(buf, &attribute.fg)?;
    write_color(buf, &attribute.bg)?;
    buf.write_u8(attribute.style)?;
    match &attribute.underline_color {
        Some(color) => {
            buf.write_u8(1)?;
            write_color(buf, color)?;
        }
        None => buf.write_u8(0)?,
    }
    Ok(())
}

fn write_color(buf: &mut Vec<u8>, color: &Color) -> anyhow::Result<()> {
    buf.write_u8(color.code())?;
    match color {
        Color::DefaultColor | Color::DefaultInvertedColor => {}
        Color::Ansi { index } => buf.write_u8(*index)?,
        Color::TrueColor { r, g, b } => {
            buf.write_u8(*r)?;
            buf.write_u8(*g)?;
            buf.write_u8(*b)?;
        }
    }
    Ok(())
}

/// Decode a binary payload. Tags 0 and 1 (request, response) are
/// rejected: the control plane never travels in binary.
pub fn decode_binary(buf: &[u8]) -> Result<WireMessage, CodecError> {
    let mut r = ByteReader::new(buf);
    let tag = r.u8()?;
    match tag {
        2 => {
            let cols = r.u16()?;
            let rows = r.u16()?;
            let cursor_x = r.u16()?;
            let cursor_y = r.u16()?;
            let is_alternate = r.u8()? != 0;
            let lines = read_lines(&mut r)?;
            Ok(WireMessage::Snapshot(Snapshot {
                cols,
                rows,
                cursor_x,
                cursor_y,
                is_alternate,
                lines,
            }))
        }
        3 => {
            let start_y = r.u16()?;
            let end_y = r.u16()?;
            let cursor_x = r.u16()?;
            let cursor_y = r.u16()?;
            let lines = read_lines(&mut r)?;
            Ok(WireMessage::Delta(Delta { start_y, end_y, cursor_x, cursor_y, lines }))
        }
        4 => {
            let len = r.u32()? as usize;
            let data = r.take(len)?.to_vec();
            Ok(WireMessage::Input(Input { data }))
        }
        5 => {
            let cols = r.u16()?;
            let rows = r.u16()?;
            Ok(WireMessage::Resize(Resize { cols, rows }))
        }
        tag => Err(CodecError::InvalidTag(tag)),
    }
}

fn read_lines(r: &mut ByteReader) -> Result<Vec<Vec<Cell>>, CodecError> {
    let line_count = r.u16()? as usize;
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        let cell_count = r.u16()? as usize;
        let mut line = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            line.push(read_cell(r)?);
        }
        lines.push(line);
    }
    Ok(lines)
}

fn read_cell(r: &mut ByteReader) -> Result<Cell, CodecError> {
    let char_len = r.u8()? as usize;
    let raw = r.take(char_len)?;
    let ch = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?.to_string();
    let width = r.i8()?;
    let attribute = read_attribute(r)?;
    Ok(Cell { ch, width, attribute })
}

fn read_attribute(r: &mut ByteReader) -> Result<Attribute, CodecError> {
    let fg = read_color(r)?;
    let bg = read_color(r)?;
    let style = r.u8()?;
    let underline_color = if r.u8()? != 0 { Some(read_color(r)?) } else { None };
    Ok(Attribute { fg, bg, style, underline_color })
}

fn read_color(r: &mut ByteReader) -> Result<Color, CodecError> {
    match r.u8()? {
        0 => Ok(Color::DefaultColor),
        1 => Ok(Color::DefaultInvertedColor),
        2 => Ok(Color::Ansi { index: r.u8()? }),
        3 => Ok(Color::TrueColor { r: r.u8()?, g: r.u8()?, b: r.u8()? }),
        tag => Err(CodecError::InvalidTag(tag)),
    }
}

/// A bounds-checked cursor over a payload slice.
struct ByteReader<'data> {
    buf: &'data [u8],
    pos: usize,
}

impl<'data> ByteReader<'data> {
    fn new(buf: &'data [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'data [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::UnexpectedEnd);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.take(1)?[0] as i8)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

//
// Frame layer
//

fn write_frame<W: Write>(w: &mut W, format: u8, payload: &[u8]) -> io::Result<()> {
    w.write_u32::<BigEndian>((payload.len() + 1) as u32)?;
    w.write_u8(format)?;
    w.write_all(payload)?;
    w.flush()
}

/// Read the next frame, returning the format tag and payload, or None
/// on a clean EOF at a frame boundary. EOF in the middle of a frame
/// is an UnexpectedEnd.
fn read_frame<R: Read>(r: &mut R) -> anyhow::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r.read(&mut len_buf[filled..]).context("reading frame length")?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::UnexpectedEnd.into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        // not even a format tag
        return Err(CodecError::UnexpectedEnd.into());
    }
    if len > consts::MAX_FRAME_BYTES {
        return Err(anyhow!("frame of {} bytes exceeds the {} byte limit", len, consts::MAX_FRAME_BYTES));
    }

    let mut frame = vec![0u8; len];
    r.read_exact(&mut frame).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            anyhow::Error::from(CodecError::UnexpectedEnd)
        } else {
            anyhow::Error::from(e).context("reading frame body")
        }
    })?;

    let format = frame[0];
    let payload = frame.split_off(1);
    Ok(Some((format, payload)))
}

//
// Framed connection
//

/// A duplex framed message stream over one unix socket.
///
/// Writes are serialized by an internal mutex, so concurrent senders
/// observe as-if-atomic frame emission. Reads are single consumer by
/// contract; the read half has its own lock only so the type stays
/// Sync. Close is idempotent: after it, sends fail and reads return
/// EOF.
#[derive(Debug)]
pub struct FramedConnection {
    reader: Mutex<io::BufReader<UnixStream>>,
    writer: Mutex<io::BufWriter<UnixStream>>,
    stream: UnixStream,
    closed: AtomicBool,
}

impl FramedConnection {
    pub fn new(stream: UnixStream) -> anyhow::Result<Self> {
        let read_half = stream.try_clone().context("cloning read half")?;
        let write_half = stream.try_clone().context("cloning write half")?;
        Ok(FramedConnection {
            reader: Mutex::new(io::BufReader::new(read_half)),
            writer: Mutex::new(io::BufWriter::new(write_half)),
            stream,
            closed: AtomicBool::new(false),
        })
    }

    /// Send a message in JSON form.
    pub fn send(&self, msg: &WireMessage) -> anyhow::Result<()> {
        let payload = encode_json(msg)?;
        self.send_frame(FORMAT_JSON, &payload)
    }

    /// Send a screen-plane message in binary form.
    pub fn send_binary(&self, msg: &WireMessage) -> anyhow::Result<()> {
        let payload = encode_binary(msg)?;
        self.send_frame(FORMAT_BINARY, &payload)
    }

    /// Write one pre-encoded payload. A failed write is fatal: the
    /// connection is closed before the error is returned.
    pub fn send_frame(&self, format: u8, payload: &[u8]) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("connection is closed");
        }
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = write_frame(&mut *writer, format, payload) {
            drop(writer);
            self.close();
            return Err(e).context("writing frame");
        }
        trace!("wrote frame format={} len={}", format, payload.len());
        Ok(())
    }

    /// Read the next message, auto-detecting the format from the
    /// frame tag. Returns None on clean EOF. Empty payloads are legal
    /// on the wire and are skipped here.
    pub fn read_message(&self) -> anyhow::Result<Option<WireMessage>> {
        let mut reader = self.reader.lock().unwrap();
        loop {
            let (format, payload) = match read_frame(&mut *reader)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            if payload.is_empty() {
                trace!("skipping empty frame");
                continue;
            }
            return match format {
                FORMAT_JSON => decode_json(&payload).map(Some),
                FORMAT_BINARY => Ok(Some(decode_binary(&payload)?)),
                tag => Err(CodecError::InvalidTag(tag).into()),
            };
        }
    }

    /// Adjust the read timeout on the underlying socket. Used by the
    /// server to bound the handshake read, then lifted for streaming.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Shut the connection down. Idempotent; both halves are torn
    /// down so the peer and any blocked reader observe EOF.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

//
// Client
//

/// A client handle for one control conversation with the server.
#[derive(Debug)]
pub struct Client {
    conn: FramedConnection,
}

impl Client {
    /// Dial the server socket. The io::Error stays the root cause so
    /// callers can downcast and recognize "no server yet" conditions.
    pub fn connect<P: AsRef<Path>>(sock: P) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(sock).context("connecting to pane server")?;
        Ok(Client { conn: FramedConnection::new(stream)? })
    }

    /// Send one request and read the single response for it.
    pub fn request(&self, request: Request) -> anyhow::Result<Response> {
        self.conn.send(&WireMessage::Request(request)).context("writing request")?;
        match self.conn.read_message().context("reading response")? {
            Some(WireMessage::Response(response)) => Ok(response),
            Some(other) => bail!("expected a response, got {:?}", other.message_type()),
            None => bail!("server closed the connection without responding"),
        }
    }

    /// Hand the underlying connection over, e.g. to the attach loop
    /// once the handshake response has arrived.
    pub fn into_connection(self) -> FramedConnection {
        self.conn
    }

    pub fn connection(&self) -> &FramedConnection {
        &self.conn
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time};

    use super::*;

    fn sample_attribute() -> Attribute {
        Attribute {
            fg: Color::Ansi { index: 2 },
            bg: Color::TrueColor { r: 10, g: 20, b: 30 },
            style: pane_protocol::style::BOLD | pane_protocol::style::DIM,
            underline_color: Some(Color::DefaultInvertedColor),
        }
    }

    fn sample_snapshot() -> Snapshot {
        let wide = Cell { ch: String::from("你"), width: 2, attribute: sample_attribute() };
        let companion = Cell { ch: String::new(), width: 0, attribute: sample_attribute() };
        let plain = Cell { ch: String::from("a"), width: 1, attribute: Attribute::default() };
        Snapshot {
            cols: 4,
            rows: 2,
            cursor_x: 1,
            cursor_y: 0,
            is_alternate: false,
            lines: vec![
                vec![wide, companion, plain.clone(), plain.clone()],
                vec![plain.clone(), plain.clone(), plain.clone(), plain],
            ],
        }
    }

    #[test]
    fn binary_round_trip() {
        let cases = vec![
            WireMessage::Snapshot(sample_snapshot()),
            WireMessage::Delta(Delta {
                start_y: 3,
                end_y: 4,
                cursor_x: 0,
                cursor_y: 4,
                lines: vec![vec![Cell::blank()], vec![Cell::blank()]],
            }),
            WireMessage::Input(Input { data: vec![0x6c, 0x73, 0x0d, 0xff, 0x00] }),
            WireMessage::Resize(Resize { cols: 100, rows: 30 }),
        ];

        for msg in cases {
            let buf = encode_binary(&msg).expect("encode to succeed");
            let round_tripped = decode_binary(&buf).expect("decode to succeed");
            assert_eq!(msg, round_tripped);
        }
    }

    #[test]
    fn control_plane_refuses_binary() {
        let request = WireMessage::Request(Request::new(pane_protocol::Command::Ping));
        assert!(encode_binary(&request).is_err());

        let response = WireMessage::Response(Response::ok());
        assert!(encode_binary(&response).is_err());

        assert_eq!(decode_binary(&[0]), Err(CodecError::InvalidTag(0)));
        assert_eq!(decode_binary(&[1]), Err(CodecError::InvalidTag(1)));
    }

    #[test]
    fn decode_error_kinds() {
        // truncations at every length of a valid payload
        let buf = encode_binary(&WireMessage::Snapshot(sample_snapshot())).expect("encode");
        for len in 0..buf.len() {
            assert_eq!(
                decode_binary(&buf[..len]),
                Err(CodecError::UnexpectedEnd),
                "truncation at {} bytes",
                len
            );
        }

        // unknown message tag
        assert_eq!(decode_binary(&[9]), Err(CodecError::InvalidTag(9)));

        // unknown color variant inside a cell
        let mut bad_color = encode_binary(&WireMessage::Delta(Delta {
            start_y: 0,
            end_y: 0,
            cursor_x: 0,
            cursor_y: 0,
            lines: vec![vec![Cell::blank()]],
        }))
        .expect("encode");
        // tag(1) + 4 u16 header fields (8) + lineCount(2) + cellCount(2)
        // + charLen(1) + ' '(1) + width(1) puts the fg color tag here
        let color_offset = 1 + 8 + 2 + 2 + 1 + 1 + 1;
        bad_color[color_offset] = 7;
        assert_eq!(decode_binary(&bad_color), Err(CodecError::InvalidTag(7)));

        // non-utf8 bytes in a cell character
        let mut bad_char = encode_binary(&WireMessage::Delta(Delta {
            start_y: 0,
            end_y: 0,
            cursor_x: 0,
            cursor_y: 0,
            lines: vec![vec![Cell::blank()]],
        }))
        .expect("encode");
        let char_offset = 1 + 8 + 2 + 2 + 1;
        bad_char[char_offset] = 0xff;
        assert_eq!(decode_binary(&bad_char), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn input_length_prefix_is_u32() {
        let msg = WireMessage::Input(Input { data: vec![b'x'; 300] });
        let buf = encode_binary(&msg).expect("encode");
        // tag, then a 4 byte length
        assert_eq!(buf[..5], [4u8, 0, 0, 1, 44]);
    }

    #[test]
    fn framing_survives_dribbled_writes() {
        let (tx, rx) = UnixStream::pair().expect("socketpair");
        let conn = FramedConnection::new(rx).expect("conn");

        let messages: Vec<WireMessage> = (0..3)
            .map(|i| WireMessage::Input(Input { data: format!("msg-{}", i).into_bytes() }))
            .collect();

        let mut wire = Vec::new();
        // a legal empty frame in front, which the reader skips
        write_frame(&mut wire, FORMAT_JSON, &[]).expect("write empty frame");
        for msg in &messages {
            let payload = encode_binary(msg).expect("encode");
            write_frame(&mut wire, FORMAT_BINARY, &payload).expect("write frame");
        }

        let writer = thread::spawn(move || {
            let mut tx = tx;
            for chunk in wire.chunks(3) {
                tx.write_all(chunk).expect("dribble write");
                tx.flush().expect("flush");
                thread::sleep(time::Duration::from_millis(1));
            }
        });

        for want in &messages {
            let got = conn.read_message().expect("read").expect("message");
            assert_eq!(want, &got);
        }
        writer.join().expect("writer join");

        // the writer hung up, so the next read is a clean EOF
        assert!(conn.read_message().expect("read after eof").is_none());
    }

    #[test]
    fn concurrent_writers_do_not_interleave() {
        let (tx, rx) = UnixStream::pair().expect("socketpair");
        let send_conn = Arc::new(FramedConnection::new(tx).expect("conn"));
        let recv_conn = FramedConnection::new(rx).expect("conn");

        const PER_WRITER: usize = 50;
        let mut writers = vec![];
        for writer_id in 0..2u8 {
            let conn = Arc::clone(&send_conn);
            writers.push(thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let data = format!("w{}-{}", writer_id, i).repeat(64).into_bytes();
                    let msg = WireMessage::Input(Input { data });
                    conn.send_binary(&msg).expect("send");
                }
            }));
        }

        let mut seen = vec![0usize; 2];
        for _ in 0..(2 * PER_WRITER) {
            let msg = recv_conn.read_message().expect("read").expect("message");
            let data = match msg {
                WireMessage::Input(input) => input.data,
                other => panic!("unexpected message {:?}", other.message_type()),
            };
            let text = String::from_utf8(data).expect("intact utf8");
            // every frame must be wholly one writer's message
            let first = &text[..text.find('-').expect("separator")];
            let writer_id: usize =
                first.trim_start_matches('w').parse().expect("writer id");
            let unit_len = text.len() / 64;
            assert_eq!(text.as_bytes().chunks(unit_len).count(), 64);
            for unit in text.as_bytes().chunks(unit_len) {
                assert_eq!(unit, &text.as_bytes()[..unit_len]);
            }
            seen[writer_id] += 1;
        }
        assert_eq!(seen, vec![PER_WRITER, PER_WRITER]);

        for handle in writers {
            handle.join().expect("writer join");
        }
    }

    #[test]
    fn close_is_idempotent_and_fatal_to_sends() {
        let (tx, _rx) = UnixStream::pair().expect("socketpair");
        let conn = FramedConnection::new(tx).expect("conn");
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        let msg = WireMessage::Resize(Resize { cols: 1, rows: 1 });
        assert!(conn.send(&msg).is_err());
    }
}
