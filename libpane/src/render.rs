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

//! Just enough cell painting for the attach client: cursor
//! addressing plus an SGR run per cell attribute. A real console
//! driver would diff and batch; this one simply repaints the rows the
//! server said changed.

use std::io::Write;

use pane_protocol::{style, Attribute, Cell, Color, Delta, Snapshot};

pub struct Renderer {
    last_attribute: Option<Attribute>,
}

impl Renderer {
    pub fn new() -> Self {
        Renderer { last_attribute: None }
    }

    /// Clear the screen and repaint everything.
    pub fn apply_snapshot<W: Write>(&mut self, w: &mut W, snapshot: &Snapshot) -> std::io::Result<()> {
        write!(w, "\x1b[2J\x1b[H")?;
        for (y, line) in snapshot.lines.iter().enumerate() {
            self.draw_line(w, y as u16, line)?;
        }
        self.place_cursor(w, snapshot.cursor_x, snapshot.cursor_y)?;
        w.flush()
    }

    /// Repaint the delta's rows and re-place the cursor.
    pub fn apply_delta<W: Write>(&mut self, w: &mut W, delta: &Delta) -> std::io::Result<()> {
        for (i, line) in delta.lines.iter().enumerate() {
            self.draw_line(w, delta.start_y + i as u16, line)?;
        }
        self.place_cursor(w, delta.cursor_x, delta.cursor_y)?;
        w.flush()
    }

    fn draw_line<W: Write>(&mut self, w: &mut W, y: u16, line: &[Cell]) -> std::io::Result<()> {
        // terminal rows and columns are 1-based
        write!(w, "\x1b[{};1H\x1b[K", y + 1)?;
        for cell in line {
            if cell.width == 0 {
                // the wide glyph to the left already painted this column
                continue;
            }
            if self.last_attribute.as_ref() != Some(&cell.attribute) {
                write!(w, "\x1b[0m{}", sgr(&cell.attribute))?;
                self.last_attribute = Some(cell.attribute.clone());
            }
            w.write_all(cell.ch.as_bytes())?;
        }
        write!(w, "\x1b[0m")?;
        self.last_attribute = None;
        Ok(())
    }

    fn place_cursor<W: Write>(&mut self, w: &mut W, x: u16, y: u16) -> std::io::Result<()> {
        write!(w, "\x1b[{};{}H", y + 1, x + 1)
    }
}

/// Build the SGR sequence selecting the given attribute, assuming a
/// reset state.
fn sgr(attribute: &Attribute) -> String {
    let mut codes: Vec<String> = vec![];
    let s = attribute.style;
    if s & style::BOLD != 0 {
        codes.push(String::from("1"));
    }
    if s & style::DIM != 0 {
        codes.push(String::from("2"));
    }
    if s & style::ITALIC != 0 {
        codes.push(String::from("3"));
    }
    if s & style::UNDERLINE != 0 {
        codes.push(String::from("4"));
    }
    if s & style::BLINK != 0 {
        codes.push(String::from("5"));
    }
    if s & style::INVERT != 0 {
        codes.push(String::from("7"));
    }
    if s & style::INVISIBLE != 0 {
        codes.push(String::from("8"));
    }
    if s & style::CROSSED_OUT != 0 {
        codes.push(String::from("9"));
    }

    match attribute.fg {
        Color::DefaultColor => {}
        // no direct SGR for this one; reverse video is the closest
        Color::DefaultInvertedColor => codes.push(String::from("7")),
        Color::Ansi { index } if index < 8 => codes.push(format!("{}", 30 + index)),
        Color::Ansi { index } if index < 16 => codes.push(format!("{}", 90 + index - 8)),
        Color::Ansi { index } => codes.push(format!("38;5;{}", index)),
        Color::TrueColor { r, g, b } => codes.push(format!("38;2;{};{};{}", r, g, b)),
    }
    match attribute.bg {
        Color::DefaultColor | Color::DefaultInvertedColor => {}
        Color::Ansi { index } if index < 8 => codes.push(format!("{}", 40 + index)),
        Color::Ansi { index } if index < 16 => codes.push(format!("{}", 100 + index - 8)),
        Color::Ansi { index } => codes.push(format!("48;5;{}", index)),
        Color::TrueColor { r, g, b } => codes.push(format!("48;2;{};{};{}", r, g, b)),
    }

    if codes.is_empty() {
        String::new()
    } else {
        format!("\x1b[{}m", codes.join(";"))
    }
}
