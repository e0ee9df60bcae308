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

//! The terminal screen model behind a session.
//!
//! The emulator is a collaborator, not part of the core: the session
//! only needs the handful of operations in the `Emulator` trait. The
//! production implementation wraps the shpool_vt100 parser; a small
//! deterministic grid implementation backs unit tests.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use pane_protocol::{style, Attribute, Cell, Color};

/// What the session requires of a terminal screen model.
///
/// `dirty_range` reports the inclusive row range touched since the
/// last `clear_update_range`, possibly extending past the current
/// screen bounds (the session clips it).
pub trait Emulator: Send {
    /// Feed raw pty output bytes into the screen model.
    fn feed(&mut self, bytes: &[u8]);
    fn cols(&self) -> u16;
    fn rows(&self) -> u16;
    fn resize(&mut self, cols: u16, rows: u16);
    /// Cursor position as (x, y).
    fn cursor(&self) -> (u16, u16);
    fn alternate_screen(&self) -> bool;
    /// The cells of row `y`, in column order. May come back shorter
    /// than `cols`; the session pads.
    fn row_cells(&self, y: u16) -> Vec<Cell>;
    fn dirty_range(&self) -> Option<(u16, u16)>;
    fn clear_update_range(&mut self);
}

/// The production screen model: a shpool_vt100 parser plus per-row
/// content hashes used to derive the dirty range, since the parser
/// itself does not track damage.
pub struct Vt100Emulator {
    parser: shpool_vt100::Parser,
    row_hashes: Vec<u64>,
    dirty: Option<(u16, u16)>,
}

impl Vt100Emulator {
    pub fn new(cols: u16, rows: u16) -> Self {
        let parser = shpool_vt100::Parser::new(rows, cols, 0);
        let mut emulator = Vt100Emulator { parser, row_hashes: vec![], dirty: None };
        emulator.row_hashes = emulator.hash_rows();
        emulator
    }

    fn hash_rows(&self) -> Vec<u64> {
        let (rows, _) = self.parser.screen().size();
        (0..rows)
            .map(|y| {
                let mut hasher = DefaultHasher::new();
                self.row_cells(y).hash(&mut hasher);
                hasher.finish()
            })
            .collect()
    }

    fn mark_dirty(&mut self, y: u16) {
        self.dirty = match self.dirty {
            None => Some((y, y)),
            Some((start, end)) => Some((start.min(y), end.max(y))),
        };
    }

    /// Rehash every row and fold changed rows into the dirty range.
    fn rescan(&mut self) {
        let fresh = self.hash_rows();
        for (y, hash) in fresh.iter().enumerate() {
            if self.row_hashes.get(y) != Some(hash) {
                self.mark_dirty(y as u16);
            }
        }
        // rows that vanished in a shrink count as dirty too
        for y in fresh.len()..self.row_hashes.len() {
            self.mark_dirty(y as u16);
        }
        self.row_hashes = fresh;
    }
}

impl Emulator for Vt100Emulator {
    fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
        self.rescan();
    }

    fn cols(&self) -> u16 {
        let (_, cols) = self.parser.screen().size();
        cols
    }

    fn rows(&self) -> u16 {
        let (rows, _) = self.parser.screen().size();
        rows
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.screen_mut().set_size(rows, cols);
        // everything needs repainting after a resize
        self.row_hashes = self.hash_rows();
        if rows > 0 {
            self.dirty = Some((0, rows - 1));
        }
    }

    fn cursor(&self) -> (u16, u16) {
        let (row, col) = self.parser.screen().cursor_position();
        (col, row)
    }

    fn alternate_screen(&self) -> bool {
        self.parser.screen().alternate_screen()
    }

    fn row_cells(&self, y: u16) -> Vec<Cell> {
        let screen = self.parser.screen();
        let (_, cols) = screen.size();
        let mut cells = Vec::with_capacity(cols as usize);
        for x in 0..cols {
            let cell = match screen.cell(y, x) {
                Some(c) => c,
                None => {
                    cells.push(Cell::blank());
                    continue;
                }
            };
            let attribute = convert_attribute(cell);
            if cell.is_wide_continuation() {
                // the spacer that sits under the right half of a wide
                // glyph; it carries the glyph's attribute
                cells.push(Cell { ch: String::new(), width: 0, attribute });
            } else {
                let width = if cell.is_wide() { 2 } else { 1 };
                cells.push(Cell { ch: cell.contents(), width, attribute });
            }
        }
        cells
    }

    fn dirty_range(&self) -> Option<(u16, u16)> {
        self.dirty
    }

    fn clear_update_range(&mut self) {
        self.dirty = None;
    }
}

fn convert_attribute(cell: &shpool_vt100::Cell) -> Attribute {
    let mut style_bits = 0u8;
    if cell.bold() {
        style_bits |= style::BOLD;
    }
    if cell.italic() {
        style_bits |= style::ITALIC;
    }
    if cell.underline() {
        style_bits |= style::UNDERLINE;
    }
    if cell.inverse() {
        style_bits |= style::INVERT;
    }
    Attribute {
        fg: convert_color(cell.fgcolor()),
        bg: convert_color(cell.bgcolor()),
        style: style_bits,
        underline_color: None,
    }
}

fn convert_color(color: shpool_vt100::Color) -> Color {
    match color {
        shpool_vt100::Color::Default => Color::DefaultColor,
        shpool_vt100::Color::Idx(index) => Color::Ansi { index },
        shpool_vt100::Color::Rgb(r, g, b) => Color::TrueColor { r, g, b },
    }
}

/// A tiny deterministic screen model for tests: printable ASCII plus
/// carriage return, newline, and backspace. No escape sequence
/// handling, no attributes.
pub struct GridEmulator {
    cols: u16,
    rows: u16,
    cursor_x: u16,
    cursor_y: u16,
    lines: Vec<Vec<char>>,
    dirty: Option<(u16, u16)>,
}

impl GridEmulator {
    pub fn new(cols: u16, rows: u16) -> Self {
        GridEmulator {
            cols,
            rows,
            cursor_x: 0,
            cursor_y: 0,
            lines: vec![vec![' '; cols as usize]; rows as usize],
            dirty: None,
        }
    }

    fn mark_dirty(&mut self, y: u16) {
        self.dirty = match self.dirty {
            None => Some((y, y)),
            Some((start, end)) => Some((start.min(y), end.max(y))),
        };
    }

    fn line_feed(&mut self) {
        if self.cursor_y + 1 < self.rows {
            self.cursor_y += 1;
            return;
        }
        self.lines.remove(0);
        self.lines.push(vec![' '; self.cols as usize]);
        if self.rows > 0 {
            self.dirty = Some((0, self.rows - 1));
        }
    }
}

impl Emulator for GridEmulator {
    fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                b'\n' => self.line_feed(),
                b'\r' => self.cursor_x = 0,
                0x08 => self.cursor_x = self.cursor_x.saturating_sub(1),
                b if (0x20..0x7f).contains(&b) => {
                    if self.cursor_x >= self.cols {
                        self.cursor_x = 0;
                        self.line_feed();
                    }
                    let (x, y) = (self.cursor_x as usize, self.cursor_y as usize);
                    self.lines[y][x] = b as char;
                    self.mark_dirty(self.cursor_y);
                    self.cursor_x += 1;
                }
                _ => {}
            }
        }
    }

    fn cols(&self) -> u16 {
        self.cols
    }

    fn rows(&self) -> u16 {
        self.rows
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        for line in self.lines.iter_mut() {
            line.resize(cols as usize, ' ');
        }
        self.lines.resize(rows as usize, vec![' '; cols as usize]);
        self.cursor_x = self.cursor_x.min(cols.saturating_sub(1));
        self.cursor_y = self.cursor_y.min(rows.saturating_sub(1));
        if rows > 0 {
            self.dirty = Some((0, rows - 1));
        }
    }

    fn cursor(&self) -> (u16, u16) {
        (self.cursor_x, self.cursor_y)
    }

    fn alternate_screen(&self) -> bool {
        false
    }

    fn row_cells(&self, y: u16) -> Vec<Cell> {
        match self.lines.get(y as usize) {
            Some(line) => line
                .iter()
                .map(|&ch| Cell {
                    ch: ch.to_string(),
                    width: 1,
                    attribute: Attribute::default(),
                })
                .collect(),
            None => vec![],
        }
    }

    fn dirty_range(&self) -> Option<(u16, u16)> {
        self.dirty
    }

    fn clear_update_range(&mut self) {
        self.dirty = None;
    }
}
