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

use std::time;

pub const BUF_SIZE: usize = 1024 * 16;

/// Upper bound on a single frame. Nothing legitimate comes close; this
/// keeps a corrupt length prefix from making us allocate the moon.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub const SOCK_STREAM_TIMEOUT: time::Duration = time::Duration::from_millis(200);
pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

/// How often the pty read pump wakes up to check for shutdown even
/// when the shell is silent.
pub const PUMP_POLL_MS: u16 = 100;

/// Grace period between SIGHUP and SIGKILL when tearing a session down.
pub const CHILD_KILL_TIMEOUT: time::Duration = time::Duration::from_millis(500);

/// Connect retry budget while waiting for an auto-started server.
pub const CONNECT_RETRIES: usize = 25;
pub const CONNECT_RETRY_DELAY: time::Duration = time::Duration::from_millis(100);

/// Screen size used before the first attach declares a real one.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

pub const STDIN_FD: i32 = 0;
pub const STDERR_FD: i32 = 2;
