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

//! Terminal plumbing shared by the attach client and the session
//! pty: the winsize ioctls and the raw mode guard.

use std::{
    io,
    os::unix::io::{AsRawFd as _, RawFd},
};

use anyhow::Context;
use nix::sys::termios::{self, SetArg};
use tracing::error;

// see `man ioctl_tty`
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

/// The (cols, rows) of the terminal behind `fd`, in the order the
/// wire protocol carries them.
pub fn window_size(fd: RawFd) -> anyhow::Result<(u16, u16)> {
    let mut ws = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
    // Safety: ws is stack allocated and outlives the call.
    unsafe {
        tiocgwinsz(fd, &mut ws).context("fetching window size")?;
    }
    Ok((ws.ws_col, ws.ws_row))
}

/// Push a new geometry onto the terminal behind `fd`. On a pty
/// master this is also what raises SIGWINCH in the child.
pub fn set_window_size(fd: RawFd, cols: u16, rows: u16) -> anyhow::Result<()> {
    let ws = libc::winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };
    // Safety: ws is stack allocated and outlives the call.
    unsafe {
        tiocswinsz(fd, &ws).context("setting window size")?;
    }
    Ok(())
}

/// Switch the local terminal to raw mode for the duration of an
/// attach, so every keystroke reaches the session byte by byte; the
/// session's pty is the one that applies line discipline and echo.
/// The guard restores the previous settings on drop.
///
/// When stdin is not a terminal (a pipe, a test harness) there is
/// nothing to configure and the guard does nothing.
pub fn raw_mode() -> anyhow::Result<RawModeGuard> {
    let stdin = io::stdin();
    // Safety: pure ffi on a plain fd
    if unsafe { libc::isatty(stdin.as_raw_fd()) } != 1 {
        return Ok(RawModeGuard { saved: None });
    }

    let saved = termios::tcgetattr(&stdin).context("reading terminal settings")?;
    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("entering raw mode")?;

    Ok(RawModeGuard { saved: Some(saved) })
}

pub struct RawModeGuard {
    saved: Option<termios::Termios>,
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            if let Err(e) = termios::tcsetattr(&io::stdin(), SetArg::TCSANOW, saved) {
                error!("restoring terminal settings: {:?}", e);
            }
        }
    }
}
