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

//! The per-user runtime directory: socket, pid file, and log file
//! paths, plus the bits of filesystem hygiene around them.

use std::{
    fs,
    io::Write as _,
    os::unix::ffi::OsStrExt as _,
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use tracing::info;

pub const SOCKET_NAME: &str = "default";
pub const PID_FILE_NAME: &str = "pane.pid";
pub const LOG_FILE_NAME: &str = "pane.log";

/// `/tmp/pane-<euid>`. Deliberately not under TMPDIR so every client
/// and server of one user agrees on the location.
pub fn dir() -> PathBuf {
    PathBuf::from(format!("/tmp/pane-{}", nix::unistd::geteuid()))
}

pub fn socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(SOCKET_NAME)
}

pub fn pid_file_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(PID_FILE_NAME)
}

pub fn log_file_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(LOG_FILE_NAME)
}

/// Create the runtime dir if needed and force it back to 0700. The
/// chmod runs on every start, not just the first, so a tampered mode
/// does not stick around.
pub fn ensure_dir(runtime_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(runtime_dir)
        .with_context(|| format!("creating runtime dir {:?}", runtime_dir))?;
    fs::set_permissions(runtime_dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("locking down runtime dir {:?}", runtime_dir))?;
    Ok(())
}

/// A socket path must fit in sockaddr_un's sun_path, NUL included.
pub fn check_socket_path(socket: &Path) -> anyhow::Result<()> {
    // Safety: an all-zero sockaddr_un is a valid value of the C
    // struct; we only ask it how long sun_path is.
    let limit = unsafe { std::mem::zeroed::<libc::sockaddr_un>() }.sun_path.len();
    let len = socket.as_os_str().as_bytes().len();
    if len + 1 > limit {
        return Err(anyhow!(
            "socket path {:?} is {} bytes, over the {} byte sockaddr limit",
            socket,
            len,
            limit - 1,
        ));
    }
    Ok(())
}

/// Write `<pid>\n` to the pid file with mode 0600. The write goes to
/// a temp file first and lands with a rename, so readers never see a
/// half-written pid.
pub fn write_pid_file(runtime_dir: &Path) -> anyhow::Result<()> {
    let pid_path = pid_file_path(runtime_dir);

    let mut tmp = tempfile::NamedTempFile::new_in(runtime_dir)
        .context("creating temp file for pid file")?;
    writeln!(tmp, "{}", std::process::id()).context("writing pid")?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .context("setting pid file mode")?;
    tmp.persist(&pid_path).context("renaming pid file into place")?;

    info!("wrote pid file {:?}", pid_path);
    Ok(())
}

pub fn remove_pid_file(runtime_dir: &Path) {
    let _ = fs::remove_file(pid_file_path(runtime_dir));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pid_file_contents_and_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_pid_file(dir.path()).expect("write pid file");

        let pid_path = pid_file_path(dir.path());
        let contents = fs::read_to_string(&pid_path).expect("read pid file");
        assert_eq!(contents, format!("{}\n", std::process::id()));

        let mode = fs::metadata(&pid_path).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        remove_pid_file(dir.path());
        assert!(!pid_path.exists());
    }

    #[test]
    fn socket_path_length_guard() {
        assert!(check_socket_path(Path::new("/tmp/pane-1000/default")).is_ok());

        let long = PathBuf::from(format!("/tmp/{}/default", "x".repeat(200)));
        assert!(check_socket_path(&long).is_err());
    }

    #[test]
    fn ensure_dir_rechmods() {
        let base = tempfile::tempdir().expect("tempdir");
        let runtime_dir = base.path().join("rt");

        ensure_dir(&runtime_dir).expect("ensure");
        fs::set_permissions(&runtime_dir, fs::Permissions::from_mode(0o755)).expect("chmod");

        ensure_dir(&runtime_dir).expect("ensure again");
        let mode = fs::metadata(&runtime_dir).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
