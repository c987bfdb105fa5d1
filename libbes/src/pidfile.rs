// Copyright 2024 BES Project Contributors
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

//! PID file handling: one line, `PID: <n> UID: <n>`, mode 0644. Grounded on
//! `original_source/server/ServerDaemon.cc`'s `store_listener_id`.

use std::{
    fs,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::Context;
use nix::unistd::{getpid, getuid};

use crate::consts::PID_FILE_MODE;

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the PID file at `path`, creating it with mode 0644.
    pub fn write(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pid = getpid().as_raw();
        let uid = getuid().as_raw();
        let contents = format!("PID: {pid} UID: {uid}\n");

        let mut file = fs::File::create(&path)
            .with_context(|| format!("creating pid file {}", path.display()))?;
        file.write_all(contents.as_bytes())?;
        file.set_permissions(fs::Permissions::from_mode(PID_FILE_MODE))?;

        Ok(PidFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back an existing PID file, e.g. to detect an already-running
    /// supervisor before starting a new one.
    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<(i32, u32)> {
        let contents = fs::read_to_string(path.as_ref())?;
        parse(&contents)
    }

    pub fn remove(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}

fn parse(line: &str) -> anyhow::Result<(i32, u32)> {
    let line = line.trim();
    let rest = line
        .strip_prefix("PID: ")
        .ok_or_else(|| anyhow::anyhow!("pid file missing 'PID: ' prefix: {line:?}"))?;
    let (pid_str, rest) = rest
        .split_once(" UID: ")
        .ok_or_else(|| anyhow::anyhow!("pid file missing ' UID: ' separator: {line:?}"))?;
    let pid: i32 = pid_str.parse().context("parsing pid")?;
    let uid: u32 = rest.parse().context("parsing uid")?;
    Ok((pid, uid))
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.pid");
        let pid_file = PidFile::write(&path).unwrap();
        let (pid, uid) = PidFile::read(pid_file.path()).unwrap();
        assert_eq!(pid, getpid().as_raw());
        assert_eq!(uid, getuid().as_raw());
    }

    #[test]
    fn file_mode_is_0644() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.pid");
        let pid_file = PidFile::write(&path).unwrap();
        let mode = fs::metadata(pid_file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, PID_FILE_MODE);
    }

    #[test]
    fn removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.pid");
        {
            let _pid_file = PidFile::write(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn parse_rejects_malformed_line() {
        assert!(parse("not a pid file").is_err());
    }

    #[test]
    fn parse_accepts_well_formed_line() {
        let (pid, uid) = parse("PID: 42 UID: 7\n").unwrap();
        assert_eq!(pid, 42);
        assert_eq!(uid, 7);
    }
}
