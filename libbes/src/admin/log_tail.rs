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

//! `TailLog` support: read the last N lines of the daemon log, or the
//! whole file when N is zero.

use std::{fs, io};

/// Returns the last `n` lines of the file at `path`, newline-joined. A
/// non-positive `n` returns the entire file.
pub fn tail_lines(path: &str, n: i64) -> io::Result<String> {
    let contents = fs::read_to_string(path)?;

    if n <= 0 {
        return Ok(contents);
    }

    let mut lines: Vec<&str> = contents.lines().collect();
    let trailing_newline = contents.ends_with('\n');
    let keep = n as usize;
    if lines.len() > keep {
        lines = lines.split_off(lines.len() - keep);
    }

    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn zero_returns_the_entire_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.log");
        fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let out = tail_lines(path.to_str().unwrap(), 0).unwrap();
        assert_eq!(out, "one\ntwo\nthree\n");
    }

    #[test]
    fn positive_n_returns_last_n_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.log");
        fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();

        let out = tail_lines(path.to_str().unwrap(), 2).unwrap();
        assert_eq!(out, "three\nfour\n");
    }

    #[test]
    fn n_larger_than_file_returns_whole_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.log");
        fs::write(&path, "only\n").unwrap();

        let out = tail_lines(path.to_str().unwrap(), 50).unwrap();
        assert_eq!(out, "only\n");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(tail_lines("/nonexistent/path/to/bes.log", 5).is_err());
    }
}
