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

//! The config-file registry (logical name -> path) addressed by the admin
//! `GetConfig`/`SetConfig` commands, with the atomic rename-based replace
//! protocol from spec §4.7.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};

pub struct ConfigRegistry {
    paths: BTreeMap<String, PathBuf>,
    supervisor_pid: i32,
    backed_up: BTreeSet<String>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        ConfigRegistry {
            paths: BTreeMap::new(),
            supervisor_pid: nix::unistd::getpid().as_raw(),
            backed_up: BTreeSet::new(),
        }
    }

    pub fn from_map(paths: BTreeMap<String, String>) -> Self {
        let mut registry = ConfigRegistry::new();
        for (name, path) in paths {
            registry.paths.insert(name, PathBuf::from(path));
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.paths.insert(name.into(), path.into());
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }

    pub fn get(&self, module: &str) -> anyhow::Result<String> {
        let path = self.paths.get(module).ok_or_else(|| anyhow!("unknown config module {module:?}"))?;
        fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))
    }

    /// Atomically replaces the contents of `module`'s file: write to
    /// `<path>.tmp`, back up the original to `<path>.<supervisor-pid>` on
    /// the first write of this daemon instance only, then rename `.tmp`
    /// into place.
    pub fn set(&mut self, module: &str, contents: &str) -> anyhow::Result<()> {
        let path = self.paths.get(module).ok_or_else(|| anyhow!("unknown config module {module:?}"))?.clone();

        let tmp_path = tmp_path_for(&path);
        fs::write(&tmp_path, contents)
            .with_context(|| format!("writing temp config file {}", tmp_path.display()))?;

        if !self.backed_up.contains(module) && path.exists() {
            let backup_path = backup_path_for(&path, self.supervisor_pid);
            fs::copy(&path, &backup_path)
                .with_context(|| format!("backing up {} to {}", path.display(), backup_path.display()))?;
            self.backed_up.insert(module.to_string());
        }

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming {} into place at {}", tmp_path.display(), path.display()))?;
        Ok(())
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(".tmp");
    PathBuf::from(p)
}

fn backup_path_for(path: &Path, supervisor_pid: i32) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(format!(".{supervisor_pid}"));
    PathBuf::from(p)
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn set_then_get_returns_written_bytes_verbatim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.conf");
        fs::write(&path, "original").unwrap();

        let mut registry = ConfigRegistry::new();
        registry.register("bes.conf", &path);

        registry.set("bes.conf", "updated contents").unwrap();
        assert_eq!(registry.get("bes.conf").unwrap(), "updated contents");
    }

    #[test]
    fn first_write_creates_a_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.conf");
        fs::write(&path, "original").unwrap();

        let mut registry = ConfigRegistry::new();
        registry.register("bes.conf", &path);
        registry.set("bes.conf", "updated").unwrap();

        let backup = backup_path_for(&path, registry.supervisor_pid);
        assert_eq!(fs::read_to_string(backup).unwrap(), "original");
    }

    #[test]
    fn second_write_does_not_overwrite_the_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bes.conf");
        fs::write(&path, "original").unwrap();

        let mut registry = ConfigRegistry::new();
        registry.register("bes.conf", &path);
        registry.set("bes.conf", "first update").unwrap();
        registry.set("bes.conf", "second update").unwrap();

        let backup = backup_path_for(&path, registry.supervisor_pid);
        assert_eq!(fs::read_to_string(backup).unwrap(), "original");
        assert_eq!(registry.get("bes.conf").unwrap(), "second update");
    }

    #[test]
    fn unknown_module_is_an_error() {
        let mut registry = ConfigRegistry::new();
        assert!(registry.set("nonexistent.conf", "x").is_err());
        assert!(registry.get("nonexistent.conf").is_err());
    }
}
