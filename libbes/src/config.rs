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

//! Bootstrap configuration for the supervisor and master worker: which
//! sockets to bind, where state lives, and the initial config-file
//! registry used by the admin `GetConfig`/`SetConfig` commands. Parsing the
//! contents of the registered config files themselves (handler directives,
//! `bes.conf` syntax) is a named external collaborator and stays out of
//! scope here.

use std::{collections::BTreeMap, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        config = toml::from_str(&config_str).context("parsing config file")?;
    } else {
        let default_path = PathBuf::from("/usr/local/etc/bes/bes.toml");
        if default_path.exists() {
            let config_str = fs::read_to_string(&default_path).context("reading default config toml")?;
            config = toml::from_str(&config_str).context("parsing default config file")?;
        }
    }
    Ok(config)
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    /// TCP port for the PPT data channel. Mirrors the `-p` CLI flag; the
    /// flag takes precedence when both are given.
    pub port: Option<u16>,

    /// Unix-domain socket path for the PPT data channel, as an alternative
    /// to `port`. Mirrors the `-u` CLI flag.
    pub unix_socket: Option<String>,

    /// TCP port for the admin command channel. Defaults to
    /// `consts::DEFAULT_ADMIN_PORT`.
    pub admin_port: Option<u16>,

    /// Directory PID files are written to. Mirrors the `-r` CLI flag.
    pub pid_dir: Option<String>,

    /// BES install directory, used to resolve the master worker binary
    /// path. Mirrors the `-i` CLI flag.
    pub install_dir: Option<String>,

    /// Log file path. When unset, logs go to stderr.
    pub log_file: Option<String>,

    /// Initial comma-separated debug context spec, e.g. `"ppt,besdaemon"`.
    /// Mirrors the `-d` CLI flag; contexts named here start enabled.
    pub debug_spec: Option<String>,

    /// User to drop privileges to after binding listener sockets, if
    /// started as root. Accepts a login name or a `#NNN` numeric uid.
    pub user: Option<String>,

    /// Group to drop privileges to. Defaults to the drop user's primary
    /// group when unset. Accepts a group name or a `#NNN` numeric gid.
    pub group: Option<String>,

    /// The config-file registry: logical name (`"bes.conf"`) to filesystem
    /// path, addressable by the admin `GetConfig`/`SetConfig` commands.
    pub config_files: Option<BTreeMap<String, String>>,
}

#[cfg(test)]
mod test {
    use ntest::timeout;

    use super::*;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            port = 10022
            admin_port = 11002
            "#,
            r##"
            unix_socket = "/var/run/bes/bes.sock"
            user = "bes"
            group = "#100"
            "##,
            r#"
            [config_files]
            "bes.conf" = "/etc/bes/bes.conf"
            "h5.conf" = "/etc/bes/h5.conf"
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    fn default_config_has_no_listeners_configured() {
        let config = Config::default();
        assert!(config.port.is_none());
        assert!(config.unix_socket.is_none());
    }
}
