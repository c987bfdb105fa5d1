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

//! Core implementation shared by the `besd` supervisor and `beslistener`
//! master worker binaries: the PPT session layer, socket and listener
//! abstractions, the admin command channel, and the bootstrap CLI surface
//! both binaries parse.

use std::{fs, io, path::PathBuf, sync::Mutex};

use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod admin;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod exit_code;
pub mod listener;
pub mod pidfile;
pub mod privilege;
pub mod session;
pub mod socket;
pub mod supervisor;

use config::Config;
use privilege::Principal;

/// Flags shared by `besd` and `beslistener`, mirroring the original
/// `getopt` surface `"hvsd:c:p:u:i:r:"` (spec §6).
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct CommonArgs {
    #[clap(short = 'v', long, action, help = "print version and exit")]
    pub version: bool,

    #[clap(
        short = 's',
        long,
        action,
        help = "run the PPT channel over TLS (not supported by this build; fails fast if set)"
    )]
    pub secure: bool,

    #[clap(
        short = 'd',
        long = "debug",
        action,
        help = "comma-separated list of debug contexts to enable at startup, e.g. ppt,besdaemon"
    )]
    pub debug_spec: Option<String>,

    #[clap(short = 'c', long = "config", action, help = "a toml file containing bootstrap configuration")]
    pub config_file: Option<String>,

    #[clap(short = 'p', long, action, help = "TCP port for the PPT data channel")]
    pub port: Option<u16>,

    #[clap(long = "unix-socket", action, help = "unix-domain socket path for the PPT data channel")]
    pub unix_socket: Option<String>,

    #[clap(short = 'u', long, action, help = "user to drop privileges to after binding listener sockets")]
    pub user: Option<String>,

    #[clap(short = 'i', long = "install-dir", action, help = "BES install directory")]
    pub install_dir: Option<String>,

    #[clap(short = 'r', long = "pid-dir", action, help = "directory PID files are written to")]
    pub pid_dir: Option<String>,

    #[clap(long, action, help = "file to write logs to; defaults to stderr")]
    pub log_file: Option<String>,

    #[clap(short = 'g', long, action, help = "group to drop privileges to")]
    pub group: Option<String>,
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging(args: &CommonArgs, config: &Config) -> anyhow::Result<()> {
    let log_file = args.log_file.clone().or_else(|| config.log_file.clone());
    let builder = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    match log_file {
        Some(path) => {
            let file = fs::File::create(path)?;
            builder.with_writer(Mutex::new(file)).init();
        }
        None => {
            builder.with_writer(io::stderr).init();
        }
    }
    Ok(())
}

/// Rejects flags this build cannot honor rather than silently ignoring them.
fn validate_args(args: &CommonArgs) -> anyhow::Result<()> {
    if args.secure {
        anyhow::bail!("-s/--secure was given but this build has no TLS layer; refusing to start");
    }
    Ok(())
}

fn merged_config(args: &CommonArgs) -> anyhow::Result<Config> {
    let mut config = config::read_config(&args.config_file)?;
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if args.unix_socket.is_some() {
        config.unix_socket = args.unix_socket.clone();
    }
    if args.user.is_some() {
        config.user = args.user.clone();
    }
    if args.group.is_some() {
        config.group = args.group.clone();
    }
    if args.install_dir.is_some() {
        config.install_dir = args.install_dir.clone();
    }
    if args.pid_dir.is_some() {
        config.pid_dir = args.pid_dir.clone();
    }
    if args.debug_spec.is_some() {
        config.debug_spec = args.debug_spec.clone();
    }
    Ok(config)
}

/// Entry point for the `besd` binary: runs the supervisor, which launches
/// and relaunches the master worker and hosts the admin channel.
pub fn run_supervisor(args: CommonArgs) -> anyhow::Result<()> {
    validate_args(&args)?;
    let config = merged_config(&args)?;
    init_logging(&args, &config)?;

    let pid_dir = PathBuf::from(config.pid_dir.clone().unwrap_or_else(|| "/var/run/bes".to_string()));
    let install_dir = config.install_dir.clone().unwrap_or_else(|| "/usr/local/bes".to_string());
    let beslistener_path = PathBuf::from(install_dir).join("bin").join("beslistener");

    let mut worker_args = Vec::new();
    if let Some(port) = config.port {
        worker_args.push("-p".to_string());
        worker_args.push(port.to_string());
    }
    if let Some(sock) = &config.unix_socket {
        worker_args.push("--unix-socket".to_string());
        worker_args.push(sock.clone());
    }
    if let Some(user) = &config.user {
        worker_args.push("-u".to_string());
        worker_args.push(user.clone());
    }
    if let Some(group) = &config.group {
        worker_args.push("-g".to_string());
        worker_args.push(group.clone());
    }
    if let Some(dir) = &config.pid_dir {
        worker_args.push("-r".to_string());
        worker_args.push(dir.clone());
    }

    let launch_spec = supervisor::MasterLaunchSpec { beslistener_path, args: worker_args };

    supervisor::run(
        pid_dir,
        config.admin_port,
        launch_spec,
        config.config_files.unwrap_or_default(),
        config.debug_spec,
        config.log_file,
    )
}

/// Entry point for the `beslistener` binary: the master worker itself.
pub fn run_master_worker(args: CommonArgs) -> anyhow::Result<i32> {
    validate_args(&args)?;
    let config = merged_config(&args)?;
    init_logging(&args, &config)?;

    let pid_dir = PathBuf::from(config.pid_dir.unwrap_or_else(|| "/var/run/bes".to_string()));
    let opts = daemon::WorkerOptions {
        port: config.port,
        unix_socket: config.unix_socket.map(PathBuf::from),
        pid_dir,
        user: config.user.as_deref().map(Principal::parse),
        group: config.group.as_deref().map(Principal::parse),
    };

    let code = daemon::run(opts, std::sync::Arc::new(dispatch::UnimplementedDispatch))?;
    Ok(code.as_raw())
}
