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

//! The master worker (`beslistener`): binds the PPT data-channel
//! listeners, drops root privileges, signals readiness to the supervisor
//! over fd 4, then double-forks one handler per accepted connection
//! (spec §4.5's fork discipline): an intermediate child forks the
//! grandchild that actually serves the connection, then exits immediately
//! so the grandchild is reparented to init and never needs reaping by this
//! process. Generalizes the thread-per-connection shape of the worker loop
//! this codebase used to run as a daemon, swapping `thread::spawn` for
//! `fork` since each connection gets a fully isolated process here rather
//! than a thread sharing the daemon's address space.

use std::{
    net::TcpStream,
    os::fd::{FromRawFd, IntoRawFd},
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use anyhow::Context;
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::waitpid,
    },
    unistd::{fork, getpid, ForkResult},
};
use ppt_protocol::{ExtensionMap, ERROR_STATUS, EXIT_KEY, STATUS_KEY};
use tracing::{error, info, warn};

use crate::{
    consts::{MASTER_PID_FILE, MASTER_STARTUP_FD, STARTUP_STATUS_WORD_LEN},
    daemon::signals::{self, WorkerSignals},
    dispatch::{DispatchOutcome, RequestHandler, ResponseBuffer},
    exit_code::ExitCode,
    pidfile::PidFile,
    privilege::{self, Principal},
    listener::ListenerSet,
    session::Session,
    socket::{TcpSocketListener, Transport, UnixSocketListener},
};

pub struct WorkerOptions {
    pub port: Option<u16>,
    pub unix_socket: Option<PathBuf>,
    pub pid_dir: PathBuf,
    pub user: Option<Principal>,
    pub group: Option<Principal>,
}

/// Binds listeners, drops privileges, signals readiness, then runs the
/// fork-per-connection accept loop until a shutdown or restart is
/// requested. Returns the `ExitCode` the process should exit with.
pub fn run(opts: WorkerOptions, handler: Arc<dyn RequestHandler>) -> anyhow::Result<ExitCode> {
    let mut listeners = ListenerSet::new();
    if let Some(port) = opts.port {
        listeners.add(Box::new(TcpSocketListener::bind(port).context("binding TCP data listener")?));
    }
    if let Some(path) = &opts.unix_socket {
        listeners.add(Box::new(UnixSocketListener::bind(path).context("binding unix data listener")?));
    }
    if listeners.is_empty() {
        anyhow::bail!("master worker started with no listeners configured");
    }
    info!("master worker listening on {:?}", listeners.descriptions());

    if let Some(user) = &opts.user {
        privilege::drop_privileges(user, opts.group.as_ref()).context("dropping privileges")?;
        info!("dropped privileges to {:?}/{:?}", opts.user, opts.group);
    }

    signal_startup_ready().context("signaling startup readiness on fd 4")?;

    let _pid_file = PidFile::write(opts.pid_dir.join(MASTER_PID_FILE)).context("writing master pid file")?;

    let signals = WorkerSignals::install().context("installing worker signal handlers")?;

    loop {
        if signals.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(ExitCode::NormalShutdown);
        }
        if signals.restart_requested.load(Ordering::SeqCst) {
            return Ok(ExitCode::Restart);
        }
        signals::reap_all_available();

        let (transport, idx) = match listeners.accept_any() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept_any failed: {e:#}");
                continue;
            }
        };
        info!("accepted connection on listener {idx}");

        let main_pid = getpid();
        match unsafe { fork() }.context("forking connection handler")? {
            ForkResult::Parent { child, .. } => {
                drop(transport);
                // The intermediate child exits almost immediately (after
                // forking the grandchild and a 1s grace sleep), so this
                // doesn't stall the accept loop; it's what keeps the
                // intermediate child from ever becoming a zombie.
                let _ = waitpid(child, None);
            }
            ForkResult::Child => {
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child: grandchild, .. }) => {
                        info!("forked connection handler {grandchild}");
                        thread::sleep(Duration::from_secs(1));
                        drop(transport);
                        std::process::exit(ExitCode::ChildSubprocessNormalTermination.as_raw());
                    }
                    Ok(ForkResult::Child) => {
                        let code = handle_connection(transport, Arc::clone(&handler));
                        std::process::exit(code.as_raw());
                    }
                    Err(e) => {
                        error!("second fork in connection-handler discipline failed: {e}");
                        let _ = kill(main_pid, Signal::SIGKILL);
                        std::process::exit(ExitCode::ChildSubprocessAbnormalTermination.as_raw());
                    }
                }
            }
        }
    }
}

/// Builds the `status=error` extension pair dispatch failures are reported
/// with, adding `exit=true` for the fatal class that ends the session.
fn error_extensions(exit: bool) -> ExtensionMap {
    let mut exts = ExtensionMap::new();
    exts.insert(STATUS_KEY, Some(ERROR_STATUS.to_string()));
    if exit {
        exts.insert(EXIT_KEY, Some("true".to_string()));
    }
    exts
}

fn handle_connection(transport: Box<dyn Transport>, handler: Arc<dyn RequestHandler>) -> ExitCode {
    let sigpipe = match signals::install_sigpipe_flag() {
        Ok(flag) => flag,
        Err(e) => {
            error!("failed to install per-connection SIGPIPE flag: {e:#}");
            return ExitCode::ChildSubprocessAbnormalTermination;
        }
    };

    let mut session = Session::new(transport);
    if let Err(e) = session.server_handshake() {
        warn!("handshake failed: {e}");
        return ExitCode::ChildSubprocessAbnormalTermination;
    }

    loop {
        if sigpipe.load(Ordering::SeqCst) {
            session.mark_broken_pipe();
        }

        let (extensions, payload) = match session.receive_message() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("receiving message: {e}");
                return ExitCode::ChildSubprocessAbnormalTermination;
            }
        };
        if extensions.is_exit_now() {
            info!("peer requested exit");
            return ExitCode::ChildSubprocessNormalTermination;
        }

        let mut out = ResponseBuffer::new();
        match handler.handle(&payload, &extensions, &mut out) {
            DispatchOutcome::Success => {
                if let Err(e) = session.send(&ExtensionMap::new(), &out.into_inner()) {
                    warn!("sending response: {e}");
                    return ExitCode::ChildSubprocessAbnormalTermination;
                }
            }
            DispatchOutcome::UserSyntax { message } => {
                if let Err(e) = session.send(&error_extensions(false), message.as_bytes()) {
                    warn!("sending user syntax error: {e}");
                    return ExitCode::ChildSubprocessAbnormalTermination;
                }
            }
            DispatchOutcome::TerminateImmediate { message } => {
                let _ = session.send(&error_extensions(true), message.as_bytes());
                return ExitCode::ChildSubprocessAbnormalTermination;
            }
        }
    }
}

/// Writes a 4-byte readiness word to the startup-handshake fd the
/// supervisor is blocked reading. Errors if fd 4 isn't open, which is
/// the case for a worker launched outside the supervisor.
fn signal_startup_ready() -> anyhow::Result<()> {
    use std::io::Write;

    // fd 4 is inherited from the supervisor across fork/exec; wrapping it
    // as a TcpStream is just a convenient Write handle over a raw fd, the
    // socket-specific methods are never called.
    let mut handle = unsafe { TcpStream::from_raw_fd(MASTER_STARTUP_FD) };
    let word = (ExitCode::ChildSubprocessReady.as_raw() as u32).to_be_bytes();
    debug_assert_eq!(word.len(), STARTUP_STATUS_WORD_LEN);
    let result = handle.write_all(&word);
    // Leak the fd back out rather than letting TcpStream's Drop close it;
    // the supervisor owns fd 4's lifecycle, not this process.
    let _ = handle.into_raw_fd();
    result.context("writing startup status word")
}
