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

//! The supervisor (`besd`): launches and relaunches the master worker,
//! hosts the admin command channel, and owns the process-tree bookkeeping
//! the original kept in module-level globals (`master_beslistener_pid`,
//! `master_beslistener_status`). Here that state is an explicit struct
//! behind a mutex instead, so the admin handler and the child-reaping
//! logic can't read it out of step with each other.

use std::{
    io::Read,
    os::{
        fd::AsRawFd,
        unix::process::CommandExt,
    },
    path::PathBuf,
    process::Command,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::Context;
use nix::{
    sys::{
        signal::{killpg, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{pipe, setsid, Pid},
};
use tracing::{info, warn};

use ppt_protocol::{ExtensionMap, ERROR_STATUS, EXIT_KEY, STATUS_KEY};

use crate::{
    admin::{self, ConfigRegistry, DebugContexts, ResponseStatus, SupervisorControl},
    consts::{ACCEPT_POLL_TIMEOUT, DEFAULT_ADMIN_PORT, MASTER_STARTUP_FD, STARTUP_STATUS_WORD_LEN, SUPERVISOR_PID_FILE},
    exit_code::ExitCode,
    pidfile::PidFile,
    session::Session,
    socket::{Listener, TcpSocketListener},
};

/// What's needed to launch and relaunch the master worker binary. The
/// bootstrap parameters themselves are read from `Config`/CLI flags by
/// the caller; this struct is the subset the supervisor must remember
/// across restarts.
#[derive(Clone)]
pub struct MasterLaunchSpec {
    pub beslistener_path: PathBuf,
    pub args: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MasterStatus {
    Stopped,
    Running,
}

pub struct SupervisorState {
    launch_spec: MasterLaunchSpec,
    master_pid: Option<Pid>,
    status: MasterStatus,
}

impl SupervisorState {
    pub fn new(launch_spec: MasterLaunchSpec) -> Self {
        SupervisorState { launch_spec, master_pid: None, status: MasterStatus::Stopped }
    }

    /// Forks and execs the master worker, with the write end of a fresh
    /// pipe dup'd onto fd `MASTER_STARTUP_FD` in the child. Blocks on the
    /// read end until the worker's startup status word arrives (or the
    /// pipe closes without one, which is treated as a failed launch and
    /// is *not* retried automatically, per spec's guidance not to chase a
    /// master that never comes up).
    fn launch(&mut self) -> anyhow::Result<()> {
        let (read_fd, write_fd) = pipe().context("creating startup handshake pipe")?;

        let write_raw = write_fd.as_raw_fd();
        let mut command = Command::new(&self.launch_spec.beslistener_path);
        command.args(&self.launch_spec.args);
        unsafe {
            command.pre_exec(move || {
                if write_raw != MASTER_STARTUP_FD {
                    if libc::dup2(write_raw, MASTER_STARTUP_FD) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let child = command.spawn().context("spawning master worker")?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(write_fd);

        let mut reader = std::fs::File::from(read_fd);
        let mut word = [0u8; STARTUP_STATUS_WORD_LEN];
        let ready = poll_readable(reader.as_raw_fd(), ACCEPT_POLL_TIMEOUT)
            && reader.read_exact(&mut word).is_ok();

        if !ready {
            warn!("master worker {pid} did not complete the startup handshake");
            let _ = killpg(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            anyhow::bail!("master worker failed to signal readiness on fd {MASTER_STARTUP_FD}");
        }

        info!("master worker {pid} is ready");
        self.master_pid = Some(pid);
        self.status = MasterStatus::Running;
        Ok(())
    }
}

/// Blocks until every process in `pgid`'s group has been reaped. Used by
/// `stop_master` so a `StopNow` response only goes out once the master
/// worker and every still-living per-connection child it forked (they share
/// its pgid, having never called `setsid`) are gone.
fn reap_process_group(pgid: Pid) {
    loop {
        match waitpid(Pid::from_raw(-pgid.as_raw()), None) {
            Ok(_) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid on master process group failed: {e}");
                break;
            }
        }
    }
}

fn poll_readable(fd: i32, timeout: Duration) -> bool {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    matches!(poll(&mut fds, timeout), Ok(n) if n > 0)
}

impl SupervisorControl for SupervisorState {
    fn is_master_running(&self) -> bool {
        self.status == MasterStatus::Running
    }

    fn stop_master(&mut self) -> anyhow::Result<()> {
        let Some(pid) = self.master_pid else {
            anyhow::bail!("no master worker is running");
        };
        killpg(pid, Signal::SIGTERM).context("sending SIGTERM to master process group")?;
        reap_process_group(pid);
        self.master_pid = None;
        self.status = MasterStatus::Stopped;
        Ok(())
    }

    fn start_master(&mut self) -> anyhow::Result<()> {
        self.launch()
    }
}

/// Blocks waiting for the master worker to exit, decodes its exit status
/// against `ExitCode`, and relaunches it when (and only when) the exit
/// code is `Restart`. Runs on its own thread for the lifetime of the
/// supervisor.
pub fn watch_master(state: Arc<Mutex<SupervisorState>>) {
    loop {
        let pid = {
            let guard = state.lock().unwrap();
            match guard.master_pid {
                Some(pid) => pid,
                None => return,
            }
        };

        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(e) => {
                warn!("waitpid on master worker failed: {e}");
                return;
            }
        };

        let raw_code = match status {
            WaitStatus::Exited(_, code) => Some(code),
            WaitStatus::Signaled(p, sig, _) => {
                info!("master worker {p} killed by signal {sig:?}");
                None
            }
            _ => None,
        };

        let mut guard = state.lock().unwrap();
        guard.master_pid = None;
        guard.status = MasterStatus::Stopped;

        let should_restart = raw_code.and_then(ExitCode::from_raw).map(ExitCode::should_restart).unwrap_or(false);
        if !should_restart {
            info!("master worker exited with code {raw_code:?}, not restarting");
            return;
        }

        info!("master worker requested a restart");
        if let Err(e) = guard.launch() {
            warn!("failed to relaunch master worker: {e:#}");
            return;
        }
    }
}

/// Builds the extension pair an admin response is framed with: none for
/// `Ok`, `status=error` for `Error`, and `status=error, exit=true` for
/// `Fatal` (spec §4.7/§7).
fn response_extensions(status: ResponseStatus) -> ExtensionMap {
    let mut exts = ExtensionMap::new();
    match status {
        ResponseStatus::Ok => {}
        ResponseStatus::Error => {
            exts.insert(STATUS_KEY, Some(ERROR_STATUS.to_string()));
        }
        ResponseStatus::Fatal => {
            exts.insert(STATUS_KEY, Some(ERROR_STATUS.to_string()));
            exts.insert(EXIT_KEY, Some("true".to_string()));
        }
    }
    exts
}

/// Runs the admin command channel: one `BesAdminCmd` document per
/// connection, processed with the supervisor lock held for the duration
/// of the document (spec §4.7's "signals blocked" requirement is
/// approximated here by serializing admin processing through the mutex).
pub fn run_admin_channel(
    port: Option<u16>,
    state: Arc<Mutex<SupervisorState>>,
    registry: Arc<Mutex<ConfigRegistry>>,
    contexts: Arc<Mutex<DebugContexts>>,
    log_file: Option<String>,
) -> anyhow::Result<()> {
    let listener = TcpSocketListener::bind(port.unwrap_or(DEFAULT_ADMIN_PORT)).context("binding admin listener")?;
    info!("admin channel listening on {}", listener.description());

    loop {
        let transport = listener.accept().context("accepting admin connection")?;
        let mut session = Session::new(transport);
        if let Err(e) = session.server_handshake() {
            warn!("admin handshake failed: {e}");
            continue;
        }

        let (_extensions, payload) = match session.receive_message() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("reading admin command: {e}");
                continue;
            }
        };
        let xml = String::from_utf8_lossy(&payload).to_string();

        let (response, should_exit, status) = {
            let mut supervisor = state.lock().unwrap();
            let mut registry = registry.lock().unwrap();
            let mut contexts = contexts.lock().unwrap();
            admin::process_document(&xml, &mut *supervisor, &mut registry, &mut contexts, log_file.as_deref())
        };

        if let Err(e) = session.send(&response_extensions(status), response.as_bytes()) {
            warn!("sending admin response: {e}");
        }

        if should_exit {
            info!("admin Exit command received, shutting down supervisor");
            let mut supervisor = state.lock().unwrap();
            let _ = supervisor.stop_master();
            return Ok(());
        }
    }
}

/// Top-level supervisor entrypoint: writes the supervisor's own pid file,
/// launches the master worker, then runs the admin channel on the
/// calling thread while a background thread reaps and (conditionally)
/// relaunches the master worker.
pub fn run(
    pid_dir: PathBuf,
    admin_port: Option<u16>,
    launch_spec: MasterLaunchSpec,
    config_files: std::collections::BTreeMap<String, String>,
    debug_spec: Option<String>,
    log_file: Option<String>,
) -> anyhow::Result<()> {
    let _pid_file =
        PidFile::write(pid_dir.join(SUPERVISOR_PID_FILE)).context("writing supervisor pid file")?;

    let mut state = SupervisorState::new(launch_spec);
    state.launch().context("launching initial master worker")?;
    let state = Arc::new(Mutex::new(state));

    let registry = Arc::new(Mutex::new(ConfigRegistry::from_map(config_files)));
    let contexts = Arc::new(Mutex::new(
        debug_spec.as_deref().map(DebugContexts::from_spec).unwrap_or_default(),
    ));

    let watcher_state = Arc::clone(&state);
    thread::spawn(move || watch_master(watcher_state));

    run_admin_channel(admin_port, state, registry, contexts, log_file)
}
