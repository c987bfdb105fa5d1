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

//! Per-signal policy for the master worker (spec §5): SIGHUP requests a
//! restart, SIGTERM requests a normal shutdown, SIGCHLD reaps exactly one
//! exited child without blocking, SIGINT is left at its default
//! disposition, and SIGPIPE is caught per-connection so a dead peer
//! becomes a flag on the session rather than a process-killing signal.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::{consts::signal::*, iterator::Signals};
use tracing::{info, warn};

/// Shared flags the accept loop polls between connections.
#[derive(Clone, Default)]
pub struct WorkerSignals {
    pub restart_requested: Arc<AtomicBool>,
    pub shutdown_requested: Arc<AtomicBool>,
}

impl WorkerSignals {
    /// Spawns the background thread that turns `SIGHUP`/`SIGTERM`/`SIGCHLD`
    /// into the flags the accept loop checks, and reaps children as they
    /// exit. Does not touch `SIGINT` or `SIGPIPE`.
    pub fn install() -> anyhow::Result<Self> {
        let flags = WorkerSignals::default();
        let mut signals =
            Signals::new([SIGHUP, SIGTERM, SIGCHLD]).context("registering worker signal set")?;

        let restart_requested = Arc::clone(&flags.restart_requested);
        let shutdown_requested = Arc::clone(&flags.shutdown_requested);
        thread::spawn(move || {
            for signal in &mut signals {
                match signal {
                    SIGHUP => {
                        info!("SIGHUP received, requesting restart");
                        restart_requested.store(true, Ordering::SeqCst);
                    }
                    SIGTERM => {
                        info!("SIGTERM received, requesting shutdown");
                        shutdown_requested.store(true, Ordering::SeqCst);
                    }
                    SIGCHLD => reap_one(),
                    _ => {}
                }
            }
        });

        Ok(flags)
    }
}

/// Reaps a single exited child, if any is available, without blocking.
/// Matches the original's one-shot `waitpid(WNOHANG)` inside its SIGCHLD
/// handler: a burst of child exits only guarantees one SIGCHLD delivery,
/// so callers that fork many children should also reap opportunistically
/// between accepts.
fn reap_one() {
    match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(pid, code)) => info!("reaped child {pid} (exit {code})"),
        Ok(WaitStatus::Signaled(pid, sig, _)) => info!("reaped child {pid} (signal {sig:?})"),
        Ok(_) => {}
        Err(nix::errno::Errno::ECHILD) => {}
        Err(e) => warn!("waitpid failed: {e}"),
    }
}

/// Reaps any number of currently-exited children without blocking. Used
/// by the accept loop itself to drain the zombie backlog it couldn't
/// catch between individual SIGCHLD deliveries.
pub fn reap_all_available() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// Installs a per-connection `SIGPIPE` handler backed by a private flag,
/// so a write to a dead peer in this forked child sets the flag instead of
/// killing the process. Called once at the top of each connection child.
pub fn install_sigpipe_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGPIPE, Arc::clone(&flag)).context("registering SIGPIPE flag")?;
    Ok(flag)
}
