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

use std::time::Duration;

/// How long the multi-socket listener blocks in a single `poll` call before
/// re-entering the wait.
pub const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of one-second ticks the session handshake polls for
/// readability before failing with `HandshakeTimeout`.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Fixed receive/send buffer size reported by Unix-domain sockets.
pub const UNIX_SOCKET_BUFFER_SIZE: usize = 65535;

/// The file descriptor the supervisor holds open as the write end of the
/// startup-handshake pipe, inherited by the master worker at fork/exec time.
pub const MASTER_STARTUP_FD: i32 = 4;

/// Size, in bytes, of the startup status word the master worker writes to
/// `MASTER_STARTUP_FD`.
pub const STARTUP_STATUS_WORD_LEN: usize = 4;

/// Default TCP port for the admin command channel.
pub const DEFAULT_ADMIN_PORT: u16 = 11002;

/// PID file name written by the supervisor, relative to the configured
/// state directory.
pub const SUPERVISOR_PID_FILE: &str = "bes.pid";

/// PID file name written by the master worker, relative to the configured
/// state directory.
pub const MASTER_PID_FILE: &str = "beslistener.pid";

/// File mode applied to PID files (`PID: <n> UID: <n>`).
pub const PID_FILE_MODE: u32 = 0o644;
