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

//! Multiplexes `accept()` across a fixed set of listening sockets, the way
//! `original_source/ppt/SocketListener.cc` uses `select` over its
//! `_socket_list`. We use `poll` instead of `select` since it's the idiom
//! the rest of this codebase already reaches for (see `daemon/pager.rs`).

use std::os::fd::AsRawFd;

use anyhow::{anyhow, Context};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::{
    consts::ACCEPT_POLL_TIMEOUT,
    socket::{Listener, Transport},
};

/// An immutable (once accepting begins) collection of bound listeners
/// sharing one `accept_any()` loop.
pub struct ListenerSet {
    listeners: Vec<Box<dyn Listener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        ListenerSet { listeners: Vec::new() }
    }

    /// Registers a listener. Must not be called once `accept_any` has run.
    pub fn add(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Blocks until one of the registered listeners is readable, accepts
    /// exactly one connection from it, and returns the connection along
    /// with the index of the listener it came from.
    ///
    /// Ties are broken by insertion order; there is no starvation guarantee
    /// across listeners.
    pub fn accept_any(&self) -> anyhow::Result<(Box<dyn Transport>, usize)> {
        if self.listeners.is_empty() {
            return Err(anyhow!("accept_any called with no registered listeners"));
        }

        let timeout = PollTimeout::try_from(ACCEPT_POLL_TIMEOUT)
            .unwrap_or(PollTimeout::MAX);

        loop {
            let mut fds: Vec<PollFd> = self
                .listeners
                .iter()
                .map(|l| PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(l.as_raw_fd()) }, PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, timeout) {
                Ok(0) => continue, // timed out, re-enter the wait
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => continue,
                Err(e) => return Err(anyhow::Error::from(e)).context("polling listener set"),
            }

            for (idx, fd) in fds.iter().enumerate() {
                if fd.revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
                    let transport = self.listeners[idx].accept().context("accepting connection")?;
                    return Ok((transport, idx));
                }
            }
        }
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.description()).collect()
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}
