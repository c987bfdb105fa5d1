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

//! A socket abstraction unifying TCP and Unix-domain stream sockets behind
//! one capability set, so the session and listener layers don't need to
//! care which transport they're riding on.

use std::{
    io,
    net::{TcpListener as StdTcpListener, TcpStream},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, RawFd},
    os::unix::net::{UnixListener as StdUnixListener, UnixStream},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::consts::UNIX_SOCKET_BUFFER_SIZE;

/// One end of a connected stream socket, TCP or Unix.
pub trait Transport: io::Read + io::Write + Send {
    fn recv_chunk_size(&self) -> usize;
    fn send_chunk_size(&self) -> usize;
    fn close(&mut self) -> io::Result<()>;
    fn peer_description(&self) -> String;
    /// Blocks up to `timeout` waiting for the transport to become readable.
    /// Used by the session handshake's one-second poll ticks.
    fn poll_readable(&self, timeout: Duration) -> io::Result<bool>;
}

/// A bound, listening socket that can accept new [`Transport`]s.
pub trait Listener: AsRawFd {
    fn accept(&self) -> io::Result<Box<dyn Transport>>;
    fn description(&self) -> String;
}

impl Transport for Box<dyn Transport> {
    fn recv_chunk_size(&self) -> usize {
        (**self).recv_chunk_size()
    }
    fn send_chunk_size(&self) -> usize {
        (**self).send_chunk_size()
    }
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
    fn peer_description(&self) -> String {
        (**self).peer_description()
    }
    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        (**self).poll_readable(timeout)
    }
}

/// Polls a single raw fd for readability, the way `listener.rs` polls a set
/// of them.
fn poll_fd_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    match poll(&mut fds, timeout) {
        Ok(n) => Ok(n > 0 && fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN)),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

fn socket_buffer_size(fd: RawFd, opt: libc::c_int) -> io::Result<usize> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value.max(0) as usize)
}

/// Bytes reserved for chunk-header overhead so a single read never splits a
/// header across two syscalls (`original_source/ppt/PPTConnection.h`'s
/// `PPT_CHUNK_HEADER_SPACE`).
const HEADER_RESERVE: usize = ppt_protocol::HEADER_RESERVE;

pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into());
        Ok(TcpTransport { stream, peer })
    }
}

impl io::Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl io::Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn recv_chunk_size(&self) -> usize {
        socket_buffer_size(self.stream.as_raw_fd(), libc::SO_RCVBUF)
            .map(|n| n.saturating_sub(HEADER_RESERVE))
            .unwrap_or(UNIX_SOCKET_BUFFER_SIZE)
    }

    fn send_chunk_size(&self) -> usize {
        socket_buffer_size(self.stream.as_raw_fd(), libc::SO_SNDBUF)
            .map(|n| n.saturating_sub(HEADER_RESERVE))
            .unwrap_or(UNIX_SOCKET_BUFFER_SIZE)
    }

    fn close(&mut self) -> io::Result<()> {
        // Idempotent: shutdown() on an already-closed socket is a harmless
        // ENOTCONN, which we don't care about.
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    fn peer_description(&self) -> String {
        format!("tcp:{}", self.peer)
    }

    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        poll_fd_readable(self.stream.as_raw_fd(), timeout)
    }
}

pub struct TcpSocketListener {
    listener: StdTcpListener,
    addr: String,
}

impl TcpSocketListener {
    /// Binds with `SO_REUSEADDR`, matching
    /// `original_source/ppt/TcpSocket.cc`'s `listen()`.
    pub fn bind(port: u16) -> anyhow::Result<Self> {
        use nix::sys::socket::{
            bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
            SockaddrIn,
        };

        let fd = socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None)?;
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        let addr = SockaddrIn::new(0, 0, 0, 0, port);
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(128)?)?;

        let listener = unsafe { StdTcpListener::from_raw_fd(fd.as_raw_fd()) };
        std::mem::forget(fd); // ownership transferred to `listener`
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
        Ok(TcpSocketListener { listener, addr: format!("0.0.0.0:{bound_port}") })
    }
}

impl AsRawFd for TcpSocketListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Listener for TcpSocketListener {
    fn accept(&self) -> io::Result<Box<dyn Transport>> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => return Ok(Box::new(TcpTransport::new(stream)?)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn description(&self) -> String {
        format!("tcp:{}", self.addr)
    }
}

pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    fn new(stream: UnixStream) -> Self {
        UnixTransport { stream }
    }
}

impl io::Read for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl io::Write for UnixTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for UnixTransport {
    fn recv_chunk_size(&self) -> usize {
        UNIX_SOCKET_BUFFER_SIZE - HEADER_RESERVE
    }

    fn send_chunk_size(&self) -> usize {
        UNIX_SOCKET_BUFFER_SIZE - HEADER_RESERVE
    }

    fn close(&mut self) -> io::Result<()> {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    fn peer_description(&self) -> String {
        "unix".to_string()
    }

    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        poll_fd_readable(self.stream.as_raw_fd(), timeout)
    }
}

pub struct UnixSocketListener {
    listener: StdUnixListener,
    path: PathBuf,
}

impl UnixSocketListener {
    /// Unlinks any stale socket file at `path` before binding, and unlinks
    /// the path again on drop, matching `original_source/ppt/UnixSocket.cc`.
    pub fn bind(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = StdUnixListener::bind(path)?;
        Ok(UnixSocketListener { listener, path: path.to_path_buf() })
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl AsRawFd for UnixSocketListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Listener for UnixSocketListener {
    fn accept(&self) -> io::Result<Box<dyn Transport>> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => return Ok(Box::new(UnixTransport::new(stream))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn description(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

impl<'a> AsFd for &'a dyn Listener {
    fn as_fd(&self) -> BorrowedFd<'a> {
        unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }
}
