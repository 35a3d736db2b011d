// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::Settings;
use crate::errors::{OpenError, SocketError};
use crate::fd_cache::{FileIndex, FileSlotCache, OwnerId, PreallocationMode};

use socket2::{Domain, Socket, Type};
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::SystemTime;

use tracing::{event, Level};

pub const DEFAULT_PEER_LIMIT: usize = 200;

// The largest descriptor a select()-based event loop can watch.
pub const DEFAULT_MAX_OPEN_FILES: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorLimits {
    pub file_cache_size: usize,
    pub socket_limit: usize,
    pub max_open_files: u64,
}

impl Default for GovernorLimits {
    fn default() -> Self {
        Self {
            file_cache_size: crate::fd_cache::DEFAULT_FILE_CACHE_SIZE,
            socket_limit: DEFAULT_PEER_LIMIT,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

impl From<&Settings> for GovernorLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            file_cache_size: settings.file_cache_size,
            socket_limit: settings.peer_limit,
            max_open_files: settings.max_open_files,
        }
    }
}

/// Session-scoped owner of every cached file handle and the peer socket
/// count.
///
/// All operations take `&mut self`: whoever owns the governor is the
/// session's serialization point, and handles are only ever lent out for
/// the duration of a borrow.
#[derive(Debug)]
pub struct ResourceGovernor {
    limits: GovernorLimits,
    cache: Option<FileSlotCache>,
    open_socket_count: usize,
    buffers_logged: bool,
}

impl ResourceGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            cache: None,
            open_socket_count: 0,
            buffers_logged: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cache.is_some()
    }

    /// Builds the file cache and raises the descriptor limit on first use.
    pub fn ensure_initialized(&mut self) {
        self.cache();
    }

    fn cache(&mut self) -> &mut FileSlotCache {
        let capacity = self.limits.file_cache_size;
        let max_open_files = self.limits.max_open_files;
        self.cache.get_or_insert_with(|| {
            raise_open_file_limit(max_open_files);
            FileSlotCache::new(capacity)
        })
    }

    /// Lends the handle for a file, opening it if it isn't cached.
    pub fn checkout_file(
        &mut self,
        owner_id: OwnerId,
        file_index: FileIndex,
        path: &Path,
        writable: bool,
        preallocation: PreallocationMode,
        expected_size: u64,
    ) -> Result<&mut File, OpenError> {
        self.cache().checkout(
            owner_id,
            file_index,
            path,
            writable,
            preallocation,
            expected_size,
        )
    }

    /// A handle that is already open, or `None`. Never opens a file.
    pub fn cached_file(
        &mut self,
        owner_id: OwnerId,
        file_index: FileIndex,
        writable: bool,
    ) -> Option<&mut File> {
        self.cache().get_cached(owner_id, file_index, writable)
    }

    /// Flushes and closes a file. Releasing a file that isn't open is fine.
    pub fn release_file(&mut self, owner_id: OwnerId, file_index: FileIndex) {
        if let Some(slot) = self.cache().lookup(owner_id, file_index) {
            slot.flush_and_close();
        }
    }

    pub fn cached_mtime(
        &mut self,
        owner_id: OwnerId,
        file_index: FileIndex,
    ) -> Option<SystemTime> {
        self.cache()
            .lookup(owner_id, file_index)
            .and_then(|slot| slot.modified_time())
    }

    /// Closes every handle a transfer holds, e.g. when it is stopped or
    /// removed.
    pub fn close_owner(&mut self, owner_id: OwnerId) {
        self.cache().close_owner(owner_id);
    }

    pub fn open_file_count(&self) -> usize {
        self.cache.as_ref().map_or(0, FileSlotCache::open_count)
    }

    pub fn open_socket_count(&self) -> usize {
        self.open_socket_count
    }

    pub fn socket_limit(&self) -> usize {
        self.limits.socket_limit
    }

    /// Takes effect for the next create or accept. Sockets already over a
    /// lowered limit stay open.
    pub fn set_socket_limit(&mut self, limit: usize) {
        self.limits.socket_limit = limit;
    }

    pub fn create_socket(&mut self, domain: Domain, ty: Type) -> Result<Socket, SocketError> {
        self.ensure_initialized();

        if self.open_socket_count >= self.limits.socket_limit {
            return Err(SocketError::SocketCapExceeded {
                limit: self.limits.socket_limit,
            });
        }

        let socket = Socket::new(domain, ty, None).map_err(|e| {
            if !is_address_family_unsupported(&e) {
                event!(Level::ERROR, "Couldn't create socket: {}", e);
            }
            SocketError::SocketCreateFailed(e)
        })?;

        self.open_socket_count += 1;
        self.log_buffer_sizes_once(&socket);
        Ok(socket)
    }

    /// Accepts the next pending connection. The OS-level accept always
    /// happens; connections over the peer limit, or from something that is
    /// not an IP peer, are closed again straight away.
    pub fn accept_socket(
        &mut self,
        listener: &Socket,
    ) -> Result<(Socket, SocketAddr), SocketError> {
        self.ensure_initialized();

        let (socket, address) = listener.accept().map_err(SocketError::AcceptFailed)?;

        if self.open_socket_count >= self.limits.socket_limit {
            event!(
                Level::DEBUG,
                "Dropping incoming connection, peer limit {} reached",
                self.limits.socket_limit
            );
            drop(socket);
            return Err(SocketError::SocketCapExceeded {
                limit: self.limits.socket_limit,
            });
        }

        let Some(peer) = address.as_socket() else {
            drop(socket);
            return Err(SocketError::AddressDecodeFailed);
        };

        self.open_socket_count += 1;
        Ok((socket, peer))
    }

    pub fn close_socket(&mut self, socket: Socket) {
        drop(socket);
        debug_assert!(
            self.open_socket_count > 0,
            "closed more sockets than were opened"
        );
        self.open_socket_count = self.open_socket_count.saturating_sub(1);
    }

    fn log_buffer_sizes_once(&mut self, socket: &Socket) {
        if self.buffers_logged {
            return;
        }
        self.buffers_logged = true;
        if let Ok(size) = socket.send_buffer_size() {
            event!(Level::DEBUG, "SO_SNDBUF size is {}", size);
        }
        if let Ok(size) = socket.recv_buffer_size() {
            event!(Level::DEBUG, "SO_RCVBUF size is {}", size);
        }
    }

    /// Closes every cached file and ends the session's use of the governor.
    pub fn teardown(mut self) {
        if let Some(mut cache) = self.cache.take() {
            let open = cache.open_count();
            cache.close_all();
            event!(Level::INFO, "Closed {} cached file handles", open);
        }
        if self.open_socket_count > 0 {
            event!(
                Level::WARN,
                "Governor torn down with {} sockets still counted as open",
                self.open_socket_count
            );
        }
    }
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new(GovernorLimits::default())
    }
}

#[cfg(unix)]
fn is_address_family_unsupported(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EAFNOSUPPORT)
}

#[cfg(windows)]
fn is_address_family_unsupported(e: &io::Error) -> bool {
    const WSAEAFNOSUPPORT: i32 = 10047;
    e.raw_os_error() == Some(WSAEAFNOSUPPORT)
}

#[cfg(not(any(unix, windows)))]
fn is_address_family_unsupported(_e: &io::Error) -> bool {
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLimitChange {
    pub from: u64,
    pub to: u64,
}

/// Soft and hard `RLIMIT_NOFILE`.
#[cfg(unix)]
pub fn current_open_file_limit() -> io::Result<(u64, u64)> {
    rlimit::Resource::NOFILE.get()
}

#[cfg(not(unix))]
pub fn current_open_file_limit() -> io::Result<(u64, u64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "open file limits are not adjustable on this platform",
    ))
}

/// Raises the soft descriptor limit to `min(hard, ceiling)`. Never lowers it.
#[cfg(unix)]
pub fn raise_open_file_limit(ceiling: u64) -> Option<FileLimitChange> {
    use rlimit::Resource;

    let (soft, hard) = match Resource::NOFILE.get() {
        Ok(limits) => limits,
        Err(e) => {
            event!(Level::WARN, "Couldn't read open file limit: {}", e);
            return None;
        }
    };

    let target = hard.min(ceiling);
    if target <= soft {
        return None;
    }

    if let Err(e) = Resource::NOFILE.set(target, hard) {
        event!(
            Level::WARN,
            "Couldn't raise open file limit from {} to {}: {}",
            soft,
            target,
            e
        );
        return None;
    }

    let applied = Resource::NOFILE.get().map(|(s, _)| s).unwrap_or(target);
    event!(
        Level::INFO,
        "Changed open file limit from {} to {}",
        soft,
        applied
    );
    Some(FileLimitChange {
        from: soft,
        to: applied,
    })
}

#[cfg(not(unix))]
pub fn raise_open_file_limit(_ceiling: u64) -> Option<FileLimitChange> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::SockAddr;
    use std::io::Write;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
    use tempfile::tempdir;

    fn governor_with_socket_limit(limit: usize) -> ResourceGovernor {
        ResourceGovernor::new(GovernorLimits {
            socket_limit: limit,
            ..GovernorLimits::default()
        })
    }

    fn loopback_listener() -> (Socket, SocketAddr) {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        let any_port = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        listener.bind(&SockAddr::from(any_port)).unwrap();
        listener.listen(16).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_lazy_initialization() {
        let mut governor = ResourceGovernor::default();
        assert!(!governor.is_initialized());
        assert_eq!(governor.open_file_count(), 0);

        governor.ensure_initialized();
        assert!(governor.is_initialized());
        governor.ensure_initialized();
        assert!(governor.is_initialized());
    }

    #[test]
    fn test_checkout_write_release_and_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t1").join("data.bin");
        let mut governor = ResourceGovernor::default();

        let file = governor
            .checkout_file(OwnerId(1), FileIndex(0), &path, true, PreallocationMode::Sparse, 64)
            .unwrap();
        file.write_all(b"payload").unwrap();

        assert_eq!(governor.open_file_count(), 1);
        assert!(governor.cached_mtime(OwnerId(1), FileIndex(0)).is_some());
        assert!(governor.cached_mtime(OwnerId(1), FileIndex(1)).is_none());

        governor.release_file(OwnerId(1), FileIndex(0));
        assert_eq!(governor.open_file_count(), 0);
        assert!(governor.cached_mtime(OwnerId(1), FileIndex(0)).is_none());

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 64);
        assert_eq!(&on_disk[..7], b"payload");

        // Releasing again is a no-op.
        governor.release_file(OwnerId(1), FileIndex(0));
        governor.teardown();
    }

    #[test]
    fn test_cached_file_never_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cached.bin");
        let mut governor = ResourceGovernor::default();

        assert!(governor.cached_file(OwnerId(3), FileIndex(0), false).is_none());
        governor
            .checkout_file(OwnerId(3), FileIndex(0), &path, true, PreallocationMode::None, 0)
            .unwrap();
        assert!(governor.cached_file(OwnerId(3), FileIndex(0), true).is_some());
        assert!(!dir.path().join("other.bin").exists());
    }

    #[test]
    fn test_oversized_file_truncated_on_checkout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![9u8; 1000]).unwrap();
        let mut governor = ResourceGovernor::default();

        governor
            .checkout_file(OwnerId(1), FileIndex(0), &path, false, PreallocationMode::Full, 100)
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
        assert!(governor.cached_file(OwnerId(1), FileIndex(0), true).is_some());
    }

    #[test]
    fn test_close_owner() {
        let dir = tempdir().unwrap();
        let mut governor = ResourceGovernor::default();

        for owner in 1..=2 {
            for index in 0..3 {
                let path = dir.path().join(format!("{}_{}.bin", owner, index));
                governor
                    .checkout_file(
                        OwnerId(owner),
                        FileIndex(index),
                        &path,
                        true,
                        PreallocationMode::None,
                        0,
                    )
                    .unwrap();
            }
        }
        governor.close_owner(OwnerId(2));

        assert_eq!(governor.open_file_count(), 3);
        assert!(governor.cached_file(OwnerId(2), FileIndex(0), false).is_none());
        assert!(governor.cached_file(OwnerId(1), FileIndex(0), false).is_some());
    }

    #[test]
    fn test_checkout_failure_is_typed() {
        let dir = tempdir().unwrap();
        let mut governor = ResourceGovernor::default();

        let err = governor
            .checkout_file(
                OwnerId(1),
                FileIndex(0),
                &dir.path().join("nope.bin"),
                false,
                PreallocationMode::None,
                1,
            )
            .unwrap_err();
        assert!(matches!(err, OpenError::OpenFailed { .. }));
        assert_eq!(governor.open_file_count(), 0);
    }

    #[test]
    fn test_create_socket_cap() {
        let mut governor = governor_with_socket_limit(50);
        let mut sockets = Vec::new();
        for _ in 0..50 {
            sockets.push(governor.create_socket(Domain::IPV4, Type::STREAM).unwrap());
        }
        assert_eq!(governor.open_socket_count(), 50);

        // An invalid domain would fail inside the OS; getting the cap error
        // instead shows the OS was never asked.
        let result = governor.create_socket(Domain::from(-1), Type::STREAM);
        assert!(matches!(
            result,
            Err(SocketError::SocketCapExceeded { limit: 50 })
        ));
        assert_eq!(governor.open_socket_count(), 50);

        for socket in sockets.drain(..10) {
            governor.close_socket(socket);
        }
        assert_eq!(governor.open_socket_count(), 40);
        assert!(governor.create_socket(Domain::IPV4, Type::STREAM).is_ok());
        assert_eq!(governor.open_socket_count(), 41);
    }

    #[test]
    fn test_create_socket_os_failure_does_not_count() {
        let mut governor = governor_with_socket_limit(5);
        let result = governor.create_socket(Domain::from(-1), Type::STREAM);
        assert!(matches!(result, Err(SocketError::SocketCreateFailed(_))));
        assert_eq!(governor.open_socket_count(), 0);
    }

    #[test]
    fn test_set_socket_limit() {
        let mut governor = governor_with_socket_limit(1);
        let _a = governor.create_socket(Domain::IPV4, Type::STREAM).unwrap();
        assert!(governor.create_socket(Domain::IPV4, Type::STREAM).is_err());

        governor.set_socket_limit(2);
        assert_eq!(governor.socket_limit(), 2);
        assert!(governor.create_socket(Domain::IPV4, Type::STREAM).is_ok());
    }

    #[test]
    fn test_accept_counts_and_caps() {
        let (listener, addr) = loopback_listener();
        let mut governor = governor_with_socket_limit(1);

        let _client1 = TcpStream::connect(addr).unwrap();
        let (accepted, peer) = governor.accept_socket(&listener).unwrap();
        assert_eq!(peer.ip(), addr.ip());
        assert_eq!(governor.open_socket_count(), 1);

        let _client2 = TcpStream::connect(addr).unwrap();
        let result = governor.accept_socket(&listener);
        assert!(matches!(
            result,
            Err(SocketError::SocketCapExceeded { limit: 1 })
        ));
        assert_eq!(governor.open_socket_count(), 1);

        // The rejected connection was still taken off the listen queue.
        listener.set_nonblocking(true).unwrap();
        match listener.accept() {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            Ok(_) => panic!("rejected connection was left pending"),
        }

        governor.close_socket(accepted);
        assert_eq!(governor.open_socket_count(), 0);
    }

    #[test]
    fn test_accept_failure_leaves_count() {
        let (listener, _addr) = loopback_listener();
        listener.set_nonblocking(true).unwrap();
        let mut governor = governor_with_socket_limit(4);

        let result = governor.accept_socket(&listener);
        assert!(matches!(result, Err(SocketError::AcceptFailed(_))));
        assert_eq!(governor.open_socket_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_accept_non_ip_peer_is_rejected() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("peer.sock");
        let listener = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
        listener.bind(&SockAddr::unix(&sock_path).unwrap()).unwrap();
        listener.listen(4).unwrap();
        let mut governor = governor_with_socket_limit(4);

        let _client = std::os::unix::net::UnixStream::connect(&sock_path).unwrap();
        let result = governor.accept_socket(&listener);
        assert!(matches!(result, Err(SocketError::AddressDecodeFailed)));
        assert_eq!(governor.open_socket_count(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "closed more sockets than were opened")]
    fn test_close_socket_underflow_panics_in_debug() {
        let mut governor = ResourceGovernor::default();
        let stray = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        governor.close_socket(stray);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_close_socket_underflow_clamps_in_release() {
        let mut governor = ResourceGovernor::default();
        let stray = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        governor.close_socket(stray);
        assert_eq!(governor.open_socket_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_raise_open_file_limit_never_lowers() {
        let (soft_before, _) = current_open_file_limit().unwrap();
        assert!(raise_open_file_limit(0).is_none());
        let (soft_after, _) = current_open_file_limit().unwrap();
        assert_eq!(soft_before, soft_after);
    }
}
