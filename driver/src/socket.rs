//! Connection-mode datagram sockets between the host and the VMs, carried
//! over the primary's mailbox.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use crossbeam::epoch::{self, Atomic, Owned};
use parking_lot::{Condvar, Mutex};
use peregrine::config::MAILBOX_SIZE;
use peregrine::ffa::{FfaError, FfaValue};
use peregrine::vm::{VmId, PRIMARY_VM_ID};

use crate::config::{DEFAULT_SEND_QUOTA, PORT_HASH_BITS};
use crate::dispatcher::Dispatcher;

/// Address family of peregrine sockets.
pub const AF_PG: u16 = 19;

/// `{src_port, dst_port}`, both little-endian.
pub const HEADER_SIZE: usize = 16;
pub const MAX_PAYLOAD: usize = MAILBOX_SIZE - HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SockError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("peer VM is unreachable")]
    PeerUnreachable,
    #[error("message too long")]
    MessageTooLarge,
    #[error("operation would block")]
    WouldBlock,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("operation not supported")]
    NotSupported,
    #[error("socket type not supported")]
    TypeNotSupported,
    #[error("protocol not supported")]
    ProtocolNotSupported,
    #[error("no such device or address")]
    NoDevice,
    #[error("input/output error")]
    Io,
    #[error("quota exceeded")]
    QuotaExceeded,
}

impl SockError {
    /// The Linux errno for this error, as a positive number.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotConnected => 107,
            Self::AlreadyConnected => 106,
            Self::PeerUnreachable => 101,
            Self::MessageTooLarge => 90,
            Self::WouldBlock => 11,
            Self::InvalidArgument => 22,
            Self::PermissionDenied => 1,
            Self::NotSupported => 95,
            Self::TypeNotSupported => 94,
            Self::ProtocolNotSupported => 93,
            Self::NoDevice => 6,
            Self::Io => 5,
            Self::QuotaExceeded => 122,
        }
    }

    fn from_send(ret: FfaValue) -> Self {
        match ret.error_code() {
            Some(FfaError::InvalidParameters) => Self::NoDevice,
            Some(FfaError::NotSupported) => Self::Io,
            _ => Self::WouldBlock,
        }
    }
}

pub type SockResult<T = ()> = Result<T, SockError>;

bitflags! {
    pub struct MsgFlags: u32 {
        const OOB = 0x1;
        const TRUNC = 0x20;
        const DONTWAIT = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
    Raw,
    SeqPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    Unconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub family: u16,
    pub vm_id: VmId,
    pub port: u64,
}

impl SockAddr {
    pub fn new(vm_id: VmId, port: u64) -> Self {
        Self {
            family: AF_PG,
            vm_id,
            port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MsgHeader {
    src_port: u64,
    dst_port: u64,
}

impl MsgHeader {
    fn parse(message: &[u8]) -> Option<Self> {
        let src: [u8; 8] = message.get(..8)?.try_into().ok()?;
        let dst: [u8; 8] = message.get(8..HEADER_SIZE)?.try_into().ok()?;
        Some(Self {
            src_port: u64::from_le_bytes(src),
            dst_port: u64::from_le_bytes(dst),
        })
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.src_port.to_le_bytes());
        buf.extend_from_slice(&self.dst_port.to_le_bytes());
    }
}

/// Fixed once the socket is connected.
#[derive(Debug, Clone, Copy)]
struct Connection {
    local_port: u64,
    remote_port: u64,
    peer: VmId,
}

#[derive(Default)]
struct RecvQueue {
    datagrams: VecDeque<Vec<u8>>,
    bytes: usize,
    shutdown: bool,
}

struct SendQuota {
    used: usize,
    shutdown: bool,
}

struct SockInner {
    state: Mutex<SockState>,
    conn: OnceLock<Connection>,
    rx: Mutex<RecvQueue>,
    rx_ready: Condvar,
    tx: Mutex<SendQuota>,
    tx_ready: Condvar,
    quota: usize,
}

impl SockInner {
    fn new(quota: usize) -> Self {
        Self {
            state: Mutex::new(SockState::Unconnected),
            conn: OnceLock::new(),
            rx: Mutex::new(RecvQueue::default()),
            rx_ready: Condvar::new(),
            tx: Mutex::new(SendQuota {
                used: 0,
                shutdown: false,
            }),
            tx_ready: Condvar::new(),
            quota,
        }
    }

    fn is_from(&self, sender: VmId, src_port: u64) -> bool {
        self.conn
            .get()
            .map_or(false, |c| c.peer == sender && c.remote_port == src_port)
    }

    fn queue_rcv(&self, payload: &[u8]) -> bool {
        let mut rx = self.rx.lock();
        if rx.shutdown || rx.bytes + payload.len() > self.quota {
            return false;
        }
        rx.bytes += payload.len();
        rx.datagrams.push_back(payload.to_vec());
        self.rx_ready.notify_all();
        true
    }

    /// Charges `size` bytes to the send quota.
    fn charge(&self, size: usize, nonblock: bool) -> SockResult {
        let mut tx = self.tx.lock();
        // Like the Linux send buffer: admitted while anything is left.
        while tx.used >= self.quota {
            if tx.shutdown {
                return Err(SockError::NotConnected);
            }
            if nonblock {
                return Err(SockError::WouldBlock);
            }
            self.tx_ready.wait(&mut tx);
        }
        tx.used += size;
        Ok(())
    }

    fn uncharge(&self, size: usize) {
        self.tx.lock().used -= size;
        self.tx_ready.notify_one();
    }

    fn shutdown(&self) {
        self.rx.lock().shutdown = true;
        self.rx_ready.notify_all();
        self.tx.lock().shutdown = true;
        self.tx_ready.notify_all();
    }
}

impl Drop for SockInner {
    fn drop(&mut self) {
        let rx = self.rx.get_mut();
        if !rx.datagrams.is_empty() {
            debug!("purging {} unread datagrams", rx.datagrams.len());
        }
        rx.datagrams.clear();
    }
}

struct PortNode {
    port: u64,
    sock: Arc<SockInner>,
    next: Atomic<PortNode>,
}

/// Connected sockets by local port. Lookups are lock-free; changes are
/// serialized by a spin lock and nodes are freed once no reader can see
/// them.
struct PortHash {
    buckets: Vec<Atomic<PortNode>>,
    lock: spin::Mutex<()>,
}

impl PortHash {
    fn new() -> Self {
        Self {
            buckets: (0..1 << PORT_HASH_BITS).map(|_| Atomic::null()).collect(),
            lock: spin::Mutex::new(()),
        }
    }

    fn bucket(&self, port: u64) -> &Atomic<PortNode> {
        &self.buckets[port as usize & (self.buckets.len() - 1)]
    }

    fn insert(&self, port: u64, sock: Arc<SockInner>) {
        let _locked = self.lock.lock();
        let guard = epoch::pin();
        let bucket = self.bucket(port);
        let node = Owned::new(PortNode {
            port,
            sock,
            next: Atomic::null(),
        });
        node.next
            .store(bucket.load(Ordering::Acquire, &guard), Ordering::Relaxed);
        bucket.store(node, Ordering::Release);
    }

    fn remove(&self, port: u64, sock: &Arc<SockInner>) -> bool {
        let _locked = self.lock.lock();
        let guard = epoch::pin();
        let mut link = self.bucket(port);
        loop {
            let cur = link.load(Ordering::Acquire, &guard);
            // SAFETY: nodes are only freed through `defer_destroy`, and we
            // hold a guard.
            let node = match unsafe { cur.as_ref() } {
                Some(node) => node,
                None => return false,
            };
            if node.port == port && Arc::ptr_eq(&node.sock, sock) {
                link.store(node.next.load(Ordering::Acquire, &guard), Ordering::Release);
                // SAFETY: unlinked above, so no new reader can reach it.
                unsafe { guard.defer_destroy(cur) };
                guard.flush();
                return true;
            }
            link = &node.next;
        }
    }

    fn find(&self, port: u64, mut pred: impl FnMut(&SockInner) -> bool) -> Option<Arc<SockInner>> {
        let guard = epoch::pin();
        let mut cur = self.bucket(port).load(Ordering::Acquire, &guard);
        // SAFETY: the guard keeps every reachable node alive.
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.port == port && pred(&node.sock) {
                return Some(node.sock.clone());
            }
            cur = node.next.load(Ordering::Acquire, &guard);
        }
        None
    }
}

impl Drop for PortHash {
    fn drop(&mut self) {
        // SAFETY: `&mut self`, so there are no concurrent readers.
        unsafe {
            let guard = epoch::unprotected();
            for bucket in &self.buckets {
                let mut cur = bucket.load(Ordering::Relaxed, guard);
                while !cur.is_null() {
                    let next = cur.deref().next.load(Ordering::Relaxed, guard);
                    drop(cur.into_owned());
                    cur = next;
                }
            }
        }
    }
}

/// Host-wide socket state: the port hash, the port counter and the lock
/// serializing use of the primary's TX buffer.
pub struct SocketTable {
    next_port: AtomicU64,
    ports: PortHash,
    send_lock: spin::Mutex<()>,
    send_quota: usize,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    pub fn new() -> Self {
        Self::with_send_quota(DEFAULT_SEND_QUOTA)
    }

    pub fn with_send_quota(send_quota: usize) -> Self {
        Self {
            next_port: AtomicU64::new(0),
            ports: PortHash::new(),
            send_lock: spin::Mutex::new(()),
            send_quota,
        }
    }

    fn alloc_port(&self) -> u64 {
        self.next_port.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Routes a datagram from `sender` to the connected socket it is
    /// addressed to. Malformed or unroutable datagrams are dropped.
    pub fn handle_message(&self, sender: VmId, message: &[u8]) {
        let header = match MsgHeader::parse(message) {
            Some(header) => header,
            None => {
                error!(
                    "Message received without header of length {}",
                    message.len()
                );
                return;
            }
        };
        let sock = self
            .ports
            .find(header.dst_port, |s| s.is_from(sender, header.src_port));
        match sock {
            Some(sock) => {
                // No room to tell the sender: the datagram is lost.
                if !sock.queue_rcv(&message[HEADER_SIZE..]) {
                    warn!(
                        "dropped {} bytes from VM {} port {} to port {}",
                        message.len() - HEADER_SIZE,
                        sender,
                        header.src_port,
                        header.dst_port
                    );
                }
            }
            None => debug!(
                "no socket for VM {} port {} -> port {}",
                sender, header.src_port, header.dst_port
            ),
        }
    }
}

/// A peregrine socket. Dropping it releases it.
pub struct Socket {
    inner: Arc<SockInner>,
    host: Arc<Dispatcher>,
}

impl Socket {
    pub(crate) fn create(
        host: Arc<Dispatcher>,
        kind: SockType,
        protocol: u32,
        privileged: bool,
    ) -> SockResult<Self> {
        if kind != SockType::Datagram {
            return Err(SockError::TypeNotSupported);
        }
        if protocol != 0 {
            return Err(SockError::ProtocolNotSupported);
        }
        if !privileged {
            return Err(SockError::PermissionDenied);
        }
        let quota = host.sockets().send_quota;
        Ok(Self {
            inner: Arc::new(SockInner::new(quota)),
            host,
        })
    }

    pub fn state(&self) -> SockState {
        *self.inner.state.lock()
    }

    pub fn local_port(&self) -> Option<u64> {
        self.inner.conn.get().map(|c| c.local_port)
    }

    pub fn peer(&self) -> Option<SockAddr> {
        self.inner
            .conn
            .get()
            .map(|c| SockAddr::new(c.peer, c.remote_port))
    }

    fn connection(&self) -> SockResult<Connection> {
        self.inner.conn.get().copied().ok_or(SockError::NotConnected)
    }

    /// Connects to `addr` and takes a fresh local port.
    pub fn connect(&self, addr: &SockAddr) -> SockResult {
        if addr.family != AF_PG {
            return Err(SockError::InvalidArgument);
        }
        if self.host.core().vms().find(addr.vm_id).is_none() {
            return Err(SockError::PeerUnreachable);
        }

        let mut state = self.inner.state.lock();
        if *state != SockState::Unconnected {
            return Err(SockError::AlreadyConnected);
        }
        let sockets = self.host.sockets();
        let conn = Connection {
            local_port: sockets.alloc_port(),
            remote_port: addr.port,
            peer: addr.vm_id,
        };
        if self.inner.conn.set(conn).is_err() {
            return Err(SockError::AlreadyConnected);
        }
        *state = SockState::Connected;
        sockets.ports.insert(conn.local_port, self.inner.clone());
        debug!(
            "socket {} connected to VM {} port {}",
            conn.local_port, conn.peer, conn.remote_port
        );
        Ok(())
    }

    /// Sends `payload` as one datagram to the connected peer.
    pub fn sendmsg(&self, payload: &[u8], dest: Option<&SockAddr>, flags: MsgFlags) -> SockResult<usize> {
        if payload.len() > MAX_PAYLOAD {
            return Err(SockError::MessageTooLarge);
        }
        // The peer is implicit.
        if dest.is_some() {
            return Err(SockError::AlreadyConnected);
        }
        if flags.contains(MsgFlags::OOB) {
            return Err(SockError::NotSupported);
        }
        let conn = self.connection()?;

        let size = HEADER_SIZE + payload.len();
        self.inner
            .charge(size, flags.contains(MsgFlags::DONTWAIT))?;
        let mut datagram = Vec::with_capacity(size);
        MsgHeader {
            src_port: conn.local_port,
            dst_port: conn.remote_port,
        }
        .write(&mut datagram);
        datagram.extend_from_slice(payload);

        let res = self.send_datagram(&conn, &datagram);
        self.inner.uncharge(size);
        res.map(|_| payload.len())
    }

    fn send_datagram(&self, conn: &Connection, datagram: &[u8]) -> SockResult {
        let sockets = self.host.sockets();
        if conn.peer == PRIMARY_VM_ID {
            sockets.handle_message(PRIMARY_VM_ID, datagram);
            return Ok(());
        }

        let core = self.host.core();
        let ret = {
            let _locked = sockets.send_lock.lock();
            if let Err(e) = core.write_tx(PRIMARY_VM_ID, 0, datagram) {
                error!("cannot fill the send buffer: {:?}", e);
                return Err(SockError::Io);
            }
            core.msg_send(PRIMARY_VM_ID, conn.peer, datagram.len() as u32, false)
        };
        if ret.is_error() {
            return Err(SockError::from_send(ret));
        }
        // Make sure the peer runs to pick it up.
        self.host.deliver_message(conn.peer);
        Ok(())
    }

    /// Receives one datagram into `buf`. Returns the bytes copied and
    /// `MsgFlags::TRUNC` if the datagram did not fit. A shut down socket
    /// with nothing queued reads 0 bytes.
    pub fn recvmsg(&self, buf: &mut [u8], flags: MsgFlags) -> SockResult<(usize, MsgFlags)> {
        self.connection()?;
        let datagram = {
            let mut rx = self.inner.rx.lock();
            loop {
                if let Some(datagram) = rx.datagrams.pop_front() {
                    rx.bytes -= datagram.len();
                    break datagram;
                }
                if rx.shutdown {
                    return Ok((0, MsgFlags::empty()));
                }
                if flags.contains(MsgFlags::DONTWAIT) {
                    return Err(SockError::WouldBlock);
                }
                self.inner.rx_ready.wait(&mut rx);
            }
        };

        let mut out = MsgFlags::empty();
        let mut copy_len = datagram.len();
        if copy_len > buf.len() {
            copy_len = buf.len();
            out |= MsgFlags::TRUNC;
        }
        if copy_len > i32::MAX as usize {
            copy_len = i32::MAX as usize;
            out |= MsgFlags::TRUNC;
        }
        buf[..copy_len].copy_from_slice(&datagram[..copy_len]);
        Ok((copy_len, out))
    }

    pub fn bind(&self, _addr: &SockAddr) -> SockResult {
        Err(SockError::NotSupported)
    }

    pub fn listen(&self, _backlog: u32) -> SockResult {
        Err(SockError::NotSupported)
    }

    pub fn accept(&self) -> SockResult<Socket> {
        Err(SockError::NotSupported)
    }

    pub fn shutdown(&self) -> SockResult {
        Err(SockError::NotSupported)
    }

    pub fn setsockopt(&self, _level: i32, _name: i32, _value: &[u8]) -> SockResult {
        Err(SockError::NotSupported)
    }

    pub fn ioctl(&self, _cmd: u32, _arg: usize) -> SockResult<usize> {
        Err(SockError::NotSupported)
    }

    pub fn mmap(&self, _len: usize) -> SockResult<usize> {
        Err(SockError::NotSupported)
    }

    pub fn sendpage(&self, _page: &[u8], _flags: MsgFlags) -> SockResult<usize> {
        Err(SockError::NotSupported)
    }

    /// Shuts the socket down and unhashes it. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.inner.shutdown();
        if let Some(conn) = self.inner.conn.get() {
            self.host.sockets().ports.remove(conn.local_port, &self.inner);
            trace!("socket {} released", conn.local_port);
        }
    }
}
