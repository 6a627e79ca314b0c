/*!
 * Client Connection
 *
 * One accepted client socket plus its server-side state: identity, buffers,
 * flags, and timestamps. The socket, buffers and string metadata sit behind
 * a per-connection mutex so the owning reactor can do I/O while admin
 * threads (kill, monitor feed, client list) touch the same connection
 * through their own brief critical sections. The table mutex in the Worker
 * guards only the fd maps, never socket I/O.
 *
 * Lock order is always table -> connection, and the command engine runs
 * with neither held.
 */

use crate::reactor::would_block;
use crate::worker::Worker;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};
use std::time::Instant;

/// Size of the stack buffer used when draining a readable socket
const READ_BUF: usize = 4096;

/// Namespace sentinel: connections in the default namespace receive the
/// monitor feed of every namespace.
pub const DEFAULT_NAMESPACE: &str = "__namespace";

/// Connection is in monitor mode
pub const FLAG_MONITOR: u64 = 1 << 0;
/// Destroy the connection once its output buffer drains
pub const FLAG_CLOSE_AFTER_REPLY: u64 = 1 << 1;

/// Seconds on the process-wide monotonic clock.
///
/// Ages and idle times are differences of these values, so wall-clock
/// adjustments never produce negative idle times.
pub fn monotonic_secs() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}

/// Result of draining a readable socket
pub enum ReadOutcome {
    /// Socket drained, peer still connected
    Open,
    /// Peer closed its end
    Eof,
}

/// Result of flushing the output buffer
pub enum FlushOutcome {
    /// Output buffer is empty; write interest disarmed
    Drained,
    /// Bytes remain queued; write interest armed
    Pending,
}

/// Locked snapshot of the fields reported by CLIENT LIST
pub struct AdminView {
    pub name: String,
    pub namespace: String,
    pub last_cmd: String,
    pub qbuf: usize,
    pub obuf: usize,
}

struct ConnState {
    stream: TcpStream,
    input: BytesMut,
    output: BytesMut,
    interest: Interest,
    name: String,
    namespace: String,
    last_cmd: String,
}

/// One accepted client
pub struct Connection {
    fd: RawFd,
    id: u64,
    addr: String,
    created_at: u64,
    owner: Weak<Worker>,
    flags: AtomicU64,
    last_interaction: AtomicU64,
    state: Mutex<ConnState>,
}

impl Connection {
    /// Wrap an accepted socket. The address is resolved by the accept
    /// handler and set exactly once, here.
    pub fn new(stream: TcpStream, addr: String, owner: Weak<Worker>) -> Connection {
        let now = monotonic_secs();
        let fd = stream.as_raw_fd();
        Connection {
            fd,
            id: 0,
            addr,
            created_at: now,
            owner,
            flags: AtomicU64::new(0),
            last_interaction: AtomicU64::new(now),
            state: Mutex::new(ConnState {
                stream,
                input: BytesMut::with_capacity(READ_BUF),
                output: BytesMut::new(),
                interest: Interest::READABLE,
                name: String::new(),
                namespace: DEFAULT_NAMESPACE.to_string(),
                last_cmd: String::new(),
            }),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    fn token(&self) -> Token {
        Token(self.fd as usize)
    }

    /// Process-wide client id; 0 until admission assigns one.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Called by the admitting Worker, before the connection is shared.
    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Owning worker, while it is alive. Non-owning by construction.
    pub fn owner(&self) -> Option<std::sync::Arc<Worker>> {
        self.owner.upgrade()
    }

    /// Seconds since the connection was admitted
    pub fn age(&self) -> u64 {
        monotonic_secs().saturating_sub(self.created_at)
    }

    /// Seconds since the last completed command, not since the last byte
    pub fn idle_secs(&self) -> u64 {
        monotonic_secs().saturating_sub(self.last_interaction.load(Ordering::Relaxed))
    }

    /// Record command activity; called on dispatch, not on readiness.
    pub fn touch(&self) {
        self.last_interaction.store(monotonic_secs(), Ordering::Relaxed);
    }

    #[inline]
    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn enable_flag(&self, flag: u64) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    #[inline]
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.state.lock().name = name.to_string();
    }

    pub fn namespace(&self) -> String {
        self.state.lock().namespace.clone()
    }

    pub fn set_last_cmd(&self, cmd: &str) {
        self.state.lock().last_cmd = cmd.to_string();
    }

    /// Register with the owning reactor's poll, read interest only.
    /// Write interest is armed lazily when output is queued.
    pub(crate) fn register(&self, registry: &Registry) -> io::Result<()> {
        let mut guard = self.state.lock();
        let token = self.token();
        let st = &mut *guard;
        registry.register(&mut st.stream, token, st.interest)
    }

    /// Drain the readable socket into the input buffer.
    pub(crate) fn fill_input(&self) -> io::Result<ReadOutcome> {
        let mut st = self.state.lock();
        let ConnState { stream, input, .. } = &mut *st;
        let mut buf = [0u8; READ_BUF];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => input.extend_from_slice(&buf[..n]),
                Err(ref e) if would_block(e) => return Ok(ReadOutcome::Open),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Take the buffered input for dispatch. Only the owning reactor calls
    /// this, so no new bytes can appear until `restore_input` puts the
    /// unconsumed remainder back.
    pub(crate) fn take_input(&self) -> BytesMut {
        self.state.lock().input.split()
    }

    pub(crate) fn restore_input(&self, remainder: BytesMut) {
        self.state.lock().input = remainder;
    }

    /// Append reply bytes to the output buffer. The caller is responsible
    /// for write interest: the reactor flushes after dispatch, foreign
    /// threads go through `enqueue_and_arm`.
    pub fn enqueue(&self, bytes: &[u8]) {
        self.state.lock().output.extend_from_slice(bytes);
    }

    /// Append reply bytes and arm write interest in one critical section.
    /// This is the foreign-thread path: without the arm, nothing would wake
    /// the owning event loop.
    pub(crate) fn enqueue_and_arm(&self, bytes: &[u8], registry: &Registry) -> io::Result<()> {
        let mut st = self.state.lock();
        st.output.extend_from_slice(bytes);
        self.arm_write_locked(&mut st, registry)
    }

    /// Arm write interest so the owning reactor wakes and flushes (or
    /// notices a close-after-reply with nothing left to flush).
    pub(crate) fn arm_write(&self, registry: &Registry) -> io::Result<()> {
        let mut st = self.state.lock();
        self.arm_write_locked(&mut st, registry)
    }

    fn arm_write_locked(&self, st: &mut ConnState, registry: &Registry) -> io::Result<()> {
        if st.interest.is_writable() {
            return Ok(());
        }
        st.interest = Interest::READABLE.add(Interest::WRITABLE);
        let token = self.token();
        let ConnState { stream, interest, .. } = st;
        registry.reregister(stream, token, *interest)
    }

    /// Write as much queued output as the socket accepts, then adjust
    /// write interest to match what is left.
    pub(crate) fn flush(&self, registry: &Registry) -> io::Result<FlushOutcome> {
        let mut st = self.state.lock();
        let token = self.token();
        let ConnState { stream, output, interest, .. } = &mut *st;
        while !output.is_empty() {
            match stream.write(&output[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket write returned 0"))
                }
                Ok(n) => output.advance(n),
                Err(ref e) if would_block(e) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if output.is_empty() {
            if interest.is_writable() {
                *interest = Interest::READABLE;
                registry.reregister(stream, token, *interest)?;
            }
            Ok(FlushOutcome::Drained)
        } else {
            if !interest.is_writable() {
                *interest = Interest::READABLE.add(Interest::WRITABLE);
                registry.reregister(stream, token, *interest)?;
            }
            Ok(FlushOutcome::Pending)
        }
    }

    /// Best-effort direct write, used for the admission-refusal error.
    /// One attempt on the nonblocking socket; short writes and failures
    /// are deliberately dropped.
    pub(crate) fn write_direct(&self, bytes: &[u8]) {
        let mut st = self.state.lock();
        let _ = st.stream.write(bytes);
    }

    /// Snapshot of the CLIENT LIST fields that live behind the state lock.
    pub(crate) fn admin_view(&self) -> AdminView {
        let st = self.state.lock();
        AdminView {
            name: st.name.clone(),
            namespace: st.namespace.clone(),
            last_cmd: st.last_cmd.clone(),
            qbuf: st.input.len(),
            obuf: st.output.len(),
        }
    }
}
