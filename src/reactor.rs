/*!
 * Reactor Event Loop
 *
 * One ReactorLoop per worker thread: a mio poller, the worker's listening
 * sockets, and a coarse periodic timer realized as the poll deadline. The
 * Worker drives the loop and owns what the readiness events mean; this
 * module owns fd multiplexing and the SO_REUSEPORT listener setup that
 * lets every worker accept on the same port.
 */

use anyhow::{bail, Context, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::time::{Duration, Instant};

/// Period of the worker timer driving the idle scan
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Token reserved for the cross-thread waker
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Listener tokens occupy [LISTENER_BASE, LISTENER_BASE + MAX_LISTENERS);
/// connection tokens are the raw fd value, which stays far below this.
const MAX_LISTENERS: usize = 1024;
const LISTENER_BASE: usize = usize::MAX - 1 - MAX_LISTENERS;

/// Map a token back to a listener slot, if it is one.
pub(crate) fn listener_index(token: Token) -> Option<usize> {
    if (LISTENER_BASE..LISTENER_BASE + MAX_LISTENERS).contains(&token.0) {
        Some(token.0 - LISTENER_BASE)
    } else {
        None
    }
}

pub struct ReactorLoop {
    poll: Poll,
    events: Events,
    listeners: Vec<TcpListener>,
    next_tick: Instant,
}

impl ReactorLoop {
    pub fn new() -> Result<ReactorLoop> {
        let poll = Poll::new().context("failed to create poller")?;
        Ok(ReactorLoop {
            poll,
            events: Events::with_capacity(1024),
            listeners: Vec::new(),
            next_tick: Instant::now() + TICK_INTERVAL,
        })
    }

    /// Cloned registry handle; thread-safe, used to (re)register sockets
    /// from admin threads as well as the owning reactor.
    pub fn registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Waker that breaks a blocked `poll_once` from another thread.
    pub fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKER_TOKEN)
    }

    /// Bind a listening socket and register it for accept readiness.
    ///
    /// Failure here is fatal for the worker under construction.
    pub fn listen(&mut self, host: &str, port: u16, backlog: u32) -> Result<SocketAddr> {
        if self.listeners.len() >= MAX_LISTENERS {
            bail!("too many listeners");
        }
        let ip: IpAddr = host
            .parse()
            .with_context(|| format!("invalid bind address {host}"))?;
        let mut listener = bind_reuseport(SocketAddr::new(ip, port), backlog)
            .with_context(|| format!("failed to listen on {host}:{port}"))?;
        let local = listener.local_addr()?;
        let token = Token(LISTENER_BASE + self.listeners.len());
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        self.listeners.push(listener);
        Ok(local)
    }

    /// Block until readiness events arrive or the next timer tick is due.
    pub fn poll_once(&mut self) -> io::Result<()> {
        let timeout = self.next_tick.saturating_duration_since(Instant::now());
        self.poll.poll(&mut self.events, Some(timeout))
    }

    /// Consume a due timer tick, advancing the deadline.
    pub fn tick_due(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.next_tick {
            self.next_tick = now + TICK_INTERVAL;
            true
        } else {
            false
        }
    }

    /// Events filled by the last `poll_once`.
    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn listener(&self, idx: usize) -> Option<&TcpListener> {
        self.listeners.get(idx)
    }

    /// Drop all listening sockets, which closes them.
    pub fn close_listeners(&mut self) {
        self.listeners.clear();
    }
}

/// Bind a TCP listener with SO_REUSEADDR and SO_REUSEPORT set.
///
/// SO_REUSEPORT lets every worker bind the same port so the kernel load
/// balances incoming connections across their accept queues. The socket
/// is nonblocking before it reaches the poller.
pub fn bind_reuseport(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Enable TCP keepalive on an accepted socket.
///
/// The fd is borrowed into a socket2 handle for the single setsockopt and
/// released without closing.
pub(crate) fn set_keepalive(fd: RawFd) -> io::Result<()> {
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let res = socket.set_keepalive(true);
    let _ = socket.into_raw_fd();
    res
}

/// Check if an I/O error indicates the operation would block.
///
/// Interrupted is NOT included: with an edge-triggered poller a syscall
/// cut short by a signal must be retried immediately, or the readiness
/// edge is lost.
#[inline]
pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
