//! Server controller.
//!
//! Validates the start request, binds the loopback listening socket and
//! hands it to the event-loop thread. A `Server` value can be started once;
//! it must be stopped before it can be started again.

use crate::diag::{self, report};
use crate::runtime::event_loop::{self, LISTENER_TOKEN, WAKER_TOKEN};
use crate::runtime::Listener;
use mio::{Poll, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt::Display;
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info, warn};

/// Address the server listens on.
pub const LOOPBACK: &str = "127.0.0.1";

/// Default suggested size for each read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Runtime tunables for the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Listen backlog. `None` uses the platform's `SOMAXCONN`.
    pub backlog: Option<i32>,
    /// Suggested size of each read buffer.
    pub read_buffer_size: usize,
    /// Maximum number of buffers alive at once across all connections.
    pub max_buffers: usize,
    /// Maximum number of released buffers kept for reuse.
    pub cached_buffers: usize,
    /// Echo writes queued per connection before it stops reading.
    pub max_pending_writes: usize,
    /// Number of readiness events fetched per poll.
    pub event_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_buffers: 16 * 1024,
            cached_buffers: 256,
            max_pending_writes: 64,
            event_capacity: 1024,
        }
    }
}

/// Errors returned by `Server::start`.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Wrong arguments: {0}")]
    InvalidArgument(String),
    #[error("Already started")]
    AlreadyStarted,
    #[error("Failed to start: {0}")]
    Failed(#[from] StartFailure),
}

/// The lower-level failure behind `StartError::Failed`.
#[derive(Debug, Error)]
pub enum StartFailure {
    #[error("invalid address: {0}")]
    AddressParse(#[source] AddrParseError),
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),
    #[error("event loop registration failed: {0}")]
    Register(#[source] io::Error),
    #[error("event loop thread failed to spawn: {0}")]
    Spawn(#[source] io::Error),
}

impl StartFailure {
    fn log_prefix(&self) -> &'static str {
        match self {
            StartFailure::AddressParse(_) => diag::PARSE_ADDR,
            StartFailure::Bind(_) => diag::BIND,
            StartFailure::Listen(_) => diag::LISTEN,
            StartFailure::Register(_) | StartFailure::Spawn(_) => "Error on starting event loop",
        }
    }

    /// The underlying error, without the wrapper's own description.
    fn cause(&self) -> &dyn Display {
        match self {
            StartFailure::AddressParse(e) => e,
            StartFailure::Bind(e)
            | StartFailure::Listen(e)
            | StartFailure::Register(e)
            | StartFailure::Spawn(e) => e,
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    waker: Waker,
    handle: Option<JoinHandle<()>>,
}

impl Running {
    /// The loop thread has not exited.
    fn is_alive(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

enum State {
    Stopped,
    Running(Running),
}

/// The echo server.
pub struct Server {
    options: ServerOptions,
    state: State,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            state: State::Stopped,
        }
    }

    /// Start echoing on `127.0.0.1:<port>`.
    ///
    /// Port `0` binds an ephemeral port. Returns the bound address. A server
    /// that is already running reports `AlreadyStarted` whatever `port` is;
    /// any other failure leaves it stopped so a corrected retry can succeed.
    pub fn start(&mut self, port: i64) -> Result<SocketAddr, StartError> {
        self.reap();
        if self.is_started() {
            return Err(StartError::AlreadyStarted);
        }

        let port = u16::try_from(port).map_err(|_| {
            StartError::InvalidArgument(format!("port {port} is outside 0..=65535"))
        })?;

        let running = launch(port, &self.options).map_err(|e| {
            report(e.log_prefix(), e.cause());
            StartError::from(e)
        })?;

        let local_addr = running.local_addr;
        self.state = State::Running(running);
        info!(addr = %local_addr, "Echo server listening");
        Ok(local_addr)
    }

    /// Start from a textual port, as given on the command line.
    pub fn start_from_str(&mut self, input: &str) -> Result<SocketAddr, StartError> {
        self.reap();
        if self.is_started() {
            return Err(StartError::AlreadyStarted);
        }
        let port = parse_port(input)?;
        self.start(port)
    }

    /// Whether the event loop is running.
    ///
    /// Becomes false on its own if the loop thread exits, e.g. when polling
    /// fails.
    pub fn is_started(&self) -> bool {
        matches!(&self.state, State::Running(running) if running.is_alive())
    }

    /// Address bound by the running server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Running(running) if running.is_alive() => Some(running.local_addr),
            _ => None,
        }
    }

    /// Return to the stopped state if the loop thread exited by itself.
    fn reap(&mut self) {
        if matches!(&self.state, State::Running(running) if !running.is_alive()) {
            warn!("Event loop exited; server is no longer listening");
            self.wait();
        }
    }

    /// Stop the event loop, closing the listener and every connection.
    pub fn stop(&mut self) {
        let State::Running(mut running) = std::mem::replace(&mut self.state, State::Stopped)
        else {
            return;
        };

        if let Err(e) = running.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
        join(running.handle.take());
        info!(addr = %running.local_addr, "Echo server stopped");
    }

    /// Block until the event loop exits.
    pub fn wait(&mut self) {
        if let State::Running(running) = &mut self.state {
            join(running.handle.take());
        }
        self.state = State::Stopped;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Interpret a textual port.
///
/// Integers are taken as is; finite decimals are truncated toward zero.
/// Range checking happens in `Server::start`.
pub fn parse_port(input: &str) -> Result<i64, StartError> {
    let trimmed = input.trim();
    if let Ok(port) = trimmed.parse::<i64>() {
        return Ok(port);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value.trunc() as i64),
        _ => Err(StartError::InvalidArgument(format!(
            "{input:?} is not a port number"
        ))),
    }
}

/// Bind, listen, register and spawn the loop thread.
///
/// Every resource created before a failing step is dropped on return.
fn launch(port: u16, options: &ServerOptions) -> Result<Running, StartFailure> {
    let addr: SocketAddr = format!("{LOOPBACK}:{port}")
        .parse()
        .map_err(StartFailure::AddressParse)?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(StartFailure::Bind)?;
    socket.set_reuse_address(true).map_err(StartFailure::Bind)?;
    socket.set_nonblocking(true).map_err(StartFailure::Bind)?;
    socket.bind(&addr.into()).map_err(StartFailure::Bind)?;

    let backlog = options.backlog.unwrap_or(libc::SOMAXCONN);
    socket.listen(backlog).map_err(StartFailure::Listen)?;

    let mut listener = Listener::from_std(socket.into()).map_err(StartFailure::Listen)?;

    let poll = Poll::new().map_err(StartFailure::Register)?;
    listener
        .register(poll.registry(), LISTENER_TOKEN)
        .map_err(StartFailure::Register)?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(StartFailure::Register)?;

    let local_addr = listener.local_addr();
    let handle =
        event_loop::spawn(poll, listener, options.clone()).map_err(StartFailure::Spawn)?;

    Ok(Running {
        local_addr,
        waker,
        handle: Some(handle),
    })
}

fn join(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!("Event loop thread panicked");
        }
    }
}
