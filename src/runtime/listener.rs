//! Listening socket and connection acceptance.
//!
//! The listener is created and bound by the server controller, then moved
//! onto the event-loop thread. On each readiness notification it accepts
//! every queued connection and arms reading on it.

use crate::diag::{self, report};
use crate::runtime::connection::Connection;
use crate::runtime::event_loop::Client;
use crate::server::ServerOptions;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use tracing::debug;

/// The bound, listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Wrap a bound and listening std socket.
    ///
    /// The socket must already be in non-blocking mode.
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: TcpListener::from_std(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register for accept notifications.
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }

    /// Handle a readiness notification on the listening socket.
    ///
    /// An error notification is logged and nothing is accepted for it.
    /// Otherwise every pending connection is accepted and registered for
    /// reads. Returns the number of connections armed.
    pub fn on_ready(
        &self,
        is_error: bool,
        registry: &Registry,
        clients: &mut Slab<Client>,
        options: &ServerOptions,
    ) -> usize {
        if is_error {
            match self.inner.take_error() {
                Ok(Some(e)) => report(diag::LISTEN, &e),
                Ok(None) => report(diag::LISTEN, &"socket reported an error"),
                Err(e) => report(diag::LISTEN, &e),
            }
            return 0;
        }

        let mut armed = 0;
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    if arm(registry, clients, stream, peer, options) {
                        armed += 1;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    report(diag::ACCEPT, e);
                }
                Err(e) => {
                    // Typically descriptor exhaustion; retrying now would spin.
                    report(diag::ACCEPT, &e);
                    break;
                }
            }
        }
        armed
    }
}

/// Start reading on an accepted stream.
///
/// If registration fails the stream is dropped, which closes it.
fn arm(
    registry: &Registry,
    clients: &mut Slab<Client>,
    mut stream: TcpStream,
    peer: SocketAddr,
    options: &ServerOptions,
) -> bool {
    let entry = clients.vacant_entry();
    let conn_id = entry.key();

    if let Err(e) = registry.register(&mut stream, Token(conn_id), Interest::READABLE) {
        report(diag::READ, &e);
        return false;
    }

    let mut conn = Connection::new(
        stream,
        options.read_buffer_size,
        options.max_pending_writes,
    );
    conn.start_reading();
    entry.insert(Client {
        conn,
        interest: Interest::READABLE,
        peer,
    });

    debug!(conn_id, peer = %peer, "Accepted connection");
    true
}
