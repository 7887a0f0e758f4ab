//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! listener or the connection performs non-blocking accept/read/write
//! syscalls. Uses epoll on Linux, kqueue on macOS.
//!
//! Exactly one thread runs the loop. It owns the listener, every connection
//! and the buffer pool, so none of them needs locking.

use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{Connection, Progress};
use crate::runtime::listener::Listener;
use crate::server::ServerOptions;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// An accepted connection together with its registration.
#[derive(Debug)]
pub struct Client {
    pub conn: Connection<TcpStream>,
    /// Interest the stream is currently registered with.
    pub interest: Interest,
    pub peer: SocketAddr,
}

/// Spawn the loop thread.
///
/// `poll` must already have the listener registered under `LISTENER_TOKEN`
/// and a waker under `WAKER_TOKEN`. Waking the waker stops the loop.
pub fn spawn(
    poll: Poll,
    listener: Listener,
    options: ServerOptions,
) -> io::Result<JoinHandle<()>> {
    // Log through whichever subscriber the caller runs under.
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());

    thread::Builder::new()
        .name("echo-loop".to_string())
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let mut event_loop = EventLoop::new(poll, listener, options);
                if let Err(e) = event_loop.run() {
                    error!(error = %e, "Event loop failed");
                }
                event_loop.shutdown();
            })
        })
}

struct EventLoop {
    poll: Poll,
    listener: Listener,
    clients: Slab<Client>,
    pool: BufferPool,
    options: ServerOptions,
}

impl EventLoop {
    fn new(poll: Poll, listener: Listener, options: ServerOptions) -> Self {
        let pool = BufferPool::new(options.max_buffers, options.cached_buffers);
        Self {
            poll,
            listener,
            clients: Slab::new(),
            pool,
            options,
        }
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.options.event_capacity);

        info!(
            addr = %self.listener.local_addr(),
            read_buffer_size = self.options.read_buffer_size,
            max_buffers = self.options.max_buffers,
            "Event loop started"
        );

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        debug!("Stop requested");
                        return Ok(());
                    }
                    LISTENER_TOKEN => {
                        let armed = self.listener.on_ready(
                            event.is_error(),
                            self.poll.registry(),
                            &mut self.clients,
                            &self.options,
                        );
                        trace!(armed, active = self.clients.len(), "Accept round");
                    }
                    Token(conn_id) => self.on_client_event(conn_id, event),
                }
            }
        }
    }

    fn on_client_event(&mut self, conn_id: usize, event: &Event) {
        let Some(client) = self.clients.get_mut(conn_id) else {
            return;
        };

        let mut progress = Progress::Open;

        let read_ready = event.is_readable() || event.is_read_closed() || event.is_error();
        if read_ready && client.conn.wants_read() {
            progress = client.conn.on_readable(&self.pool);
        }

        let write_ready = event.is_writable() || event.is_write_closed() || event.is_error();
        if progress == Progress::Open && write_ready && client.conn.wants_write() {
            progress = client.conn.on_writable();
        }

        match progress {
            Progress::Open => self.update_interest(conn_id),
            Progress::Close => self.close_client(conn_id),
        }
    }

    /// Re-register the connection if the set of notifications it needs
    /// changed.
    fn update_interest(&mut self, conn_id: usize) {
        let Some(client) = self.clients.get_mut(conn_id) else {
            return;
        };

        let wanted = match (client.conn.wants_read(), client.conn.wants_write()) {
            (true, false) => Interest::READABLE,
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => return,
        };
        if wanted == client.interest {
            return;
        }

        let result = self
            .poll
            .registry()
            .reregister(client.conn.stream_mut(), Token(conn_id), wanted);
        match result {
            Ok(()) => client.interest = wanted,
            Err(e) => {
                warn!(conn_id, error = %e, "Failed to update interest");
                self.close_client(conn_id);
            }
        }
    }

    /// Deregister, release queued buffers, then close the socket.
    fn close_client(&mut self, conn_id: usize) {
        if let Some(mut client) = self.clients.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(client.conn.stream_mut());
            client.conn.close();
            debug!(conn_id, peer = %client.peer, "Connection released");
        }
    }

    /// Close every connection and the listener.
    fn shutdown(&mut self) {
        let ids: Vec<usize> = self.clients.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            self.close_client(conn_id);
        }
        let _ = self.listener.deregister(self.poll.registry());

        let stats = self.pool.stats();
        info!(
            buffers_allocated = stats.allocated,
            buffers_released = stats.released,
            buffers_failed = stats.failed,
            "Event loop stopped"
        );
    }
}
