//! loopback-echo: a single-threaded TCP echo server.
//!
//! Bytes received on a connection are written back verbatim on the same
//! connection. One mio event loop drives the listener and every connection;
//! no socket operation blocks.
//!
//! ```no_run
//! use loopback_echo::{Server, ServerOptions};
//!
//! let mut server = Server::new(ServerOptions::default());
//! let addr = server.start(9001)?;
//! println!("echoing on {addr}");
//! server.wait();
//! # Ok::<(), loopback_echo::StartError>(())
//! ```

pub mod config;
pub mod diag;
pub mod runtime;
pub mod server;

pub use server::{parse_port, Server, ServerOptions, StartError, StartFailure};
