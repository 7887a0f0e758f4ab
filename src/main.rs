//! loopback-echo: echo every byte back to its sender.
//!
//! Features:
//! - Listens on 127.0.0.1 at a configurable port
//! - Single event-loop thread (epoll on Linux, kqueue on macOS)
//! - Configuration via CLI arguments or TOML file

use loopback_echo::config::Config;
use loopback_echo::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        port = %config.port,
        backlog = ?config.options.backlog,
        read_buffer_size = config.options.read_buffer_size,
        max_buffers = config.options.max_buffers,
        "Starting loopback-echo server"
    );

    let mut server = Server::new(config.options);
    server.start_from_str(&config.port)?;
    server.wait();

    Ok(())
}
