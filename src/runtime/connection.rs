//! Connection state machine for echoing one TCP stream.
//!
//! Each readable notification drains the socket chunk by chunk. Every chunk
//! lands in a freshly allocated `PooledBuffer`, which is then moved (not
//! copied) into the connection's write queue. Writes are attempted right away
//! and, if the socket cannot take everything, finish on later writable
//! notifications. Reads stay armed while writes are pending.
//!
//! Buffers are released by dropping them: on write completion, on write
//! failure, when a read yields nothing, or when the connection is closed with
//! writes still queued.

use crate::diag::{self, report};
use crate::runtime::buffer::{BufferPool, PooledBuffer};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use tracing::{debug, trace};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, reads not yet armed.
    Accepted,
    /// Waiting for inbound data, nothing queued for writing.
    Reading,
    /// Still reading, with at least one echo write outstanding.
    WritePending,
    /// Peer sent EOF; draining queued writes before closing.
    Closing,
    /// Socket released. No further notifications are handled.
    Closed,
}

/// Outcome of a single read attempt.
#[derive(Debug)]
pub enum ReadStatus {
    /// `n > 0` bytes were read.
    Data(usize),
    /// Nothing available right now; the connection is still open.
    NoData,
    /// The peer closed its sending side.
    Eof,
    /// The read failed.
    Failed(io::Error),
}

/// What the event loop should do with the connection after a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Keep the connection registered.
    Open,
    /// Deregister and close the connection.
    Close,
}

#[derive(Debug)]
enum WriteStatus {
    Complete,
    Blocked,
    Failed(io::Error),
}

/// A buffer owned by an outstanding write.
#[derive(Debug)]
struct PendingWrite {
    buf: PooledBuffer,
    written: usize,
}

impl PendingWrite {
    fn remaining(&self) -> &[u8] {
        &self.buf.filled()[self.written..]
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    /// Writes in submission order. The front one is in progress.
    pending: VecDeque<PendingWrite>,
    /// Suggested size for each read buffer.
    read_size: usize,
    /// Reads stop while this many writes are queued.
    max_pending: usize,
    /// Set when the pool had no buffer while writes were queued.
    starved: bool,
    bytes_echoed: u64,
    write_failures: u64,
}

impl<S: Read + Write> Connection<S> {
    /// Create a connection in the accepted state.
    ///
    /// At most `max_pending` echo writes are queued at once; beyond that the
    /// connection stops reading until the peer drains its side.
    pub fn new(stream: S, read_size: usize, max_pending: usize) -> Self {
        Self {
            stream,
            state: ConnState::Accepted,
            pending: VecDeque::new(),
            read_size,
            max_pending: max_pending.max(1),
            starved: false,
            bytes_echoed: 0,
            write_failures: 0,
        }
    }

    /// Transition to reading once the socket is registered for reads.
    pub fn start_reading(&mut self) {
        debug_assert_eq!(self.state, ConnState::Accepted);
        self.state = ConnState::Reading;
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Whether read notifications are still wanted.
    ///
    /// False once EOF was seen, and temporarily false while the write queue
    /// is full or the pool ran dry behind queued writes.
    pub fn wants_read(&self) -> bool {
        matches!(self.state, ConnState::Reading | ConnState::WritePending)
            && !self.read_paused()
    }

    /// Reading is held back until queued writes complete.
    pub fn read_paused(&self) -> bool {
        self.starved || self.pending.len() >= self.max_pending
    }

    /// Whether writable notifications are needed to finish queued writes.
    pub fn wants_write(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of writes not yet completed.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Total bytes written back to the peer.
    pub fn bytes_echoed(&self) -> u64 {
        self.bytes_echoed
    }

    /// Writes that failed and were dropped.
    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    /// Handle a read-ready notification.
    ///
    /// Reads until the socket reports that nothing more is available, echoing
    /// each chunk as it arrives.
    pub fn on_readable(&mut self, pool: &BufferPool) -> Progress {
        while self.wants_read() {
            let Some(mut buf) = pool.alloc(self.read_size) else {
                if !self.pending.is_empty() {
                    // Our own writes hold buffers; resume once they drain.
                    trace!(
                        pending = self.pending.len(),
                        "Read paused, buffer pool empty"
                    );
                    self.starved = true;
                    return Progress::Open;
                }
                report(diag::READ, &"no memory available for read buffer");
                return Progress::Close;
            };

            match read_into(&mut self.stream, &mut buf) {
                ReadStatus::Data(n) => {
                    trace!(bytes = n, "Read chunk");
                    buf.set_filled(n);
                    self.submit_write(buf);
                }
                ReadStatus::NoData => {
                    // `buf` is released here, unused.
                    return Progress::Open;
                }
                ReadStatus::Eof => {
                    drop(buf);
                    return self.on_eof();
                }
                ReadStatus::Failed(e) => {
                    drop(buf);
                    report(diag::READ, &e);
                    return Progress::Close;
                }
            }
        }

        self.progress()
    }

    /// Handle a write-ready notification.
    pub fn on_writable(&mut self) -> Progress {
        self.flush();
        self.progress()
    }

    /// Release everything the connection still owns.
    ///
    /// Queued writes are cancelled and their buffers released. Returns the
    /// number of cancelled writes.
    pub fn close(&mut self) -> usize {
        let cancelled = self.pending.len();
        self.pending.clear();
        self.state = ConnState::Closed;
        debug!(
            bytes_echoed = self.bytes_echoed,
            write_failures = self.write_failures,
            cancelled,
            "Connection closed"
        );
        cancelled
    }

    fn on_eof(&mut self) -> Progress {
        trace!(pending = self.pending.len(), "Peer closed its sending side");
        self.state = ConnState::Closing;
        self.progress()
    }

    /// Queue `buf` behind any outstanding writes and try to send it.
    fn submit_write(&mut self, buf: PooledBuffer) {
        self.pending.push_back(PendingWrite { buf, written: 0 });
        if self.pending.len() == 1 {
            self.flush();
        }
        if self.state == ConnState::Reading && !self.pending.is_empty() {
            self.state = ConnState::WritePending;
        }
    }

    /// Write queued buffers in order until the socket would block.
    fn flush(&mut self) {
        while let Some(front) = self.pending.front_mut() {
            match write_from(&mut self.stream, front) {
                WriteStatus::Complete => {
                    self.bytes_echoed += front.buf.len() as u64;
                    self.pending.pop_front();
                }
                WriteStatus::Blocked => break,
                WriteStatus::Failed(e) => {
                    // Dropped without retry.
                    self.bytes_echoed += front.written as u64;
                    self.pending.pop_front();
                    self.write_failures += 1;
                    report(diag::WRITE, &e);
                }
            }
            self.starved = false;
        }

        if self.state == ConnState::WritePending && self.pending.is_empty() {
            self.state = ConnState::Reading;
        }
    }

    fn progress(&self) -> Progress {
        match self.state {
            ConnState::Closing if self.pending.is_empty() => Progress::Close,
            ConnState::Closed => Progress::Close,
            _ => Progress::Open,
        }
    }
}

/// Read once into `buf`, mapping the result onto a `ReadStatus`.
fn read_into<S: Read>(stream: &mut S, buf: &mut PooledBuffer) -> ReadStatus {
    loop {
        match stream.read(buf.spare_mut()) {
            Ok(0) => return ReadStatus::Eof,
            Ok(n) => return ReadStatus::Data(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadStatus::NoData,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadStatus::Failed(e),
        }
    }
}

/// Write as much of `pending` as the socket accepts.
fn write_from<S: Write>(stream: &mut S, pending: &mut PendingWrite) -> WriteStatus {
    while !pending.remaining().is_empty() {
        match stream.write(pending.remaining()) {
            Ok(0) => {
                return WriteStatus::Failed(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                ));
            }
            Ok(n) => pending.written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return WriteStatus::Blocked,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return WriteStatus::Failed(e),
        }
    }
    WriteStatus::Complete
}

#[cfg(test)]
mod tests {
    use super::*;

    /// How the scripted stream answers the next `write` call.
    enum WriteStep {
        Accept(usize),
        Block,
        Fail(io::ErrorKind),
    }

    /// In-memory stream with scripted read and write outcomes.
    ///
    /// Reads past the script report `WouldBlock`; writes past the script
    /// accept everything.
    #[derive(Default)]
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        writes: VecDeque<WriteStep>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn read_chunk(mut self, data: &[u8]) -> Self {
            self.reads.push_back(Ok(data.to_vec()));
            self
        }

        fn read_eof(mut self) -> Self {
            self.reads.push_back(Ok(Vec::new()));
            self
        }

        fn read_error(mut self, kind: io::ErrorKind) -> Self {
            self.reads.push_back(Err(io::Error::from(kind)));
            self
        }

        fn write_step(mut self, step: WriteStep) -> Self {
            self.writes.push_back(step);
            self
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.writes.pop_front() {
                Some(WriteStep::Accept(max)) => {
                    let n = max.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(WriteStep::Block) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Some(WriteStep::Fail(kind)) => Err(io::Error::from(kind)),
                None => {
                    self.written.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn reading(stream: ScriptedStream) -> Connection<ScriptedStream> {
        reading_with_limit(stream, 16)
    }

    fn reading_with_limit(
        stream: ScriptedStream,
        max_pending: usize,
    ) -> Connection<ScriptedStream> {
        let mut conn = Connection::new(stream, 64, max_pending);
        conn.start_reading();
        conn
    }

    fn blocked_writer(chunks: &[&str]) -> ScriptedStream {
        let mut stream = ScriptedStream::default();
        for chunk in chunks {
            stream = stream.read_chunk(chunk.as_bytes()).write_step(WriteStep::Block);
        }
        stream
    }

    #[test]
    fn test_echoes_each_chunk() {
        let pool = BufferPool::new(16, 16);
        let mut conn = reading(ScriptedStream::default().read_chunk(b"hello"));

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.stream_mut().written, b"hello");
        assert_eq!(conn.state(), ConnState::Reading);

        conn.stream_mut().reads.push_back(Ok(b"world".to_vec()));
        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.stream_mut().written, b"helloworld");
        assert_eq!(conn.bytes_echoed(), 10);

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.stats().allocated, pool.stats().released);
    }

    #[test]
    fn test_no_data_is_not_close() {
        let pool = BufferPool::new(16, 16);
        let mut conn = reading(ScriptedStream::default());

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.state(), ConnState::Reading);
        assert!(conn.stream_mut().written.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn test_eof_flushes_pending_before_close() {
        let pool = BufferPool::new(16, 16);
        let stream = ScriptedStream::default()
            .read_chunk(b"payload")
            .read_eof()
            .write_step(WriteStep::Block);
        let mut conn = reading(stream);

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(!conn.wants_read());
        assert!(conn.wants_write());
        assert_eq!(pool.outstanding(), 1);

        assert_eq!(conn.on_writable(), Progress::Close);
        assert_eq!(conn.stream_mut().written, b"payload");
        assert_eq!(conn.close(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_eof_without_pending_closes() {
        let pool = BufferPool::new(16, 16);
        let mut conn = reading(ScriptedStream::default().read_chunk(b"x").read_eof());

        assert_eq!(conn.on_readable(&pool), Progress::Close);
        assert_eq!(conn.stream_mut().written, b"x");
    }

    #[test]
    fn test_write_failure_releases_once() {
        let pool = BufferPool::new(16, 16);
        let stream = ScriptedStream::default()
            .read_chunk(b"abc")
            .write_step(WriteStep::Fail(io::ErrorKind::BrokenPipe));
        let mut conn = reading(stream);

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.write_failures(), 1);
        assert_eq!(conn.pending_writes(), 0);
        assert_eq!(conn.state(), ConnState::Reading);

        // Read buffer for "abc" plus the trailing empty read.
        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.released, 2);

        // Later traffic is unaffected.
        conn.stream_mut().reads.push_back(Ok(b"def".to_vec()));
        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.stream_mut().written, b"def");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_partial_writes_keep_order() {
        let pool = BufferPool::new(16, 16);
        let stream = ScriptedStream::default()
            .read_chunk(b"abcdef")
            .read_chunk(b"ghi")
            .write_step(WriteStep::Accept(2))
            .write_step(WriteStep::Block);
        let mut conn = reading(stream);

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.state(), ConnState::WritePending);
        assert_eq!(conn.pending_writes(), 2);
        assert_eq!(conn.stream_mut().written, b"ab");

        assert_eq!(conn.on_writable(), Progress::Open);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.stream_mut().written, b"abcdefghi");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_read_error_closes_and_cancels_pending() {
        let pool = BufferPool::new(16, 16);
        let stream = ScriptedStream::default()
            .read_chunk(b"x")
            .read_error(io::ErrorKind::ConnectionReset)
            .write_step(WriteStep::Block);
        let mut conn = reading(stream);

        assert_eq!(conn.on_readable(&pool), Progress::Close);
        assert_eq!(pool.outstanding(), 1);

        assert_eq!(conn.close(), 1);
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let pool = BufferPool::new(16, 16);
        let stream = ScriptedStream::default()
            .read_error(io::ErrorKind::Interrupted)
            .read_chunk(b"again");
        let mut conn = reading(stream);

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.stream_mut().written, b"again");
    }

    #[test]
    fn test_full_queue_pauses_reading() {
        let pool = BufferPool::new(16, 16);
        let stream = blocked_writer(&["one", "two", "three"]);
        let mut conn = reading_with_limit(stream, 2);

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.pending_writes(), 2);
        assert!(conn.read_paused());
        assert!(!conn.wants_read());
        assert_eq!(pool.outstanding(), 2);

        // Draining the queue re-arms reads; "three" is still unread.
        conn.stream_mut().writes.clear();
        assert_eq!(conn.on_writable(), Progress::Open);
        assert!(conn.wants_read());
        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.stream_mut().written, b"onetwothree");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_stalled_peer_does_not_close_others() {
        let pool = BufferPool::new(4, 4);

        // This peer sends but never reads.
        let mut stalled = reading_with_limit(blocked_writer(&["a", "b", "c", "d"]), 2);
        assert_eq!(stalled.on_readable(&pool), Progress::Open);
        assert_eq!(stalled.pending_writes(), 2);

        let mut other = reading_with_limit(blocked_writer(&["hi"]), 2);
        assert_eq!(other.on_readable(&pool), Progress::Open);
        assert_eq!(other.pending_writes(), 1);

        other.stream_mut().writes.clear();
        assert_eq!(other.on_writable(), Progress::Open);
        assert_eq!(other.stream_mut().written, b"hi");
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_empty_pool_with_pending_writes_pauses() {
        let pool = BufferPool::new(1, 1);
        let stream = ScriptedStream::default()
            .read_chunk(b"first")
            .read_chunk(b"second")
            .write_step(WriteStep::Block);
        let mut conn = reading(stream);

        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert!(conn.read_paused());
        assert_eq!(pool.stats().failed, 1);

        assert_eq!(conn.on_writable(), Progress::Open);
        assert!(!conn.read_paused());
        assert_eq!(conn.on_readable(&pool), Progress::Open);
        assert_eq!(conn.stream_mut().written, b"firstsecond");
    }

    #[test]
    fn test_allocation_failure_closes() {
        let pool = BufferPool::new(0, 0);
        let mut conn = reading(ScriptedStream::default().read_chunk(b"lost"));

        assert_eq!(conn.on_readable(&pool), Progress::Close);
        assert_eq!(pool.stats().failed, 1);
    }
}
