use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use crate::error::Error;

/// Default striping block size in bytes.
pub const DEFAULT_BLOCK_LEN: usize = 16 * 1024;

/// The capability a duplex byte connection must offer to take part in a
/// [`MultiStream`].
///
/// Any blocking `Read + Write` connection qualifies; `close` and
/// `declared_len` have sensible defaults. Implementations are provided for
/// `TcpStream` and for `rustls` owned TLS streams over TCP.
pub trait Channel: Read + Write + Send + 'static {
    /// Closes the connection, releasing its resources.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// The number of bytes this channel expects to deliver, when known.
    fn declared_len(&self) -> Option<u64> {
        None
    }
}

impl Channel for std::net::TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

/// Index of the channel that owns the byte at logical offset `position`.
///
/// Pure round-robin over whole blocks: block `i` (bytes `[i*B, (i+1)*B)`)
/// belongs to channel `i % channels`. Both peers of a striped transfer must
/// agree on `block_len` and the channel count/order for the byte sequence
/// to reassemble correctly.
pub fn route(position: u64, block_len: usize, channels: usize) -> usize {
    ((position / block_len as u64) % channels as u64) as usize
}

/// Length of the next sub-operation starting at `position`: the remainder
/// of the current block, capped by `remaining`.
pub fn stripe_len(position: u64, block_len: usize, remaining: usize) -> usize {
    let left_in_block = block_len - (position % block_len as u64) as usize;
    remaining.min(left_in_block)
}

/// A cloneable handle that cooperatively cancels a [`MultiStream`]'s
/// in-flight channel operations.
///
/// Cancellation is observed between sub-operations and between partial
/// reads; an operation already blocked on the underlying transport is not
/// interrupted. After cancellation the stream can still be closed.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Requests cancellation of pending and future operations.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Cmd {
    Write(Vec<u8>),
    Read(usize),
    Flush,
    Close,
}

enum Reply {
    Wrote(io::Result<()>),
    Data(io::Result<Vec<u8>>),
    Flushed(io::Result<()>),
    Closed(io::Result<()>),
    Cancelled,
}

/// Reads exactly `want` bytes, or fewer if the channel signals end of data.
fn read_fully<C: Channel>(chan: &mut C, want: usize, cancel: &AtomicBool) -> Reply {
    let mut buf = vec![0u8; want];
    let mut at = 0;
    while at < want {
        if cancel.load(Ordering::SeqCst) {
            return Reply::Cancelled;
        }
        match chan.read(&mut buf[at..]) {
            Ok(0) => break,
            Ok(n) => at += n,
            Err(e) => return Reply::Data(Err(e)),
        }
    }
    buf.truncate(at);
    Reply::Data(Ok(buf))
}

fn run_worker<C: Channel>(
    mut chan: C,
    cmds: Receiver<Cmd>,
    replies: Sender<Reply>,
    cancel: Arc<AtomicBool>,
) {
    while let Ok(cmd) = cmds.recv() {
        let reply = match cmd {
            // Close runs even after cancellation so resources are released.
            Cmd::Close => {
                let _ = replies.send(Reply::Closed(chan.close()));
                return;
            }
            _ if cancel.load(Ordering::SeqCst) => Reply::Cancelled,
            Cmd::Write(buf) => Reply::Wrote(chan.write_all(&buf)),
            Cmd::Read(want) => read_fully(&mut chan, want, &cancel),
            Cmd::Flush => Reply::Flushed(chan.flush()),
        };
        if replies.send(reply).is_err() {
            return;
        }
    }
}

enum Pending {
    Idle,
    Write,
    Read { dst_at: usize },
    Flush,
}

struct Lane {
    cmds: Sender<Cmd>,
    replies: Receiver<Reply>,
    pending: Pending,
    worker: Option<JoinHandle<()>>,
}

/// One logical duplex byte stream striped across several independent
/// channels.
///
/// `MultiStream` owns an ordered, fixed set of [`Channel`]s and presents
/// them to the caller as a single forward-only `Read + Write` stream. The
/// logical byte sequence is split into fixed-size blocks assigned to
/// channels round-robin, so a peer holding the other ends of the same
/// channels (in the same order, with the same block size) reconstructs the
/// identical sequence.
///
/// # Pipelining
///
/// Each channel is driven by a dedicated worker thread holding at most one
/// operation in flight at a time. A logical read or write issues its first
/// sub-operation and immediately moves on to the next channel rather than
/// waiting, so up to N channel operations overlap; this is what hides
/// per-channel network and encryption latency. Ordering is only enforced
/// per channel: a new sub-operation on a channel first waits for that
/// channel's previous one to finish.
///
/// # Failures
///
/// A channel failure is not retried. It surfaces from whichever call next
/// waits on that channel's slot (a later read or write, `flush`, or
/// `close`), as an [`Error::ChannelIo`] carrying the channel's index. A
/// short or zero-byte read without an error is the normal end-of-data
/// signal. Sub-read destinations are fixed when the sub-read is issued,
/// so a short read's bytes are a contiguous prefix of the buffer only
/// when the peer striped with the same block size and channel count; a
/// mismatched peer can end one channel early while later-routed sub-reads
/// still deliver, leaving a gap inside the counted range.
///
/// # Example
///
/// ```rust,no_run
/// use std::io::Write;
/// use std::net::TcpStream;
/// use multi_stream::MultiStream;
///
/// let channels = (0..4)
///     .map(|_| TcpStream::connect("127.0.0.1:8080"))
///     .collect::<std::io::Result<Vec<_>>>()?;
///
/// let mut stream = MultiStream::new(channels)?;
/// stream.write_all(b"striped across four connections")?;
/// stream.flush()?;
/// stream.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct MultiStream {
    lanes: Vec<Lane>,
    block_len: usize,
    position: u64,
    declared: Option<u64>,
    wrote: bool,
    closed: bool,
    cancel: Arc<AtomicBool>,
}

impl MultiStream {
    /// Creates a stream over `channels` with the default block size of
    /// 16 KiB.
    pub fn new<C: Channel>(channels: Vec<C>) -> Result<MultiStream, Error> {
        Self::with_block_len(channels, DEFAULT_BLOCK_LEN)
    }

    /// Creates a stream over `channels` striping in blocks of `block_len`
    /// bytes.
    ///
    /// Fails with [`Error::InvalidConfiguration`] if `channels` is empty or
    /// `block_len` is zero. The channels must already be connected; one
    /// worker thread is spawned per channel and owns it until `close`.
    pub fn with_block_len<C: Channel>(
        channels: Vec<C>,
        block_len: usize,
    ) -> Result<MultiStream, Error> {
        if channels.is_empty() {
            return Err(Error::InvalidConfiguration("at least one channel is required"));
        }
        if block_len == 0 {
            return Err(Error::InvalidConfiguration("block length must be positive"));
        }

        let declared = channels
            .iter()
            .try_fold(0u64, |sum, c| c.declared_len().map(|l| sum + l));

        let cancel = Arc::new(AtomicBool::new(false));
        let mut lanes = Vec::with_capacity(channels.len());
        for (id, chan) in channels.into_iter().enumerate() {
            let (cmd_tx, cmd_rx) = channel();
            let (reply_tx, reply_rx) = channel();
            let flag = cancel.clone();
            let worker = std::thread::Builder::new()
                .name(format!("lane-{id}"))
                .spawn(move || run_worker(chan, cmd_rx, reply_tx, flag))
                .map_err(|e| Error::ChannelIo { channel: id, source: e })?;
            lanes.push(Lane {
                cmds: cmd_tx,
                replies: reply_rx,
                pending: Pending::Idle,
                worker: Some(worker),
            });
        }

        log::debug!("multi stream over {} channels, block length {block_len}", lanes.len());
        Ok(MultiStream {
            lanes,
            block_len,
            position: 0,
            declared,
            wrote: false,
            closed: false,
            cancel,
        })
    }

    /// The logical cursor: the number of logical bytes processed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The striping block size.
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// The sum of the channels' declared lengths, captured at construction.
    ///
    /// `None` if any channel does not declare one. This is a capability
    /// query, not a delivery guarantee; a channel may still end early.
    pub fn declared_len(&self) -> Option<u64> {
        self.declared
    }

    /// A handle that cancels this stream's in-flight channel operations.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Waits for channel `idx`'s in-flight operation, if any, and settles
    /// its result. Completed read data is copied into `sink` at the offset
    /// recorded when the read was issued; the return value is the number of
    /// bytes a completed read contributed.
    fn wait_slot(&mut self, idx: usize, sink: Option<&mut [u8]>) -> Result<usize, Error> {
        let lane = &mut self.lanes[idx];
        let pending = std::mem::replace(&mut lane.pending, Pending::Idle);
        if matches!(pending, Pending::Idle) {
            return Ok(0);
        }
        let reply = lane
            .replies
            .recv()
            .map_err(|_| Error::WorkerGone { channel: idx })?;
        match (pending, reply) {
            (_, Reply::Cancelled) => Err(Error::Cancelled),
            (Pending::Write, Reply::Wrote(r)) | (Pending::Flush, Reply::Flushed(r)) => r
                .map(|()| 0)
                .map_err(|e| Error::ChannelIo { channel: idx, source: e }),
            (Pending::Read { dst_at }, Reply::Data(r)) => {
                let data = r.map_err(|e| Error::ChannelIo { channel: idx, source: e })?;
                match sink {
                    Some(sink) => {
                        sink[dst_at..dst_at + data.len()].copy_from_slice(&data);
                        Ok(data.len())
                    }
                    // Read slots never outlive the logical read that issued
                    // them; a sink-less wait can only reach this arm during
                    // unwinding, where the bytes are dropped.
                    None => Ok(0),
                }
            }
            _ => unreachable!("worker reply does not match the in-flight command"),
        }
    }

    fn write_inner(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::UseAfterDispose);
        }
        let lanes = self.lanes.len();
        let mut at = 0;
        while at < buf.len() {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let idx = route(self.position, self.block_len, lanes);
            let len = stripe_len(self.position, self.block_len, buf.len() - at);

            // Wait for this channel's previous operation, then issue the
            // next one without waiting and move on to the next channel.
            self.wait_slot(idx, None)?;
            self.lanes[idx]
                .cmds
                .send(Cmd::Write(buf[at..at + len].to_vec()))
                .map_err(|_| Error::WorkerGone { channel: idx })?;
            self.lanes[idx].pending = Pending::Write;
            self.wrote = true;
            self.position += len as u64;
            at += len;
        }
        log::debug!("issued {} bytes across {lanes} channels, cursor {}", buf.len(), self.position);
        Ok(buf.len())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::UseAfterDispose);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let lanes = self.lanes.len();
        let start = self.position;
        let mut pos = start;
        let mut at = 0;
        let mut total = 0usize;
        let mut first_err: Option<Error> = None;

        while at < buf.len() {
            if self.cancel.load(Ordering::SeqCst) {
                first_err.get_or_insert(Error::Cancelled);
                break;
            }
            let idx = route(pos, self.block_len, lanes);
            let len = stripe_len(pos, self.block_len, buf.len() - at);

            match self.wait_slot(idx, Some(&mut *buf)) {
                Ok(n) => total += n,
                Err(e) => {
                    first_err.get_or_insert(e);
                    break;
                }
            }
            if self.lanes[idx].cmds.send(Cmd::Read(len)).is_err() {
                first_err.get_or_insert(Error::WorkerGone { channel: idx });
                break;
            }
            self.lanes[idx].pending = Pending::Read { dst_at: at };
            pos += len as u64;
            at += len;
        }

        // Settle every outstanding slot before returning, so no read is
        // left pending against a buffer that no longer exists. On failure
        // the call fails as a unit and partial results are discarded.
        for idx in 0..lanes {
            match self.wait_slot(idx, Some(&mut *buf)) {
                Ok(n) => total += n,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        self.position = start + total as u64;
        log::debug!("read {total} of {} requested bytes, cursor {}", buf.len(), self.position);
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    fn flush_inner(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::UseAfterDispose);
        }
        for idx in 0..self.lanes.len() {
            self.wait_slot(idx, None)?;
        }
        for (idx, lane) in self.lanes.iter_mut().enumerate() {
            lane.cmds
                .send(Cmd::Flush)
                .map_err(|_| Error::WorkerGone { channel: idx })?;
            lane.pending = Pending::Flush;
        }
        for idx in 0..self.lanes.len() {
            self.wait_slot(idx, None)?;
        }
        Ok(())
    }

    /// Closes the logical stream.
    ///
    /// Waits for every channel's in-flight operation, flushes every channel
    /// if any write occurred, then closes every channel exactly once in
    /// ascending index order. Channels past a failing one are still closed;
    /// the first failure is reported after all have been attempted. Any
    /// later operation fails with [`Error::UseAfterDispose`].
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::UseAfterDispose);
        }
        self.closed = true;
        let mut first_err: Option<Error> = None;

        for idx in 0..self.lanes.len() {
            if let Err(e) = self.wait_slot(idx, None) {
                first_err.get_or_insert(e);
            }
        }

        if self.wrote {
            for (idx, lane) in self.lanes.iter_mut().enumerate() {
                match lane.cmds.send(Cmd::Flush) {
                    Ok(()) => lane.pending = Pending::Flush,
                    Err(_) => {
                        first_err.get_or_insert(Error::WorkerGone { channel: idx });
                    }
                }
            }
            for idx in 0..self.lanes.len() {
                if let Err(e) = self.wait_slot(idx, None) {
                    first_err.get_or_insert(e);
                }
            }
        }

        for idx in 0..self.lanes.len() {
            let lane = &mut self.lanes[idx];
            if lane.cmds.send(Cmd::Close).is_ok() {
                match lane.replies.recv() {
                    Ok(Reply::Closed(Ok(()))) => {}
                    Ok(Reply::Closed(Err(e))) => {
                        first_err.get_or_insert(Error::ChannelIo { channel: idx, source: e });
                    }
                    Ok(_) => unreachable!("worker reply does not match the in-flight command"),
                    Err(_) => {
                        first_err.get_or_insert(Error::WorkerGone { channel: idx });
                    }
                }
            } else {
                first_err.get_or_insert(Error::WorkerGone { channel: idx });
            }
            if let Some(worker) = lane.worker.take() {
                let _ = worker.join();
            }
        }

        log::debug!("closed {} channels", self.lanes.len());
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Read for MultiStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(io::Error::from)
    }
}

impl Write for MultiStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_inner().map_err(io::Error::from)
    }
}

impl Drop for MultiStream {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::debug!("close on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Write-side double: appends everything it is given to a shared sink.
    struct SinkChannel {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for SinkChannel {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for SinkChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for SinkChannel {}

    /// Read-side double: serves a fixed byte sequence, then end-of-data.
    struct SourceChannel {
        data: io::Cursor<Vec<u8>>,
    }

    impl SourceChannel {
        fn new(data: Vec<u8>) -> SourceChannel {
            SourceChannel { data: io::Cursor::new(data) }
        }
    }

    impl Read for SourceChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl Write for SourceChannel {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "read side"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for SourceChannel {
        fn declared_len(&self) -> Option<u64> {
            Some(self.data.get_ref().len() as u64)
        }
    }

    fn sinks(n: usize) -> (Vec<Arc<Mutex<Vec<u8>>>>, Vec<SinkChannel>) {
        let shared: Vec<_> = (0..n).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        let chans = shared
            .iter()
            .map(|s| SinkChannel { data: s.clone() })
            .collect();
        (shared, chans)
    }

    #[test]
    fn routing_is_deterministic() {
        for p in 0..64u64 {
            assert_eq!(route(p, 4, 2), route(p, 4, 2));
            assert_eq!(route(p, 4, 2), ((p / 4) % 2) as usize);
        }
        assert_eq!(route(0, 16384, 3), 0);
        assert_eq!(route(16384, 16384, 3), 1);
        assert_eq!(route(3 * 16384, 16384, 3), 0);
    }

    #[test]
    fn stripe_len_fills_blocks_exactly() {
        assert_eq!(stripe_len(0, 4, 10), 4);
        assert_eq!(stripe_len(3, 4, 10), 1);
        assert_eq!(stripe_len(4, 4, 2), 2);

        // N=3, request not a multiple of B: sub-ranges sum to the request.
        let mut pos = 5u64;
        let mut remaining = 10usize;
        let mut parts = Vec::new();
        while remaining > 0 {
            let len = stripe_len(pos, 4, remaining);
            parts.push(len);
            pos += len as u64;
            remaining -= len;
        }
        assert_eq!(parts.iter().sum::<usize>(), 10);
        assert_eq!(parts, vec![3, 4, 3]);
    }

    #[test]
    fn write_stripes_blocks_round_robin() {
        let (shared, chans) = sinks(2);
        let mut stream = MultiStream::with_block_len(chans, 4).unwrap();

        let bytes: Vec<u8> = (0u8..16).collect();
        stream.write_all(&bytes).unwrap();
        stream.flush().unwrap();

        assert_eq!(stream.position(), 16);
        assert_eq!(*shared[0].lock().unwrap(), vec![0, 1, 2, 3, 8, 9, 10, 11]);
        assert_eq!(*shared[1].lock().unwrap(), vec![4, 5, 6, 7, 12, 13, 14, 15]);
    }

    #[test]
    fn unaligned_writes_keep_block_routing() {
        let (shared, chans) = sinks(2);
        let mut stream = MultiStream::with_block_len(chans, 4).unwrap();

        // Same 16 bytes as above, delivered in awkward pieces.
        let bytes: Vec<u8> = (0u8..16).collect();
        stream.write_all(&bytes[..3]).unwrap();
        stream.write_all(&bytes[3..10]).unwrap();
        stream.write_all(&bytes[10..]).unwrap();
        stream.flush().unwrap();

        assert_eq!(*shared[0].lock().unwrap(), vec![0, 1, 2, 3, 8, 9, 10, 11]);
        assert_eq!(*shared[1].lock().unwrap(), vec![4, 5, 6, 7, 12, 13, 14, 15]);
    }

    #[test]
    fn round_trip_reproduces_the_byte_sequence() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let (shared, chans) = sinks(3);
        let mut writer = MultiStream::with_block_len(chans, 16).unwrap();
        // Uneven write sizes to exercise the decomposition.
        for piece in payload.chunks(777) {
            writer.write_all(piece).unwrap();
        }
        writer.close().unwrap();

        let sources: Vec<_> = shared
            .iter()
            .map(|s| SourceChannel::new(s.lock().unwrap().clone()))
            .collect();
        let mut reader = MultiStream::with_block_len(sources, 16).unwrap();
        assert_eq!(reader.declared_len(), Some(payload.len() as u64));

        let mut got = vec![0u8; payload.len()];
        reader.read_exact(&mut got).unwrap();
        assert_eq!(got, payload);
        assert_eq!(reader.position(), payload.len() as u64);
    }

    #[test]
    fn read_returns_zero_only_at_end_of_every_channel() {
        let sources = vec![
            SourceChannel::new(vec![1; 4]),
            SourceChannel::new(vec![2; 4]),
        ];
        let mut stream = MultiStream::with_block_len(sources, 4).unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf[..4], &[1; 4]);
        assert_eq!(&buf[4..8], &[2; 4]);
        assert_eq!(stream.position(), 8);

        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_of_non_block_multiple_length() {
        let sources = vec![
            SourceChannel::new(vec![0; 64]),
            SourceChannel::new(vec![1; 64]),
            SourceChannel::new(vec![2; 64]),
        ];
        let mut stream = MultiStream::with_block_len(sources, 4).unwrap();

        let mut buf = [9u8; 10];
        assert_eq!(stream.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..4], &[0; 4]);
        assert_eq!(&buf[4..8], &[1; 4]);
        assert_eq!(&buf[8..], &[2; 2]);
        assert_eq!(stream.position(), 10);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let empty: Vec<SourceChannel> = Vec::new();
        assert!(matches!(
            MultiStream::new(empty),
            Err(Error::InvalidConfiguration(_))
        ));

        let chans = vec![SourceChannel::new(vec![0; 4])];
        assert!(matches!(
            MultiStream::with_block_len(chans, 0),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn declared_len_is_none_when_any_channel_lacks_one() {
        let (_, chans) = sinks(1);
        let stream = MultiStream::new(chans).unwrap();
        assert_eq!(stream.declared_len(), None);
    }

    /// Timestamp-recording double: every write sleeps, then records its
    /// entry and exit times.
    struct SlowChannel {
        id: usize,
        spans: Arc<Mutex<Vec<(usize, Instant, Instant)>>>,
    }

    impl Read for SlowChannel {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for SlowChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let entry = Instant::now();
            std::thread::sleep(Duration::from_millis(30));
            self.spans.lock().unwrap().push((self.id, entry, Instant::now()));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for SlowChannel {}

    #[test]
    fn operations_overlap_across_channels_but_not_within_one() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let chans: Vec<_> = (0..2)
            .map(|id| SlowChannel { id, spans: spans.clone() })
            .collect();
        let mut stream = MultiStream::with_block_len(chans, 4).unwrap();

        // Two full blocks per channel.
        stream.write_all(&[0u8; 16]).unwrap();
        stream.flush().unwrap();

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 4);

        let overlap = |a: &(usize, Instant, Instant), b: &(usize, Instant, Instant)| {
            a.1 < b.2 && b.1 < a.2
        };
        for (i, a) in spans.iter().enumerate() {
            for (j, b) in spans.iter().enumerate() {
                if i != j && a.0 == b.0 {
                    assert!(!overlap(a, b), "same-channel operations overlapped");
                }
            }
        }
        assert!(
            spans
                .iter()
                .any(|a| spans.iter().any(|b| a.0 != b.0 && overlap(a, b))),
            "no cross-channel overlap; dispatch is not pipelined"
        );
    }

    /// Fails its n-th operation; behaves like an infinite zero source and a
    /// sink otherwise.
    struct FlakyChannel {
        ops: usize,
        fail_on: usize,
        reads: bool,
    }

    impl FlakyChannel {
        fn tick(&mut self) -> io::Result<()> {
            self.ops += 1;
            if self.ops == self.fail_on {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected"))
            } else {
                Ok(())
            }
        }
    }

    impl Read for FlakyChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.reads {
                return Ok(0);
            }
            self.tick()?;
            buf.fill(0);
            Ok(buf.len())
        }
    }

    impl Write for FlakyChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tick()?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for FlakyChannel {}

    #[test]
    fn read_failure_surfaces_with_the_channel_index() {
        let chans = vec![
            FlakyChannel { ops: 0, fail_on: usize::MAX, reads: true },
            FlakyChannel { ops: 0, fail_on: 2, reads: true },
        ];
        let mut stream = MultiStream::with_block_len(chans, 4).unwrap();

        // First pass touches each channel once and succeeds.
        let mut buf = [0u8; 8];
        assert_eq!(stream.read_inner(&mut buf).unwrap(), 8);

        // Channel 1 fails its second operation; the logical read that
        // touches it fails as a unit, naming the channel.
        let mut buf = [0u8; 8];
        match stream.read_inner(&mut buf) {
            Err(Error::ChannelIo { channel, .. }) => assert_eq!(channel, 1),
            other => panic!("expected channel 1 failure, got {other:?}"),
        }
    }

    #[test]
    fn write_failure_surfaces_at_the_next_slot_wait() {
        let chans = vec![
            FlakyChannel { ops: 0, fail_on: usize::MAX, reads: false },
            FlakyChannel { ops: 0, fail_on: 2, reads: false },
        ];
        let mut stream = MultiStream::with_block_len(chans, 4).unwrap();

        // Both sub-writes on channel 1 are issued without an error; the
        // second one fails inside its worker.
        stream.write_inner(&[0u8; 16]).unwrap();
        assert_eq!(stream.position(), 16);

        match stream.flush_inner() {
            Err(Error::ChannelIo { channel, .. }) => assert_eq!(channel, 1),
            other => panic!("expected channel 1 failure, got {other:?}"),
        }
    }

    /// Records the order of write/flush/close events on a channel.
    struct EventChannel {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Read for EventChannel {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for EventChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(20));
            self.events.lock().unwrap().push("write");
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.events.lock().unwrap().push("flush");
            Ok(())
        }
    }

    impl Channel for EventChannel {
        fn close(&mut self) -> io::Result<()> {
            self.events.lock().unwrap().push("close");
            Ok(())
        }
    }

    #[test]
    fn close_waits_flushes_then_closes_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let chans = vec![EventChannel { events: events.clone() }];
        let mut stream = MultiStream::with_block_len(chans, 4).unwrap();

        // The write is still in flight inside the worker when close runs.
        stream.write_inner(&[0u8; 4]).unwrap();
        stream.close().unwrap();

        assert_eq!(*events.lock().unwrap(), vec!["write", "flush", "close"]);

        assert!(matches!(stream.write_inner(&[0u8; 1]), Err(Error::UseAfterDispose)));
        assert!(matches!(stream.read_inner(&mut [0u8; 1]), Err(Error::UseAfterDispose)));
        assert!(matches!(stream.flush_inner(), Err(Error::UseAfterDispose)));
        assert!(matches!(stream.close(), Err(Error::UseAfterDispose)));
    }

    /// Close fails on the flagged channel; a shared log records which
    /// channels got their close call.
    struct BrittleCloseChannel {
        id: usize,
        fail_close: bool,
        closes: Arc<Mutex<Vec<usize>>>,
    }

    impl Read for BrittleCloseChannel {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for BrittleCloseChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for BrittleCloseChannel {
        fn close(&mut self) -> io::Result<()> {
            self.closes.lock().unwrap().push(self.id);
            if self.fail_close {
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "injected"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn close_continues_past_a_failing_channel() {
        let closes = Arc::new(Mutex::new(Vec::new()));
        let chans = vec![
            BrittleCloseChannel { id: 0, fail_close: true, closes: closes.clone() },
            BrittleCloseChannel { id: 1, fail_close: false, closes: closes.clone() },
        ];
        let mut stream = MultiStream::with_block_len(chans, 4).unwrap();

        // Channel 0's close fails; channel 1 is still closed and the
        // first failure is what the call reports.
        match stream.close() {
            Err(Error::ChannelIo { channel, .. }) => assert_eq!(channel, 0),
            other => panic!("expected channel 0 close failure, got {other:?}"),
        }
        assert_eq!(*closes.lock().unwrap(), vec![0, 1]);
    }

    /// Never-ending source that trickles one byte every few milliseconds.
    struct TrickleChannel;

    impl Read for TrickleChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            buf[0] = 0;
            Ok(1)
        }
    }

    impl Write for TrickleChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for TrickleChannel {}

    #[test]
    fn cancellation_aborts_a_pending_read_and_close_still_works() {
        let mut stream = MultiStream::with_block_len(vec![TrickleChannel], 2048).unwrap();
        let handle = stream.cancel_handle();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        // Without cancellation this read would take several seconds.
        let mut buf = [0u8; 1024];
        assert!(matches!(stream.read_inner(&mut buf), Err(Error::Cancelled)));
        canceller.join().unwrap();

        stream.close().unwrap();
    }
}
