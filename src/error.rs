use std::io;

/// The error type for multiplexed stream operations.
///
/// Channel-level failures are reported asynchronously: they are observed by
/// whichever call next waits on the failing channel's in-flight slot, which
/// is not necessarily the call that issued the failing operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream was constructed with unusable parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// An underlying channel failed a read, write, flush or close.
    #[error("i/o failure on channel {channel}")]
    ChannelIo {
        /// Index of the failing channel within the stream's channel set.
        channel: usize,
        /// The underlying i/o error.
        #[source]
        source: io::Error,
    },

    /// An operation was attempted after `close` completed.
    #[error("stream used after close")]
    UseAfterDispose,

    /// The operation was aborted by a [`CancelHandle`](crate::CancelHandle).
    #[error("operation cancelled")]
    Cancelled,

    /// A channel's worker thread terminated without replying.
    #[error("worker for channel {channel} terminated unexpectedly")]
    WorkerGone {
        /// Index of the channel whose worker died.
        channel: usize,
    },
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match &e {
            Error::InvalidConfiguration(_) => io::ErrorKind::InvalidInput,
            Error::ChannelIo { source, .. } => source.kind(),
            Error::UseAfterDispose => io::ErrorKind::NotConnected,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::WorkerGone { .. } => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, e)
    }
}
