//! # Multi Stream - Striped TLS Throughput Library
//!
//! Multi Stream measures bulk-transfer throughput over encrypted duplex
//! connections. It presents one logical readable/writable byte stream
//! backed by several independent connections ("channels"), striping data
//! across them in fixed-size blocks so that network and encryption latency
//! on one channel does not stall the others.
//!
//! ## Key Features
//!
//! - **Block Striping**: The logical byte sequence is split into
//!   fixed-size blocks (16 KiB by default) assigned to channels
//!   round-robin, with no added headers or framing
//! - **Pipelined I/O**: One worker per channel keeps an operation in
//!   flight on every channel at once, so aggregate throughput approaches
//!   the sum of the channels rather than the slowest one
//! - **Deterministic Reassembly**: Routing is a pure function of cursor
//!   position, block size and channel count, so a peer holding the other
//!   ends of the same channels reconstructs the identical byte sequence
//! - **Transparent API**: A [`MultiStream`] is used through the familiar
//!   `std::io::Read` and `std::io::Write` traits
//!
//! ## How It Works
//!
//! A logical read or write is decomposed into block-bounded sub-ranges,
//! each routed to the channel owning that block. Before a channel is
//! reused its previous operation is awaited, which keeps every channel's
//! byte sequence internally ordered; distinct channels run concurrently.
//! A read call settles all of its sub-reads before returning and reports
//! the byte sum, with `0` signalling the end of the logical stream.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::io::Read;
//! use multi_stream::MultiStream;
//!
//! // Establish four TLS connections carrying one logical stream.
//! let config = multi_stream::client_config();
//! let channels = (0..4)
//!     .map(|_| multi_stream::connect("127.0.0.1:8080", "localhost", config.clone()))
//!     .collect::<std::io::Result<Vec<_>>>()?;
//!
//! let mut stream = MultiStream::new(channels)?;
//! let mut buf = vec![0u8; 1024 * 1024];
//! loop {
//!     let n = stream.read(&mut buf)?;
//!     if n == 0 {
//!         break;
//!     }
//!     // account the bytes...
//! }
//! stream.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Perf Tools
//!
//! The crate ships two binaries: `mperf`, which stripes a zero-filled
//! payload over a configurable number of TLS connections and reports Mbps
//! on both ends, and `tlsperf`, the single-connection baseline to compare
//! against.
//!
//! ## Failure Model
//!
//! A channel failure fails the whole logical stream: it surfaces, with the
//! channel's index, from the next call that waits on that channel. There
//! is no retry, no per-channel recovery and no seeking; the stream is
//! forward-only.

#![warn(missing_docs)]

mod error;
mod multi_stream;
mod tls;
mod zero;

pub use error::Error;
pub use multi_stream::*;
pub use tls::*;
pub use zero::*;
