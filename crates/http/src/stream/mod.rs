//! Buffered asynchronous socket streams.
//!
//! This module provides [`IoStream`], the read/write primitive every
//! connection is built on. It hides partial reads and writes behind three
//! completion-driven operations:
//!
//! - [`IoStream::read_until`]: deliver decoded text up to and including a
//!   delimiter
//! - [`IoStream::read_exactly`]: deliver an exact number of raw bytes
//! - [`IoStream::write`]: flush buffered bytes and signal completion
//!
//! # Features
//!
//! - Synchronous completion when the data is already buffered
//! - Incremental UTF-8 decoding across read boundaries
//! - Append-only read buffer with periodic compaction
//! - Deferred close while a write is in flight
//! - At most one pending read and one pending write per stream

mod io_stream;

pub use io_stream::{IoStream, ReadBytesCallback, ReadTextCallback, WriteCallback};
