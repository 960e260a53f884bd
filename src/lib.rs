//! Sol is a multithreaded in-memory file storage server, with bounded
//! capacity and automatic eviction.  Clients talk to the server over
//! a local stream socket, and manipulate "files": byte blobs
//! identified by a path, that live only in the server's memory.
//!
//! The server enforces two budgets: a maximum number of files, and a
//! maximum total size for their contents.  Every write or append that
//! pushes the table over either budget synchronously evicts other
//! files until the table fits again.  Evicted files are not an error:
//! the server sends them back, in full, to the client whose write
//! triggered the eviction, since that's the last copy.
//!
//! # Architecture
//!
//! One [`receiver::Receiver`] thread owns the listening socket and
//! every client connection.  It runs a `poll(2)` loop, and feeds each
//! connection's bytes to that connection's [`framer::Framer`], which
//! turns the byte stream into discrete length-prefixed messages.
//! Complete messages go to one of N [`workload_queue::WorkloadQueue`]s,
//! each drained by a single worker thread (see [`worker`]).  Workers
//! decode each message into a [`protocol::Request`], apply it to the
//! shared [`table::StorageTable`], and write the response directly to
//! the originating connection.
//!
//! The receiver never touches the table, and workers only ever write
//! to the connection a message came from.  By default, all messages
//! from a connection go to the same worker, so requests are processed
//! in the order they were sent; the `random` worker selection mode
//! relaxes that ordering.
//!
//! # Storage table and eviction
//!
//! The table is split in a fixed number of buckets, each behind its
//! own mutex, and each file lives in the bucket picked by a hash of
//! its path.  Operations on distinct buckets run fully in parallel;
//! operations on the same path are serialised by its bucket's lock.
//! Global counters (file count, bytes, historical maxima, evictions)
//! live behind a separate mutex, and are never acquired while holding
//! a bucket lock, except by the eviction pass, which always takes the
//! counters first.
//!
//! Two eviction policies are available:
//!
//! - `fifo` evicts files in creation order.  The insertion-order queue
//!   isn't updated when clients remove files; stale entries are
//!   skipped when they reach the front of the queue.
//! - `segmented-fifo` evicts the newest file in a uniformly chosen
//!   non-empty bucket.  Despite the name, that's random eviction over
//!   buckets, not a segmented LRU.
//!
//! Neither policy evicts the file being written unless it's the only
//! file left and still too large.
//!
//! # Locks
//!
//! Clients may lock files.  A locked file may only be written,
//! closed, unlocked, or removed by the connection that locked it.
//! Removing a file locked by another connection silently does
//! nothing, and reports success.  Reads ignore locks.  When a
//! connection goes away, every lock it held is released.
//!
//! # Failures
//!
//! Table errors (missing file, already open, locked by someone else,
//! ...) are expected, and reported to the client as an error status.
//! Framing errors and undecodable requests drop the offending
//! connection.  Socket errors only affect the connection they happen
//! on, and so does a client that stops reading its responses: workers
//! give up on it after the configured write timeout, and hang up.  A
//! poisoned mutex, however, means a thread panicked in the
//! middle of a critical section, and the whole process aborts rather
//! than serve possibly corrupt data.
//!
//! # Shutdown
//!
//! A soft shutdown stops accepting new connections; the server exits
//! once every connected client has hung up.  A hard shutdown stops
//! everything as soon as possible.  Both are requested by setting
//! atomic flags in [`shutdown::Shutdown`], which is safe to do from a
//! signal handler.
//!
//! # Sample usage
//!
//! ```no_run
//! use sol_storage::client::Connection;
//! use std::time::{Duration, Instant};
//!
//! # fn main() -> Result<(), sol_storage::client::ClientError> {
//! let mut conn = Connection::open(
//!     "/tmp/sol.sock",
//!     Duration::from_millis(100),
//!     Instant::now() + Duration::from_secs(5),
//! )?;
//!
//! conn.open_file("/notes/today", /*create=*/ true, /*lock=*/ false)?;
//! for evicted in conn.write_file("/notes/today", b"buy milk")? {
//!     println!("server evicted {}", evicted.path);
//! }
//!
//! assert_eq!(conn.read_file("/notes/today")?, b"buy milk");
//! # Ok(())
//! # }
//! ```
mod benign_error;
mod bucket;
pub mod client;
pub mod config;
pub mod eviction;
pub mod framer;
mod key_hash;
pub mod protocol;
pub mod receiver;
pub mod report;
pub mod server;
pub mod shutdown;
mod sync;
pub mod table;
pub mod worker;
pub mod workload_queue;

pub use bucket::File;
pub use config::Config;
pub use server::Context;
pub use server::Server;
pub use table::StorageTable;

/// Identifies one client connection for the lifetime of the server.
///
/// Connection ids are never reused, unlike file descriptors, so a
/// lock held by a connection that went away can't be inherited by a
/// new connection that happens to get the same descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);
