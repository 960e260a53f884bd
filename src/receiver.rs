//! The receiver owns the listening socket and every client
//! connection.  It runs a single `poll(2)` loop that accepts
//! connections, reads exactly the bytes each connection's framer
//! asks for, and hands complete messages over to the workers.
//!
//! The receiver never touches the storage table.  When a connection
//! goes away, it hands its last reference to the stream over to a
//! worker in a hang-up message; see [`crate::worker`] for how that
//! releases the connection's locks.
use rand::Rng;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Result;
use std::net::Shutdown as SocketShutdown;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use crate::config::WorkerSelection;
use crate::framer::Feed;
use crate::framer::Framer;
use crate::server::Context;
use crate::workload_queue::Message;
use crate::workload_queue::MessageKind;
use crate::ConnectionId;

/// `poll` wakes up at least this often to check for shutdown
/// requests.
const POLL_TIMEOUT_MS: libc::c_int = 200;

#[derive(Debug)]
struct Connection {
    id: ConnectionId,
    stream: Arc<UnixStream>,
    framer: Framer,
    // Set when the connection should be reaped.
    dead: bool,
}

#[derive(Debug)]
pub struct Receiver {
    context: Arc<Context>,
    listener: UnixListener,
    connections: Vec<Connection>,
    next_id: u64,
}

impl Receiver {
    /// Returns a receiver for `listener`.  The listener should be in
    /// non-blocking mode.
    pub fn new(context: Arc<Context>, listener: UnixListener) -> Receiver {
        Receiver {
            context,
            listener,
            connections: Vec::new(),
            next_id: 0,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Returns whether the receive loop should stop: on hard shutdown,
    /// or once soft shutdown has closed the door and every remaining
    /// client has left.
    pub fn is_dead(&self) -> bool {
        let shutdown = &self.context.shutdown;

        shutdown.is_hard() || (shutdown.is_soft() && self.connections.is_empty())
    }

    /// Polls until the receiver is dead.
    pub fn run(&mut self) -> Result<()> {
        while !self.is_dead() {
            self.poll_once()?;
        }

        if self.context.shutdown.is_hard() {
            log::info!(
                "Hard shutdown: dropping {} connection(s).",
                self.connections.len()
            );
        } else {
            log::info!("No more connections after soft shutdown.");
        }

        // Workers may be blocked writing to these streams: shutting
        // them down makes the writes fail right away.
        for connection in &mut self.connections {
            if let Err(e) = connection.stream.shutdown(SocketShutdown::Both) {
                log::debug!("Failed to shut down {:?}: {}.", connection.id, e);
            }

            connection.dead = true;
        }

        self.reap();
        Ok(())
    }

    fn pick_worker(&self, id: ConnectionId) -> usize {
        let workers = self.context.queues.len();

        match self.context.config.worker_selection {
            WorkerSelection::Sticky => (id.0 % workers as u64) as usize,
            WorkerSelection::Random => rand::thread_rng().gen_range(0..workers),
        }
    }

    fn enqueue(&self, id: ConnectionId, reply_to: Arc<UnixStream>, kind: MessageKind) {
        let worker = self.pick_worker(id);

        log::trace!("Handing {:?} from {:?} to worker {}.", kind, id, worker);
        self.context.queues[worker].push(Message {
            connection: id,
            reply_to,
            kind,
        });
    }

    /// Drops dead connections, and lets the workers know.  Queued
    /// messages keep their own reference to the stream, so pending
    /// responses still go out.  The hang-up message takes over the
    /// receiver's reference.
    fn reap(&mut self) {
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|connection| connection.dead);

        self.connections = live;
        for connection in dead {
            log::debug!("Reaping {:?}.", connection.id);
            self.enqueue(connection.id, connection.stream, MessageKind::Hangup);
        }
    }

    fn accept(&mut self) {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Ignoring faulty connection: {}.", e);
                    return;
                }
            };

            if self.context.shutdown.is_soft() {
                log::info!("Refusing a new connection during shutdown.");
                continue;
            }

            // The listener is non-blocking, but client streams block:
            // we only read what `poll` says is there, and workers
            // write whole responses, but never for longer than the
            // write timeout.
            let setup = stream
                .set_nonblocking(false)
                .and_then(|()| stream.set_write_timeout(Some(self.context.config.write_timeout())));
            if let Err(e) = setup {
                log::warn!("Dropping new connection: {}.", e);
                continue;
            }

            let id = ConnectionId(self.next_id);
            self.next_id += 1;

            log::info!("Accepted {:?}.", id);
            self.connections.push(Connection {
                id,
                stream: Arc::new(stream),
                framer: Framer::with_limit(self.context.config.max_message_size),
                dead: false,
            });
        }
    }

    /// Reads once from the `index`th connection.
    fn service(&mut self, index: usize) {
        let connection = &mut self.connections[index];
        let id = connection.id;

        let read = (&*connection.stream).read(connection.framer.buffer_mut());
        let count = match read {
            Ok(0) => {
                log::info!("Dropping {:?}: end of stream.", id);
                connection.dead = true;
                return;
            }
            Ok(count) => count,
            Err(e) if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => {
                return
            }
            Err(e) => {
                log::warn!("Dropping {:?}: {}.", id, e);
                connection.dead = true;
                return;
            }
        };

        log::trace!("Read {} bytes from {:?}.", count, id);
        match connection.framer.feed(count) {
            Ok(Feed::Incomplete(_)) => {}
            Ok(Feed::Complete(payload)) => {
                log::debug!("Got a {}-byte message from {:?}.", payload.len(), id);
                let stream = connection.stream.clone();
                self.enqueue(id, stream, MessageKind::Request(payload));
            }
            Err(e) => {
                log::warn!("Dropping {:?}: {}.", id, e);
                connection.dead = true;
            }
        }
    }

    /// Waits for activity (or the poll timeout), and handles it.
    pub fn poll_once(&mut self) -> Result<()> {
        self.reap();

        let pollfd = |fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let mut fds: Vec<libc::pollfd> = std::iter::once(pollfd(self.listener.as_raw_fd()))
            .chain(
                self.connections
                    .iter()
                    .map(|connection| pollfd(connection.stream.as_raw_fd())),
            )
            .collect();

        // SAFETY: `fds` is a valid array of `fds.len()` pollfds, and
        // every descriptor in it stays open for the call.
        let ready =
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let error = std::io::Error::last_os_error();
            // Signals interrupt `poll`; the caller checks for shutdown.
            if error.kind() == ErrorKind::Interrupted {
                return Ok(());
            }

            return Err(error);
        }

        if ready == 0 || self.context.shutdown.is_hard() {
            return Ok(());
        }

        // `fds[1..]` lines up with `self.connections`, and accepting
        // only appends to the latter.
        for (index, fd) in fds[1..].iter().enumerate() {
            if fd.revents != 0 {
                self.service(index);
            }
        }

        if fds[0].revents != 0 {
            self.accept();
        }

        Ok(())
    }
}
