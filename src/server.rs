//! Wires the receiver, the worker pool, and the storage table
//! together around one listening socket.
use std::io::ErrorKind;
use std::io::Result;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use crate::config::Config;
use crate::receiver::Receiver;
use crate::report::Summary;
use crate::shutdown::Shutdown;
use crate::table::StorageTable;
use crate::worker::WorkerPool;
use crate::workload_queue::WorkloadQueue;

/// State shared by the receiver and every worker.
#[derive(Debug)]
pub struct Context {
    pub config: Config,
    pub table: StorageTable,
    /// One queue per worker.
    pub queues: Vec<WorkloadQueue>,
    pub shutdown: Shutdown,
}

impl Context {
    pub fn new(config: Config) -> Context {
        let table = StorageTable::new(
            config.max_files,
            config.max_storage,
            config.bucket_count(),
            config.cache_eviction_policy,
        );
        let queues = (0..config.num_workers).map(|_| WorkloadQueue::new()).collect();

        Context {
            config,
            table,
            queues,
            shutdown: Shutdown::new(),
        }
    }

    /// Interrupts every worker blocked on its queue, so they can
    /// notice a hard shutdown.
    pub fn wake_workers(&self) {
        for queue in &self.queues {
            queue.wake();
        }
    }
}

#[derive(Debug)]
pub struct Server {
    context: Arc<Context>,
    listener: UnixListener,
}

impl Server {
    /// Binds the configured socket, replacing any stale socket file
    /// left behind by a previous run.
    pub fn bind(config: Config) -> Result<Server> {
        let path = &config.socket_filepath;

        match std::fs::remove_file(path) {
            Ok(()) => log::info!("Removed stale socket file {}.", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        log::info!("Listening on {}.", path.display());

        Ok(Server {
            context: Arc::new(Context::new(config)),
            listener,
        })
    }

    /// Returns the shared context, e.g., to request a shutdown.
    pub fn context(&self) -> Arc<Context> {
        self.context.clone()
    }

    /// Serves clients until shutdown, then joins the workers and
    /// returns the final summary.
    pub fn run(self) -> Result<Summary> {
        let Server { context, listener } = self;
        let socket = context.config.socket_filepath.clone();

        let pool = WorkerPool::spawn(&context)?;
        let result = Receiver::new(context.clone(), listener).run();
        if let Err(e) = &result {
            log::error!("Receive loop failed: {}.", e);
        }

        context.shutdown.request_hard();
        context.wake_workers();
        log::info!("Waiting for workers to shut down.");
        pool.join();

        if let Err(e) = std::fs::remove_file(&socket) {
            log::debug!("Failed to remove socket file {}: {}.", socket.display(), e);
        }

        result?;
        Ok(Summary::collect(&context.table))
    }
}

#[cfg(test)]
mod test {
    use crate::client::ClientError;
    use crate::client::Connection;
    use crate::client::RemoteFile;
    use crate::framer::encode;
    use crate::protocol::Request;
    use crate::server::*;
    use std::path::PathBuf;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use std::time::Instant;
    use test_dir::{DirBuilder, TestDir};

    struct Running {
        context: Arc<Context>,
        socket: PathBuf,
        handle: JoinHandle<Result<Summary>>,
    }

    impl Running {
        fn connect(&self) -> Connection {
            Connection::open(
                &self.socket,
                Duration::from_millis(10),
                Instant::now() + Duration::from_secs(10),
            )
            .expect("connect must succeed")
        }

        fn stop(self) -> Summary {
            self.context.shutdown.request_hard();
            self.context.wake_workers();
            self.handle
                .join()
                .expect("server must not panic")
                .expect("server must succeed")
        }
    }

    /// Starts a server on a socket in `temp`, with `settings` for the
    /// `[server]` table, minus the socket path.
    fn start_with(temp: &TestDir, settings: &str) -> Running {
        let socket = temp.path("sol.sock");
        let config = Config::from_toml_str(&format!(
            "[server]\nsocket-filepath = \"{}\"\n{}",
            socket.display(),
            settings
        ))
        .expect("config must parse");

        let server = Server::bind(config).expect("bind must succeed");
        let context = server.context();
        let handle = std::thread::spawn(move || server.run());

        Running {
            context,
            socket,
            handle,
        }
    }

    fn start(temp: &TestDir, max_files: u64, max_storage: u64, policy: &str) -> Running {
        start_with(
            temp,
            &format!(
                r#"
max-files = {}
max-storage = {}
num-workers = 4
cache-eviction-policy = "{}"
max-message-size = 4096
"#,
                max_files, max_storage, policy
            ),
        )
    }

    fn file(path: &str, contents: &[u8]) -> RemoteFile {
        RemoteFile {
            path: path.to_owned(),
            contents: contents.to_vec(),
        }
    }

    #[test]
    fn test_read_after_write() {
        let temp = TestDir::temp();
        let server = start(&temp, 10, 1000, "fifo");
        let mut client = server.connect();

        assert!(matches!(
            client.read_file("/a"),
            Err(ClientError::Rejected)
        ));
        client.open_file("/a", true, false).expect("create must succeed");
        assert!(client
            .write_file("/a", b"hello")
            .expect("write must succeed")
            .is_empty());
        assert!(client
            .append_to_file("/a", b", world")
            .expect("append must succeed")
            .is_empty());
        assert_eq!(
            client.read_file("/a").expect("read must succeed"),
            b"hello, world"
        );

        client.close_file("/a").expect("close must succeed");
        assert!(matches!(
            client.close_file("/a"),
            Err(ClientError::Rejected)
        ));
        client.open_file("/a", false, false).expect("open must succeed");
        client.remove_file("/a").expect("remove must succeed");
        assert!(matches!(
            client.read_file("/a"),
            Err(ClientError::Rejected)
        ));

        let summary = server.stop();
        assert_eq!(summary.stats.files, 0);
        assert_eq!(summary.stats.max_bytes_seen, 12);
        assert!(!temp.path("sol.sock").exists());
    }

    /// Writes that overflow the budget send back the evicted files.
    #[test]
    fn test_eviction_over_the_wire() {
        for policy in ["fifo", "segmented-fifo"] {
            let temp = TestDir::temp();
            let server = start(&temp, 1, 1000, policy);
            let mut client = server.connect();

            client.open_file("a", true, false).expect("create must succeed");
            client.write_file("a", b"first").expect("write must succeed");
            client.open_file("b", true, false).expect("create must succeed");

            let evicted = client.write_file("b", b"second").expect("write must succeed");
            assert_eq!(evicted, vec![file("a", b"first")]);

            let summary = server.stop();
            assert_eq!(summary.stats.evictions, 1);
            assert_eq!(summary.files, vec![("b".to_owned(), 6)]);
        }
    }

    #[test]
    fn test_read_n_files() {
        let temp = TestDir::temp();
        let server = start(&temp, 10, 1000, "fifo");
        let mut client = server.connect();

        assert!(client.read_n_files(0).expect("read must succeed").is_empty());
        for path in ["x", "y", "z"] {
            client.open_file(path, true, false).expect("create must succeed");
            client
                .write_file(path, path.as_bytes())
                .expect("write must succeed");
        }

        assert_eq!(client.read_n_files(2).expect("read must succeed").len(), 2);
        let mut all = client.read_n_files(0).expect("read must succeed");
        all.sort();
        assert_eq!(all, vec![file("x", b"x"), file("y", b"y"), file("z", b"z")]);

        server.stop();
    }

    /// Locks are per connection, and released when the owner hangs
    /// up.
    #[test]
    fn test_locks_across_connections() {
        let temp = TestDir::temp();
        let server = start(&temp, 10, 1000, "fifo");
        let mut alice = server.connect();
        let mut bob = server.connect();

        alice.open_file("f", true, true).expect("create must succeed");
        assert!(matches!(bob.lock_file("f"), Err(ClientError::Rejected)));
        assert!(matches!(
            bob.write_file("f", b"mine"),
            Err(ClientError::Rejected)
        ));
        // Not an error, but not a removal either.
        bob.remove_file("f").expect("remove must be accepted");
        assert_eq!(bob.read_file("f").expect("read must succeed"), b"");

        alice.unlock_file("f").expect("unlock must succeed");
        alice.lock_file("f").expect("lock must succeed");
        drop(alice);

        // Once the receiver reaps Alice's connection, a worker releases
        // her lock.
        let deadline = Instant::now() + Duration::from_secs(10);
        while bob.lock_file("f").is_err() {
            assert!(Instant::now() < deadline, "lock never released");
            std::thread::sleep(Duration::from_millis(10));
        }

        bob.write_file("f", b"mine").expect("write must succeed");
        server.stop();
    }

    /// A bad connection doesn't hurt its neighbours.
    #[test]
    fn test_bad_clients() {
        let temp = TestDir::temp();
        let server = start(&temp, 10, 1000, "fifo");
        let mut good = server.connect();
        let mut oversized = server.connect();
        let mut garbage = server.connect();

        good.open_file("g", true, false).expect("create must succeed");

        oversized
            .send_raw(&u64::MAX.to_be_bytes())
            .expect("send must succeed");
        garbage
            .send_raw(&encode(&[0xee, 1, 2, 3]))
            .expect("send must succeed");

        // Both misbehaving connections get hung up on.
        assert!(oversized.read_file("g").is_err());
        assert!(garbage.read_file("g").is_err());

        good.write_file("g", b"fine").expect("write must succeed");
        assert_eq!(good.read_file("g").expect("read must succeed"), b"fine");
        server.stop();
    }

    /// Soft shutdown lets connected clients finish, then the server
    /// exits on its own.
    #[test]
    fn test_soft_shutdown() {
        let temp = TestDir::temp();
        let server = start(&temp, 10, 1000, "fifo");
        let mut client = server.connect();

        client.open_file("s", true, false).expect("create must succeed");
        server.context.shutdown.request_soft();
        client.write_file("s", b"still served").expect("write must succeed");
        drop(client);

        let summary = server
            .handle
            .join()
            .expect("server must not panic")
            .expect("server must succeed");
        assert_eq!(summary.files, vec![("s".to_owned(), 12)]);
    }

    /// A client that sends reads but never reads the responses can't
    /// wedge its worker, or keep the server from stopping.
    #[test]
    fn test_client_never_reads() {
        const SIZE: usize = 1 << 20;

        let temp = TestDir::temp();
        let server = start_with(
            &temp,
            r#"
max-files = 10
max-storage = 16777216
num-workers = 1
cache-eviction-policy = "fifo"
write-timeout-ms = 100
"#,
        );
        let mut good = server.connect();
        good.open_file("big", true, false).expect("create must succeed");
        good.write_file("big", &vec![7u8; SIZE]).expect("write must succeed");

        let mut stuck = Connection::connect(&server.socket).expect("connect must succeed");
        let read = encode(
            &Request::Read {
                path: "big".to_owned(),
            }
            .encode(),
        );
        for _ in 0..8 {
            stuck.send_raw(&read).expect("send must succeed");
        }
        std::thread::sleep(Duration::from_millis(50));

        // There's only one worker, and it must get back to us.
        let start = Instant::now();
        assert_eq!(good.read_file("big").expect("read must succeed").len(), SIZE);
        assert!(start.elapsed() < Duration::from_secs(5));

        // The stuck client gets hung up on.  Empty messages have no
        // response, so sending them doesn't unblock anything.
        let deadline = Instant::now() + Duration::from_secs(5);
        while stuck.send_raw(&encode(&[])).is_ok() {
            assert!(Instant::now() < deadline, "stuck client never hung up on");
            std::thread::sleep(Duration::from_millis(10));
        }

        let start = Instant::now();
        server.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    /// Hard shutdown doesn't wait for the write timeout.
    #[test]
    fn test_hard_shutdown_with_stuck_client() {
        let temp = TestDir::temp();
        let server = start_with(
            &temp,
            r#"
max-files = 10
max-storage = 16777216
num-workers = 1
cache-eviction-policy = "fifo"
write-timeout-ms = 600000
"#,
        );
        let mut writer = server.connect();
        writer.open_file("big", true, false).expect("create must succeed");
        writer
            .write_file("big", &vec![7u8; 4 << 20])
            .expect("write must succeed");

        let mut stuck = Connection::connect(&server.socket).expect("connect must succeed");
        let read = encode(
            &Request::Read {
                path: "big".to_owned(),
            }
            .encode(),
        );
        stuck.send_raw(&read).expect("send must succeed");
        // Give the worker time to block on the response.
        std::thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        server.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    /// A stale socket file doesn't prevent binding.
    #[test]
    fn test_stale_socket() {
        let temp = TestDir::temp();
        let socket = temp.path("sol.sock");

        drop(UnixListener::bind(&socket).expect("bind must succeed"));
        assert!(socket.exists());

        let server = start(&temp, 10, 1000, "fifo");
        server.connect();
        server.stop();
    }
}
