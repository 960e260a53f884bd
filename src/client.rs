//! A blocking client for the storage server.
//!
//! Every call sends one request and waits for its full response, so a
//! `Connection` never has more than one request in flight.
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

use crate::framer::encode;
use crate::protocol::read_bytes;
use crate::protocol::read_status;
use crate::protocol::read_u64_from;
use crate::protocol::Request;
use crate::protocol::Status;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the server rejected the request")]
    Rejected,
    #[error("malformed response from the server")]
    BadResponse,
    #[error("timed out connecting to {}", .0.display())]
    Timeout(PathBuf),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A file sent back by the server: read, or evicted to make room.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteFile {
    pub path: String,
    pub contents: Vec<u8>,
}

#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    /// Connects to the server listening on `socket`, once.
    pub fn connect(socket: impl AsRef<Path>) -> Result<Connection> {
        Ok(Connection {
            stream: UnixStream::connect(socket)?,
        })
    }

    /// Connects to the server listening on `socket`, retrying every
    /// `interval` until `deadline`.  The server may not be listening
    /// yet, or may have a stale socket file lying around.
    pub fn open(
        socket: impl AsRef<Path>,
        interval: Duration,
        deadline: Instant,
    ) -> Result<Connection> {
        let socket = socket.as_ref();

        loop {
            match UnixStream::connect(socket) {
                Ok(stream) => return Ok(Connection { stream }),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::NotFound | ErrorKind::ConnectionRefused
                    ) =>
                {
                    log::debug!("Server at {} not ready: {}.", socket.display(), e);
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout(socket.to_owned()));
            }

            std::thread::sleep(interval.min(deadline - now));
        }
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        self.stream.write_all(&encode(&request.encode()))?;
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        read_status(&mut self.stream)?.ok_or(ClientError::BadResponse)
    }

    /// Sends a request with a single status byte for response.
    fn simple(&mut self, request: Request) -> Result<()> {
        self.send(&request)?;
        match self.status()? {
            Status::Ok => Ok(()),
            Status::Err => Err(ClientError::Rejected),
        }
    }

    fn read_file_block(&mut self) -> Result<RemoteFile> {
        let path_len = read_u64_from(&mut self.stream)?;
        let contents_len = read_u64_from(&mut self.stream)?;
        let path = read_bytes(&mut self.stream, path_len)?;
        let contents = read_bytes(&mut self.stream, contents_len)?;

        Ok(RemoteFile {
            path: String::from_utf8(path).map_err(|_| ClientError::BadResponse)?,
            contents,
        })
    }

    /// Opens `path`, creating it first if `create`, and locking it if
    /// `lock`.
    pub fn open_file(&mut self, path: &str, create: bool, lock: bool) -> Result<()> {
        self.simple(Request::Open {
            path: path.to_owned(),
            create,
            lock,
        })
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.send(&Request::Read {
            path: path.to_owned(),
        })?;

        match self.status()? {
            Status::Ok => {
                let len = read_u64_from(&mut self.stream)?;
                Ok(read_bytes(&mut self.stream, len)?)
            }
            Status::Err => Err(ClientError::Rejected),
        }
    }

    /// Fetches up to `count` files, or all of them if `count == 0`.
    pub fn read_n_files(&mut self, count: u64) -> Result<Vec<RemoteFile>> {
        self.send(&Request::ReadN { count })?;

        let mut ret = Vec::new();
        loop {
            // Peek at the path length: zero ends the list.
            let mut header = [0u8; 8];
            self.stream.read_exact(&mut header)?;
            let path_len = u64::from_be_bytes(header);
            if path_len == 0 {
                return Ok(ret);
            }

            let contents_len = read_u64_from(&mut self.stream)?;
            let path = read_bytes(&mut self.stream, path_len)?;
            let contents = read_bytes(&mut self.stream, contents_len)?;
            ret.push(RemoteFile {
                path: String::from_utf8(path).map_err(|_| ClientError::BadResponse)?,
                contents,
            });
        }
    }

    fn with_evictions(&mut self, request: Request) -> Result<Vec<RemoteFile>> {
        self.send(&request)?;

        let status = self.status()?;
        let count = read_u64_from(&mut self.stream)?;
        let evicted = (0..count)
            .map(|_| self.read_file_block())
            .collect::<Result<Vec<_>>>()?;

        match status {
            Status::Ok => Ok(evicted),
            Status::Err => Err(ClientError::Rejected),
        }
    }

    /// Replaces the contents of `path`.  Returns the files the server
    /// evicted to make room: this is their last copy.
    pub fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<Vec<RemoteFile>> {
        self.with_evictions(Request::Write {
            path: path.to_owned(),
            contents: contents.to_vec(),
        })
    }

    /// Appends to `path`.  Returns the files the server evicted to make
    /// room.
    pub fn append_to_file(&mut self, path: &str, contents: &[u8]) -> Result<Vec<RemoteFile>> {
        self.with_evictions(Request::Append {
            path: path.to_owned(),
            contents: contents.to_vec(),
        })
    }

    pub fn lock_file(&mut self, path: &str) -> Result<()> {
        self.simple(Request::Lock {
            path: path.to_owned(),
        })
    }

    pub fn unlock_file(&mut self, path: &str) -> Result<()> {
        self.simple(Request::Unlock {
            path: path.to_owned(),
        })
    }

    pub fn close_file(&mut self, path: &str) -> Result<()> {
        self.simple(Request::Close {
            path: path.to_owned(),
        })
    }

    /// Removes `path`.  Succeeds without effect if another connection
    /// holds the file's lock.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.simple(Request::Remove {
            path: path.to_owned(),
        })
    }

    /// Sends raw bytes, for tests that need to misbehave.
    #[cfg(test)]
    pub(crate) fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::client::*;
    use test_dir::{DirBuilder, TestDir};

    /// Nobody's listening: give up at the deadline.
    #[test]
    fn test_open_timeout() {
        let temp = TestDir::temp();
        let socket = temp.path("nobody.sock");
        let start = Instant::now();

        let result = Connection::open(
            &socket,
            Duration::from_millis(10),
            start + Duration::from_millis(50),
        );
        assert!(matches!(result, Err(ClientError::Timeout(path)) if path == socket));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    /// The server shows up late: keep retrying until it does.
    #[test]
    fn test_open_retry() {
        let temp = TestDir::temp();
        let socket = temp.path("late.sock");

        let server = {
            let socket = socket.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                let listener =
                    std::os::unix::net::UnixListener::bind(&socket).expect("bind must succeed");
                listener.accept().map(|_| ()).expect("accept must succeed");
            })
        };

        Connection::open(
            &socket,
            Duration::from_millis(5),
            Instant::now() + Duration::from_secs(10),
        )
        .expect("must eventually connect");
        server.join().expect("server must not panic");
    }
}
