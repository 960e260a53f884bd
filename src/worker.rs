//! Worker threads pull messages from their queue, apply them to the
//! storage table, and write responses back to the originating
//! connection.
//!
//! Responses are assembled in memory and written with a single
//! `write_all`, so the table is never locked while we wait on a
//! client.
use std::io::Result;
use std::io::Write;
use std::net::Shutdown as SocketShutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::benign_error::is_disconnect_error;
use crate::bucket::File;
use crate::protocol::write_file_block;
use crate::protocol::write_status;
use crate::protocol::write_u64;
use crate::protocol::Opcode;
use crate::protocol::Request;
use crate::protocol::Status;
use crate::server::Context;
use crate::table::StorageTable;
use crate::workload_queue::Message;
use crate::workload_queue::MessageKind;
use crate::ConnectionId;

/// Handles for the worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns one worker thread per workload queue in `context`.
    pub fn spawn(context: &Arc<Context>) -> Result<WorkerPool> {
        let mut handles = Vec::with_capacity(context.queues.len());

        for index in 0..context.queues.len() {
            let context = context.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sol-worker-{}", index))
                .spawn(move || run_worker(&context, index))?;

            handles.push(handle);
        }

        log::info!("Spawned {} worker(s).", handles.len());
        Ok(WorkerPool { handles })
    }

    /// Waits for every worker to exit.  Workers only exit on hard
    /// shutdown, once their queue has been woken up.
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_owned();

            if handle.join().is_err() {
                log::error!("{} panicked.", name);
            }
        }
    }
}

fn run_worker(context: &Context, index: usize) {
    let queue = &context.queues[index];

    log::debug!("Worker {} started.", index);
    while let Some(message) = queue.pull(&context.shutdown) {
        handle_message(&context.table, message);
    }

    log::debug!("Worker {} exiting.", index);
}

/// Applies one message to `table`, and responds on the message's
/// stream.  Failing to respond hangs up on the client.
///
/// Every message holds a reference to its connection's stream, and so
/// does the receiver until it reaps the connection and passes its own
/// reference along in a hang-up message.  Whichever message drops the
/// last reference comes after everything else the connection sent, on
/// any worker, so that's when the connection's locks are released: a
/// lock request can't sneak in after the release.
pub fn handle_message(table: &StorageTable, message: Message) {
    let Message {
        connection,
        reply_to,
        kind,
    } = message;

    if let MessageKind::Request(payload) = kind {
        serve(table, connection, &reply_to, &payload);
    }

    if Arc::into_inner(reply_to).is_some() {
        let released = table.release_owner(connection);
        log::debug!("{:?} is gone; released {} lock(s).", connection, released);
    }
}

fn hang_up(connection: ConnectionId, stream: &UnixStream) {
    if let Err(e) = stream.shutdown(SocketShutdown::Both) {
        log::debug!("Failed to shut down {:?}: {}.", connection, e);
    }
}

fn serve(table: &StorageTable, connection: ConnectionId, reply_to: &UnixStream, payload: &[u8]) {
    let request = match Request::decode(payload) {
        Ok(request) => request,
        Err(e) => {
            // We can't tell where the next request starts: make the
            // receiver drop the connection.
            log::warn!("Bad request from {:?}: {}. Hanging up.", connection, e);
            hang_up(connection, reply_to);
            return;
        }
    };

    let mut response = Vec::new();
    // Writes to a `Vec` can't fail.
    if let Err(e) = handle_request(table, connection, request, &mut response) {
        log::error!("Failed to serialise response for {:?}: {}.", connection, e);
        return;
    }

    if response.is_empty() {
        return;
    }

    // The stream has a write timeout, so a client that doesn't read
    // its responses only holds this worker up for so long.  Once a
    // response is lost, the rest of the stream is garbage to the
    // client: hang up.
    let mut writer = reply_to;
    if let Err(e) = writer.write_all(&response) {
        if is_disconnect_error(&e) {
            log::debug!("{:?} left before its response: {}.", connection, e);
        } else {
            log::warn!("Failed to respond to {:?}: {}. Hanging up.", connection, e);
        }

        hang_up(connection, reply_to);
    }
}

fn write_files(out: &mut impl Write, files: &[File]) -> Result<()> {
    for file in files {
        write_file_block(out, file.key(), file.contents())?;
    }

    Ok(())
}

/// Dispatches `request` from `owner` to the matching table operation,
/// and serialises the response to `out`.
pub fn handle_request(
    table: &StorageTable,
    owner: ConnectionId,
    request: Request,
    out: &mut impl Write,
) -> Result<()> {
    let opcode = request.opcode();

    match request {
        Request::Nop => {
            log::trace!("Empty message from {:?}.", owner);
            Ok(())
        }
        Request::Open { path, create, lock } => {
            let result = if create {
                table.create(&path, owner, lock)
            } else {
                table.open(&path, owner, lock)
            };

            log::debug!("{:?} '{}' for {:?}: {:?}", opcode, path, owner, result);
            write_status(out, Status::from(&result))
        }
        Request::Read { path } => match table.read(&path) {
            Ok(contents) => {
                log::debug!("Read {} bytes from '{}'.", contents.len(), path);
                write_status(out, Status::Ok)?;
                write_u64(out, contents.len() as u64)?;
                out.write_all(&contents)
            }
            Err(e) => {
                log::debug!("Read '{}' for {:?}: {}", path, owner, e);
                write_status(out, Status::Err)
            }
        },
        Request::ReadN { count } => {
            let files = {
                let limit = usize::try_from(count).unwrap_or(usize::MAX);
                let mut visitor = table.visit(limit);
                let mut files = Vec::new();

                while let Some(file) = visitor.next() {
                    files.push((file.key().to_owned(), file.contents().to_vec()));
                }

                files
            };

            log::debug!("Sending {} file(s) to {:?}.", files.len(), owner);
            for (path, contents) in &files {
                write_file_block(out, path, contents)?;
            }

            write_u64(out, 0)
        }
        Request::Write { path, contents } => {
            let result = table.replace_contents(&path, owner, contents);
            respond_with_evictions(out, opcode, &path, owner, result)
        }
        Request::Append { path, contents } => {
            let result = table.append_contents(&path, owner, &contents);
            respond_with_evictions(out, opcode, &path, owner, result)
        }
        Request::Lock { path } => {
            let result = table.lock(&path, owner);
            log::debug!("Lock '{}' for {:?}: {:?}", path, owner, result);
            write_status(out, Status::from(&result))
        }
        Request::Unlock { path } => {
            let result = table.unlock(&path, owner);
            log::debug!("Unlock '{}' for {:?}: {:?}", path, owner, result);
            write_status(out, Status::from(&result))
        }
        Request::Close { path } => {
            let result = table.close(&path, owner);
            log::debug!("Close '{}' for {:?}: {:?}", path, owner, result);
            write_status(out, Status::from(&result))
        }
        Request::Remove { path } => {
            // Removing a file locked by someone else is a silent no-op.
            let result = table.remove(&path, owner);
            log::debug!("Remove '{}' for {:?}: {:?}", path, owner, result);
            write_status(out, Status::from(&result))
        }
    }
}

fn respond_with_evictions(
    out: &mut impl Write,
    opcode: Option<Opcode>,
    path: &str,
    owner: ConnectionId,
    result: crate::table::Result<Vec<File>>,
) -> Result<()> {
    match result {
        Ok(evicted) => {
            log::debug!(
                "{:?} '{}' for {:?}: evicted {} file(s).",
                opcode,
                path,
                owner,
                evicted.len()
            );
            write_status(out, Status::Ok)?;
            write_u64(out, evicted.len() as u64)?;
            // This is the last copy of the evicted files: they're freed
            // once sent.
            write_files(out, &evicted)
        }
        Err(e) => {
            log::debug!("{:?} '{}' for {:?}: {}", opcode, path, owner, e);
            write_status(out, Status::Err)?;
            write_u64(out, 0)
        }
    }
}
