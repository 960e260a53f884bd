//! The `StorageTable` owns every stored file, and enforces the file
//! count and byte budgets by evicting files whenever a write or an
//! append grows the total.
//!
//! Files are spread over a fixed number of independently locked
//! buckets.  Every single-key operation locks exactly one bucket, and
//! releases it before touching the global counters, which live behind
//! their own mutex.  Eviction acquires the counters first, then bucket
//! locks one at a time, so the only lock order is counters, then
//! bucket, then (briefly) the eviction policy's own state.
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use thiserror::Error;

use crate::bucket::Bucket;
use crate::bucket::File;
use crate::bucket::Shards;
use crate::eviction::EvictionPolicy;
use crate::eviction::Evictor;
use crate::sync::lock;
use crate::ConnectionId;

/// Expected failures for table operations.  All of them are reported
/// to the client as an error status, and none affect the server.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("no such file")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("file is already open")]
    AlreadyOpen,
    #[error("file is already closed")]
    AlreadyClosed,
    #[error("file is already locked")]
    AlreadyLocked,
    #[error("file is not locked")]
    AlreadyUnlocked,
    #[error("file is locked by another connection")]
    Forbidden,
}

pub type Result<T> = std::result::Result<T, TableError>;

/// A snapshot of the table's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub open_files: u64,
    pub files: u64,
    pub bytes: u64,
    /// Highest file count ever observed.
    pub max_files_seen: u64,
    /// Highest byte total ever observed.
    pub max_bytes_seen: u64,
    /// Total number of files evicted so far.
    pub evictions: u64,
}

// Counters are signed: bucket and counter updates aren't atomic
// together, so an eviction can account for a file before its
// creation is counted, and briefly drive a counter below zero.
#[derive(Debug, Default)]
struct Counters {
    open_files: i64,
    files: i64,
    bytes: i64,
    max_files_seen: i64,
    max_bytes_seen: i64,
    evictions: u64,
}

impl Counters {
    fn apply(&mut self, open_delta: i64, files_delta: i64, bytes_delta: i64) {
        self.open_files += open_delta;
        self.files += files_delta;
        self.bytes += bytes_delta;
        self.max_files_seen = self.max_files_seen.max(self.files);
        self.max_bytes_seen = self.max_bytes_seen.max(self.bytes);
    }

    fn forget(&mut self, file: &File) {
        self.apply(-(file.is_open() as i64), -1, -(file.len() as i64));
    }
}

#[derive(Debug)]
pub struct StorageTable {
    max_files: u64,
    max_bytes: u64,
    shards: Shards,
    evictor: Box<dyn Evictor>,
    counters: Mutex<Counters>,
    next_generation: AtomicU64,
}

fn clamp(value: i64) -> u64 {
    value.max(0) as u64
}

impl StorageTable {
    /// Returns an empty table that holds at most `max_files` files
    /// and `max_bytes` bytes after each write or append, spread over
    /// `buckets` buckets (at least one).
    pub fn new(
        max_files: u64,
        max_bytes: u64,
        buckets: usize,
        policy: EvictionPolicy,
    ) -> StorageTable {
        StorageTable {
            max_files,
            max_bytes,
            shards: Shards::new(buckets),
            evictor: policy.build(),
            counters: Mutex::default(),
            next_generation: AtomicU64::new(0),
        }
    }

    fn update_counters(&self, open_delta: i64, files_delta: i64, bytes_delta: i64) {
        lock(&self.counters).apply(open_delta, files_delta, bytes_delta);
    }

    /// Locks the bucket for `key`, and calls `worker` on the file's
    /// index in that bucket.
    fn with_file<T>(
        &self,
        key: &str,
        worker: impl FnOnce(&mut Bucket, usize) -> Result<T>,
    ) -> Result<T> {
        let mut bucket = lock(self.shards.bucket_for(key));
        let idx = bucket.find(key).ok_or(TableError::NotFound)?;

        worker(&mut *bucket, idx)
    }

    /// Inserts a new empty file for `key`, open, and locked by `owner`
    /// iff `lock` is true.
    ///
    /// Creating a file never evicts anything: the budgets are only
    /// restored by the next write or append.
    pub fn create(&self, key: &str, owner: ConnectionId, lock_file: bool) -> Result<()> {
        {
            let mut bucket = lock(self.shards.bucket_for(key));
            if bucket.find(key).is_some() {
                return Err(TableError::AlreadyExists);
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let file = File::new(key.to_owned(), owner, lock_file, generation);

            self.evictor.inserted(&file);
            bucket.push_back(file);
        }

        self.update_counters(1, 1, 0);
        Ok(())
    }

    /// Marks an existing file as open, and locks it for `owner` if
    /// `lock` is true.
    pub fn open(&self, key: &str, owner: ConnectionId, lock_file: bool) -> Result<()> {
        self.with_file(key, |bucket, idx| {
            let file = bucket.get_mut(idx);

            if file.is_open() {
                return Err(TableError::AlreadyOpen);
            }

            if !file.permits(owner) {
                return Err(TableError::Forbidden);
            }

            file.set_open(true);
            if lock_file {
                file.set_lock_owner(Some(owner));
            }

            Ok(())
        })?;

        self.update_counters(1, 0, 0);
        Ok(())
    }

    pub fn close(&self, key: &str, owner: ConnectionId) -> Result<()> {
        self.with_file(key, |bucket, idx| {
            let file = bucket.get_mut(idx);

            if !file.is_open() {
                return Err(TableError::AlreadyClosed);
            }

            if !file.permits(owner) {
                return Err(TableError::Forbidden);
            }

            file.set_open(false);
            Ok(())
        })?;

        self.update_counters(-1, 0, 0);
        Ok(())
    }

    /// Locks `key` for `owner`.  Fails if the file is already locked,
    /// even by `owner`.
    pub fn lock(&self, key: &str, owner: ConnectionId) -> Result<()> {
        self.with_file(key, |bucket, idx| {
            let file = bucket.get_mut(idx);

            if file.is_locked() {
                return Err(TableError::AlreadyLocked);
            }

            file.set_lock_owner(Some(owner));
            Ok(())
        })
    }

    /// Releases `owner`'s lock on `key`.
    pub fn unlock(&self, key: &str, owner: ConnectionId) -> Result<()> {
        self.with_file(key, |bucket, idx| {
            let file = bucket.get_mut(idx);

            match file.lock_owner() {
                None => Err(TableError::AlreadyUnlocked),
                Some(holder) if holder != owner => Err(TableError::Forbidden),
                Some(_) => {
                    file.set_lock_owner(None);
                    Ok(())
                }
            }
        })
    }

    /// Deletes `key` from the table.
    ///
    /// Returns `Ok(false)` without changing anything when the file is
    /// locked by another connection: that's not a client error.
    pub fn remove(&self, key: &str, owner: ConnectionId) -> Result<bool> {
        let removed = self.with_file(key, |bucket, idx| {
            if !bucket.get(idx).permits(owner) {
                return Ok(None);
            }

            Ok(Some(bucket.detach(idx)))
        })?;

        match removed {
            Some(file) => {
                lock(&self.counters).forget(&file);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns a copy of the contents of `key`.  Locks don't prevent
    /// reads.
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.with_file(key, |bucket, idx| Ok(bucket.get(idx).contents().to_vec()))
    }

    /// Replaces the contents of `key` with `contents`, then evicts
    /// other files until the table is back within budget.  Returns the
    /// evicted files.
    pub fn replace_contents(
        &self,
        key: &str,
        owner: ConnectionId,
        contents: Vec<u8>,
    ) -> Result<Vec<File>> {
        let new_len = contents.len() as i64;
        let old = self.with_file(key, |bucket, idx| {
            let file = bucket.get_mut(idx);

            if !file.permits(owner) {
                return Err(TableError::Forbidden);
            }

            Ok(file.replace_contents(contents))
        })?;

        Ok(self.settle(key, new_len - old.len() as i64))
    }

    /// Appends `contents` to `key`, then evicts other files until the
    /// table is back within budget.  Returns the evicted files.
    pub fn append_contents(
        &self,
        key: &str,
        owner: ConnectionId,
        contents: &[u8],
    ) -> Result<Vec<File>> {
        self.with_file(key, |bucket, idx| {
            let file = bucket.get_mut(idx);

            if !file.permits(owner) {
                return Err(TableError::Forbidden);
            }

            file.append_contents(contents);
            Ok(())
        })?;

        Ok(self.settle(key, contents.len() as i64))
    }

    /// Accounts for `bytes_delta`, and runs the eviction pass with
    /// `protect` as the file that just grew.
    fn settle(&self, protect: &str, bytes_delta: i64) -> Vec<File> {
        let mut counters = lock(&self.counters);

        counters.apply(0, 0, bytes_delta);
        self.evict(protect, &mut counters)
    }

    fn over_budget(&self, counters: &Counters) -> bool {
        counters.files > self.max_files as i64 || counters.bytes > self.max_bytes as i64
    }

    /// Detaches `key` directly, regardless of locks.
    fn detach(&self, key: &str) -> Option<File> {
        let mut bucket = lock(self.shards.bucket_for(key));
        let idx = bucket.find(key)?;

        Some(bucket.detach(idx))
    }

    fn evict(&self, protect: &str, counters: &mut Counters) -> Vec<File> {
        let mut evicted = Vec::new();

        while self.over_budget(counters) {
            // The file that just grew goes last: if it's the only one
            // left and still too big, it has to go too.
            let victim = self
                .evictor
                .evict_one(&self.shards, protect)
                .or_else(|| self.detach(protect));

            match victim {
                Some(file) => {
                    log::debug!(
                        "Evicting '{}' ({} bytes) to make room for '{}'.",
                        file.key(),
                        file.len(),
                        protect
                    );
                    counters.forget(&file);
                    counters.evictions += 1;
                    evicted.push(file);
                }
                None => {
                    // The counters lag behind a concurrent creation;
                    // whoever grows the table next will catch up.
                    log::warn!(
                        "Table over budget with nothing to evict: files={} bytes={}.",
                        counters.files,
                        counters.bytes
                    );
                    break;
                }
            }
        }

        evicted
    }

    /// Unlocks every file locked by `owner`.  Called when the
    /// connection goes away.  Returns the number of files unlocked.
    pub fn release_owner(&self, owner: ConnectionId) -> usize {
        let mut released = 0;

        for idx in 0..self.shards.len() {
            let mut bucket = lock(self.shards.get(idx));
            let mut cursor = bucket.head();

            while let Some(entry) = cursor {
                let file = bucket.get_mut(entry);
                if file.lock_owner() == Some(owner) {
                    file.set_lock_owner(None);
                    released += 1;
                }

                cursor = bucket.next(entry);
            }
        }

        released
    }

    pub fn stats(&self) -> Stats {
        let counters = lock(&self.counters);

        Stats {
            open_files: clamp(counters.open_files),
            files: clamp(counters.files),
            bytes: clamp(counters.bytes),
            max_files_seen: clamp(counters.max_files_seen),
            max_bytes_seen: clamp(counters.max_bytes_seen),
            evictions: counters.evictions,
        }
    }

    /// Returns a cursor over up to `max_items` files (every file if
    /// `max_items == 0`), in bucket order.
    ///
    /// The visitor holds one bucket lock at a time: don't call other
    /// table methods on the same thread while it's alive.
    pub fn visit(&self, max_items: usize) -> Visitor<'_> {
        Visitor {
            shards: &self.shards,
            next_bucket: 0,
            guard: None,
            cursor: None,
            remaining: if max_items == 0 {
                None
            } else {
                Some(max_items)
            },
        }
    }
}

/// A cursor over the table's files.  `next` lends each file until
/// the next call.
pub struct Visitor<'a> {
    shards: &'a Shards,
    next_bucket: usize,
    guard: Option<MutexGuard<'a, Bucket>>,
    // Next entry to yield in the locked bucket.
    cursor: Option<usize>,
    remaining: Option<usize>,
}

impl<'a> Visitor<'a> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&File> {
        if self.remaining == Some(0) {
            self.guard = None;
            return None;
        }

        let idx = loop {
            if let Some(guard) = &self.guard {
                if let Some(idx) = self.cursor {
                    self.cursor = guard.next(idx);
                    break idx;
                }
            }

            // Release the current bucket before locking the next one.
            self.guard = None;
            if self.next_bucket >= self.shards.len() {
                return None;
            }

            let guard = lock(self.shards.get(self.next_bucket));
            self.next_bucket += 1;
            self.cursor = guard.head();
            self.guard = Some(guard);
        };

        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }

        self.guard.as_ref().map(|guard| guard.get(idx))
    }
}
