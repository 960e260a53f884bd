//! File records, and the buckets (shards) that own them.
//!
//! Each bucket is a doubly-linked chain of records in insertion
//! order, stored in a slab so that links are stable indices rather
//! than pointers.  Detaching a record we already located is O(1);
//! lookups walk the chain, which stays short as long as the table has
//! roughly as many buckets as files.
use derivative::Derivative;
use slab::Slab;
use std::sync::Mutex;

use crate::key_hash::KeyHash;
use crate::ConnectionId;

/// Seeds the path to bucket hash.  Any constant works, as long as
/// it's the same for the whole table.
const KEY_HASH: KeyHash = KeyHash::new_keyed(b"sol-storage bucket hash");

/// A file stored in the table.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct File {
    key: String,
    #[derivative(Debug = "ignore")]
    contents: Vec<u8>,
    is_open: bool,
    // `Some` iff the file is locked.
    lock_owner: Option<ConnectionId>,
    // Distinguishes successive files created under the same key.
    generation: u64,
}

impl File {
    pub(crate) fn new(key: String, owner: ConnectionId, lock: bool, generation: u64) -> File {
        File {
            key,
            contents: Vec::new(),
            is_open: true,
            lock_owner: if lock { Some(owner) } else { None },
            generation,
        }
    }

    /// Returns the file's path.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Returns the length of the file's contents, in bytes.
    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    /// Returns the connection that holds the lock on this file, if any.
    pub fn lock_owner(&self) -> Option<ConnectionId> {
        self.lock_owner
    }

    /// Returns whether `owner` may mutate, close, or remove this file:
    /// anyone may if the file is unlocked, only the lock owner
    /// otherwise.
    pub fn permits(&self, owner: ConnectionId) -> bool {
        match self.lock_owner {
            None => true,
            Some(holder) => holder == owner,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_open(&mut self, open: bool) {
        self.is_open = open;
    }

    pub(crate) fn set_lock_owner(&mut self, owner: Option<ConnectionId>) {
        self.lock_owner = owner;
    }

    /// Swaps in `contents`, and returns the old contents.
    pub(crate) fn replace_contents(&mut self, contents: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut self.contents, contents)
    }

    pub(crate) fn append_contents(&mut self, contents: &[u8]) {
        self.contents.extend_from_slice(contents);
    }

    /// Consumes the file, and returns its path and contents.
    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.key, self.contents)
    }
}

#[derive(Debug)]
struct Node {
    file: File,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct Bucket {
    nodes: Slab<Node>,
    // Oldest entry.
    head: Option<usize>,
    // Newest entry.
    tail: Option<usize>,
}

impl Bucket {
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn next(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].next
    }

    pub fn prev(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].prev
    }

    pub fn get(&self, idx: usize) -> &File {
        &self.nodes[idx].file
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut File {
        &mut self.nodes[idx].file
    }

    /// Returns the index of the entry for `key`, if any.
    pub fn find(&self, key: &str) -> Option<usize> {
        let mut cursor = self.head;

        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            if node.file.key == key {
                return Some(idx);
            }

            cursor = node.next;
        }

        None
    }

    /// Appends `file` at the tail of the chain, and returns its index.
    pub fn push_back(&mut self, file: File) -> usize {
        let idx = self.nodes.insert(Node {
            file,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(idx),
            None => self.head = Some(idx),
        }

        self.tail = Some(idx);
        idx
    }

    /// Unlinks the entry at `idx` and returns its file.
    pub fn detach(&mut self, idx: usize) -> File {
        let node = self.nodes.remove(idx);

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }

        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }

        node.file
    }

    /// Iterates over the bucket's files, oldest first.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &File> + '_ {
        let mut cursor = self.head;

        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = &self.nodes[idx];

            cursor = node.next;
            Some(&node.file)
        })
    }
}

/// The fixed array of independently locked buckets.
#[derive(Debug)]
pub(crate) struct Shards {
    buckets: Box<[Mutex<Bucket>]>,
}

impl Shards {
    /// Returns `count` empty buckets; `count` is at least 1.
    pub fn new(count: usize) -> Shards {
        Shards {
            buckets: (0..count.max(1)).map(|_| Mutex::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, idx: usize) -> &Mutex<Bucket> {
        &self.buckets[idx]
    }

    /// Returns the only bucket that may contain `key`.
    pub fn bucket_for(&self, key: &str) -> &Mutex<Bucket> {
        self.get(KEY_HASH.bucket(key, self.buckets.len()))
    }
}

#[cfg(test)]
mod test {
    use crate::bucket::*;
    use crate::ConnectionId;
    use proptest::prelude::*;

    fn file(key: &str) -> File {
        File::new(key.to_owned(), ConnectionId(1), false, 0)
    }

    fn keys(bucket: &Bucket) -> Vec<String> {
        bucket.iter().map(|f| f.key().to_owned()).collect()
    }

    #[test]
    fn smoke_test() {
        let mut bucket = Bucket::default();
        assert!(bucket.is_empty());
        assert_eq!(bucket.find("a"), None);

        let a = bucket.push_back(file("a"));
        let b = bucket.push_back(file("b"));
        let c = bucket.push_back(file("c"));

        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.find("a"), Some(a));
        assert_eq!(bucket.find("b"), Some(b));
        assert_eq!(bucket.head(), Some(a));
        assert_eq!(bucket.tail(), Some(c));
        assert_eq!(keys(&bucket), vec!["a", "b", "c"]);
    }

    /// Detaching from the middle, the head, and the tail keeps the
    /// chain consistent in both directions.
    #[test]
    fn test_detach() {
        let mut bucket = Bucket::default();
        let a = bucket.push_back(file("a"));
        let b = bucket.push_back(file("b"));
        let c = bucket.push_back(file("c"));

        assert_eq!(bucket.detach(b).key(), "b");
        assert_eq!(keys(&bucket), vec!["a", "c"]);
        assert_eq!(bucket.next(a), Some(c));
        assert_eq!(bucket.prev(c), Some(a));

        assert_eq!(bucket.detach(a).key(), "a");
        assert_eq!(bucket.head(), Some(c));
        assert_eq!(bucket.prev(c), None);

        assert_eq!(bucket.detach(c).key(), "c");
        assert!(bucket.is_empty());
        assert_eq!(bucket.head(), None);
        assert_eq!(bucket.tail(), None);

        // The bucket is still usable after being emptied.
        let d = bucket.push_back(file("d"));
        assert_eq!(bucket.head(), Some(d));
        assert_eq!(bucket.tail(), Some(d));
    }

    #[test]
    fn test_permits() {
        let mut f = File::new("a".to_owned(), ConnectionId(1), true, 0);
        assert!(f.is_locked());
        assert!(f.permits(ConnectionId(1)));
        assert!(!f.permits(ConnectionId(2)));

        f.set_lock_owner(None);
        assert!(f.permits(ConnectionId(2)));
    }

    proptest! {
        /// Against a `Vec` oracle: whatever we detach, the remaining
        /// chain matches the surviving keys in insertion order.
        #[test]
        fn test_detach_oracle(
            count in 1..30usize,
            removals in proptest::collection::vec(any::<proptest::sample::Index>(), 0..30),
        ) {
            let mut bucket = Bucket::default();
            let mut oracle: Vec<(String, usize)> = Vec::new();

            for i in 0..count {
                let key = format!("{}", i);
                let idx = bucket.push_back(file(&key));
                oracle.push((key, idx));
            }

            for removal in removals {
                if oracle.is_empty() {
                    break;
                }

                let (key, idx) = oracle.remove(removal.index(oracle.len()));
                assert_eq!(bucket.detach(idx).key(), key);
            }

            let expected: Vec<String> = oracle.iter().map(|(k, _)| k.clone()).collect();
            assert_eq!(keys(&bucket), expected);
            assert_eq!(bucket.len(), oracle.len());
        }
    }
}
