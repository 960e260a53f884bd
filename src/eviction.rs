//! Eviction policies pick the files to drop when the table exceeds
//! its file count or byte budget.
//!
//! The FIFO policy keeps an auxiliary queue of keys in insertion
//! order, and evicts from the old end.  The queue is *not* updated
//! when a client removes a file directly: such entries go stale, and
//! are recognised and skipped when they reach the front of the queue.
//! Each entry carries the generation of the file it was created for,
//! so a stale entry never evicts a newer file created under the same
//! path.
//!
//! The "segmented FIFO" policy samples buckets uniformly at random,
//! and evicts the newest entry in the first non-empty bucket it finds.
//! It is really random eviction over buckets, not a segmented LRU.
//!
//! Both policies skip the `protect`ed key: the file whose growth
//! triggered the eviction pass.
use rand::Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::bucket::Bucket;
use crate::bucket::File;
use crate::bucket::Shards;
use crate::sync::lock;

/// Number of random bucket probes before the random policy falls back
/// to a sweep over every bucket.
const RANDOM_PROBES: usize = 3;

/// The eviction policy selector, as spelled in configuration files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    Fifo,
    SegmentedFifo,
}

impl EvictionPolicy {
    pub(crate) fn build(self) -> Box<dyn Evictor> {
        match self {
            EvictionPolicy::Fifo => Box::new(FifoEvictor::default()),
            EvictionPolicy::SegmentedFifo => Box::new(RandomEvictor),
        }
    }
}

/// An `Evictor` implements one eviction policy on top of the table's
/// buckets.
///
/// Lock order: callers may hold a bucket lock when calling
/// `inserted`, so the evictor's own locks must be leaves, never held
/// while acquiring a bucket lock.
pub(crate) trait Evictor: std::fmt::Debug + Send + Sync {
    /// Records a newly created `file`.  Called with the file's bucket
    /// locked.
    fn inserted(&self, file: &File);

    /// Detaches and returns one file other than `protect`, or `None`
    /// if the table has no such file.  Must be called without any
    /// bucket lock held.
    fn evict_one(&self, shards: &Shards, protect: &str) -> Option<File>;
}

#[derive(Debug, Default)]
struct FifoEvictor {
    // (key, generation), oldest at the front.
    queue: Mutex<VecDeque<(String, u64)>>,
}

impl Evictor for FifoEvictor {
    fn inserted(&self, file: &File) {
        lock(&self.queue).push_back((file.key().to_owned(), file.generation()));
    }

    fn evict_one(&self, shards: &Shards, protect: &str) -> Option<File> {
        let mut skipped = Vec::new();

        let victim = loop {
            let (key, generation) = match lock(&self.queue).pop_front() {
                Some(entry) => entry,
                None => break None,
            };

            if key == protect {
                skipped.push((key, generation));
                continue;
            }

            let mut bucket = lock(shards.bucket_for(&key));
            match bucket.find(&key) {
                Some(idx) if bucket.get(idx).generation() == generation => {
                    break Some(bucket.detach(idx));
                }
                _ => log::trace!("Skipping stale FIFO entry for '{}'.", key),
            }
        };

        // Put the protected entry back where it was.
        if !skipped.is_empty() {
            let mut queue = lock(&self.queue);
            for entry in skipped.into_iter().rev() {
                queue.push_front(entry);
            }
        }

        victim
    }
}

#[derive(Debug)]
struct RandomEvictor;

/// Detaches the newest file in `bucket` that isn't `protect`.
fn evict_newest(bucket: &Mutex<Bucket>, protect: &str) -> Option<File> {
    let mut bucket = lock(bucket);
    let mut cursor = bucket.tail();

    while let Some(idx) = cursor {
        if bucket.get(idx).key() != protect {
            return Some(bucket.detach(idx));
        }

        cursor = bucket.prev(idx);
    }

    None
}

impl Evictor for RandomEvictor {
    fn inserted(&self, _file: &File) {}

    fn evict_one(&self, shards: &Shards, protect: &str) -> Option<File> {
        let mut rng = rand::thread_rng();
        let count = shards.len();

        for _ in 0..RANDOM_PROBES {
            let victim = evict_newest(shards.get(rng.gen_range(0..count)), protect);
            if victim.is_some() {
                return victim;
            }
        }

        // Sparse table: sweep from a random starting point, so that we
        // only give up when there really is nothing left to evict.
        let start = rng.gen_range(0..count);
        (0..count).find_map(|offset| evict_newest(shards.get((start + offset) % count), protect))
    }
}

#[cfg(test)]
mod test {
    use crate::bucket::File;
    use crate::bucket::Shards;
    use crate::eviction::*;
    use crate::ConnectionId;

    fn insert(shards: &Shards, evictor: &dyn Evictor, key: &str, generation: u64) {
        let file = File::new(key.to_owned(), ConnectionId(0), false, generation);
        let mut bucket = lock(shards.bucket_for(key));

        evictor.inserted(&file);
        bucket.push_back(file);
    }

    /// FIFO evicts in insertion order.
    #[test]
    fn test_fifo_order() {
        let shards = Shards::new(4);
        let evictor = EvictionPolicy::Fifo.build();

        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            insert(&shards, &*evictor, key, i as u64);
        }

        let evicted: Vec<String> = std::iter::from_fn(|| evictor.evict_one(&shards, ""))
            .map(|f| f.key().to_owned())
            .collect();
        assert_eq!(evicted, vec!["a", "b", "c", "d"]);
    }

    /// The protected key is skipped, but keeps its place in line.
    #[test]
    fn test_fifo_protect() {
        let shards = Shards::new(2);
        let evictor = EvictionPolicy::Fifo.build();

        insert(&shards, &*evictor, "a", 0);
        insert(&shards, &*evictor, "b", 1);

        assert_eq!(
            evictor.evict_one(&shards, "a").map(|f| f.key().to_owned()),
            Some("b".to_owned())
        );
        assert!(evictor.evict_one(&shards, "a").is_none());
        assert_eq!(
            evictor.evict_one(&shards, "").map(|f| f.key().to_owned()),
            Some("a".to_owned())
        );
    }

    /// Entries for files removed behind the evictor's back are
    /// skipped, even when the path was reused for a newer file.
    #[test]
    fn test_fifo_stale_entries() {
        let shards = Shards::new(1);
        let evictor = EvictionPolicy::Fifo.build();

        insert(&shards, &*evictor, "a", 0);
        insert(&shards, &*evictor, "b", 1);
        {
            let mut bucket = lock(shards.bucket_for("a"));
            let idx = bucket.find("a").expect("a must be present");
            bucket.detach(idx);
        }
        insert(&shards, &*evictor, "a", 2);

        let first = evictor.evict_one(&shards, "").expect("must evict");
        assert_eq!(first.key(), "b");
        let second = evictor.evict_one(&shards, "").expect("must evict");
        assert_eq!(second.key(), "a");
        assert_eq!(second.generation(), 2);
        assert!(evictor.evict_one(&shards, "").is_none());
    }

    /// Random eviction eventually finds the only file, even with many
    /// empty buckets.
    #[test]
    fn test_random_sparse() {
        let shards = Shards::new(1024);
        let evictor = EvictionPolicy::SegmentedFifo.build();

        insert(&shards, &*evictor, "lonely", 0);
        let victim = evictor.evict_one(&shards, "").expect("must find the file");
        assert_eq!(victim.key(), "lonely");
        assert!(evictor.evict_one(&shards, "").is_none());
    }

    /// Random eviction never picks the protected key.
    #[test]
    fn test_random_protect() {
        let shards = Shards::new(1);
        let evictor = EvictionPolicy::SegmentedFifo.build();

        insert(&shards, &*evictor, "a", 0);
        insert(&shards, &*evictor, "b", 1);

        // "b" is the newest entry in the only bucket, but protected.
        let victim = evictor.evict_one(&shards, "b").expect("must evict");
        assert_eq!(victim.key(), "a");
        assert!(evictor.evict_one(&shards, "b").is_none());
    }

    #[test]
    fn test_parse_policy() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: EvictionPolicy,
        }

        let fifo: Wrapper = toml::from_str("policy = 'fifo'").expect("must parse");
        assert_eq!(fifo.policy, EvictionPolicy::Fifo);
        let segmented: Wrapper = toml::from_str("policy = 'segmented-fifo'").expect("must parse");
        assert_eq!(segmented.policy, EvictionPolicy::SegmentedFifo);
        assert!(toml::from_str::<Wrapper>("policy = 'lru'").is_err());
    }
}
