//! The summary printed when the server shuts down.
use std::fmt;

use crate::table::Stats;
use crate::table::StorageTable;

/// Final counters and the list of files still stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub stats: Stats,
    /// `(path, size in bytes)` for every file left in the table.
    pub files: Vec<(String, u64)>,
}

impl Summary {
    pub fn collect(table: &StorageTable) -> Summary {
        let stats = table.stats();
        let mut files = Vec::new();
        let mut visitor = table.visit(0);

        while let Some(file) = visitor.next() {
            files.push((file.key().to_owned(), file.len()));
        }

        Summary { stats, files }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Max. files stored: {}", self.stats.max_files_seen)?;
        writeln!(f, "Max. space in bytes: {}", self.stats.max_bytes_seen)?;
        writeln!(f, "Num. of evictions: {}", self.stats.evictions)?;
        writeln!(f, "Current space in bytes: {}", self.stats.bytes)?;
        writeln!(
            f,
            "Current contents of the file storage server: {}",
            self.stats.files
        )?;
        writeln!(f, "================")?;

        for (i, (path, size)) in self.files.iter().enumerate() {
            writeln!(f, "- {} (size): {}", i + 1, size)?;
            writeln!(f, "  {} (path): {}", i + 1, path)?;
        }

        Ok(())
    }
}

#[test]
fn test_format() {
    use crate::eviction::EvictionPolicy;
    use crate::ConnectionId;

    let table = StorageTable::new(10, 100, 1, EvictionPolicy::Fifo);
    table
        .create("/a", ConnectionId(0), false)
        .expect("create must succeed");
    table
        .replace_contents("/a", ConnectionId(0), b"12345".to_vec())
        .expect("write must succeed");

    let summary = Summary::collect(&table);
    assert_eq!(summary.files, vec![("/a".to_owned(), 5)]);
    assert_eq!(
        summary.to_string(),
        concat!(
            "Max. files stored: 1\n",
            "Max. space in bytes: 5\n",
            "Num. of evictions: 0\n",
            "Current space in bytes: 5\n",
            "Current contents of the file storage server: 1\n",
            "================\n",
            "- 1 (size): 5\n",
            "  1 (path): /a\n",
        )
    );
}
