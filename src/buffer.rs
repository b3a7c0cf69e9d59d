//! In-memory chunk buffer grouping records by key.

use std::collections::HashMap;

use rayon;
use rayon::slice::ParallelSliceMut;

use crate::record::Record;

/// Buffer limited by the number of distinct keys it holds.
///
/// Values are grouped per key in arrival order. The number of records can exceed the
/// limit when keys repeat.
pub struct KeyGroupBuffer {
    limit: usize,
    records: usize,
    groups: HashMap<i64, Vec<String>>,
}

impl KeyGroupBuffer {
    pub fn new(limit: usize) -> Self {
        KeyGroupBuffer {
            limit,
            records: 0,
            groups: HashMap::new(),
        }
    }

    /// Adds a record to its key group.
    pub fn push(&mut self, record: Record) {
        self.groups.entry(record.key).or_insert_with(Vec::new).push(record.value);
        self.records += 1;
    }

    /// Returns the number of distinct keys.
    pub fn keys(&self) -> usize {
        self.groups.len()
    }

    /// Returns the number of buffered records.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Checks if the buffer reached the distinct key limit.
    pub fn is_full(&self) -> bool {
        self.groups.len() >= self.limit
    }

    /// Drains the buffer into records ordered by key, preserving arrival order within a key.
    /// Key groups are sorted on the provided thread pool.
    pub fn into_sorted(self, thread_pool: &rayon::ThreadPool) -> impl Iterator<Item = Record> {
        let mut groups = Vec::from_iter(self.groups);

        // keys are unique here so an unstable sort yields the exact order
        thread_pool.install(|| {
            groups.par_sort_unstable_by_key(|(key, _)| *key);
        });

        groups
            .into_iter()
            .flat_map(|(key, values)| values.into_iter().map(move |value| Record { key, value }))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::KeyGroupBuffer;
    use crate::record::Record;

    #[fixture]
    fn thread_pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[test]
    fn test_limit_counts_distinct_keys() {
        let mut buffer = KeyGroupBuffer::new(2);

        buffer.push(Record::new(1, "a"));
        buffer.push(Record::new(1, "b"));
        buffer.push(Record::new(1, "c"));
        assert_eq!(buffer.is_full(), false);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.keys(), 1);

        buffer.push(Record::new(2, "d"));
        assert_eq!(buffer.is_full(), true);
        assert_eq!(buffer.len(), 4);
    }

    #[rstest]
    fn test_into_sorted_is_stable(thread_pool: rayon::ThreadPool) {
        let mut buffer = KeyGroupBuffer::new(10);
        for (key, value) in [(3, "c"), (1, "a"), (3, "d"), (-5, "z"), (1, "b")] {
            buffer.push(Record::new(key, value));
        }

        let actual = Vec::from_iter(buffer.into_sorted(&thread_pool));
        let expected = vec![
            Record::new(-5, "z"),
            Record::new(1, "a"),
            Record::new(1, "b"),
            Record::new(3, "c"),
            Record::new(3, "d"),
        ];
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_empty(thread_pool: rayon::ThreadPool) {
        let buffer = KeyGroupBuffer::new(1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.into_sorted(&thread_pool).count(), 0);
    }
}
