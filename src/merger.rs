//! Binary heap merger.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::prelude::*;

use crate::chunk::{ChunkCursor, ExternalChunkError};
use crate::record::{Record, RecordCodec};
use crate::sort::SortError;

/// Merge candidate: a record and the cursor it was read from.
#[derive(Debug)]
struct HeapEntry {
    key: i64,
    /// Chunk creation index of the source cursor.
    index: usize,
    /// Position of the source cursor in the merger.
    slot: usize,
    value: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.index.cmp(&other.index))
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted chunks into a single sorted output.
/// Records with equal keys are emitted in chunk creation order, and within a chunk in the order
/// they were stored.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of records,
/// *n* is the number of chunks.
pub struct BinaryHeapMerger<R> {
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<HeapEntry>>,
    // exhausted cursors are dropped, which closes their files
    cursors: Vec<Option<ChunkCursor<R>>>,
}

impl<R> BinaryHeapMerger<R>
where
    R: Iterator<Item = Result<Record, ExternalChunkError>>,
{
    /// Creates an instance of a binary heap merger using chunk cursors as inputs.
    /// Chunk records should be sorted in ascending key order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `cursors` - Opened chunk cursors to be merged in a single sorted stream
    pub fn new<I>(cursors: I) -> Result<Self, SortError>
    where
        I: IntoIterator<Item = ChunkCursor<R>>,
    {
        let mut cursors = Vec::from_iter(cursors.into_iter().map(Some));
        let mut items = BinaryHeap::with_capacity(cursors.len());

        for (slot, cursor) in cursors.iter_mut().enumerate() {
            if let Some(entry) = Self::pull(cursor, slot)? {
                items.push(Reverse(entry));
            }
        }

        return Ok(BinaryHeapMerger { items, cursors });
    }

    /// Returns the number of chunks not yet exhausted.
    pub fn active_chunks(&self) -> usize {
        self.cursors.iter().filter(|cursor| cursor.is_some()).count()
    }

    /// Writes all remaining records to the sink, one line per record.
    /// Returns the number of records written.
    pub fn write_to<W: Write>(self, sink: &mut W, codec: &RecordCodec) -> Result<usize, SortError> {
        let mut count = 0;
        for record in self {
            writeln!(sink, "{}", codec.serialize(&record?)).map_err(SortError::IO)?;
            count += 1;
        }

        return Ok(count);
    }

    fn pull(cursor: &mut Option<ChunkCursor<R>>, slot: usize) -> Result<Option<HeapEntry>, SortError> {
        let active = match cursor {
            Some(active) => active,
            None => return Ok(None),
        };

        let index = active.index();
        let record = match active.advance() {
            Ok(record) => record,
            Err(err) => return Err(SortError::from_chunk_error(active.path(), err)),
        };

        let exhausted = active.is_exhausted();
        if exhausted {
            *cursor = None;
        }

        return Ok(record.map(|Record { key, value }| HeapEntry {
            key,
            index,
            slot,
            value,
        }));
    }
}

impl<R> Iterator for BinaryHeapMerger<R>
where
    R: Iterator<Item = Result<Record, ExternalChunkError>>,
{
    type Item = Result<Record, SortError>;

    /// Returns the next record from the inputs in ascending key order.
    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(entry) = self.items.pop()?;

        match Self::pull(&mut self.cursors[entry.slot], entry.slot) {
            Ok(Some(next)) => self.items.push(Reverse(next)),
            Ok(None) => {}
            Err(err) => {
                // the failed chunk can't be continued, so the merged stream ends here
                self.items.clear();
                return Some(Err(err));
            }
        }

        return Some(Ok(Record {
            key: entry.key,
            value: entry.value,
        }));
    }
}

#[cfg(test)]
mod test {
    use std::io::prelude::*;

    use rstest::*;

    use super::BinaryHeapMerger;
    use crate::chunk::{ChunkCursor, ChunkFormat, TextChunk, TextFormat};
    use crate::record::{Record, RecordCodec};
    use crate::sort::SortError;
    use crate::store::Workspace;

    #[fixture]
    fn workspace() -> (tempfile::TempDir, Workspace) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(Some(&tmp_dir.path().join("ws"))).unwrap();
        (tmp_dir, workspace)
    }

    fn open_cursors(workspace: &Workspace, chunks: Vec<Vec<(i64, &str)>>) -> Vec<ChunkCursor<TextChunk>> {
        let format = TextFormat::default();
        let mut cursors = Vec::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let (handle, file) = workspace.new_chunk(format.suffix()).unwrap();
            let mut writer = std::io::BufWriter::new(file);
            format
                .dump(&mut writer, chunk.into_iter().map(|(key, value)| Record::new(key, value)))
                .unwrap();
            writer.flush().unwrap();
            drop(writer);

            cursors.push(ChunkCursor::open(index, workspace, &handle, &format, None).unwrap());
        }
        cursors
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(
        vec![
            vec![(4, "a"), (5, "b"), (7, "c")],
            vec![(1, "d"), (6, "e")],
            vec![(3, "f")],
        ],
        vec![(1, "d"), (3, "f"), (4, "a"), (5, "b"), (6, "e"), (7, "c")],
    )]
    #[case(
        vec![
            vec![(1, "a"), (3, "c")],
            vec![(2, "b"), (3, "d")],
        ],
        vec![(1, "a"), (2, "b"), (3, "c"), (3, "d")],
    )]
    #[case(
        vec![
            vec![(5, "x1"), (5, "x2"), (9, "x3")],
            vec![(5, "y1"), (5, "y2")],
            vec![(0, "z1"), (5, "z2")],
        ],
        vec![(0, "z1"), (5, "x1"), (5, "x2"), (5, "y1"), (5, "y2"), (5, "z2"), (9, "x3")],
    )]
    fn test_merger(
        workspace: (tempfile::TempDir, Workspace),
        #[case] chunks: Vec<Vec<(i64, &str)>>,
        #[case] expected: Vec<(i64, &str)>,
    ) {
        let (_tmp_dir, workspace) = workspace;
        let merger = BinaryHeapMerger::new(open_cursors(&workspace, chunks)).unwrap();

        let actual: Result<Vec<Record>, SortError> = merger.collect();
        let expected = Vec::from_iter(expected.into_iter().map(|(key, value)| Record::new(key, value)));
        assert_eq!(actual.unwrap(), expected);
    }

    #[rstest]
    fn test_exhausted_cursors_released(workspace: (tempfile::TempDir, Workspace)) {
        let (_tmp_dir, workspace) = workspace;
        let cursors = open_cursors(&workspace, vec![vec![(1, "a")], vec![(2, "b"), (3, "c")]]);

        let mut merger = BinaryHeapMerger::new(cursors).unwrap();
        assert_eq!(merger.active_chunks(), 1);
        assert_eq!(merger.next().unwrap().unwrap(), Record::new(1, "a"));
        assert_eq!(merger.next().unwrap().unwrap(), Record::new(2, "b"));
        assert_eq!(merger.active_chunks(), 0);
        assert_eq!(merger.next().unwrap().unwrap(), Record::new(3, "c"));
        assert!(merger.next().is_none());
    }

    #[rstest]
    fn test_write_to(workspace: (tempfile::TempDir, Workspace)) {
        let (_tmp_dir, workspace) = workspace;
        let cursors = open_cursors(&workspace, vec![vec![(1, "a"), (3, "c|x")], vec![(2, "b")]]);

        let mut output = Vec::new();
        let merger = BinaryHeapMerger::new(cursors).unwrap();
        let count = merger.write_to(&mut output, &RecordCodec::new(';').unwrap()).unwrap();

        assert_eq!(count, 3);
        assert_eq!(String::from_utf8(output).unwrap(), "1;a\n2;b\n3;c|x\n");
    }

    #[rstest]
    fn test_stops_after_chunk_error(workspace: (tempfile::TempDir, Workspace)) {
        let (_tmp_dir, workspace) = workspace;
        let format = TextFormat::default();
        let (handle, mut file) = workspace.new_chunk(format.suffix()).unwrap();
        file.write_all(b"1|a\n2|b\n3|c\nbroken\n").unwrap();
        drop(file);

        let mut cursors = vec![ChunkCursor::open(0, &workspace, &handle, &format, None).unwrap()];
        cursors.extend(open_cursors(&workspace, vec![vec![(5, "x")]]));
        let mut merger = BinaryHeapMerger::new(cursors).unwrap();

        assert_eq!(merger.next().unwrap().unwrap(), Record::new(1, "a"));
        assert!(matches!(merger.next(), Some(Err(SortError::MalformedRecord(_, _)))));
        // records of the healthy chunk are not emitted after the failure
        assert!(merger.next().is_none());
    }

    #[rstest]
    fn test_malformed_chunk_record(workspace: (tempfile::TempDir, Workspace)) {
        let (_tmp_dir, workspace) = workspace;
        let format = TextFormat::default();
        let (handle, mut file) = workspace.new_chunk(format.suffix()).unwrap();
        file.write_all(b"1|a\n2|b\nthree|c\n").unwrap();
        drop(file);

        let cursor = ChunkCursor::open(0, &workspace, &handle, &format, None).unwrap();
        let merger = BinaryHeapMerger::new(vec![cursor]).unwrap();

        let actual: Result<Vec<Record>, SortError> = merger.collect();
        assert!(matches!(actual, Err(SortError::MalformedRecord(_, _))));
    }
}
