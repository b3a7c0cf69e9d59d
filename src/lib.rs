//! `kv-ext-sort` is an external merge sort for text files of `key|value` records.
//!
//! External sorting is required when the data being sorted do not fit into the main memory (RAM) of a computer
//! and instead must be resided in slower external memory, usually a hard disk drive. Sorting is achieved in two
//! passes. During the first pass records are grouped by key in memory and flushed to sorted chunk files, during
//! the second pass the chunks are merged together. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Record format:**
//!   one `<integer key><delimiter><value>` record per line. Only the first delimiter separates the key,
//!   so values may contain it.
//! * **Deterministic order:**
//!   records are sorted by key; records sharing a key keep their input order.
//! * **Bounded chunks:**
//!   a chunk is flushed once it holds a configured number of distinct keys (1000 by default).
//! * **Bounded fan-in:**
//!   optionally the number of chunks merged at once can be limited, in which case chunks are merged in
//!   several passes.
//! * **Temporary data cleanup:**
//!   the workspace directory is removed when sorting is done, whether it succeeded or not.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use kv_ext_sort::{ExternalSorter, ExternalSorterBuilder};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./tmp"))
//!         .with_threshold(1000)
//!         .build()
//!         .unwrap();
//!
//!     sorter.sort_file(Path::new("input.txt"), Path::new("output.txt")).unwrap();
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod merger;
pub mod record;
pub mod sort;
pub mod store;

pub use buffer::KeyGroupBuffer;
pub use chunk::{
    ChunkCursor, ChunkFormat, CursorError, ExternalChunkError, RmpChunk, RmpFormat, TextChunk, TextFormat,
};
pub use merger::BinaryHeapMerger;
pub use record::{Record, RecordCodec, RecordError};
pub use sort::{ExternalSorter, ExternalSorterBuilder, RecordLocation, SortError, SortStats};
pub use store::{ChunkHandle, Workspace};
