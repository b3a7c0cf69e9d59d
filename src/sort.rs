//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::buffer::KeyGroupBuffer;
use crate::chunk::{ChunkCursor, ChunkFormat, CursorError, ExternalChunkError, TextFormat};
use crate::merger::BinaryHeapMerger;
use crate::record::{Record, RecordCodec, RecordError, DEFAULT_DELIMITER};
use crate::store::{ChunkHandle, Workspace};

/// Default number of distinct keys per chunk.
pub const DEFAULT_THRESHOLD: usize = 1000;

/// Place a malformed record was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordLocation {
    /// Input stream line, 1-based.
    Input(usize),
    /// Chunk file.
    Chunk(PathBuf),
}

impl Display for RecordLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RecordLocation::Input(line) => write!(f, "input line {}", line),
            RecordLocation::Chunk(path) => write!(f, "chunk {}", path.display()),
        }
    }
}

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Malformed record: missing delimiter or invalid key.
    MalformedRecord(RecordLocation, RecordError),
    /// Workspace directory or chunk file creation, access or removal error.
    Storage(PathBuf, io::Error),
    /// Chunk file that holds no records.
    EmptyChunk(PathBuf),
    /// Input or output stream I/O error.
    IO(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Chunk serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Chunk deserialization error.
    DeserializationError(rmp_serde::decode::Error),
    /// Sorter configuration error.
    InvalidConfig(String),
}

impl SortError {
    pub(crate) fn from_chunk_error(path: &Path, err: ExternalChunkError) -> Self {
        match err {
            ExternalChunkError::IO(err) => SortError::Storage(path.to_path_buf(), err),
            ExternalChunkError::MalformedRecord(err) => {
                SortError::MalformedRecord(RecordLocation::Chunk(path.to_path_buf()), err)
            }
            ExternalChunkError::SerializationError(err) => SortError::SerializationError(err),
            ExternalChunkError::DeserializationError(err) => SortError::DeserializationError(err),
        }
    }
}

impl From<CursorError> for SortError {
    fn from(err: CursorError) -> Self {
        match err {
            CursorError::Open(path, err) => SortError::Storage(path, err),
            CursorError::Read(path, err) => SortError::from_chunk_error(&path, err),
            CursorError::Empty(path) => SortError::EmptyChunk(path),
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::MalformedRecord(_, err) => Some(err),
            SortError::Storage(_, err) => Some(err),
            SortError::EmptyChunk(_) => None,
            SortError::IO(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::DeserializationError(err) => Some(err),
            SortError::InvalidConfig(_) => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::MalformedRecord(location, err) => write!(f, "malformed record at {}: {}", location, err),
            SortError::Storage(path, err) => write!(f, "temporary storage error ({}): {}", path.display(), err),
            SortError::EmptyChunk(path) => write!(f, "chunk {} contains no records", path.display()),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            SortError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

/// Sorting run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Number of chunks produced by the build phase.
    pub chunks: usize,
    /// Number of intermediate merge passes.
    pub merge_passes: usize,
    /// Number of records written to the output.
    pub records: usize,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<F = TextFormat>
where
    F: ChunkFormat,
{
    /// Number of threads to be used to sort chunk data in parallel.
    threads_number: Option<usize>,
    /// Workspace directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of distinct keys per chunk.
    threshold: usize,
    /// Key/value delimiter of input and output records.
    delimiter: char,
    /// Maximum number of chunks merged at once.
    max_fan_in: Option<usize>,
    /// Chunk file format.
    format: F,
}

impl<F> ExternalSorterBuilder<F>
where
    F: ChunkFormat + Default,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }
}

impl<F> ExternalSorterBuilder<F>
where
    F: ChunkFormat,
{
    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<F>, SortError> {
        if self.threshold == 0 {
            return Err(SortError::InvalidConfig("threshold must be positive".to_string()));
        }
        if matches!(self.max_fan_in, Some(fan_in) if fan_in < 2) {
            return Err(SortError::InvalidConfig("merge fan-in must be at least 2".to_string()));
        }
        let codec = RecordCodec::new(self.delimiter)
            .ok_or_else(|| SortError::InvalidConfig(format!("unusable delimiter {:?}", self.delimiter)))?;

        ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.rw_buf_size,
            self.threshold,
            codec,
            self.max_fan_in,
            self.format,
        )
    }

    /// Sets number of threads to be used to sort chunk data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<F> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets workspace directory to be used to store temporary data.
    /// The directory is created if absent and removed with all its content once sorting is done.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<F> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<F> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets number of distinct keys after which a chunk is flushed.
    pub fn with_threshold(mut self, threshold: usize) -> ExternalSorterBuilder<F> {
        self.threshold = threshold;
        return self;
    }

    /// Sets input and output key/value delimiter.
    pub fn with_delimiter(mut self, delimiter: char) -> ExternalSorterBuilder<F> {
        self.delimiter = delimiter;
        return self;
    }

    /// Sets maximum number of chunks merged at once. Extra chunks are merged in several passes.
    pub fn with_max_fan_in(mut self, max_fan_in: usize) -> ExternalSorterBuilder<F> {
        self.max_fan_in = Some(max_fan_in);
        return self;
    }

    /// Sets chunk file format.
    pub fn with_format<G: ChunkFormat>(self, format: G) -> ExternalSorterBuilder<G> {
        ExternalSorterBuilder {
            threads_number: self.threads_number,
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            threshold: self.threshold,
            delimiter: self.delimiter,
            max_fan_in: self.max_fan_in,
            format,
        }
    }
}

impl<F> Default for ExternalSorterBuilder<F>
where
    F: ChunkFormat + Default,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            threshold: DEFAULT_THRESHOLD,
            delimiter: DEFAULT_DELIMITER,
            max_fan_in: None,
            format: F::default(),
        }
    }
}

/// External sorter.
pub struct ExternalSorter<F = TextFormat>
where
    F: ChunkFormat,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Workspace directory to be used to store temporary data.
    tmp_dir: Option<PathBuf>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of distinct keys per chunk.
    threshold: usize,
    /// Input and output record codec.
    codec: RecordCodec,
    /// Maximum number of chunks merged at once.
    max_fan_in: Option<usize>,
    /// Chunk file format.
    format: F,
}

impl<F> ExternalSorter<F>
where
    F: ChunkFormat,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort chunk data in parallel. If the parameter is
    ///   [`None`] threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Workspace directory. If parameter is [`None`] a new directory inside the default OS
    ///   temporary directory will be used.
    /// * `rw_buf_size` - Chunks file read/write buffer size.
    /// * `threshold` - Number of distinct keys after which a chunk is flushed.
    /// * `codec` - Input and output record codec.
    /// * `max_fan_in` - Maximum number of chunks merged at once, unbounded if [`None`].
    /// * `format` - Chunk file format.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        rw_buf_size: Option<usize>,
        threshold: usize,
        codec: RecordCodec,
        max_fan_in: Option<usize>,
        format: F,
    ) -> Result<Self, SortError> {
        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Path::to_path_buf),
            rw_buf_size,
            threshold,
            codec,
            max_fan_in,
            format,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Sorts the `input` file into the `output` file.
    /// The output file is created or truncated only after the whole input has been split into chunks,
    /// so the input and the output may be the same file. It is left partially written if merging fails.
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortStats, SortError> {
        let input_stream = fs::File::open(input).map_err(SortError::IO)?;

        let (stats, mut output_writer) = self.sort_into(io::BufReader::new(input_stream), || {
            let output_stream = fs::File::create(output).map_err(SortError::IO)?;
            Ok(io::BufWriter::new(output_stream))
        })?;
        output_writer.flush().map_err(SortError::IO)?;

        return Ok(stats);
    }

    /// Sorts records read line by line from `input` writing them to `output`.
    ///
    /// The workspace is created before sorting starts and removed when it is done,
    /// whether sorting succeeded or not.
    pub fn sort_stream<R, W>(&self, input: R, output: &mut W) -> Result<SortStats, SortError>
    where
        R: BufRead,
        W: Write,
    {
        let (stats, _) = self.sort_into(input, || Ok(output))?;
        return Ok(stats);
    }

    /// Sorts `input` into the writer returned by `open_output`, which is called once the
    /// final merge is ready to start.
    fn sort_into<R, W, O>(&self, input: R, open_output: O) -> Result<(SortStats, W), SortError>
    where
        R: BufRead,
        W: Write,
        O: FnOnce() -> Result<W, SortError>,
    {
        let mut workspace = match Workspace::create(self.tmp_dir.as_deref()) {
            Ok(workspace) => workspace,
            Err(err) => {
                let path = self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
                return Err(SortError::Storage(path, err));
            }
        };

        let result = self.run(&workspace, input, open_output);
        workspace.destroy();

        match &result {
            Ok((stats, _)) => log::info!(
                "sorted {} records (chunks: {}, merge passes: {})",
                stats.records,
                stats.chunks,
                stats.merge_passes
            ),
            Err(err) => log::error!("sorting failed: {}", err),
        }

        return result;
    }

    fn run<R, W, O>(&self, workspace: &Workspace, input: R, open_output: O) -> Result<(SortStats, W), SortError>
    where
        R: BufRead,
        W: Write,
        O: FnOnce() -> Result<W, SortError>,
    {
        let codec = self.codec;
        let records = input.lines().enumerate().map(|(idx, line)| {
            let line = line.map_err(SortError::IO)?;
            codec
                .parse(&line)
                .map_err(|err| SortError::MalformedRecord(RecordLocation::Input(idx + 1), err))
        });

        let chunks = self.build_chunks(workspace, records)?;
        let mut stats = SortStats {
            chunks: chunks.len(),
            ..SortStats::default()
        };

        let (chunks, merge_passes) = self.reduce_fan_in(workspace, chunks)?;
        stats.merge_passes = merge_passes;

        let merger = self.open_merger(workspace, &chunks)?;
        let mut output = open_output()?;
        stats.records = merger.write_to(&mut output, &self.codec)?;

        return Ok((stats, output));
    }

    /// Splits the input into sorted chunks stored in the workspace.
    /// Returns chunk handles in creation order.
    ///
    /// # Arguments
    /// * `workspace` - Workspace chunks are stored in
    /// * `input` - Input records
    pub fn build_chunks<I>(&self, workspace: &Workspace, input: I) -> Result<Vec<ChunkHandle>, SortError>
    where
        I: IntoIterator<Item = Result<Record, SortError>>,
    {
        let mut chunk_buf = KeyGroupBuffer::new(self.threshold);
        let mut chunks = Vec::new();

        for record in input.into_iter() {
            chunk_buf.push(record?);

            if chunk_buf.is_full() {
                chunks.push(self.create_chunk(workspace, chunk_buf)?);
                chunk_buf = KeyGroupBuffer::new(self.threshold);
            }
        }

        if !chunk_buf.is_empty() {
            chunks.push(self.create_chunk(workspace, chunk_buf)?);
        }

        log::debug!("external sort preparation done (chunks: {})", chunks.len());

        return Ok(chunks);
    }

    fn create_chunk(&self, workspace: &Workspace, buffer: KeyGroupBuffer) -> Result<ChunkHandle, SortError> {
        log::debug!("sorting chunk data (keys: {}, records: {}) ...", buffer.keys(), buffer.len());
        let records = buffer.into_sorted(&self.thread_pool);

        let (handle, file) = workspace
            .new_chunk(self.format.suffix())
            .map_err(|err| SortError::Storage(workspace.path().to_path_buf(), err))?;

        log::debug!("saving chunk data to {}", handle.path().display());
        let mut chunk_writer = self.chunk_writer(file);
        self.format
            .dump(&mut chunk_writer, records)
            .map_err(|err| SortError::from_chunk_error(handle.path(), err))?;
        chunk_writer
            .flush()
            .map_err(|err| SortError::Storage(handle.path().to_path_buf(), err))?;

        return Ok(handle);
    }

    /// Merges chunks in passes until their number does not exceed the fan-in limit.
    /// Consecutive chunks are merged together so that chunk creation order is kept.
    fn reduce_fan_in(
        &self,
        workspace: &Workspace,
        mut chunks: Vec<ChunkHandle>,
    ) -> Result<(Vec<ChunkHandle>, usize), SortError> {
        let max_fan_in = match self.max_fan_in {
            Some(max_fan_in) => max_fan_in,
            None => return Ok((chunks, 0)),
        };

        let mut passes = 0;
        while chunks.len() > max_fan_in {
            passes += 1;
            log::debug!("merge pass {} (chunks: {}, fan-in: {})", passes, chunks.len(), max_fan_in);

            let mut merged = Vec::new();
            let mut remaining = chunks.into_iter();
            loop {
                let mut group = Vec::from_iter(remaining.by_ref().take(max_fan_in));
                match group.len() {
                    0 => break,
                    1 => merged.extend(group.pop()),
                    _ => merged.push(self.merge_group(workspace, group)?),
                }
            }
            chunks = merged;
        }

        return Ok((chunks, passes));
    }

    fn merge_group(&self, workspace: &Workspace, group: Vec<ChunkHandle>) -> Result<ChunkHandle, SortError> {
        let (handle, file) = workspace
            .new_chunk(self.format.suffix())
            .map_err(|err| SortError::Storage(workspace.path().to_path_buf(), err))?;

        let mut chunk_writer = self.chunk_writer(file);
        for record in self.open_merger(workspace, &group)? {
            self.format
                .write_record(&mut chunk_writer, &record?)
                .map_err(|err| SortError::from_chunk_error(handle.path(), err))?;
        }
        chunk_writer
            .flush()
            .map_err(|err| SortError::Storage(handle.path().to_path_buf(), err))?;

        for consumed in group {
            let path = consumed.path().to_path_buf();
            workspace.delete(consumed).map_err(|err| SortError::Storage(path, err))?;
        }

        return Ok(handle);
    }

    fn open_merger(
        &self,
        workspace: &Workspace,
        chunks: &[ChunkHandle],
    ) -> Result<BinaryHeapMerger<F::Reader>, SortError> {
        let mut cursors = Vec::with_capacity(chunks.len());
        for (index, handle) in chunks.iter().enumerate() {
            cursors.push(ChunkCursor::open(index, workspace, handle, &self.format, self.rw_buf_size)?);
        }

        BinaryHeapMerger::new(cursors)
    }

    fn chunk_writer(&self, file: fs::File) -> io::BufWriter<fs::File> {
        match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        }
    }
}
