use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::record::{Record, RecordCodec, RecordError};
use crate::store::{ChunkHandle, Workspace};

/// Chunk reading/writing error.
#[derive(Debug)]
pub enum ExternalChunkError {
    /// Common I/O error.
    IO(io::Error),
    /// Malformed textual record.
    MalformedRecord(RecordError),
    /// Record serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Record deserialization error.
    DeserializationError(rmp_serde::decode::Error),
}

impl Error for ExternalChunkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ExternalChunkError::IO(err) => err,
            ExternalChunkError::MalformedRecord(err) => err,
            ExternalChunkError::SerializationError(err) => err,
            ExternalChunkError::DeserializationError(err) => err,
        })
    }
}

impl Display for ExternalChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ExternalChunkError::IO(err) => write!(f, "{}", err),
            ExternalChunkError::MalformedRecord(err) => write!(f, "{}", err),
            ExternalChunkError::SerializationError(err) => write!(f, "{}", err),
            ExternalChunkError::DeserializationError(err) => write!(f, "{}", err),
        }
    }
}

impl From<io::Error> for ExternalChunkError {
    fn from(err: io::Error) -> Self {
        ExternalChunkError::IO(err)
    }
}

/// Chunk file encoding. Provides methods for writing records to a chunk file and reading them back.
pub trait ChunkFormat: Clone + Send + Sync {
    /// Sequential chunk reader.
    type Reader: Iterator<Item = Result<Record, ExternalChunkError>>;

    /// Chunk file name suffix.
    fn suffix(&self) -> &'static str;

    /// Creates a reader over a chunk file.
    fn reader(&self, file: fs::File, buf_size: Option<usize>) -> Result<Self::Reader, ExternalChunkError>;

    /// Writes a single record.
    fn write_record<W: Write>(&self, writer: &mut W, record: &Record) -> Result<(), ExternalChunkError>;

    /// Dumps records to a chunk writer. Returns the number of records written.
    fn dump<W: Write>(
        &self,
        writer: &mut W,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<usize, ExternalChunkError> {
        let mut count = 0;
        for record in records.into_iter() {
            self.write_record(writer, &record)?;
            count += 1;
        }

        return Ok(count);
    }
}

/// Textual chunk format: one `<key><delimiter><value>` line per record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFormat {
    codec: RecordCodec,
}

impl ChunkFormat for TextFormat {
    type Reader = TextChunk;

    fn suffix(&self) -> &'static str {
        ".txt"
    }

    fn reader(&self, file: fs::File, buf_size: Option<usize>) -> Result<Self::Reader, ExternalChunkError> {
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(TextChunk {
            reader,
            codec: self.codec,
            line: String::new(),
        });
    }

    fn write_record<W: Write>(&self, writer: &mut W, record: &Record) -> Result<(), ExternalChunkError> {
        writeln!(writer, "{}", self.codec.serialize(record))?;
        return Ok(());
    }
}

/// Text chunk reader.
pub struct TextChunk {
    reader: io::BufReader<fs::File>,
    codec: RecordCodec,
    line: String,
}

impl Iterator for TextChunk {
    type Item = Result<Record, ExternalChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => None,
            Ok(_) => {
                let line = self.line.strip_suffix('\n').unwrap_or(&self.line);
                Some(self.codec.parse(line).map_err(ExternalChunkError::MalformedRecord))
            }
            Err(err) => Some(Err(ExternalChunkError::IO(err))),
        }
    }
}

/// RMP (Rust MessagePack) chunk format.
/// Unlike the text format it preserves values containing line terminators.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmpFormat;

impl ChunkFormat for RmpFormat {
    type Reader = RmpChunk;

    fn suffix(&self) -> &'static str {
        ".rmp"
    }

    fn reader(&self, file: fs::File, buf_size: Option<usize>) -> Result<Self::Reader, ExternalChunkError> {
        let file_len = file.metadata()?.len();
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(RmpChunk {
            reader: reader.take(file_len),
        });
    }

    fn write_record<W: Write>(&self, mut writer: &mut W, record: &Record) -> Result<(), ExternalChunkError> {
        rmp_serde::encode::write(&mut writer, record).map_err(ExternalChunkError::SerializationError)
    }
}

/// MessagePack chunk reader.
pub struct RmpChunk {
    reader: io::Take<io::BufReader<fs::File>>,
}

impl Iterator for RmpChunk {
    type Item = Result<Record, ExternalChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.limit() == 0 {
            None
        } else {
            match rmp_serde::decode::from_read(&mut self.reader) {
                Ok(record) => Some(Ok(record)),
                Err(err) => Some(Err(ExternalChunkError::DeserializationError(err))),
            }
        }
    }
}

/// Chunk cursor opening error.
#[derive(Debug)]
pub enum CursorError {
    /// The chunk file can't be opened.
    Open(PathBuf, io::Error),
    /// The chunk can't be read.
    Read(PathBuf, ExternalChunkError),
    /// The chunk contains no records.
    Empty(PathBuf),
}

impl Error for CursorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            CursorError::Open(_, err) => Some(err),
            CursorError::Read(_, err) => Some(err),
            CursorError::Empty(_) => None,
        }
    }
}

impl Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            CursorError::Open(path, err) => write!(f, "chunk {} not opened: {}", path.display(), err),
            CursorError::Read(path, err) => write!(f, "chunk {} not read: {}", path.display(), err),
            CursorError::Empty(path) => write!(f, "chunk {} contains no records", path.display()),
        }
    }
}

/// Forward-only reader over a sorted chunk with "peek next record" semantics.
/// The underlying file is closed when the cursor is dropped.
pub struct ChunkCursor<R> {
    index: usize,
    path: PathBuf,
    reader: R,
    head: Option<Record>,
}

impl<R> ChunkCursor<R>
where
    R: Iterator<Item = Result<Record, ExternalChunkError>>,
{
    /// Opens a cursor over the chunk and reads its first record.
    ///
    /// # Arguments
    /// * `index` - Chunk creation index, used to order records with equal keys
    /// * `workspace` - Workspace the chunk belongs to
    /// * `handle` - Chunk handle
    /// * `format` - Chunk file format
    /// * `buf_size` - Chunk read buffer size
    pub fn open<F>(
        index: usize,
        workspace: &Workspace,
        handle: &ChunkHandle,
        format: &F,
        buf_size: Option<usize>,
    ) -> Result<Self, CursorError>
    where
        F: ChunkFormat<Reader = R>,
    {
        let path = handle.path().to_path_buf();
        let file = match workspace.open(handle) {
            Ok(file) => file,
            Err(err) => return Err(CursorError::Open(path, err)),
        };
        let mut reader = match format.reader(file, buf_size) {
            Ok(reader) => reader,
            Err(err) => return Err(CursorError::Read(path, err)),
        };

        let head = match reader.next() {
            Some(Ok(record)) => record,
            Some(Err(err)) => return Err(CursorError::Read(path, err)),
            None => return Err(CursorError::Empty(path)),
        };

        return Ok(ChunkCursor {
            index,
            path,
            reader,
            head: Some(head),
        });
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next unread record without consuming it.
    pub fn peek(&self) -> Option<&Record> {
        self.head.as_ref()
    }

    /// Consumes the current record and reads the following one.
    pub fn advance(&mut self) -> Result<Option<Record>, ExternalChunkError> {
        let current = self.head.take();
        if current.is_some() {
            self.head = self.reader.next().transpose()?;
        }

        return Ok(current);
    }

    pub fn is_exhausted(&self) -> bool {
        self.head.is_none()
    }
}
