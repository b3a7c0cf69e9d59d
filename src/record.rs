//! Record codec.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::num::ParseIntError;

use serde;

/// Default key/value delimiter.
pub const DEFAULT_DELIMITER: char = '|';

/// A single `key|value` record. Records are ordered by key only.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub key: i64,
    pub value: String,
}

impl Record {
    pub fn new(key: i64, value: impl Into<String>) -> Self {
        Record {
            key,
            value: value.into(),
        }
    }
}

/// Record parsing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The line contains no delimiter.
    MissingDelimiter(String),
    /// The key segment is not a valid integer.
    InvalidKey(String, ParseIntError),
}

impl Error for RecordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            RecordError::MissingDelimiter(_) => None,
            RecordError::InvalidKey(_, err) => Some(err),
        }
    }
}

impl Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RecordError::MissingDelimiter(line) => write!(f, "delimiter not found in line {:?}", line),
            RecordError::InvalidKey(key, err) => write!(f, "invalid key {:?}: {}", key, err),
        }
    }
}

/// Converts records to and from their textual line form `<key><delimiter><value>`.
///
/// Only the first delimiter separates the key from the value, so values may contain
/// the delimiter and are written back verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCodec {
    delimiter: char,
}

impl RecordCodec {
    /// Creates a codec using the given delimiter.
    /// Returns [`None`] if the delimiter can be a part of an integer key or a line terminator.
    pub fn new(delimiter: char) -> Option<Self> {
        if delimiter.is_ascii_digit() || matches!(delimiter, '+' | '-' | '\n' | '\r') {
            None
        } else {
            Some(RecordCodec { delimiter })
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Parses a line (without its terminator) into a record.
    pub fn parse(&self, line: &str) -> Result<Record, RecordError> {
        let (key, value) = line
            .split_once(self.delimiter)
            .ok_or_else(|| RecordError::MissingDelimiter(line.to_string()))?;

        let key = key
            .parse::<i64>()
            .map_err(|err| RecordError::InvalidKey(key.to_string(), err))?;

        return Ok(Record::new(key, value));
    }

    /// Serializes a record into a line without a terminator.
    pub fn serialize(&self, record: &Record) -> String {
        format!("{}{}{}", record.key, self.delimiter, record.value)
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        RecordCodec {
            delimiter: DEFAULT_DELIMITER,
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{Record, RecordCodec, RecordError};

    #[rstest]
    #[case("1|a", Record::new(1, "a"))]
    #[case("-42|negative", Record::new(-42, "negative"))]
    #[case("7|", Record::new(7, ""))]
    #[case("3|a|b||c", Record::new(3, "a|b||c"))]
    fn test_parse(#[case] line: &str, #[case] expected: Record) {
        let codec = RecordCodec::default();
        assert_eq!(codec.parse(line).unwrap(), expected);
    }

    #[rstest]
    #[case("no delimiter")]
    #[case("")]
    fn test_parse_missing_delimiter(#[case] line: &str) {
        let codec = RecordCodec::default();
        assert!(matches!(codec.parse(line), Err(RecordError::MissingDelimiter(_))));
    }

    #[rstest]
    #[case("abc|value")]
    #[case("|value")]
    #[case(" 1|value")]
    #[case("99999999999999999999|overflow")]
    fn test_parse_invalid_key(#[case] line: &str) {
        let codec = RecordCodec::default();
        assert!(matches!(codec.parse(line), Err(RecordError::InvalidKey(_, _))));
    }

    #[test]
    fn test_serialize_keeps_embedded_delimiters() {
        let codec = RecordCodec::default();
        let line = "12|x|y|z";
        assert_eq!(codec.serialize(&codec.parse(line).unwrap()), line);
    }

    #[test]
    fn test_custom_delimiter() {
        let codec = RecordCodec::new(',').unwrap();
        assert_eq!(codec.delimiter(), ',');
        assert_eq!(codec.parse("5,a|b,c").unwrap(), Record::new(5, "a|b,c"));
        assert_eq!(codec.serialize(&Record::new(5, "v")), "5,v");
    }

    #[rstest]
    #[case('0')]
    #[case('-')]
    #[case('+')]
    #[case('\n')]
    fn test_rejected_delimiters(#[case] delimiter: char) {
        assert!(RecordCodec::new(delimiter).is_none());
    }
}
