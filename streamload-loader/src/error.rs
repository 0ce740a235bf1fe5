use streamload_base::{FormatError, PackageGuid};
use std::sync::Arc;

/// Everything needed to act on a corrupted compressed stream: which file, where, and what
/// disagreed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    pub file_name: String,
    pub offset: u64,
    pub reason: &'static str,
    pub expected: u64,
    pub actual: u64,
}

impl core::fmt::Display for CorruptionReport {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        write!(
            fmt,
            "corrupted compressed data in {} at offset {}: {} (expected {}, actual {})",
            self.file_name, self.offset, self.reason, self.expected, self.actual
        )
    }
}

#[derive(Debug, Clone)]
pub enum LoaderError {
    StringError(String),
    IoError(Arc<std::io::Error>),
    JsonError(Arc<serde_json::Error>),
    Format(FormatError),
    InvalidOffset(i64),
    SeekPastEnd { position: u64, count: u64, size: u64 },
    OutOfRange { position: i64, size: u64 },
    Corrupted(CorruptionReport),
    Decompression(String),
    PackageNotFound(String),
    GuidMismatch {
        package: String,
        expected: PackageGuid,
        actual: PackageGuid,
    },
    HandleUnavailable(String),
}

pub type LoaderResult<T> = Result<T, LoaderError>;

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoaderError::StringError(_) => None,
            LoaderError::IoError(ref e) => Some(&**e),
            LoaderError::JsonError(ref e) => Some(&**e),
            LoaderError::Format(ref e) => Some(e),
            LoaderError::InvalidOffset(_) => None,
            LoaderError::SeekPastEnd { .. } => None,
            LoaderError::OutOfRange { .. } => None,
            LoaderError::Corrupted(_) => None,
            LoaderError::Decompression(_) => None,
            LoaderError::PackageNotFound(_) => None,
            LoaderError::GuidMismatch { .. } => None,
            LoaderError::HandleUnavailable(_) => None,
        }
    }
}

impl core::fmt::Display for LoaderError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            LoaderError::StringError(ref e) => e.fmt(fmt),
            LoaderError::IoError(ref e) => e.fmt(fmt),
            LoaderError::JsonError(ref e) => e.fmt(fmt),
            LoaderError::Format(ref e) => e.fmt(fmt),
            LoaderError::InvalidOffset(offset) => write!(fmt, "invalid read offset {}", offset),
            LoaderError::SeekPastEnd {
                position,
                count,
                size,
            } => write!(
                fmt,
                "read of {} bytes at {} goes past the end of a {} byte file",
                count, position, size
            ),
            LoaderError::OutOfRange { position, size } => {
                write!(fmt, "seek to {} is outside of a {} byte file", position, size)
            }
            LoaderError::Corrupted(ref report) => report.fmt(fmt),
            LoaderError::Decompression(ref e) => write!(fmt, "decompression failed: {}", e),
            LoaderError::PackageNotFound(ref name) => write!(fmt, "package {} not found", name),
            LoaderError::GuidMismatch {
                ref package,
                expected,
                actual,
            } => write!(
                fmt,
                "package {} has guid {} but {} was requested",
                package, actual, expected
            ),
            LoaderError::HandleUnavailable(ref name) => {
                write!(fmt, "no file handle could be opened for {}", name)
            }
        }
    }
}

impl From<&str> for LoaderError {
    fn from(str: &str) -> Self {
        LoaderError::StringError(str.to_string())
    }
}

impl From<String> for LoaderError {
    fn from(string: String) -> Self {
        LoaderError::StringError(string)
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(error: std::io::Error) -> Self {
        LoaderError::IoError(Arc::new(error))
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(error: serde_json::Error) -> Self {
        LoaderError::JsonError(Arc::new(error))
    }
}

impl From<FormatError> for LoaderError {
    fn from(error: FormatError) -> Self {
        LoaderError::Format(error)
    }
}
