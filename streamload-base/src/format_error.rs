#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    UnexpectedEnd { offset: usize, needed: usize, available: usize },
    BadTag { expected: u32, actual: u32 },
    InvalidUtf8 { offset: usize },
    InvalidChunkTable(String),
    InvalidHeader(String),
    UnsupportedCompression(u32),
}

impl std::error::Error for FormatError {}

impl core::fmt::Display for FormatError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            FormatError::UnexpectedEnd {
                offset,
                needed,
                available,
            } => write!(
                fmt,
                "unexpected end of data at offset {}: needed {} bytes, {} available",
                offset, needed, available
            ),
            FormatError::BadTag { expected, actual } => write!(
                fmt,
                "bad tag 0x{:08X}, expected 0x{:08X} or its byte-swapped form",
                actual, expected
            ),
            FormatError::InvalidUtf8 { offset } => {
                write!(fmt, "string at offset {} is not valid utf-8", offset)
            }
            FormatError::InvalidChunkTable(ref e) => write!(fmt, "invalid chunk table: {}", e),
            FormatError::InvalidHeader(ref e) => write!(fmt, "invalid package header: {}", e),
            FormatError::UnsupportedCompression(method) => {
                write!(fmt, "unsupported compression method {}", method)
            }
        }
    }
}
