pub mod hashing;

mod byte_cursor;
pub use byte_cursor::{ByteCursor, ByteWriter};

mod format_error;
pub use format_error::FormatError;

mod object_handle;
pub use object_handle::ObjectHandle;

mod package_guid;
pub use package_guid::PackageGuid;

pub mod compressed_stream;
pub use compressed_stream::{
    ChunkInfo, ChunkTable, CompressedStreamWriter, StreamHeader, PACKAGE_FILE_TAG,
    PACKAGE_FILE_TAG_SWAPPED,
};

pub mod package_file;
pub use package_file::{
    CompressionMethod, ExportEntry, ImportEntry, PackageChunk, PackageSummary, PackageWriter,
};
