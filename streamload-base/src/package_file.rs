// Package File Layout
//
// Logical layout (what deserialization code sees):
// [summary] fixed fields, then reservation sizes, then the compressed chunk map
// [imports] import_count entries starting at import_offset
// [exports] export_count entries starting at export_offset, ending at total_header_size
// [x] export data, each export at its serial_offset/serial_size
//
// An uncompressed package stores the logical layout as-is. A compressed package stores the
// summary uncompressed at offset 0, and everything after it as a series of package chunks. Each
// package chunk covers a logical range and is stored as an independent chunked compressed stream
// (see compressed_stream.rs) at its compressed_offset.
//
// All u32 values are native-endian, the tag is used to detect a byte order mismatch.

use crate::byte_cursor::{string_size, ByteCursor, ByteWriter};
use crate::compressed_stream::{
    CompressedStreamWriter, PACKAGE_FILE_TAG, PACKAGE_FILE_TAG_SWAPPED,
};
use crate::{FormatError, PackageGuid};
use serde::{Deserialize, Serialize};

pub const PACKAGE_FILE_VERSION: u32 = 1;

/// Size of the summary fields that precede the variable-length lists
pub const SUMMARY_FIXED_SIZE: usize = 52;

const PACKAGE_CHUNK_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionMethod {
    None,
    Zlib,
    Lz4,
}

impl CompressionMethod {
    pub fn from_u32(value: u32) -> Result<Self, FormatError> {
        match value {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Zlib),
            2 => Ok(CompressionMethod::Lz4),
            other => Err(FormatError::UnsupportedCompression(other)),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Zlib => 1,
            CompressionMethod::Lz4 => 2,
        }
    }
}

/// One package chunk: a logical (uncompressed) range and the physical compressed stream holding it
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct PackageChunk {
    pub uncompressed_offset: u32,
    pub uncompressed_size: u32,
    pub compressed_offset: u32,
    pub compressed_size: u32,
}

impl PackageChunk {
    pub fn uncompressed_end(&self) -> u64 {
        self.uncompressed_offset as u64 + self.uncompressed_size as u64
    }

    pub fn contains(
        &self,
        offset: u64,
    ) -> bool {
        offset >= self.uncompressed_offset as u64 && offset < self.uncompressed_end()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportEntry {
    pub package_name: String,
    pub object_name: String,
    pub class_name: String,
}

impl ImportEntry {
    fn serialized_size(&self) -> usize {
        string_size(&self.package_name)
            + string_size(&self.object_name)
            + string_size(&self.class_name)
    }

    fn write(
        &self,
        writer: &mut ByteWriter,
    ) {
        writer.write_string(&self.package_name);
        writer.write_string(&self.object_name);
        writer.write_string(&self.class_name);
    }

    fn read(cursor: &mut ByteCursor) -> Result<Self, FormatError> {
        Ok(ImportEntry {
            package_name: cursor.read_string()?,
            object_name: cursor.read_string()?,
            class_name: cursor.read_string()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportEntry {
    pub object_name: String,
    pub class_name: String,
    pub serial_offset: u32,
    pub serial_size: u32,
    pub export_guid: PackageGuid,
}

impl ExportEntry {
    fn serialized_size(&self) -> usize {
        string_size(&self.object_name) + string_size(&self.class_name) + 4 + 4 + 16
    }

    fn write(
        &self,
        writer: &mut ByteWriter,
    ) {
        writer.write_string(&self.object_name);
        writer.write_string(&self.class_name);
        writer.write_u32(self.serial_offset);
        writer.write_u32(self.serial_size);
        writer.write_guid(self.export_guid);
    }

    fn read(cursor: &mut ByteCursor) -> Result<Self, FormatError> {
        Ok(ExportEntry {
            object_name: cursor.read_string()?,
            class_name: cursor.read_string()?,
            serial_offset: cursor.read_u32()?,
            serial_size: cursor.read_u32()?,
            export_guid: cursor.read_guid()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageSummary {
    pub version: u32,
    pub summary_size: u32,
    pub total_header_size: u32,
    pub guid: PackageGuid,
    pub compression: CompressionMethod,
    pub import_count: u32,
    pub import_offset: u32,
    pub export_count: u32,
    pub export_offset: u32,
    pub reservation_sizes: Vec<u32>,
    pub compressed_chunks: Vec<PackageChunk>,
    pub byte_swapped: bool,
}

impl PackageSummary {
    /// Reads just enough of the fixed fields to learn how many bytes the whole summary occupies
    pub fn peek_summary_size(fixed: &[u8]) -> Result<usize, FormatError> {
        let byte_swapped = Self::detect_byte_order(fixed)?;
        let mut cursor = ByteCursor::new(fixed, byte_swapped);
        cursor.seek(8)?;
        Ok(cursor.read_u32()? as usize)
    }

    fn detect_byte_order(bytes: &[u8]) -> Result<bool, FormatError> {
        let mut cursor = ByteCursor::new(bytes, false);
        match cursor.read_u32()? {
            PACKAGE_FILE_TAG => Ok(false),
            PACKAGE_FILE_TAG_SWAPPED => Ok(true),
            actual => Err(FormatError::BadTag {
                expected: PACKAGE_FILE_TAG,
                actual,
            }),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let byte_swapped = Self::detect_byte_order(bytes)?;
        let mut cursor = ByteCursor::new(bytes, byte_swapped);
        let _tag = cursor.read_u32()?;
        let version = cursor.read_u32()?;
        let summary_size = cursor.read_u32()?;
        let total_header_size = cursor.read_u32()?;
        let guid = cursor.read_guid()?;
        let compression = CompressionMethod::from_u32(cursor.read_u32()?)?;
        let import_count = cursor.read_u32()?;
        let import_offset = cursor.read_u32()?;
        let export_count = cursor.read_u32()?;
        let export_offset = cursor.read_u32()?;

        let reservation_count = cursor.read_u32()? as usize;
        let mut reservation_sizes = Vec::with_capacity(reservation_count.min(1024));
        for _ in 0..reservation_count {
            reservation_sizes.push(cursor.read_u32()?);
        }

        let chunk_count = cursor.read_u32()? as usize;
        let mut compressed_chunks = Vec::with_capacity(chunk_count.min(1024));
        for _ in 0..chunk_count {
            compressed_chunks.push(PackageChunk {
                uncompressed_offset: cursor.read_u32()?,
                uncompressed_size: cursor.read_u32()?,
                compressed_offset: cursor.read_u32()?,
                compressed_size: cursor.read_u32()?,
            });
        }

        if cursor.position() != summary_size as usize {
            return Err(FormatError::InvalidChunkTable(format!(
                "summary declares {} bytes but {} were parsed",
                summary_size,
                cursor.position()
            )));
        }

        if total_header_size < summary_size {
            return Err(FormatError::InvalidHeader(format!(
                "header size {} is smaller than the {} byte summary",
                total_header_size, summary_size
            )));
        }
        for (table, offset) in [("import", import_offset), ("export", export_offset)] {
            if offset < summary_size || offset > total_header_size {
                return Err(FormatError::InvalidHeader(format!(
                    "{} table offset {} is outside the header [{}, {}]",
                    table, offset, summary_size, total_header_size
                )));
            }
        }

        if !compressed_chunks.is_empty() && compression == CompressionMethod::None {
            return Err(FormatError::InvalidChunkTable(
                "package has compressed chunks but no compression method".to_string(),
            ));
        }

        Ok(PackageSummary {
            version,
            summary_size,
            total_header_size,
            guid,
            compression,
            import_count,
            import_offset,
            export_count,
            export_offset,
            reservation_sizes,
            compressed_chunks,
            byte_swapped,
        })
    }

    pub fn is_compressed(&self) -> bool {
        !self.compressed_chunks.is_empty()
    }

    pub fn serialized_size(
        reservation_count: usize,
        chunk_count: usize,
    ) -> usize {
        SUMMARY_FIXED_SIZE + 4 + reservation_count * 4 + 4 + chunk_count * PACKAGE_CHUNK_SIZE
    }

    fn write(
        &self,
        writer: &mut ByteWriter,
    ) {
        writer.write_u32(PACKAGE_FILE_TAG);
        writer.write_u32(self.version);
        writer.write_u32(self.summary_size);
        writer.write_u32(self.total_header_size);
        writer.write_guid(self.guid);
        writer.write_u32(self.compression.as_u32());
        writer.write_u32(self.import_count);
        writer.write_u32(self.import_offset);
        writer.write_u32(self.export_count);
        writer.write_u32(self.export_offset);
        writer.write_u32(self.reservation_sizes.len() as u32);
        for size in &self.reservation_sizes {
            writer.write_u32(*size);
        }
        writer.write_u32(self.compressed_chunks.len() as u32);
        for chunk in &self.compressed_chunks {
            writer.write_u32(chunk.uncompressed_offset);
            writer.write_u32(chunk.uncompressed_size);
            writer.write_u32(chunk.compressed_offset);
            writer.write_u32(chunk.compressed_size);
        }
    }
}

/// Parses `count` imports from the start of `bytes`
pub fn parse_import_table(
    bytes: &[u8],
    count: usize,
    byte_swapped: bool,
) -> Result<Vec<ImportEntry>, FormatError> {
    let mut cursor = ByteCursor::new(bytes, byte_swapped);
    let mut imports = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        imports.push(ImportEntry::read(&mut cursor)?);
    }
    Ok(imports)
}

/// Parses `count` exports from the start of `bytes`
pub fn parse_export_table(
    bytes: &[u8],
    count: usize,
    byte_swapped: bool,
) -> Result<Vec<ExportEntry>, FormatError> {
    let mut cursor = ByteCursor::new(bytes, byte_swapped);
    let mut exports = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        exports.push(ExportEntry::read(&mut cursor)?);
    }
    Ok(exports)
}

struct PendingExport {
    object_name: String,
    class_name: String,
    export_guid: PackageGuid,
    data: Vec<u8>,
}

/// Lays out packages for tests and tooling. This is not a save pipeline, it only produces files in
/// the layout the loader consumes.
pub struct PackageWriter {
    guid: PackageGuid,
    imports: Vec<ImportEntry>,
    exports: Vec<PendingExport>,
    reservation_sizes: Vec<u32>,
    byte_swapped: bool,
}

impl PackageWriter {
    pub fn new(guid: PackageGuid) -> Self {
        PackageWriter {
            guid,
            imports: Vec::default(),
            exports: Vec::default(),
            reservation_sizes: Vec::default(),
            byte_swapped: false,
        }
    }

    pub fn with_byte_swapped(
        mut self,
        byte_swapped: bool,
    ) -> Self {
        self.byte_swapped = byte_swapped;
        self
    }

    pub fn add_import(
        &mut self,
        package_name: &str,
        object_name: &str,
        class_name: &str,
    ) {
        self.imports.push(ImportEntry {
            package_name: package_name.to_string(),
            object_name: object_name.to_string(),
            class_name: class_name.to_string(),
        });
    }

    pub fn add_export(
        &mut self,
        object_name: &str,
        class_name: &str,
        data: Vec<u8>,
    ) -> usize {
        self.add_export_with_guid(object_name, class_name, PackageGuid::null(), data)
    }

    pub fn add_export_with_guid(
        &mut self,
        object_name: &str,
        class_name: &str,
        export_guid: PackageGuid,
        data: Vec<u8>,
    ) -> usize {
        self.exports.push(PendingExport {
            object_name: object_name.to_string(),
            class_name: class_name.to_string(),
            export_guid,
            data,
        });
        self.exports.len() - 1
    }

    pub fn add_reservation(
        &mut self,
        size: u32,
    ) {
        self.reservation_sizes.push(size);
    }

    // Everything after the summary, with offsets computed for a summary of summary_size bytes
    fn build_body(
        &self,
        summary_size: usize,
    ) -> (Vec<u8>, u32, u32, u32) {
        let import_offset = summary_size;
        let import_table_size: usize = self.imports.iter().map(|x| x.serialized_size()).sum();
        let export_offset = import_offset + import_table_size;

        let mut export_entries = Vec::with_capacity(self.exports.len());
        let mut export_table_size = 0;
        for export in &self.exports {
            let entry = ExportEntry {
                object_name: export.object_name.clone(),
                class_name: export.class_name.clone(),
                serial_offset: 0,
                serial_size: export.data.len() as u32,
                export_guid: export.export_guid,
            };
            export_table_size += entry.serialized_size();
            export_entries.push(entry);
        }

        let total_header_size = export_offset + export_table_size;
        let mut serial_offset = total_header_size;
        for entry in &mut export_entries {
            entry.serial_offset = serial_offset as u32;
            serial_offset += entry.serial_size as usize;
        }

        let mut writer = ByteWriter::new(self.byte_swapped);
        for import in &self.imports {
            import.write(&mut writer);
        }
        for entry in &export_entries {
            entry.write(&mut writer);
        }
        for export in &self.exports {
            writer.write_bytes(&export.data);
        }

        (
            writer.into_inner(),
            import_offset as u32,
            export_offset as u32,
            total_header_size as u32,
        )
    }

    fn summary(
        &self,
        summary_size: usize,
        import_offset: u32,
        export_offset: u32,
        total_header_size: u32,
        compression: CompressionMethod,
        compressed_chunks: Vec<PackageChunk>,
    ) -> PackageSummary {
        PackageSummary {
            version: PACKAGE_FILE_VERSION,
            summary_size: summary_size as u32,
            total_header_size,
            guid: self.guid,
            compression,
            import_count: self.imports.len() as u32,
            import_offset,
            export_count: self.exports.len() as u32,
            export_offset,
            reservation_sizes: self.reservation_sizes.clone(),
            compressed_chunks,
            byte_swapped: self.byte_swapped,
        }
    }

    pub fn write_uncompressed(&self) -> Vec<u8> {
        let summary_size = PackageSummary::serialized_size(self.reservation_sizes.len(), 0);
        let (body, import_offset, export_offset, total_header_size) =
            self.build_body(summary_size);

        let summary = self.summary(
            summary_size,
            import_offset,
            export_offset,
            total_header_size,
            CompressionMethod::None,
            Vec::default(),
        );

        let mut writer = ByteWriter::new(self.byte_swapped);
        summary.write(&mut writer);
        debug_assert_eq!(writer.len(), summary_size);
        writer.write_bytes(&body);
        writer.into_inner()
    }

    /// Splits everything after the summary into package chunks of `block_size` logical bytes, each
    /// written as a compressed stream with `stream_chunk_size` sized data chunks.
    pub fn write_compressed<F: FnMut(&[u8]) -> Vec<u8>>(
        &self,
        compression: CompressionMethod,
        block_size: u32,
        stream_chunk_size: u32,
        mut compress: F,
    ) -> Vec<u8> {
        assert!(compression != CompressionMethod::None);
        assert!(block_size > 0);

        // The body length doesn't depend on the summary size, only the offsets inside it do
        let (sized_body, _, _, _) = self.build_body(0);
        let chunk_count = (sized_body.len() + block_size as usize - 1) / block_size as usize;

        let summary_size =
            PackageSummary::serialized_size(self.reservation_sizes.len(), chunk_count);
        let (body, import_offset, export_offset, total_header_size) =
            self.build_body(summary_size);

        let stream_writer =
            CompressedStreamWriter::new(stream_chunk_size).with_byte_swapped(self.byte_swapped);
        let mut streams = Vec::with_capacity(chunk_count);
        let mut compressed_chunks = Vec::with_capacity(chunk_count);
        let mut compressed_offset = summary_size;
        for (index, block) in body.chunks(block_size as usize).enumerate() {
            let stream = stream_writer.write(block, &mut compress);
            compressed_chunks.push(PackageChunk {
                uncompressed_offset: (summary_size + index * block_size as usize) as u32,
                uncompressed_size: block.len() as u32,
                compressed_offset: compressed_offset as u32,
                compressed_size: stream.len() as u32,
            });
            compressed_offset += stream.len();
            streams.push(stream);
        }

        let summary = self.summary(
            summary_size,
            import_offset,
            export_offset,
            total_header_size,
            compression,
            compressed_chunks,
        );

        let mut writer = ByteWriter::new(self.byte_swapped);
        summary.write(&mut writer);
        debug_assert_eq!(writer.len(), summary_size);
        for stream in &streams {
            writer.write_bytes(stream);
        }
        writer.into_inner()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn build_writer() -> PackageWriter {
        let mut writer = PackageWriter::new(PackageGuid(42));
        writer.add_import("Shared", "BaseMaterial", "Material");
        writer.add_export("Mesh", "StaticMesh", vec![1u8; 300]);
        writer.add_export_with_guid("Texture", "Texture2D", PackageGuid(7), vec![2u8; 50]);
        writer.add_reservation(4096);
        writer
    }

    #[test]
    fn uncompressed_tables_parse() {
        let bytes = build_writer().write_uncompressed();
        let summary_size = PackageSummary::peek_summary_size(&bytes[0..SUMMARY_FIXED_SIZE]).unwrap();
        let summary = PackageSummary::parse(&bytes[0..summary_size]).unwrap();
        assert_eq!(summary.guid, PackageGuid(42));
        assert_eq!(summary.reservation_sizes, vec![4096]);
        assert!(!summary.is_compressed());

        let imports = parse_import_table(
            &bytes[summary.import_offset as usize..],
            summary.import_count as usize,
            false,
        )
        .unwrap();
        assert_eq!(imports[0].object_name, "BaseMaterial");

        let exports = parse_export_table(
            &bytes[summary.export_offset as usize..],
            summary.export_count as usize,
            false,
        )
        .unwrap();
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].serial_offset, summary.total_header_size);
        assert_eq!(exports[1].export_guid, PackageGuid(7));
        let texture = &exports[1];
        let start = texture.serial_offset as usize;
        assert_eq!(&bytes[start..start + texture.serial_size as usize], &[2u8; 50][..]);
    }

    #[test]
    fn compressed_chunks_cover_body() {
        let bytes = build_writer().write_compressed(CompressionMethod::Zlib, 128, 64, |x| x.to_vec());
        let summary_size = PackageSummary::peek_summary_size(&bytes).unwrap();
        let summary = PackageSummary::parse(&bytes[0..summary_size]).unwrap();
        assert!(summary.is_compressed());
        assert_eq!(summary.compressed_chunks[0].uncompressed_offset as usize, summary_size);
        assert_eq!(summary.compressed_chunks[0].compressed_offset as usize, summary_size);

        let last = summary.compressed_chunks.last().unwrap();
        assert_eq!(last.compressed_offset as usize + last.compressed_size as usize, bytes.len());
        for pair in summary.compressed_chunks.windows(2) {
            assert_eq!(pair[0].uncompressed_end(), pair[1].uncompressed_offset as u64);
        }
    }

    #[test]
    fn byte_swapped_summary_parses() {
        let bytes = build_writer().with_byte_swapped(true).write_uncompressed();
        let summary_size = PackageSummary::peek_summary_size(&bytes).unwrap();
        let summary = PackageSummary::parse(&bytes[0..summary_size]).unwrap();
        assert!(summary.byte_swapped);
        assert_eq!(summary.export_count, 2);
    }

    #[test]
    fn table_offsets_must_lie_in_header() {
        let mut bytes = build_writer().write_uncompressed();
        let summary = PackageSummary::parse(&bytes).unwrap();

        // import_offset follows tag, version, sizes, guid, compression and import_count
        let bad_offset = summary.total_header_size + 100;
        bytes[40..44].copy_from_slice(&bad_offset.to_ne_bytes());
        assert!(matches!(
            PackageSummary::parse(&bytes),
            Err(FormatError::InvalidHeader(_))
        ));

        bytes[40..44].copy_from_slice(&4u32.to_ne_bytes());
        assert!(matches!(
            PackageSummary::parse(&bytes),
            Err(FormatError::InvalidHeader(_))
        ));
    }
}
