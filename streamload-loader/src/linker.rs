use crate::async_io::AsyncIoService;
use crate::config::ReaderConfig;
use crate::overlay::PatchOverlay;
use crate::precache_reader::PrecachingReader;
use crate::{LoaderError, LoaderResult};
use std::sync::Arc;
use streamload_base::package_file::{parse_export_table, parse_import_table};
use streamload_base::{ExportEntry, FormatError, ImportEntry, PackageGuid, PackageSummary};

// Enough of the summary to learn its full size
const SUMMARY_PEEK_SIZE: u64 = 12;

pub struct LinkerExport {
    pub entry: ExportEntry,
    /// Replacement bytes from a patch overlay. These exports skip the file precache check.
    pub patch_data: Option<Arc<[u8]>>,
}

// The part of the header bytes (read from `start`) where a table at `offset` begins
fn table_bytes(
    bytes: &[u8],
    start: u64,
    offset: u64,
) -> Result<&[u8], FormatError> {
    offset
        .checked_sub(start)
        .and_then(|x| bytes.get(x as usize..))
        .ok_or(FormatError::UnexpectedEnd {
            offset: offset as usize,
            needed: 0,
            available: bytes.len(),
        })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HeaderStage {
    PeekSummary,
    Summary { summary_size: u64 },
    Tables,
    Done,
}

/// Reads a package's summary and import/export tables through a precaching reader, one polled
/// stage at a time.
pub struct PackageLinker {
    package_name: String,
    file_name: String,
    expected_guid: Option<PackageGuid>,
    stage: HeaderStage,
    summary: Option<PackageSummary>,
    patched: bool,
    pub(crate) reader: PrecachingReader,
    pub(crate) imports: Vec<ImportEntry>,
    pub(crate) exports: Vec<LinkerExport>,
}

impl PackageLinker {
    pub fn new(
        io: Arc<AsyncIoService>,
        package_name: &str,
        file_name: &str,
        expected_guid: Option<PackageGuid>,
        config: &ReaderConfig,
    ) -> Self {
        PackageLinker {
            package_name: package_name.to_string(),
            file_name: file_name.to_string(),
            expected_guid,
            stage: HeaderStage::PeekSummary,
            summary: None,
            patched: false,
            reader: PrecachingReader::new(io, file_name, config),
            imports: Vec::default(),
            exports: Vec::default(),
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn summary(&self) -> Option<&PackageSummary> {
        self.summary.as_ref()
    }

    pub fn imports(&self) -> &[ImportEntry] {
        &self.imports
    }

    pub fn exports(&self) -> &[LinkerExport] {
        &self.exports
    }

    pub fn is_header_parsed(&self) -> bool {
        self.stage == HeaderStage::Done
    }

    pub fn was_patched(&self) -> bool {
        self.patched
    }

    pub fn reader_mut(&mut self) -> &mut PrecachingReader {
        &mut self.reader
    }

    fn read_range(
        &mut self,
        offset: u64,
        size: u64,
    ) -> LoaderResult<Vec<u8>> {
        let mut bytes = vec![0u8; size as usize];
        self.reader.seek(offset as i64)?;
        self.reader.read(&mut bytes)?;
        Ok(bytes)
    }

    /// Advances header parsing. Returns true once the summary and tables are parsed, false if it
    /// is waiting on IO.
    pub fn tick_header(
        &mut self,
        overlay: Option<&dyn PatchOverlay>,
    ) -> LoaderResult<bool> {
        profiling::scope!("PackageLinker::tick_header");
        loop {
            match self.stage {
                HeaderStage::PeekSummary => {
                    if self.reader.has_error() {
                        return Err(LoaderError::PackageNotFound(self.file_name.clone()));
                    }
                    if self.reader.total_size() < SUMMARY_PEEK_SIZE {
                        return Err(FormatError::UnexpectedEnd {
                            offset: 0,
                            needed: SUMMARY_PEEK_SIZE as usize,
                            available: self.reader.total_size() as usize,
                        }
                        .into());
                    }
                    if !self.reader.precache(0, SUMMARY_PEEK_SIZE)? {
                        return Ok(false);
                    }
                    let fixed = self.read_range(0, SUMMARY_PEEK_SIZE)?;
                    let summary_size = PackageSummary::peek_summary_size(&fixed)? as u64;
                    if summary_size > self.reader.total_size() {
                        return Err(FormatError::UnexpectedEnd {
                            offset: 0,
                            needed: summary_size as usize,
                            available: self.reader.total_size() as usize,
                        }
                        .into());
                    }
                    self.stage = HeaderStage::Summary { summary_size };
                }
                HeaderStage::Summary { summary_size } => {
                    if !self.reader.precache(0, summary_size)? {
                        return Ok(false);
                    }
                    let bytes = self.read_range(0, summary_size)?;
                    let summary = PackageSummary::parse(&bytes)?;

                    if let Some(expected) = self.expected_guid {
                        if !expected.is_null() && expected != summary.guid {
                            return Err(LoaderError::GuidMismatch {
                                package: self.package_name.clone(),
                                expected,
                                actual: summary.guid,
                            });
                        }
                    }

                    if summary.is_compressed() {
                        self.reader
                            .set_compression_map(summary.compressed_chunks.clone(), summary.compression);
                    }

                    log::trace!(
                        "{}: summary parsed, {} imports, {} exports, compressed: {}",
                        self.package_name,
                        summary.import_count,
                        summary.export_count,
                        summary.is_compressed()
                    );
                    self.summary = Some(summary);
                    self.stage = HeaderStage::Tables;
                }
                HeaderStage::Tables => {
                    let summary = self
                        .summary
                        .as_ref()
                        .ok_or_else(|| LoaderError::from("package tables read before summary"))?;
                    let start = summary.import_offset.min(summary.export_offset) as u64;
                    let end = summary.total_header_size as u64;
                    if end < start {
                        return Err(FormatError::InvalidHeader(format!(
                            "header ends at {} before its tables start at {}",
                            end, start
                        ))
                        .into());
                    }
                    let (import_offset, export_offset) =
                        (summary.import_offset as u64, summary.export_offset as u64);
                    let (import_count, export_count) =
                        (summary.import_count as usize, summary.export_count as usize);
                    let byte_swapped = summary.byte_swapped;

                    if !self.reader.precache(start, end - start)? {
                        return Ok(false);
                    }
                    let bytes = self.read_range(start, end - start)?;
                    self.imports = parse_import_table(
                        table_bytes(&bytes, start, import_offset)?,
                        import_count,
                        byte_swapped,
                    )?;
                    self.exports = parse_export_table(
                        table_bytes(&bytes, start, export_offset)?,
                        export_count,
                        byte_swapped,
                    )?
                    .into_iter()
                    .map(|entry| LinkerExport {
                        entry,
                        patch_data: None,
                    })
                    .collect();

                    if let Some(patch) = overlay.and_then(|x| x.patch_for(&self.package_name)) {
                        self.apply_patch(patch);
                    }
                    self.stage = HeaderStage::Done;
                }
                HeaderStage::Done => return Ok(true),
            }
        }
    }

    fn apply_patch(
        &mut self,
        patch: crate::overlay::PackagePatch,
    ) {
        log::debug!(
            "Applying patch to {}: {} imports, {} exports",
            self.package_name,
            patch.imports.len(),
            patch.exports.len()
        );
        self.imports.extend(patch.imports);
        for export in patch.exports {
            let existing = self
                .exports
                .iter_mut()
                .find(|x| x.entry.object_name == export.object_name);
            match existing {
                Some(existing) => {
                    existing.entry.class_name = export.class_name;
                    existing.entry.serial_size = export.data.len() as u32;
                    existing.patch_data = Some(export.data);
                }
                None => self.exports.push(LinkerExport {
                    entry: ExportEntry {
                        object_name: export.object_name,
                        class_name: export.class_name,
                        serial_offset: 0,
                        serial_size: export.data.len() as u32,
                        export_guid: export.export_guid,
                    },
                    patch_data: Some(export.data),
                }),
            }
        }
        self.patched = true;
    }
}
