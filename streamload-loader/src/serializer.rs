use crate::linker::LinkerExport;
use crate::objects::ObjectTable;
use crate::precache_reader::PrecachingReader;
use crate::{LoaderError, LoaderResult};
use std::sync::Arc;
use streamload_base::ObjectHandle;

enum ExportSource<'a> {
    Archive(&'a mut PrecachingReader),
    Memory(&'a [u8]),
}

/// The bytes of a single export. Reads past the end of the export fail with `SeekPastEnd`.
pub struct ExportReader<'a> {
    source: ExportSource<'a>,
    size: u64,
    position: u64,
}

impl<'a> ExportReader<'a> {
    /// The `size` bytes at `offset` of the package, read through its precaching reader
    pub fn from_archive(
        reader: &'a mut PrecachingReader,
        offset: u64,
        size: u64,
    ) -> LoaderResult<Self> {
        reader.seek(offset as i64)?;
        Ok(ExportReader {
            source: ExportSource::Archive(reader),
            size,
            position: 0,
        })
    }

    pub fn from_memory(data: &'a [u8]) -> Self {
        ExportReader {
            source: ExportSource::Memory(data),
            size: data.len() as u64,
            position: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.position
    }

    pub fn read_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> LoaderResult<()> {
        let count = dest.len() as u64;
        if count > self.remaining() {
            return Err(LoaderError::SeekPastEnd {
                position: self.position,
                count,
                size: self.size,
            });
        }

        match &mut self.source {
            ExportSource::Archive(reader) => reader.read(dest)?,
            ExportSource::Memory(data) => {
                let start = self.position as usize;
                dest.copy_from_slice(&data[start..start + dest.len()]);
            }
        }
        self.position += count;
        Ok(())
    }

    pub fn read_vec(
        &mut self,
        count: usize,
    ) -> LoaderResult<Vec<u8>> {
        let mut bytes = vec![0u8; count];
        self.read_bytes(&mut bytes)?;
        Ok(bytes)
    }

    pub fn read_to_end(&mut self) -> LoaderResult<Vec<u8>> {
        self.read_vec(self.remaining() as usize)
    }

    pub fn read_u32(&mut self) -> LoaderResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_bytes(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> LoaderResult<u64> {
        let mut bytes = [0u8; 8];
        self.read_bytes(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// u32 length followed by UTF-8
    pub fn read_string(&mut self) -> LoaderResult<String> {
        let len = self.read_u32()?;
        let bytes = self.read_vec(len as usize)?;
        String::from_utf8(bytes).map_err(|e| LoaderError::StringError(e.to_string()))
    }
}

// Work a serializer asked for that the job picks up after the current call returns
#[derive(Default)]
pub(crate) struct DeferredWork {
    pub(crate) nested_loads: Vec<String>,
    pub(crate) queued_objects: Vec<ObjectHandle>,
}

/// What a serializer can do while an object of some package is being loaded
pub struct LoadContext<'a> {
    package_name: &'a str,
    root: ObjectHandle,
    objects: &'a mut ObjectTable,
    exports: &'a [LinkerExport],
    imports: &'a [ObjectHandle],
    work: &'a mut DeferredWork,
}

impl<'a> LoadContext<'a> {
    pub(crate) fn new(
        package_name: &'a str,
        root: ObjectHandle,
        objects: &'a mut ObjectTable,
        exports: &'a [LinkerExport],
        imports: &'a [ObjectHandle],
        work: &'a mut DeferredWork,
    ) -> Self {
        LoadContext {
            package_name,
            root,
            objects,
            exports,
            imports,
            work,
        }
    }

    pub fn package_name(&self) -> &str {
        self.package_name
    }

    /// The package's root object, outer of every export
    pub fn root(&self) -> ObjectHandle {
        self.root
    }

    pub fn objects(&self) -> &ObjectTable {
        self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectTable {
        self.objects
    }

    /// The object an import resolved to
    pub fn import(
        &self,
        index: usize,
    ) -> Option<ObjectHandle> {
        self.imports.get(index).copied()
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    /// Starts loading another package once the current step returns. The caller doesn't wait for
    /// it.
    pub fn request_load(
        &mut self,
        package_name: &str,
    ) {
        self.work.nested_loads.push(package_name.to_string());
    }

    /// Handle of another export of this package. If it hasn't been created yet it is created now
    /// and deserialized when the export table reaches it.
    pub fn load_export(
        &mut self,
        index: usize,
    ) -> LoaderResult<ObjectHandle> {
        let export = self.exports.get(index).ok_or_else(|| LoaderError::OutOfRange {
            position: index as i64,
            size: self.exports.len() as u64,
        })?;

        let (handle, created) = self.objects.find_or_create(
            self.package_name,
            &export.entry.object_name,
            &export.entry.class_name,
            self.root,
        );
        if created {
            if let Some(record) = self.objects.get_mut(handle) {
                record.export_index = Some(index);
                record.needs_load = true;
                record.async_loading = true;
            }
        }
        Ok(handle)
    }

    /// Creates an object inside `outer` whose bytes come from memory, and queues it to be
    /// deserialized by this package's load
    pub fn create_subobject(
        &mut self,
        outer: ObjectHandle,
        name: &str,
        class_name: &str,
        data: Vec<u8>,
    ) -> ObjectHandle {
        let full_name = match self.objects.get(outer) {
            Some(record) if outer != self.root => format!("{}.{}", record.name, name),
            _ => name.to_string(),
        };

        let (handle, _) =
            self.objects
                .find_or_create(self.package_name, &full_name, class_name, outer);
        if let Some(record) = self.objects.get_mut(handle) {
            record.data = Some(Arc::from(data));
            record.needs_load = true;
            record.async_loading = true;
        }
        self.work.queued_objects.push(handle);
        handle
    }
}

// The single reflection capability the loader needs. How a class's bytes turn into an object is
// entirely up to the implementation.
pub trait ObjectSerializer: Send + Sync {
    fn deserialize(
        &self,
        object: ObjectHandle,
        reader: &mut ExportReader,
        context: &mut LoadContext,
    ) -> LoaderResult<()>;

    fn post_load(
        &self,
        _object: ObjectHandle,
        _context: &mut LoadContext,
    ) -> LoaderResult<()> {
        Ok(())
    }
}

/// Stores each export's bytes as a `Vec<u8>` payload
#[derive(Default)]
pub struct RawDataSerializer;

impl ObjectSerializer for RawDataSerializer {
    fn deserialize(
        &self,
        object: ObjectHandle,
        reader: &mut ExportReader,
        context: &mut LoadContext,
    ) -> LoaderResult<()> {
        let data = reader.read_to_end()?;
        context.objects_mut().set_payload(object, data);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_reader_is_bounded() {
        let mut data = Vec::new();
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"abc");
        data.extend_from_slice(&u64::MAX.to_le_bytes());

        let mut reader = ExportReader::from_memory(&data);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_string().unwrap(), "abc");
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.remaining(), 0);
        assert!(matches!(
            reader.read_u32(),
            Err(LoaderError::SeekPastEnd { position: 19, count: 4, size: 19 })
        ));
    }

    #[test]
    fn subobjects_are_queued_under_their_outer() {
        let mut objects = ObjectTable::new();
        let (root, _) = objects.find_or_create("Pkg", "Pkg", "Package", ObjectHandle::null());
        let (mesh, _) = objects.find_or_create("Pkg", "Mesh", "StaticMesh", root);
        let mut work = DeferredWork::default();
        let mut context = LoadContext::new("Pkg", root, &mut objects, &[], &[], &mut work);

        let lod = context.create_subobject(mesh, "Lod0", "MeshLod", vec![1, 2]);
        let top = context.create_subobject(root, "Settings", "Settings", vec![]);
        context.request_load("Shared");
        assert!(context.load_export(0).is_err());

        assert_eq!(objects.get(lod).unwrap().name, "Mesh.Lod0");
        assert_eq!(objects.get(lod).unwrap().outer, mesh);
        assert_eq!(objects.get(top).unwrap().name, "Settings");
        assert_eq!(work.queued_objects, vec![lod, top]);
        assert_eq!(work.nested_loads, vec!["Shared".to_string()]);
    }
}
