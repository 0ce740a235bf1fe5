use crate::package_job::LoadedPackage;
use std::any::Any;
use std::sync::Arc;
use streamload_base::hashing::HashMap;
use streamload_base::{ObjectHandle, PackageGuid};

pub struct ObjectRecord {
    pub name: String,
    pub class_name: String,
    pub package: String,
    pub outer: ObjectHandle,
    pub export_index: Option<usize>,
    pub export_guid: PackageGuid,

    // Set while the owning package's load job is running
    pub async_loading: bool,
    pub needs_load: bool,
    pub needs_post_load: bool,
    // Created to stand in for an import whose package hasn't been loaded
    pub placeholder: bool,

    /// Bytes deserialized from memory instead of the package file
    pub data: Option<Arc<[u8]>>,
    /// Whatever the serializer constructed for this object
    pub payload: Option<Box<dyn Any + Send>>,
}

impl ObjectRecord {
    fn new(
        package: &str,
        name: &str,
        class_name: &str,
        outer: ObjectHandle,
    ) -> Self {
        ObjectRecord {
            name: name.to_string(),
            class_name: class_name.to_string(),
            package: package.to_string(),
            outer,
            export_index: None,
            export_guid: PackageGuid::null(),
            async_loading: false,
            needs_load: false,
            needs_post_load: false,
            placeholder: false,
            data: None,
            payload: None,
        }
    }
}

impl std::fmt::Debug for ObjectRecord {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ObjectRecord")
            .field("package", &self.package)
            .field("name", &self.name)
            .field("class_name", &self.class_name)
            .field("placeholder", &self.placeholder)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Every object created by package loads, addressable by handle, by (package, name) and by export
/// guid. Also remembers which packages finished loading.
#[derive(Default)]
pub struct ObjectTable {
    next_handle: u64,
    records: HashMap<ObjectHandle, ObjectRecord>,
    by_name: HashMap<(String, String), ObjectHandle>,
    by_guid: HashMap<PackageGuid, ObjectHandle>,
    loaded_packages: HashMap<String, LoadedPackage>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(
        &self,
        handle: ObjectHandle,
    ) -> Option<&ObjectRecord> {
        self.records.get(&handle)
    }

    pub fn get_mut(
        &mut self,
        handle: ObjectHandle,
    ) -> Option<&mut ObjectRecord> {
        self.records.get_mut(&handle)
    }

    pub fn find(
        &self,
        package: &str,
        name: &str,
    ) -> Option<ObjectHandle> {
        self.by_name
            .get(&(package.to_string(), name.to_string()))
            .copied()
    }

    pub fn find_by_guid(
        &self,
        guid: PackageGuid,
    ) -> Option<ObjectHandle> {
        self.by_guid.get(&guid).copied()
    }

    /// Returns the existing object with this name in the package, or creates it. The bool is true
    /// if the object was created.
    pub fn find_or_create(
        &mut self,
        package: &str,
        name: &str,
        class_name: &str,
        outer: ObjectHandle,
    ) -> (ObjectHandle, bool) {
        if let Some(handle) = self.find(package, name) {
            return (handle, false);
        }

        self.next_handle += 1;
        let handle = ObjectHandle(self.next_handle);
        self.records
            .insert(handle, ObjectRecord::new(package, name, class_name, outer));
        self.by_name
            .insert((package.to_string(), name.to_string()), handle);
        (handle, true)
    }

    /// Resolves an import, creating a placeholder if the object doesn't exist yet
    pub fn find_or_create_placeholder(
        &mut self,
        package: &str,
        name: &str,
        class_name: &str,
    ) -> ObjectHandle {
        let (handle, created) = self.find_or_create(package, name, class_name, ObjectHandle::null());
        if created {
            if let Some(record) = self.records.get_mut(&handle) {
                record.placeholder = true;
            }
        }
        handle
    }

    /// Makes the object findable by guid. If another object already claimed the guid, that object
    /// is kept and returned.
    pub fn register_guid(
        &mut self,
        guid: PackageGuid,
        handle: ObjectHandle,
    ) -> ObjectHandle {
        if guid.is_null() {
            return handle;
        }
        *self.by_guid.entry(guid).or_insert(handle)
    }

    pub fn set_payload<T: Any + Send>(
        &mut self,
        handle: ObjectHandle,
        payload: T,
    ) {
        if let Some(record) = self.records.get_mut(&handle) {
            record.payload = Some(Box::new(payload));
        }
    }

    pub fn payload<T: Any>(
        &self,
        handle: ObjectHandle,
    ) -> Option<&T> {
        self.records
            .get(&handle)?
            .payload
            .as_ref()?
            .downcast_ref::<T>()
    }

    pub fn objects_in_package(
        &self,
        package: &str,
    ) -> Vec<ObjectHandle> {
        let mut handles: Vec<_> = self
            .records
            .iter()
            .filter(|(_, record)| record.package == package)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    pub fn loaded_package(
        &self,
        package: &str,
    ) -> Option<&LoadedPackage> {
        self.loaded_packages.get(package)
    }

    pub fn is_package_loaded(
        &self,
        package: &str,
    ) -> bool {
        self.loaded_packages.contains_key(package)
    }

    pub(crate) fn mark_package_loaded(
        &mut self,
        loaded: LoadedPackage,
    ) {
        self.loaded_packages.insert(loaded.name.clone(), loaded);
    }
}
