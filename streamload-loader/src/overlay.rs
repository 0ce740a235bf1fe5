use std::sync::{Arc, Mutex};
use streamload_base::hashing::HashMap;
use streamload_base::{ImportEntry, PackageGuid};

/// An export supplied from memory instead of the package file
#[derive(Debug, Clone)]
pub struct PatchExport {
    pub object_name: String,
    pub class_name: String,
    pub export_guid: PackageGuid,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone, Default)]
pub struct PackagePatch {
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<PatchExport>,
}

impl PackagePatch {
    pub fn add_export(
        &mut self,
        object_name: &str,
        class_name: &str,
        data: Vec<u8>,
    ) {
        self.exports.push(PatchExport {
            object_name: object_name.to_string(),
            class_name: class_name.to_string(),
            export_guid: PackageGuid::null(),
            data: data.into(),
        });
    }
}

// Hot-patch data merged into a package's tables when its header is parsed. An export with the
// same name as one in the file replaces that export's bytes, any other export is appended.
pub trait PatchOverlay: Send + Sync {
    fn patch_for(
        &self,
        package_name: &str,
    ) -> Option<PackagePatch>;

    // Called once the package finished loading and the patch is no longer needed
    fn release(
        &self,
        _package_name: &str,
    ) {
    }
}

#[derive(Default)]
pub struct MemoryPatchOverlay {
    patches: Mutex<HashMap<String, PackagePatch>>,
    released: Mutex<Vec<String>>,
}

impl MemoryPatchOverlay {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_patch(
        &self,
        package_name: &str,
        patch: PackagePatch,
    ) {
        self.patches
            .lock()
            .unwrap()
            .insert(package_name.to_string(), patch);
    }

    pub fn released_packages(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

impl PatchOverlay for MemoryPatchOverlay {
    fn patch_for(
        &self,
        package_name: &str,
    ) -> Option<PackagePatch> {
        self.patches.lock().unwrap().get(package_name).cloned()
    }

    fn release(
        &self,
        package_name: &str,
    ) {
        if self.patches.lock().unwrap().remove(package_name).is_some() {
            self.released
                .lock()
                .unwrap()
                .push(package_name.to_string());
        }
    }
}
