use crate::{LoaderError, LoaderResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use streamload_base::hashing::HashMap;
use streamload_base::PackageGuid;

// Remaps are followed at most this many times, so a cycle in the manifest can't hang a load
const MAX_REMAP_DEPTH: usize = 16;

/// Strips any directory and extension. Jobs are deduplicated on this name, so "Maps/Level.pkg"
/// and "Level" refer to the same package.
pub fn normalize_package_name(name: &str) -> String {
    let file_name = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);
    match file_name.rfind('.') {
        Some(index) if index > 0 => file_name[..index].to_string(),
        _ => file_name.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub file_name: String,
    /// The GUID the package's summary must carry, if one is known
    pub guid: Option<PackageGuid>,
}

// Maps package names to the files holding them. The mapping may be indirect, which is why the
// coordinator deduplicates on package names rather than file names.
pub trait PackageResolver: Send + Sync {
    fn resolve(
        &self,
        package_name: &str,
        guid: Option<PackageGuid>,
    ) -> LoaderResult<ResolvedPackage>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub file: String,
    #[serde(default)]
    pub guid: Option<PackageGuid>,
}

/// JSON list of the packages under a data root, plus aliases for renamed packages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub packages: Vec<ManifestEntry>,
    #[serde(default)]
    pub remaps: HashMap<String, String>,
}

impl PackageManifest {
    pub fn from_json_str(json: &str) -> LoaderResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load_from_file(path: &Path) -> LoaderResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> LoaderResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn add_package(
        &mut self,
        name: &str,
        file: &str,
        guid: Option<PackageGuid>,
    ) {
        self.packages.push(ManifestEntry {
            name: name.to_string(),
            file: file.to_string(),
            guid,
        });
    }

    pub fn add_remap(
        &mut self,
        alias: &str,
        name: &str,
    ) {
        self.remaps.insert(alias.to_string(), name.to_string());
    }

    fn find_entry(
        &self,
        package_name: &str,
    ) -> Option<&ManifestEntry> {
        self.packages
            .iter()
            .find(|x| normalize_package_name(&x.name) == package_name)
    }
}

impl PackageResolver for PackageManifest {
    fn resolve(
        &self,
        package_name: &str,
        guid: Option<PackageGuid>,
    ) -> LoaderResult<ResolvedPackage> {
        let mut name = normalize_package_name(package_name);
        for _ in 0..MAX_REMAP_DEPTH {
            match self.remaps.get(&name) {
                Some(target) => name = normalize_package_name(target),
                None => break,
            }
        }

        let entry = self
            .find_entry(&name)
            .ok_or_else(|| LoaderError::PackageNotFound(package_name.to_string()))?;

        if let (Some(requested), Some(listed)) = (guid, entry.guid) {
            if requested != listed {
                return Err(LoaderError::GuidMismatch {
                    package: package_name.to_string(),
                    expected: requested,
                    actual: listed,
                });
            }
        }

        Ok(ResolvedPackage {
            file_name: entry.file.clone(),
            guid: guid.or(entry.guid),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_are_reduced_to_base_name() {
        assert_eq!(normalize_package_name("Maps/Level01.pkg"), "Level01");
        assert_eq!(normalize_package_name("Content\\Chars.upk"), "Chars");
        assert_eq!(normalize_package_name("Plain"), "Plain");
        assert_eq!(normalize_package_name(".hidden"), ".hidden");
    }

    #[test]
    fn manifest_json_resolves_remaps() {
        let guid = PackageGuid::new_v4();
        let json = format!(
            r#"{{
                "packages": [
                    {{ "name": "Level01", "file": "maps/level01.pkg", "guid": "{}" }},
                    {{ "name": "Shared", "file": "shared.pkg" }}
                ],
                "remaps": {{ "OldLevel": "Level01" }}
            }}"#,
            guid
        );
        let manifest = PackageManifest::from_json_str(&json).unwrap();

        let resolved = manifest.resolve("OldLevel", None).unwrap();
        assert_eq!(resolved.file_name, "maps/level01.pkg");
        assert_eq!(resolved.guid, Some(guid));

        let shared = manifest.resolve("dir/Shared.pkg", None).unwrap();
        assert_eq!(shared.guid, None);

        assert!(matches!(
            manifest.resolve("Missing", None),
            Err(LoaderError::PackageNotFound(_))
        ));
    }

    #[test]
    fn requested_guid_must_match_listing() {
        let mut manifest = PackageManifest::default();
        manifest.add_package("A", "a.pkg", Some(PackageGuid::new_v4()));
        assert!(matches!(
            manifest.resolve("A", Some(PackageGuid::new_v4())),
            Err(LoaderError::GuidMismatch { .. })
        ));
    }

    #[test]
    fn remap_cycles_terminate() {
        let mut manifest = PackageManifest::default();
        manifest.add_remap("A", "B");
        manifest.add_remap("B", "A");
        assert!(manifest.resolve("A", None).is_err());
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let mut manifest = PackageManifest::default();
        manifest.add_package("A", "a.pkg", None);
        let json = manifest.to_json_string().unwrap();
        let parsed = PackageManifest::from_json_str(&json).unwrap();
        assert_eq!(parsed.packages, manifest.packages);
    }
}
