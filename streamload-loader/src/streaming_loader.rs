use crate::async_io::{AsyncIoService, IoServiceOptions};
use crate::config::StreamingConfig;
use crate::coordinator::{LoadCoordinator, LoadRequest, LoaderServices};
use crate::manifest::PackageManifest;
use crate::platform_io::DiskIoBackend;
use crate::serializer::ObjectSerializer;
use crate::LoaderResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const CONFIG_FILE_NAME: &str = "streaming.json";

/// Streams packages from a directory on disk. The directory holds `manifest.json` listing the
/// packages, and optionally `streaming.json` with a `StreamingConfig`.
pub struct StreamingLoader {
    root_path: PathBuf,
    io: Arc<AsyncIoService>,
    coordinator: LoadCoordinator,
}

impl StreamingLoader {
    pub fn new(
        root_path: PathBuf,
        serializer: Arc<dyn ObjectSerializer>,
    ) -> LoaderResult<Self> {
        let config_path = root_path.join(CONFIG_FILE_NAME);
        let config = if config_path.exists() {
            log::info!("Using streaming config {:?}", config_path);
            StreamingConfig::load_from_file(&config_path)?
        } else {
            StreamingConfig::default()
        };
        Self::with_config(root_path, serializer, config)
    }

    pub fn with_config(
        root_path: PathBuf,
        serializer: Arc<dyn ObjectSerializer>,
        config: StreamingConfig,
    ) -> LoaderResult<Self> {
        let manifest = PackageManifest::load_from_file(&root_path.join(MANIFEST_FILE_NAME))?;
        log::info!(
            "Streaming {} packages from {:?}",
            manifest.packages.len(),
            root_path
        );

        let backend = Arc::new(DiskIoBackend::new(root_path.clone()));
        let io = Arc::new(AsyncIoService::new(
            backend,
            IoServiceOptions::new(&config),
        )?);
        let services =
            LoaderServices::new(io.clone(), Arc::new(manifest), serializer).with_config(config);

        Ok(StreamingLoader {
            root_path,
            io,
            coordinator: LoadCoordinator::new(services),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn io(&self) -> &Arc<AsyncIoService> {
        &self.io
    }

    pub fn coordinator(&self) -> &LoadCoordinator {
        &self.coordinator
    }

    pub fn request_load(
        &self,
        package_name: &str,
    ) {
        self.coordinator.request_load(package_name);
    }

    pub fn request_load_with(
        &self,
        request: LoadRequest,
    ) {
        self.coordinator.request_load_with(request);
    }

    /// Spends at most roughly `budget` advancing loads. Returns the number still in flight.
    pub fn update(
        &self,
        budget: Duration,
    ) -> usize {
        self.coordinator.tick(true, budget, None)
    }

    /// Blocks until every requested package finished loading
    pub fn flush(&self) {
        self.coordinator.flush_all(None);
    }

    pub fn is_loading(&self) -> bool {
        self.coordinator.is_loading()
    }
}
