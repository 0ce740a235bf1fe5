use crate::async_io::AsyncIoService;
use crate::clock::{Clock, SystemClock};
use crate::config::StreamingConfig;
use crate::manifest::{normalize_package_name, PackageResolver};
use crate::objects::ObjectTable;
use crate::overlay::PatchOverlay;
use crate::package_job::{
    LoadCallback, LoadPhase, LoadedPackage, PackageLoadJob, PackageLoadResult,
};
use crate::reservations::{ImmediateReservations, ReservationService};
use crate::serializer::ObjectSerializer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamload_base::PackageGuid;

/// Everything a package load depends on
pub struct LoaderServices {
    pub io: Arc<AsyncIoService>,
    pub resolver: Arc<dyn PackageResolver>,
    pub serializer: Arc<dyn ObjectSerializer>,
    pub clock: Arc<dyn Clock>,
    pub overlay: Option<Arc<dyn PatchOverlay>>,
    pub reservations: Arc<dyn ReservationService>,
    pub config: StreamingConfig,
}

impl LoaderServices {
    pub fn new(
        io: Arc<AsyncIoService>,
        resolver: Arc<dyn PackageResolver>,
        serializer: Arc<dyn ObjectSerializer>,
    ) -> Self {
        LoaderServices {
            io,
            resolver,
            serializer,
            clock: Arc::new(SystemClock::default()),
            overlay: None,
            reservations: Arc::new(ImmediateReservations),
            config: StreamingConfig::default(),
        }
    }

    pub fn with_clock(
        mut self,
        clock: Arc<dyn Clock>,
    ) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_overlay(
        mut self,
        overlay: Arc<dyn PatchOverlay>,
    ) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_reservations(
        mut self,
        reservations: Arc<dyn ReservationService>,
    ) -> Self {
        self.reservations = reservations;
        self
    }

    pub fn with_config(
        mut self,
        config: StreamingConfig,
    ) -> Self {
        self.config = config;
        self
    }
}

pub struct LoadRequest {
    pub package_name: String,
    pub guid: Option<PackageGuid>,
    /// Jobs can be skipped by tick and flush_all by tag
    pub tag: Option<String>,
    pub callback: Option<LoadCallback>,
}

impl LoadRequest {
    pub fn new(package_name: &str) -> Self {
        LoadRequest {
            package_name: package_name.to_string(),
            guid: None,
            tag: None,
            callback: None,
        }
    }

    pub fn with_guid(
        mut self,
        guid: PackageGuid,
    ) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn with_tag(
        mut self,
        tag: &str,
    ) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn with_callback<F: FnOnce(&PackageLoadResult) + Send + 'static>(
        mut self,
        callback: F,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

type Completion = (Vec<LoadCallback>, PackageLoadResult);

struct CoordinatorInner {
    jobs: Vec<PackageLoadJob>,
    objects: ObjectTable,
}

impl CoordinatorInner {
    fn find_job(
        &self,
        package_name: &str,
    ) -> Option<&PackageLoadJob> {
        self.jobs.iter().find(|x| x.package_name() == package_name)
    }

    // Returns the callback to fire right away if the package is already loaded
    fn enqueue(
        &mut self,
        request: LoadRequest,
    ) -> Option<Completion> {
        let package_name = normalize_package_name(&request.package_name);

        if let Some(job) = self
            .jobs
            .iter_mut()
            .find(|x| x.package_name() == package_name)
        {
            log::trace!("{} is already loading, attaching to the existing job", package_name);
            if let Some(callback) = request.callback {
                job.add_callback(callback);
            }
            return None;
        }

        if let Some(loaded) = self.objects.loaded_package(&package_name) {
            log::trace!("{} is already loaded", package_name);
            let loaded = loaded.clone();
            return request
                .callback
                .map(|callback| (vec![callback], Ok(loaded)));
        }

        log::debug!("Queueing load of package {}", package_name);
        let mut job = PackageLoadJob::new(&package_name, request.guid, request.tag);
        if let Some(callback) = request.callback {
            job.add_callback(callback);
        }
        self.jobs.push(job);
        None
    }
}

fn fire_callbacks(completed: Vec<Completion>) {
    for (callbacks, result) in completed {
        for callback in callbacks {
            callback(&result);
        }
    }
}

/// Owns every in-flight package load and ticks them in request order under a time budget. Cheap
/// to clone, clones share the same jobs.
///
/// Callbacks run after the internal lock is released, so they may request more loads. Serializers
/// run with the lock held and must use `LoadContext::request_load` instead.
#[derive(Clone)]
pub struct LoadCoordinator {
    services: Arc<LoaderServices>,
    inner: Arc<Mutex<CoordinatorInner>>,
}

impl LoadCoordinator {
    pub fn new(services: LoaderServices) -> Self {
        LoadCoordinator {
            services: Arc::new(services),
            inner: Arc::new(Mutex::new(CoordinatorInner {
                jobs: Vec::default(),
                objects: ObjectTable::default(),
            })),
        }
    }

    pub fn services(&self) -> &LoaderServices {
        &self.services
    }

    pub fn request_load(
        &self,
        package_name: &str,
    ) {
        self.request_load_with(LoadRequest::new(package_name));
    }

    /// Starts loading the package unless a load for the same name is already running, in which
    /// case the callback is attached to that load. If the package was loaded already the callback
    /// runs before this returns.
    pub fn request_load_with(
        &self,
        request: LoadRequest,
    ) {
        let completion = self.inner.lock().unwrap().enqueue(request);
        if let Some(completion) = completion {
            fire_callbacks(vec![completion]);
        }
    }

    /// Percentage of the package's exports created so far. None if the package is neither loading
    /// nor loaded.
    pub fn query_progress(
        &self,
        package_name: &str,
    ) -> Option<f32> {
        let package_name = normalize_package_name(package_name);
        let inner = self.inner.lock().unwrap();
        match inner.find_job(&package_name) {
            Some(job) => Some(job.load_percentage()),
            None => inner
                .objects
                .loaded_package(&package_name)
                .map(|x| x.load_percentage),
        }
    }

    pub fn query_phase(
        &self,
        package_name: &str,
    ) -> Option<LoadPhase> {
        let package_name = normalize_package_name(package_name);
        let inner = self.inner.lock().unwrap();
        match inner.find_job(&package_name) {
            Some(job) => Some(job.phase()),
            None if inner.objects.is_package_loaded(&package_name) => Some(LoadPhase::Finished),
            None => None,
        }
    }

    pub fn loaded_package(
        &self,
        package_name: &str,
    ) -> Option<LoadedPackage> {
        let package_name = normalize_package_name(package_name);
        self.inner
            .lock()
            .unwrap()
            .objects
            .loaded_package(&package_name)
            .cloned()
    }

    pub fn is_loading(&self) -> bool {
        !self.inner.lock().unwrap().jobs.is_empty()
    }

    pub fn active_load_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    fn has_jobs_to_flush(
        &self,
        exclude_tag: Option<&str>,
    ) -> bool {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .any(|x| !x.is_excluded(exclude_tag))
    }

    pub fn with_objects<R, F: FnOnce(&ObjectTable) -> R>(
        &self,
        f: F,
    ) -> R {
        f(&self.inner.lock().unwrap().objects)
    }

    /// Advances jobs in the order they were requested, skipping any tagged `exclude_tag`. Stops at
    /// the first job that doesn't finish, so packages complete in request order. Returns the number
    /// of jobs still loading.
    pub fn tick(
        &self,
        use_time_limit: bool,
        time_limit: Duration,
        exclude_tag: Option<&str>,
    ) -> usize {
        profiling::scope!("LoadCoordinator::tick");
        let clock = self.services.clock.clone();
        let start = clock.now();
        let mut completed = Vec::default();

        let remaining_jobs = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let mut index = 0;
            while index < inner.jobs.len() {
                if inner.jobs[index].is_excluded(exclude_tag) {
                    index += 1;
                    continue;
                }

                let remaining_time = time_limit.saturating_sub(clock.now().saturating_sub(start));
                let finished = inner.jobs[index].tick(
                    &self.services,
                    &mut inner.objects,
                    use_time_limit,
                    remaining_time,
                );

                for package_name in inner.jobs[index].take_nested_loads() {
                    completed.extend(inner.enqueue(LoadRequest::new(&package_name)));
                }

                if !finished {
                    break;
                }

                // The next job moved into this index
                let job = inner.jobs.remove(index);
                completed.push(job.into_completion());

                if use_time_limit && clock.now().saturating_sub(start) > time_limit {
                    break;
                }
            }
            inner.jobs.len()
        };

        fire_callbacks(completed);
        remaining_jobs
    }

    /// Ticks without a time limit until every job not tagged `exclude_tag` finished. IO below the
    /// configured flush priority is held back meanwhile, though never the reader's own precache
    /// priority.
    pub fn flush_all(
        &self,
        exclude_tag: Option<&str>,
    ) {
        profiling::scope!("LoadCoordinator::flush_all");
        let io = &self.services.io;
        let config = &self.services.config;
        // Never hold back the reads the flushed jobs themselves issue
        let floor = config
            .loading
            .flush_min_priority
            .min(config.reader.precache_priority);
        let previous_priority = io.min_priority();
        io.set_min_priority(floor);

        while self.has_jobs_to_flush(exclude_tag) {
            self.tick(false, Duration::ZERO, exclude_tag);
        }

        io.set_min_priority(previous_priority);
    }
}
