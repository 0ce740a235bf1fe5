use crate::clock::Clock;
use crate::coordinator::LoaderServices;
use crate::linker::PackageLinker;
use crate::manifest::normalize_package_name;
use crate::objects::ObjectTable;
use crate::reservations::PendingReservations;
use crate::serializer::{DeferredWork, ExportReader, LoadContext};
use crate::{LoaderError, LoaderResult};
use std::sync::Arc;
use std::time::Duration;
use streamload_base::{ObjectHandle, PackageGuid};

/// Class name given to the root object every package load creates
pub const PACKAGE_CLASS_NAME: &str = "Package";

/// How far a package load has progressed. Loads only ever move forward through these.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPhase {
    Created,
    HeaderParsed,
    ImportsResolved,
    TextureAllocationsSettled,
    ExportsMaterializedAndPreloaded,
    CrossPackageReferencesResolved,
    PostProcessed,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStats {
    pub ticks: u32,
    /// Number of times the job yielded because data it needed wasn't precached yet
    pub precache_waits: u32,
    pub precache_wait_time: Duration,
    waiting_since: Option<Duration>,
}

impl JobStats {
    fn begin_wait(
        &mut self,
        now: Duration,
    ) {
        self.precache_waits += 1;
        self.waiting_since.get_or_insert(now);
    }

    fn end_wait(
        &mut self,
        now: Duration,
    ) {
        if let Some(since) = self.waiting_since.take() {
            self.precache_wait_time += now.saturating_sub(since);
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedPackage {
    pub name: String,
    pub root: ObjectHandle,
    pub load_percentage: f32,
    pub load_time: Duration,
    pub export_count: usize,
    pub stats: JobStats,
}

pub type PackageLoadResult = Result<LoadedPackage, LoaderError>;
pub type LoadCallback = Box<dyn FnOnce(&PackageLoadResult) + Send>;

// Tracks the time limit of a single tick. Once exceeded it stays exceeded for the rest of the
// tick. A unit of work only starts if one more unit as long as the previous one still fits.
struct TickBudget<'a> {
    clock: &'a dyn Clock,
    package_name: String,
    use_time_limit: bool,
    time_limit: Duration,
    slow_operation_threshold: Duration,
    start: Duration,
    last_check: Duration,
    // The time since the last check belongs to another step and says nothing about the next unit
    new_step: bool,
    exceeded: bool,
    gave_up: bool,
    last_work: &'static str,
    last_object: String,
}

impl<'a> TickBudget<'a> {
    fn new(
        clock: &'a dyn Clock,
        package_name: &str,
        use_time_limit: bool,
        time_limit: Duration,
        slow_operation_multiplier: f32,
    ) -> Self {
        let now = clock.now();
        TickBudget {
            clock,
            package_name: package_name.to_string(),
            use_time_limit,
            time_limit,
            slow_operation_threshold: time_limit.mul_f32(slow_operation_multiplier.max(0.0)),
            start: now,
            last_check: now,
            new_step: true,
            exceeded: false,
            gave_up: false,
            last_work: "None",
            last_object: String::default(),
        }
    }

    fn set_last_work(
        &mut self,
        work: &'static str,
        object: &str,
    ) {
        self.last_work = work;
        self.last_object.clear();
        self.last_object.push_str(object);
    }

    fn begin_step(&mut self) {
        self.new_step = true;
    }

    fn is_time_limit_exceeded(&mut self) -> bool {
        if !self.exceeded && self.use_time_limit {
            let now = self.clock.now();
            let since_last_check = now.saturating_sub(self.last_check);
            if !self.slow_operation_threshold.is_zero()
                && since_last_check > self.slow_operation_threshold
            {
                log::warn!(
                    "Loading {}: a single operation took {:.2} ms with a limit of {:.2} ms. Last work: {}, last object: {}",
                    self.package_name,
                    since_last_check.as_secs_f64() * 1000.0,
                    self.time_limit.as_secs_f64() * 1000.0,
                    self.last_work,
                    self.last_object
                );
            }
            let predicted = if self.new_step {
                Duration::ZERO
            } else {
                since_last_check
            };
            self.new_step = false;
            self.last_check = now;
            self.exceeded = now.saturating_sub(self.start) + predicted > self.time_limit;
        }
        self.exceeded
    }

    // Waiting on something outside the job. With a time limit the rest of the tick is given up.
    fn give_up_time_slice(&mut self) {
        self.gave_up = true;
        if self.use_time_limit {
            self.exceeded = true;
        }
    }

    fn take_gave_up(&mut self) -> bool {
        std::mem::take(&mut self.gave_up)
    }
}

/// A single package's resumable load. Each step keeps its own cursor so a step cut short by the
/// time limit continues where it left off on the next tick.
pub struct PackageLoadJob {
    package_name: String,
    requested_guid: Option<PackageGuid>,
    tag: Option<String>,
    callbacks: Vec<LoadCallback>,
    phase: LoadPhase,
    linker: Option<PackageLinker>,
    root: ObjectHandle,
    import_map: Vec<ObjectHandle>,
    export_index: usize,
    // Index into work.queued_objects of the next in-memory object to deserialize
    load_cursor: usize,
    post_load_queue: Vec<ObjectHandle>,
    post_load_cursor: usize,
    created_objects: Vec<ObjectHandle>,
    work: DeferredWork,
    reservations: Option<Box<dyn PendingReservations>>,
    load_percentage: f32,
    start_time: Option<Duration>,
    stats: JobStats,
    result: Option<PackageLoadResult>,
}

impl PackageLoadJob {
    pub fn new(
        package_name: &str,
        requested_guid: Option<PackageGuid>,
        tag: Option<String>,
    ) -> Self {
        PackageLoadJob {
            package_name: normalize_package_name(package_name),
            requested_guid,
            tag,
            callbacks: Vec::default(),
            phase: LoadPhase::Created,
            linker: None,
            root: ObjectHandle::null(),
            import_map: Vec::default(),
            export_index: 0,
            load_cursor: 0,
            post_load_queue: Vec::default(),
            post_load_cursor: 0,
            created_objects: Vec::default(),
            work: DeferredWork::default(),
            reservations: None,
            load_percentage: 0.0,
            start_time: None,
            stats: JobStats::default(),
            result: None,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Percentage of exports created so far
    pub fn load_percentage(&self) -> f32 {
        self.load_percentage
    }

    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn add_callback(
        &mut self,
        callback: LoadCallback,
    ) {
        self.callbacks.push(callback);
    }

    pub fn is_excluded(
        &self,
        exclude_tag: Option<&str>,
    ) -> bool {
        exclude_tag.is_some() && self.tag() == exclude_tag
    }

    pub(crate) fn take_nested_loads(&mut self) -> Vec<String> {
        std::mem::take(&mut self.work.nested_loads)
    }

    pub(crate) fn into_completion(self) -> (Vec<LoadCallback>, PackageLoadResult) {
        let result = self
            .result
            .unwrap_or_else(|| Err(LoaderError::from("load job completed without a result")));
        (self.callbacks, result)
    }

    /// Advances the load. Returns true once the job finished, successfully or not.
    ///
    /// Without a time limit this only returns once the job is finished, backing off while it
    /// waits on IO.
    pub(crate) fn tick(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        use_time_limit: bool,
        time_limit: Duration,
    ) -> bool {
        profiling::scope!("PackageLoadJob::tick");
        if self.result.is_some() {
            return true;
        }

        self.start_time.get_or_insert_with(|| services.clock.now());
        self.stats.ticks += 1;

        let mut budget = TickBudget::new(
            services.clock.as_ref(),
            &self.package_name,
            use_time_limit,
            time_limit,
            services.config.loading.slow_operation_multiplier,
        );
        let poller = services.io.poller().clone();
        let mut attempt = 0;
        loop {
            match self.advance(services, objects, &mut budget) {
                Ok(true) => {
                    self.finish(services, objects, Ok(()));
                    return true;
                }
                Err(e) => {
                    self.finish(services, objects, Err(e));
                    return true;
                }
                Ok(false) => {}
            }

            if use_time_limit {
                return false;
            }

            if budget.take_gave_up() {
                poller.back_off(attempt);
                attempt += 1;
            } else {
                attempt = 0;
            }
        }
    }

    fn advance(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        if self.phase < LoadPhase::HeaderParsed {
            if !self.create_linker(services, objects, budget)? {
                return Ok(false);
            }
            self.phase = LoadPhase::HeaderParsed;
        }

        if self.phase < LoadPhase::ImportsResolved {
            if !self.resolve_imports(objects, budget)? {
                return Ok(false);
            }
            self.phase = LoadPhase::ImportsResolved;
        }

        if self.phase < LoadPhase::TextureAllocationsSettled {
            if !self.settle_reservations(services, budget)? {
                return Ok(false);
            }
            self.phase = LoadPhase::TextureAllocationsSettled;
        }

        if self.phase < LoadPhase::ExportsMaterializedAndPreloaded {
            if !self.create_exports(services, objects, budget)? {
                return Ok(false);
            }
            self.phase = LoadPhase::ExportsMaterializedAndPreloaded;
        }

        if self.phase < LoadPhase::CrossPackageReferencesResolved {
            if !self.resolve_cross_package_references(services, objects, budget)? {
                return Ok(false);
            }
            self.phase = LoadPhase::CrossPackageReferencesResolved;
        }

        if self.phase < LoadPhase::PostProcessed {
            if !self.post_process(services, objects, budget)? {
                return Ok(false);
            }
            self.phase = LoadPhase::PostProcessed;
        }

        Ok(true)
    }

    fn create_linker(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        if self.linker.is_none() {
            budget.set_last_work("CreateLinker", &self.package_name);
            let resolved = services
                .resolver
                .resolve(&self.package_name, self.requested_guid)?;

            let (root, _) = objects.find_or_create(
                &self.package_name,
                &self.package_name,
                PACKAGE_CLASS_NAME,
                ObjectHandle::null(),
            );
            if let Some(record) = objects.get_mut(root) {
                record.placeholder = false;
                record.async_loading = true;
            }
            self.root = root;
            self.created_objects.push(root);

            log::debug!(
                "Creating linker for {} from {}",
                self.package_name,
                resolved.file_name
            );
            self.linker = Some(PackageLinker::new(
                services.io.clone(),
                &self.package_name,
                &resolved.file_name,
                resolved.guid,
                &services.config.reader,
            ));
        }

        let linker = self
            .linker
            .as_mut()
            .ok_or_else(|| LoaderError::from("linker missing after creation"))?;
        budget.set_last_work("ParseHeader", &self.package_name);
        if linker.tick_header(services.overlay.as_deref())? {
            self.stats.end_wait(services.clock.now());
            Ok(true)
        } else {
            self.stats.begin_wait(services.clock.now());
            budget.give_up_time_slice();
            Ok(false)
        }
    }

    fn resolve_imports(
        &mut self,
        objects: &mut ObjectTable,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        let linker = self
            .linker
            .as_ref()
            .ok_or_else(|| LoaderError::from("imports resolved before the linker was created"))?;

        budget.begin_step();
        while self.import_map.len() < linker.imports.len() {
            if budget.is_time_limit_exceeded() {
                return Ok(false);
            }

            let import = &linker.imports[self.import_map.len()];
            budget.set_last_work("CreateImport", &import.object_name);
            let handle = objects.find_or_create_placeholder(
                &normalize_package_name(&import.package_name),
                &import.object_name,
                &import.class_name,
            );
            self.import_map.push(handle);
        }

        Ok(true)
    }

    fn settle_reservations(
        &mut self,
        services: &LoaderServices,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        if self.reservations.is_none() {
            let sizes = self
                .linker
                .as_ref()
                .and_then(|x| x.summary())
                .map(|x| x.reservation_sizes.clone())
                .unwrap_or_default();
            self.reservations = Some(services.reservations.reserve(&self.package_name, &sizes));
        }

        let reservations = self
            .reservations
            .as_mut()
            .ok_or_else(|| LoaderError::from("reservations missing after creation"))?;
        if reservations.has_completed() {
            return Ok(true);
        }

        if budget.use_time_limit {
            budget.set_last_work("WaitForReservations", &self.package_name);
            budget.give_up_time_slice();
            return Ok(false);
        }

        // Flushing, nothing may wait on the platform
        let canceled = reservations.cancel_remaining(false);
        log::debug!(
            "{}: canceled {} pending reservations while flushing",
            self.package_name,
            canceled
        );
        Ok(true)
    }

    fn create_exports(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        let linker = self
            .linker
            .as_mut()
            .ok_or_else(|| LoaderError::from("exports created before the linker was created"))?;
        let export_count = linker.exports.len();

        budget.begin_step();
        while self.export_index < export_count {
            if budget.is_time_limit_exceeded() {
                return Ok(false);
            }

            let index = self.export_index;
            let export = &linker.exports[index];
            let object_name = export.entry.object_name.clone();
            let class_name = export.entry.class_name.clone();
            let export_guid = export.entry.export_guid;
            let patch_data = export.patch_data.clone();
            let offset = export.entry.serial_offset as u64;
            let size = export.entry.serial_size as u64;
            budget.set_last_work("CreateExport", &object_name);

            // Patched exports are already in memory
            if patch_data.is_none() && !linker.reader.precache(offset, size)? {
                self.stats.begin_wait(services.clock.now());
                budget.give_up_time_slice();
                return Ok(false);
            }
            self.stats.end_wait(services.clock.now());

            let (handle, _) =
                objects.find_or_create(&self.package_name, &object_name, &class_name, self.root);
            if let Some(record) = objects.get_mut(handle) {
                record.export_index = Some(index);
                record.export_guid = export_guid;
                record.placeholder = false;
                record.async_loading = true;
                record.needs_load = true;
            }
            self.created_objects.push(handle);

            budget.set_last_work("Deserialize", &object_name);
            let result = {
                let mut reader = match &patch_data {
                    Some(data) => ExportReader::from_memory(&data[..]),
                    None => ExportReader::from_archive(&mut linker.reader, offset, size)?,
                };
                let mut context = LoadContext::new(
                    &self.package_name,
                    self.root,
                    objects,
                    &linker.exports,
                    &self.import_map,
                    &mut self.work,
                );
                services
                    .serializer
                    .deserialize(handle, &mut reader, &mut context)
            };
            if let Err(e) = result {
                log::warn!(
                    "Failed to deserialize {} in {}: {}",
                    object_name,
                    self.package_name,
                    e
                );
            }

            if let Some(record) = objects.get_mut(handle) {
                record.needs_load = false;
                record.needs_post_load = true;
            }
            self.post_load_queue.push(handle);

            self.export_index += 1;
            self.load_percentage = 100.0 * self.export_index as f32 / export_count as f32;
        }

        self.load_percentage = 100.0;
        Ok(true)
    }

    // Deserializes objects queued by serializers through create_subobject
    fn serialize_queued_objects(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        let linker = self
            .linker
            .as_ref()
            .ok_or_else(|| LoaderError::from("objects serialized before the linker was created"))?;

        budget.begin_step();
        while self.load_cursor < self.work.queued_objects.len() {
            if budget.is_time_limit_exceeded() {
                return Ok(false);
            }

            let handle = self.work.queued_objects[self.load_cursor];
            self.load_cursor += 1;
            let (name, data) = match objects.get(handle) {
                Some(record) if record.needs_load => (
                    record.name.clone(),
                    record.data.clone().unwrap_or_else(|| Arc::from(Vec::new())),
                ),
                _ => continue,
            };
            budget.set_last_work("DeserializeQueued", &name);

            let result = {
                let mut reader = ExportReader::from_memory(&data[..]);
                let mut context = LoadContext::new(
                    &self.package_name,
                    self.root,
                    objects,
                    &linker.exports,
                    &self.import_map,
                    &mut self.work,
                );
                services
                    .serializer
                    .deserialize(handle, &mut reader, &mut context)
            };
            if let Err(e) = result {
                log::warn!("Failed to deserialize {} in {}: {}", name, self.package_name, e);
            }

            if let Some(record) = objects.get_mut(handle) {
                record.needs_load = false;
                record.needs_post_load = true;
            }
            self.created_objects.push(handle);
            self.post_load_queue.push(handle);
        }

        Ok(true)
    }

    fn resolve_cross_package_references(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        if !self.serialize_queued_objects(services, objects, budget)? {
            return Ok(false);
        }

        let linker = self
            .linker
            .as_ref()
            .ok_or_else(|| LoaderError::from("references resolved before the linker was created"))?;
        for export in &linker.exports {
            if export.entry.export_guid.is_null() {
                continue;
            }
            if let Some(handle) = objects.find(&self.package_name, &export.entry.object_name) {
                let canonical = objects.register_guid(export.entry.export_guid, handle);
                if canonical != handle {
                    log::debug!(
                        "{} in {} has the guid of an object that is already loaded",
                        export.entry.object_name,
                        self.package_name
                    );
                }
            }
        }

        Ok(self.load_cursor == self.work.queued_objects.len())
    }

    fn post_process(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        budget: &mut TickBudget,
    ) -> LoaderResult<bool> {
        loop {
            budget.begin_step();
            while self.post_load_cursor < self.post_load_queue.len() {
                if budget.is_time_limit_exceeded() {
                    return Ok(false);
                }

                let handle = self.post_load_queue[self.post_load_cursor];
                self.post_load_cursor += 1;
                let name = objects
                    .get(handle)
                    .map(|x| x.name.clone())
                    .unwrap_or_default();
                budget.set_last_work("PostLoad", &name);

                let linker = self.linker.as_ref().ok_or_else(|| {
                    LoaderError::from("objects post-loaded before the linker was created")
                })?;
                let result = {
                    let mut context = LoadContext::new(
                        &self.package_name,
                        self.root,
                        objects,
                        &linker.exports,
                        &self.import_map,
                        &mut self.work,
                    );
                    services.serializer.post_load(handle, &mut context)
                };
                if let Err(e) = result {
                    log::warn!("Post load of {} in {} failed: {}", name, self.package_name, e);
                }

                if let Some(record) = objects.get_mut(handle) {
                    record.needs_post_load = false;
                }
            }

            // Post loads can queue more objects, which need deserializing and post loading too
            if self.load_cursor == self.work.queued_objects.len() {
                return Ok(true);
            }
            if !self.serialize_queued_objects(services, objects, budget)? {
                return Ok(false);
            }
        }
    }

    fn finish(
        &mut self,
        services: &LoaderServices,
        objects: &mut ObjectTable,
        outcome: LoaderResult<()>,
    ) {
        profiling::scope!("PackageLoadJob::finish");
        let now = services.clock.now();
        let load_time = now.saturating_sub(self.start_time.unwrap_or(now));

        for handle in &self.created_objects {
            if let Some(record) = objects.get_mut(*handle) {
                record.async_loading = false;
                record.needs_load = false;
                record.needs_post_load = false;
            }
        }

        let linker = self.linker.take();
        let result = match outcome {
            Ok(()) => {
                let loaded = LoadedPackage {
                    name: self.package_name.clone(),
                    root: self.root,
                    load_percentage: self.load_percentage,
                    load_time,
                    export_count: linker.as_ref().map(|x| x.exports.len()).unwrap_or(0),
                    stats: self.stats.clone(),
                };
                objects.mark_package_loaded(loaded.clone());
                log::debug!(
                    "Loaded package {} in {:.2} ms",
                    self.package_name,
                    load_time.as_secs_f64() * 1000.0
                );
                Ok(loaded)
            }
            Err(e) => {
                log::warn!("Failed to load package {}: {}", self.package_name, e);
                Err(e)
            }
        };

        if let Some(reservations) = &mut self.reservations {
            let released = reservations.cancel_remaining(true);
            if released > 0 {
                log::trace!("{}: released {} unused reservations", self.package_name, released);
            }
        }

        if let Some(mut linker) = linker {
            if linker.was_patched() {
                if let Some(overlay) = &services.overlay {
                    overlay.release(&self.package_name);
                }
            }
            if !linker.reader.close() {
                log::debug!("{} closed with errors", linker.file_name());
            }
            services.io.hint_done_with_file(linker.file_name());
        }

        self.phase = LoadPhase::Finished;
        self.result = Some(result);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn budget_stops_before_a_unit_that_would_overrun() {
        let clock = ManualClock::new();
        let mut budget = TickBudget::new(&clock, "Level", true, Duration::from_millis(3), 0.0);

        let mut units = 0;
        budget.begin_step();
        while !budget.is_time_limit_exceeded() {
            clock.advance(Duration::from_millis(1));
            units += 1;
        }
        assert_eq!(units, 3);
        assert_eq!(clock.now(), Duration::from_millis(3));
    }

    #[test]
    fn new_step_does_not_inherit_previous_unit() {
        let clock = ManualClock::new();
        let mut budget = TickBudget::new(&clock, "Level", true, Duration::from_millis(3), 0.0);

        assert!(!budget.is_time_limit_exceeded());
        clock.advance(Duration::from_millis(2));
        budget.begin_step();
        // 2 ms used, the next step's first unit is still allowed to start
        assert!(!budget.is_time_limit_exceeded());
        clock.advance(Duration::from_millis(1));
        assert!(budget.is_time_limit_exceeded());
    }

    #[test]
    fn untimed_budget_never_expires() {
        let clock = ManualClock::new();
        let mut budget = TickBudget::new(&clock, "Level", false, Duration::ZERO, 2.5);
        clock.advance(Duration::from_secs(10));
        assert!(!budget.is_time_limit_exceeded());
        budget.give_up_time_slice();
        assert!(!budget.is_time_limit_exceeded());
        assert!(budget.take_gave_up());
        assert!(!budget.take_gave_up());
    }
}
