use crate::decompress::compress_block;
use crate::reservations::ManualReservations;
use crate::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamload_base::{CompressionMethod, FormatError, PackageSummary, PackageWriter};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn export_data(
    seed: u8,
    len: usize,
) -> Vec<u8> {
    (0..len).map(|x| seed.wrapping_add((x % 253) as u8)).collect()
}

fn add_package(
    backend: &MemoryIoBackend,
    manifest: &mut PackageManifest,
    name: &str,
    file: Vec<u8>,
) {
    let file_name = format!("packages/{}.pkg", name.to_lowercase());
    backend.add_file(&file_name, file);
    manifest.add_package(name, &file_name, None);
}

fn create_services(
    backend: &Arc<MemoryIoBackend>,
    manifest: PackageManifest,
    serializer: Arc<dyn ObjectSerializer>,
) -> LoaderServices {
    let io = Arc::new(AsyncIoService::new(backend.clone(), IoServiceOptions::default()).unwrap());
    LoaderServices::new(io, Arc::new(manifest), serializer)
}

fn level_package() -> PackageWriter {
    let mut writer = PackageWriter::new(PackageGuid::new_v4());
    writer.add_import("Shared", "Grass", "Texture2D");
    writer.add_export("PersistentLevel", "World", export_data(1, 40));
    writer.add_export("Mesh", "StaticMesh", export_data(2, 64));
    writer.add_export("Material", "Material", export_data(3, 16));
    writer
}

fn shared_package() -> PackageWriter {
    let mut writer = PackageWriter::new(PackageGuid::new_v4());
    writer.add_export("Grass", "Texture2D", export_data(4, 128));
    writer
}

// Exercises every hook a serializer has: nested loads, other exports, subobjects from post load
#[derive(Default)]
struct GraphSerializer {
    post_loaded: Mutex<Vec<String>>,
}

impl ObjectSerializer for GraphSerializer {
    fn deserialize(
        &self,
        object: ObjectHandle,
        reader: &mut ExportReader,
        context: &mut LoadContext,
    ) -> LoaderResult<()> {
        let data = reader.read_to_end()?;
        let class_name = context
            .objects()
            .get(object)
            .map(|x| x.class_name.clone())
            .unwrap_or_default();
        match class_name.as_str() {
            "World" => {
                context.request_load("Shared");
                context.objects_mut().set_payload(object, data);
            }
            "StaticMesh" => {
                let material = context.load_export(2)?;
                context.objects_mut().set_payload(object, material);
            }
            _ => context.objects_mut().set_payload(object, data),
        }
        Ok(())
    }

    fn post_load(
        &self,
        object: ObjectHandle,
        context: &mut LoadContext,
    ) -> LoaderResult<()> {
        let (name, class_name) = context
            .objects()
            .get(object)
            .map(|x| (x.name.clone(), x.class_name.clone()))
            .unwrap_or_default();
        self.post_loaded.lock().unwrap().push(name);
        if class_name == "StaticMesh" {
            context.create_subobject(object, "Lod0", "MeshLod", vec![7, 8, 9]);
        }
        Ok(())
    }
}

// Every deserialize takes a fixed amount of simulated time
struct SteppingSerializer {
    clock: Arc<ManualClock>,
    step: Duration,
}

impl ObjectSerializer for SteppingSerializer {
    fn deserialize(
        &self,
        object: ObjectHandle,
        reader: &mut ExportReader,
        context: &mut LoadContext,
    ) -> LoaderResult<()> {
        let data = reader.read_to_end()?;
        context.objects_mut().set_payload(object, data);
        self.clock.advance(self.step);
        Ok(())
    }
}

#[test]
fn duplicate_requests_share_one_job() {
    init_logging();
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Shared", shared_package().write_uncompressed());
    let coordinator = LoadCoordinator::new(create_services(
        &backend,
        manifest,
        Arc::new(RawDataSerializer),
    ));

    let calls = Arc::new(Mutex::new(Vec::new()));
    for index in 0..3 {
        let calls = calls.clone();
        coordinator.request_load_with(LoadRequest::new("Shared").with_callback(
            move |result: &PackageLoadResult| {
                calls
                    .lock()
                    .unwrap()
                    .push((index, result.as_ref().map(|x| x.root).ok()));
            },
        ));
    }
    // Same package by another spelling
    coordinator.request_load("content/Shared.pkg");
    assert_eq!(coordinator.active_load_count(), 1);

    coordinator.flush_all(None);
    assert!(!coordinator.is_loading());

    let root = coordinator.loaded_package("Shared").unwrap().root;
    let mut calls = calls.lock().unwrap().clone();
    calls.sort();
    assert_eq!(calls, vec![(0, Some(root)), (1, Some(root)), (2, Some(root))]);
}

#[test]
fn loaded_package_completes_immediately() {
    init_logging();
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Shared", shared_package().write_uncompressed());
    let coordinator = LoadCoordinator::new(create_services(
        &backend,
        manifest,
        Arc::new(RawDataSerializer),
    ));

    coordinator.request_load("Shared");
    coordinator.flush_all(None);
    let loaded = coordinator.loaded_package("Shared").unwrap();
    assert_eq!(loaded.export_count, 1);
    assert_eq!(loaded.load_percentage, 100.0);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    let root = loaded.root;
    coordinator.request_load_with(LoadRequest::new("Shared").with_callback(move |result| {
        assert_eq!(result.as_ref().unwrap().root, root);
        fired_clone.fetch_add(1, Ordering::AcqRel);
    }));
    assert_eq!(fired.load(Ordering::Acquire), 1);
    assert!(!coordinator.is_loading());
    assert_eq!(coordinator.query_phase("Shared"), Some(LoadPhase::Finished));
    assert_eq!(coordinator.query_progress("Shared"), Some(100.0));
    assert_eq!(coordinator.query_progress("Unknown"), None);
}

// Loads a package of `export_count` exports that take `step` each, returning how many exports
// every tick advanced
fn exports_per_tick(
    export_count: usize,
    step: Duration,
    budget: Duration,
) -> Vec<usize> {
    let mut writer = PackageWriter::new(PackageGuid::new_v4());
    for index in 0..export_count {
        writer.add_export(&format!("Actor{}", index), "Actor", export_data(index as u8, 24));
    }
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Level", writer.write_uncompressed());

    let clock = Arc::new(ManualClock::new());
    let serializer = Arc::new(SteppingSerializer {
        clock: clock.clone(),
        step,
    });
    let services = create_services(&backend, manifest, serializer).with_clock(clock.clone());
    let io = services.io.clone();
    let coordinator = LoadCoordinator::new(services);
    coordinator.request_load("Level");

    // Header ticks only wait on IO
    for _ in 0..1000 {
        coordinator.tick(true, budget, None);
        if coordinator.query_progress("Level").unwrap() > 0.0 {
            break;
        }
        io.block_until_all_requests_finished();
    }

    let mut counts = Vec::default();
    let mut loaded = 0;
    loop {
        let progress = coordinator.query_progress("Level").unwrap();
        let now_loaded = (progress as f64 * export_count as f64 / 100.0).round() as usize;
        counts.push(now_loaded - loaded);
        loaded = now_loaded;
        if !coordinator.is_loading() {
            break;
        }
        assert!(counts.len() < 100);
        coordinator.tick(true, budget, None);
    }

    assert_eq!(
        coordinator.loaded_package("Level").unwrap().export_count,
        export_count
    );
    counts
}

#[test]
fn time_limit_bounds_exports_per_tick() {
    init_logging();
    let step = Duration::from_millis(1);
    for budget_us in [9500, 5000, 4000, 1000] {
        let budget = Duration::from_micros(budget_us);
        let counts = exports_per_tick(10, step, budget);
        assert_eq!(counts.iter().sum::<usize>(), 10);
        assert!(counts.iter().all(|x| *x < 10), "{:?} with {:?}", counts, budget);
        assert!(
            counts.iter().all(|x| (*x as u32) * step <= budget),
            "{:?} with {:?}",
            counts,
            budget
        );

        let bound = (10.0 * step.as_secs_f64() / budget.as_secs_f64()).ceil() as usize;
        assert!(counts.len() <= bound, "{:?} with {:?}, expected at most {} ticks", counts, budget, bound);
    }
}

#[test]
fn compressed_package_streams_under_budget() {
    init_logging();
    let mut writer = PackageWriter::new(PackageGuid::new_v4());
    let mut expected = Vec::new();
    for index in 0..8 {
        let data = export_data(index * 11, 700);
        writer.add_export(&format!("Chunk{}", index), "Blob", data.clone());
        expected.push((format!("Chunk{}", index), data));
    }

    // Pick a block size that splits the body into exactly ten package chunks
    let body_len = writer.write_uncompressed().len() - PackageSummary::serialized_size(0, 0);
    let block_size = (body_len + 9) / 10;
    let file = writer.write_compressed(CompressionMethod::Zlib, block_size as u32, 256, |x| {
        compress_block(CompressionMethod::Zlib, x).unwrap()
    });
    assert_eq!(PackageSummary::parse(&file).unwrap().compressed_chunks.len(), 10);

    let backend = Arc::new(MemoryIoBackend::new());
    backend.set_read_latency(Duration::from_millis(1));
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Streamed", file);
    let coordinator = LoadCoordinator::new(create_services(
        &backend,
        manifest,
        Arc::new(RawDataSerializer),
    ));

    let results = Arc::new(Mutex::new(Vec::new()));
    let results_clone = results.clone();
    coordinator.request_load_with(LoadRequest::new("Streamed").with_callback(move |result| {
        results_clone.lock().unwrap().push(result.clone());
    }));

    let mut last_progress = 0.0;
    let mut ticks = 0;
    while coordinator.tick(true, Duration::from_millis(2), None) > 0 {
        let progress = coordinator.query_progress("Streamed").unwrap();
        assert!(progress >= last_progress);
        last_progress = progress;
        ticks += 1;
        assert!(ticks < 10_000);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(coordinator.query_progress("Streamed"), Some(100.0));

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    let loaded = results[0].as_ref().unwrap();
    assert_eq!(loaded.load_percentage, 100.0);
    assert_eq!(loaded.export_count, 8);

    coordinator.with_objects(|objects| {
        assert_eq!(objects.find("Streamed", "Streamed"), Some(loaded.root));
        for (name, data) in &expected {
            let handle = objects.find("Streamed", name).unwrap();
            assert_eq!(objects.payload::<Vec<u8>>(handle), Some(data));
            assert!(!objects.get(handle).unwrap().async_loading);
        }
    });
}

#[test]
fn nested_loads_subobjects_and_placeholders() {
    init_logging();
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Level", level_package().write_uncompressed());
    add_package(&backend, &mut manifest, "Shared", shared_package().write_uncompressed());

    let serializer = Arc::new(GraphSerializer::default());
    let coordinator = LoadCoordinator::new(create_services(&backend, manifest, serializer.clone()));
    coordinator.request_load("Level");
    coordinator.flush_all(None);

    assert!(coordinator.loaded_package("Level").is_some());
    assert!(coordinator.loaded_package("Shared").is_some());
    assert_eq!(
        *serializer.post_loaded.lock().unwrap(),
        vec!["PersistentLevel", "Mesh", "Material", "Mesh.Lod0", "Grass"]
    );

    coordinator.with_objects(|objects| {
        let mesh = objects.find("Level", "Mesh").unwrap();
        let material = objects.find("Level", "Material").unwrap();
        assert_eq!(objects.payload::<ObjectHandle>(mesh), Some(&material));
        assert_eq!(objects.payload::<Vec<u8>>(material), Some(&export_data(3, 16)));

        let lod = objects.find("Level", "Mesh.Lod0").unwrap();
        let record = objects.get(lod).unwrap();
        assert_eq!(record.outer, mesh);
        assert!(!record.needs_post_load);
        assert_eq!(objects.payload::<Vec<u8>>(lod), Some(&vec![7, 8, 9]));

        // Created as a placeholder by Level's import, then filled in by Shared's load
        let grass = objects.find("Shared", "Grass").unwrap();
        assert!(!objects.get(grass).unwrap().placeholder);
        assert_eq!(objects.payload::<Vec<u8>>(grass), Some(&export_data(4, 128)));
    });
}

#[test]
fn load_failures_reach_callbacks() {
    init_logging();
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Shared", shared_package().write_uncompressed());
    manifest.add_package("Truncated", "packages/truncated.pkg", None);
    backend.add_file(
        "packages/truncated.pkg",
        shared_package().write_uncompressed()[..40].to_vec(),
    );
    let coordinator = LoadCoordinator::new(create_services(
        &backend,
        manifest,
        Arc::new(RawDataSerializer),
    ));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let requests = vec![
        LoadRequest::new("Missing"),
        LoadRequest::new("Shared").with_guid(PackageGuid::new_v4()),
        LoadRequest::new("Truncated"),
    ];
    for request in requests {
        let errors = errors.clone();
        coordinator.request_load_with(request.with_callback(move |result| {
            errors.lock().unwrap().push(result.as_ref().err().cloned());
        }));
    }
    coordinator.flush_all(None);

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 3);
    assert!(matches!(errors[0], Some(LoaderError::PackageNotFound(_))));
    assert!(matches!(errors[1], Some(LoaderError::GuidMismatch { .. })));
    assert!(errors[2].is_some());
    assert!(coordinator.loaded_package("Shared").is_none());
    assert!(!coordinator.is_loading());
}

#[test]
fn bad_table_offset_fails_the_load() {
    init_logging();
    let mut file = level_package().write_uncompressed();
    let summary = PackageSummary::parse(&file).unwrap();
    let bad_offset = summary.total_header_size + 100;
    // import_offset field of the summary
    file[40..44].copy_from_slice(&bad_offset.to_ne_bytes());

    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Level", file);
    add_package(&backend, &mut manifest, "Shared", shared_package().write_uncompressed());
    let coordinator = LoadCoordinator::new(create_services(
        &backend,
        manifest,
        Arc::new(RawDataSerializer),
    ));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    coordinator.request_load_with(LoadRequest::new("Level").with_callback(move |result| {
        errors_clone.lock().unwrap().push(result.as_ref().err().cloned());
    }));
    coordinator.flush_all(None);

    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        Some(LoaderError::Format(FormatError::InvalidHeader(_)))
    ));

    // The coordinator stays usable after the failed load
    assert!(!coordinator.is_loading());
    coordinator.request_load("Shared");
    coordinator.flush_all(None);
    assert!(coordinator.loaded_package("Shared").is_some());
    assert!(coordinator.loaded_package("Level").is_none());
}

#[test]
fn overlay_replaces_export_bytes() {
    init_logging();
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Level", level_package().write_uncompressed());

    let overlay = Arc::new(MemoryPatchOverlay::new());
    let mut patch = PackagePatch::default();
    patch.add_export("Material", "Material", vec![42; 5]);
    patch.add_export("Hotfix", "Script", vec![1, 2]);
    overlay.add_patch("Level", patch);

    let services = create_services(&backend, manifest, Arc::new(RawDataSerializer))
        .with_overlay(overlay.clone());
    let coordinator = LoadCoordinator::new(services);
    coordinator.request_load("Level");
    coordinator.flush_all(None);

    assert_eq!(coordinator.loaded_package("Level").unwrap().export_count, 4);
    coordinator.with_objects(|objects| {
        let material = objects.find("Level", "Material").unwrap();
        assert_eq!(objects.payload::<Vec<u8>>(material), Some(&vec![42; 5]));
        let hotfix = objects.find("Level", "Hotfix").unwrap();
        assert_eq!(objects.payload::<Vec<u8>>(hotfix), Some(&vec![1, 2]));
        let mesh = objects.find("Level", "Mesh").unwrap();
        assert_eq!(objects.payload::<Vec<u8>>(mesh), Some(&export_data(2, 64)));
    });
    assert_eq!(overlay.released_packages(), vec!["Level".to_string()]);
}

#[test]
fn flush_services_low_priority_precache_reads() {
    init_logging();
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Level", level_package().write_uncompressed());

    let mut config = StreamingConfig::default();
    config.reader.precache_priority = IoPriority::Low;
    config.loading.flush_min_priority = IoPriority::Normal;
    let services =
        create_services(&backend, manifest, Arc::new(RawDataSerializer)).with_config(config);
    let io = services.io.clone();
    let coordinator = LoadCoordinator::new(services);

    coordinator.request_load("Level");
    coordinator.flush_all(None);
    assert!(!coordinator.is_loading());
    assert!(coordinator.loaded_package("Level").is_some());
    // The caller's floor comes back once the flush is done
    assert_eq!(io.min_priority(), IoPriority::Min);
}

#[test]
fn flush_skips_excluded_tag() {
    init_logging();
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Level", level_package().write_uncompressed());
    add_package(&backend, &mut manifest, "Shared", shared_package().write_uncompressed());
    let coordinator = LoadCoordinator::new(create_services(
        &backend,
        manifest,
        Arc::new(RawDataSerializer),
    ));

    coordinator.request_load_with(LoadRequest::new("Level").with_tag("background"));
    coordinator.request_load("Shared");
    coordinator.flush_all(Some("background"));

    assert!(coordinator.loaded_package("Shared").is_some());
    assert_eq!(coordinator.query_phase("Level"), Some(LoadPhase::Created));
    assert_eq!(coordinator.active_load_count(), 1);
    assert_eq!(coordinator.tick(true, Duration::from_millis(5), Some("background")), 1);

    coordinator.flush_all(None);
    assert!(coordinator.loaded_package("Level").is_some());
    assert_eq!(coordinator.services().io.min_priority(), IoPriority::Min);
}

#[test]
fn pending_reservations_hold_timed_ticks() {
    init_logging();
    let mut writer = shared_package();
    writer.add_reservation(4096);
    let backend = Arc::new(MemoryIoBackend::new());
    let mut manifest = PackageManifest::default();
    add_package(&backend, &mut manifest, "Shared", writer.write_uncompressed());

    let reservations = ManualReservations::new();
    let services = create_services(&backend, manifest, Arc::new(RawDataSerializer))
        .with_reservations(Arc::new(reservations.clone()));
    let io = services.io.clone();
    let coordinator = LoadCoordinator::new(services);
    coordinator.request_load("Shared");

    for _ in 0..50 {
        coordinator.tick(true, Duration::from_millis(5), None);
        io.block_until_all_requests_finished();
    }
    assert_eq!(coordinator.query_phase("Shared"), Some(LoadPhase::ImportsResolved));
    assert_eq!(reservations.reserved_count(), 1);

    coordinator.flush_all(None);
    assert!(coordinator.loaded_package("Shared").is_some());
    assert_eq!(reservations.canceled_count(), 1);
}

#[test]
fn streaming_loader_reads_from_disk() {
    init_logging();
    let root = std::env::temp_dir().join(format!("streamload-loader-{}", std::process::id()));
    std::fs::create_dir_all(root.join("packages")).unwrap();

    let mut manifest = PackageManifest::default();
    std::fs::write(
        root.join("packages/shared.pkg"),
        shared_package().write_uncompressed(),
    )
    .unwrap();
    manifest.add_package("Shared", "packages/shared.pkg", None);
    std::fs::write(
        root.join(crate::streaming_loader::MANIFEST_FILE_NAME),
        manifest.to_json_string().unwrap(),
    )
    .unwrap();

    let loader = StreamingLoader::new(root.clone(), Arc::new(RawDataSerializer)).unwrap();
    loader.request_load("Shared");
    let mut updates = 0;
    while loader.update(Duration::from_millis(2)) > 0 {
        updates += 1;
        assert!(updates < 10_000);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!loader.is_loading());
    loader.coordinator().with_objects(|objects| {
        let grass = objects.find("Shared", "Grass").unwrap();
        assert_eq!(objects.payload::<Vec<u8>>(grass), Some(&export_data(4, 128)));
    });

    drop(loader);
    std::fs::remove_dir_all(&root).unwrap();
}
