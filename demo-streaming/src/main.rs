use streamload::base::{CompressionMethod, PackageGuid, PackageWriter};
use streamload::loader::decompress::compress_block;
use streamload::loader::{
    LoadRequest, PackageManifest, RawDataSerializer, StreamingConfig, StreamingLoader,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const FRAME_BUDGET: Duration = Duration::from_millis(4);

pub fn demo_data_path() -> PathBuf {
    std::env::temp_dir().join("streamload-demo")
}

fn generated_bytes(
    seed: u8,
    len: usize,
) -> Vec<u8> {
    (0..len).map(|x| seed.wrapping_mul(31).wrapping_add(x as u8)).collect()
}

// Writes one plain and one lz4 compressed package, plus the manifest listing them
fn write_demo_packages(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root.join("packages"))?;
    let mut manifest = PackageManifest::default();

    let mut level = PackageWriter::new(PackageGuid::new_v4());
    level.add_import("Characters", "Hero", "SkeletalMesh");
    for index in 0..32 {
        level.add_export(
            &format!("Actor{}", index),
            "Actor",
            generated_bytes(index, 4096),
        );
    }
    level.add_reservation(1024 * 1024);
    std::fs::write(root.join("packages/level.pkg"), level.write_uncompressed())?;
    manifest.add_package("Level", "packages/level.pkg", None);

    let mut characters = PackageWriter::new(PackageGuid::new_v4());
    characters.add_export("Hero", "SkeletalMesh", generated_bytes(7, 256 * 1024));
    characters.add_export("HeroMaterial", "Material", generated_bytes(9, 2048));
    let compressed =
        characters.write_compressed(CompressionMethod::Lz4, 64 * 1024, 16 * 1024, |x| {
            compress_block(CompressionMethod::Lz4, x).unwrap_or_else(|_| x.to_vec())
        });
    std::fs::write(root.join("packages/characters.pkg"), compressed)?;
    manifest.add_package("Characters", "packages/characters.pkg", None);
    manifest.add_remap("Chars", "Characters");

    let json = manifest
        .to_json_string()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    std::fs::write(root.join("manifest.json"), json)
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let root = demo_data_path();
    write_demo_packages(&root).unwrap();

    let loader = StreamingLoader::with_config(
        root,
        Arc::new(RawDataSerializer),
        StreamingConfig::default(),
    )
    .unwrap();

    for package_name in ["Level", "Chars"] {
        loader.request_load_with(LoadRequest::new(package_name).with_callback(
            move |result| match result {
                Ok(loaded) => log::info!(
                    "{} loaded {} exports in {:.2} ms, waited on IO {} times",
                    loaded.name,
                    loaded.export_count,
                    loaded.load_time.as_secs_f64() * 1000.0,
                    loaded.stats.precache_waits
                ),
                Err(e) => log::error!("{} failed to load: {}", package_name, e),
            },
        ));
    }

    let mut frame = 0;
    loop {
        std::thread::sleep(Duration::from_millis(15));
        let remaining = loader.update(FRAME_BUDGET);
        profiling::finish_frame!();
        frame += 1;

        for package_name in ["Level", "Chars"] {
            if let Some(progress) = loader.coordinator().query_progress(package_name) {
                println!("frame {}: {} at {:.0}%", frame, package_name, progress);
            }
        }

        if remaining == 0 {
            break;
        }
    }

    let stats = loader.io().stats();
    println!(
        "done after {} frames, {} reads, {} bytes read",
        frame, stats.requests_serviced, stats.bytes_read
    );
}
