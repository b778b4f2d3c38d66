mod linker;
mod objects;
mod package_file;

use linker::DemoPackageSource;
use objects::DemoObjects;
use package_file::{write_package, ExportData};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamload::base::{PackageGuid, PackageName};
use streamload::loader::{
    AsyncLoader, AsyncReadQueue, ImportEntry, LoadResult, LoaderConfig, LoaderError,
    PackageRequest, TickResult,
};

const LEVEL_PACKAGE: &str = "/Game/Maps/Level";
const PROPS_PACKAGE: &str = "/Game/Props";
const CORE_PACKAGE: &str = "/Game/Core";

// Writes a small chain of packages: Level imports Props and Core, Props imports Core
fn write_sample_packages(source: &DemoPackageSource) -> std::io::Result<PackageGuid> {
    let path_of = |name: &str| -> std::io::Result<PathBuf> {
        let path = source.package_path(&PackageName::new(name));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    };

    write_package(
        &path_of(CORE_PACKAGE)?,
        Vec::new(),
        &[
            ExportData::new("Base", "Material", vec![1u8; 96]),
            ExportData::new("Checker", "Texture", vec![2u8; 512]),
        ],
        false,
    )?;

    write_package(
        &path_of(PROPS_PACKAGE)?,
        vec![
            ImportEntry::package(CORE_PACKAGE),
            ImportEntry::object(0, "Base", "Material"),
        ],
        &[ExportData::new("Chair", "Mesh", vec![3u8; 300])],
        false,
    )?;

    write_package(
        &path_of(LEVEL_PACKAGE)?,
        vec![
            ImportEntry::package(PROPS_PACKAGE),
            ImportEntry::object(0, "Chair", "Mesh"),
            ImportEntry::package(CORE_PACKAGE),
            ImportEntry::object(2, "Checker", "Texture"),
        ],
        &[
            ExportData::new("Layout", "World", (0..1000u32).map(|i| i as u8).collect::<Vec<_>>()),
            ExportData::new("Lightmap", "Texture", vec![4u8; 2048]).bulk(),
        ],
        true,
    )
}

fn load_config(path: Option<&Path>) -> Result<LoaderConfig, LoaderError> {
    match path {
        Some(path) => LoaderConfig::load_from_file(path),
        None => Ok(LoaderConfig::default()),
    }
}

fn run() -> Result<(), LoaderError> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref())?;
    log::info!("Loader config: {:?}", config);

    let read_queue = Arc::new(AsyncReadQueue::from_config(&config)?);
    let root = std::env::temp_dir().join("streamload-demo");
    let source = DemoPackageSource::new(root, read_queue, config.minimum_read_size);
    let level_guid = write_sample_packages(&source)?;

    let source = Arc::new(source);
    let objects = Arc::new(DemoObjects::new());
    let loader = AsyncLoader::new(config, source, objects.clone())?;

    let level_loaded = Arc::new(AtomicBool::new(false));
    let level_loaded_clone = level_loaded.clone();
    let level_request = loader.enqueue(
        PackageRequest::new(LEVEL_PACKAGE)
            .guid(level_guid)
            .priority(10)
            .on_complete(move |name, package_object, result| {
                log::info!("{} finished: {:?} {:?}", name, result, package_object);
                level_loaded_clone.store(true, Ordering::Release);
            }),
    );
    log::info!("Requested {} as {}", LEVEL_PACKAGE, level_request);

    loader.enqueue(
        PackageRequest::new("/Game/Missing").on_complete(|name, _, result| {
            assert_eq!(result, LoadResult::Failed);
            log::warn!("{} could not be loaded", name);
        }),
    );

    let level_name = PackageName::new(LEVEL_PACKAGE);
    let mut frame = 0u64;
    loop {
        profiling::scope!("Frame");
        let result = loader.tick_default();
        if frame % 10 == 0 {
            log::debug!(
                "frame {}: {:?}, {} at {:.0}%",
                frame,
                result,
                level_name,
                loader.load_percentage(&level_name)
            );
        }

        if result == TickResult::Complete && level_loaded.load(Ordering::Acquire) {
            break;
        }

        frame += 1;
        std::thread::sleep(Duration::from_millis(16));
        profiling::finish_frame!();
    }

    log::info!(
        "Loaded {} packages after {} frames",
        objects.loaded_package_count(),
        frame
    );
    for name in [LEVEL_PACKAGE, PROPS_PACKAGE, CORE_PACKAGE] {
        for line in objects.describe(&PackageName::new(name)) {
            log::info!("  {}", line);
        }
    }

    Ok(())
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
