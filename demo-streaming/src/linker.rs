use crate::package_file::{self, PackageFileHeader, HEADER_SIZE_BYTES, PACKAGE_EXTENSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamload::base::{PackageGuid, PackageName};
use streamload::loader::{
    AsyncFileArchive, AsyncReadQueue, ExportEntry, HandleStatus, ImportEntry, OpenPackageError,
    OpenPackageRequest, PackageHandle, PackageSource,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LinkerState {
    ReadingHeaderSize,
    ReadingHeader { header_size: u64 },
    Ready,
    Failed,
}

/// Reads the header of a package file without blocking, then serves export reads from the same
/// archive.
pub struct DemoLinker {
    name: PackageName,
    archive: AsyncFileArchive,
    state: LinkerState,
    expected_guid: Option<PackageGuid>,
    header: Option<PackageFileHeader>,
}

impl DemoLinker {
    pub fn name(&self) -> &PackageName {
        &self.name
    }

    pub fn export(
        &self,
        export_index: usize,
    ) -> Option<&ExportEntry> {
        self.exports().get(export_index)
    }

    // Advances the header state machine by one step if the bytes it needs are resident
    fn step(&mut self) -> bool {
        match self.state {
            LinkerState::ReadingHeaderSize => {
                if self.archive.total_size() < HEADER_SIZE_BYTES {
                    log::error!("{} is too small to be a package", self.name);
                    self.state = LinkerState::Failed;
                    return true;
                }
                if !self.archive.precache(0, HEADER_SIZE_BYTES) {
                    return false;
                }
                let mut bytes = [0u8; HEADER_SIZE_BYTES as usize];
                self.archive.seek(0);
                if let Err(e) = self.archive.serialize(&mut bytes) {
                    log::error!("Failed to read header size of {}: {}", self.name, e);
                    self.state = LinkerState::Failed;
                    return true;
                }
                let header_size = u64::from_le_bytes(bytes);
                let fits = HEADER_SIZE_BYTES
                    .checked_add(header_size)
                    .map_or(false, |end| end <= self.archive.total_size());
                if fits {
                    self.state = LinkerState::ReadingHeader { header_size };
                } else {
                    log::error!("Header of {} is larger than the file", self.name);
                    self.state = LinkerState::Failed;
                }
                true
            }
            LinkerState::ReadingHeader { header_size } => {
                if !self.archive.precache(HEADER_SIZE_BYTES, header_size) {
                    return false;
                }
                let mut bytes = vec![0u8; header_size as usize];
                self.archive.seek(HEADER_SIZE_BYTES);
                let header = self
                    .archive
                    .serialize(&mut bytes)
                    .map_err(|e| e.to_string())
                    .and_then(|_| package_file::read_header(&bytes));
                self.state = match header {
                    Ok(header) => self.accept_header(header),
                    Err(e) => {
                        log::error!("Corrupt header in {}: {}", self.name, e);
                        LinkerState::Failed
                    }
                };
                true
            }
            LinkerState::Ready | LinkerState::Failed => true,
        }
    }

    fn accept_header(
        &mut self,
        header: PackageFileHeader,
    ) -> LinkerState {
        if let Some(expected_guid) = self.expected_guid {
            if expected_guid != header.guid {
                log::error!(
                    "{} has guid {}, expected {}",
                    self.name,
                    header.guid,
                    expected_guid
                );
                return LinkerState::Failed;
            }
        }

        if !header.chunks.is_empty()
            && !self
                .archive
                .set_compression_map(header.chunks.clone(), header.compression)
        {
            return LinkerState::Failed;
        }

        let total_size = self.archive.total_size();
        let out_of_range = header.exports.iter().find(|export| {
            export
                .serial_offset
                .checked_add(export.serial_size)
                .map_or(true, |end| end > total_size)
        });
        if let Some(export) = out_of_range {
            log::error!(
                "Export {} of {} lies outside the file ({} + {} / {})",
                export.object_name,
                self.name,
                export.serial_offset,
                export.serial_size,
                total_size
            );
            return LinkerState::Failed;
        }

        log::debug!(
            "Read header of {}: {} imports, {} exports",
            self.name,
            header.imports.len(),
            header.exports.len()
        );
        self.header = Some(header);
        LinkerState::Ready
    }
}

impl PackageHandle for DemoLinker {
    fn tick(
        &mut self,
        time_limit: Option<Duration>,
    ) -> HandleStatus {
        profiling::scope!("DemoLinker::tick");
        let start = Instant::now();
        loop {
            match self.state {
                LinkerState::Ready => return HandleStatus::Loaded,
                LinkerState::Failed => return HandleStatus::Failed,
                _ => {}
            }

            if !self.step() {
                match time_limit {
                    Some(time_limit) if start.elapsed() >= time_limit => {
                        return HandleStatus::InProgress
                    }
                    _ => std::thread::yield_now(),
                }
            }
        }
    }

    fn imports(&self) -> &[ImportEntry] {
        self.header
            .as_ref()
            .map_or(&[], |header| &header.imports[..])
    }

    fn exports(&self) -> &[ExportEntry] {
        self.header
            .as_ref()
            .map_or(&[], |header| &header.exports[..])
    }

    fn precache(
        &mut self,
        offset: u64,
        size: u64,
    ) -> bool {
        self.archive.precache(offset, size)
    }

    fn archive_mut(&mut self) -> Option<&mut AsyncFileArchive> {
        Some(&mut self.archive)
    }

    fn flush_cache(&mut self) {
        self.archive.flush_cache();
    }
}

/// Resolves `/Game/Props` to `<root>/Game/Props.pak`
pub struct DemoPackageSource {
    root: PathBuf,
    read_queue: Arc<AsyncReadQueue>,
    minimum_read_size: u64,
}

impl DemoPackageSource {
    pub fn new(
        root: PathBuf,
        read_queue: Arc<AsyncReadQueue>,
        minimum_read_size: u64,
    ) -> Self {
        DemoPackageSource {
            root,
            read_queue,
            minimum_read_size,
        }
    }

    pub fn package_path(
        &self,
        name: &PackageName,
    ) -> PathBuf {
        self.root
            .join(name.as_str().trim_start_matches('/'))
            .with_extension(PACKAGE_EXTENSION)
    }
}

impl PackageSource for DemoPackageSource {
    fn open_package(
        &self,
        request: &OpenPackageRequest,
    ) -> Result<Box<dyn PackageHandle>, OpenPackageError> {
        let path = match request.load_from {
            Some(load_from) => load_from.to_path_buf(),
            None => self.package_path(request.name),
        };

        if !path.is_file() {
            return Err(OpenPackageError::FileNotFound);
        }

        let archive = AsyncFileArchive::open(path, self.read_queue.clone(), self.minimum_read_size);
        if archive.has_error() {
            return Err(OpenPackageError::HandleCreationFailed(format!(
                "couldn't read {:?}",
                archive.path()
            )));
        }

        Ok(Box::new(DemoLinker {
            name: request.name.clone(),
            archive,
            state: LinkerState::ReadingHeaderSize,
            expected_guid: request.guid,
            header: None,
        }))
    }
}
