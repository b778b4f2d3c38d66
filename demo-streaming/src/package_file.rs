use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use streamload::base::PackageGuid;
use streamload::loader::{CompressedChunk, CompressionFlags, ExportEntry, ImportEntry};

pub const PACKAGE_EXTENSION: &str = "pak";

// Bytes of the little-endian header length that precedes the header
pub const HEADER_SIZE_BYTES: u64 = 8;

const CHUNK_SIZE: usize = 256;

/// Everything the linker needs before it can hand out exports. Stored with bincode right after
/// an 8 byte length.
///
/// Uncompressed packages address exports by file offset. Compressed packages address them in
/// uncompressed space starting at 0, anything past the uncompressed size is raw bulk data stored
/// after the last chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageFileHeader {
    pub guid: PackageGuid,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
    pub chunks: Vec<CompressedChunk>,
    pub compression: CompressionFlags,
}

pub struct ExportData {
    pub object_name: String,
    pub class_name: String,
    pub data: Vec<u8>,
    // Stored in the bulk data area of compressed packages
    pub bulk: bool,
}

impl ExportData {
    pub fn new(
        object_name: &str,
        class_name: &str,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        ExportData {
            object_name: object_name.to_string(),
            class_name: class_name.to_string(),
            data: data.into(),
            bulk: false,
        }
    }

    pub fn bulk(mut self) -> Self {
        self.bulk = true;
        self
    }
}

fn compress_chunk(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn to_io_error(e: bincode::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

/// Writes a package file. Returns the guid stored in it.
pub fn write_package(
    path: &Path,
    imports: Vec<ImportEntry>,
    exports: &[ExportData],
    compress: bool,
) -> std::io::Result<PackageGuid> {
    profiling::scope!("write_package");

    // Lay out export payloads, main data first, then bulk data
    let mut payload = Vec::new();
    let mut bulk_data = Vec::new();
    let mut relative_exports = Vec::with_capacity(exports.len());
    for export in exports {
        let (area, is_bulk) = if export.bulk && compress {
            (&mut bulk_data, true)
        } else {
            (&mut payload, false)
        };
        relative_exports.push((area.len() as u64, is_bulk));
        area.extend_from_slice(&export.data);
    }

    let uncompressed_size = payload.len() as u64;
    let make_exports = |base: u64| -> Vec<ExportEntry> {
        exports
            .iter()
            .zip(&relative_exports)
            .map(|(export, (offset, is_bulk))| {
                let offset = if *is_bulk {
                    uncompressed_size + offset
                } else {
                    base + offset
                };
                ExportEntry::new(
                    &export.object_name,
                    &export.class_name,
                    offset,
                    export.data.len() as u64,
                )
            })
            .collect()
    };

    let compressed_chunks = if compress {
        payload
            .chunks(CHUNK_SIZE)
            .map(compress_chunk)
            .collect::<std::io::Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    let mut header = PackageFileHeader {
        guid: PackageGuid::new_v4(),
        imports,
        exports: make_exports(0),
        chunks: vec![
            CompressedChunk {
                uncompressed_offset: 0,
                uncompressed_size: 0,
                compressed_offset: 0,
                compressed_size: 0,
            };
            compressed_chunks.len()
        ],
        compression: if compress {
            CompressionFlags::Zlib
        } else {
            CompressionFlags::None
        },
    };

    // Integers are fixed width in bincode, the header size doesn't depend on the offsets
    let header_size = bincode::serialized_size(&header).map_err(to_io_error)?;
    let payload_start = HEADER_SIZE_BYTES + header_size;

    if compress {
        let mut compressed_offset = payload_start;
        for (i, compressed) in compressed_chunks.iter().enumerate() {
            let uncompressed_offset = (i * CHUNK_SIZE) as u64;
            header.chunks[i] = CompressedChunk {
                uncompressed_offset,
                uncompressed_size: (payload.len() - i * CHUNK_SIZE).min(CHUNK_SIZE) as u64,
                compressed_offset,
                compressed_size: compressed.len() as u64,
            };
            compressed_offset += compressed.len() as u64;
        }
    } else {
        header.exports = make_exports(payload_start);
    }

    let header_bytes = bincode::serialize(&header).map_err(to_io_error)?;
    debug_assert_eq!(header_bytes.len() as u64, header_size);

    let mut file = std::fs::File::create(path)?;
    file.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    file.write_all(&header_bytes)?;
    if compress {
        for compressed in &compressed_chunks {
            file.write_all(compressed)?;
        }
        file.write_all(&bulk_data)?;
    } else {
        file.write_all(&payload)?;
    }

    log::info!(
        "Wrote {:?} ({} exports, {} chunks)",
        path,
        exports.len(),
        compressed_chunks.len()
    );
    Ok(header.guid)
}

pub fn read_header(bytes: &[u8]) -> Result<PackageFileHeader, String> {
    bincode::deserialize(bytes).map_err(|e| e.to_string())
}
