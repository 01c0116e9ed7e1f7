//! Layer creation from local sources.
//!
//! A layer is a gzip-compressed tar stream identified by two digests:
//! the sha256 of the compressed bytes (the blob digest) and the sha256 of
//! the uncompressed tar (the diff id recorded in the image config).
//!
//! Sources:
//! - a gzip-compressed tarball: used as-is
//! - an uncompressed tarball: compressed with gzip
//! - a directory: archived recursively, then compressed

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_distribution::manifest::OciDescriptor;
use sha2::{Digest, Sha256};
use strata_core::error::{Result, StrataError};

/// Media type of the layers produced here.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Options for building a layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerOptions {
    /// Keep the compressed bytes in memory after the digest pass, so later
    /// reads (upload) do not compress the source again.
    pub compressed_caching: bool,
}

impl LayerOptions {
    /// Options with compressed caching enabled.
    pub fn cached() -> Self {
        Self {
            compressed_caching: true,
        }
    }
}

/// Shape of the source a layer was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    CompressedTarball,
    Tarball,
    Directory,
}

/// A single filesystem layer built from a local path.
#[derive(Clone)]
pub struct Layer {
    path: PathBuf,
    origin: Origin,
    /// "sha256:<hex>" of the compressed bytes
    digest: String,
    /// "sha256:<hex>" of the uncompressed tar stream
    diff_id: String,
    size: u64,
    uncompressed_size: u64,
    cached: Option<Arc<Vec<u8>>>,
}

impl Layer {
    /// Build a layer from a tarball (compressed or not) or a directory.
    ///
    /// Both digests are computed here, so a missing or unreadable source
    /// fails immediately.
    pub fn from_path(path: impl AsRef<Path>, options: LayerOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            StrataError::LayerError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let origin = if metadata.is_dir() {
            Origin::Directory
        } else if has_gzip_magic(&path)? {
            Origin::CompressedTarball
        } else {
            Origin::Tarball
        };

        let (diff_id, uncompressed_size) = match origin {
            Origin::CompressedTarball => {
                let decoder = MultiGzDecoder::new(BufReader::new(open(&path)?));
                sha256_reader(decoder).map_err(|e| {
                    StrataError::LayerError(format!(
                        "Failed to decompress {}: {}",
                        path.display(),
                        e
                    ))
                })?
            }
            Origin::Tarball => sha256_reader(BufReader::new(open(&path)?)).map_err(|e| {
                StrataError::LayerError(format!("Failed to hash {}: {}", path.display(), e))
            })?,
            Origin::Directory => {
                let tar = archive_dir(&path)?;
                (sha256_bytes(&tar), tar.len() as u64)
            }
        };

        let mut layer = Layer {
            path,
            origin,
            digest: String::new(),
            diff_id: prefixed(&diff_id),
            size: 0,
            uncompressed_size,
            cached: None,
        };

        let compressed = layer.compress_from_source()?;
        layer.digest = prefixed(&sha256_bytes(&compressed));
        layer.size = compressed.len() as u64;
        if options.compressed_caching {
            layer.cached = Some(Arc::new(compressed));
        }

        tracing::debug!(
            path = %layer.path.display(),
            digest = %layer.digest,
            diff_id = %layer.diff_id,
            size = layer.size,
            cached = layer.cached.is_some(),
            "Built layer"
        );

        Ok(layer)
    }

    /// Compressed layer bytes.
    ///
    /// Served from memory when the layer was built with compressed caching;
    /// otherwise the source is compressed again.
    pub fn compressed(&self) -> Result<Vec<u8>> {
        match self.cached {
            Some(ref bytes) => Ok(bytes.as_ref().clone()),
            None => {
                let compressed = self.compress_from_source()?;
                let digest = prefixed(&sha256_bytes(&compressed));
                if digest != self.digest {
                    return Err(StrataError::LayerError(format!(
                        "{} changed while building the image: expected {}, got {}",
                        self.path.display(),
                        self.digest,
                        digest
                    )));
                }
                Ok(compressed)
            }
        }
    }

    /// Uncompressed tar stream of the layer.
    pub fn uncompressed(&self) -> Result<Vec<u8>> {
        match self.origin {
            Origin::Directory => archive_dir(&self.path),
            Origin::Tarball => read_all(open(&self.path)?, &self.path),
            Origin::CompressedTarball => {
                read_all(MultiGzDecoder::new(BufReader::new(open(&self.path)?)), &self.path)
            }
        }
    }

    /// Source path the layer was built from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blob digest ("sha256:...") of the compressed bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Diff id ("sha256:...") of the uncompressed tar stream.
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    /// Compressed size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Uncompressed size in bytes.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Media type of the compressed blob.
    pub fn media_type(&self) -> &'static str {
        LAYER_MEDIA_TYPE
    }

    /// Whether the compressed bytes are held in memory.
    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    /// Manifest descriptor for this layer.
    pub fn descriptor(&self) -> OciDescriptor {
        OciDescriptor {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            digest: self.digest.clone(),
            size: self.size as i64,
            ..Default::default()
        }
    }

    fn compress_from_source(&self) -> Result<Vec<u8>> {
        match self.origin {
            Origin::CompressedTarball => read_all(open(&self.path)?, &self.path),
            Origin::Tarball => gzip(BufReader::new(open(&self.path)?), &self.path),
            Origin::Directory => gzip(archive_dir(&self.path)?.as_slice(), &self.path),
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("path", &self.path)
            .field("origin", &self.origin)
            .field("digest", &self.digest)
            .field("diff_id", &self.diff_id)
            .field("size", &self.size)
            .field("cached", &self.cached.is_some())
            .finish()
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| StrataError::LayerError(format!("Failed to open {}: {}", path.display(), e)))
}

fn read_all(mut reader: impl Read, path: &Path) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data).map_err(|e| {
        StrataError::LayerError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Ok(data)
}

fn has_gzip_magic(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = open(path)?;
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..]) {
            Ok(0) => return Ok(false),
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(StrataError::LayerError(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Ok(magic == GZIP_MAGIC)
}

/// Gzip a stream. The header carries no timestamp or name, so the same
/// input always compresses to the same bytes.
fn gzip(mut reader: impl Read, path: &Path) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::copy(&mut reader, &mut encoder).map_err(|e| {
        StrataError::LayerError(format!("Failed to compress {}: {}", path.display(), e))
    })?;
    encoder.finish().map_err(|e| {
        StrataError::LayerError(format!("Failed to compress {}: {}", path.display(), e))
    })
}

/// Archive a directory into an uncompressed tar stream.
///
/// Entries are added in sorted order with paths relative to `dir`.
fn archive_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    add_dir_to_tar(&mut builder, dir, dir)?;
    builder
        .into_inner()
        .map_err(|e| StrataError::LayerError(format!("Failed to finalize layer: {}", e)))
}

/// Recursively add a directory's contents to a tar builder.
fn add_dir_to_tar<W: Write>(builder: &mut tar::Builder<W>, root: &Path, current: &Path) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    let mut paths = Vec::new();
    for entry in read_dir {
        let entry = entry
            .map_err(|e| StrataError::LayerError(format!("Failed to read entry: {}", e)))?;
        paths.push(entry.path());
    }
    paths.sort();

    for path in paths {
        let relative = path
            .strip_prefix(root)
            .map_err(|e| StrataError::LayerError(format!("Failed to strip prefix: {}", e)))?;
        let file_type = std::fs::symlink_metadata(&path)?.file_type();

        if file_type.is_dir() {
            builder.append_dir(relative, &path).map_err(|e| {
                StrataError::LayerError(format!(
                    "Failed to add directory {} to layer: {}",
                    relative.display(),
                    e
                ))
            })?;
            add_dir_to_tar(builder, root, &path)?;
        } else {
            builder.append_path_with_name(&path, relative).map_err(|e| {
                StrataError::LayerError(format!(
                    "Failed to add file {} to layer: {}",
                    relative.display(),
                    e
                ))
            })?;
        }
    }

    Ok(())
}

fn prefixed(hex_digest: &str) -> String {
    format!("sha256:{}", hex_digest)
}

/// Compute the SHA256 digest (hex) and length of a stream.
pub fn sha256_reader(mut reader: impl Read) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let len = std::io::copy(&mut reader, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), len))
}

/// Compute the SHA256 digest (hex) of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
