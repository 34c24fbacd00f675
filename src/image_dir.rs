//! On-disk image repositories in the [OCI Image Layout](https://github.com/opencontainers/image-spec/blob/v1.0.1/image-layout.md) form
//!
//! ```text
//! <root>/oci-layout          {"imageLayoutVersion":"1.0.0"}
//! <root>/blobs/sha256/<hex>  content-addressed blobs
//! <root>/refs/<name>         JSON-encoded descriptor per reference
//! ```
//!
//! Blobs are immutable: a write goes to a temporary file in the blob
//! directory and is renamed to its digest once the content is hashed,
//! so a crashed or cancelled write never leaves a misnamed blob.

use flate2::{write::GzEncoder, Compression};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageConfiguration, ImageConfigurationBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, RootFsBuilder, SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::digest::{Digest, DigestBuf};
use crate::error::{Error, Result};
use crate::reference::RefName;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_VERSION: &str = "1.0.0";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const BLOB_DIR: &str = "blobs/sha256";
const REF_DIR: &str = "refs";

#[derive(Debug, Serialize, Deserialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    version: String,
}

/// Handle to an image repository rooted at one directory.
///
/// The repository is owned by one operation at a time; concurrent
/// mutation through several handles is undefined. Read-only access may
/// be shared freely.
#[derive(Debug)]
pub struct ImageDir {
    root: PathBuf,
}

/// A blob parsed according to its descriptor's media type.
///
/// Layers stay a raw byte stream; anything else this crate understands
/// is decoded into its typed document. Multi-arch image indexes are
/// deliberately absent: they are rejected at dispatch.
pub enum Blob {
    Manifest(ImageManifest),
    Config(ImageConfiguration),
    Layer(fs::File),
}

impl ImageDir {
    /// Initialize an empty repository at `root`, which must not already
    /// contain anything.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        if fs::read_dir(root)?.next().is_some() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is not empty", root.display()),
            )));
        }
        fs::create_dir_all(root.join(BLOB_DIR))?;
        fs::create_dir(root.join(REF_DIR))?;
        fs::write(root.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;
        log::info!("Created image layout at {}", root.display());
        Ok(ImageDir {
            root: root.to_path_buf(),
        })
    }

    /// Open an existing repository, verifying the layout marker.
    pub fn open(root: &Path) -> Result<Self> {
        let corrupt = |reason: &str| Error::CorruptLayout {
            path: root.to_path_buf(),
            reason: reason.to_string(),
        };
        if !root.is_dir() {
            return Err(corrupt("not a directory"));
        }
        let layout_bytes = fs::read(root.join(OCI_LAYOUT_FILE))
            .map_err(|_| corrupt("oci-layout is missing or unreadable"))?;
        let layout: OciLayout = serde_json::from_slice(&layout_bytes)
            .map_err(|_| corrupt("oci-layout is not valid JSON"))?;
        if layout.version != OCI_LAYOUT_VERSION {
            return Err(corrupt(&format!(
                "unsupported imageLayoutVersion {}",
                layout.version
            )));
        }
        if !root.join(BLOB_DIR).is_dir() {
            return Err(corrupt("blobs/sha256 is missing"));
        }
        Ok(ImageDir {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join(BLOB_DIR)
    }

    fn ref_path(&self, name: &RefName) -> PathBuf {
        self.root.join(REF_DIR).join(name.as_str())
    }

    /// Move a fully written temporary file to its digest name. When the
    /// blob already exists the temporary is discarded; content equality
    /// is implied by the digest.
    fn persist_blob(&self, tmp: NamedTempFile, digest: &Digest) -> Result<()> {
        let dest = self.root.join(digest.as_path());
        if dest.exists() {
            log::debug!("Blob {} already present", digest);
            return Ok(());
        }
        tmp.persist(&dest).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Store a blob from a byte stream, hashing while writing.
    /// Returns the digest and the byte size.
    pub fn put_blob(&self, mut data: impl Read) -> Result<(Digest, u64)> {
        let tmp = NamedTempFile::new_in(self.blob_dir())?;
        let mut out = DigestBuf::new(tmp);
        io::copy(&mut data, &mut out)?;
        let (tmp, digest, size) = out.finish();
        self.persist_blob(tmp, &digest)?;
        log::debug!("Wrote blob {} ({} bytes)", digest, size);
        Ok((digest, size))
    }

    /// Store a JSON document as a blob in its canonical encoding
    /// (UTF-8, no insignificant whitespace, declaration key order).
    pub fn put_blob_json<T: Serialize>(&self, value: &T) -> Result<(Digest, u64)> {
        let buf = serde_json::to_vec(value)?;
        self.put_blob(buf.as_slice())
    }

    /// Open a blob for reading. The digest names the blob; content
    /// verification happens where the bytes are consumed bounded
    /// ([ImageDir::from_descriptor], unpack) or via [ImageDir::fsck].
    pub fn get_blob(&self, digest: &Digest) -> Result<fs::File> {
        if digest.algorithm != "sha256" {
            return Err(Error::InvalidDigest(digest.to_string()));
        }
        fs::File::open(self.root.join(digest.as_path())).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("blob {}", digest))
            } else {
                Error::Io(e)
            }
        })
    }

    fn read_verified(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.get_blob(digest)?.read_to_end(&mut buf)?;
        let found = Digest::from_buf_sha256(&buf);
        if found != *digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                found: found.to_string(),
            });
        }
        Ok(buf)
    }

    /// Read and decode the blob a descriptor points at, dispatching on
    /// its media type. Manifest and config blobs are re-hashed before
    /// parsing; layers are returned as a stream.
    pub fn from_descriptor(&self, descriptor: &Descriptor) -> Result<Blob> {
        let digest = Digest::from_descriptor(descriptor)?;
        match descriptor.media_type() {
            MediaType::ImageManifest => {
                let buf = self.read_verified(&digest)?;
                Ok(Blob::Manifest(serde_json::from_slice(&buf)?))
            }
            MediaType::ImageConfig => {
                let buf = self.read_verified(&digest)?;
                Ok(Blob::Config(serde_json::from_slice(&buf)?))
            }
            MediaType::ImageLayerGzip => Ok(Blob::Layer(self.get_blob(&digest)?)),
            other => Err(Error::UnsupportedMediaType(other.to_string())),
        }
    }

    pub fn get_reference(&self, name: &RefName) -> Result<Descriptor> {
        let buf = fs::read(self.ref_path(name)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("reference {}", name))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Bind `name` to a descriptor, replacing any previous binding. The
    /// reference file is written to a temporary name and renamed so a
    /// torn write cannot be observed.
    pub fn put_reference(&self, name: &RefName, descriptor: &Descriptor) -> Result<()> {
        let ref_dir = self.root.join(REF_DIR);
        fs::create_dir_all(&ref_dir)?;
        let tmp = NamedTempFile::new_in(&ref_dir)?;
        serde_json::to_writer(tmp.as_file(), descriptor)?;
        tmp.persist(self.ref_path(name))
            .map_err(|e| Error::Io(e.error))?;
        log::info!("Reference {} -> {}", name, descriptor.digest());
        Ok(())
    }

    pub fn delete_reference(&self, name: &RefName) -> Result<()> {
        fs::remove_file(self.ref_path(name)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("reference {}", name))
            } else {
                Error::Io(e)
            }
        })
    }

    pub fn list_references(&self) -> Result<Vec<(String, Descriptor)>> {
        let ref_dir = self.root.join(REF_DIR);
        let mut refs = Vec::new();
        if !ref_dir.is_dir() {
            return Ok(refs);
        }
        for entry in fs::read_dir(ref_dir)? {
            let entry = entry?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|n| Error::InvalidReference(n.to_string_lossy().into_owned()))?;
            let descriptor = serde_json::from_slice(&fs::read(entry.path())?)?;
            refs.push((name, descriptor));
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    pub fn list_blobs(&self) -> Result<Vec<Digest>> {
        let mut blobs = Vec::new();
        for entry in fs::read_dir(self.blob_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(digest) = Digest::new(&format!("sha256:{}", name)) {
                    blobs.push(digest);
                }
            }
        }
        blobs.sort_by(|a, b| a.encoded.cmp(&b.encoded));
        Ok(blobs)
    }

    /// Re-hash every blob, returning how many were verified. The first
    /// blob whose content does not match its name is an error.
    pub fn fsck(&self) -> Result<u32> {
        let mut verified = 0;
        for digest in self.list_blobs()? {
            let mut f = self.get_blob(&digest)?;
            let mut hasher = Sha256::new();
            io::copy(&mut f, &mut hasher)?;
            let found = base16ct::lower::encode_string(&hasher.finalize());
            if found != digest.encoded {
                return Err(Error::DigestMismatch {
                    expected: digest.to_string(),
                    found: format!("sha256:{}", found),
                });
            }
            verified += 1;
        }
        Ok(verified)
    }

    /// Start a new gzip-compressed tar layer. Entries are appended to
    /// the returned builder; [LayerWriter::complete] on its inner
    /// writer stores the blob and yields both digests.
    pub fn create_layer(&self) -> Result<tar::Builder<LayerWriter>> {
        let tmp = NamedTempFile::new_in(self.blob_dir())?;
        let compressed = DigestBuf::new(tmp);
        let encoder = GzEncoder::new(compressed, Compression::default());
        Ok(tar::Builder::new(LayerWriter {
            inner: DigestBuf::new(encoder),
        }))
    }
}

/// A completed layer blob and its uncompressed diff ID
#[derive(Debug, Clone)]
pub struct Layer {
    pub descriptor: Descriptor,
    pub diff_id: Digest,
}

/// Write sink for one layer: bytes are hashed uncompressed (the diff
/// ID), gzip-compressed, hashed again (the blob digest), and staged to
/// a temporary file in the blob directory, all in a single pass.
/// Dropping the writer before [LayerWriter::complete] removes the
/// temporary file; [LayerWriter::cancel] does the same while handing
/// the caller a [Error::Cancelled] to propagate.
pub struct LayerWriter {
    inner: DigestBuf<GzEncoder<DigestBuf<NamedTempFile>>>,
}

impl LayerWriter {
    /// Abandon the layer without storing anything. The staged
    /// temporary file is unlinked, and the returned error reports the
    /// aborted operation to whoever is above the producer.
    pub fn cancel(self, reason: &str) -> Error {
        log::debug!("Cancelled layer write: {}", reason);
        drop(self);
        Error::Cancelled(reason.to_string())
    }

    /// Flush the compressor, store the blob, and return the layer
    /// descriptor plus diff ID.
    pub fn complete(self, dir: &ImageDir) -> Result<Layer> {
        let (encoder, diff_id, tar_size) = self.inner.finish();
        let compressed = encoder.finish()?;
        let (tmp, blob_digest, blob_size) = compressed.finish();
        dir.persist_blob(tmp, &blob_digest)?;
        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .digest(blob_digest.to_string())
            .size(blob_size as i64)
            .build()?;
        log::info!(
            "Layer {} ({} bytes compressed, {} bytes tar), diff id {}",
            blob_digest,
            blob_size,
            tar_size,
            diff_id
        );
        Ok(Layer {
            descriptor,
            diff_id,
        })
    }
}

impl Write for LayerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Initialize a repository at `path`; with a tag, also write an empty
/// image (no layers, empty config) bound to it.
pub fn create_image(path: &Path, tag: Option<&RefName>) -> Result<ImageDir> {
    let dir = ImageDir::create(path)?;
    if let Some(tag) = tag {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let config = ImageConfigurationBuilder::default()
            .created(now)
            .rootfs(
                RootFsBuilder::default()
                    .typ("layers")
                    .diff_ids(Vec::<String>::new())
                    .build()?,
            )
            .build()?;
        let (config_digest, config_size) = dir.put_blob_json(&config)?;
        let config_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(config_digest.to_string())
            .size(config_size as i64)
            .build()?;
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .config(config_desc)
            .layers(Vec::new())
            .build()?;
        let (manifest_digest, manifest_size) = dir.put_blob_json(&manifest)?;
        let manifest_desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(manifest_digest.to_string())
            .size(manifest_size as i64)
            .build()?;
        dir.put_reference(tag, &manifest_desc)?;
    }
    Ok(dir)
}
