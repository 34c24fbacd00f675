use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory is not an OCI image layout, or carries an
    /// incompatible `imageLayoutVersion`.
    #[error("Corrupt image layout at {path}: {reason}")]
    CorruptLayout { path: PathBuf, reason: String },

    /// A blob, reference, or file that should be present is not.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored content does not hash to its claimed digest.
    #[error("Digest mismatch: expected {expected}, found {found}")]
    DigestMismatch { expected: String, found: String },

    /// A descriptor points at a media type this crate does not handle,
    /// e.g. a multi-arch image index.
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Malformed JSON document: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// An uid/gid mapping that is not `container:host:length`.
    #[error("Malformed id mapping: {0}")]
    MalformedMapping(String),

    /// The metadata manifest text could not be parsed.
    #[error("Malformed metadata manifest at line {line}: {reason}")]
    MalformedManifestFile { line: usize, reason: String },

    /// The bundle has no metadata manifest for the image it was
    /// unpacked from, so there is nothing to diff against.
    #[error("No metadata manifest found at {0}; was this bundle unpacked from the image?")]
    MissingBundleState(PathBuf),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid reference to image: {0}")]
    InvalidReference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The operation was aborted by an upstream consumer.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means "the named thing does not exist", as
    /// opposed to a real failure. Deleting a missing reference during
    /// repack is tolerated through this.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<oci_spec::OciSpecError> for Error {
    fn from(e: oci_spec::OciSpecError) -> Self {
        match e {
            oci_spec::OciSpecError::SerDe(e) => Error::MalformedJson(e),
            oci_spec::OciSpecError::Io(e) => Error::Io(e),
            other => Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        }
    }
}
