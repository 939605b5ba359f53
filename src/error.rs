//! Error types for the build pipeline.

use std::path::PathBuf;

/// Result type alias for build operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or pushing an image.
///
/// Each kind carries a distinct tag so embedders can discriminate without
/// string matching. Only [`Error::SbomGenerationFailed`] is recoverable at
/// the orchestrator level; everything else aborts the build.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Unknown option, contradictory combination, or unreadable config file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context path missing or not a directory.
    #[error("project not found at {path}")]
    ProjectNotFound { path: PathBuf },

    /// Project manifest present but not parseable.
    #[error("project metadata missing or unreadable at {path}: {reason}")]
    ProjectMetadataMissing { path: PathBuf, reason: String },

    /// No entry point determinable with fallbacks disabled.
    #[error("no entry point could be determined for the project")]
    NoEntryPoint,

    // =========================================================================
    // Archive Errors
    // =========================================================================
    /// Archive path escapes the archive root.
    #[error("unsafe archive path: {path}")]
    UnsafePath { path: String },

    /// Two entries resolved to the same archive path.
    #[error("duplicate archive entry: {path}")]
    DuplicateEntry { path: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Non-retriable HTTP failure after retries were exhausted.
    #[error("registry returned {status} for {endpoint}")]
    RegistryHttp { status: u16, endpoint: String },

    /// Credentials exhausted without success.
    #[error("authentication failed for registry {host}")]
    AuthFailure { host: String },

    /// Integrity violation; always fatal.
    #[error("digest mismatch: expected {expected}, actual {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Index lookup failed for the requested platform.
    #[error("no manifest for platform {wanted} (offered: {offered})")]
    NoMatchingPlatform { wanted: String, offered: String },

    /// User platform conflicts with the base image platform.
    #[error("requested platform {requested} conflicts with base image platform {base}")]
    PlatformMismatch { requested: String, base: String },

    /// Terminal push error.
    #[error("push failed: {0}")]
    PushFailed(String),

    /// Blob exceeded a size limit.
    #[error("blob exceeds size limit: {size} > {limit} bytes")]
    BlobTooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Cache initialization failed.
    #[error("failed to initialize cache at {path}: {reason}")]
    CacheInitFailed { path: PathBuf, reason: String },

    /// Blob not found in the cache.
    #[error("blob not found in cache: {digest}")]
    BlobNotFound { digest: String },

    // =========================================================================
    // I/O & Serialization Errors
    // =========================================================================
    /// Filesystem failure with the path that caused it.
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // SBOM Errors
    // =========================================================================
    /// SBOM generation failed; reported as a warning when SBOM is optional.
    #[error("SBOM generation failed: {0}")]
    SbomGenerationFailed(String),
}

impl Error {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }

    /// True for errors the orchestrator may downgrade to a warning.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SbomGenerationFailed(_))
    }
}
