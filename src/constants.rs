//! Constants for the build pipeline and registry client.
//!
//! All limits, timeouts, media types, and well-known names are defined
//! here to ensure consistency and prevent magic numbers throughout the
//! codebase.

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum OCI image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single layer blob (512 MiB).
/// Prevents disk exhaustion from malicious base images.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum number of layers in an image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Blobs at or below this size are uploaded monolithically; larger blobs
/// go through the chunked upload path.
pub const MONOLITHIC_UPLOAD_LIMIT: u64 = 16 * 1024 * 1024;

/// Chunk size for chunked blob uploads (8 MiB).
pub const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default cache capacity before LRU eviction kicks in (5 GiB).
pub const DEFAULT_CACHE_CAPACITY: u64 = 5 * 1024 * 1024 * 1024;

// =============================================================================
// Timeouts & Retry Policy
// =============================================================================

/// Connect timeout for registry requests.
pub const REGISTRY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Whole-body timeout for a single registry request.
pub const REGISTRY_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Hard timeout for cloud CLI credential helpers.
pub const CLOUD_CLI_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum attempts for a retriable (5xx / transport) registry request.
pub const REGISTRY_MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff between retries.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the backoff delay.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Age after which orphaned temp files in the cache are swept.
pub const TEMP_FILE_GRACE_PERIOD: Duration = Duration::from_secs(3600);

// =============================================================================
// Concurrency
// =============================================================================

/// Maximum concurrent blob uploads during a push.
pub const MAX_CONCURRENT_UPLOADS: usize = 4;

/// Maximum concurrent base-layer downloads during a pull.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Image Manifest media type.
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Index media type.
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI Image Config media type.
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (uncompressed tar).
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// OCI Layer media type (gzip compressed).
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker manifest v2 schema 2 media type (accepted on pull).
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker manifest list media type (accepted on pull).
pub const MEDIA_TYPE_DOCKER_INDEX: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image config media type (accepted on pull).
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Docker layer media type (accepted on pull).
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

// =============================================================================
// Annotations & Labels
// =============================================================================

/// Annotation carrying the tag on the layout index descriptor.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Label applied when a framework is auto-detected.
pub const LABEL_FRAMEWORK: &str = "framework";

/// Base images carrying this label are treated as shell-less.
pub const LABEL_DISTROLESS: &str = "dev.pyoci.distroless";

// =============================================================================
// Registry Hosts
// =============================================================================

/// Docker Hub alias; rewritten to the real v2 endpoint host.
pub const DOCKER_IO_HOST: &str = "docker.io";

/// Actual Docker Hub registry endpoint.
pub const DOCKER_IO_REGISTRY: &str = "registry-1.docker.io";

/// Host suffix that activates the Azure CLI auth provider.
pub const AZURE_REGISTRY_SUFFIX: &str = "azurecr.io";

/// Host fragment that activates the GitHub token env provider.
pub const GITHUB_REGISTRY_HOST: &str = "ghcr.io";

// =============================================================================
// Environment Variables
// =============================================================================

/// GitHub container registry token.
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

/// Generic registry bearer token.
pub const ENV_REGISTRY_TOKEN: &str = "REGISTRY_TOKEN";

/// Generic registry username.
pub const ENV_REGISTRY_USERNAME: &str = "REGISTRY_USERNAME";

/// Generic registry password.
pub const ENV_REGISTRY_PASSWORD: &str = "REGISTRY_PASSWORD";

/// Reproducible-build timestamp override, seconds since the epoch.
pub const ENV_SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

// =============================================================================
// File & Directory Names
// =============================================================================

/// Project config file read from the context root.
pub const CONFIG_FILE_NAME: &str = "pyoci.toml";

/// Python project manifest.
pub const PYPROJECT_FILE: &str = "pyproject.toml";

/// Conventional requirements file name.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Marker file implying a Django project.
pub const DJANGO_MANAGE_FILE: &str = "manage.py";

/// Subdirectory of the cache root holding content-addressed blobs.
pub const CACHE_BLOBS_DIR: &str = "blobs";

/// Cache index file name.
pub const CACHE_INDEX_FILE: &str = "index.json";

/// Subdirectory of the cache root holding layer source sidecars.
pub const CACHE_SIDECAR_DIR: &str = "layers";

/// Default cache directory name under the user cache dir.
pub const CACHE_DIR_NAME: &str = "pyoci";

/// Virtualenv directory names probed in order.
pub const VENV_DIR_NAMES: &[&str] = &["venv", ".venv", "env"];

// =============================================================================
// Image Defaults
// =============================================================================

/// Default working directory (and archive prefix) inside the image.
pub const DEFAULT_WORKDIR: &str = "/app";

/// Default target platform.
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// Interpreter argv head for script-derived entrypoints.
pub const PYTHON_INTERPRETER: &str = "python";

/// Fallback entrypoint module when nothing else is derivable.
pub const FALLBACK_ENTRY_MODULE: &str = "app";

/// Directory names excluded from the application layer regardless of the
/// include set.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "__pycache__",
    ".git",
    ".hg",
    ".svn",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".idea",
    ".vscode",
    ".tox",
    ".cache",
    "venv",
    ".venv",
    "env",
    "dist",
    "node_modules",
];

/// File suffixes excluded from the application layer.
pub const DEFAULT_EXCLUDE_SUFFIXES: &[&str] = &[".pyc", ".pyo", ".swp", ".swo"];

/// OCI image layout marker content.
pub const OCI_LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}";
