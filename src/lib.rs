//! # pyoci
//!
//! **Daemonless OCI Image Builder for Python Projects**
//!
//! This crate turns a Python source tree plus its project metadata into
//! an on-disk OCI Image Layout, optionally pushing the result to a
//! Registry-v2 registry. No container runtime, privileged daemon, or
//! host build tool is involved: layers are deterministic tars written
//! directly, and the registry protocol is spoken over plain HTTPS.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            pyoci                                 │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  BuildPlan (config file + overrides + detected defaults)         │
//! │        │                                                         │
//! │  ┌─────┴──────────┐      ┌──────────────────────────────┐        │
//! │  │ Introspector   │      │ Base image resolver          │        │
//! │  │ pyproject.toml │      │ manifest/index -> config ->  │        │
//! │  │ frameworks     │      │ layers (into cache)          │        │
//! │  └─────┬──────────┘      └───────────┬──────────────────┘        │
//! │        │                             │                           │
//! │  ┌─────┴─────────────────────────────┴───────────────┐           │
//! │  │ Layer builder: deterministic tar, dual hashing    │           │
//! │  │ (diff_id + digest), sidecar-keyed reuse           │           │
//! │  └─────┬─────────────────────────────────────────────┘           │
//! │        │                                                         │
//! │  ┌─────┴──────────────┐   ┌───────────────────────────┐          │
//! │  │ Config merger +    │   │ Content-addressed cache   │          │
//! │  │ manifest synthesis │   │ LRU sweep, pin table      │          │
//! │  └─────┬──────────────┘   └───────────────────────────┘          │
//! │        │                                                         │
//! │  Image Layout writer  ──►  optional push (Registry v2)           │
//! │                            optional SBOM (SPDX / CycloneDX)      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Determinism
//!
//! Under `reproducible=true` (the default) two builds over identical
//! input trees produce byte-identical layers, config, and manifest:
//!
//! - tar entries are emitted in lexicographic order with pinned mtimes
//!   and fixed ownership,
//! - JSON blobs are canonical (sorted keys, no whitespace),
//! - the exclude policy is fixed, so stray editor artifacts cannot leak
//!   into a layer.
//!
//! # Example
//!
//! ```rust,ignore
//! use pyoci::{BuildPlan, ImageBuilder, PlanOverrides};
//!
//! #[tokio::main]
//! async fn main() -> pyoci::Result<()> {
//!     let plan = BuildPlan::assemble(
//!         std::path::Path::new("."),
//!         PlanOverrides {
//!             tag: Some("ghcr.io/acme/demo:v1".into()),
//!             push: Some(true),
//!             ..Default::default()
//!         },
//!     )?;
//!
//!     let report = ImageBuilder::new(plan)?.build().await?;
//!     println!("layout at {}", report.layout_path.display());
//!     Ok(())
//! }
//! ```
//!
//! # Security Model
//!
//! - Registry blobs are verified against their digests while streaming;
//!   any deviation aborts the build ([`Error::DigestMismatch`]).
//! - Archive paths and symlink targets are contained to the archive
//!   root ([`Error::UnsafePath`]).
//! - Image references are length- and charset-validated before use.
//! - Plain HTTP is allowed only for localhost and explicitly listed
//!   insecure hosts.

// =============================================================================
// Internal Modules
// =============================================================================

mod auth;
mod baseimage;
mod builder;
mod cache;
mod config;
mod constants;
mod digest;
mod error;
mod framework;
mod layers;
mod layout;
mod oci;
mod project;
mod registry;
mod sbom;
mod tarball;

// =============================================================================
// Public API
// =============================================================================

pub use crate::auth::{
    AuthChain, AuthProvider, AzureCliProvider, Credential, DockerConfigProvider, EnvProvider,
    ExplicitProvider,
};
pub use crate::baseimage::{resolve_base, ResolvedBase};
pub use crate::builder::{BuildReport, ImageBuilder};
pub use crate::cache::{CacheEntry, CacheKind, CacheStats, LayerCache, LayerSources, SourceFile};
pub use crate::config::{BuildPlan, PlanOverrides, RegistryCredentials, SbomFormat};
pub use crate::digest::{Digest, DigestVerifier, HashingReader, HashingWriter};
pub use crate::error::{Error, Result};
pub use crate::framework::{detect_framework, framework_defaults, Framework, FrameworkDefaults};
pub use crate::layers::{build_app_layer, build_deps_layer, BuiltLayer, LayerKind};
pub use crate::layout::{write_layout, LayoutContents};
pub use crate::oci::{
    canonical_json, config_blob, Descriptor, ExecutionConfig, HistoryEntry, ImageConfig,
    ImageIndex, Manifest, Platform, RootFs,
};
pub use crate::project::{DepsSource, ProjectMetadata};
pub use crate::registry::{
    parse_www_authenticate, BearerChallenge, ImageReference, PulledManifest, RegistryClient,
};
pub use crate::sbom::{enumerate_packages, generate_sbom, write_sbom, Package};
pub use crate::tarball::{LayerTarball, TarSummary};

/// Protocol and limit constants consumers may want to reference.
pub mod limits {
    pub use crate::constants::{
        DEFAULT_CACHE_CAPACITY, DEFAULT_PLATFORM, DEFAULT_WORKDIR, MAX_CONCURRENT_DOWNLOADS,
        MAX_CONCURRENT_UPLOADS, MAX_IMAGE_REF_LEN, MAX_LAYERS, MAX_LAYER_SIZE, MAX_MANIFEST_SIZE,
        MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_TAR,
        MEDIA_TYPE_MANIFEST, MONOLITHIC_UPLOAD_LIMIT, REGISTRY_MAX_ATTEMPTS, UPLOAD_CHUNK_SIZE,
    };
}
