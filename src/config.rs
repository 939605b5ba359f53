//! Build plan assembly.
//!
//! The plan is the merged, validated configuration a build runs from.
//! Values come from three places, in descending precedence:
//!
//! 1. explicit overrides handed in by the embedder (CLI, API, plugin),
//! 2. the project config file (`pyoci.toml`, `[build]` section),
//! 3. auto-detected defaults.
//!
//! Unknown or contradictory options fail fast with
//! [`Error::InvalidConfig`]; nothing is silently ignored. Once built the
//! plan is immutable for the duration of the build.

use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_PLATFORM, DEFAULT_WORKDIR, ENV_SOURCE_DATE_EPOCH, REQUIREMENTS_FILE,
};
use crate::error::{Error, Result};
use crate::oci::Platform;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// SBOM document schema to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbomFormat {
    Spdx,
    CycloneDx,
}

impl SbomFormat {
    /// Parses a schema identifier.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "spdx" => Ok(SbomFormat::Spdx),
            "cyclonedx" => Ok(SbomFormat::CycloneDx),
            other => Err(Error::InvalidConfig(format!(
                "unsupported SBOM format '{}', expected 'spdx' or 'cyclonedx'",
                other
            ))),
        }
    }

    /// File-name infix for the emitted document.
    pub fn file_stem(&self) -> &'static str {
        match self {
            SbomFormat::Spdx => "spdx",
            SbomFormat::CycloneDx => "cyclonedx",
        }
    }
}

/// Explicit registry credentials carried in the plan.
#[derive(Debug, Clone, Default)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl RegistryCredentials {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none() && self.token.is_none()
    }
}

/// The merged, validated build configuration.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub tag: String,
    pub context_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workdir: String,
    /// True when the workdir came from the user rather than the
    /// default; an explicit workdir beats the base image's.
    pub workdir_explicit: bool,
    /// Ordered `KEY=VALUE` pairs; order is preserved through the env
    /// merge.
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    /// Explicit include set; `None` means use the introspector's.
    pub include_paths: Option<Vec<PathBuf>>,
    /// Explicit entrypoint; overrides every other source.
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub user: Option<String>,
    pub base_image: Option<String>,
    pub include_deps: bool,
    pub requirements_file: String,
    pub platform: Platform,
    pub push: bool,
    /// Optional override for the push authority.
    pub registry: Option<String>,
    pub credentials: RegistryCredentials,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,
    pub reproducible: bool,
    /// Explicit reproducible timestamp; wins over the epoch-zero
    /// default when `reproducible` is on.
    pub source_date_epoch: Option<u64>,
    pub generate_sbom: Option<SbomFormat>,
    /// Hosts the registry client may reach over plain HTTP.
    pub insecure_hosts: Vec<String>,
    pub verbose: bool,
    pub dry_run: bool,
}

/// Values the embedder wants to force, all optional.
///
/// `None` fields fall through to the config file and then to defaults.
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    pub tag: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub include_paths: Option<Vec<PathBuf>>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub user: Option<String>,
    pub base_image: Option<String>,
    pub include_deps: Option<bool>,
    pub requirements_file: Option<String>,
    pub platform: Option<String>,
    pub push: Option<bool>,
    pub registry: Option<String>,
    pub credentials: Option<RegistryCredentials>,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: Option<bool>,
    pub reproducible: Option<bool>,
    pub source_date_epoch: Option<u64>,
    pub generate_sbom: Option<String>,
    pub insecure_hosts: Option<Vec<String>>,
    pub verbose: Option<bool>,
    pub dry_run: Option<bool>,
}

/// Values parsed from the `[build]` section of `pyoci.toml`.
#[derive(Debug, Clone, Default)]
struct FileConfig {
    tag: Option<String>,
    output_dir: Option<PathBuf>,
    workdir: Option<String>,
    env: Vec<(String, String)>,
    labels: BTreeMap<String, String>,
    include_paths: Option<Vec<PathBuf>>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    user: Option<String>,
    base_image: Option<String>,
    include_deps: Option<bool>,
    requirements_file: Option<String>,
    platform: Option<String>,
    push: Option<bool>,
    registry: Option<String>,
    credentials: RegistryCredentials,
    cache_dir: Option<PathBuf>,
    no_cache: Option<bool>,
    reproducible: Option<bool>,
    source_date_epoch: Option<u64>,
    generate_sbom: Option<String>,
    insecure_hosts: Option<Vec<String>>,
    verbose: Option<bool>,
    dry_run: Option<bool>,
}

impl BuildPlan {
    /// Assembles and validates the plan for a context directory.
    ///
    /// Reads `pyoci.toml` from the context root when present, overlays
    /// `overrides`, applies defaults, and validates the result.
    pub fn assemble(context_dir: &Path, overrides: PlanOverrides) -> Result<Self> {
        let file = load_config_file(&context_dir.join(CONFIG_FILE_NAME))?;

        let tag = overrides
            .tag
            .or(file.tag)
            .ok_or_else(|| Error::InvalidConfig("a tag is required".to_string()))?;
        if tag.trim().is_empty() {
            return Err(Error::InvalidConfig("tag must not be empty".to_string()));
        }

        let platform_str = overrides
            .platform
            .or(file.platform)
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());
        let platform = Platform::parse(&platform_str)?;

        let generate_sbom = match overrides.generate_sbom.or(file.generate_sbom) {
            Some(s) => Some(SbomFormat::parse(&s)?),
            None => None,
        };

        // File env first, then override env; later duplicates replace
        // earlier ones while keeping the first-occurrence position.
        let mut env = file.env;
        for (k, v) in overrides.env {
            if let Some(slot) = env.iter_mut().find(|(key, _)| *key == k) {
                slot.1 = v;
            } else {
                env.push((k, v));
            }
        }

        let mut labels = file.labels;
        labels.extend(overrides.labels);

        let credentials = overrides.credentials.unwrap_or(file.credentials);

        // Explicit timestamp > SOURCE_DATE_EPOCH > epoch zero. The env
        // fallback only applies to reproducible builds so a stray
        // variable cannot invalidate a non-reproducible plan.
        let reproducible = overrides.reproducible.or(file.reproducible).unwrap_or(true);
        let source_date_epoch = overrides
            .source_date_epoch
            .or(file.source_date_epoch)
            .or_else(|| {
                if reproducible {
                    std::env::var(ENV_SOURCE_DATE_EPOCH)
                        .ok()
                        .and_then(|v| v.parse().ok())
                } else {
                    None
                }
            });

        let explicit_workdir = overrides.workdir.or(file.workdir);
        let workdir_explicit = explicit_workdir.is_some();
        let workdir = explicit_workdir.unwrap_or_else(|| DEFAULT_WORKDIR.to_string());
        if !workdir.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "workdir must be absolute, got '{}'",
                workdir
            )));
        }

        let plan = BuildPlan {
            tag,
            context_dir: context_dir.to_path_buf(),
            output_dir: overrides
                .output_dir
                .or(file.output_dir)
                .unwrap_or_else(|| context_dir.join("dist").join("image")),
            workdir,
            workdir_explicit,
            env,
            labels,
            include_paths: overrides.include_paths.or(file.include_paths),
            entrypoint: overrides.entrypoint.or(file.entrypoint),
            cmd: overrides.cmd.or(file.cmd),
            user: overrides.user.or(file.user),
            base_image: overrides.base_image.or(file.base_image),
            include_deps: overrides.include_deps.or(file.include_deps).unwrap_or(false),
            requirements_file: overrides
                .requirements_file
                .or(file.requirements_file)
                .unwrap_or_else(|| REQUIREMENTS_FILE.to_string()),
            platform,
            push: overrides.push.or(file.push).unwrap_or(false),
            registry: overrides.registry.or(file.registry),
            credentials,
            cache_dir: overrides.cache_dir.or(file.cache_dir),
            no_cache: overrides.no_cache.or(file.no_cache).unwrap_or(false),
            reproducible,
            source_date_epoch,
            generate_sbom,
            insecure_hosts: overrides
                .insecure_hosts
                .or(file.insecure_hosts)
                .unwrap_or_default(),
            verbose: overrides.verbose.or(file.verbose).unwrap_or(false),
            dry_run: overrides.dry_run.or(file.dry_run).unwrap_or(false),
        };

        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if let Some(entry) = &self.entrypoint {
            if entry.is_empty() {
                return Err(Error::InvalidConfig(
                    "entrypoint override must not be empty".to_string(),
                ));
            }
        }

        if self.source_date_epoch.is_some() && !self.reproducible {
            return Err(Error::InvalidConfig(
                "source_date_epoch requires reproducible builds".to_string(),
            ));
        }

        for (key, _) in &self.env {
            if key.is_empty() || key.contains('=') {
                return Err(Error::InvalidConfig(format!(
                    "invalid environment key '{}'",
                    key
                )));
            }
        }

        Ok(())
    }

    /// The mtime every archive entry gets, or `None` to preserve source
    /// mtimes. Explicit `source_date_epoch` wins over the epoch-zero
    /// reproducible default.
    pub fn layer_mtime(&self) -> Option<u64> {
        if let Some(epoch) = self.source_date_epoch {
            Some(epoch)
        } else if self.reproducible {
            Some(0)
        } else {
            None
        }
    }

    /// Archive prefix derived from the workdir (`/app` -> `app`).
    pub fn archive_prefix(&self) -> String {
        self.workdir.trim_matches('/').to_string()
    }
}

/// Loads and validates the `pyoci.toml` document.
///
/// A missing file yields defaults; an unreadable or unknown-keyed file
/// is an error.
fn load_config_file(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let text = fs::read_to_string(path)
        .map_err(|e| Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e)))?;
    let doc: toml::Table = text
        .parse()
        .map_err(|e: toml::de::Error| {
            Error::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;

    for key in doc.keys() {
        if key != "build" && key != "registry" {
            return Err(Error::InvalidConfig(format!(
                "unknown section [{}] in {}",
                key, CONFIG_FILE_NAME
            )));
        }
    }

    let mut cfg = FileConfig::default();

    if let Some(build) = doc.get("build").and_then(|v| v.as_table()) {
        for (raw_key, value) in build {
            // Kebab-case keys are accepted and normalized.
            let key = raw_key.replace('-', "_");
            match key.as_str() {
                "tag" => cfg.tag = Some(expect_str(raw_key, value)?),
                "output_dir" => cfg.output_dir = Some(PathBuf::from(expect_str(raw_key, value)?)),
                "workdir" => cfg.workdir = Some(expect_str(raw_key, value)?),
                "base_image" => cfg.base_image = Some(expect_str(raw_key, value)?),
                "user" => cfg.user = Some(expect_str(raw_key, value)?),
                "requirements_file" => cfg.requirements_file = Some(expect_str(raw_key, value)?),
                "platform" => cfg.platform = Some(expect_str(raw_key, value)?),
                "registry" => cfg.registry = Some(expect_str(raw_key, value)?),
                "generate_sbom" => cfg.generate_sbom = Some(expect_str(raw_key, value)?),
                "cache_dir" => cfg.cache_dir = Some(PathBuf::from(expect_str(raw_key, value)?)),
                "entrypoint" => cfg.entrypoint = Some(expect_str_array(raw_key, value)?),
                "cmd" => cfg.cmd = Some(expect_str_array(raw_key, value)?),
                "include_paths" => {
                    cfg.include_paths = Some(
                        expect_str_array(raw_key, value)?
                            .into_iter()
                            .map(PathBuf::from)
                            .collect(),
                    )
                }
                "insecure_hosts" => cfg.insecure_hosts = Some(expect_str_array(raw_key, value)?),
                "include_deps" => cfg.include_deps = Some(expect_bool(raw_key, value)?),
                "push" => cfg.push = Some(expect_bool(raw_key, value)?),
                "no_cache" => cfg.no_cache = Some(expect_bool(raw_key, value)?),
                "reproducible" => cfg.reproducible = Some(expect_bool(raw_key, value)?),
                "verbose" => cfg.verbose = Some(expect_bool(raw_key, value)?),
                "dry_run" => cfg.dry_run = Some(expect_bool(raw_key, value)?),
                "source_date_epoch" => {
                    let n = value.as_integer().ok_or_else(|| {
                        Error::InvalidConfig(format!("'{}' must be an integer", raw_key))
                    })?;
                    if n < 0 {
                        return Err(Error::InvalidConfig(
                            "source_date_epoch must not be negative".to_string(),
                        ));
                    }
                    cfg.source_date_epoch = Some(n as u64);
                }
                "env" => {
                    let table = value.as_table().ok_or_else(|| {
                        Error::InvalidConfig("[build.env] must be a table".to_string())
                    })?;
                    for (k, v) in table {
                        cfg.env.push((k.clone(), expect_str(k, v)?));
                    }
                }
                "labels" => {
                    let table = value.as_table().ok_or_else(|| {
                        Error::InvalidConfig("[build.labels] must be a table".to_string())
                    })?;
                    for (k, v) in table {
                        cfg.labels.insert(k.clone(), expect_str(k, v)?);
                    }
                }
                unknown => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown key '{}' in [build]",
                        unknown
                    )));
                }
            }
        }
    }

    if let Some(registry) = doc.get("registry").and_then(|v| v.as_table()) {
        for (key, value) in registry {
            match key.as_str() {
                "username" => cfg.credentials.username = Some(expect_str(key, value)?),
                "password" => cfg.credentials.password = Some(expect_str(key, value)?),
                "token" => cfg.credentials.token = Some(expect_str(key, value)?),
                unknown => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown key '{}' in [registry]",
                        unknown
                    )));
                }
            }
        }
    }

    debug!("loaded config file {}", path.display());
    Ok(cfg)
}

fn expect_str(key: &str, value: &toml::Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidConfig(format!("'{}' must be a string", key)))
}

fn expect_bool(key: &str, value: &toml::Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::InvalidConfig(format!("'{}' must be a boolean", key)))
}

fn expect_str_array(key: &str, value: &toml::Value) -> Result<Vec<String>> {
    let array = value
        .as_array()
        .ok_or_else(|| Error::InvalidConfig(format!("'{}' must be an array of strings", key)))?;
    array
        .iter()
        .map(|v| expect_str(key, v))
        .collect()
}
