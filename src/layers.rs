//! Layer materialization.
//!
//! Builds the dependency and application layers. Base layers are never
//! built here; they arrive from the registry via the base image
//! resolver. Built layers are gzipped tars whose uncompressed stream is
//! hashed for the diff_id and whose compressed bytes are hashed for the
//! descriptor digest, both in one streaming pass through the cache.
//!
//! Every layer's input set is recorded in a cache sidecar as
//! `(archive_path, size, content_hash)` tuples. A later build with an
//! identical input set reuses the cached blob without re-packing;
//! touching a file's mtime alone does not bust the cache.

use crate::cache::{CacheKind, LayerCache, LayerSources, SourceFile};
use crate::config::BuildPlan;
use crate::constants::{DEFAULT_EXCLUDES, DEFAULT_EXCLUDE_SUFFIXES, MEDIA_TYPE_LAYER_GZIP};
use crate::digest::{Digest, HashingReader};
use crate::error::{Error, Result};
use crate::oci::Descriptor;
use crate::project::{DepsSource, ProjectMetadata};
use crate::tarball::LayerTarball;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Which pipeline stage produced a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Dependencies,
    Application,
}

/// A locally built layer, installed in the cache.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub descriptor: Descriptor,
    pub diff_id: Digest,
    pub kind: LayerKind,
}

/// One entry destined for a layer archive.
#[derive(Debug, Clone)]
struct LayerEntry {
    archive_path: String,
    source: PathBuf,
}

/// Builds the dependency layer, if the plan asks for one and a source
/// exists.
///
/// `prefix` is the archive prefix derived from the effective workdir.
/// A virtualenv contributes its `site-packages` tree under
/// `<workdir>/site-packages/`; otherwise the requirements file is
/// packaged verbatim. Resolution of requirements into installed
/// packages is an external concern and never happens here.
pub fn build_deps_layer(
    plan: &BuildPlan,
    metadata: &ProjectMetadata,
    cache: &LayerCache,
    prefix: &str,
) -> Result<Option<BuiltLayer>> {
    if !plan.include_deps {
        return Ok(None);
    }

    let entries = match &metadata.deps_source {
        DepsSource::Virtualenv(venv) => {
            let site_packages = find_site_packages(venv).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "virtualenv at {} has no site-packages directory",
                    venv.display()
                ))
            })?;
            collect_tree(&site_packages, "site-packages")?
        }
        DepsSource::RequirementsFile(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "requirements.txt".to_string());
            vec![LayerEntry {
                archive_path: name,
                source: path.clone(),
            }]
        }
        DepsSource::None => {
            debug!("include_deps set but no dependency source detected");
            return Ok(None);
        }
    };

    let layer = materialize(plan, cache, prefix, entries, LayerKind::Dependencies)?;
    Ok(Some(layer))
}

/// Builds the application layer from the include set.
///
/// Compiled caches, VCS metadata, editor artifacts, and virtualenvs are
/// excluded by a fixed policy so identical source yields identical
/// bytes.
pub fn build_app_layer(
    plan: &BuildPlan,
    metadata: &ProjectMetadata,
    cache: &LayerCache,
    prefix: &str,
) -> Result<BuiltLayer> {
    let includes = plan
        .include_paths
        .clone()
        .unwrap_or_else(|| metadata.include_paths.clone());

    let mut entries = Vec::new();
    for include in &includes {
        let whole_context = include.as_path() == Path::new(".");
        let absolute = if whole_context {
            metadata.context_root.clone()
        } else {
            metadata.context_root.join(include)
        };

        if absolute.is_dir() {
            let under = if whole_context {
                String::new()
            } else {
                include.to_string_lossy().replace('\\', "/")
            };
            entries.extend(collect_tree(&absolute, &under)?);
        } else if absolute.is_file() {
            entries.push(LayerEntry {
                archive_path: include.to_string_lossy().replace('\\', "/"),
                source: absolute,
            });
        }
        // A configured include that matches nothing is simply skipped;
        // the introspector only hands over paths it saw exist.
    }

    materialize(plan, cache, prefix, entries, LayerKind::Application)
}

/// Packs entries into a gzipped tar through the cache, reusing a cached
/// blob when the source tuples match a sidecar.
fn materialize(
    plan: &BuildPlan,
    cache: &LayerCache,
    prefix: &str,
    entries: Vec<LayerEntry>,
    kind: LayerKind,
) -> Result<BuiltLayer> {
    let sources = source_tuples(prefix, &entries)?;

    if !plan.no_cache {
        if let Some(hit) = cache.lookup_layer_sources(&sources) {
            info!("layer reused from cache ({})", hit.digest);
            return Ok(BuiltLayer {
                descriptor: Descriptor::new(MEDIA_TYPE_LAYER_GZIP, hit.digest, hit.size),
                diff_id: hit.diff_id,
                kind,
            });
        }
    }

    let mut tarball = LayerTarball::new(prefix, plan.layer_mtime());
    for entry in &entries {
        tarball.add_path(&entry.archive_path, &entry.source)?;
    }

    let tmp = cache.temp_path();
    let file = fs::File::create(&tmp).map_err(|e| Error::io_at(&tmp, e))?;
    let summary = match tarball.write_to(file, true) {
        Ok(summary) => summary,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };

    cache.install_temp(&tmp, &summary.digest, summary.size, CacheKind::Layer)?;
    if !plan.no_cache {
        cache.record_layer_sources(&LayerSources {
            digest: summary.digest.clone(),
            diff_id: summary.diff_id.clone(),
            size: summary.size,
            sources,
        })?;
    }

    info!(
        "built {:?} layer {} ({} bytes, {} entries)",
        kind,
        summary.digest,
        summary.size,
        entries.len()
    );

    Ok(BuiltLayer {
        descriptor: Descriptor::new(MEDIA_TYPE_LAYER_GZIP, summary.digest, summary.size),
        diff_id: summary.diff_id,
        kind,
    })
}

/// Walks a directory collecting includable files, sorted by archive
/// path. `under` prefixes every archive path ("" for the tree root).
fn collect_tree(root: &Path, under: &str) -> Result<Vec<LayerEntry>> {
    let mut entries = Vec::new();
    walk(root, root, under, &mut entries)?;
    entries.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
    Ok(entries)
}

fn walk(root: &Path, dir: &Path, under: &str, out: &mut Vec<LayerEntry>) -> Result<()> {
    let listing = fs::read_dir(dir).map_err(|e| Error::io_at(dir, e))?;

    for entry in listing {
        let entry = entry.map_err(|e| Error::io_at(dir, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        let file_type = entry.file_type().map_err(|e| Error::io_at(&path, e))?;

        if file_type.is_dir() {
            if is_excluded_dir(&name) {
                continue;
            }
            walk(root, &path, under, out)?;
            continue;
        }

        if is_excluded_file(&name) {
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .map_err(|_| Error::UnsafePath {
                path: path.to_string_lossy().into_owned(),
            })?
            .to_string_lossy()
            .replace('\\', "/");

        let archive_path = if under.is_empty() {
            rel
        } else {
            format!("{}/{}", under, rel)
        };

        out.push(LayerEntry {
            archive_path,
            source: path,
        });
    }

    Ok(())
}

fn is_excluded_dir(name: &str) -> bool {
    DEFAULT_EXCLUDES.contains(&name)
}

fn is_excluded_file(name: &str) -> bool {
    DEFAULT_EXCLUDE_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// Computes the invalidation tuples for a set of entries. Symlinks hash
/// their stored target; regular files hash their content.
fn source_tuples(prefix: &str, entries: &[LayerEntry]) -> Result<Vec<SourceFile>> {
    let mut tuples = Vec::with_capacity(entries.len());

    for entry in entries {
        let meta =
            fs::symlink_metadata(&entry.source).map_err(|e| Error::io_at(&entry.source, e))?;

        let (size, content) = if meta.file_type().is_symlink() {
            let target = fs::read_link(&entry.source).map_err(|e| Error::io_at(&entry.source, e))?;
            let target = target.to_string_lossy().into_owned();
            (target.len() as u64, Digest::from_bytes(target.as_bytes()))
        } else {
            let file = fs::File::open(&entry.source).map_err(|e| Error::io_at(&entry.source, e))?;
            let mut reader = HashingReader::new(file);
            std::io::copy(&mut reader, &mut std::io::sink())
                .map_err(|e| Error::io_at(&entry.source, e))?;
            let (_, digest, size) = reader.finalize();
            (size, digest)
        };

        tuples.push(SourceFile {
            archive_path: format!("{}/{}", prefix, entry.archive_path),
            size,
            content,
        });
    }

    Ok(tuples)
}

/// Locates `lib/<python>/site-packages` inside a virtualenv, probing
/// interpreter directories in lexicographic order.
fn find_site_packages(venv: &Path) -> Option<PathBuf> {
    // Windows-style venvs keep it directly under Lib/.
    let windows = venv.join("Lib").join("site-packages");
    if windows.is_dir() {
        return Some(windows);
    }

    let lib = venv.join("lib");
    let mut candidates: Vec<PathBuf> = fs::read_dir(&lib)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("python"))
                    .unwrap_or(false)
        })
        .collect();
    candidates.sort();

    for candidate in candidates {
        let site = candidate.join("site-packages");
        if site.is_dir() {
            return Some(site);
        }
    }
    None
}
