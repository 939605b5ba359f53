//! OCI Image Layout writer.
//!
//! Emits the on-disk layout:
//!
//! ```text
//! <root>/
//!   oci-layout                       # {"imageLayoutVersion":"1.0.0"}
//!   index.json                       # index referencing the tagged manifest
//!   blobs/sha256/<hex>               # one file per blob
//!   refs/tags/<tag>                  # tag -> manifest digest
//! ```
//!
//! The writer is transactional per layout: everything is staged into a
//! temp directory next to the destination and swapped in with renames.
//! A failure at any step leaves the previous layout untouched and
//! removes the staging directory.

use crate::cache::LayerCache;
use crate::constants::{ANNOTATION_REF_NAME, MEDIA_TYPE_MANIFEST, OCI_LAYOUT_CONTENT};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::oci::{canonical_json, Descriptor, ImageIndex, Platform};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The blobs that make up one tagged image.
pub struct LayoutContents<'a> {
    pub config_bytes: &'a [u8],
    pub config: &'a Descriptor,
    pub manifest_bytes: &'a [u8],
    pub manifest: &'a Descriptor,
    /// Layer descriptors in manifest order; their blobs must be present
    /// in the cache.
    pub layers: &'a [Descriptor],
}

/// Writes a complete image layout at `output`, replacing any previous
/// layout atomically. Returns the layout path.
pub fn write_layout(
    output: &Path,
    cache: &LayerCache,
    contents: &LayoutContents<'_>,
    tag: &str,
    platform: &Platform,
) -> Result<PathBuf> {
    let staging = staging_dir(output)?;

    let result = populate(&staging, cache, contents, tag, platform);
    if let Err(e) = result {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    swap_into_place(&staging, output)?;
    info!(
        "image layout written to {} (manifest {})",
        output.display(),
        contents.manifest.digest
    );
    Ok(output.to_path_buf())
}

fn staging_dir(output: &Path) -> Result<PathBuf> {
    let parent = output.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;

    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let staging = parent.join(format!(".{}.staging-{}", name, uuid::Uuid::now_v7()));
    fs::create_dir_all(staging.join("blobs").join("sha256"))
        .map_err(|e| Error::io_at(&staging, e))?;
    Ok(staging)
}

fn populate(
    staging: &Path,
    cache: &LayerCache,
    contents: &LayoutContents<'_>,
    tag: &str,
    platform: &Platform,
) -> Result<()> {
    write_blob(staging, &contents.config.digest, contents.config_bytes)?;

    for layer in contents.layers {
        install_blob_from_cache(staging, cache, &layer.digest)?;
    }

    write_blob(staging, &contents.manifest.digest, contents.manifest_bytes)?;

    // Index naming the tagged manifest, platform recorded on the
    // descriptor, tag in the standard ref-name annotation.
    let mut manifest_descriptor = Descriptor::new(
        MEDIA_TYPE_MANIFEST,
        contents.manifest.digest.clone(),
        contents.manifest_bytes.len() as u64,
    );
    manifest_descriptor.platform = Some(platform.clone());
    manifest_descriptor
        .annotations
        .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());

    let index = ImageIndex::new(vec![manifest_descriptor]);
    let index_path = staging.join("index.json");
    fs::write(&index_path, canonical_json(&index)?).map_err(|e| Error::io_at(&index_path, e))?;

    let marker = staging.join("oci-layout");
    fs::write(&marker, OCI_LAYOUT_CONTENT).map_err(|e| Error::io_at(&marker, e))?;

    // refs/tags/<tag> keeps only the tag component; the full reference
    // lives in the index annotation.
    let refs_dir = staging.join("refs").join("tags");
    fs::create_dir_all(&refs_dir).map_err(|e| Error::io_at(&refs_dir, e))?;
    let tag_name = tag.rsplit(':').next().unwrap_or(tag).replace('/', "_");
    let ref_path = refs_dir.join(tag_name);
    fs::write(&ref_path, contents.manifest.digest.as_str())
        .map_err(|e| Error::io_at(&ref_path, e))?;

    Ok(())
}

fn write_blob(staging: &Path, digest: &Digest, bytes: &[u8]) -> Result<()> {
    let path = staging.join("blobs").join("sha256").join(digest.hex());
    fs::write(&path, bytes).map_err(|e| Error::io_at(&path, e))?;
    Ok(())
}

/// Hardlinks a cached blob into the layout, copying when the cache
/// lives on another filesystem.
fn install_blob_from_cache(staging: &Path, cache: &LayerCache, digest: &Digest) -> Result<()> {
    if !cache.has(digest) {
        return Err(Error::BlobNotFound {
            digest: digest.to_string(),
        });
    }

    let _pin = cache.pin(digest);
    let source = cache.blob_path(digest);
    let dest = staging.join("blobs").join("sha256").join(digest.hex());

    if fs::hard_link(&source, &dest).is_err() {
        debug!("hardlink unavailable for {}, copying", digest);
        fs::copy(&source, &dest).map_err(|e| Error::io_at(&dest, e))?;
    }
    Ok(())
}

/// Replaces `output` with the staged layout using renames only.
fn swap_into_place(staging: &Path, output: &Path) -> Result<()> {
    let displaced = output.with_extension(format!("old-{}", uuid::Uuid::now_v7()));

    let had_previous = output.exists();
    if had_previous {
        fs::rename(output, &displaced).map_err(|e| {
            let _ = fs::remove_dir_all(staging);
            Error::io_at(output, e)
        })?;
    }

    if let Err(e) = fs::rename(staging, output) {
        // Put the previous layout back before reporting.
        if had_previous {
            let _ = fs::rename(&displaced, output);
        }
        let _ = fs::remove_dir_all(staging);
        return Err(Error::io_at(output, e));
    }

    if had_previous {
        let _ = fs::remove_dir_all(&displaced);
    }
    Ok(())
}
