//! Base image resolution.
//!
//! Pulls the base image manifest (selecting the per-platform manifest
//! when the reference resolves to an index), parses its config, and
//! fetches any missing layer blobs into the cache. Base layers are
//! never rebuilt locally; they are referenced by their existing digests
//! and their diff_ids are lifted from the base config.

use crate::cache::{CacheKind, LayerCache};
use crate::constants::{
    LABEL_DISTROLESS, MAX_CONCURRENT_DOWNLOADS, MAX_LAYERS, MEDIA_TYPE_DOCKER_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST,
};
use crate::error::{Error, Result};
use crate::oci::{Descriptor, ImageConfig, ImageIndex, Manifest, Platform};
use crate::registry::{ImageReference, RegistryClient};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info};

/// Everything the pipeline needs from a resolved base image.
#[derive(Debug, Clone)]
pub struct ResolvedBase {
    /// Layer descriptors in manifest order; blobs are present in the
    /// cache after resolution.
    pub layers: Vec<Descriptor>,
    /// Parsed base image config (env, workdir, entrypoint, diff_ids).
    pub config: ImageConfig,
    /// True when the base is flagged shell-less; the config merger then
    /// avoids shell-dependent entrypoints.
    pub distroless: bool,
}

/// Resolves `reference` for `platform`, filling the cache with its
/// layers.
pub async fn resolve_base(
    client: &RegistryClient,
    reference: &ImageReference,
    platform: &Platform,
    cache: &LayerCache,
) -> Result<ResolvedBase> {
    info!("resolving base image {} for {}", reference, platform);

    let accept = [
        MEDIA_TYPE_MANIFEST,
        MEDIA_TYPE_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_DOCKER_INDEX,
    ];

    let pulled = client
        .get_manifest(&reference.repository, &reference.reference, &accept)
        .await?;

    let manifest: Manifest = if is_index(&pulled.media_type, &pulled.bytes) {
        let index: ImageIndex = serde_json::from_slice(&pulled.bytes)?;
        let descriptor = index.select_platform(platform)?;
        debug!(
            "index resolved {} to per-platform manifest {}",
            reference, descriptor.digest
        );

        let platform_manifest = client
            .get_manifest(
                &reference.repository,
                descriptor.digest.as_str(),
                &[MEDIA_TYPE_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST],
            )
            .await?;
        serde_json::from_slice(&platform_manifest.bytes)?
    } else {
        serde_json::from_slice(&pulled.bytes)?
    };

    if manifest.layers.len() > MAX_LAYERS {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
        });
    }

    let config_bytes = client
        .get_config_blob(&reference.repository, &manifest.config.digest)
        .await?;
    cache.put_bytes(&config_bytes, CacheKind::Config)?;
    let config: ImageConfig = serde_json::from_slice(&config_bytes)?;

    // The selected manifest must actually be for the requested platform.
    let base_platform = config.platform();
    if !platform.matches(&base_platform) {
        return Err(Error::PlatformMismatch {
            requested: platform.to_string(),
            base: base_platform.to_string(),
        });
    }

    if config.rootfs.diff_ids.len() != manifest.layers.len() {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: format!(
                "base config declares {} diff_ids for {} layers",
                config.rootfs.diff_ids.len(),
                manifest.layers.len()
            ),
        });
    }

    fetch_layers(client, reference, &manifest.layers, cache).await?;

    let distroless = is_distroless(&config);
    if distroless {
        debug!("base image {} is shell-less", reference);
    }

    Ok(ResolvedBase {
        layers: manifest.layers,
        config,
        distroless,
    })
}

/// Downloads missing layer blobs into the cache, at most
/// [`MAX_CONCURRENT_DOWNLOADS`] in flight. Each download streams into a
/// cache temp file and is pinned against eviction while in flight.
async fn fetch_layers(
    client: &RegistryClient,
    reference: &ImageReference,
    layers: &[Descriptor],
    cache: &LayerCache,
) -> Result<()> {
    let mut pending = FuturesUnordered::new();
    let mut queue = layers.iter();

    loop {
        while pending.len() < MAX_CONCURRENT_DOWNLOADS {
            let Some(layer) = queue.next() else { break };

            if cache.has(&layer.digest) {
                debug!("base layer {} already cached", layer.digest);
                continue;
            }

            pending.push(fetch_one_layer(client, reference, layer, cache));
        }

        match pending.next().await {
            Some(result) => result?,
            None => break,
        }
    }

    Ok(())
}

async fn fetch_one_layer(
    client: &RegistryClient,
    reference: &ImageReference,
    layer: &Descriptor,
    cache: &LayerCache,
) -> Result<()> {
    debug!("fetching base layer {} ({} bytes)", layer.digest, layer.size);

    let _pin = cache.pin(&layer.digest);
    let tmp = cache.temp_path();

    let result = async {
        let mut file = std::fs::File::create(&tmp).map_err(|e| Error::io_at(&tmp, e))?;
        let size = client
            .get_blob(&reference.repository, &layer.digest, &mut file)
            .await?;
        drop(file);
        cache.install_temp(&tmp, &layer.digest, size, CacheKind::BaseLayer)?;
        Ok(())
    }
    .await;

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn is_index(media_type: &str, body: &[u8]) -> bool {
    if media_type.contains("index") || media_type.contains("manifest.list") {
        return true;
    }
    // Some registries omit or mislabel the content type; sniff the body.
    serde_json::from_slice::<serde_json::Value>(body)
        .map(|v| v.get("manifests").is_some())
        .unwrap_or(false)
}

/// Label check for shell-less bases.
fn is_distroless(config: &ImageConfig) -> bool {
    config
        .config
        .as_ref()
        .map(|exec| {
            exec.labels.get(LABEL_DISTROLESS).map(|v| v == "true").unwrap_or(false)
                || exec.labels.keys().any(|k| k.contains("distroless"))
        })
        .unwrap_or(false)
}
