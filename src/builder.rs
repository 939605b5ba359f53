//! Build orchestration.
//!
//! The serial backbone of the pipeline: assemble the plan, introspect
//! the project, resolve the base image, materialize layers, merge the
//! image config, synthesize the manifest, write the layout, and
//! optionally push and emit an SBOM.
//!
//! Layers appear in the manifest in the fixed order `base... -> deps ->
//! app`, and on push every referenced blob is confirmed present on the
//! registry before the manifest is PUT.

use crate::auth::AuthChain;
use crate::baseimage::{resolve_base, ResolvedBase};
use crate::cache::{CacheKind, LayerCache};
use crate::config::BuildPlan;
use crate::constants::{
    DEFAULT_CACHE_CAPACITY, LABEL_FRAMEWORK, MAX_CONCURRENT_UPLOADS, MEDIA_TYPE_MANIFEST,
};
use crate::error::{Error, Result};
use crate::framework::{detect_framework, framework_defaults, Framework, FrameworkDefaults};
use crate::layers::{build_app_layer, build_deps_layer, BuiltLayer};
use crate::layout::{write_layout, LayoutContents};
use crate::oci::{
    canonical_json, config_blob, Descriptor, ExecutionConfig, ImageConfig, Manifest, RootFs,
};
use crate::project::ProjectMetadata;
use crate::registry::{ImageReference, RegistryClient};
use crate::sbom::{generate_sbom, write_sbom};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub layout_path: PathBuf,
    /// References pushed, empty when pushing was off.
    pub pushed_refs: Vec<String>,
    pub sbom_path: Option<PathBuf>,
}

/// Drives a build from an immutable plan.
pub struct ImageBuilder {
    plan: BuildPlan,
    cache: LayerCache,
}

impl ImageBuilder {
    /// Creates a builder, opening the cache the plan points at.
    pub fn new(plan: BuildPlan) -> Result<Self> {
        let cache = match &plan.cache_dir {
            Some(dir) => LayerCache::with_root(dir.clone(), DEFAULT_CACHE_CAPACITY),
            None => LayerCache::new(),
        }?;
        Ok(Self { plan, cache })
    }

    /// Creates a builder over an existing cache handle.
    pub fn with_cache(plan: BuildPlan, cache: LayerCache) -> Self {
        Self { plan, cache }
    }

    /// Runs the full pipeline.
    pub async fn build(&self) -> Result<BuildReport> {
        let plan = &self.plan;

        if !plan.context_dir.is_dir() {
            return Err(Error::ProjectNotFound {
                path: plan.context_dir.clone(),
            });
        }

        let mut metadata =
            ProjectMetadata::discover(&plan.context_dir, &plan.requirements_file)?;
        metadata.framework = detect_framework(&metadata);
        let fw_defaults = framework_defaults(metadata.framework, &metadata.context_root);

        let base_reference = self.base_reference(&metadata)?;

        if plan.dry_run {
            self.log_plan(&metadata, base_reference.as_ref());
            return Ok(BuildReport {
                layout_path: plan.output_dir.clone(),
                pushed_refs: Vec::new(),
                sbom_path: None,
            });
        }

        let base = match &base_reference {
            Some(reference) => {
                let client = self.client_for(&reference.host).await?;
                Some(resolve_base(&client, reference, &plan.platform, &self.cache).await?)
            }
            None => None,
        };

        // An explicit workdir beats the base image's; the same value
        // drives both packing and the final config.
        let working_dir = if plan.workdir_explicit {
            plan.workdir.clone()
        } else {
            base.as_ref()
                .and_then(|b| b.config.config.as_ref())
                .and_then(|exec| exec.working_dir.clone())
                .filter(|w| w.starts_with('/'))
                .unwrap_or_else(|| plan.workdir.clone())
        };
        let prefix = working_dir.trim_matches('/').to_string();

        // deps -> app, after any base layers.
        let deps_layer = build_deps_layer(plan, &metadata, &self.cache, &prefix)?;
        let app_layer = build_app_layer(plan, &metadata, &self.cache, &prefix)?;

        let image_config = self.merge_config(
            base.as_ref(),
            &metadata,
            fw_defaults.as_ref(),
            deps_layer.as_ref(),
            &app_layer,
            &working_dir,
        );

        let (config_bytes, config_descriptor) = config_blob(&image_config)?;
        self.cache.put_bytes(&config_bytes, CacheKind::Config)?;

        let mut layer_descriptors: Vec<Descriptor> = base
            .as_ref()
            .map(|b| b.layers.clone())
            .unwrap_or_default();
        if let Some(deps) = &deps_layer {
            layer_descriptors.push(deps.descriptor.clone());
        }
        layer_descriptors.push(app_layer.descriptor.clone());

        let manifest = Manifest::new(config_descriptor.clone(), layer_descriptors.clone());
        let manifest_bytes = canonical_json(&manifest)?;
        let (manifest_digest, manifest_size) = self
            .cache
            .put_bytes(&manifest_bytes, CacheKind::Manifest)?;
        let manifest_descriptor =
            Descriptor::new(MEDIA_TYPE_MANIFEST, manifest_digest, manifest_size);

        let layout_path = write_layout(
            &plan.output_dir,
            &self.cache,
            &LayoutContents {
                config_bytes: &config_bytes,
                config: &config_descriptor,
                manifest_bytes: &manifest_bytes,
                manifest: &manifest_descriptor,
                layers: &layer_descriptors,
            },
            &plan.tag,
            &plan.platform,
        )?;

        let pushed_refs = if plan.push {
            vec![
                self.push(&layer_descriptors, &config_descriptor, &manifest_bytes)
                    .await?,
            ]
        } else {
            Vec::new()
        };

        let sbom_path = match plan.generate_sbom {
            Some(format) => {
                match generate_sbom(&metadata.name, &metadata.deps_source, format)
                    .and_then(|doc| write_sbom(&layout_path, format, &doc))
                {
                    Ok(path) => Some(path),
                    Err(e) if e.is_recoverable() => {
                        warn!("{}", e);
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };

        info!("build of {} complete", plan.tag);
        Ok(BuildReport {
            layout_path,
            pushed_refs,
            sbom_path,
        })
    }

    /// The base reference to resolve: the explicit one, or an
    /// interpreter image derived from the declared range.
    fn base_reference(&self, metadata: &ProjectMetadata) -> Result<Option<ImageReference>> {
        if let Some(explicit) = &self.plan.base_image {
            return Ok(Some(ImageReference::parse(explicit)?));
        }
        match &metadata.interpreter_range {
            Some(range) => {
                let derived = format!("python:{}-slim", range);
                debug!("derived base image {} from interpreter range", derived);
                Ok(Some(ImageReference::parse(&derived)?))
            }
            None => Ok(None),
        }
    }

    async fn client_for(&self, host: &str) -> Result<RegistryClient> {
        let chain = AuthChain::new(self.plan.credentials.clone());
        let credential = chain.resolve(host).await;
        RegistryClient::new(host, credential, &self.plan.insecure_hosts)
    }

    // =========================================================================
    // Config merging
    // =========================================================================

    /// Merges base config, project defaults, framework defaults, and
    /// the plan into the final image config.
    fn merge_config(
        &self,
        base: Option<&ResolvedBase>,
        metadata: &ProjectMetadata,
        fw_defaults: Option<&FrameworkDefaults>,
        deps_layer: Option<&BuiltLayer>,
        app_layer: &BuiltLayer,
        working_dir: &str,
    ) -> ImageConfig {
        let plan = &self.plan;
        let base_exec = base
            .and_then(|b| b.config.config.clone())
            .unwrap_or_default();

        // Env union: base order first, user overrides in place, new
        // keys appended. The Python runtime defaults sit between base
        // and user so the user always wins.
        let mut env: Vec<(String, String)> = base_exec
            .env
            .iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();
        let mut set_env = |key: &str, value: String| {
            if let Some(slot) = env.iter_mut().find(|(k, _)| k == key) {
                slot.1 = value;
            } else {
                env.push((key.to_string(), value));
            }
        };
        if deps_layer.is_some() {
            set_env("PYTHONUNBUFFERED", "1".to_string());
            set_env("PYTHONDONTWRITEBYTECODE", "1".to_string());
            set_env("PYTHONPATH", format!("{}/site-packages", working_dir.trim_end_matches('/')));
        }
        for (key, value) in &plan.env {
            set_env(key, value.clone());
        }

        let mut labels: BTreeMap<String, String> = base_exec.labels.clone();
        if let Some(tag) = metadata.framework.label() {
            labels.insert(LABEL_FRAMEWORK.to_string(), tag.to_string());
        }
        labels.extend(plan.labels.clone());

        let mut exposed_ports = base_exec.exposed_ports.clone();
        if let Some(port) = fw_defaults.and_then(|d| d.exposed_port) {
            exposed_ports.insert(format!("{}/tcp", port), serde_json::json!({}));
        }

        // Entrypoint precedence: user > framework > project script >
        // base. A shell-less base gets the argv as cmd instead.
        let chosen_argv = plan
            .entrypoint
            .clone()
            .or_else(|| fw_defaults.map(|d| d.entrypoint.clone()))
            .or_else(|| metadata.script_entrypoint())
            .or_else(|| {
                if metadata.framework == Framework::None {
                    Some(ProjectMetadata::fallback_entrypoint())
                } else {
                    None
                }
            });

        let distroless = base.map(|b| b.distroless).unwrap_or(false);
        let (entrypoint, cmd) = if distroless {
            (
                base_exec.entrypoint.clone(),
                chosen_argv.or_else(|| plan.cmd.clone()).or_else(|| base_exec.cmd.clone()),
            )
        } else {
            (
                chosen_argv.or_else(|| base_exec.entrypoint.clone()),
                plan.cmd.clone().or_else(|| base_exec.cmd.clone()),
            )
        };

        let user = plan
            .user
            .clone()
            .or_else(|| base_exec.user.clone().filter(|u| !u.is_empty()));

        let mut diff_ids: Vec<_> = base
            .map(|b| b.config.rootfs.diff_ids.clone())
            .unwrap_or_default();
        if let Some(deps) = deps_layer {
            diff_ids.push(deps.diff_id.clone());
        }
        diff_ids.push(app_layer.diff_id.clone());

        ImageConfig {
            created: None,
            architecture: plan.platform.architecture.clone(),
            os: plan.platform.os.clone(),
            variant: plan.platform.variant.clone(),
            config: Some(ExecutionConfig {
                user,
                exposed_ports,
                env: env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
                entrypoint,
                cmd,
                working_dir: Some(working_dir.to_string()),
                labels,
            }),
            rootfs: RootFs::layers(diff_ids),
            history: Vec::new(),
        }
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Pushes every blob the manifest references, then the manifest.
    ///
    /// Blob uploads run in a bounded pool; the manifest PUT happens only
    /// after every upload has completed.
    async fn push(
        &self,
        layers: &[Descriptor],
        config: &Descriptor,
        manifest_bytes: &[u8],
    ) -> Result<String> {
        let plan = &self.plan;
        let mut target = ImageReference::parse(&plan.tag)?;
        if let Some(registry) = &plan.registry {
            target.host = registry.clone();
        }

        info!("pushing {} blobs to {}", layers.len() + 1, target);
        let client = self.client_for(&target.host).await?;

        let mut blobs: Vec<&Descriptor> = layers.iter().collect();
        blobs.push(config);

        let mut pending = FuturesUnordered::new();
        let mut queue = blobs.into_iter();
        loop {
            while pending.len() < MAX_CONCURRENT_UPLOADS {
                let Some(descriptor) = queue.next() else { break };
                pending.push(self.push_blob(&client, &target, descriptor));
            }
            match pending.next().await {
                Some(result) => result?,
                None => break,
            }
        }

        // Synchronization point: all blobs confirmed before the
        // manifest names them.
        client
            .put_manifest(
                &target.repository,
                &target.reference,
                manifest_bytes.to_vec(),
                MEDIA_TYPE_MANIFEST,
            )
            .await
            .map_err(|e| match e {
                e @ (Error::DigestMismatch { .. } | Error::AuthFailure { .. }) => e,
                other => Error::PushFailed(other.to_string()),
            })?;

        Ok(target.to_string())
    }

    async fn push_blob(
        &self,
        client: &RegistryClient,
        target: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<()> {
        let _pin = self.cache.pin(&descriptor.digest);

        if client.exists_blob(&target.repository, &descriptor.digest).await? {
            debug!("blob {} already present on {}", descriptor.digest, target.host);
            return Ok(());
        }

        let data = self.cache.read_bytes(&descriptor.digest)?;
        client
            .upload_blob(&target.repository, &descriptor.digest, data)
            .await?;
        debug!("uploaded {} ({} bytes)", descriptor.digest, descriptor.size);
        Ok(())
    }

    fn log_plan(&self, metadata: &ProjectMetadata, base: Option<&ImageReference>) {
        let plan = &self.plan;
        info!("dry run: no bytes will be written");
        info!("  tag:        {}", plan.tag);
        info!("  context:    {}", plan.context_dir.display());
        info!("  output:     {}", plan.output_dir.display());
        info!("  platform:   {}", plan.platform);
        info!("  workdir:    {}", plan.workdir);
        info!("  project:    {} v{}", metadata.name, metadata.version);
        info!("  framework:  {:?}", metadata.framework);
        info!(
            "  base:       {}",
            base.map(|b| b.to_string()).unwrap_or_else(|| "none".to_string())
        );
        info!("  deps:       {:?}", metadata.deps_source);
        info!("  push:       {}", plan.push);
        info!("  sbom:       {:?}", plan.generate_sbom);
    }
}
