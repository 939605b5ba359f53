//! OCI Image Specification types and canonical JSON.
//!
//! Based on the OCI Image Specification v1.1.0:
//! <https://github.com/opencontainers/image-spec>
//!
//! Everything that ends up content-addressed (config, manifest, index)
//! is serialized through [`canonical_json`]: UTF-8, object keys sorted,
//! no insignificant whitespace, no trailing newline. Digests over these
//! bytes are therefore stable across runs and processes.

use crate::constants::{MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST};
use crate::digest::Digest;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Serializes a value as canonical JSON bytes.
///
/// The value is round-tripped through [`serde_json::Value`], whose map
/// representation is ordered by key, so object keys come out sorted
/// regardless of struct field order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Target platform tuple `(os, architecture, variant?)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Parses `"<os>/<arch>[/<variant>]"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for anything but two or three
    /// non-empty segments.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(Error::InvalidConfig(format!(
                "invalid platform format '{}', expected os/arch[/variant]",
                s
            ))),
        }
    }

    /// True when `other` satisfies this platform. A missing variant on
    /// either side matches any variant.
    pub fn matches(&self, other: &Platform) -> bool {
        if self.os != other.os || self.architecture != other.architecture {
            return false;
        }
        match (&self.variant, &other.variant) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Content descriptor: the only legal way to reference a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// A descriptor without platform or annotations.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }

}

/// OCI Image Manifest: one config descriptor plus ordered layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Builds a schema-2 OCI manifest.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }
}

/// OCI Image Index: manifests qualified by platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// Builds a schema-2 OCI index.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_INDEX.to_string()),
            manifests,
            annotations: BTreeMap::new(),
        }
    }

    /// Selects the first manifest descriptor matching `platform`.
    ///
    /// # Errors
    ///
    /// [`Error::NoMatchingPlatform`] listing what the index offered.
    pub fn select_platform(&self, platform: &Platform) -> Result<&Descriptor> {
        let found = self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .map(|p| platform.matches(p))
                .unwrap_or(false)
        });

        found.ok_or_else(|| {
            let offered: Vec<String> = self
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| p.to_string())
                .collect();
            Error::NoMatchingPlatform {
                wanted: platform.to_string(),
                offered: if offered.is_empty() {
                    "none".to_string()
                } else {
                    offered.join(", ")
                },
            }
        })
    }
}

/// Runtime execution parameters inside the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Root filesystem section of the image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

impl RootFs {
    /// A `layers`-typed rootfs over the given diff_ids.
    pub fn layers(diff_ids: Vec<Digest>) -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids,
        }
    }
}

/// History entry for an image layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// OCI Image Configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecutionConfig>,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl ImageConfig {
    /// An empty config for the given platform.
    pub fn for_platform(platform: &Platform) -> Self {
        Self {
            created: None,
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
            config: Some(ExecutionConfig::default()),
            rootfs: RootFs::layers(Vec::new()),
            history: Vec::new(),
        }
    }

    /// The platform this config was built for.
    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
        }
    }
}

/// Serializes a config/manifest/index blob and returns
/// `(bytes, descriptor)` with the appropriate media type.
pub fn to_blob<T: Serialize>(value: &T, media_type: &str) -> Result<(Vec<u8>, Descriptor)> {
    let bytes = canonical_json(value)?;
    let digest = Digest::from_bytes(&bytes);
    let descriptor = Descriptor::new(media_type, digest, bytes.len() as u64);
    Ok((bytes, descriptor))
}

/// Shorthand for serializing an [`ImageConfig`] blob.
pub fn config_blob(config: &ImageConfig) -> Result<(Vec<u8>, Descriptor)> {
    to_blob(config, MEDIA_TYPE_CONFIG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MEDIA_TYPE_LAYER_TAR;

    #[test]
    fn canonical_json_sorts_keys_and_strips_whitespace() {
        #[derive(Serialize)]
        struct Unordered {
            zebra: u32,
            alpha: u32,
        }

        let bytes = canonical_json(&Unordered { zebra: 1, alpha: 2 }).unwrap();
        assert_eq!(bytes, b"{\"alpha\":2,\"zebra\":1}");
    }

    #[test]
    fn canonical_json_is_idempotent() {
        let manifest = Manifest::new(
            Descriptor::new(MEDIA_TYPE_CONFIG, Digest::from_bytes(b"cfg"), 3),
            vec![Descriptor::new(
                MEDIA_TYPE_LAYER_TAR,
                Digest::from_bytes(b"layer"),
                5,
            )],
        );

        let first = canonical_json(&manifest).unwrap();
        let parsed: Manifest = serde_json::from_slice(&first).unwrap();
        let second = canonical_json(&parsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn platform_parse_and_display() {
        let p = Platform::parse("linux/arm64").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "arm64");
        assert_eq!(p.to_string(), "linux/arm64");

        let v = Platform::parse("linux/arm/v7").unwrap();
        assert_eq!(v.variant.as_deref(), Some("v7"));

        assert!(Platform::parse("amd64").is_err());
        assert!(Platform::parse("linux/amd64/v2/extra").is_err());
        assert!(Platform::parse("").is_err());
    }

    #[test]
    fn index_platform_selection() {
        let mk = |arch: &str| {
            let mut d = Descriptor::new(MEDIA_TYPE_MANIFEST, Digest::from_bytes(arch.as_bytes()), 1);
            d.platform = Some(Platform {
                os: "linux".to_string(),
                architecture: arch.to_string(),
                variant: None,
            });
            d
        };
        let index = ImageIndex::new(vec![mk("amd64"), mk("arm64")]);

        let wanted = Platform::parse("linux/arm64").unwrap();
        let selected = index.select_platform(&wanted).unwrap();
        assert_eq!(selected.platform.as_ref().unwrap().architecture, "arm64");

        let missing = Platform::parse("linux/s390x").unwrap();
        let err = index.select_platform(&missing).unwrap_err();
        assert!(matches!(err, Error::NoMatchingPlatform { .. }));
    }

    #[test]
    fn exposed_ports_serialize_as_empty_objects() {
        let mut exec = ExecutionConfig::default();
        exec.exposed_ports
            .insert("8000/tcp".to_string(), serde_json::json!({}));
        let json = String::from_utf8(canonical_json(&exec).unwrap()).unwrap();
        assert!(json.contains("\"ExposedPorts\":{\"8000/tcp\":{}}"));
    }
}
