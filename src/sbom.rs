//! Software Bill of Materials emission.
//!
//! Enumerates the Python packages that feed the dependency layer (the
//! same dependencies source §-wise as the layer builder uses) and
//! serializes one of two document schemas: SPDX 2.3 or CycloneDX 1.4.
//! Scope is the project ecosystem only; OS packages inside base layers
//! are not enumerated.

use crate::config::SbomFormat;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::project::DepsSource;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A package destined for the dependency layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Package {
    pub name: String,
    pub version: String,
}

/// Enumerates packages from the dependencies source, sorted by name.
///
/// Requirements files contribute their pinned lines (`name==version`);
/// unpinned requirements get version `unknown`. A virtualenv
/// contributes the `*.dist-info` directories of its site-packages.
pub fn enumerate_packages(deps_source: &DepsSource) -> Result<Vec<Package>> {
    let mut packages = match deps_source {
        DepsSource::RequirementsFile(path) => requirements_packages(path)?,
        DepsSource::Virtualenv(venv) => virtualenv_packages(venv)?,
        DepsSource::None => Vec::new(),
    };
    packages.sort();
    packages.dedup();
    Ok(packages)
}

fn requirements_packages(path: &Path) -> Result<Vec<Package>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::SbomGenerationFailed(format!("{}: {}", path.display(), e)))?;

    let mut packages = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        match line.split_once("==") {
            Some((name, version)) => packages.push(Package {
                name: name.trim().to_string(),
                version: version
                    .split(&[';', ' '][..])
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string(),
            }),
            None => packages.push(Package {
                name: line
                    .split(&['<', '>', '~', '!', ';', '[', ' '][..])
                    .next()
                    .unwrap_or(line)
                    .trim()
                    .to_string(),
                version: "unknown".to_string(),
            }),
        }
    }
    Ok(packages)
}

fn virtualenv_packages(venv: &Path) -> Result<Vec<Package>> {
    let Some(site_packages) = site_packages_dir(venv) else {
        return Err(Error::SbomGenerationFailed(format!(
            "no site-packages under {}",
            venv.display()
        )));
    };

    let listing = fs::read_dir(&site_packages)
        .map_err(|e| Error::SbomGenerationFailed(format!("{}: {}", site_packages.display(), e)))?;

    let mut packages = Vec::new();
    for entry in listing.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = name.strip_suffix(".dist-info") else {
            continue;
        };
        // dist-info directories are named <name>-<version>.
        if let Some((package, version)) = stem.rsplit_once('-') {
            packages.push(Package {
                name: package.to_string(),
                version: version.to_string(),
            });
        }
    }
    Ok(packages)
}

fn site_packages_dir(venv: &Path) -> Option<PathBuf> {
    let windows = venv.join("Lib").join("site-packages");
    if windows.is_dir() {
        return Some(windows);
    }
    let lib = venv.join("lib");
    let mut candidates: Vec<PathBuf> = fs::read_dir(&lib)
        .ok()?
        .flatten()
        .map(|e| e.path().join("site-packages"))
        .filter(|p| p.is_dir())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Builds the SBOM document for the chosen schema.
pub fn generate_sbom(
    project_name: &str,
    deps_source: &DepsSource,
    format: SbomFormat,
) -> Result<Value> {
    let packages = enumerate_packages(deps_source)?;
    debug!("SBOM enumerated {} packages", packages.len());

    let document = match format {
        SbomFormat::Spdx => spdx_document(project_name, &packages),
        SbomFormat::CycloneDx => cyclonedx_document(project_name, &packages),
    };
    Ok(document)
}

/// Writes the document as a single canonical-ish JSON blob next to the
/// layout. Returns the written path.
pub fn write_sbom(layout_dir: &Path, format: SbomFormat, document: &Value) -> Result<PathBuf> {
    let path = layout_dir.join(format!("sbom.{}.json", format.file_stem()));
    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| Error::SbomGenerationFailed(e.to_string()))?;
    fs::write(&path, bytes).map_err(|e| Error::SbomGenerationFailed(e.to_string()))?;
    info!("SBOM written to {}", path.display());
    Ok(path)
}

fn spdx_document(project_name: &str, packages: &[Package]) -> Value {
    let spdx_packages: Vec<Value> = packages
        .iter()
        .map(|p| {
            json!({
                "SPDXID": format!("SPDXRef-Package-{}", p.name),
                "name": p.name,
                "versionInfo": p.version,
                "downloadLocation": "NOASSERTION",
                "filesAnalyzed": false,
                "licenseConcluded": "NOASSERTION",
                "licenseDeclared": "NOASSERTION",
                "copyrightText": "NOASSERTION",
            })
        })
        .collect();

    json!({
        "spdxVersion": "SPDX-2.3",
        "dataLicense": "CC0-1.0",
        "SPDXID": "SPDXRef-DOCUMENT",
        "name": format!("pyoci-{}", project_name),
        "documentNamespace": format!(
            "https://sbom.pyoci.dev/{}/{}",
            project_name,
            document_id(project_name, packages)
        ),
        "creationInfo": {
            "created": timestamp(),
            "creators": ["Tool: pyoci"],
            "licenseListVersion": "3.21",
        },
        "packages": spdx_packages,
    })
}

fn cyclonedx_document(project_name: &str, packages: &[Package]) -> Value {
    let components: Vec<Value> = packages
        .iter()
        .map(|p| {
            json!({
                "type": "library",
                "name": p.name,
                "version": p.version,
                "purl": format!("pkg:pypi/{}@{}", p.name, p.version),
            })
        })
        .collect();

    json!({
        "bomFormat": "CycloneDX",
        "specVersion": "1.4",
        "serialNumber": format!("urn:uuid:{}", uuid::Uuid::now_v7()),
        "version": 1,
        "metadata": {
            "timestamp": timestamp(),
            "tools": [{"name": "pyoci", "version": env!("CARGO_PKG_VERSION")}],
        },
        "components": components,
    })
}

/// Document id derived from the package set, so identical inputs name
/// the same namespace.
fn document_id(project_name: &str, packages: &[Package]) -> String {
    let mut buf = project_name.as_bytes().to_vec();
    for p in packages {
        buf.extend_from_slice(p.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(p.version.as_bytes());
        buf.push(0);
    }
    Digest::from_bytes(&buf).hex()[..16].to_string()
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn requirements_pins_parsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("requirements.txt");
        fs::write(&path, "flask==2.0.0\nrequests==2.28.0\n# comment\nuvicorn\n").unwrap();

        let packages = enumerate_packages(&DepsSource::RequirementsFile(path)).unwrap();
        assert_eq!(
            packages,
            vec![
                Package {
                    name: "flask".to_string(),
                    version: "2.0.0".to_string()
                },
                Package {
                    name: "requests".to_string(),
                    version: "2.28.0".to_string()
                },
                Package {
                    name: "uvicorn".to_string(),
                    version: "unknown".to_string()
                },
            ]
        );
    }

    #[test]
    fn virtualenv_dist_info_parsed() {
        let dir = TempDir::new().unwrap();
        let site = dir
            .path()
            .join("venv")
            .join("lib")
            .join("python3.11")
            .join("site-packages");
        fs::create_dir_all(site.join("flask-2.3.0.dist-info")).unwrap();
        fs::create_dir_all(site.join("flask")).unwrap();

        let packages =
            enumerate_packages(&DepsSource::Virtualenv(dir.path().join("venv"))).unwrap();
        assert_eq!(
            packages,
            vec![Package {
                name: "flask".to_string(),
                version: "2.3.0".to_string()
            }]
        );
    }

    #[test]
    fn spdx_document_shape() {
        let packages = vec![Package {
            name: "flask".to_string(),
            version: "2.0.0".to_string(),
        }];
        let doc = spdx_document("demo", &packages);
        assert_eq!(doc["spdxVersion"], "SPDX-2.3");
        assert_eq!(doc["packages"][0]["SPDXID"], "SPDXRef-Package-flask");
        assert_eq!(doc["packages"][0]["versionInfo"], "2.0.0");
    }

    #[test]
    fn cyclonedx_document_shape() {
        let packages = vec![Package {
            name: "requests".to_string(),
            version: "2.28.0".to_string(),
        }];
        let doc = cyclonedx_document("demo", &packages);
        assert_eq!(doc["bomFormat"], "CycloneDX");
        assert_eq!(doc["components"][0]["purl"], "pkg:pypi/requests@2.28.0");
    }

    #[test]
    fn empty_deps_source_yields_empty_sbom() {
        let doc = generate_sbom("demo", &DepsSource::None, SbomFormat::Spdx).unwrap();
        assert_eq!(doc["packages"].as_array().unwrap().len(), 0);
    }
}
