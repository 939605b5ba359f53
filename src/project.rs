//! Project introspection.
//!
//! Reads `pyproject.toml` in the context root and derives everything the
//! pipeline needs to know about the project: name, version, declared
//! interpreter range, script entry points, include set, and where
//! dependencies come from. All ambiguities resolve deterministically by
//! the documented probe order; nothing is ever picked at random.

use crate::constants::{
    FALLBACK_ENTRY_MODULE, PYPROJECT_FILE, PYTHON_INTERPRETER, VENV_DIR_NAMES,
};
use crate::error::{Error, Result};
use crate::framework::Framework;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the dependency layer's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepsSource {
    /// A virtualenv directory inside the context.
    Virtualenv(PathBuf),
    /// A requirements file, packaged verbatim.
    RequirementsFile(PathBuf),
    /// No dependency source detected.
    None,
}

impl DepsSource {
    /// True when there is something to build a dependency layer from.
    pub fn is_some(&self) -> bool {
        !matches!(self, DepsSource::None)
    }
}

/// Everything the introspector learned about the project.
#[derive(Debug, Clone)]
pub struct ProjectMetadata {
    pub name: String,
    pub version: String,
    /// Minimum interpreter version (`X.Y`) parsed from a `>=X.Y`
    /// specifier, if one was declared.
    pub interpreter_range: Option<String>,
    /// Declared scripts in declaration order: `(name, target)`.
    pub scripts: Vec<(String, String)>,
    pub deps_source: DepsSource,
    /// Detected framework; filled in by the heuristic pass.
    pub framework: Framework,
    /// Include set, relative to the context root.
    pub include_paths: Vec<PathBuf>,
    pub context_root: PathBuf,
}

impl ProjectMetadata {
    /// Introspects the project at `context_root`.
    ///
    /// `requirements_file` is the configured requirements file name,
    /// relative to the context root.
    ///
    /// # Errors
    ///
    /// - [`Error::ProjectNotFound`] if the context is missing or not a
    ///   directory.
    /// - [`Error::ProjectMetadataMissing`] if `pyproject.toml` exists
    ///   but cannot be parsed.
    pub fn discover(context_root: &Path, requirements_file: &str) -> Result<Self> {
        if !context_root.is_dir() {
            return Err(Error::ProjectNotFound {
                path: context_root.to_path_buf(),
            });
        }

        let pyproject_path = context_root.join(PYPROJECT_FILE);
        let (name, version, interpreter_range, scripts) = if pyproject_path.exists() {
            parse_pyproject(&pyproject_path)?
        } else {
            let fallback = context_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string());
            (fallback, "0.0.0".to_string(), None, Vec::new())
        };

        let deps_source = detect_deps_source(context_root, requirements_file);
        let include_paths = default_include_paths(context_root, &name, requirements_file);

        debug!(
            "introspected project '{}' v{} ({} scripts, deps: {:?})",
            name,
            version,
            scripts.len(),
            deps_source
        );

        Ok(Self {
            name,
            version,
            interpreter_range,
            scripts,
            deps_source,
            framework: Framework::None,
            include_paths,
            context_root: context_root.to_path_buf(),
        })
    }

    /// Entry point derived from declared scripts.
    ///
    /// The first script in declaration order wins. A `pkg.mod:func`
    /// target maps to `["python", "-m", "pkg.mod"]`. Returns `None`
    /// when no scripts are declared; the caller then falls back to the
    /// framework default or the `app` module.
    pub fn script_entrypoint(&self) -> Option<Vec<String>> {
        let (_, target) = self.scripts.first()?;
        let module = match target.split_once(':') {
            Some((module, _func)) => module,
            None => target.as_str(),
        };
        Some(vec![
            PYTHON_INTERPRETER.to_string(),
            "-m".to_string(),
            module.to_string(),
        ])
    }

    /// Last-resort entrypoint when neither scripts nor a framework
    /// produced one.
    pub fn fallback_entrypoint() -> Vec<String> {
        vec![
            PYTHON_INTERPRETER.to_string(),
            "-m".to_string(),
            FALLBACK_ENTRY_MODULE.to_string(),
        ]
    }
}

fn parse_pyproject(
    path: &Path,
) -> Result<(String, String, Option<String>, Vec<(String, String)>)> {
    let text = fs::read_to_string(path).map_err(|e| Error::ProjectMetadataMissing {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let doc: toml::Table = text.parse().map_err(|e: toml::de::Error| {
        Error::ProjectMetadataMissing {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;

    let project = doc.get("project").and_then(|v| v.as_table());

    let name = project
        .and_then(|p| p.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("project")
        .to_string();

    let version = project
        .and_then(|p| p.get("version"))
        .and_then(|v| v.as_str())
        .unwrap_or("0.0.0")
        .to_string();

    let interpreter_range = project
        .and_then(|p| p.get("requires-python"))
        .and_then(|v| v.as_str())
        .and_then(parse_minimum_version);

    // toml tables preserve declaration order, so the first entry here is
    // the first script in the file.
    let scripts = project
        .and_then(|p| p.get("scripts"))
        .and_then(|v| v.as_table())
        .map(|table| {
            table
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok((name, version, interpreter_range, scripts))
}

/// Extracts `X.Y` from a `>=X.Y[...]` specifier.
fn parse_minimum_version(spec: &str) -> Option<String> {
    for clause in spec.split(',') {
        let clause = clause.trim();
        if let Some(version) = clause.strip_prefix(">=") {
            let version = version.trim();
            let mut parts = version.split('.');
            let major = parts.next()?;
            let minor = parts.next()?;
            if major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
            {
                return Some(format!("{}.{}", major, minor));
            }
        }
    }
    None
}

/// Probes for a dependency source: virtualenv first (fixed name order),
/// then the requirements file.
fn detect_deps_source(context_root: &Path, requirements_file: &str) -> DepsSource {
    for name in VENV_DIR_NAMES {
        let candidate = context_root.join(name);
        if candidate.is_dir() {
            return DepsSource::Virtualenv(candidate);
        }
    }

    let requirements = context_root.join(requirements_file);
    if requirements.is_file() {
        return DepsSource::RequirementsFile(requirements);
    }

    DepsSource::None
}

/// Default include set: the first of `src/`, `app/`, `<project name>/`
/// that exists, plus the project manifest and requirements/setup files
/// when present. A flat project with no source directory includes the
/// whole context (the exclude policy still applies).
fn default_include_paths(
    context_root: &Path,
    project_name: &str,
    requirements_file: &str,
) -> Vec<PathBuf> {
    let mut includes = Vec::new();

    for candidate in ["src", "app", project_name] {
        if context_root.join(candidate).is_dir() {
            includes.push(PathBuf::from(candidate));
            break;
        }
    }

    if includes.is_empty() {
        return vec![PathBuf::from(".")];
    }

    for file in [PYPROJECT_FILE, requirements_file, "setup.cfg"] {
        if context_root.join(file).is_file() && !includes.contains(&PathBuf::from(file)) {
            includes.push(PathBuf::from(file));
        }
    }

    includes
}
