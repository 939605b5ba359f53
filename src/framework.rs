//! Web framework detection.
//!
//! A heuristic pass that tags the project `fastapi`, `flask`, `django`,
//! or `none` by scanning declared dependencies, requirements lines, and
//! marker files, in that order. The tag affects defaults only: it never
//! overrides an explicit user value.

use crate::constants::{DJANGO_MANAGE_FILE, PYPROJECT_FILE, PYTHON_INTERPRETER};
use crate::project::{DepsSource, ProjectMetadata};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Detected framework tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framework {
    Fastapi,
    Flask,
    Django,
    #[default]
    None,
}

impl Framework {
    /// Lowercase name used for the `framework` label.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Framework::Fastapi => Some("fastapi"),
            Framework::Flask => Some("flask"),
            Framework::Django => Some("django"),
            Framework::None => None,
        }
    }

    /// Port the framework serves on by default.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Framework::Fastapi | Framework::Django => Some(8000),
            Framework::Flask => Some(5000),
            Framework::None => None,
        }
    }
}

/// Defaults contributed by a detected framework.
#[derive(Debug, Clone)]
pub struct FrameworkDefaults {
    pub entrypoint: Vec<String>,
    pub exposed_port: Option<u16>,
}

/// Detects the framework for an introspected project.
///
/// Probe order: exact-name match in `pyproject.toml` dependencies, then
/// requirements lines, then marker files (`manage.py` mentioning django).
/// The first hit wins; `fastapi` is checked before `flask` before
/// `django` within each source so ties resolve deterministically.
pub fn detect_framework(metadata: &ProjectMetadata) -> Framework {
    let declared = declared_dependencies(&metadata.context_root);
    for (name, tag) in [
        ("fastapi", Framework::Fastapi),
        ("flask", Framework::Flask),
        ("django", Framework::Django),
    ] {
        if declared.iter().any(|d| d == name) {
            debug!("framework {} detected from declared dependencies", name);
            return tag;
        }
    }

    if let DepsSource::RequirementsFile(path) = &metadata.deps_source {
        let requirements = requirement_names(path);
        for (name, tag) in [
            ("fastapi", Framework::Fastapi),
            ("flask", Framework::Flask),
            ("django", Framework::Django),
        ] {
            if requirements.iter().any(|d| d == name) {
                debug!("framework {} detected from requirements", name);
                return tag;
            }
        }
    }

    let manage = metadata.context_root.join(DJANGO_MANAGE_FILE);
    if manage.is_file() {
        let mentions_django = fs::read_to_string(&manage)
            .map(|text| text.to_lowercase().contains("django"))
            .unwrap_or(false);
        if mentions_django {
            debug!("framework django detected from manage.py");
            return Framework::Django;
        }
    }

    Framework::None
}

/// Computes the entrypoint and port defaults for a detected framework.
///
/// For fastapi the served module is the first discovered module that
/// instantiates `FastAPI(...)`, expressed as `module.path:var`; when no
/// source file gives one away, `main:app` is assumed.
pub fn framework_defaults(framework: Framework, context_root: &Path) -> Option<FrameworkDefaults> {
    match framework {
        Framework::Fastapi => {
            let app_module =
                find_fastapi_app(context_root).unwrap_or_else(|| "main:app".to_string());
            Some(FrameworkDefaults {
                entrypoint: vec![
                    "uvicorn".to_string(),
                    app_module,
                    "--host".to_string(),
                    "0.0.0.0".to_string(),
                    "--port".to_string(),
                    "8000".to_string(),
                ],
                exposed_port: Some(8000),
            })
        }
        Framework::Flask => Some(FrameworkDefaults {
            entrypoint: vec![
                "flask".to_string(),
                "run".to_string(),
                "--host=0.0.0.0".to_string(),
            ],
            exposed_port: Some(5000),
        }),
        Framework::Django => Some(FrameworkDefaults {
            entrypoint: vec![
                PYTHON_INTERPRETER.to_string(),
                DJANGO_MANAGE_FILE.to_string(),
                "runserver".to_string(),
                "0.0.0.0:8000".to_string(),
            ],
            exposed_port: Some(8000),
        }),
        Framework::None => None,
    }
}

/// Dependency names declared in `pyproject.toml` (`project.dependencies`),
/// lowercased and stripped of version specifiers.
fn declared_dependencies(context_root: &Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(context_root.join(PYPROJECT_FILE)) else {
        return Vec::new();
    };
    let Ok(doc) = text.parse::<toml::Table>() else {
        return Vec::new();
    };

    doc.get("project")
        .and_then(|p| p.as_table())
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
        .map(|deps| {
            deps.iter()
                .filter_map(|v| v.as_str())
                .map(requirement_name)
                .collect()
        })
        .unwrap_or_default()
}

/// Package names from a requirements file, lowercased.
fn requirement_names(path: &Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(requirement_name)
        .collect()
}

/// Strips version specifiers and extras from a requirement line.
fn requirement_name(line: &str) -> String {
    line.split(&['=', '<', '>', '~', '!', ';', '[', ' '][..])
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// Finds the first module instantiating `FastAPI(...)`, scanning Python
/// files in lexicographic path order for determinism.
fn find_fastapi_app(context_root: &Path) -> Option<String> {
    let mut files = Vec::new();
    collect_python_files(context_root, context_root, &mut files);
    files.sort();

    for rel in files {
        let Ok(text) = fs::read_to_string(context_root.join(&rel)) else {
            continue;
        };
        if !text.contains("FastAPI") {
            continue;
        }
        if let Some(var) = fastapi_variable(&text) {
            let module = rel
                .trim_end_matches(".py")
                .replace(['/', '\\'], ".");
            return Some(format!("{}:{}", module, var));
        }
    }
    None
}

/// Extracts the variable name from a `<var> = FastAPI(` assignment.
fn fastapi_variable(source: &str) -> Option<String> {
    for line in source.lines() {
        let Some((lhs, rhs)) = line.split_once('=') else {
            continue;
        };
        if rhs.trim_start().starts_with("FastAPI(") {
            let var = lhs.trim();
            if !var.is_empty() && var.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Some(var.to_string());
            }
        }
    }
    None
}

fn collect_python_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if !name.starts_with('.') && name != "__pycache__" && name != "venv" && name != "env" {
                collect_python_files(root, &path, out);
            }
        } else if name.ends_with(".py") {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}
