//! Tests for project introspection.
//!
//! Validates pyproject parsing, entry-point derivation, include-set
//! probing, dependency-source detection, and the deterministic
//! resolution order for each.

use pyoci::{DepsSource, Error, ProjectMetadata};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const REQUIREMENTS: &str = "requirements.txt";

fn discover(dir: &TempDir) -> ProjectMetadata {
    ProjectMetadata::discover(dir.path(), REQUIREMENTS).unwrap()
}

// =============================================================================
// Manifest Parsing Tests
// =============================================================================

#[test]
fn test_name_version_and_interpreter_range() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("pyproject.toml"),
        "[project]\nname = \"demo\"\nversion = \"0.1.0\"\nrequires-python = \">=3.11\"\n",
    )
    .unwrap();

    let meta = discover(&dir);
    assert_eq!(meta.name, "demo");
    assert_eq!(meta.version, "0.1.0");
    assert_eq!(meta.interpreter_range.as_deref(), Some("3.11"));
}

#[test]
fn test_interpreter_range_absent_for_other_specifiers() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("pyproject.toml"),
        "[project]\nname = \"demo\"\nrequires-python = \"~=3.8\"\n",
    )
    .unwrap();

    assert!(discover(&dir).interpreter_range.is_none());
}

#[test]
fn test_missing_pyproject_uses_directory_name() {
    let dir = TempDir::new().unwrap();
    let meta = discover(&dir);
    assert!(!meta.name.is_empty());
    assert!(meta.scripts.is_empty());
}

#[test]
fn test_unparseable_pyproject_is_an_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pyproject.toml"), "]]] nonsense").unwrap();
    let err = ProjectMetadata::discover(dir.path(), REQUIREMENTS).unwrap_err();
    assert!(matches!(err, Error::ProjectMetadataMissing { .. }));
}

// =============================================================================
// Entry Point Tests
// =============================================================================

#[test]
fn test_first_declared_script_wins() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("pyproject.toml"),
        concat!(
            "[project]\nname = \"demo\"\n\n",
            "[project.scripts]\n",
            "serve = \"demo.server:main\"\n",
            "admin = \"demo.admin:main\"\n",
        ),
    )
    .unwrap();

    let meta = discover(&dir);
    assert_eq!(meta.scripts.len(), 2);
    assert_eq!(
        meta.script_entrypoint().unwrap(),
        vec!["python", "-m", "demo.server"]
    );
}

#[test]
fn test_bare_module_script_target() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("pyproject.toml"),
        "[project]\nname = \"demo\"\n\n[project.scripts]\nrun = \"demo\"\n",
    )
    .unwrap();

    assert_eq!(
        discover(&dir).script_entrypoint().unwrap(),
        vec!["python", "-m", "demo"]
    );
}

#[test]
fn test_fallback_entrypoint_shape() {
    assert_eq!(
        ProjectMetadata::fallback_entrypoint(),
        vec!["python", "-m", "app"]
    );
}

// =============================================================================
// Include Set Tests
// =============================================================================

#[test]
fn test_src_wins_over_app_and_name() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"demo\"\n").unwrap();
    fs::create_dir(dir.path().join("src")).unwrap();
    fs::create_dir(dir.path().join("app")).unwrap();
    fs::create_dir(dir.path().join("demo")).unwrap();

    let meta = discover(&dir);
    assert_eq!(meta.include_paths[0], PathBuf::from("src"));
    assert!(!meta.include_paths.contains(&PathBuf::from("app")));
    assert!(!meta.include_paths.contains(&PathBuf::from("demo")));
}

#[test]
fn test_project_name_directory_probed_last() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"demo\"\n").unwrap();
    fs::create_dir(dir.path().join("demo")).unwrap();

    let meta = discover(&dir);
    assert_eq!(meta.include_paths[0], PathBuf::from("demo"));
}

#[test]
fn test_manifest_and_requirements_always_included() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"demo\"\n").unwrap();
    fs::create_dir(dir.path().join("src")).unwrap();
    fs::write(dir.path().join(REQUIREMENTS), "flask\n").unwrap();

    let meta = discover(&dir);
    assert!(meta.include_paths.contains(&PathBuf::from("pyproject.toml")));
    assert!(meta.include_paths.contains(&PathBuf::from(REQUIREMENTS)));
}

#[test]
fn test_flat_project_includes_whole_context() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("main.py"), "print()").unwrap();
    fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"demo\"\n").unwrap();

    let meta = discover(&dir);
    assert_eq!(meta.include_paths, vec![PathBuf::from(".")]);
}

// =============================================================================
// Dependency Source Tests
// =============================================================================

#[test]
fn test_venv_probe_order() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join(".venv")).unwrap();
    fs::create_dir(dir.path().join("env")).unwrap();

    // venv/ absent, so .venv/ (probed before env/) wins.
    assert_eq!(
        discover(&dir).deps_source,
        DepsSource::Virtualenv(dir.path().join(".venv"))
    );
}

#[test]
fn test_requirements_when_no_venv() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(REQUIREMENTS), "flask==2.0\n").unwrap();

    assert_eq!(
        discover(&dir).deps_source,
        DepsSource::RequirementsFile(dir.path().join(REQUIREMENTS))
    );
}

#[test]
fn test_custom_requirements_name_respected() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("requirements-prod.txt"), "flask\n").unwrap();
    fs::write(dir.path().join(REQUIREMENTS), "flask\ndev-tool\n").unwrap();

    let meta = ProjectMetadata::discover(dir.path(), "requirements-prod.txt").unwrap();
    assert_eq!(
        meta.deps_source,
        DepsSource::RequirementsFile(dir.path().join("requirements-prod.txt"))
    );
}

#[test]
fn test_no_deps_source() {
    let dir = TempDir::new().unwrap();
    assert_eq!(discover(&dir).deps_source, DepsSource::None);
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_context_must_be_a_directory() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("not-a-dir");
    fs::write(&file, "x").unwrap();

    for path in [Path::new("/does/not/exist"), file.as_path()] {
        let err = ProjectMetadata::discover(path, REQUIREMENTS).unwrap_err();
        assert!(matches!(err, Error::ProjectNotFound { .. }));
    }
}
