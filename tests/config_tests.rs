//! Tests for build plan assembly and precedence.
//!
//! Precedence is explicit override > config file > detected default,
//! with unknown keys failing fast.

use pyoci::{BuildPlan, Error, PlanOverrides, SbomFormat};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn with_config(body: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pyoci.toml"), body).unwrap();
    dir
}

fn tag_override() -> PlanOverrides {
    PlanOverrides {
        tag: Some("demo:v1".to_string()),
        ..Default::default()
    }
}

// =============================================================================
// Precedence Tests
// =============================================================================

#[test]
fn test_full_config_file_round_trip() {
    let dir = with_config(concat!(
        "[build]\n",
        "tag = \"file/app:v3\"\n",
        "workdir = \"/srv\"\n",
        "base-image = \"python:3.12-slim\"\n",
        "platform = \"linux/arm64\"\n",
        "include-deps = true\n",
        "requirements-file = \"requirements-prod.txt\"\n",
        "push = true\n",
        "registry = \"registry.example.com\"\n",
        "reproducible = true\n",
        "generate-sbom = \"cyclonedx\"\n",
        "insecure-hosts = [\"registry.local:5000\"]\n",
        "\n",
        "[build.env]\n",
        "LOG_LEVEL = \"info\"\n",
        "\n",
        "[build.labels]\n",
        "team = \"platform\"\n",
        "\n",
        "[registry]\n",
        "username = \"ci\"\n",
        "password = \"hunter2\"\n",
    ));

    let plan = BuildPlan::assemble(dir.path(), PlanOverrides::default()).unwrap();

    assert_eq!(plan.tag, "file/app:v3");
    assert_eq!(plan.workdir, "/srv");
    assert!(plan.workdir_explicit);
    assert_eq!(plan.base_image.as_deref(), Some("python:3.12-slim"));
    assert_eq!(plan.platform.to_string(), "linux/arm64");
    assert!(plan.include_deps);
    assert_eq!(plan.requirements_file, "requirements-prod.txt");
    assert!(plan.push);
    assert_eq!(plan.registry.as_deref(), Some("registry.example.com"));
    assert_eq!(plan.generate_sbom, Some(SbomFormat::CycloneDx));
    assert_eq!(plan.insecure_hosts, vec!["registry.local:5000".to_string()]);
    assert_eq!(
        plan.env,
        vec![("LOG_LEVEL".to_string(), "info".to_string())]
    );
    assert_eq!(plan.labels.get("team"), Some(&"platform".to_string()));
    assert_eq!(plan.credentials.username.as_deref(), Some("ci"));
}

#[test]
fn test_override_beats_file_beats_default() {
    let dir = with_config("[build]\ntag = \"file:v1\"\nplatform = \"linux/arm64\"\n");

    let plan = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            tag: Some("cli:v2".to_string()),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(plan.tag, "cli:v2", "override wins");
    assert_eq!(plan.platform.to_string(), "linux/arm64", "file beats default");
    assert_eq!(plan.workdir, "/app", "default fills the rest");
    assert!(!plan.workdir_explicit);
}

#[test]
fn test_env_merge_keeps_file_order_and_overrides_values() {
    let dir = with_config(
        "[build]\ntag = \"x:v1\"\n\n[build.env]\nA = \"file-a\"\nB = \"file-b\"\n",
    );

    let plan = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            env: vec![
                ("B".to_string(), "cli-b".to_string()),
                ("C".to_string(), "cli-c".to_string()),
            ],
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(
        plan.env,
        vec![
            ("A".to_string(), "file-a".to_string()),
            ("B".to_string(), "cli-b".to_string()),
            ("C".to_string(), "cli-c".to_string()),
        ]
    );
}

#[test]
fn test_label_merge_user_wins() {
    let dir = with_config(
        "[build]\ntag = \"x:v1\"\n\n[build.labels]\nteam = \"file\"\nstage = \"dev\"\n",
    );

    let plan = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            labels: BTreeMap::from([("team".to_string(), "cli".to_string())]),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(plan.labels.get("team"), Some(&"cli".to_string()));
    assert_eq!(plan.labels.get("stage"), Some(&"dev".to_string()));
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_unknown_build_key_rejected() {
    let dir = with_config("[build]\ntag = \"x:v1\"\nshiny_new_option = true\n");
    let err = BuildPlan::assemble(dir.path(), PlanOverrides::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(err.to_string().contains("shiny_new_option"));
}

#[test]
fn test_unknown_section_rejected() {
    let dir = with_config("[buidl]\ntag = \"x:v1\"\n");
    assert!(BuildPlan::assemble(dir.path(), PlanOverrides::default()).is_err());
}

#[test]
fn test_wrong_value_types_rejected() {
    let dir = with_config("[build]\ntag = \"x:v1\"\npush = \"yes\"\n");
    assert!(BuildPlan::assemble(dir.path(), PlanOverrides::default()).is_err());

    let dir = with_config("[build]\ntag = 42\n");
    assert!(BuildPlan::assemble(dir.path(), PlanOverrides::default()).is_err());
}

#[test]
fn test_invalid_platform_rejected() {
    let dir = TempDir::new().unwrap();
    let err = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            platform: Some("amd64".to_string()),
            ..tag_override()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn test_invalid_sbom_format_rejected() {
    let dir = TempDir::new().unwrap();
    let err = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            generate_sbom: Some("swid".to_string()),
            ..tag_override()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn test_relative_workdir_rejected() {
    let dir = TempDir::new().unwrap();
    let err = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            workdir: Some("app".to_string()),
            ..tag_override()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn test_missing_config_file_is_fine() {
    let dir = TempDir::new().unwrap();
    let plan = BuildPlan::assemble(dir.path(), tag_override()).unwrap();
    assert_eq!(plan.tag, "demo:v1");
}

// =============================================================================
// Derived Value Tests
// =============================================================================

#[test]
fn test_archive_prefix_strips_slashes() {
    let dir = TempDir::new().unwrap();
    let plan = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            workdir: Some("/opt/service/".to_string()),
            ..tag_override()
        },
    )
    .unwrap();
    assert_eq!(plan.archive_prefix(), "opt/service");
}

#[test]
fn test_default_output_dir_under_context() {
    let dir = TempDir::new().unwrap();
    let plan = BuildPlan::assemble(dir.path(), tag_override()).unwrap();
    assert_eq!(plan.output_dir, dir.path().join("dist").join("image"));
}

#[test]
fn test_cache_dir_override() {
    let dir = TempDir::new().unwrap();
    let plan = BuildPlan::assemble(
        dir.path(),
        PlanOverrides {
            cache_dir: Some(PathBuf::from("/tmp/custom-cache")),
            ..tag_override()
        },
    )
    .unwrap();
    assert_eq!(plan.cache_dir, Some(PathBuf::from("/tmp/custom-cache")));
}
