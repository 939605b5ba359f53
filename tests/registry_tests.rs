//! Tests for Distribution Spec v2 protocol pieces.
//!
//! Validates reference parsing, challenge parsing, and client
//! construction without a live registry, the protocol-pure surface a
//! registry cannot influence.

use pyoci::{parse_www_authenticate, Credential, ImageReference, RegistryClient};

// =============================================================================
// Image Reference Parsing (Distribution Spec)
// =============================================================================

#[test]
fn test_docker_hub_shorthand_references() {
    let cases = [
        ("nginx", "registry-1.docker.io", "library/nginx", "latest"),
        ("nginx:1.25", "registry-1.docker.io", "library/nginx", "1.25"),
        (
            "library/nginx:latest",
            "registry-1.docker.io",
            "library/nginx",
            "latest",
        ),
        (
            "python:3.11-slim",
            "registry-1.docker.io",
            "library/python",
            "3.11-slim",
        ),
    ];

    for (input, host, repo, tag) in cases {
        let parsed = ImageReference::parse(input).unwrap();
        assert_eq!(parsed.host, host, "host of {}", input);
        assert_eq!(parsed.repository, repo, "repo of {}", input);
        assert_eq!(parsed.reference, tag, "tag of {}", input);
    }
}

#[test]
fn test_fully_qualified_references() {
    let cases = [
        ("ghcr.io/user/app:v1", "ghcr.io", "user/app", "v1"),
        (
            "registry.example.com:5000/team/svc:2.0",
            "registry.example.com:5000",
            "team/svc",
            "2.0",
        ),
        ("localhost:5000/test:latest", "localhost:5000", "test", "latest"),
        ("quay.io/org/app", "quay.io", "org/app", "latest"),
    ];

    for (input, host, repo, tag) in cases {
        let parsed = ImageReference::parse(input).unwrap();
        assert_eq!(parsed.host, host);
        assert_eq!(parsed.repository, repo);
        assert_eq!(parsed.reference, tag);
    }
}

#[test]
fn test_digest_reference_roundtrip() {
    let digest = format!("sha256:{}", "0123456789abcdef".repeat(4));
    let input = format!("ghcr.io/org/app@{}", digest);
    let parsed = ImageReference::parse(&input).unwrap();

    assert_eq!(parsed.reference, digest);
    assert_eq!(parsed.to_string(), input);
}

#[test]
fn test_invalid_references_rejected() {
    for bad in [
        "",
        "has space:v1",
        "shell$(injection)",
        "tab\there",
    ] {
        assert!(
            ImageReference::parse(bad).is_err(),
            "{:?} should be rejected",
            bad
        );
    }

    let oversized = format!("ghcr.io/{}:v1", "a".repeat(600));
    assert!(ImageReference::parse(&oversized).is_err());
}

#[test]
fn test_malformed_digest_rejected() {
    assert!(ImageReference::parse("ghcr.io/org/app@sha256:short").is_err());
    assert!(ImageReference::parse("ghcr.io/org/app@md5:abcd").is_err());
}

// =============================================================================
// OAuth2 Challenge Parsing (Scenario: 401 + WWW-Authenticate)
// =============================================================================

#[test]
fn test_standard_bearer_challenge() {
    let header = "Bearer realm=\"https://auth.example/token\", service=\"example\", scope=\"repository:demo:push,pull\"";
    let challenge = parse_www_authenticate(header).unwrap();

    assert_eq!(challenge.realm, "https://auth.example/token");
    assert_eq!(challenge.service.as_deref(), Some("example"));
    // The scope keeps its internal comma.
    assert_eq!(challenge.scope.as_deref(), Some("repository:demo:push,pull"));
}

#[test]
fn test_challenge_without_scope() {
    let challenge =
        parse_www_authenticate("Bearer realm=\"https://ghcr.io/token\",service=\"ghcr.io\"")
            .unwrap();
    assert_eq!(challenge.realm, "https://ghcr.io/token");
    assert!(challenge.scope.is_none());
}

#[test]
fn test_challenge_parameter_order_irrelevant() {
    let challenge = parse_www_authenticate(
        "Bearer scope=\"repository:a:pull\",realm=\"https://r/token\",service=\"r\"",
    )
    .unwrap();
    assert_eq!(challenge.realm, "https://r/token");
    assert_eq!(challenge.scope.as_deref(), Some("repository:a:pull"));
}

#[test]
fn test_non_bearer_challenges_ignored() {
    assert!(parse_www_authenticate("Basic realm=\"x\"").is_none());
    assert!(parse_www_authenticate("Digest realm=\"x\"").is_none());
    assert!(parse_www_authenticate("Bearer ").is_none());
}

// =============================================================================
// Credential Encoding (Scenario D: Basic("u","p") -> "Basic dTpw")
// =============================================================================

#[test]
fn test_basic_credential_base64_encoding() {
    let cred = Credential::Basic {
        username: "u".to_string(),
        password: "p".to_string(),
    };
    assert_eq!(cred.header_value(), "Basic dTpw");
}

#[test]
fn test_bearer_credential_passthrough() {
    let cred = Credential::Bearer("X".to_string());
    assert_eq!(cred.header_value(), "Bearer X");
}

// =============================================================================
// Client Construction
// =============================================================================

#[test]
fn test_client_construction_for_common_hosts() {
    for host in ["ghcr.io", "localhost:5000", "registry.example.com:5000"] {
        let client = RegistryClient::new(host, None, &[]).unwrap();
        assert_eq!(client.host(), host);
    }
}

#[test]
fn test_client_accepts_credentials() {
    let cred = Credential::Basic {
        username: "u".to_string(),
        password: "p".to_string(),
    };
    assert!(RegistryClient::new("ghcr.io", Some(cred), &[]).is_ok());
}
