//! Registry authentication providers.
//!
//! Credentials are resolved per registry *host* through a fixed, ordered
//! chain: explicit plan credentials, well-known environment variables,
//! the Docker credentials file, and finally the Azure CLI for matching
//! hosts. The first provider that yields a credential wins. Providers
//! are side-effect free except the CLI invocation, which runs under a
//! hard timeout and whose failure is non-fatal.

use crate::config::RegistryCredentials;
use crate::constants::{
    AZURE_REGISTRY_SUFFIX, CLOUD_CLI_TIMEOUT, ENV_GITHUB_TOKEN, ENV_REGISTRY_PASSWORD,
    ENV_REGISTRY_TOKEN, ENV_REGISTRY_USERNAME, GITHUB_REGISTRY_HOST,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// A resolved registry credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credential {
    /// Value for an `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            Credential::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                format!("Basic {}", encoded)
            }
            Credential::Bearer(token) => format!("Bearer {}", token),
        }
    }
}

/// One link in the auth chain.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;

    /// Resolves a credential for `host`, or `None` to pass.
    async fn resolve(&self, host: &str) -> Option<Credential>;
}

/// Explicit credentials from the build plan.
pub struct ExplicitProvider {
    credentials: RegistryCredentials,
}

impl ExplicitProvider {
    pub fn new(credentials: RegistryCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthProvider for ExplicitProvider {
    fn name(&self) -> &'static str {
        "explicit"
    }

    async fn resolve(&self, _host: &str) -> Option<Credential> {
        if let Some(token) = &self.credentials.token {
            return Some(Credential::Bearer(token.clone()));
        }
        match (&self.credentials.username, &self.credentials.password) {
            (Some(username), Some(password)) => Some(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Well-known environment variables.
///
/// Probe order: the GitHub token for `ghcr.io` hosts, the generic
/// `REGISTRY_TOKEN`, then the `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`
/// pair.
pub struct EnvProvider {
    overrides: Option<HashMap<String, String>>,
}

impl EnvProvider {
    /// Reads from the process environment.
    pub fn new() -> Self {
        Self { overrides: None }
    }

    /// Reads from a fixed map instead of the environment. Test hook.
    pub fn with_vars(vars: HashMap<String, String>) -> Self {
        Self {
            overrides: Some(vars),
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        match &self.overrides {
            Some(map) => map.get(key).cloned(),
            None => std::env::var(key).ok(),
        }
        .filter(|v| !v.is_empty())
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for EnvProvider {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn resolve(&self, host: &str) -> Option<Credential> {
        if host.contains(GITHUB_REGISTRY_HOST) {
            if let Some(token) = self.lookup(ENV_GITHUB_TOKEN) {
                return Some(Credential::Basic {
                    username: "USERNAME".to_string(),
                    password: token,
                });
            }
        }

        if let Some(token) = self.lookup(ENV_REGISTRY_TOKEN) {
            return Some(Credential::Bearer(token));
        }

        match (
            self.lookup(ENV_REGISTRY_USERNAME),
            self.lookup(ENV_REGISTRY_PASSWORD),
        ) {
            (Some(username), Some(password)) => Some(Credential::Basic { username, password }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// The Docker credentials file (`~/.docker/config.json`).
pub struct DockerConfigProvider {
    path: PathBuf,
}

impl DockerConfigProvider {
    /// Uses the conventional path under the user's home directory.
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".docker")
            .join("config.json");
        Self { path }
    }

    /// Uses an explicit file path. Test hook.
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Option<DockerConfigFile> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn decode_auth(auth: &str) -> Option<Credential> {
        let decoded = BASE64.decode(auth).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credential::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn entry_credential(entry: &DockerAuthEntry) -> Option<Credential> {
        if let Some(auth) = &entry.auth {
            if let Some(cred) = Self::decode_auth(auth) {
                return Some(cred);
            }
        }
        match (&entry.username, &entry.password) {
            (Some(username), Some(password)) => Some(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

impl Default for DockerConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for DockerConfigProvider {
    fn name(&self) -> &'static str {
        "docker-config"
    }

    async fn resolve(&self, host: &str) -> Option<Credential> {
        let config = self.load()?;

        // Exact and scheme-prefixed keys first, then substring matches.
        let candidates = [
            format!("https://{}", host),
            host.to_string(),
            format!("https://{}/v2/", host),
            format!("{}/v2/", host),
        ];
        for key in &candidates {
            if let Some(entry) = config.auths.get(key) {
                if let Some(cred) = Self::entry_credential(entry) {
                    debug!("docker config matched key '{}'", key);
                    return Some(cred);
                }
            }
        }

        for (key, entry) in &config.auths {
            if key.contains(host) {
                if let Some(cred) = Self::entry_credential(entry) {
                    debug!("docker config matched key '{}' by substring", key);
                    return Some(cred);
                }
            }
        }

        None
    }
}

/// Short-lived token from the Azure CLI, for `*.azurecr.io` hosts.
pub struct AzureCliProvider;

#[derive(Debug, Deserialize)]
struct AcrTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[async_trait]
impl AuthProvider for AzureCliProvider {
    fn name(&self) -> &'static str {
        "azure-cli"
    }

    async fn resolve(&self, host: &str) -> Option<Credential> {
        if !host.ends_with(AZURE_REGISTRY_SUFFIX) {
            return None;
        }
        let registry_name = host.split('.').next()?;

        let invocation = tokio::process::Command::new("az")
            .args([
                "acr",
                "login",
                "--name",
                registry_name,
                "--expose-token",
                "--output",
                "json",
            ])
            .output();

        let output = match tokio::time::timeout(CLOUD_CLI_TIMEOUT, invocation).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("azure cli invocation failed: {}", e);
                return None;
            }
            Err(_) => {
                warn!("azure cli timed out after {:?}", CLOUD_CLI_TIMEOUT);
                return None;
            }
        };

        if !output.status.success() {
            warn!("azure cli exited with {}", output.status);
            return None;
        }

        let parsed: AcrTokenResponse = serde_json::from_slice(&output.stdout).ok()?;
        Some(Credential::Basic {
            username: "00000000-0000-0000-0000-000000000000".to_string(),
            password: parsed.access_token,
        })
    }
}

/// Ordered provider chain; the first non-absent result wins.
pub struct AuthChain {
    providers: Vec<Box<dyn AuthProvider>>,
}

impl AuthChain {
    /// The default chain: explicit, environment, docker config, Azure
    /// CLI.
    pub fn new(explicit: RegistryCredentials) -> Self {
        let mut providers: Vec<Box<dyn AuthProvider>> = Vec::new();
        if !explicit.is_empty() {
            providers.push(Box::new(ExplicitProvider::new(explicit)));
        }
        providers.push(Box::new(EnvProvider::new()));
        providers.push(Box::new(DockerConfigProvider::new()));
        providers.push(Box::new(AzureCliProvider));
        Self { providers }
    }

    /// A chain over explicit providers. Test hook.
    pub fn with_providers(providers: Vec<Box<dyn AuthProvider>>) -> Self {
        Self { providers }
    }

    /// Resolves a credential for `host` through the chain.
    pub async fn resolve(&self, host: &str) -> Option<Credential> {
        for provider in &self.providers {
            if let Some(cred) = provider.resolve(host).await {
                debug!("credentials for {} from {} provider", host, provider.name());
                return Some(cred);
            }
        }
        debug!("no credentials for {}", host);
        None
    }
}
