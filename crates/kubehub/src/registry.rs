//! Image config lookups against OCI distribution registries.
//!
//! Pull credentials come from the `kubernetes.io/dockerconfigjson` Secrets
//! named on the Registry; token auth follows the `WWW-Authenticate` challenge
//! the registry answers an anonymous request with.

use std::time::Duration;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use kiln_controllers::image::parse_image_config;
use kiln_controllers::{ImageConfig, ImageConfigSource, ReconcileError, ReconcileResult};
use kiln_core::resources::Registry;
use kube::{Api, Client};
use metrics::counter;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// `host/repository[:tag|@digest]`, normalized the way `docker pull` reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub host: String,
    pub repository: String,
    /// Tag or digest.
    pub reference: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Option<Self> {
        let image = image.trim();
        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => match image.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
                _ => (image, "latest".to_string()),
            },
        };
        if name.is_empty() || reference.is_empty() {
            return None;
        }

        let (host, repository) = match name.split_once('/') {
            Some((first, rest)) if first.contains(['.', ':']) || first == "localhost" => (first, rest.to_string()),
            _ => (DOCKER_HUB, name.to_string()),
        };
        let host = if host == "index.docker.io" { DOCKER_HUB } else { host };
        let repository =
            if host == DOCKER_HUB && !repository.contains('/') { format!("library/{repository}") } else { repository };
        Some(Self { host: host.to_string(), repository, reference })
    }

    fn api_base(&self) -> String {
        match self.host.as_str() {
            DOCKER_HUB => format!("https://{DOCKER_HUB_API}"),
            h if h.starts_with("localhost") || h.starts_with("127.0.0.1") => format!("http://{h}"),
            h => format!("https://{h}"),
        }
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{reference}", self.api_base(), self.repository)
    }

    fn blob_url(&self, digest: &str) -> String { format!("{}/v2/{}/blobs/{digest}", self.api_base(), self.repository) }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).finish_non_exhaustive()
    }
}

fn same_registry(key: &str, host: &str) -> bool {
    let key = key.trim_start_matches("https://").trim_start_matches("http://");
    let key = key.split('/').next().unwrap_or_default();
    let hub = |h: &str| matches!(h, DOCKER_HUB | "index.docker.io" | DOCKER_HUB_API);
    key == host || (hub(key) && hub(host))
}

/// Credentials for `host` in a docker config (`{"auths": {host: {..}}}`).
pub fn credentials_for(config: &Value, host: &str) -> Option<Credentials> {
    let auths = config["auths"].as_object()?;
    let (_, entry) = auths.iter().find(|(key, _)| same_registry(key, host))?;
    if let (Some(username), Some(password)) = (entry["username"].as_str(), entry["password"].as_str()) {
        return Some(Credentials { username: username.to_string(), password: password.to_string() });
    }
    let decoded = STANDARD.decode(entry["auth"].as_str()?).ok()?;
    let (username, password) = std::str::from_utf8(&decoded).ok()?.split_once(':')?;
    Some(Credentials { username: username.to_string(), password: password.to_string() })
}

/// A `WWW-Authenticate` challenge.
#[derive(Debug, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer { realm: String, service: Option<String>, scope: Option<String> },
}

pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    let mut rest = params.trim();
    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim();
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => after.split_once(',').unwrap_or((after, "")),
        };
        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
        rest = remaining;
    }
    Some(Challenge::Bearer { realm: realm?, service, scope })
}

/// Digest of the linux/amd64 entry of an index, else its first entry.
pub fn pick_manifest(index: &Value) -> Option<&str> {
    let manifests = index["manifests"].as_array()?;
    manifests
        .iter()
        .find(|m| m["platform"]["os"] == "linux" && m["platform"]["architecture"] == "amd64")
        .or_else(|| manifests.first())
        .and_then(|m| m["digest"].as_str())
}

enum Auth {
    Anonymous,
    Basic(Credentials),
    Bearer(String),
}

fn backend(context: &str, e: impl std::fmt::Display) -> ReconcileError { ReconcileError::Backend(format!("{context}: {e}")) }

/// Reads image configs straight from the registry the image was pushed to.
pub struct RegistryImageConfig {
    client: Client,
    http: reqwest::Client,
}

impl RegistryImageConfig {
    pub fn new(client: Client) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, http })
    }

    async fn credentials(&self, registry: &Registry, namespace: &str, host: &str) -> ReconcileResult<Option<Credentials>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        for name in &registry.image_pull_secrets {
            let secret = secrets.get_opt(name).await.map_err(|e| backend(&format!("secret {namespace}/{name}"), e))?;
            let Some(raw) = secret.and_then(|s| s.data).and_then(|mut d| d.remove(DOCKER_CONFIG_KEY)) else {
                debug!(ns = namespace, secret = %name, "pull secret missing or not a docker config");
                continue;
            };
            let config: Value = match serde_json::from_slice(&raw.0) {
                Ok(v) => v,
                Err(e) => {
                    warn!(ns = namespace, secret = %name, error = %e, "unreadable docker config");
                    continue;
                }
            };
            if let Some(creds) = credentials_for(&config, host) {
                return Ok(Some(creds));
            }
        }
        Ok(None)
    }

    fn request(&self, url: &str, accept: &str, auth: &Auth) -> RequestBuilder {
        let req = self.http.get(url).header(ACCEPT, accept);
        match auth {
            Auth::Anonymous => req,
            Auth::Basic(c) => req.basic_auth(&c.username, Some(&c.password)),
            Auth::Bearer(token) => req.bearer_auth(token),
        }
    }

    async fn token(&self, realm: &str, service: Option<&str>, scope: Option<&str>, creds: Option<&Credentials>) -> ReconcileResult<String> {
        let mut req = self.http.get(realm);
        if let Some(service) = service {
            req = req.query(&[("service", service)]);
        }
        if let Some(scope) = scope {
            req = req.query(&[("scope", scope)]);
        }
        if let Some(c) = creds {
            req = req.basic_auth(&c.username, Some(&c.password));
        }
        let response = req.send().await.map_err(|e| backend(realm, e))?;
        let body: Value = successful(realm, response)?.json().await.map_err(|e| backend(realm, e))?;
        body["token"]
            .as_str()
            .or_else(|| body["access_token"].as_str())
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::Backend(format!("{realm}: token response carries no token")))
    }

    /// GET `url`, answering one auth challenge if the registry raises it.
    async fn fetch(&self, url: &str, accept: &str, auth: &mut Auth, creds: Option<&Credentials>) -> ReconcileResult<Value> {
        let mut response = self.request(url, accept, auth).send().await.map_err(|e| backend(url, e))?;
        if response.status() == StatusCode::UNAUTHORIZED && matches!(auth, Auth::Anonymous) {
            let header = response.headers().get(WWW_AUTHENTICATE).and_then(|v| v.to_str().ok()).unwrap_or_default();
            *auth = match parse_challenge(header) {
                Some(Challenge::Bearer { realm, service, scope }) => {
                    Auth::Bearer(self.token(&realm, service.as_deref(), scope.as_deref(), creds).await?)
                }
                Some(Challenge::Basic) => match creds {
                    Some(c) => Auth::Basic(c.clone()),
                    None => return Err(ReconcileError::Backend(format!("{url}: registry wants credentials"))),
                },
                None => return Err(ReconcileError::Backend(format!("{url}: unsupported challenge {header:?}"))),
            };
            response = self.request(url, accept, auth).send().await.map_err(|e| backend(url, e))?;
        }
        successful(url, response)?.json().await.map_err(|e| backend(url, e))
    }
}

fn successful(url: &str, response: Response) -> ReconcileResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ReconcileError::Backend(format!("GET {url}: {status}")))
    }
}

#[async_trait::async_trait]
impl ImageConfigSource for RegistryImageConfig {
    async fn image_config(&self, registry: &Registry, namespace: &str) -> ReconcileResult<ImageConfig> {
        let image = ImageRef::parse(&registry.image)
            .ok_or_else(|| ReconcileError::Invalid(format!("unparseable image reference {:?}", registry.image)))?;
        let creds = self.credentials(registry, namespace, &image.host).await?;
        let mut auth = Auth::Anonymous;

        let mut manifest = self.fetch(&image.manifest_url(&image.reference), MANIFEST_TYPES, &mut auth, creds.as_ref()).await?;
        if manifest["manifests"].is_array() {
            let digest = pick_manifest(&manifest)
                .ok_or_else(|| ReconcileError::Backend(format!("{}: empty image index", registry.image)))?
                .to_string();
            manifest = self.fetch(&image.manifest_url(&digest), MANIFEST_TYPES, &mut auth, creds.as_ref()).await?;
        }
        let config_digest = manifest["config"]["digest"]
            .as_str()
            .ok_or_else(|| ReconcileError::Backend(format!("{}: manifest has no config", registry.image)))?;
        let file = self.fetch(&image.blob_url(config_digest), "*/*", &mut auth, creds.as_ref()).await?;

        let result = parse_image_config(&file);
        counter!("image_config_lookups_total", 1u64, "result" => if result.is_ok() { "ok" } else { "error" });
        debug!(image = %registry.image, config = config_digest, "read image config");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(host: &str, repository: &str, reference: &str) -> Option<ImageRef> {
        Some(ImageRef { host: host.into(), repository: repository.into(), reference: reference.into() })
    }

    #[test]
    fn references_normalize_like_docker() {
        assert_eq!(ImageRef::parse("nginx"), image("docker.io", "library/nginx", "latest"));
        assert_eq!(ImageRef::parse("docker.io/library/nginx:1.27"), image("docker.io", "library/nginx", "1.27"));
        assert_eq!(ImageRef::parse("index.docker.io/paketo/run"), image("docker.io", "paketo/run", "latest"));
        assert_eq!(
            ImageRef::parse("localhost:5000/apps/a1@sha256:abc"),
            image("localhost:5000", "apps/a1", "sha256:abc")
        );
        assert_eq!(ImageRef::parse("reg.example/apps/a1:v2"), image("reg.example", "apps/a1", "v2"));
        assert_eq!(ImageRef::parse(""), None);
        assert_eq!(ImageRef::parse("nginx@"), None);
    }

    #[test]
    fn urls_target_the_registry_api() {
        let hub = ImageRef::parse("nginx:1").unwrap();
        assert_eq!(hub.manifest_url("1"), "https://registry-1.docker.io/v2/library/nginx/manifests/1");
        let local = ImageRef::parse("localhost:5000/a:1").unwrap();
        assert_eq!(local.blob_url("sha256:c"), "http://localhost:5000/v2/a/blobs/sha256:c");
    }

    #[test]
    fn bearer_challenge_keeps_quoted_commas() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#;
        assert_eq!(
            parse_challenge(header),
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".into(),
                service: Some("registry.docker.io".into()),
                scope: Some("repository:library/nginx:pull,push".into()),
            })
        );
        assert_eq!(parse_challenge(r#"Basic realm="reg""#), Some(Challenge::Basic));
        assert_eq!(parse_challenge(r#"Bearer service="x""#), None);
        assert_eq!(parse_challenge("Negotiate"), None);
    }

    #[test]
    fn docker_config_credentials() {
        let config = json!({ "auths": {
            "https://index.docker.io/v1/": { "auth": STANDARD.encode("hubuser:hubpass") },
            "reg.example": { "username": "robot", "password": "s3cret" }
        }});
        let hub = credentials_for(&config, "docker.io").unwrap();
        assert_eq!((hub.username.as_str(), hub.password.as_str()), ("hubuser", "hubpass"));
        assert_eq!(credentials_for(&config, "reg.example").unwrap().username, "robot");
        assert_eq!(credentials_for(&config, "other.example"), None);
        assert!(!format!("{hub:?}").contains("hubpass"));
    }

    #[test]
    fn index_prefers_linux_amd64() {
        let index = json!({ "manifests": [
            { "digest": "sha256:arm", "platform": { "os": "linux", "architecture": "arm64" } },
            { "digest": "sha256:amd", "platform": { "os": "linux", "architecture": "amd64" } }
        ]});
        assert_eq!(pick_manifest(&index), Some("sha256:amd"));
        let arm_only = json!({ "manifests": [{ "digest": "sha256:arm", "platform": { "os": "linux", "architecture": "arm64" } }] });
        assert_eq!(pick_manifest(&arm_only), Some("sha256:arm"));
        assert_eq!(pick_manifest(&json!({ "manifests": [] })), None);
    }
}
