//! OpenStack cloud session
//!
//! Authenticates once against Keystone and implements [`CloudApi`] over the
//! compute (Nova), block storage (Cinder) and network (Neutron) REST APIs.
//!
//! ## Identity versions
//!
//! ```text
//! https://keystone:5000/v3    → POST /v3/auth/tokens   (X-Subject-Token)
//! https://keystone:5000/v2.0  → POST /v2.0/tokens      (access.token.id)
//! ```
//!
//! Opening a session is bounded by the connect timeout; every later request is
//! bounded by the request timeout of the underlying HTTP client.

use crate::cloud::{
    CloudApi, FloatingIpInfo, ServerInfo, ServerSpec, ServerStatus, SharedCloud, VolumeInfo,
    VolumeSpec, VolumeStatus,
};
use crate::config::{DebugMode, SessionConfig};
use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

/// Log target for `--debug` HTTP tracing
const HTTP_LOG_TARGET: &str = "lifecycle_probe::http";

/// Block storage service types, most recent first
const VOLUME_SERVICE_TYPES: [&str; 4] = ["volumev3", "volumev2", "block-storage", "volume"];

/// Opens cloud sessions
///
/// The probe opens exactly one session per run through this seam, which lets
/// tests substitute an in-memory cloud.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Authenticate and return a shared session handle
    async fn connect(&self, config: &SessionConfig) -> Result<SharedCloud>;
}

/// Connector for real OpenStack clouds
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenStackConnector;

#[async_trait]
impl Connector for OpenStackConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<SharedCloud> {
        let session = CloudSession::open(config).await?;
        Ok(Arc::new(session))
    }
}

/// Service endpoints resolved from the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Nova
    pub compute: String,
    /// Cinder
    pub volume: String,
    /// Neutron, including the `/v2.0` suffix
    pub network: String,
}

/// One public catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
struct CatalogEntry {
    service_type: String,
    region: Option<String>,
    url: String,
}

impl Endpoints {
    fn from_catalog(entries: &[CatalogEntry], region: Option<&str>) -> Result<Self> {
        let find = |types: &[&str]| -> Option<String> {
            types.iter().find_map(|t| {
                entries
                    .iter()
                    .filter(|e| e.service_type == *t)
                    .find(|e| region.is_none() || e.region.as_deref() == region)
                    .map(|e| e.url.trim_end_matches('/').to_string())
            })
        };
        let missing = |kind: &str| {
            ProbeError::connection(format!(
                "service catalog has no public {} endpoint{}",
                kind,
                region.map(|r| format!(" in region {}", r)).unwrap_or_default()
            ))
        };

        let compute = find(&["compute"]).ok_or_else(|| missing("compute"))?;
        let volume = find(&VOLUME_SERVICE_TYPES).ok_or_else(|| missing("volume"))?;
        let mut network = find(&["network"]).ok_or_else(|| missing("network"))?;
        if !network.ends_with("/v2.0") {
            network = join(&network, "v2.0");
        }

        Ok(Self {
            compute,
            volume,
            network,
        })
    }
}

/// Authenticated OpenStack session
///
/// Immutable after [`CloudSession::open`]; shared read-only across the
/// concurrent creation calls.
pub struct CloudSession {
    client: Client,
    token: String,
    endpoints: Endpoints,
    debug: Option<DebugMode>,
}

impl std::fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSession")
            .field("endpoints", &self.endpoints)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl CloudSession {
    /// Authenticate and resolve the service catalog.
    ///
    /// Bad input fails before any I/O with `InvalidConfig`; the whole
    /// exchange is bounded by the connect timeout.
    pub async fn open(config: &SessionConfig) -> Result<Self> {
        config.validate()?;

        let auth_url = Url::parse(&config.auth_url).map_err(|e| {
            ProbeError::config(format!("invalid --auth-url {}: {}", config.auth_url, e))
        })?;
        if !matches!(auth_url.scheme(), "http" | "https") {
            return Err(ProbeError::config(format!(
                "--auth-url must be http(s), got {}",
                auth_url.scheme()
            )));
        }

        let client = build_client(config)?;
        let connect_timeout = config.timeouts.connect;

        info!(auth_url = %auth_url, tenant = %config.tenant, "Opening cloud session");

        match tokio::time::timeout(connect_timeout, authenticate(&client, config, &auth_url)).await {
            Ok(Ok((token, endpoints))) => {
                debug!(?endpoints, "Session established");
                Ok(Self {
                    client,
                    token,
                    endpoints,
                    debug: config.debug,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::connection(format!(
                "no session from {} within {:?}",
                auth_url, connect_timeout
            ))),
        }
    }

    /// Resolved endpoints
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn send(&self, method: Method, url: String, body: Option<&Value>) -> Result<String> {
        log_request(self.debug, &method, &url, body);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("X-Auth-Token", &self.token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        log_response(self.debug, &method, &url, status, &text);

        if status == StatusCode::NOT_FOUND {
            return Err(ProbeError::NotFound(format!("{} {}", method, url)));
        }
        if !status.is_success() {
            return Err(ProbeError::Api {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        Ok(text)
    }

    async fn fetch<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let text = self.send(Method::GET, url, None).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn submit<T: DeserializeOwned>(&self, method: Method, url: String, body: Value) -> Result<T> {
        let text = self.send(method, url, Some(&body)).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn execute(&self, method: Method, url: String, body: Option<Value>) -> Result<()> {
        self.send(method, url, body.as_ref()).await.map(|_| ())
    }

    fn compute(&self, path: &str) -> String {
        join(&self.endpoints.compute, path)
    }

    fn volume(&self, path: &str) -> String {
        join(&self.endpoints.volume, path)
    }

    fn network(&self, path: &str) -> String {
        join(&self.endpoints.network, path)
    }

    async fn resolve_flavor(&self, flavor: &str) -> Result<String> {
        let list: NamedList = self.fetch(self.compute("flavors")).await?;
        resolve_named(&list.flavors, flavor, "flavor")
    }

    async fn resolve_image(&self, image: &str) -> Result<String> {
        let list: NamedList = self.fetch(self.compute("images")).await?;
        resolve_named(&list.images, image, "image")
    }

    async fn resolve_external_network(&self, pool: &str) -> Result<String> {
        let list: NetworkList = self
            .fetch(self.network("networks?router:external=True"))
            .await?;
        list.networks
            .into_iter()
            .find(|n| n.id == pool || n.name.as_deref() == Some(pool))
            .map(|n| n.id)
            .ok_or_else(|| ProbeError::NotFound(format!("floating IP pool {}", pool)))
    }
}

#[async_trait]
impl CloudApi for CloudSession {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerInfo> {
        let flavor_id = self.resolve_flavor(&spec.flavor).await?;
        let image_id = self.resolve_image(&spec.image).await?;

        let mut server = json!({
            "name": spec.name,
            "imageRef": image_id,
            "flavorRef": flavor_id,
            "key_name": spec.key_name,
            "security_groups": [{ "name": spec.security_group }],
        });
        if let Some(network) = &spec.network {
            server["networks"] = json!([{ "uuid": network }]);
        }

        let created: ServerEnvelope = self
            .submit(Method::POST, self.compute("servers"), json!({ "server": server }))
            .await?;
        let mut info = ServerInfo::from(created.server);
        if info.name.is_empty() {
            info.name = spec.name.clone();
        }
        Ok(info)
    }

    async fn get_server(&self, id: &str) -> Result<ServerInfo> {
        let envelope: ServerEnvelope = self
            .fetch(self.compute(&format!("servers/{}", id)))
            .await
            .map_err(|e| not_found_as(e, format!("server {}", id)))?;
        Ok(envelope.server.into())
    }

    async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        let list: ServerList = self.fetch(self.compute("servers/detail")).await?;
        Ok(list.servers.into_iter().map(ServerInfo::from).collect())
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        self.execute(Method::DELETE, self.compute(&format!("servers/{}", id)), None)
            .await
            .map_err(|e| not_found_as(e, format!("server {}", id)))
    }

    async fn allocate_floating_ip(&self, pool: &str, description: &str) -> Result<FloatingIpInfo> {
        let network_id = self.resolve_external_network(pool).await?;
        let body = json!({
            "floatingip": {
                "floating_network_id": network_id,
                "description": description,
            }
        });
        let created: FloatingIpEnvelope = self
            .submit(Method::POST, self.network("floatingips"), body)
            .await?;
        Ok(created.floatingip.into())
    }

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIpInfo>> {
        let list: FloatingIpList = self.fetch(self.network("floatingips")).await?;
        Ok(list.floatingips.into_iter().map(FloatingIpInfo::from).collect())
    }

    async fn associate_floating_ip(&self, fip_id: &str, server_id: &str) -> Result<()> {
        let ports: PortList = self
            .fetch(self.network(&format!("ports?device_id={}", server_id)))
            .await?;
        let port = ports
            .ports
            .into_iter()
            .next()
            .ok_or_else(|| ProbeError::NotFound(format!("port of server {}", server_id)))?;

        self.execute(
            Method::PUT,
            self.network(&format!("floatingips/{}", fip_id)),
            Some(json!({ "floatingip": { "port_id": port.id } })),
        )
        .await
    }

    async fn disassociate_floating_ip(&self, fip_id: &str) -> Result<()> {
        self.execute(
            Method::PUT,
            self.network(&format!("floatingips/{}", fip_id)),
            Some(json!({ "floatingip": { "port_id": Value::Null } })),
        )
        .await
    }

    async fn release_floating_ip(&self, fip_id: &str) -> Result<()> {
        self.execute(
            Method::DELETE,
            self.network(&format!("floatingips/{}", fip_id)),
            None,
        )
        .await
        .map_err(|e| not_found_as(e, format!("floating IP {}", fip_id)))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeInfo> {
        let body = json!({
            "volume": {
                "size": spec.size_gb,
                "name": spec.name,
                "description": spec.description,
            }
        });
        let created: VolumeEnvelope = self.submit(Method::POST, self.volume("volumes"), body).await?;
        Ok(created.volume.into())
    }

    async fn get_volume(&self, id: &str) -> Result<VolumeInfo> {
        let envelope: VolumeEnvelope = self
            .fetch(self.volume(&format!("volumes/{}", id)))
            .await
            .map_err(|e| not_found_as(e, format!("volume {}", id)))?;
        Ok(envelope.volume.into())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let list: VolumeList = self.fetch(self.volume("volumes/detail")).await?;
        Ok(list.volumes.into_iter().map(VolumeInfo::from).collect())
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        self.execute(Method::DELETE, self.volume(&format!("volumes/{}", id)), None)
            .await
            .map_err(|e| not_found_as(e, format!("volume {}", id)))
    }

    async fn attach_volume(&self, server_id: &str, volume_id: &str, device: &str) -> Result<()> {
        let body = json!({
            "volumeAttachment": {
                "volumeId": volume_id,
                "device": device,
            }
        });
        self.execute(
            Method::POST,
            self.compute(&format!("servers/{}/os-volume_attachments", server_id)),
            Some(body),
        )
        .await
    }

    async fn detach_volume(&self, server_id: &str, volume_id: &str) -> Result<()> {
        self.execute(
            Method::DELETE,
            self.compute(&format!(
                "servers/{}/os-volume_attachments/{}",
                server_id, volume_id
            )),
            None,
        )
        .await
    }
}

fn build_client(config: &SessionConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(config.timeouts.connect)
        .timeout(config.timeouts.request())
        .user_agent(concat!("lifecycle-probe/", env!("CARGO_PKG_VERSION")));

    if let Some(path) = &config.ca_file {
        let pem = std::fs::read(path).map_err(|e| {
            ProbeError::config(format!("cannot read --ca-file {}: {}", path.display(), e))
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            ProbeError::config(format!("invalid --ca-file {}: {}", path.display(), e))
        })?;
        builder = builder.add_root_certificate(cert);
    }

    builder
        .build()
        .map_err(|e| ProbeError::config(format!("cannot build HTTP client: {}", e)))
}

async fn authenticate(
    client: &Client,
    config: &SessionConfig,
    auth_url: &Url,
) -> Result<(String, Endpoints)> {
    let v3 = auth_url.path().contains("/v3");
    let (url, body) = if v3 {
        let url = if auth_url.path().ends_with("/auth/tokens") {
            auth_url.to_string()
        } else {
            join(auth_url.as_str(), "auth/tokens")
        };
        (url, v3_auth_body(config))
    } else {
        let url = if auth_url.path().ends_with("/tokens") {
            auth_url.to_string()
        } else {
            join(auth_url.as_str(), "tokens")
        };
        (url, v2_auth_body(config))
    };

    log_request(config.debug, &Method::POST, &url, Some(&redact(&body)));

    let response = client
        .post(&url)
        .header("Accept", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| ProbeError::connection(format!("{}: {}", url, e)))?;

    let status = response.status();
    let subject_token = response
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let text = response
        .text()
        .await
        .map_err(|e| ProbeError::connection(format!("{}: {}", url, e)))?;
    log_response(config.debug, &Method::POST, &url, status, "<token response>");

    if status == StatusCode::UNAUTHORIZED {
        return Err(ProbeError::InvalidCredentials(error_message(&text)));
    }
    if !status.is_success() {
        return Err(ProbeError::connection(format!(
            "identity service returned {}: {}",
            status.as_u16(),
            error_message(&text)
        )));
    }

    let region = config.region.as_deref();
    if v3 {
        let token = subject_token
            .ok_or_else(|| ProbeError::connection("identity response has no X-Subject-Token"))?;
        let parsed: V3TokenResponse = serde_json::from_str(&text)
            .map_err(|e| ProbeError::connection(format!("malformed token response: {}", e)))?;
        Ok((token, Endpoints::from_catalog(&parsed.catalog(), region)?))
    } else {
        let parsed: V2TokenResponse = serde_json::from_str(&text)
            .map_err(|e| ProbeError::connection(format!("malformed token response: {}", e)))?;
        let catalog = parsed.catalog();
        Ok((parsed.access.token.id, Endpoints::from_catalog(&catalog, region)?))
    }
}

fn v3_auth_body(config: &SessionConfig) -> Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username,
                        "domain": { "name": config.domain },
                        "password": config.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": config.tenant,
                    "domain": { "name": config.domain },
                }
            }
        }
    })
}

fn v2_auth_body(config: &SessionConfig) -> Value {
    json!({
        "auth": {
            "passwordCredentials": {
                "username": config.username,
                "password": config.password,
            },
            "tenantName": config.tenant,
        }
    })
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn not_found_as(err: ProbeError, what: String) -> ProbeError {
    if err.is_not_found() {
        ProbeError::NotFound(what)
    } else {
        err
    }
}

/// Replace every `password` value in a JSON document
fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if k == "password" && v.is_string() {
                        Value::String("***".to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Extract the human message from an OpenStack fault body.
///
/// Faults look like `{"itemNotFound": {"message": ..}}`,
/// `{"NeutronError": {"message": ..}}` or `{"error": {"message": ..}}`.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.get("message").and_then(Value::as_str).or_else(|| {
            v.as_object()?
                .values()
                .find_map(|inner| inner.get("message").and_then(Value::as_str))
        })
    });

    match message {
        Some(m) => m.to_string(),
        None => {
            let trimmed = body.trim();
            if trimmed.chars().count() > 200 {
                format!("{}...", trimmed.chars().take(200).collect::<String>())
            } else {
                trimmed.to_string()
            }
        }
    }
}

fn log_request(debug: Option<DebugMode>, method: &Method, url: &str, body: Option<&Value>) {
    if debug.is_some_and(|d| d.logs_requests()) {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        info!(target: HTTP_LOG_TARGET, %method, url, body, "request");
    }
}

fn log_response(debug: Option<DebugMode>, method: &Method, url: &str, status: StatusCode, body: &str) {
    if debug.is_some_and(|d| d.logs_responses()) {
        info!(
            target: HTTP_LOG_TARGET,
            %method,
            url,
            status = status.as_u16(),
            body,
            "response"
        );
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct V3TokenResponse {
    token: V3Token,
}

#[derive(Debug, Deserialize)]
struct V3Token {
    #[serde(default)]
    catalog: Vec<V3Service>,
}

#[derive(Debug, Deserialize)]
struct V3Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V3Endpoint>,
}

#[derive(Debug, Deserialize)]
struct V3Endpoint {
    interface: String,
    url: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
}

impl V3TokenResponse {
    fn catalog(&self) -> Vec<CatalogEntry> {
        self.token
            .catalog
            .iter()
            .flat_map(|service| {
                service
                    .endpoints
                    .iter()
                    .filter(|e| e.interface == "public")
                    .map(|e| CatalogEntry {
                        service_type: service.service_type.clone(),
                        region: e.region_id.clone().or_else(|| e.region.clone()),
                        url: e.url.clone(),
                    })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct V2TokenResponse {
    access: V2Access,
}

#[derive(Debug, Deserialize)]
struct V2Access {
    token: V2Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<V2Service>,
}

#[derive(Debug, Deserialize)]
struct V2Token {
    id: String,
}

#[derive(Debug, Deserialize)]
struct V2Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V2Endpoint>,
}

#[derive(Debug, Deserialize)]
struct V2Endpoint {
    #[serde(rename = "publicURL")]
    public_url: String,
    #[serde(default)]
    region: Option<String>,
}

impl V2TokenResponse {
    fn catalog(&self) -> Vec<CatalogEntry> {
        self.access
            .service_catalog
            .iter()
            .flat_map(|service| {
                service.endpoints.iter().map(|e| CatalogEntry {
                    service_type: service.service_type.clone(),
                    region: e.region.clone(),
                    url: e.public_url.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Named {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NamedList {
    #[serde(default)]
    flavors: Vec<Named>,
    #[serde(default)]
    images: Vec<Named>,
}

/// Match by ID first, then by name
fn resolve_named(items: &[Named], wanted: &str, kind: &str) -> Result<String> {
    items
        .iter()
        .find(|i| i.id == wanted)
        .or_else(|| items.iter().find(|i| i.name.as_deref() == Some(wanted)))
        .map(|i| i.id.clone())
        .ok_or_else(|| ProbeError::NotFound(format!("{} {}", kind, wanted)))
}

#[derive(Debug, Deserialize)]
struct NovaServer {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "OS-EXT-STS:task_state", default)]
    task_state: Option<String>,
}

impl From<NovaServer> for ServerInfo {
    fn from(s: NovaServer) -> Self {
        Self {
            id: s.id,
            name: s.name.unwrap_or_default(),
            status: s
                .status
                .as_deref()
                .map(ServerStatus::parse)
                .unwrap_or(ServerStatus::Build),
            task_state: s.task_state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: NovaServer,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<NovaServer>,
}

#[derive(Debug, Deserialize)]
struct CinderVolume {
    id: String,
    #[serde(default)]
    name: Option<String>,
    status: String,
}

impl From<CinderVolume> for VolumeInfo {
    fn from(v: CinderVolume) -> Self {
        Self {
            id: v.id,
            name: v.name.unwrap_or_default(),
            status: VolumeStatus::parse(&v.status),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VolumeEnvelope {
    volume: CinderVolume,
}

#[derive(Debug, Deserialize)]
struct VolumeList {
    #[serde(default)]
    volumes: Vec<CinderVolume>,
}

#[derive(Debug, Deserialize)]
struct NeutronFloatingIp {
    id: String,
    #[serde(default)]
    floating_ip_address: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    port_id: Option<String>,
}

impl From<NeutronFloatingIp> for FloatingIpInfo {
    fn from(f: NeutronFloatingIp) -> Self {
        Self {
            id: f.id,
            address: f.floating_ip_address.unwrap_or_default(),
            description: f.description.unwrap_or_default(),
            port_id: f.port_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FloatingIpEnvelope {
    floatingip: NeutronFloatingIp,
}

#[derive(Debug, Deserialize)]
struct FloatingIpList {
    #[serde(default)]
    floatingips: Vec<NeutronFloatingIp>,
}

#[derive(Debug, Deserialize)]
struct NetworkList {
    #[serde(default)]
    networks: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct PortList {
    #[serde(default)]
    ports: Vec<Named>,
}
