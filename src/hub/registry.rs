use super::{DeviceCredential, DeviceRegistry};
use crate::config::ConnectionDescriptor;
use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Device identity registry reached over the hub's HTTPS control plane.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: Client,
    base_url: Url,
    api_version: String,
    authorization: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRequest<'a> {
    device_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRecord {
    device_id: String,
    authentication: Option<Authentication>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authentication {
    symmetric_key: Option<SymmetricKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymmetricKey {
    primary_key: Option<String>,
}

impl DeviceRecord {
    fn into_credential(self) -> HubResult<DeviceCredential> {
        let primary_key = self
            .authentication
            .and_then(|a| a.symmetric_key)
            .and_then(|k| k.primary_key)
            .ok_or_else(|| {
                HubError::fatal(format!(
                    "device '{}' has no symmetric primary key",
                    self.device_id
                ))
            })?;

        Ok(DeviceCredential {
            device_id: self.device_id,
            primary_key,
        })
    }
}

impl HttpRegistry {
    pub fn new(
        descriptor: &ConnectionDescriptor,
        api_version: impl Into<String>,
        timeout: Duration,
    ) -> HubResult<Self> {
        let host = descriptor.require_host()?;
        let scheme = if descriptor.use_tls().unwrap_or(true) {
            "https"
        } else {
            "http"
        };
        let mut base_url = Url::parse(&format!("{}://{}", scheme, host))
            .map_err(|e| HubError::fatal(format!("invalid registry host '{}': {}", host, e)))?;
        if let Some(port) = descriptor.port()? {
            base_url
                .set_port(Some(port))
                .map_err(|_| HubError::fatal(format!("cannot set port on '{}'", base_url)))?;
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::fatal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_version: api_version.into(),
            authorization: descriptor.shared_access_signature().map(str::to_string),
        })
    }

    /// Registry URL of one device identity. The name always lands in a single
    /// escaped path segment.
    pub fn device_url(&self, name: &str) -> HubResult<Url> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(HubError::fatal(format!("invalid device name '{}'", name)));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| HubError::fatal(format!("registry URL '{}' cannot carry a path", self.base_url)))?
            .clear()
            .push("devices")
            .push(name);
        url.query_pairs_mut()
            .clear()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        name: &str,
        body: Option<DeviceRequest<'_>>,
    ) -> HubResult<(StatusCode, String)> {
        let url = self.device_url(name)?;
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, url);
        if let Some(token) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;
        Ok((status, text))
    }
}

fn classify_transport_error(err: reqwest::Error) -> HubError {
    if err.is_timeout() {
        HubError::timeout(err.to_string())
    } else if err.is_builder() || err.is_decode() {
        HubError::fatal(err.to_string())
    } else {
        HubError::transient(err.to_string())
    }
}

/// Maps a non-success registry response onto the error taxonomy.
pub fn classify_status(status: StatusCode, name: &str, body: &str) -> HubError {
    match status {
        StatusCode::CONFLICT => HubError::AlreadyExists(name.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            HubError::timeout(format!("registry returned {}", status))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            HubError::transient(format!("registry throttled the request: {}", body))
        }
        s if s.is_server_error() => HubError::transient(format!("registry returned {}: {}", s, body)),
        StatusCode::NOT_FOUND => HubError::fatal(format!("device '{}' not found", name)),
        s => HubError::fatal(format!("registry returned {}: {}", s, body)),
    }
}

fn parse_device(body: &str) -> HubResult<DeviceCredential> {
    let record: DeviceRecord = serde_json::from_str(body)
        .map_err(|e| HubError::fatal(format!("invalid device record: {}", e)))?;
    record.into_credential()
}

#[async_trait]
impl DeviceRegistry for HttpRegistry {
    async fn add_device(&self, name: &str) -> HubResult<DeviceCredential> {
        let (status, body) = self
            .request(Method::PUT, name, Some(DeviceRequest { device_id: name }))
            .await?;
        if !status.is_success() {
            return Err(classify_status(status, name, &body));
        }

        info!("Created device identity {}", name);
        parse_device(&body)
    }

    async fn get_device(&self, name: &str) -> HubResult<DeviceCredential> {
        let (status, body) = self.request(Method::GET, name, None).await?;
        if !status.is_success() {
            return Err(classify_status(status, name, &body));
        }

        parse_device(&body)
    }
}
