// Async HTTP client for the device connection registry.
//
// Base path: /v1/
// Auth: X-API-KEY header

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;
use crate::types::{AgentMessage, AgentReply, DeviceConnection, ListResponse};

// ── Error response shape from the registry ───────────────────────────

#[derive(serde::Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

/// Async client for the device connection registry.
///
/// Lists connected devices, reads per-device connection metadata and
/// relays synchronous agent requests (`get-router-config` and friends).
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RegistryClient {
    /// Build from an API key and transport config.
    ///
    /// Injects `X-API-KEY` as a default header on every request.
    pub fn from_api_key(
        base_url: &str,
        api_key: &SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let mut key_value =
            HeaderValue::from_str(api_key.expose_secret()).map_err(|_| Error::InvalidApiKey)?;
        key_value.set_sensitive(true);
        headers.insert("X-API-KEY", key_value);

        let http = transport.build_client(headers)?;
        let base_url = Self::normalize_base_url(base_url)?;
        Ok(Self { http, base_url })
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    pub fn from_reqwest(base_url: &str, http: reqwest::Client) -> Result<Self, Error> {
        let base_url = Self::normalize_base_url(base_url)?;
        Ok(Self { http, base_url })
    }

    fn normalize_base_url(raw: &str) -> Result<Url, Error> {
        let mut url = Url::parse(raw)?;
        let path = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{path}/"));
        Ok(url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    // ── HTTP verbs ───────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        self.handle_response(resp).await
    }

    async fn post_with_timeout<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("POST {url}");

        let resp = self
            .http
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }
                } else {
                    Error::Transport(e)
                }
            })?;
        self.handle_response(resp).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, Error> {
        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            serde_json::from_str(&body).map_err(|e| {
                let preview: String = body.chars().take(200).collect();
                Error::Deserialization {
                    message: format!("{e} (body preview: {preview:?})"),
                    body,
                }
            })
        } else {
            Err(self.parse_error(status, resp).await)
        }
    }

    async fn parse_error(&self, status: reqwest::StatusCode, resp: reqwest::Response) -> Error {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Error::InvalidApiKey;
        }

        let device = resp
            .url()
            .path_segments()
            .and_then(|mut segs| {
                segs.by_ref().find(|s| *s == "devices")?;
                segs.next().map(str::to_owned)
            })
            .unwrap_or_default();
        let raw = resp.text().await.unwrap_or_default();

        if status == reqwest::StatusCode::CONFLICT {
            return Error::DeviceOffline { device };
        }

        if let Ok(err) = serde_json::from_str::<ErrorResponse>(&raw) {
            Error::Registry {
                status: status.as_u16(),
                message: err.message.unwrap_or_else(|| status.to_string()),
                code: err.code,
            }
        } else {
            Error::Registry {
                status: status.as_u16(),
                message: if raw.is_empty() {
                    status.to_string()
                } else {
                    raw
                },
                code: None,
            }
        }
    }

    // ━━ Public API ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// All devices with a live connection.
    pub async fn list_connected(&self) -> Result<Vec<DeviceConnection>, Error> {
        let page: ListResponse<DeviceConnection> = self.get("v1/devices/connected").await?;
        Ok(page.data)
    }

    /// Connection record for one device.
    pub async fn get_device(&self, device_id: &str) -> Result<DeviceConnection, Error> {
        self.get(&format!("v1/devices/{device_id}")).await
    }

    /// Send a request to the agent and wait for its reply.
    ///
    /// The call is bounded by `timeout` and never retried.
    pub async fn send_request(
        &self,
        device_id: &str,
        request: &AgentMessage,
        timeout: Duration,
    ) -> Result<serde_json::Value, Error> {
        let reply: AgentReply = self
            .post_with_timeout(&format!("v1/devices/{device_id}/requests"), request, timeout)
            .await?;
        if reply.ok {
            Ok(reply.data)
        } else {
            Err(Error::AgentRejected {
                device: device_id.to_owned(),
                message_name: request.message.clone(),
                reason: reply.message.unwrap_or_else(|| "unknown agent error".into()),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let client =
            RegistryClient::from_reqwest("http://registry.local/api", reqwest::Client::new())
                .unwrap();
        assert_eq!(client.base_url().as_str(), "http://registry.local/api/");
        assert_eq!(
            client.url("v1/devices/d1").unwrap().as_str(),
            "http://registry.local/api/v1/devices/d1"
        );
    }
}
