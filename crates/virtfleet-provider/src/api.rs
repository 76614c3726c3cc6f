//! HTTP client for backend management APIs (LXD/Incus REST, Proxmox VE).

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use virtfleet_store::{ExecutionRule, Provider, ProviderKind};

use crate::error::{truncate, ProviderError, Result};

/// How requests are authenticated.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    /// No authentication.
    None,
    /// Proxmox API token: `Authorization: PVEAPIToken=<id>=<secret>`.
    ProxmoxToken {
        /// Token ID, `user@realm!name`.
        id: String,
        /// Token secret.
        secret: String,
    },
    /// TLS client certificate (LXD/Incus trust store).
    ClientCert {
        /// PEM certificate followed by the PEM private key.
        identity_pem: Vec<u8>,
    },
}

/// A JSON API client bound to one provider endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    auth_header: Option<String>,
}

impl ApiClient {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidConfig` if the TLS identity is invalid
    /// or the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, skip_tls_verify: bool, timeout: Duration, auth: ApiAuth) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verify);

        let mut auth_header = None;
        match auth {
            ApiAuth::None => {}
            ApiAuth::ProxmoxToken { id, secret } => {
                auth_header = Some(format!("PVEAPIToken={id}={secret}"));
            }
            ApiAuth::ClientCert { identity_pem } => {
                let identity = reqwest::Identity::from_pem(&identity_pem)
                    .map_err(|e| ProviderError::InvalidConfig(format!("client certificate: {e}")))?;
                builder = builder.identity(identity);
            }
        }

        let client = builder
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            auth_header,
        })
    }

    /// Build the API client of a provider, if it should use one.
    ///
    /// Returns `None` for Docker, for `ssh_only` providers, and when no
    /// credentials for the API are configured.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidConfig` if configured credentials cannot
    /// be loaded.
    pub fn for_provider(provider: &Provider) -> Result<Option<Self>> {
        if provider.execution_rule == ExecutionRule::SshOnly {
            return Ok(None);
        }
        let Some(port) = provider.effective_api_port() else {
            return Ok(None);
        };

        let creds = &provider.credentials;
        let auth = match provider.kind {
            ProviderKind::Docker => return Ok(None),
            ProviderKind::Proxmox => match (&creds.api_token_id, &creds.api_token_secret) {
                (Some(id), Some(secret)) => ApiAuth::ProxmoxToken {
                    id: id.clone(),
                    secret: secret.clone(),
                },
                _ => return Ok(None),
            },
            ProviderKind::Lxd | ProviderKind::Incus => match (&creds.cert_path, &creds.key_path) {
                (Some(cert), Some(key)) => {
                    let mut identity_pem = read_pem(cert)?;
                    identity_pem.push(b'\n');
                    identity_pem.extend(read_pem(key)?);
                    ApiAuth::ClientCert { identity_pem }
                }
                _ => return Ok(None),
            },
        };

        let base_url = format!("https://{}:{port}", host_for_url(provider.endpoint_host()));
        let timeout = Duration::from_secs(provider.ssh_execute_timeout_secs.max(1));
        Self::new(base_url, provider.api_skip_tls_verify, timeout, auth).map(Some)
    }

    /// The base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET path` and decode the JSON body.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::request`].
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    /// Send a request with an optional JSON body and decode the JSON response.
    ///
    /// An empty response body decodes as `Value::Null`.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error for connect failures and timeouts,
    /// `ProviderError::NotFound` for 404, and `ProviderError::Api` for any
    /// other non-success status.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(method = %method, url = %url, "Backend API request");

        let mut request = self.client.request(method, &url);
        if let Some(header) = &self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(map_send_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_send_error)?;

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(format!("{path}: {}", truncate(&text, 200))));
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: truncate(&text, 500),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("invalid JSON from {path}: {e}")))
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| ProviderError::InvalidConfig(format!("cannot read {path}: {e}")))
}

/// Bracket bare IPv6 literals for use in a URL authority.
#[must_use]
pub fn host_for_url(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn map_send_error(e: reqwest::Error) -> ProviderError {
    if e.is_connect() || e.is_timeout() {
        ProviderError::Connectivity(e.to_string())
    } else {
        ProviderError::Api {
            status: e.status().map_or(0, |s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtfleet_core::ProviderId;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, auth: ApiAuth) -> ApiClient {
        ApiClient::new(server.uri(), false, Duration::from_secs(5), auth).unwrap()
    }

    #[tokio::test]
    async fn proxmox_token_header_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/version"))
            .and(header("authorization", "PVEAPIToken=root@pam!ci=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {"version": "8.1"}})))
            .mount(&server)
            .await;

        let api = client(
            &server,
            ApiAuth::ProxmoxToken {
                id: "root@pam!ci".into(),
                secret: "s3cret".into(),
            },
        );
        let body = api.get("/api2/json/version").await.unwrap();
        assert_eq!(body["data"]["version"], "8.1");
    }

    #[tokio::test]
    async fn not_found_and_server_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(path("/1.0/instances/ghost"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;
        Mock::given(path("/1.0/instances/broken/state"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let api = client(&server, ApiAuth::None);
        let missing = api.get("/1.0/instances/ghost").await.unwrap_err();
        assert!(matches!(missing, ProviderError::NotFound(_)));

        let broken = api
            .request(Method::PUT, "/1.0/instances/broken/state", Some(&serde_json::json!({"action": "start"})))
            .await
            .unwrap_err();
        assert!(matches!(broken, ProviderError::Api { status: 500, .. }));
        assert!(!broken.is_retriable());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connectivity() {
        // Port 9 (discard) on localhost is closed in test environments.
        let api = ApiClient::new("http://127.0.0.1:9", false, Duration::from_secs(2), ApiAuth::None).unwrap();
        let err = api.get("/").await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[test]
    fn provider_without_credentials_has_no_client() {
        let provider = Provider::new(ProviderId::new(1), "pve", ProviderKind::Proxmox, "192.0.2.5");
        assert!(ApiClient::for_provider(&provider).unwrap().is_none());

        let mut with_token = provider.clone();
        with_token.credentials.api_token_id = Some("root@pam!ci".into());
        with_token.credentials.api_token_secret = Some("x".into());
        let api = ApiClient::for_provider(&with_token).unwrap().unwrap();
        assert_eq!(api.base_url(), "https://192.0.2.5:8006");

        with_token.execution_rule = ExecutionRule::SshOnly;
        assert!(ApiClient::for_provider(&with_token).unwrap().is_none());
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(host_for_url("2001:db8::1"), "[2001:db8::1]");
        assert_eq!(host_for_url("pve.example.net"), "pve.example.net");
    }
}
