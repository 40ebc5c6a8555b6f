//! Minimal OpenStack identity (Keystone v3) client: password authentication
//! scoped to a project and service endpoint lookup in the token catalog.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::{Error, Result};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use url::Url;

static TOKEN_HEADER: &str = "X-Subject-Token";
static DEFAULT_DOMAIN: &str = "default";

/// Tokens this close to expiry are renewed before use.
const EXPIRY_MARGIN_SECONDS: i64 = 60;

/// Options for creating a [`KeystoneClient`].
#[derive(Clone, Debug)]
pub struct KeystoneOptions {
    /// Identity service URL, with or without the `/v3` suffix.
    pub auth_url: Url,

    /// User name.
    pub username: String,

    /// User password.
    pub password: String,

    /// Project the token is scoped to.
    pub project_name: String,

    /// Skip TLS certificate verification.
    pub insecure: bool,
}

/// One endpoint of a catalog service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Endpoint {
    /// `public`, `internal` or `admin`.
    pub interface: String,

    /// Region of the endpoint.
    #[serde(default)]
    pub region: Option<String>,

    /// Base URL.
    pub url: String,
}

/// One service of the token catalog.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CatalogEntry {
    /// Service type, e.g. `monitoring` or `baremetal`.
    #[serde(rename = "type")]
    pub service_type: String,

    /// Endpoints of the service.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// An authenticated token with its catalog.
#[derive(Clone, Debug)]
pub struct Session {
    /// Token to send as `X-Auth-Token`.
    pub token: String,

    /// Expiry reported by the identity service.
    pub expires_at: Option<DateTime<Utc>>,

    /// Service catalog.
    pub catalog: Vec<CatalogEntry>,
}

impl Session {
    /// Public endpoint URL of `service_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog has no such endpoint.
    pub fn endpoint(&self, service_type: &str) -> Result<Url> {
        self.endpoint_for_interface(service_type, "public")
    }

    /// Endpoint URL of `service_type` for the given interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog has no such endpoint.
    pub fn endpoint_for_interface(&self, service_type: &str, interface: &str) -> Result<Url> {
        let endpoint = self
            .catalog
            .iter()
            .filter(|entry| entry.service_type == service_type)
            .flat_map(|entry| entry.endpoints.iter())
            .find(|endpoint| endpoint.interface == interface)
            .ok_or_else(|| Error::EndpointNotFound {
                service_type: service_type.to_string(),
                interface: interface.to_string(),
            })?;

        Ok(Url::parse(&endpoint.url)?)
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|expires_at| expires_at - Duration::seconds(EXPIRY_MARGIN_SECONDS) > now)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

/// Identity client caching one project-scoped token.
pub struct KeystoneClient {
    client: Client,
    options: KeystoneOptions,
    session: Mutex<Option<Arc<Session>>>,
}

impl KeystoneClient {
    /// Creates a client. No request is made until a session is needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(options: KeystoneOptions) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(options.insecure)
            .build()?;

        Ok(Self {
            client,
            options,
            session: Mutex::new(None),
        })
    }

    /// The underlying HTTP client, shared with service clients.
    #[must_use]
    pub const fn http(&self) -> &Client {
        &self.client
    }

    /// A valid session, authenticating if there is none or it is about to
    /// expire.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn session(&self) -> Result<Arc<Session>> {
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_ref()
            && current.is_fresh(Utc::now())
        {
            return Ok(current.clone());
        }

        let fresh = Arc::new(self.authenticate().await?);
        *session = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops the cached session so the next call authenticates again.
    pub async fn invalidate(&self) {
        self.session.lock().await.take();
    }

    /// Authenticates with the password method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the credentials are rejected and
    /// other variants on transport or protocol failures.
    #[instrument(skip(self), fields(user = %self.options.username))]
    pub async fn authenticate(&self) -> Result<Session> {
        let url = tokens_url(&self.options.auth_url)?;
        debug!(%url, "requesting token");

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.options.username,
                            "domain": { "id": DEFAULT_DOMAIN },
                            "password": self.options.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.options.project_name,
                        "domain": { "id": DEFAULT_DOMAIN },
                    }
                }
            }
        });

        let response = self.client.post(url).json(&body).send().await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(Error::Unauthorized),
            status => {
                return Err(Error::Status {
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                });
            }
        }

        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(Error::MissingToken)?;

        let TokenResponse { token: body } = response.json().await?;
        info!(services = body.catalog.len(), "authenticated against identity service");

        Ok(Session {
            token,
            expires_at: body.expires_at,
            catalog: body.catalog,
        })
    }
}

fn tokens_url(auth_url: &Url) -> Result<Url> {
    let base = auth_url.as_str().trim_end_matches('/');
    let url = if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    };

    Ok(Url::parse(&url)?)
}
