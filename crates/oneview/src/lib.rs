//! REST client for the HPE OneView appliance: server hardware status,
//! active alerts, MAC lookup and the message bus trust material.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod wire;

pub use error::{Error, Result};

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ovm_hardware::{HardwareStatusService, ServerHardwareLookup, TrustMaterial};
use ovm_model::{AlertMeta, ResourceId, StatusCode, parse_timestamp};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use wire::{
    Alert, CertificateRequest, Collection, ErrorBody, EulaAcceptance, KeyPair, LoginRequest,
    LoginResponse, ServerHardware,
};

/// REST API version requested from the appliance.
pub const API_VERSION: u32 = 300;

/// Most alerts attached to one measurement.
pub const MAX_ALERTS: usize = 13;

/// Pause between two attempts of a failed call.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// File names of the trust material written to the certificate directory.
pub const CA_FILE: &str = "caroot.pem";
/// Client key file name.
pub const KEY_FILE: &str = "key.pem";
/// Client certificate file name.
pub const CLIENT_FILE: &str = "client.pem";

static SERVER_HARDWARE_PREFIX: &str = "/rest/server-hardware/";
static CERTIFICATE_VALID: &str = "The existing certificate is still valid";

/// Options for creating a [`OneViewClient`].
#[derive(Clone, Debug)]
pub struct OneViewOptions {
    /// Appliance address. A bare host name is reached over HTTPS.
    pub host: String,

    /// User name.
    pub username: String,

    /// Password.
    pub password: String,

    /// Skip TLS certificate verification.
    pub allow_insecure_connections: bool,

    /// Extra CA bundle trusted for the appliance.
    pub tls_cacert_file: Option<PathBuf>,

    /// Attempts per call before giving up. Login failures are never retried.
    pub max_attempts: u32,

    /// Pause between two attempts.
    pub retry_delay: Duration,

    /// Directory the message bus trust material is written to.
    pub certificate_dir: PathBuf,
}

/// Client for one appliance, holding a login session.
pub struct OneViewClient {
    base_url: Url,
    certificate_dir: PathBuf,
    client: Client,
    max_attempts: u32,
    password: String,
    retry_delay: Duration,
    session: Mutex<Option<String>>,
    username: String,
}

impl OneViewClient {
    /// Creates a client. No request is made until the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not a valid address or the CA bundle
    /// cannot be loaded.
    pub fn new(
        OneViewOptions {
            host,
            username,
            password,
            allow_insecure_connections,
            tls_cacert_file,
            max_attempts,
            retry_delay,
            certificate_dir,
        }: OneViewOptions,
    ) -> Result<Self> {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            Url::parse(&host)?
        } else {
            Url::parse(&format!("https://{host}"))?
        };

        let mut builder = Client::builder().danger_accept_invalid_certs(allow_insecure_connections);
        if let Some(path) = tls_cacert_file {
            let pem = std::fs::read(&path).map_err(|source| Error::CaBundle {
                path: path.clone(),
                source,
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            base_url,
            certificate_dir,
            client: builder.build()?,
            max_attempts: max_attempts.max(1),
            password,
            retry_delay,
            session: Mutex::new(None),
            username,
        })
    }

    /// Link to an alert on the appliance's activity page.
    #[must_use]
    pub fn alert_link(&self, alert_uri: &str) -> String {
        format!(
            "{}/#/activity/r{alert_uri}",
            self.base_url.as_str().trim_end_matches('/')
        )
    }

    /// Logs in unless a session is already open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the appliance rejects the
    /// credentials, or the transport error if it cannot be reached.
    pub async fn check_credentials(&self) -> Result<()> {
        self.session_id().await.map(|_| ())
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => {
                    error!(operation, attempt, error = %e, "appliance call failed");
                    return Err(e);
                }
                Err(e) => {
                    info!(operation, attempt, error = %e, "trying again");
                    if matches!(e, Error::SessionExpired) {
                        self.session.lock().await.take();
                    }
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn session_id(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }

        let id = self.login().await?;
        *session = Some(id.clone());
        Ok(id)
    }

    #[instrument(skip(self), fields(user = %self.username))]
    async fn login(&self) -> Result<String> {
        let response = self
            .client
            .post(self.url("/rest/login-sessions")?)
            .header("X-Api-Version", API_VERSION)
            .json(&LoginRequest {
                user_name: &self.username,
                password: &self.password,
                login_msg_ack: true,
            })
            .send()
            .await?;

        if response.status().as_u16() == 401 {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            return Err(Error::Authentication(
                body.message.unwrap_or_else(|| "invalid credentials".to_string()),
            ));
        }

        let LoginResponse { session_id } = checked(response).await?.json().await?;
        debug!("logged in to appliance");

        self.accept_eula(&session_id).await?;
        Ok(session_id)
    }

    async fn accept_eula(&self, session_id: &str) -> Result<()> {
        let pending: bool = self
            .client
            .get(self.url("/rest/appliance/eula/status")?)
            .header("X-Api-Version", API_VERSION)
            .send()
            .await?
            .json()
            .await?;

        if pending {
            info!("accepting appliance EULA");
            let response = self
                .client
                .post(self.url("/rest/appliance/eula/save")?)
                .header("X-Api-Version", API_VERSION)
                .header("Auth", session_id)
                .json(&EulaAcceptance {
                    support_access: "no",
                })
                .send()
                .await?;
            checked(response).await?;
        }

        Ok(())
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let session_id = self.session_id().await?;
        Ok(self
            .client
            .request(method, self.url(path)?)
            .header("X-Api-Version", API_VERSION)
            .header("Auth", session_id))
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(checked(request.send().await?).await?.json().await?)
    }

    async fn server_hardware(&self, id: &ResourceId) -> Result<Option<ServerHardware>> {
        let path = format!("{SERVER_HARDWARE_PREFIX}{id}");
        match self.get_json(self.request(Method::GET, &path).await?).await {
            Ok(server) => Ok(Some(server)),
            Err(Error::NotFound(message)) => {
                info!(%id, %message, "server hardware not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn all_server_hardware(&self) -> Result<Vec<ServerHardware>> {
        let request = self
            .request(Method::GET, SERVER_HARDWARE_PREFIX.trim_end_matches('/'))
            .await?
            .query(&[("start", "0"), ("count", "-1")]);
        let collection: Collection<ServerHardware> = self.get_json(request).await?;
        Ok(collection.members)
    }

    async fn active_alerts(&self, id: &ResourceId) -> Result<Vec<Alert>> {
        let resource_filter = format!("resourceUri='{SERVER_HARDWARE_PREFIX}{id}'");
        let request = self
            .request(Method::GET, "/rest/alerts")
            .await?
            .query(&[("filter", "alertState='Active'"), ("filter", resource_filter.as_str())]);
        let collection: Collection<Alert> = self.get_json(request).await?;
        Ok(collection.members)
    }

    async fn fetch_trust_material(&self) -> Result<TrustMaterial> {
        let ca_response = checked(
            self.request(Method::GET, "/rest/certificates/ca")
                .await?
                .send()
                .await?,
        )
        .await?;
        let ca_text = ca_response.text().await?;
        let ca_certificate = serde_json::from_str::<String>(&ca_text).unwrap_or(ca_text);

        let key_pair: KeyPair = self
            .get_json(
                self.request(
                    Method::GET,
                    "/rest/certificates/client/rabbitmq/keypair/default",
                )
                .await?,
            )
            .await?;

        Ok(TrustMaterial {
            ca_certificate,
            client_certificate: key_pair.certificate,
            client_key: key_pair.key,
        })
    }

    async fn generate_client_certificate(&self) -> Result<()> {
        let response = self
            .request(Method::POST, "/rest/certificates/client/rabbitmq")
            .await?
            .json(&CertificateRequest {
                kind: "RabbitMqClientCertV2",
                common_name: "default",
            })
            .send()
            .await?;

        match checked(response).await {
            Ok(_) | Err(Error::CertificateStillValid) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Writes the trust material to the certificate directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a file cannot be written.
    pub async fn save_trust_material(&self, material: &TrustMaterial) -> Result<()> {
        tokio::fs::create_dir_all(&self.certificate_dir)
            .await
            .map_err(|source| Error::CertificateIo {
                path: self.certificate_dir.clone(),
                source,
            })?;

        for (name, contents) in [
            (CA_FILE, &material.ca_certificate),
            (KEY_FILE, &material.client_key),
            (CLIENT_FILE, &material.client_certificate),
        ] {
            let path = self.certificate_dir.join(name);
            tokio::fs::write(&path, contents)
                .await
                .map_err(|source| Error::CertificateIo { path, source })?;
        }

        debug!(dir = %self.certificate_dir.display(), "trust material saved");
        Ok(())
    }
}

async fn checked(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_for(response).await)
    }
}

async fn error_for(response: Response) -> Error {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let message = body.message.unwrap_or(text);

    if message.contains(CERTIFICATE_VALID) {
        return Error::CertificateStillValid;
    }

    if let Some(code) = body.error_code.as_deref() {
        debug!(status, code, "appliance error response");
    }

    match status {
        400 => Error::BadRequest(message),
        401 => Error::SessionExpired,
        404 => Error::NotFound(message),
        _ => Error::Api { status, message },
    }
}

#[async_trait]
impl HardwareStatusService for OneViewClient {
    type Error = Error;

    #[instrument(skip(self))]
    async fn get_status(
        &self,
        id: &ResourceId,
    ) -> Result<Option<(StatusCode, DateTime<Utc>)>> {
        let Some(server) = self
            .with_retry("get_server_hardware", || self.server_hardware(id))
            .await?
        else {
            return Ok(None);
        };

        let code = self.get_status_for_code(&server.status)?;
        let modified_at = parse_timestamp(&server.modified)?;
        Ok(Some((code, modified_at)))
    }

    fn get_status_for_code(&self, name: &str) -> Result<StatusCode> {
        name.parse()
            .map_err(|_| Error::UnknownStatus(name.to_string()))
    }

    #[instrument(skip(self))]
    async fn get_alerts(&self, id: &ResourceId, status: StatusCode) -> Result<AlertMeta> {
        if status == StatusCode::Ok {
            return Ok(AlertMeta::new());
        }

        let alerts = self
            .with_retry("get_server_hardware_alerts", || self.active_alerts(id))
            .await?;

        Ok(alerts
            .into_iter()
            .take(MAX_ALERTS)
            .map(|alert| {
                let link = self.alert_link(&alert.uri);
                (alert.uri, link)
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_trust_material(&self) -> Result<TrustMaterial> {
        let material = self
            .with_retry("get_certificates", || self.fetch_trust_material())
            .await?;
        self.save_trust_material(&material).await?;
        Ok(material)
    }

    #[instrument(skip(self))]
    async fn validate_trust_material(&self) -> Result<()> {
        self.with_retry("validate_certificates", || {
            self.generate_client_certificate()
        })
        .await
    }
}

#[async_trait]
impl ServerHardwareLookup for OneViewClient {
    type Error = Error;

    #[instrument(skip(self))]
    async fn server_hardware_for_mac(&self, mac: &str) -> Result<Option<ResourceId>> {
        let servers = self
            .with_retry("get_server_hardware_uuid", || self.all_server_hardware())
            .await?;

        let found = servers
            .into_iter()
            .find(|server| server.has_mac(mac))
            .map(|server| ResourceId::new(server.uuid));

        if found.is_none() {
            warn!(mac, "no server hardware owns mac");
        }

        Ok(found)
    }
}
