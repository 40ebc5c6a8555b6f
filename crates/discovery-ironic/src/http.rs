use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovm_keystone::KeystoneClient;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::Error;
use crate::{IronicNode, NodeInventory};

/// Catalog service type of the bare metal API.
pub const SERVICE_TYPE: &str = "baremetal";

static API_VERSION_HEADER: &str = "X-OpenStack-Ironic-API-Version";

/// Options for creating an [`IronicInventory`].
pub struct IronicInventoryOptions {
    /// Identity session used to authenticate and find the endpoint.
    pub identity: Arc<KeystoneClient>,

    /// Microversion sent with every request, e.g. `1.22`.
    pub api_version: String,

    /// Attempts per listing before giving up.
    pub max_attempts: u32,

    /// Pause between two attempts.
    pub retry_delay: Duration,
}

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    nodes: Vec<IronicNode>,
}

/// Lists nodes from the OpenStack bare metal API.
pub struct IronicInventory {
    identity: Arc<KeystoneClient>,
    api_version: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl IronicInventory {
    /// Creates an inventory.
    #[must_use]
    pub fn new(
        IronicInventoryOptions {
            identity,
            api_version,
            max_attempts,
            retry_delay,
        }: IronicInventoryOptions,
    ) -> Self {
        Self {
            identity,
            api_version,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    async fn list_once(&self) -> Result<Vec<IronicNode>, Error> {
        let session = self.identity.session().await?;
        let endpoint = session.endpoint(SERVICE_TYPE)?;
        let url = Url::parse(&format!(
            "{}/v1/nodes/detail",
            endpoint.as_str().trim_end_matches('/')
        ))?;
        debug!(%url, "listing bare metal nodes");

        let response = self
            .identity
            .http()
            .get(url)
            .header("X-Auth-Token", &session.token)
            .header(API_VERSION_HEADER, &self.api_version)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<NodeList>().await?.nodes),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.identity.invalidate().await;
                Err(Error::Unauthorized)
            }
            status => Err(Error::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl NodeInventory for IronicInventory {
    type Error = Error;

    #[instrument(skip(self))]
    async fn list_nodes(&self) -> Result<Vec<IronicNode>, Self::Error> {
        let mut attempt = 1;

        loop {
            match self.list_once().await {
                Ok(nodes) => return Ok(nodes),
                Err(e) if e.is_authentication() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(attempt, max_attempts = self.max_attempts, error = %e, "listing nodes failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use ovm_keystone::KeystoneOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Backend {
        base: String,
        listings: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
        reject: bool,
    }

    async fn issue_token(State(backend): State<Backend>) -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert("X-Subject-Token", "tok".parse().unwrap());
        let body = json!({
            "token": {
                "catalog": [{
                    "type": "baremetal",
                    "endpoints": [{ "interface": "public", "url": format!("{}/", backend.base) }]
                }]
            }
        });
        (AxumStatus::CREATED, headers, body.to_string())
    }

    async fn list_nodes(State(backend): State<Backend>, headers: HeaderMap) -> impl IntoResponse {
        backend.listings.fetch_add(1, Ordering::SeqCst);
        assert_eq!(headers.get(API_VERSION_HEADER).unwrap(), "1.22");

        if backend.reject {
            return (AxumStatus::UNAUTHORIZED, String::new());
        }
        if backend
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return (AxumStatus::SERVICE_UNAVAILABLE, String::new());
        }

        let body = json!({
            "nodes": [{
                "uuid": "node-1",
                "driver": "agent_pxe_oneview",
                "driver_info": { "server_hardware_uri": "/rest/server-hardware/sh-1" }
            }]
        });
        (AxumStatus::OK, body.to_string())
    }

    async fn serve(failures: usize, reject: bool) -> (Backend, IronicInventory) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let backend = Backend {
            base: base.clone(),
            listings: Arc::default(),
            failures: Arc::new(AtomicUsize::new(failures)),
            reject,
        };
        let app = Router::new()
            .route("/v3/auth/tokens", post(issue_token))
            .route("/v1/nodes/detail", get(list_nodes))
            .with_state(backend.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let identity = KeystoneClient::new(KeystoneOptions {
            auth_url: Url::parse(&base).unwrap(),
            username: "ironic".to_string(),
            password: "secret".to_string(),
            project_name: "service".to_string(),
            insecure: false,
        })
        .unwrap();

        let inventory = IronicInventory::new(IronicInventoryOptions {
            identity: Arc::new(identity),
            api_version: "1.22".to_string(),
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        });

        (backend, inventory)
    }

    #[tokio::test]
    async fn test_lists_nodes_after_transient_failures() {
        let (backend, inventory) = serve(2, false).await;

        let nodes = inventory.list_nodes().await.unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].uuid, "node-1");
        assert_eq!(backend.listings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (backend, inventory) = serve(5, false).await;

        assert_matches!(
            inventory.list_nodes().await,
            Err(Error::Status { status: 503, .. })
        );
        assert_eq!(backend.listings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_token_is_not_retried() {
        let (backend, inventory) = serve(0, true).await;

        assert_matches!(inventory.list_nodes().await, Err(Error::Unauthorized));
        assert_eq!(backend.listings.load(Ordering::SeqCst), 1);
    }
}
