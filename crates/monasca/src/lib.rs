//! Monasca implementation of the metrics platform.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;

use async_trait::async_trait;
use ovm_keystone::KeystoneClient;
use ovm_metrics_platform::MetricsPlatform;
use ovm_model::Measurement;
use reqwest::StatusCode;
use tracing::{debug, error, info, instrument};
use url::Url;

/// Catalog service type of the monitoring API.
pub const SERVICE_TYPE: &str = "monitoring";

/// Posts measurement batches to the Monasca API resolved from the identity
/// catalog.
pub struct MonascaClient {
    identity: Arc<KeystoneClient>,
}

impl MonascaClient {
    /// Creates a client sharing the given identity session.
    #[must_use]
    pub const fn new(identity: Arc<KeystoneClient>) -> Self {
        Self { identity }
    }
}

fn metrics_url(endpoint: &Url) -> Result<Url, Error> {
    Ok(Url::parse(&format!(
        "{}/metrics",
        endpoint.as_str().trim_end_matches('/')
    ))?)
}

#[async_trait]
impl MetricsPlatform for MonascaClient {
    type Error = Error;

    /// Rejections by the API are logged and dropped. Identity and transport
    /// failures are returned.
    #[instrument(skip_all, fields(count = batch.len()))]
    async fn submit(&self, batch: &[Measurement]) -> Result<(), Self::Error> {
        let session = self.identity.session().await?;
        let url = metrics_url(&session.endpoint(SERVICE_TYPE)?)?;
        debug!(%url, "sending metrics");

        let response = self
            .identity
            .http()
            .post(url)
            .header("X-Auth-Token", &session.token)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!("metrics sent");
            return Ok(());
        }

        if status == StatusCode::UNAUTHORIZED {
            self.identity.invalidate().await;
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = status.as_u16(), %body, "metrics rejected");
        Ok(())
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
    use axum::routing::post;
    use ovm_keystone::KeystoneOptions;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;

    #[derive(Clone)]
    struct Backend {
        base: String,
        tokens_issued: Arc<Mutex<usize>>,
        received: Arc<Mutex<Vec<Value>>>,
        reject_with: Arc<Mutex<Option<AxumStatus>>>,
    }

    async fn issue_token(State(backend): State<Backend>) -> impl IntoResponse {
        let token = {
            let mut issued = backend.tokens_issued.lock();
            *issued += 1;
            format!("tok-{issued}")
        };
        let mut headers = HeaderMap::new();
        headers.insert("X-Subject-Token", token.parse().unwrap());
        let body = json!({
            "token": {
                "catalog": [{
                    "type": "monitoring",
                    "endpoints": [{ "interface": "public", "url": format!("{}/v2.0/", backend.base) }]
                }]
            }
        });
        (AxumStatus::CREATED, headers, body.to_string())
    }

    async fn receive_metrics(
        State(backend): State<Backend>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<Value>,
    ) -> AxumStatus {
        if let Some(status) = *backend.reject_with.lock() {
            return status;
        }
        assert!(headers.get("X-Auth-Token").is_some());
        backend.received.lock().push(body);
        AxumStatus::NO_CONTENT
    }

    async fn serve() -> (Backend, MonascaClient) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let backend = Backend {
            base: base.clone(),
            tokens_issued: Arc::default(),
            received: Arc::default(),
            reject_with: Arc::default(),
        };
        let app = Router::new()
            .route("/v3/auth/tokens", post(issue_token))
            .route("/v2.0/metrics", post(receive_metrics))
            .with_state(backend.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let identity = KeystoneClient::new(KeystoneOptions {
            auth_url: Url::parse(&base).unwrap(),
            username: "monasca-agent".to_string(),
            password: "secret".to_string(),
            project_name: "service".to_string(),
            insecure: false,
        })
        .unwrap();

        (backend, MonascaClient::new(Arc::new(identity)))
    }

    fn batch() -> Vec<Measurement> {
        vec![Measurement::new(
            "oneview.server_hardware",
            2.0,
            BTreeMap::from([("service".to_string(), "compute".to_string())]),
            BTreeMap::new(),
        )]
    }

    #[tokio::test]
    async fn test_posts_batch_to_metrics_endpoint() {
        let (backend, client) = serve().await;

        client.submit(&batch()).await.unwrap();

        let received = backend.received.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0][0]["name"], "oneview.server_hardware");
        assert_eq!(received[0][0]["value"], 2.0);
        assert_eq!(received[0][0]["dimensions"]["service"], "compute");
    }

    #[tokio::test]
    async fn test_rejection_is_dropped_and_expired_token_renewed() {
        let (backend, client) = serve().await;

        *backend.reject_with.lock() = Some(AxumStatus::UNAUTHORIZED);
        client.submit(&batch()).await.unwrap();
        assert!(backend.received.lock().is_empty());

        *backend.reject_with.lock() = None;
        client.submit(&batch()).await.unwrap();
        assert_eq!(*backend.tokens_issued.lock(), 2);
        assert_eq!(backend.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_identity_service_is_an_error() {
        let identity = KeystoneClient::new(KeystoneOptions {
            auth_url: Url::parse("http://127.0.0.1:9").unwrap(),
            username: "monasca-agent".to_string(),
            password: "secret".to_string(),
            project_name: "service".to_string(),
            insecure: false,
        })
        .unwrap();
        let client = MonascaClient::new(Arc::new(identity));

        assert_matches!(client.submit(&batch()).await, Err(Error::Identity(_)));
    }
}
