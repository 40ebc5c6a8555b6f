//! In-memory stand-in for the hardware-management appliance, used in tests
//! and local runs.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ovm_hardware::{HardwareStatusService, ServerHardwareLookup, TrustMaterial};
use ovm_model::{AlertMeta, ResourceId, StatusCode};
use parking_lot::RwLock;

/// Which appliance operation a queued failure applies to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    /// `get_status`.
    Status,

    /// `get_alerts`.
    Alerts,

    /// `get_trust_material`.
    TrustMaterial,

    /// `validate_trust_material`.
    ValidateTrustMaterial,

    /// `server_hardware_for_mac`.
    MacLookup,
}

#[derive(Default)]
struct State {
    statuses: HashMap<ResourceId, (StatusCode, DateTime<Utc>)>,
    alerts: HashMap<ResourceId, AlertMeta>,
    macs: HashMap<String, ResourceId>,
    trust_material: TrustMaterial,
    failures: HashMap<Operation, VecDeque<Option<Error>>>,
}

/// Mock appliance with scripted statuses, alerts and failures.
#[derive(Default)]
pub struct MockHardware {
    state: RwLock<State>,
    status_calls: AtomicUsize,
    alert_calls: AtomicUsize,
    trust_calls: AtomicUsize,
}

impl MockHardware {
    /// Creates an appliance that knows no resources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status reported for `id`.
    pub fn set_status(&self, id: impl Into<ResourceId>, code: StatusCode, modified_at: DateTime<Utc>) {
        self.state
            .write()
            .statuses
            .insert(id.into(), (code, modified_at));
    }

    /// Forgets `id`, so status lookups return nothing.
    pub fn remove_status(&self, id: &ResourceId) {
        self.state.write().statuses.remove(id);
    }

    /// Sets the alerts reported for `id` while it is not OK.
    pub fn set_alerts(&self, id: impl Into<ResourceId>, alerts: AlertMeta) {
        self.state.write().alerts.insert(id.into(), alerts);
    }

    /// Associates a MAC address with a server hardware.
    pub fn set_mac(&self, mac: impl Into<String>, id: impl Into<ResourceId>) {
        self.state.write().macs.insert(mac.into(), id.into());
    }

    /// Removes a MAC association.
    pub fn remove_mac(&self, mac: &str) {
        self.state.write().macs.remove(mac);
    }

    /// Sets the trust material handed to the push channel.
    pub fn set_trust_material(&self, trust_material: TrustMaterial) {
        self.state.write().trust_material = trust_material;
    }

    /// Queues a failure for the next call of `operation`.
    pub fn fail_next(&self, operation: Operation, error: Error) {
        self.script(operation, Some(error));
    }

    /// Queues a normal answer ahead of later scripted failures of
    /// `operation`.
    pub fn pass_next(&self, operation: Operation) {
        self.script(operation, None);
    }

    fn script(&self, operation: Operation, outcome: Option<Error>) {
        self.state
            .write()
            .failures
            .entry(operation)
            .or_default()
            .push_back(outcome);
    }

    /// Number of `get_status` calls so far.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_alerts` calls so far.
    #[must_use]
    pub fn alert_calls(&self) -> usize {
        self.alert_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_trust_material` calls so far.
    #[must_use]
    pub fn trust_material_calls(&self) -> usize {
        self.trust_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, operation: Operation) -> Result<(), Error> {
        self.state
            .write()
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .flatten()
            .map_or(Ok(()), Err)
    }
}

#[async_trait]
impl HardwareStatusService for MockHardware {
    type Error = Error;

    async fn get_status(
        &self,
        id: &ResourceId,
    ) -> Result<Option<(StatusCode, DateTime<Utc>)>, Self::Error> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure(Operation::Status)?;

        Ok(self.state.read().statuses.get(id).copied())
    }

    fn get_status_for_code(&self, name: &str) -> Result<StatusCode, Self::Error> {
        name.parse().map_err(|_| Error::UnknownStatus(name.to_string()))
    }

    async fn get_alerts(
        &self,
        id: &ResourceId,
        status: StatusCode,
    ) -> Result<AlertMeta, Self::Error> {
        self.alert_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure(Operation::Alerts)?;

        if status == StatusCode::Ok {
            return Ok(AlertMeta::new());
        }

        Ok(self
            .state
            .read()
            .alerts
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_trust_material(&self) -> Result<TrustMaterial, Self::Error> {
        self.trust_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure(Operation::TrustMaterial)?;

        Ok(self.state.read().trust_material.clone())
    }

    async fn validate_trust_material(&self) -> Result<(), Self::Error> {
        self.take_failure(Operation::ValidateTrustMaterial)
    }
}

#[async_trait]
impl ServerHardwareLookup for MockHardware {
    type Error = Error;

    async fn server_hardware_for_mac(&self, mac: &str) -> Result<Option<ResourceId>, Self::Error> {
        self.take_failure(Operation::MacLookup)?;

        Ok(self.state.read().macs.get(mac).cloned())
    }
}
