//! Serving-status tracking behind the standard `grpc.health.v1.Health`
//! service.
//!
//! [`HealthReporter`] is the single source of truth for whether a named
//! service is ready. It is created once by the host and handed by clone to
//! the shutdown coordinator. Every accepted write is forwarded to a
//! `tonic_health` reporter, whose server answers `Check` and `Watch`. The
//! empty name `""` is the overall status of the process.
//!
//! ## Lifecycle
//!
//! - Startup marks `""` and every registered service as [`ServingStatus::Serving`].
//! - [`HealthReporter::shutdown`] flips every name that was set to
//!   [`ServingStatus::NotServing`] under one write lock. Those names stay
//!   `NotServing` for the rest of the process; a name first set after the
//!   shutdown gets a fresh entry.
//!
//! Only names written through [`HealthReporter::set_status`] are tracked.
//! `Check` and `Watch` on any other name answer `NOT_FOUND` and leave the map
//! untouched.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::server::NamedService;
use tonic_health::pb::health_server::HealthServer;
use tonic_health::server::HealthService;

pub use tonic_health::ServingStatus;

#[derive(Default)]
struct HealthMap {
    statuses: HashMap<String, ServingStatus>,
    /// Names that were tracked when `shutdown` ran.
    drained: HashSet<String>,
    shut_down: bool,
}

/// Shared, thread-safe map from service name to [`ServingStatus`].
///
/// Cloning is cheap and every clone observes the same map. Writers are
/// serialized so the published statuses are applied in the same order as
/// the map updates. Readers never see a partially applied
/// [`shutdown`](Self::shutdown).
#[derive(Clone, Default)]
pub struct HealthReporter {
    inner: Arc<RwLock<HealthMap>>,
    published: tonic_health::server::HealthReporter,
    writes: Arc<Mutex<()>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `grpc.health.v1.Health` server reporting this map.
    pub fn server(&self) -> HealthServer<HealthService> {
        HealthServer::new(self.service())
    }

    pub(crate) fn service(&self) -> HealthService {
        HealthService::from_health_reporter(self.published.clone())
    }

    /// Stores `status` for `service` and publishes it to `Check` and `Watch`.
    ///
    /// Names drained by [`shutdown`](Self::shutdown) keep `NotServing`; the
    /// update is dropped.
    pub async fn set_status(&self, service: &str, status: ServingStatus) {
        let _write = self.writes.lock().await;

        {
            let mut map = self.inner.write();
            if map.drained.contains(service) && status != ServingStatus::NotServing {
                tracing::debug!(
                    service,
                    ?status,
                    "ignoring health status change for drained service"
                );
                return;
            }
            map.statuses.insert(service.to_string(), status);
        }

        self.published.set_service_status(service, status).await;
    }

    /// Marks the gRPC service `S` as serving.
    pub async fn set_serving<S: NamedService>(&self) {
        self.set_status(S::NAME, ServingStatus::Serving).await;
    }

    /// Marks the gRPC service `S` as not serving.
    pub async fn set_not_serving<S: NamedService>(&self) {
        self.set_status(S::NAME, ServingStatus::NotServing).await;
    }

    /// Current status of `service`; [`ServingStatus::Unknown`] if it was never
    /// set.
    pub fn query(&self, service: &str) -> ServingStatus {
        self.inner
            .read()
            .statuses
            .get(service)
            .copied()
            .unwrap_or(ServingStatus::Unknown)
    }

    /// Transitions every tracked name to [`ServingStatus::NotServing`].
    ///
    /// Only the first call does anything; it returns `true`, later calls
    /// return `false`.
    pub async fn shutdown(&self) -> bool {
        let _write = self.writes.lock().await;

        let names: Vec<String> = {
            let mut map = self.inner.write();
            if map.shut_down {
                return false;
            }
            map.shut_down = true;

            let HealthMap {
                statuses, drained, ..
            } = &mut *map;
            for (name, status) in statuses.iter_mut() {
                *status = ServingStatus::NotServing;
                drained.insert(name.clone());
            }
            statuses.keys().cloned().collect()
        };

        for name in &names {
            self.published
                .set_service_status(name, ServingStatus::NotServing)
                .await;
        }

        tracing::info!(services = names.len(), "health status set to NOT_SERVING");
        true
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.read().shut_down
    }

    /// Names currently tracked, in no particular order.
    pub fn services(&self) -> Vec<String> {
        self.inner.read().statuses.keys().cloned().collect()
    }
}
