//! Service host: composes the listener, call interceptor, health reporting,
//! reflection and business services into one tonic server.
//!
//! Building a host is a two step affair:
//!
//! 1. [`ServiceHost`] collects services and descriptor sets.
//! 2. [`ServiceHost::bind`] binds the listen address, publishes SERVING for
//!    `""` and every registered service, and returns a [`BoundHost`] whose
//!    [`serve`](BoundHost::serve) runs the accept loop until its shutdown
//!    future resolves.
//!
//! A bind failure surfaces before any status is published or any connection
//! is accepted.

use crate::server::{
    config::ServerConfig,
    error::Result,
    health::{HealthReporter, ServingStatus},
    interceptor::{InFlightCalls, LoggingLayer},
    listener::ListenerBinding,
};
use core::convert::Infallible;
use prost::Message;
use prost_types::FileDescriptorSet;
use std::future::Future;
use std::net::SocketAddr;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tonic::transport::server::Router;
use tower::Service;
use tower::layer::util::{Identity, Stack};

/// A service the host routes, with the methods its descriptors declare.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredService {
    pub name: String,
    pub methods: Vec<String>,
}

/// Builder for the gRPC host.
pub struct ServiceHost {
    config: ServerConfig,
    health: HealthReporter,
    in_flight: InFlightCalls,
    routes: RoutesBuilder,
    /// Business services; each gets a health entry at startup.
    business: Vec<&'static str>,
    /// Every routed service, infrastructure included.
    routed: Vec<&'static str>,
    descriptor_sets: Vec<&'static [u8]>,
}

impl ServiceHost {
    /// Creates a host serving only the standard health service.
    pub fn new(config: ServerConfig) -> Self {
        let health = HealthReporter::new();
        let health_server = health.server();

        let mut host = Self {
            config,
            health,
            in_flight: InFlightCalls::new(),
            routes: RoutesBuilder::default(),
            business: Vec::new(),
            routed: Vec::new(),
            descriptor_sets: vec![tonic_health::pb::FILE_DESCRIPTOR_SET],
        };
        host.route(health_server);
        host
    }

    fn route<S>(&mut self, svc: S)
    where
        S: Service<
                http::Request<tonic::body::Body>,
                Response = http::Response<tonic::body::Body>,
                Error = Infallible,
            > + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.routed.push(S::NAME);
        self.routes.add_service(svc);
    }

    /// Registers a business service. It is reported SERVING once the host is
    /// bound.
    pub fn add_service<S>(mut self, svc: S) -> Self
    where
        S: Service<
                http::Request<tonic::body::Body>,
                Response = http::Response<tonic::body::Body>,
                Error = Infallible,
            > + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.business.push(S::NAME);
        self.route(svc);
        self
    }

    /// Registers an encoded `FileDescriptorSet`, used for reflection and for
    /// [`services`](Self::services).
    pub fn register_file_descriptor_set(mut self, encoded: &'static [u8]) -> Self {
        self.descriptor_sets.push(encoded);
        self
    }

    pub fn health(&self) -> HealthReporter {
        self.health.clone()
    }

    pub fn in_flight(&self) -> InFlightCalls {
        self.in_flight.clone()
    }

    /// Routed services and their methods, in registration order. Methods are
    /// empty for a service no registered descriptor set describes.
    pub fn services(&self) -> Result<Vec<RegisteredService>> {
        let mut declared = Vec::new();
        for encoded in &self.descriptor_sets {
            let fds = FileDescriptorSet::decode(*encoded)?;
            for file in fds.file {
                let package = file.package.unwrap_or_default();
                for service in file.service {
                    let name = match (package.as_str(), service.name.as_deref()) {
                        (_, None) => continue,
                        ("", Some(name)) => name.to_string(),
                        (package, Some(name)) => format!("{package}.{name}"),
                    };
                    let methods = service.method.into_iter().filter_map(|m| m.name).collect();
                    declared.push(RegisteredService { name, methods });
                }
            }
        }

        Ok(self
            .routed
            .iter()
            .map(|name| {
                declared
                    .iter()
                    .find(|svc| svc.name == *name)
                    .cloned()
                    .unwrap_or_else(|| RegisteredService {
                        name: name.to_string(),
                        methods: Vec::new(),
                    })
            })
            .collect())
    }

    /// Binds the listen address and publishes the initial health statuses.
    pub async fn bind(mut self) -> Result<BoundHost> {
        if self.config.reflection {
            let mut builder = tonic_reflection::server::Builder::configure();
            for encoded in &self.descriptor_sets {
                builder = builder.register_encoded_file_descriptor_set(encoded);
            }
            let reflection = builder.build_v1()?;
            self.route(reflection);
            // The reflection server describes itself; this set is only read
            // for introspection.
            self.descriptor_sets
                .push(tonic_reflection::pb::v1::FILE_DESCRIPTOR_SET);
        }

        let services = self.services()?;
        let binding = ListenerBinding::bind(&self.config.listen_addr).await?;

        self.health.set_status("", ServingStatus::Serving).await;
        for name in &self.business {
            self.health.set_status(name, ServingStatus::Serving).await;
        }

        for service in &services {
            tracing::info!(
                name = %service.name,
                methods = service.methods.len(),
                "service registered"
            );
            for method in &service.methods {
                tracing::info!(service = %service.name, method = %method, "method available");
            }
        }

        let router = Server::builder()
            .http2_keepalive_interval(Some(self.config.keepalive_interval))
            .http2_keepalive_timeout(Some(self.config.keepalive_timeout))
            .layer(LoggingLayer::new(
                self.config.quiet_methods.iter().cloned(),
                self.in_flight.clone(),
            ))
            .add_routes(self.routes.routes());

        Ok(BoundHost {
            config: self.config,
            health: self.health,
            in_flight: self.in_flight,
            services,
            binding,
            router,
        })
    }
}

/// A host whose address is bound and whose services are SERVING.
pub struct BoundHost {
    config: ServerConfig,
    health: HealthReporter,
    in_flight: InFlightCalls,
    services: Vec<RegisteredService>,
    binding: ListenerBinding,
    router: Router<Stack<LoggingLayer, Identity>>,
}

impl BoundHost {
    pub const fn local_addr(&self) -> SocketAddr {
        self.binding.local_addr()
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn health(&self) -> HealthReporter {
        self.health.clone()
    }

    pub fn in_flight(&self) -> InFlightCalls {
        self.in_flight.clone()
    }

    pub fn services(&self) -> &[RegisteredService] {
        &self.services
    }

    /// Runs the accept loop until `shutdown` resolves, then stops accepting
    /// and waits for open connections to finish their calls.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(
            address = %self.binding.addr(),
            local_addr = %self.binding.local_addr(),
            "server starting"
        );

        let incoming = self.binding.into_incoming(self.config.idle_timeout);
        self.router
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await?;

        tracing::debug!("accept loop finished");
        Ok(())
    }
}

/// Host with the Polykey key service and its descriptors registered.
pub fn polykey_host(config: ServerConfig) -> ServiceHost {
    use crate::server::service::handler::MockKeyService;
    use polykey_tonic_core::proto::FILE_DESCRIPTOR_SET;

    ServiceHost::new(config)
        .register_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .add_service(MockKeyService::new().into_server())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polykey_tonic_core::SERVICE_NAME;
    use tracing_test::traced_test;

    fn config() -> ServerConfig {
        ServerConfig::with_listen_addr("127.0.0.1:0")
    }

    #[test]
    fn services_lists_methods_from_descriptors() {
        let host = polykey_host(config());
        let services = host.services().unwrap();

        assert_eq!(
            services,
            vec![
                RegisteredService {
                    name: "grpc.health.v1.Health".to_string(),
                    methods: vec!["Check".to_string(), "Watch".to_string()],
                },
                RegisteredService {
                    name: SERVICE_NAME.to_string(),
                    methods: vec!["CreateKey".to_string(), "GetKey".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn bind_publishes_serving_and_adds_reflection() {
        let host = polykey_host(config());
        let health = host.health();
        assert_eq!(health.query(""), ServingStatus::Unknown);

        let bound = host.bind().await.unwrap();
        assert_ne!(bound.local_addr().port(), 0);
        assert_eq!(health.query(""), ServingStatus::Serving);
        assert_eq!(health.query(SERVICE_NAME), ServingStatus::Serving);
        assert_eq!(
            health.query("grpc.health.v1.Health"),
            ServingStatus::Unknown
        );

        let names: Vec<_> = bound.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "grpc.health.v1.Health",
                SERVICE_NAME,
                "grpc.reflection.v1.ServerReflection",
            ]
        );
        assert_eq!(
            bound.services()[2].methods,
            vec!["ServerReflectionInfo".to_string()]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn bind_logs_each_method_at_info() {
        let _bound = polykey_host(config()).bind().await.unwrap();

        logs_assert(|lines: &[&str]| {
            let methods: Vec<_> = lines
                .iter()
                .filter(|line| line.contains("method available"))
                .collect();
            if methods.len() != 5 {
                return Err(format!("expected 5 method events, got {}", methods.len()));
            }
            match methods.iter().find(|line| !line.contains("INFO")) {
                Some(line) => Err(format!("method event below INFO: {line}")),
                None => Ok(()),
            }
        });
        assert!(logs_contain("method=ServerReflectionInfo"));
    }

    #[tokio::test]
    async fn reflection_can_be_disabled() {
        let mut config = config();
        config.reflection = false;
        let bound = polykey_host(config).bind().await.unwrap();
        assert!(
            bound
                .services()
                .iter()
                .all(|s| s.name != "grpc.reflection.v1.ServerReflection")
        );
    }

    #[tokio::test]
    async fn bind_failure_publishes_nothing() {
        let taken = ListenerBinding::bind("127.0.0.1:0").await.unwrap();
        let host = polykey_host(ServerConfig::with_listen_addr(
            taken.local_addr().to_string(),
        ));
        let health = host.health();

        assert!(matches!(
            host.bind().await,
            Err(crate::server::error::HostError::Bind { .. })
        ));
        assert!(health.services().is_empty());
    }
}
