//! Service host lifecycle for the Polykey gRPC server.
//!
//! A process builds a [`host::ServiceHost`], binds it, and hands the bound
//! host to a [`shutdown::ShutdownCoordinator`] which serves until SIGINT or
//! SIGTERM and then drains.
//!
//! ## Structure
//!
//! - [`config`] - CLI and environment configuration (`ServerConfig`).
//! - [`error`] - Fatal host errors (`HostError`).
//! - [`health`] - Serving-status map and `grpc.health.v1.Health`.
//! - [`host`] - Service composition, reflection and binding.
//! - [`interceptor`] - Per-call logging and in-flight counting.
//! - [`listener`] - TCP binding and idle connection timeout.
//! - [`service`] - Business services (`MockKeyService`).
//! - [`shutdown`] - Termination sources and the drain sequence.
//! - [`telemetry`] - Process-wide `tracing` subscriber.

pub mod config;
pub mod error;
pub mod health;
pub mod host;
pub mod interceptor;
pub mod listener;
pub mod service;
pub mod shutdown;
pub mod telemetry;
