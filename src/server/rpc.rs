//! gRPC service registry.
//!
//! # Responsibilities
//! - Collect tonic services into one routing table
//! - Register the standard `grpc.health.v1.Health` service
//! - Report SERVING for the server as a whole and for every registered service
//!
//! Calls to unknown services are answered with `UNIMPLEMENTED` by tonic.

use std::collections::BTreeSet;
use std::convert::Infallible;

use tonic::body::BoxBody;
use tonic::codegen::http::{Request, Response};
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;
use tower::Service;

pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Services served by the RPC server task.
#[derive(Clone, Default)]
pub struct RpcRouter {
    routes: RoutesBuilder,
    services: BTreeSet<String>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tonic service, typically a generated `FooServer`.
    ///
    /// The health service is built in, so registering another one is
    /// ignored.
    pub fn add_service<S>(mut self, service: S) -> Self
    where
        S: Service<Request<BoxBody>, Response = Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        if S::NAME == HEALTH_SERVICE {
            tracing::warn!(service = S::NAME, "Health service is built in, ignoring registration");
            return self;
        }
        self.services.insert(S::NAME.to_string());
        self.routes.add_service(service);
        self
    }

    /// Fully-qualified names of the registered services.
    pub fn services(&self) -> &BTreeSet<String> {
        &self.services
    }

    /// Build the routing table with the health service added.
    ///
    /// The returned reporter can change a service's status later.
    pub async fn into_routes(self) -> (Routes, HealthReporter) {
        let (mut reporter, health) = health_reporter();
        for service in &self.services {
            reporter.set_service_status(service, ServingStatus::Serving).await;
        }

        let mut routes = self.routes;
        routes.add_service(health);
        (routes.routes(), reporter)
    }
}
