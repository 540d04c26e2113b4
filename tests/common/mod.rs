//! Shared utilities for integration testing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::http::{self, HeaderValue};
use tonic::codegen::{empty_body, Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::transport::Channel;

use svc_mux::config::ServerConfig;
use svc_mux::{bootstrap, Application, RpcRouter, Supervisor, SupervisorError};

pub const ECHO_METHOD: &str = "/test.Echo/Say";

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoMessage {
    #[prost(string, tag = "1")]
    pub text: String,
}

/// `test.Echo` with a single unary `Say` method, shaped like a
/// tonic-generated server.
#[derive(Debug, Clone, Default)]
pub struct EchoServer;

impl NamedService for EchoServer {
    const NAME: &'static str = "test.Echo";
}

struct Say;

impl UnaryService<EchoMessage> for Say {
    type Response = EchoMessage;
    type Future = BoxFuture<tonic::Response<EchoMessage>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<EchoMessage>) -> Self::Future {
        Box::pin(async move {
            let text = request.into_inner().text;
            Ok(tonic::Response::new(EchoMessage {
                text: format!("echo: {text}"),
            }))
        })
    }
}

impl<B> Service<http::Request<B>> for EchoServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        match request.uri().path() {
            ECHO_METHOD => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::<EchoMessage, EchoMessage>::default());
                Ok(grpc.unary(Say, request).await)
            }),
            _ => Box::pin(async move {
                let mut response = http::Response::new(empty_body());
                let headers = response.headers_mut();
                headers.insert("grpc-status", HeaderValue::from(tonic::Code::Unimplemented as i32));
                headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
                Ok(response)
            }),
        }
    }
}

async fn boom() -> &'static str {
    panic!("handler blew up")
}

/// Routes mounted under `/api/v1` and the echo RPC service.
pub fn echo_application() -> Application {
    let http = Router::new()
        .route("/echo", post(|body: Bytes| async move { body }))
        .route(
            "/slow/{millis}",
            get(|axum::extract::Path(millis): axum::extract::Path<u64>| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                "done"
            }),
        )
        .route("/boom", get(boom));

    let rpc = RpcRouter::new().add_service(EchoServer);

    Application::new(http, rpc)
}

/// A supervisor running on an ephemeral port.
pub struct TestServer {
    pub supervisor: Arc<Supervisor>,
    pub addr: SocketAddr,
    pub ctx: CancellationToken,
    pub run: JoinHandle<Result<(), SupervisorError>>,
}

impl TestServer {
    /// Cancel the run context and wait for `run` to return.
    #[allow(dead_code)]
    pub async fn stop(self) -> Result<(), SupervisorError> {
        self.ctx.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.run)
            .await
            .expect("run did not return after cancellation")
            .expect("run panicked")
    }
}

/// Bootstrap and run a server with the echo application. `configure` may
/// adjust the defaults before binding.
pub async fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.timeouts.shutdown_grace_secs = 5;
    configure(&mut config);

    let supervisor = Arc::new(bootstrap(&config, echo_application()).await.unwrap());
    let addr = supervisor.listener().local_addr();
    let ctx = CancellationToken::new();

    let run = {
        let supervisor = Arc::clone(&supervisor);
        let ctx = ctx.clone();
        tokio::spawn(async move { supervisor.run(ctx).await })
    };

    // Let the accept loop and server tasks start.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        supervisor,
        addr,
        ctx,
        run,
    }
}

/// Open a fresh HTTP/2 connection to `addr`.
#[allow(dead_code)]
pub async fn connect(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

/// Issue one unary call with an [`EchoMessage`] over a fresh connection.
#[allow(dead_code)]
pub async fn grpc_unary(addr: SocketAddr, path: &'static str, text: &str) -> Result<EchoMessage, tonic::Status> {
    let mut client = tonic::client::Grpc::new(connect(addr).await);
    client.ready().await.unwrap();
    let request = tonic::Request::new(EchoMessage {
        text: text.to_string(),
    });
    let response = client
        .unary(
            request,
            PathAndQuery::from_static(path),
            ProstCodec::<EchoMessage, EchoMessage>::default(),
        )
        .await?;
    Ok(response.into_inner())
}

/// Poll `condition` until it holds, failing after two seconds.
#[allow(dead_code)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
