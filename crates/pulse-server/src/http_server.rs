//! HTTP front end.
//!
//! A plain hyper HTTP/1.1 server: one tokio task per connection, each
//! request translated into a [`RequestState`] and handed to the
//! [`Dispatcher`]. The handler's return value is the response body; status
//! and extra headers come from whatever the script set on the request
//! object.

use crate::http_router::Dispatcher;
use crate::runtime::request::parse_pairs;
use crate::runtime::RequestState;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pulse_common::error::{PulseError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct HttpServer {
    dispatcher: Arc<Dispatcher>,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Bind and serve forever.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PulseError::Transport(format!("failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener. Split out from
    /// [`run`](Self::run) so tests can bind an ephemeral port first.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| PulseError::Transport(format!("failed to get local address: {}", e)))?;
        tracing::info!(%addr, "http server listening");

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| PulseError::Transport(format!("failed to accept connection: {}", e)))?;

            let io = TokioIo::new(stream);
            let dispatcher = self.dispatcher.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { handle_request(dispatcher, peer.ip(), req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(error = %err, "connection error");
                }
            });
        }
    }
}

/// Translate one hyper request into a dispatch and back into a response.
async fn handle_request(
    dispatcher: Arc<Dispatcher>,
    peer: IpAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = parse_pairs(req.uri().query().unwrap_or(""));

    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), value.to_string());
        }
    }

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| PulseError::Transport(format!("failed to read request body: {}", e)))?
        .to_bytes();
    let body = String::from_utf8_lossy(&body).into_owned();

    let request = RequestState::new(method, path, query, headers, body, peer.to_string());
    let outcome = dispatcher.dispatch(request).await;

    let mut builder = Response::builder().status(
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &outcome.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(Full::new(Bytes::from(outcome.body)))
        .or_else(|err| {
            // A response that cannot be built still has to answer the
            // client; downgrade to a bare 500.
            tracing::error!(error = %err, "failed to build response");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from("internal server error\n")))
                .map_err(|e| PulseError::Transport(format!("failed to build response: {}", e)))
        })
}

