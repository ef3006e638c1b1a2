//! HTTP endpoint that mints time-limited TURN credentials.
//!
//! `GET /giveMeCredentials` returns `{"username": ..., "password": ...}`.
//! CORS is open so browser-based probers on other origins can call it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::task::JoinHandle;

use super::CredentialIssuer;

pub const CREDENTIALS_PATH: &str = "/giveMeCredentials";

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

const ALLOWED_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept";

/// Bind the endpoint and serve it on a background task.
///
/// Returns the bound address (useful when binding port 0) and the server task.
pub fn spawn(addr: SocketAddr, issuer: CredentialIssuer) -> Result<(SocketAddr, JoinHandle<()>)> {
    let issuer = Arc::new(issuer);

    let make_svc = make_service_fn(move |_conn| {
        let issuer = issuer.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let issuer = issuer.clone();
                async move { Ok::<_, Infallible>(route(&issuer, &req)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind credential endpoint on {}", addr))?
        .serve(make_svc);
    let local_addr = server.local_addr();

    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Credential endpoint error: {}", e);
        }
    });

    Ok((local_addr, handle))
}

fn route(issuer: &CredentialIssuer, req: &Request<Body>) -> Response<Body> {
    tracing::debug!("{} {}", req.method(), req.uri().path());

    let builder = Response::builder()
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS);

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, CREDENTIALS_PATH) => {
            let credential = issuer.issue();
            tracing::info!("Issued TURN credentials for {}", credential.username);
            match serde_json::to_vec(&credential) {
                Ok(body) => builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body)),
                Err(e) => builder
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(e.to_string())),
            }
        }
        (&Method::OPTIONS, _) => builder.status(StatusCode::NO_CONTENT).body(Body::empty()),
        _ => builder
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found")),
    };

    response.unwrap_or_else(|e| {
        tracing::error!("Failed to build response: {}", e);
        let mut resp = Response::new(Body::from("Internal Server Error"));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}
