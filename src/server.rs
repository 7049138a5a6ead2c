//! HTTP front for the cloaker.
//!
//! - `GET /_cloaker/health`: health check
//! - `POST <submit_path>`: telemetry from the interstitial, answers `{decision, redirect}`
//! - `GET <anything else>`: quick pass, answers a redirect or the interstitial

use crate::detectors::HeadersData;
use crate::engine::{Cloaker, QuickOutcome};
use crate::flow::Decided;
use crate::redirect::{RedirectResponse, NO_CACHE_HEADERS};
use crate::score::Decision;
use hyper::body::HttpBody;
use hyper::http::response::Builder;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const HEALTH_PATH: &str = "/_cloaker/health";

/// Largest accepted telemetry body.
pub const MAX_SUBMISSION_BYTES: usize = 256 * 1024;

/// Handle one request.
pub async fn handle_request(
    req: Request<Body>,
    peer_ip: Option<IpAddr>,
    cloaker: Arc<Cloaker>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let headers = headers_data(&req, peer_ip);

    let response = match (method, path.as_str()) {
        (Method::GET, HEALTH_PATH) => json_response(
            Response::builder().status(StatusCode::OK),
            &json!({"status": "healthy", "service": "cloaker"}),
        ),

        (Method::POST, p) if p == cloaker.config().challenge.submit_path => {
            let body = read_body(req.into_body()).await;
            match cloaker.evaluate_submission(&headers, &path, &body).await {
                Ok(decided) => submission_response(&cloaker, &decided),
                Err(e) => {
                    warn!(error = %e, "Submission could not be decided, using safe default");
                    let fallback = &cloaker.config().targets.safe_default_url;
                    json_response(
                        no_cache(Response::builder().status(StatusCode::OK)),
                        &json!({"decision": Decision::Challenge, "redirect": fallback}),
                    )
                }
            }
        }

        (Method::GET | Method::HEAD, _) => match cloaker.evaluate_request(&headers, &path) {
            Ok(QuickOutcome::Decided(decided)) => redirect_response(&cloaker, &decided),
            Ok(QuickOutcome::Challenge { result, token, page }) => {
                let mut builder = no_cache(Response::builder().status(StatusCode::OK))
                    .header("Content-Type", "text/html; charset=utf-8")
                    .header("Set-Cookie", cloaker.challenge_manager().cookie(&token));
                if cloaker.config().debug_headers {
                    builder = builder
                        .header("X-Cloaker-Score", result.final_score.to_string())
                        .header("X-Cloaker-Decision", result.decision.as_str());
                }
                finish(builder.body(Body::from(page)))
            }
            Err(e) => {
                warn!(error = %e, "Quick pass failed, using safe default");
                plain_redirect(&cloaker.config().targets.safe_default_url)
            }
        },

        _ => finish(
            Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header("Allow", "GET, HEAD, POST")
                .body(Body::empty()),
        ),
    };

    Ok(response)
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn run_server(addr: SocketAddr, cloaker: Arc<Cloaker>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let cloaker = cloaker.clone();
        let peer_ip = conn.remote_addr().ip();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, Some(peer_ip), cloaker.clone())
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);

    info!(addr = %addr, "Cloaker listening");
    info!("  GET  {}  - Health check", HEALTH_PATH);
    info!("  POST <submit_path>      - Challenge telemetry");
    info!("  GET  /*                 - Visitor routing");

    server
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

fn headers_data(req: &Request<Body>, peer_ip: Option<IpAddr>) -> HeadersData {
    let mut headers = HeadersData::new();
    for (name, value) in req.headers() {
        headers.insert(name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    match peer_ip {
        Some(ip) => headers.with_peer_ip(ip),
        None => headers,
    }
}

/// Read at most [`MAX_SUBMISSION_BYTES`]. Oversized or broken bodies read as empty.
async fn read_body(mut body: Body) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(bytes) if buf.len() + bytes.len() <= MAX_SUBMISSION_BYTES => {
                buf.extend_from_slice(&bytes)
            }
            Ok(_) => {
                warn!(limit = MAX_SUBMISSION_BYTES, "Submission body too large");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Failed to read submission body");
                return Vec::new();
            }
        }
    }
    buf
}

fn no_cache(mut builder: Builder) -> Builder {
    for (name, value) in NO_CACHE_HEADERS {
        builder = builder.header(name, value);
    }
    builder
}

fn debug_headers(cloaker: &Cloaker, decided: &Decided, mut builder: Builder) -> Builder {
    if cloaker.config().debug_headers {
        builder = builder
            .header("X-Cloaker-Score", decided.final_score().to_string())
            .header("X-Cloaker-Decision", decided.decision().as_str());
    }
    builder
}

fn redirect_response(cloaker: &Cloaker, decided: &Decided) -> Response<Body> {
    let redirect = RedirectResponse::found(decided.redirect_url());
    let mut builder = Response::builder().status(redirect.status);
    for (name, value) in &redirect.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let builder = debug_headers(cloaker, decided, builder);
    match builder.body(Body::empty()) {
        Ok(response) => response,
        Err(e) => {
            // Usually a target URL that is not a valid header value
            error!(error = %e, url = %decided.redirect_url(), "Invalid redirect target");
            plain_redirect(&cloaker.config().targets.safe_default_url)
        }
    }
}

fn plain_redirect(url: &str) -> Response<Body> {
    let redirect = RedirectResponse::found(url);
    let mut builder = Response::builder().status(redirect.status);
    for (name, value) in &redirect.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    finish(builder.body(Body::empty()))
}

fn submission_response(cloaker: &Cloaker, decided: &Decided) -> Response<Body> {
    let builder = debug_headers(
        cloaker,
        decided,
        no_cache(Response::builder().status(StatusCode::OK)),
    );
    json_response(
        builder,
        &json!({"decision": decided.decision(), "redirect": decided.redirect_url()}),
    )
}

fn json_response(builder: Builder, value: &serde_json::Value) -> Response<Body> {
    finish(
        builder
            .header("Content-Type", "application/json")
            .body(Body::from(value.to_string())),
    )
}

fn finish(result: hyper::http::Result<Response<Body>>) -> Response<Body> {
    result.unwrap_or_else(|e| {
        error!(error = %e, "Failed to build response");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}
