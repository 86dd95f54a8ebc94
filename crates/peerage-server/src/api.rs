//! HTTP API.
//!
//! Routes:
//!
//! - `GET /cluster`: the cluster status snapshot
//! - `DELETE /cluster/peer/{peer_id}`: remove a peer
//! - `GET /metrics`: prometheus text exposition, when enabled
//!
//! Every JSON response carries the handling time in seconds:
//! `{"result": .., "status": "ok", "time": ..}` on success and
//! `{"status": {"error": ".."}, "time": ..}` otherwise.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use peerage_cluster::{
    PeerId, RejectReason, RemovalCoordinator, RemovalOutcome, ShardMap, StatusReporter,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::node::Consensus;

/// Everything a request handler needs.
pub struct ApiState {
    pub coordinator: RemovalCoordinator<Consensus, Arc<ShardMap>>,
    pub reporter: StatusReporter<Consensus>,
    pub metrics: Option<PrometheusHandle>,
}

/// Spawns the accept loop for the API on an already bound listener.
pub fn spawn_http_server(listener: TcpListener, state: Arc<ApiState>) {
    tokio::spawn(async move {
        match listener.local_addr() {
            Ok(addr) => info!("http api on http://{addr}"),
            Err(e) => warn!("http api listener has no local address: {e}"),
        }

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("http accept error: {e}");
                    continue;
                }
            };

            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let state = Arc::clone(&state);
                    async move {
                        let resp = route(req.method(), req.uri().path(), &state).await;
                        Ok::<_, std::convert::Infallible>(resp)
                    }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    // client went away
                    debug!("http connection error: {e}");
                }
            });
        }
    });
}

/// Dispatches one request.
pub async fn route(method: &Method, path: &str, state: &ApiState) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["cluster"]) => cluster_status(state, started),
        (&Method::DELETE, ["cluster", "peer", raw_id]) => match raw_id.parse::<PeerId>() {
            Ok(peer_id) => remove_peer(state, peer_id, started).await,
            Err(_) => {
                metrics::record_bad_request("remove_peer");
                error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid peer id '{raw_id}'"),
                    started,
                )
            }
        },
        (&Method::GET, ["metrics"]) => match &state.metrics {
            Some(handle) => text(handle.render()),
            None => error(StatusCode::NOT_FOUND, "metrics disabled".into(), started),
        },
        (_, ["cluster"] | ["cluster", "peer", _] | ["metrics"]) => error(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method {method} not allowed on {path}"),
            started,
        ),
        _ => error(StatusCode::NOT_FOUND, format!("no route for {path}"), started),
    }
}

fn cluster_status(state: &ApiState, started: Instant) -> Response<Full<Bytes>> {
    match state.reporter.snapshot() {
        Ok(snapshot) => {
            metrics::record_status(&snapshot);
            ok(&snapshot, started)
        }
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string(), started),
    }
}

async fn remove_peer(state: &ApiState, peer_id: PeerId, started: Instant) -> Response<Full<Bytes>> {
    let report = state.coordinator.remove_peer(peer_id).await;
    metrics::record_removal(&report.outcome, report.proposals, started.elapsed());

    match report.outcome {
        RemovalOutcome::Succeeded { .. } => ok(&true, started),
        RemovalOutcome::Rejected(RejectReason::HasShards) => error(
            StatusCode::BAD_REQUEST,
            format!("cannot remove peer {peer_id} as there are shards on it"),
            started,
        ),
        outcome => error(
            status_code(&outcome),
            format!("cannot remove peer {peer_id}: {outcome}"),
            started,
        ),
    }
}

fn status_code(outcome: &RemovalOutcome) -> StatusCode {
    StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Serialize)]
struct Success<'a, T> {
    result: &'a T,
    status: &'static str,
    time: f64,
}

#[derive(Serialize)]
struct Failure {
    status: ErrorStatus,
    time: f64,
}

#[derive(Serialize)]
struct ErrorStatus {
    error: String,
}

fn ok<T: Serialize>(result: &T, started: Instant) -> Response<Full<Bytes>> {
    let body = Success {
        result,
        status: "ok",
        time: started.elapsed().as_secs_f64(),
    };
    match serde_json::to_vec(&body) {
        Ok(json) => respond(StatusCode::OK, json, "application/json"),
        Err(e) => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {e}"),
            started,
        ),
    }
}

fn error(code: StatusCode, message: String, started: Instant) -> Response<Full<Bytes>> {
    let body = Failure {
        status: ErrorStatus { error: message },
        time: started.elapsed().as_secs_f64(),
    };
    // a struct of a string and a float always encodes
    let json = serde_json::to_vec(&body).unwrap_or_default();
    respond(code, json, "application/json")
}

fn text(body: String) -> Response<Full<Bytes>> {
    respond(
        StatusCode::OK,
        body.into_bytes(),
        "text/plain; version=0.0.4; charset=utf-8",
    )
}

fn respond(code: StatusCode, body: Vec<u8>, content_type: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = code;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}
