//! HTTP control API and WebSocket event stream.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::core::Severity;
use crate::dispatch::SubscriptionFilter;
use crate::engine::Engine;
use crate::error::{EngineError, Result};

const DEFAULT_DETECTION_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
struct TrackRequest {
    address: String,
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetectionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeQuery {
    tracked_only: Option<bool>,
    min_severity: Option<String>,
    /// Comma separated.
    methods: Option<String>,
}

impl SubscribeQuery {
    fn into_filter(self) -> std::result::Result<SubscriptionFilter, String> {
        let min_severity = self
            .min_severity
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<Severity>)
            .transpose()?;
        let methods = self
            .methods
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        Ok(SubscriptionFilter {
            tracked_only: self.tracked_only.unwrap_or(false),
            min_severity,
            methods,
        })
    }
}

fn with_engine(
    engine: Arc<Engine>,
) -> impl Filter<Extract = (Arc<Engine>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || engine.clone())
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&json!({ "error": message.into() })), status).into_response()
}

/// All API routes.
pub fn routes(
    engine: Arc<Engine>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let track = warp::path!("track")
        .and(warp::post())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .map(handle_track);

    let untrack = warp::path!("track" / String)
        .and(warp::delete())
        .and(with_engine(engine.clone()))
        .map(|address: String, engine: Arc<Engine>| {
            warp::reply::json(&json!({ "removed": engine.untrack(&address) }))
        });

    let contracts = warp::path!("contracts")
        .and(warp::get())
        .and(with_engine(engine.clone()))
        .map(|engine: Arc<Engine>| warp::reply::json(&engine.contracts()));

    let detections = warp::path!("detections")
        .and(warp::get())
        .and(warp::query::<DetectionsQuery>())
        .and(with_engine(engine.clone()))
        .map(|q: DetectionsQuery, engine: Arc<Engine>| {
            let limit = q.limit.unwrap_or(DEFAULT_DETECTION_LIMIT);
            warp::reply::json(&engine.detections(limit))
        });

    let stats = warp::path!("stats")
        .and(warp::get())
        .and(with_engine(engine.clone()))
        .map(|engine: Arc<Engine>| warp::reply::json(&engine.stats()));

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_engine(engine.clone()))
        .map(|engine: Arc<Engine>| {
            let health = engine.health();
            let status = if health.status == "degraded" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            warp::reply::with_status(warp::reply::json(&health), status)
        });

    let subscribe = warp::path!("subscribe")
        .and(warp::ws())
        .and(warp::query::<SubscribeQuery>())
        .and(with_engine(engine))
        .map(handle_subscribe);

    track
        .or(untrack)
        .or(contracts)
        .or(detections)
        .or(stats)
        .or(health)
        .or(subscribe)
        .with(warp::trace::request())
}

fn handle_track(req: TrackRequest, engine: Arc<Engine>) -> warp::reply::Response {
    match engine.track(&req.address, req.label) {
        Ok(outcome) => {
            let status = if outcome.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            warp::reply::with_status(warp::reply::json(&outcome.contract), status).into_response()
        }
        Err(e @ EngineError::InvalidAddress(_)) => error_reply(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            warn!("Track request failed: {e}");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn handle_subscribe(ws: Ws, query: SubscribeQuery, engine: Arc<Engine>) -> warp::reply::Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(e) => return error_reply(StatusCode::BAD_REQUEST, e),
    };
    ws.on_upgrade(move |socket| stream_events(socket, engine, filter))
        .into_response()
}

/// Forward dispatcher events to one WebSocket client until either side ends.
async fn stream_events(socket: WebSocket, engine: Arc<Engine>, filter: SubscriptionFilter) {
    let mut subscription = match engine.subscribe(filter) {
        Ok(sub) => sub,
        Err(e) => {
            debug!("Rejecting stream client: {e}");
            let _ = socket.close().await;
            return;
        }
    };
    let id = subscription.id();
    info!(subscriber = id, "Stream client connected");
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode event: {e}");
                        continue;
                    }
                };
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            msg = incoming.next() => {
                match msg {
                    Some(Ok(m)) if m.is_close() => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(subscriber = id, "Stream read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let dropped = subscription.dropped();
    subscription.unsubscribe();
    let _ = sink.close().await;
    info!(subscriber = id, dropped, "Stream client disconnected");
}

/// Bind and serve the API until `shutdown` resolves.
pub async fn serve(
    engine: Arc<Engine>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let (bound, server) = warp::serve(routes(engine))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| EngineError::Fatal(format!("cannot bind API on {addr}: {e}")))?;
    info!("Control API listening on http://{bound}");
    server.await;
    Ok(())
}
