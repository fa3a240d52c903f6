use std::collections::btree_map;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
            CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, SET_COOKIE, UPGRADE,
        },
        HeaderName, HeaderValue, Method, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Json, Router,
};
use base64::prelude::*;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::attestation::AttestationProvider;
use crate::crypto::seal::{open_box, seal_box, SealedBox, SealedMessage};
use crate::envelope::{Envelope, HeaderField, Headers, InnerRequest, InnerResponse};
use crate::error::{Error, SessionError};
use crate::session::cache::{Session, SessionCache};
use crate::session::channel::SecureChannel;
use crate::session::handshake::{session_cookie, session_id_from_cookie, HelloParams, Responder};
use crate::session::SessionConfig;
use crate::transport::tcp;

use super::web_error::AppError;
use super::{relay, UPGRADE_PROTOCOL};

/// Response headers never copied back through the json envelope.
const HOP_BY_HOP: [&str; 3] = ["connection", "keep-alive", "transfer-encoding"];

/// Configuration for the responder (runs inside the attested workload).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the hello/session endpoints listen on.
    pub listen_addr: SocketAddr,
    /// Local service reached by both envelopes: raw TCP for `tcp`,
    /// `http://{target}{path}` for `json`.
    pub target: SocketAddr,
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, target: SocketAddr) -> Self {
        Self {
            listen_addr,
            target,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    responder: Arc<Responder>,
    target: SocketAddr,
    config: Arc<SessionConfig>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    sid: Option<String>,
}

/// Build the responder's router: `GET {prefix}/hello`, `POST {prefix}/session`,
/// `GET {prefix}/cert`. Everything else answers 400, `OPTIONS` answers 204.
pub fn router(responder: Arc<Responder>, config: &ServerConfig) -> Result<Router, Error> {
    let http = reqwest::Client::builder()
        .timeout(config.session.net_timeout)
        .build()?;
    let state = AppState {
        responder,
        target: config.target,
        config: Arc::new(config.session.clone()),
        http,
    };

    let session = &config.session;
    Ok(Router::new()
        .route(&session.endpoint("/hello"), or_400(get(hello)))
        .route(&session.endpoint("/session"), or_400(post(open_session)))
        .route(&session.endpoint("/cert"), or_400(get(cert)))
        .fallback(bad_request)
        .with_state(state)
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http()))
}

/// Serve the responder on an already bound listener until it fails.
pub async fn serve(
    listener: TcpListener,
    responder: Arc<Responder>,
    config: ServerConfig,
) -> Result<(), Error> {
    let app = router(responder, &config)?;
    tracing::info!(
        addr = %listener.local_addr()?,
        prefix = %config.session.prefix,
        target = %config.target,
        "responder listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Bind `config.listen_addr` and serve a fresh responder backed by `provider`.
pub async fn run(
    config: ServerConfig,
    provider: impl AttestationProvider + 'static,
    user_data: Option<Vec<u8>>,
) -> Result<(), Error> {
    let listener = tcp::listen(config.listen_addr).await?;
    let cache = SessionCache::new(config.session.session_ttl);
    let responder = Arc::new(Responder::new(provider, cache, user_data));
    serve(listener, responder, config).await
}

fn or_400(route: MethodRouter<AppState>) -> MethodRouter<AppState> {
    route.fallback(bad_request)
}

async fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, "400").into_response()
}

async fn cert() -> &'static str {
    "accept self-signed"
}

async fn cors(req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let status = response.status();
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("OPTIONS, POST, GET"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("9999999"));
    if status != StatusCode::SWITCHING_PROTOCOLS {
        let content_type = if status == StatusCode::OK {
            "application/json"
        } else {
            "text/plain"
        };
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

async fn hello(
    State(state): State<AppState>,
    Query(params): Query<HelloParams>,
) -> Result<Response, AppError> {
    let body = state.responder.hello(&params).await?;
    let cookie = session_cookie(&body.session_id, state.config.cookie_max_age);
    Ok(([(SET_COOKIE, cookie)], Json(body)).into_response())
}

async fn open_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    req: Request,
) -> Result<Response, AppError> {
    let sid = query.sid.or_else(|| {
        req.headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_id_from_cookie)
            .map(str::to_owned)
    });
    let Some(sid) = sid else {
        return Err(SessionError::BadRequest("no session id".into()).into());
    };

    let Some(session) = state.responder.cache().touch(&sid) else {
        tracing::debug!(session = %sid, "unknown session");
        return Ok((StatusCode::NOT_FOUND, "404").into_response());
    };

    match session.envelope {
        Envelope::Tcp => tcp_envelope(state, session, req).await,
        Envelope::Json => json_envelope(state, session, req.into_body()).await,
    }
}

async fn tcp_envelope(
    state: AppState,
    session: Session,
    mut req: Request,
) -> Result<Response, AppError> {
    let wants_upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(UPGRADE_PROTOCOL));
    if !wants_upgrade {
        let reason = format!("tcp envelope needs Upgrade: {UPGRADE_PROTOCOL}");
        return Err(SessionError::BadRequest(reason).into());
    }

    let upgrade = hyper::upgrade::on(&mut req);
    let target = tcp::connect(state.target, state.config.net_timeout).await?;
    tracing::debug!(session = %session.id, target = %state.target, "tcp envelope connected");

    let cache = state.responder.cache().clone();
    let config = Arc::clone(&state.config);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "upgrade failed");
                return;
            }
        };
        let channel = SecureChannel::new(TokioIo::new(upgraded), &session.keys, &config);
        let id = session.id;
        let result = relay(channel, target, config.net_timeout, || {
            cache.touch(&id);
        })
        .await;
        match result {
            Ok(()) => tracing::debug!(session = %id, "tcp envelope closed"),
            Err(e) => tracing::debug!(session = %id, error = %e, "tcp envelope ended"),
        }
    });

    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    Ok(response)
}

async fn json_envelope(
    state: AppState,
    session: Session,
    body: Body,
) -> Result<Response, AppError> {
    let limit = (state.config.max_payload_size as usize).saturating_mul(2);
    let bytes = tokio::time::timeout(state.config.net_timeout, axum::body::to_bytes(body, limit))
        .await
        .map_err(|_| SessionError::Timeout("body read"))?
        .map_err(|e| SessionError::BadRequest(format!("unreadable body: {e}")))?;
    let sealed: SealedMessage = serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::BadRequest(format!("body is not a sealed message: {e}")))?;

    let opened = SealedBox::try_from(&sealed).and_then(|b| open_box(&session.keys.rx, &b));
    let plaintext = match opened {
        Ok(plaintext) => plaintext,
        Err(e) => {
            tracing::warn!(session = %session.id, error = %e, "json envelope integrity failure");
            state.responder.cache().remove(&session.id);
            return Err(e.into());
        }
    };
    let inner: InnerRequest = serde_json::from_slice(&plaintext)
        .map_err(|e| SessionError::BadRequest(format!("inner request: {e}")))?;

    tracing::debug!(
        session = %session.id,
        method = %inner.method,
        path = %inner.path,
        "json envelope call"
    );
    let reply = forward(&state, inner).await?;
    let reply = serde_json::to_vec(&reply)
        .map_err(|e| SessionError::ProtocolViolation(format!("encode inner response: {e}")))?;
    let sealed = seal_box(&session.keys.tx, &reply)?;
    Ok(Json(SealedMessage::from(&sealed)).into_response())
}

/// Replay an inner request against the local target.
async fn forward(state: &AppState, inner: InnerRequest) -> Result<InnerResponse, Error> {
    let bad = |what: &str| SessionError::BadRequest(format!("inner request has invalid {what}"));

    let method = Method::from_bytes(inner.method.as_bytes()).map_err(|_| bad("method"))?;
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, field) in &inner.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| bad("header name"))?;
        if name == CONTENT_LENGTH {
            continue;
        }
        for value in field.values() {
            headers.append(
                name.clone(),
                HeaderValue::from_str(value).map_err(|_| bad("header value"))?,
            );
        }
    }

    // Anything but an origin-form path could re-point the URL at another host.
    if !inner.path.starts_with('/') || inner.path.starts_with("//") {
        return Err(bad("path").into());
    }
    let url = format!("http://{}{}", state.target, inner.path);
    let mut request = state.http.request(method, url).headers(headers);
    if let Some(body) = inner.body_bytes()? {
        request = request.body(body);
    }
    let response = request.send().await?;

    let status = response.status().as_u16();
    let mut out = Headers::new();
    for (name, value) in response.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match out.entry(name.as_str().to_owned()) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(HeaderField::One(value));
            }
            btree_map::Entry::Occupied(mut entry) => entry.get_mut().push(value),
        }
    }
    let body = response.bytes().await?;

    Ok(InnerResponse {
        status,
        headers: out,
        body: Some(BASE64_STANDARD.encode(&body)),
    })
}
