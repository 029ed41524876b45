#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, Limited};
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parley_domain::{RoomId, UserId};
use parley_util::SecretString;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::server::auth::{TokenGate, constant_time_eq};

const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Credentials check for `/login` and the rooms every issued access token grants.
#[derive(Debug, Clone)]
pub struct LoginPolicy {
	pub password: SecretString,
	pub rooms: Vec<RoomId>,
}

#[derive(Clone)]
pub struct HttpState {
	pub health: HealthState,
	pub tokens: Arc<dyn TokenGate>,
	pub login: LoginPolicy,
}

#[derive(Debug, Default, Deserialize)]
struct LoginForm {
	#[serde(default)]
	user: String,
	#[serde(default)]
	password: String,
}

#[derive(Debug, Serialize)]
struct LoginReply {
	access_token: String,
	refresh_token: String,
}

#[derive(Debug, Serialize)]
struct RefreshReply {
	access_token: String,
}

pub fn spawn_http_server(bind: SocketAddr, state: HttpState) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, state).await {
			warn!(error = %err, "http server stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "http endpoint listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

pub async fn handle_request<B>(req: Request<B>, state: HttpState) -> Result<Response<Full<Bytes>>, Infallible>
where
	B: Body,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let resp = match (req.method(), req.uri().path()) {
		(&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
		(&Method::GET, "/readyz") => {
			if state.health.is_ready() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		(&Method::POST, "/login") => login(req, &state).await,
		(&Method::POST, "/refresh") => refresh(&req, &state),
		(_, "/healthz" | "/readyz" | "/login" | "/refresh") => empty(StatusCode::METHOD_NOT_ALLOWED),
		_ => empty(StatusCode::NOT_FOUND),
	};

	Ok(resp)
}

async fn login<B>(req: Request<B>, state: &HttpState) -> Response<Full<Bytes>>
where
	B: Body,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let is_form = req
		.headers()
		.get(CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

	let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			debug!(error = %e, "login body rejected");
			return text(StatusCode::BAD_REQUEST, "invalid body");
		}
	};

	let form = if is_form {
		let mut form = LoginForm::default();
		for (k, v) in url::form_urlencoded::parse(&body) {
			match k.as_ref() {
				"user" => form.user = v.into_owned(),
				"password" => form.password = v.into_owned(),
				_ => {}
			}
		}
		form
	} else {
		match serde_json::from_slice::<LoginForm>(&body) {
			Ok(form) => form,
			Err(_) => return text(StatusCode::BAD_REQUEST, "invalid body"),
		}
	};

	let Ok(user) = UserId::new(form.user.trim()) else {
		return text(StatusCode::BAD_REQUEST, "missing user");
	};
	if form.password.is_empty() {
		return text(StatusCode::BAD_REQUEST, "missing password");
	}

	if !constant_time_eq(form.password.as_bytes(), state.login.password.expose().as_bytes()) {
		metrics::counter!("parley_server_login_failures_total").increment(1);
		info!(user = %user, "login rejected");
		return text(StatusCode::UNAUTHORIZED, "invalid credentials");
	}

	let issued = state
		.tokens
		.issue_access(&user, &state.login.rooms)
		.and_then(|access| Ok((access, state.tokens.issue_refresh(&user)?)));

	match issued {
		Ok((access_token, refresh_token)) => {
			info!(user = %user, "login succeeded");
			json(
				StatusCode::OK,
				&LoginReply {
					access_token,
					refresh_token,
				},
			)
		}
		Err(e) => {
			warn!(user = %user, error = %e, "failed to issue tokens");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

fn refresh<B>(req: &Request<B>, state: &HttpState) -> Response<Full<Bytes>> {
	let bearer = req
		.headers()
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.trim())
		.map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
		.filter(|v| !v.is_empty());

	let Some(token) = bearer else {
		return text(StatusCode::UNAUTHORIZED, "missing token");
	};

	let user = match state.tokens.validate_refresh(token) {
		Ok(user) => user,
		Err(e) => {
			debug!(error = %e, "refresh token rejected");
			return text(StatusCode::UNAUTHORIZED, "invalid token");
		}
	};

	match state.tokens.issue_access(&user, &state.login.rooms) {
		Ok(access_token) => json(StatusCode::OK, &RefreshReply { access_token }),
		Err(e) => {
			warn!(user = %user, error = %e, "failed to issue access token");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

fn respond(status: StatusCode, content_type: Option<&'static str>, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	if let Some(ct) = content_type {
		resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(ct));
	}
	resp
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	respond(status, None, Bytes::new())
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	respond(status, Some("text/plain; charset=utf-8"), Bytes::from_static(body.as_bytes()))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
	match serde_json::to_vec(value) {
		Ok(body) => respond(status, Some("application/json"), Bytes::from(body)),
		Err(e) => {
			warn!(error = %e, "failed to encode response");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}
