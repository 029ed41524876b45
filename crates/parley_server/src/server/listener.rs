#![forbid(unsafe_code)]

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::server::connection::{Gateway, Rejection};
use crate::util::shutdown::{ShutdownRx, wait_for_shutdown};

/// Accept TCP connections and upgrade them to WebSocket sessions until shutdown.
pub async fn serve(listener: TcpListener, gateway: Gateway, mut shutdown: ShutdownRx) -> anyhow::Result<()> {
	info!(addr = %listener.local_addr()?, "websocket listener ready");

	let stop = wait_for_shutdown(&mut shutdown);
	tokio::pin!(stop);

	loop {
		let accepted = tokio::select! {
			_ = &mut stop => break,
			accepted = listener.accept() => accepted,
		};

		let (stream, peer) = match accepted {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		metrics::counter!("parley_server_connections_total").increment(1);
		let gateway = gateway.clone();
		tokio::spawn(async move {
			upgrade_and_run(stream, peer, gateway).await;
		});
	}

	info!("websocket listener stopped");
	Ok(())
}

async fn upgrade_and_run(stream: TcpStream, peer: SocketAddr, gateway: Gateway) {
	let mut credentials: Option<(Option<String>, Option<String>)> = None;

	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		let bearer = req
			.headers()
			.get("authorization")
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let room = req.uri().query().and_then(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.find(|(k, _)| k == "room")
				.map(|(_, v)| v.into_owned())
		});

		// Refuse at the HTTP layer so clients see a status code instead of an immediate close.
		if let Err(rejection) = gateway.authorize(bearer.as_deref(), room.as_deref()) {
			let status = match rejection {
				Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
				Rejection::Forbidden(_) => StatusCode::FORBIDDEN,
			};
			metrics::counter!("parley_server_rejected_connections_total").increment(1);
			info!(%peer, %status, reason = %rejection, "websocket upgrade rejected");

			let mut err = ErrorResponse::new(Some(rejection.to_string()));
			*err.status_mut() = status;
			return Err(err);
		}

		credentials = Some((bearer, room));
		Ok(resp)
	};

	let ws = match accept_hdr_async(stream, callback).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%peer, error = %e, "websocket handshake failed");
			return;
		}
	};

	let Some((bearer, room)) = credentials else {
		warn!(%peer, "handshake completed without credentials");
		return;
	};

	if let Err(e) = gateway.handle_connection(ws, bearer.as_deref(), room.as_deref()).await {
		warn!(%peer, error = %e, "session ended with error");
	}
}
