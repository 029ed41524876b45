#![forbid(unsafe_code)]

use tokio::sync::watch;

/// Process-wide shutdown signal; `true` means stop.
pub type ShutdownRx = watch::Receiver<bool>;

/// Resolves once shutdown is requested. A dropped sender never resolves.
pub async fn wait_for_shutdown(rx: &mut ShutdownRx) {
	loop {
		if *rx.borrow_and_update() {
			return;
		}
		if rx.changed().await.is_err() {
			std::future::pending::<()>().await;
		}
	}
}
