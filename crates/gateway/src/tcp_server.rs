//! Device-facing TCP listener.

use crate::session::{self, SessionContext};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Accept tracker connections until the token cancels, spawning one
/// session task per connection. Sessions watch the same token and close
/// themselves on shutdown.
pub async fn serve(listener: TcpListener, ctx: SessionContext, cancel: CancellationToken) {
    info!(addr = ?listener.local_addr().ok(), "device listener running");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("device listener stopping");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        session::run(stream, peer, ctx, cancel).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
        }
    }
}
