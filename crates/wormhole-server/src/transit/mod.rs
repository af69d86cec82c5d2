//! The transit relay: a content-oblivious TCP rendezvous. Connections that
//! present the same handshake token get their byte streams spliced
//! together; the relay never looks inside.

pub mod client;
pub mod matcher;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use matcher::Matcher;

/// Accept transit connections until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    matcher: Arc<Matcher>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "transit server listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "transit connection accepted");
                    tokio::spawn(client::handle_connection(stream, matcher.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "transit accept failed");
                }
            }
        }
    }

    info!("transit server closed");
    Ok(())
}
