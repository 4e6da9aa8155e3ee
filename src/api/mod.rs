//! Local HTTP control surface.
//!
//! A small loopback-only server that lets co-resident tooling (including
//! tools invoked by the model itself) enumerate agents, create them, and
//! deliver inter-agent messages. The local host is the trust boundary:
//! there is no authentication, CORS is permissive, and the bind address is
//! always `127.0.0.1`.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;

use std::io;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;

/// Default control API port.
pub const DEFAULT_PORT: u16 = 9223;

/// How many consecutive ports are tried after the preferred one.
const PORT_FALLBACK_RANGE: u16 = 50;

/// Bind the loopback listener, walking up from `port` on `EADDRINUSE`.
/// Returns the listener and the port actually bound.
pub async fn bind_with_fallback(port: u16) -> Result<(TcpListener, u16)> {
    let mut candidate = port;
    loop {
        match TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => {
                info!("control API listening on 127.0.0.1:{candidate}");
                return Ok((listener, candidate));
            }
            Err(err)
                if err.kind() == io::ErrorKind::AddrInUse
                    && candidate < port.saturating_add(PORT_FALLBACK_RANGE) =>
            {
                warn!("port {candidate} in use, trying {}", candidate + 1);
                candidate += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("binding 127.0.0.1:{candidate}"))
            }
        }
    }
}
