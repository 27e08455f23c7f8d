use crate::Proxy;
use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown, service::TowerToHyperService};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, instrument, Instrument};

/// Accepts connections on `addr` until `drain` is signaled, then waits for in-flight
/// connections to complete.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve(addr: SocketAddr, proxy: Proxy, drain: drain::Watch) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Metadata proxy listening");

    let graceful = GracefulShutdown::new();
    let signaled = drain.signaled();
    tokio::pin!(signaled);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (io, peer) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        debug!(%error, "Failed to accept connection");
                        continue;
                    }
                };

                let svc = TowerToHyperService::new(proxy.service(peer));
                let conn = http1::Builder::new().serve_connection(TokioIo::new(io), svc);
                let conn = graceful.watch(conn);
                tokio::spawn(
                    async move {
                        if let Err(error) = conn.await {
                            debug!(%error, "Connection closed");
                        }
                    }
                    .instrument(info_span!("conn", %peer)),
                );
            }

            handle = &mut signaled => {
                info!("Shutting down metadata proxy");
                handle.release_after(graceful.shutdown()).await;
                return Ok(());
            }
        }
    }
}
