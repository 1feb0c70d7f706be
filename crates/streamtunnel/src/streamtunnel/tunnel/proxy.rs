use std::sync::Arc;

use tokio::net::TcpStream;

use crate::streamtunnel::{
    net,
    tunnel::{bridge, error::TunnelError, mux::MuxSession},
};

/// Opens a data stream on `session`, dials the backend for `port` and starts bridging.
///
/// Returns as soon as the bridge is running; the bridge owns both endpoints from then on.
/// Failures are reported to the caller only. The server is expected to notice the
/// missing data on its side.
pub async fn open(
    session: Arc<dyn MuxSession>,
    port: &str,
    local_addr: Option<&str>,
) -> Result<(), TunnelError> {
    let remote = session.open_stream().await.map_err(TunnelError::Open)?;

    let target = net::local_target(port, local_addr).into_owned();
    let local = dial_local(&target).await?;

    tracing::debug!(port=%port, local=%target, "proxy: session started");

    tokio::spawn(async move {
        let outcome = bridge::join(local, remote).await;
        match outcome.result {
            Ok(bytes) => {
                tracing::debug!(local=%target, first=%outcome.first, bytes, "proxy: session ended");
            }
            Err(err) => {
                tracing::debug!(local=%target, first=%outcome.first, err=%err, "proxy: session ended with error");
            }
        }
    });

    Ok(())
}

async fn dial_local(addr: &str) -> Result<TcpStream, TunnelError> {
    // Tokio sockets carry no read/write deadline, so long-lived transfers are not cut off.
    let c = TcpStream::connect(addr).await.map_err(|err| TunnelError::LocalDial {
        addr: addr.to_string(),
        err,
    })?;
    let _ = c.set_nodelay(true);
    Ok(c)
}
