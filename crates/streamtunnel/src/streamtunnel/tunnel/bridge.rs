use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::LocalToRemote => write!(f, "local->remote"),
            Direction::RemoteToLocal => write!(f, "remote->local"),
        }
    }
}

/// Result of the direction that finished first. The other direction's result is
/// never observed.
#[derive(Debug)]
pub struct BridgeOutcome {
    pub first: Direction,
    pub result: io::Result<u64>,
}

/// Copies bytes both ways between `local` and `remote` until either direction ends.
///
/// Whichever direction finishes first (EOF or error) decides the outcome. The other
/// direction is cancelled, then both endpoints are shut down and dropped. A direction
/// that reaches EOF flushes everything it read before reporting.
pub async fn join<L, R>(local: L, remote: R) -> BridgeOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    let outcome = {
        let up = tokio::io::copy(&mut local_rd, &mut remote_wr);
        let down = tokio::io::copy(&mut remote_rd, &mut local_wr);
        tokio::select! {
            res = up => BridgeOutcome { first: Direction::LocalToRemote, result: res },
            res = down => BridgeOutcome { first: Direction::RemoteToLocal, result: res },
        }
    };

    let mut remote = remote_rd.unsplit(remote_wr);
    let mut local = local_rd.unsplit(local_wr);
    let _ = remote.shutdown().await;
    let _ = local.shutdown().await;

    outcome
}
