use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Smallest per-stream window yamux is allowed to advertise.
pub const MIN_STREAM_WINDOW: u32 = 256 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxConfigError {
    #[error("accept_backlog must be positive")]
    AcceptBacklog,
    #[error("keepalive_interval must be positive when keepalive is enabled")]
    KeepaliveInterval,
    #[error("connection_write_timeout must be positive")]
    WriteTimeout,
    #[error("max_stream_count must be positive")]
    MaxStreamCount,
    #[error("max_stream_window_size must be at least {MIN_STREAM_WINDOW} (got {0})")]
    StreamWindow(u32),
}

/// Multiplexer parameters handed to every new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    pub accept_backlog: usize,
    pub enable_keepalive: bool,
    pub keepalive_interval: Duration,
    pub connection_write_timeout: Duration,
    pub max_stream_count: usize,
    pub max_stream_window_size: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            enable_keepalive: true,
            keepalive_interval: Duration::from_secs(30),
            connection_write_timeout: Duration::from_secs(10),
            max_stream_count: 65535,
            max_stream_window_size: MIN_STREAM_WINDOW,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), MuxConfigError> {
        if self.accept_backlog == 0 {
            return Err(MuxConfigError::AcceptBacklog);
        }
        if self.enable_keepalive && self.keepalive_interval.is_zero() {
            return Err(MuxConfigError::KeepaliveInterval);
        }
        if self.connection_write_timeout.is_zero() {
            return Err(MuxConfigError::WriteTimeout);
        }
        if self.max_stream_count == 0 {
            return Err(MuxConfigError::MaxStreamCount);
        }
        if self.max_stream_window_size < MIN_STREAM_WINDOW {
            return Err(MuxConfigError::StreamWindow(self.max_stream_window_size));
        }
        Ok(())
    }

    fn to_yamux(&self) -> tokio_yamux::Config {
        let mut c = tokio_yamux::Config::default();
        c.accept_backlog = self.accept_backlog;
        c.enable_keepalive = self.enable_keepalive;
        c.keepalive_interval = self.keepalive_interval;
        c.connection_write_timeout = self.connection_write_timeout;
        c.max_stream_count = self.max_stream_count;
        c.max_stream_window_size = self.max_stream_window_size;
        c
    }
}

/// The multiplexed session shared by the control stream and every proxy stream.
///
/// `open_stream` must be safe to call from many tasks at once.
#[async_trait]
pub trait MuxSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

pub struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    remote: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    /// Promotes an already-negotiated raw connection into a client-role session.
    pub fn client(c: TcpStream, cfg: &MuxConfig) -> Result<Self, MuxConfigError> {
        cfg.validate()?;
        let remote = c.peer_addr().ok();
        let session = tokio_yamux::Session::new_client(c, cfg.to_yamux());
        Ok(Self::from_session(session, remote))
    }

    fn from_session(mut session: tokio_yamux::Session<TcpStream>, remote: Option<SocketAddr>) -> Self {
        let control = session.control();

        // The session only makes progress while polled. Server-initiated streams are not
        // part of the protocol; drop them.
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(mut st) => {
                        tracing::debug!("mux: dropping unexpected inbound stream");
                        let _ = st.shutdown().await;
                    }
                    Err(err) => {
                        tracing::debug!(err=%err, "mux: session ended");
                        break;
                    }
                }
            }
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            remote,
            task,
        }
    }
}

#[async_trait]
impl MuxSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
        self.task.abort();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(MuxConfig::default().validate(), Ok(()));
    }

    #[test]
    fn validate_names_the_offending_parameter() {
        let base = MuxConfig::default();

        let c = MuxConfig { accept_backlog: 0, ..base.clone() };
        assert_eq!(c.validate(), Err(MuxConfigError::AcceptBacklog));

        let c = MuxConfig { keepalive_interval: Duration::ZERO, ..base.clone() };
        assert_eq!(c.validate(), Err(MuxConfigError::KeepaliveInterval));

        // A zero interval is fine when keepalive is off.
        let c = MuxConfig {
            enable_keepalive: false,
            keepalive_interval: Duration::ZERO,
            ..base.clone()
        };
        assert_eq!(c.validate(), Ok(()));

        let c = MuxConfig { connection_write_timeout: Duration::ZERO, ..base.clone() };
        assert_eq!(c.validate(), Err(MuxConfigError::WriteTimeout));

        let c = MuxConfig { max_stream_count: 0, ..base.clone() };
        assert_eq!(c.validate(), Err(MuxConfigError::MaxStreamCount));

        let c = MuxConfig { max_stream_window_size: 1024, ..base };
        assert_eq!(c.validate(), Err(MuxConfigError::StreamWindow(1024)));
    }
}
