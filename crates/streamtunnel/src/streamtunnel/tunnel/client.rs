use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::streamtunnel::tunnel::{
    control::{Action, ControlDecoder},
    error::TunnelError,
    handshake,
    mux::{MuxConfig, MuxSession},
    proxy,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    /// Fixed backend address. When unset, every proxy request dials
    /// `127.0.0.1:<port>` with the port supplied by the server.
    pub local_addr: Option<String>,
    pub mux: MuxConfig,
}

/// Reverse-tunnel client: holds one control connection to the tunnel server and
/// bridges every server-requested stream to the local backend.
///
/// Proxy sessions are not admission-controlled. Each control message spawns its own
/// task immediately, and the number of concurrent sessions is bounded only by what the
/// server asks for.
pub struct Client {
    opts: ClientOptions,
    local_addr: Option<Arc<str>>,
    session: Option<Arc<dyn MuxSession>>,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> Result<Self, TunnelError> {
        opts.mux.validate()?;

        opts.server_addr = opts.server_addr.trim().to_string();
        opts.local_addr = opts
            .local_addr
            .take()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        let local_addr = opts.local_addr.as_deref().map(Arc::from);

        Ok(Self {
            opts,
            local_addr,
            session: None,
        })
    }

    /// Connects, performs the handshake and then services control messages until the
    /// control stream fails.
    ///
    /// Only returns on failure; the error is the first fatal one encountered. No
    /// reconnection is attempted here. Calling `start` again begins a fresh connection.
    pub async fn start(&mut self, identifier: &str) -> Result<(), TunnelError> {
        self.close().await;

        let session = handshake::connect(&self.opts.server_addr, identifier, &self.opts.mux).await?;
        self.session = Some(session.clone());

        let control = match handshake::open_control(session.clone(), handshake::OPEN_TIMEOUT).await {
            Ok(st) => st,
            Err(err) => {
                self.close().await;
                return Err(err);
            }
        };

        tracing::info!(
            server=%self.opts.server_addr,
            remote=?session.remote_addr(),
            identifier=%identifier,
            local=%self.local_addr.as_deref().unwrap_or("127.0.0.1:<port>"),
            "tunnel: client has started successfully"
        );

        let err = listen_control(session, self.local_addr.clone(), control).await;
        self.close().await;
        Err(err)
    }

    /// Tears down the current session, which ends every proxy session riding on it.
    pub async fn close(&mut self) {
        if let Some(sess) = self.session.take() {
            sess.close().await;
        }
    }
}

/// Decodes control messages one at a time and dispatches them.
///
/// Each proxy request runs on its own task so decoding never waits for a backend.
/// Returns the decode error that ended the loop.
pub async fn listen_control<R: AsyncRead + Unpin>(
    session: Arc<dyn MuxSession>,
    local_addr: Option<Arc<str>>,
    control: R,
) -> TunnelError {
    let mut dec = ControlDecoder::new(control);
    loop {
        let msg = match dec.next_message().await {
            Ok(msg) => msg,
            Err(err) => return err.into(),
        };

        tracing::debug!(action=?msg.action, local_port=%msg.local_port, "control: message");

        match msg.action {
            Action::RequestClientSession => {
                let session = session.clone();
                let local_addr = local_addr.clone();
                tokio::spawn(async move {
                    if let Err(err) = proxy::open(session, &msg.local_port, local_addr.as_deref()).await {
                        tracing::warn!(local_port=%msg.local_port, err=%err, "proxy: session failed");
                    }
                });
            }
            Action::Unknown(tag) => {
                tracing::debug!(action = tag, "control: ignoring unknown action");
            }
        }
    }
}
