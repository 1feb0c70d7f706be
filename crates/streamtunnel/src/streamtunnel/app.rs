use std::path::PathBuf;

use anyhow::Context;

use crate::streamtunnel::{config, logging, tunnel};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let exists = resolved.path.is_file();
    if !exists && resolved.source.is_explicit() {
        anyhow::bail!(
            "config: {} not found (from {})",
            resolved.path.display(),
            resolved.source
        );
    }

    let mut cfg = if exists {
        config::load_config(&resolved.path)
            .with_context(|| format!("load config: {}", resolved.path.display()))?
    } else {
        config::Config::default()
    };
    cfg.apply(&overrides);
    cfg.validate()?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let config_display = if exists {
        resolved.path.display().to_string()
    } else {
        "<none>".to_string()
    };
    tracing::info!(
        config = %config_display,
        source = %resolved.source,
        server = %cfg.server_addr,
        local_addr = %cfg.local_addr.as_deref().unwrap_or(""),
        keepalive = cfg.mux.enable_keepalive,
        keepalive_interval = %humantime::format_duration(cfg.mux.keepalive_interval),
        "streamtunnel: starting"
    );

    let mut client = tunnel::client::Client::new(tunnel::client::ClientOptions {
        server_addr: cfg.server_addr.clone(),
        local_addr: cfg.local_addr.clone(),
        mux: cfg.mux.clone(),
    })?;

    // `start` only returns on a fatal error; a signal interrupts it instead.
    let res = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            None
        }
        res = client.start(&cfg.identifier) => Some(res),
    };

    client.close().await;

    match res {
        None => Ok(()),
        Some(Ok(())) => Ok(()),
        Some(Err(err)) => {
            tracing::error!(server = %cfg.server_addr, err = %err, "tunnel: client stopped");
            Err(err.into())
        }
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
