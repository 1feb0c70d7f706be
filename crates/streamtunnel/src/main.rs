mod streamtunnel;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "streamtunnel",
    version,
    about = "streamtunnel - expose a local service through a reverse tunnel server"
)]
struct Cli {
    /// Path to config file (.toml/.yaml/.yml). If omitted, uses STREAMTUNNEL_CONFIG; then auto-detects streamtunnel.toml > streamtunnel.yaml > streamtunnel.yml from CWD; then falls back to the OS default path (Linux: /etc/streamtunnel/streamtunnel.toml; others: user config dir). A missing auto-detected file is fine when the flags below are set.
    #[arg(long, env = "STREAMTUNNEL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Tunnel server address (host:port).
    #[arg(long, env = "STREAMTUNNEL_SERVER_ADDR")]
    server_addr: Option<String>,

    /// Identifier presented to the tunnel server.
    #[arg(long, env = "STREAMTUNNEL_IDENTIFIER")]
    identifier: Option<String>,

    /// Fixed local backend address. When unset, requests go to 127.0.0.1:<port from server>.
    #[arg(long, env = "STREAMTUNNEL_LOCAL_ADDR")]
    local_addr: Option<String>,

    /// Enable debug logging.
    #[arg(long, env = "STREAMTUNNEL_DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    streamtunnel::run(
        cli.config,
        streamtunnel::config::Overrides {
            server_addr: cli.server_addr,
            identifier: cli.identifier,
            local_addr: cli.local_addr,
            debug: cli.debug,
        },
    )
    .await
}
