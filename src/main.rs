mod portbridge;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "portbridge",
    version,
    about = "PortBridge - TCP port forwarding over multiplexed relay streams"
)]
struct Cli {
    /// Path to the PortBridge config file (.toml/.yaml/.yml). If omitted, uses PORTBRIDGE_CONFIG; then auto-detects portbridge.toml > portbridge.yaml > portbridge.yml from CWD; then falls back to the OS default path (Linux: /etc/portbridge/portbridge.toml; others: user config dir).
    #[arg(long, env = "PORTBRIDGE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    portbridge::run(cli.config).await
}
