mod periscope;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "periscope",
    version,
    about = "Expose a service behind NAT through a single multiplexed control link"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the publicly reachable edge: accepts one proxy and many users.
    Edge(periscope::config::EdgeArgs),
    /// Run the proxy next to the protected service.
    Proxy(periscope::config::ProxyArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Edge(args) => {
            let (cfg, logging) = args.resolve()?;
            let _logrt = periscope::logging::init(&logging)?;
            periscope::run_edge(cfg).await
        }
        Command::Proxy(args) => {
            let (cfg, logging) = args.resolve()?;
            let _logrt = periscope::logging::init(&logging)?;
            periscope::run_proxy(cfg).await
        }
    }
}
