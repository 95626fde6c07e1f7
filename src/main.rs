use clap::Parser;
use hawser::{
    DEFAULT_OFFSHORE_PORT, DEFAULT_SHIP_PROXY_PORT, OffshoreProxy, ShipConfig, ShipProxy,
};
use n0_error::Result;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(version, about)]
enum Cli {
    /// Run the internet-facing offshore node.
    Offshore {
        /// Port to listen on for the ship link.
        #[clap(long, env = "OFFSHORE_PORT", default_value_t = DEFAULT_OFFSHORE_PORT)]
        port: u16,
    },
    /// Run the client-facing ship node.
    Ship {
        /// Port the local HTTP proxy listens on.
        #[clap(long, env = "SHIP_PROXY_PORT", default_value_t = DEFAULT_SHIP_PROXY_PORT)]
        port: u16,
        /// Host of the offshore node.
        #[clap(long, env = "OFFSHORE_HOST")]
        offshore_host: String,
        /// Port of the offshore node.
        #[clap(long, env = "OFFSHORE_PORT", default_value_t = DEFAULT_OFFSHORE_PORT)]
        offshore_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    match Cli::parse() {
        Cli::Offshore { port } => {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            println!("offshore listening on {}", listener.local_addr()?);
            let proxy = OffshoreProxy::new()?;
            tokio::select! {
                res = proxy.serve(listener) => res?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Cli::Ship {
            port,
            offshore_host,
            offshore_port,
        } => {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            println!("ship proxy listening on {}", listener.local_addr()?);
            let proxy = ShipProxy::new(ShipConfig::new(offshore_host, offshore_port));
            tokio::select! {
                res = proxy.serve(listener) => res?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }
    Ok(())
}
