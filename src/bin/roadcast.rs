//! Roadcast server - HTTP front for the resilient weather/traffic client.

use roadcast::server::{self, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err.into());
        }
    }

    let config = ServerConfig::load()?;
    server::start_server(config).await?;

    Ok(())
}
