use dotenvy::dotenv;
use tracing::error;

use codesync::agent::AgentConfig;

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "codesync=info".into()),
        )
        .init();

    let cfg = match AgentConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "invalid agent configuration");
            std::process::exit(1);
        }
    };

    // run() only returns on fatal startup failure; server unreachability
    // is retried forever inside.
    if let Err(err) = codesync::agent::run(cfg).await {
        error!(%err, "agent failed");
        std::process::exit(1);
    }
}
