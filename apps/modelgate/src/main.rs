use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = cli::Cli::parse();
    let gateway = modelgate_core::bootstrap(args.into_patch()?).await?;
    let config = gateway.state.config.load();

    let admin_state = modelgate_admin::AdminState {
        app: gateway.state.clone(),
        storage: gateway.storage.clone(),
        selector: gateway.selector.clone(),
        pricing: gateway.pricing.clone(),
        health: gateway.health.clone(),
    };

    let app = axum::Router::new()
        .merge(modelgate_router::proxy_router(
            gateway.state.clone(),
            gateway.relay.clone(),
        ))
        .nest("/admin", modelgate_admin::router(admin_state));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    println!("listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}
