use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use boltgate::backend::{Backend, ClusterConfig};
use boltgate::proxy;

/// Protocol-aware Bolt proxy for clustered graph databases.
#[derive(Parser, Debug)]
#[command(name = "boltgate")]
#[command(about = "Protocol-aware Bolt proxy for clustered graph databases")]
#[command(version)]
struct Args {
    /// host:port to bind to
    #[arg(long, default_value = "localhost:8888")]
    bind: String,

    /// Remote graph database host (host:port or scheme://host:port)
    #[arg(long, default_value = "alpine:7687")]
    host: String,

    /// Database username
    #[arg(long, default_value = "neo4j")]
    user: String,

    /// Database password
    #[arg(long, default_value = "")]
    pass: String,

    /// Static resolver entries (host:port) overriding cluster-advertised
    /// addresses; repeatable
    #[arg(long = "resolve")]
    resolve: Vec<String>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,boltgate=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let config = match ClusterConfig::parse(&args.host, &args.user, &args.pass, args.resolve) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid cluster configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(host = %config.host, "starting bolt-proxy back-end");
    let backend = match Backend::new(config).await {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::error!(error = %e, "failed to start backend");
            std::process::exit(1);
        }
    };

    tracing::info!("starting bolt-proxy front-end");
    tokio::select! {
        result = proxy::serve(&args.bind, backend.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy terminated");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            backend.shutdown();
        }
    }
}
