use clap::Parser;
use inference_gateway::config::Config;
use inference_gateway::create_server;
use std::net::SocketAddr;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "inference-gateway", about = "Demonstration HTTP surface over the inference control plane")]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 3000)]
    port: u16,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(&args.log_level).init();

    let mut config = Config::load(&args.config)?;
    config.server.host = args.host.clone();
    config.server.port = args.port;
    config.validate()?;

    let app = create_server(config).await?;

    let addr = SocketAddr::new(args.host.parse()?, args.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "inference-gateway listening");
    axum::serve(listener, app).await?;

    Ok(())
}
