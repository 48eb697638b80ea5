use clap::Parser;

mod app;
mod config;
mod feed;

#[derive(Parser)]
#[command(name = "perp-engine")]
#[command(about = "Position and risk lifecycle engine for perpetual futures", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ConfigLoader::load(&cli.config)?;
    app::run(config).await
}
