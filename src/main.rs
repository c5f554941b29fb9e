use clap::Parser;
use voicebridge::config::Config;

#[derive(Parser)]
#[command(name = "voicebridged", version, about = "Realtime audio bridge daemon")]
struct Cli {
    /// Path to config.toml, overriding VOICEBRIDGE_CONFIG.
    #[arg(long)]
    config: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(path) = cli.config {
        std::env::set_var("VOICEBRIDGE_CONFIG", path);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicebridge=info".into()),
        )
        .init();

    let config = Config::load()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(voicebridge::server::serve(config))
}
