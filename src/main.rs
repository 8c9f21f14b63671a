use std::path::PathBuf;

use clap::Parser;

use tandem_lib::config::AppConfig;

#[derive(Parser)]
#[command(name = "tandem", version, about = "Study assistant server")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "tandem.toml")]
    config: PathBuf,

    /// Override the bind address from the config file.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    let state = tandem_lib::build_state(&config)?;
    let mut handle = tandem_lib::server::start(state, &config.server.bind).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Received Ctrl-C, shutting down");
    handle.stop();
    handle.stopped().await;

    Ok(())
}
