use anyhow::{bail, Context, Result};
use meeting_audio_hub::{
    config::Config,
    server::{shutdown_signal, Server},
    worker::{self, WorkerConfig},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: meeting_audio_hub [server] [--config-name <name>]\n       meeting_audio_hub worker [--config <json>]";

enum Command {
    Server { config_name: String },
    Worker { config_json: Option<String> },
}

fn parse_args(args: &[String]) -> Result<Command> {
    let (is_worker, flags) = match args.first().map(String::as_str) {
        Some("worker") => (true, &args[1..]),
        Some("server") => (false, &args[1..]),
        Some(flag) if !flag.starts_with("--") => bail!("unknown command {}\n{}", flag, USAGE),
        _ => (false, args),
    };

    let mut config_name = "config".to_string();
    let mut config_json = None;
    let mut flags = flags.iter();
    while let Some(flag) = flags.next() {
        let value = flags
            .next()
            .with_context(|| format!("missing value for {}\n{}", flag, USAGE))?;
        match (flag.as_str(), is_worker) {
            ("--config", true) => config_json = Some(value.clone()),
            ("--config-name", false) => config_name = value.clone(),
            _ => bail!("unexpected argument {}\n{}", flag, USAGE),
        }
    }

    Ok(if is_worker {
        Command::Worker { config_json }
    } else {
        Command::Server { config_name }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("meeting_audio_hub=info,tower_http=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Command::Worker { config_json } => {
            let config = match config_json {
                Some(json) => WorkerConfig::from_json(&json),
                None => WorkerConfig::from_env(),
            }
            .context("invalid worker configuration")?;
            worker::run(config).await?;
        }
        Command::Server { config_name } => {
            info!("Starting Meeting Audio Hub");
            let config = Config::load_from(&config_name)?;
            config.validate()?;
            info!(
                "Configuration loaded: http={}:{} mode={:?}",
                config.server.host, config.server.http_port, config.workers.mode
            );

            let server = Server::new(config)?;
            server.run(shutdown_signal()).await?;
        }
    }

    Ok(())
}
