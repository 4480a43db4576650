use dhtscout::{Config, Discovered, OutputFormat};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::load()?;
    let output = config.output;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut crawler = tokio::spawn(dhtscout::run(config, tx));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                crawler.abort();
                return Ok(());
            }
            joined = &mut crawler => {
                return match joined {
                    Ok(result) => result,
                    Err(err) => Err(anyhow::anyhow!("crawler task ended: {err}")),
                };
            }
            Some(found) = rx.recv() => {
                report(output, &found);
            }
        }
    }
}

fn report(output: OutputFormat, found: &Discovered) {
    match output {
        OutputFormat::Log => {
            tracing::info!(
                name = %found.metadata.name,
                size = found.metadata.size,
                files = found.metadata.files.len(),
                peer = %found.peer(),
                magnet = %found.magnet,
                "discovered"
            );
        }
        OutputFormat::Json => match serde_json::to_string(found) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(%err, hash = %found.info_hash, "encode json failed"),
        },
    }
}
