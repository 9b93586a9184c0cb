//! Entry point: loads a RON configuration document and runs the service
//! until shutdown.

use std::path::PathBuf;

use embermail::config::Config;

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("EMBERMAIL_CONFIG") {
        return PathBuf::from(path);
    }

    let cwd = PathBuf::from("embermail.config.ron");
    if cwd.exists() {
        return cwd;
    }

    PathBuf::from("/etc/embermail/embermail.config.ron")
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    embermail_common::logging::init();

    let path = config_path();
    let document = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = ron::from_str(&document)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;

    let service = embermail::Embermail::build(config).await?;
    service.run().await
}
