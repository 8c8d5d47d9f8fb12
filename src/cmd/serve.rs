//! HTTP and WebSocket server command: `omnigen serve`.

use anyhow::Result;
use std::path::Path;

use omnigen::config::{CliOverrides, Settings};

pub async fn cmd_serve(config_path: &Path, overrides: &CliOverrides) -> Result<()> {
    let settings = Settings::resolve(config_path, overrides)?;

    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }

    omnigen::job::server::start_server(settings).await
}
