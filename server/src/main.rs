use std::sync::Arc;

use outpost_core::config;
use outpost_core::config::Config;
use outpost_core::token;
use outpost_server::ServeOptions;

/// Standalone daemon entry point. The `outpost` CLI wraps the same `serve`
/// with workspace/host/port/token flags; this binary takes everything from
/// the config file.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let home = config::outpost_home()?;
    let config = Arc::new(Config::load(&config::config_path(&home))?);
    outpost_server::init_logging(&config.logging);

    let workspace = config.workspace(None)?;
    let token = token::load_or_create(&home)?;

    outpost_server::serve(ServeOptions {
        config,
        workspace,
        token,
        home,
        host: None,
        port: None,
    })
    .await
}
