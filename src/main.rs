mod cli;

use anyhow::Result;
use calendar_chat_agent::config::ConfigManager;
use calendar_chat_agent::logging;
use cli::{Cli, CliApp};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::new()?;
    let config = config_manager.load_config()?;
    logging::init(cli.verbose || config.app.verbose.unwrap_or(false));
    debug!(path = %config_manager.get_config_file_path().display(), "設定を読み込みました");

    let app = CliApp::new(&cli, config_manager, config)?;
    app.run(&cli).await
}
