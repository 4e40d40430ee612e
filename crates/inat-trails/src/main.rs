mod logging;
mod report;
mod run;
mod settings;

use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::setup_logging();
    run::run(Settings::from_cli()).await
}
