use clap::Parser;

use coach_telemetry::{init_telemetry, TelemetryConfig};

mod app;
mod cli;
mod commands;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = coach_settings::load_settings()?;

    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    init_telemetry(&TelemetryConfig::from_level_name(level, settings.logging.json))?;

    let app = app::App::open(settings)?;
    match cli.command {
        Command::Models => commands::models(&app),
        Command::Show { unit } => commands::show(&app, &unit),
        Command::Prompt { unit, phase, tier } => commands::prompt(&app, &unit, phase, tier),
        Command::Complete { unit, phase } => commands::complete(&app, &unit, &phase),
        Command::Check { unit, phase, item } => commands::check(&app, &unit, &phase, item),
        Command::Select { unit, phase } => commands::select(&app, &unit, phase),
        Command::Advance { unit } => commands::advance(&app, &unit),
        Command::Use { model } => commands::use_model(&app, &model),
        Command::Keys { action } => commands::keys(&app, action),
        Command::Chat { unit, model, phase } => commands::chat(&app, &unit, model, phase).await,
    }
}
