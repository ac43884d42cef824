use std::sync::Arc;

use anyhow::Context;
use config::{Config, Environment, File};

use crate::bot::Bot;

mod bot;
mod calendar;
mod cfg;
mod commands;
mod parse;

/// Loads the configuration using the `config` crate
fn load_config() -> Result<cfg::Config, anyhow::Error> {
    let settings = Config::builder()
        .add_source(File::with_name("config"))
        .add_source(Environment::with_prefix("AGENDA"))
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[tokio::main]
/// Entrypoint for the Agenda discord bot.
/// Agenda keeps one calendar of events per guild, announces events when
/// they start and deletes or repeats them when they end.
async fn main() -> Result<(), anyhow::Error> {
    // Initialize the logger
    pretty_env_logger::init();

    // load the config
    let config = Arc::from(load_config()?);

    let bot = Bot::new(config).await.context("failed to create the bot")?;
    bot.start().await
}
