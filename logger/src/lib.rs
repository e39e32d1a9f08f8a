use std::str::FromStr;

use colored::Colorize;
use db::Store;
use stages::log::LogStage;
use std::sync::Arc;

pub mod stages {
    pub mod log;
}

pub fn setup(level: &str, file: &str) -> Result<(), fern::InitError> {
    let level = log::LevelFilter::from_str(level).unwrap_or(log::LevelFilter::Info);

    fern::Dispatch::new()
        .format(|out, message, record| {
            let color = match record.level() {
                log::Level::Info => "green",
                log::Level::Warn => "yellow",
                log::Level::Error => "red",
                log::Level::Debug => "magenta",
                log::Level::Trace => "bright black",
            };
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%H:%M:%S]"),
                record.target(),
                record.level().to_string().color(color),
                message
            ))
        })
        .level(level)
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("h2", log::LevelFilter::Warn)
        .level_for("sqlx", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(file)?)
        .apply()?;
    Ok(())
}

/// Request log writer; `sync` writes before the reply is returned.
pub fn log_stage(store: Arc<dyn Store>, sync: bool) -> LogStage {
    LogStage::new(store, sync)
}
