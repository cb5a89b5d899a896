//! Logging setup for the fan controller

use fern::Dispatch;
use log::LevelFilter;

/// Map a `-v` count to a level filter
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Setup logging with the specified verbosity level.
///
/// Log lines go to stderr; stdout is reserved for reports.
pub fn setup(verbosity: u8) -> Result<(), fern::InitError> {
    Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level_for(verbosity))
        .chain(std::io::stderr())
        .apply()?;

    Ok(())
}
