use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::errors::ConfigError;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l} [{M}] {m}{n}";

/// Sets up file (and optionally stdout) logging at the given level.
///
/// # Arguments
///
/// * 'log_path' - path to the log file
/// * 'log_level' - minimum level to record
/// * 'log_to_stdout' - whether to also echo log records to stdout
pub fn setup_logger(log_path: &str, log_level: LevelFilter, log_to_stdout: bool) -> Result<log4rs::Handle, ConfigError> {
    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(log_path)?;

    let mut builder = Config::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if log_to_stdout {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("stdout", Box::new(stdout)));
        root = root.appender("stdout");
    }

    let config = builder
        .logger(Logger::builder().build("power_controller", log_level))
        .build(root.build(log_level))?;

    let handle = log4rs::init_config(config)?;

    Ok(handle)
}
