use chrono::{DateTime, Utc};
use log::{Level as LogLevel, Log, Metadata, Record, SetLoggerError};

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub time_format: String,
    /// Records from modules whose path contains one of these are dropped.
    pub mod_filter: Vec<String>,
    /// Records whose message contains one of these are dropped.
    pub body_filter: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            time_format: "%Y-%m-%d %H:%M:%S%z".to_string(),
            mod_filter: Vec::new(),
            body_filter: Vec::new(),
        }
    }
}

/// Line-oriented logger writing to stderr.
#[derive(Clone, Debug)]
pub struct ConsoleLogger {
    config: LoggingConfig,
}

impl ConsoleLogger {
    pub fn new(config: LoggingConfig) -> Self {
        ConsoleLogger { config }
    }

    /// Install as the global logger.
    pub fn init(config: LoggingConfig) -> Result<(), SetLoggerError> {
        let level = config.level.to_level_filter();
        log::set_boxed_logger(Box::new(ConsoleLogger::new(config)))?;
        log::set_max_level(level);
        Ok(())
    }

    fn is_filtered(&self, module: Option<&str>, body: &str) -> bool {
        let skip = module
            .map(|m| self.config.mod_filter.iter().any(|f| m.contains(f.as_str())))
            .unwrap_or(false);
        let body_skip = self
            .config
            .body_filter
            .iter()
            .any(|f| body.contains(f.as_str()));
        skip || body_skip
    }

    /// The line to print for a record, or `None` if it is filtered out.
    pub fn format_line(
        &self,
        level: LogLevel,
        module: Option<&str>,
        body: &str,
        time: DateTime<Utc>,
    ) -> Option<String> {
        if level > self.config.level || self.is_filtered(module, body) {
            return None;
        }
        Some(format!(
            "{time} {level} [{module}] {body}",
            time = time.format(self.config.time_format.as_str()),
            level = level,
            module = module.unwrap_or("-"),
            body = body
        ))
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level
    }

    fn log(&self, record: &Record) {
        let body = format!("{}", record.args());
        if let Some(line) = self.format_line(record.level(), record.module_path(), &body, Utc::now()) {
            eprintln!("{}", line);
        }
    }

    fn flush(&self) {}
}
