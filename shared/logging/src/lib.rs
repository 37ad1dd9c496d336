use std::{fs::OpenOptions, path::PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Default directive; `RUST_LOG` takes precedence.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Also append plain-text logs to this file.
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Installs the global subscriber. Fails if one is already set.
    pub fn init(self) -> anyhow::Result<()> {
        // logs go to stderr so stdout only carries the results
        let output_layer = match self.output {
            LogOutput::Console => fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter(self.level)?)
                .boxed(),
            LogOutput::Json => fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(filter(self.level)?)
                .boxed(),
        };

        let file_layer = match self.write_logs_file {
            Some(path) => {
                let log_file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(log_file)
                        .with_filter(filter(self.level)?),
                )
            }
            None => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(output_layer)
            .with(file_layer);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

/// `RUST_LOG` if set, otherwise `level`, with HTTP client internals kept quiet.
pub fn filter(level: Level) -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tokio=off".parse()?))
}

pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}
