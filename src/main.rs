use clap::{Parser, ValueEnum};
use log::{error, info};
use scylla_apm_sync::{
    propagation::B3_PARAMETER, Config, ConsoleLogger, DatadogTracer, JsonLinesSource,
    LoaderConfig, LoggingConfig, Mode, TimeSource, TraceLoader,
};
use std::{path::PathBuf, process::ExitCode};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CliMode {
    /// One span per Scylla span, nested under the session span
    Hierarchical,
    /// A single span per session carrying every event
    Flat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CliTimeSource {
    /// Time embedded in the event's timeuuid
    EventId,
    /// Session start plus source_elapsed
    Elapsed,
}

/// Replay Scylla `system_traces` sessions into a Datadog agent.
#[derive(Parser, Debug)]
#[command(name = "scylla-apm-sync", version)]
struct Args {
    /// `SELECT JSON * FROM system_traces.sessions` output, one row per line
    #[arg(long)]
    sessions: PathBuf,

    /// `SELECT JSON * FROM system_traces.events` output, one row per line
    #[arg(long)]
    events: PathBuf,

    #[arg(long, env = "DD_SERVICE", default_value = "scylla")]
    service: String,

    #[arg(long, env = "DD_ENV")]
    env: Option<String>,

    #[arg(long, env = "DD_AGENT_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "DD_TRACE_AGENT_PORT", default_value = "8126")]
    port: String,

    #[arg(long, value_enum, default_value_t = CliMode::Hierarchical)]
    mode: CliMode,

    #[arg(long, value_enum, default_value_t = CliTimeSource::EventId)]
    time_source: CliTimeSource,

    /// Session parameter holding a B3 single-header trace context
    #[arg(long, default_value = B3_PARAMETER)]
    propagation_key: String,

    #[arg(long, default_value = "info")]
    log_level: log::Level,

    /// Drop log lines from modules containing this text (repeatable)
    #[arg(long)]
    mod_filter: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let logging = LoggingConfig {
        level: args.log_level,
        mod_filter: args.mod_filter.clone(),
        ..LoggingConfig::default()
    };
    if let Err(e) = ConsoleLogger::init(logging) {
        eprintln!("couldn't install logger: {}", e);
    }

    let source = match JsonLinesSource::open(&args.sessions, &args.events) {
        Ok(source) => source,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let tracer = DatadogTracer::new(Config {
        service: args.service,
        env: args.env,
        host: args.host,
        port: args.port,
    });
    let config = LoaderConfig {
        mode: match args.mode {
            CliMode::Hierarchical => Mode::Hierarchical,
            CliMode::Flat => Mode::Flat,
        },
        time_source: match args.time_source {
            CliTimeSource::EventId => TimeSource::EventId,
            CliTimeSource::Elapsed => TimeSource::Elapsed,
        },
        propagation_key: args.propagation_key,
    };

    let loader = TraceLoader::new(source, tracer, config);
    let result = loader.run();
    loader.into_tracer().close();

    match result {
        Ok(summary) => {
            info!(
                "Done: {} session(s) sent, {} skipped",
                summary.completed.len(),
                summary.failed.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
