use anyhow::Context;
use clap::Parser;
use delivery_pipeline::{Config, ProducerMode, Runner};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "delivery-pipeline")]
#[command(about = "Produces user records to Kafka and tracks every delivery", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(short, long, value_enum, help = "Override producer.mode")]
    mode: Option<ProducerMode>,

    #[arg(short = 'n', long, help = "Override producer.num_of_messages")]
    messages: Option<u64>,

    #[arg(long, help = "Produce to an in-memory transport instead of Kafka")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting delivery-pipeline");
    info!("Loading configuration from {:?}", args.config);

    let mut config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("invalid configuration");
        }
    };

    if let Some(mode) = args.mode {
        config.producer.mode = mode;
    }
    if let Some(messages) = args.messages {
        config.producer.num_of_messages = messages;
    }

    info!(
        kafka_brokers = ?config.kafka.brokers,
        security_protocol = config.kafka.security_protocol.as_str(),
        linger_ms = config.kafka.linger_ms,
        batch_num_messages = config.kafka.batch_num_messages,
        topic = %config.producer.topic,
        mode = ?config.producer.mode,
        format = ?config.producer.format,
        schema_id = ?config.schema_id(),
        "Configuration summary"
    );

    let runner = Runner::new(config);
    let summary = if args.dry_run {
        runner.dry_run().await
    } else {
        runner.run().await
    }
    .context("failed to start producer")?;

    info!(
        submitted = summary.submitted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        rejected = summary.rejected,
        unresolved = summary.unresolved,
        "Total execution time: {:?}",
        summary.elapsed
    );

    if summary.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            unresolved = summary.unresolved,
            "Shutting down with undelivered messages"
        );
        Ok(ExitCode::FAILURE)
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("delivery_pipeline=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("delivery_pipeline=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
