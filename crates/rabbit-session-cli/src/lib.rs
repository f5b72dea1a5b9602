//! # Rabbit Session CLI
//!
//! Command-line tools for exercising a broker through a rabbit-session:
//! - `send` / `receive`: point-to-point through a named queue
//! - `publish` / `subscribe`: through an exchange, optionally filtered by topic
//!
//! Every command reconnects transparently when the broker goes away; `--url`
//! may be repeated to give a failover list.

use clap::{CommandFactory, Parser, Subcommand};
use rabbit_session::{
    AmqpBroker, ConfigurationError, ConsumeOptions, ExchangeKind, ExchangeOptions, Message,
    OperationError, QueueOptions, Session, SessionConfig, SessionError, Subscription, TopicFilters,
};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Body sent by `send` and `publish` when no message is given.
pub const DEFAULT_MESSAGE: &str = "Hello World!";

// ============================================================================
// CLI Structure
// ============================================================================

/// Send and receive messages through an AMQP broker
#[derive(Parser, Debug)]
#[command(name = "rabbit-session")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send and receive messages through an AMQP broker")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RABBIT_SESSION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Broker URL; repeat for a failover list. Overrides configured endpoints.
    #[arg(
        short = 'u',
        long = "url",
        env = "RABBIT_SESSION_URL",
        value_delimiter = ','
    )]
    pub urls: Vec<String>,

    /// Logging level
    #[arg(short, long, env = "LOG_LEVEL", value_enum, default_value = "error")]
    pub log_level: LogLevel,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Send a message to a queue
    Send {
        /// Queue to send to
        #[arg(short, long, default_value = "hello")]
        queue: String,

        /// Message words; joined with spaces
        message: Vec<String>,
    },

    /// Print every message arriving on a queue
    Receive {
        /// Queue to receive from
        #[arg(short, long, default_value = "hello")]
        queue: String,

        /// Acknowledge each message after printing it
        #[arg(long)]
        ack: bool,

        /// Maximum unacknowledged messages in flight
        #[arg(short, long)]
        prefetch: Option<u16>,
    },

    /// Publish a message to an exchange
    Publish {
        /// Exchange to publish to
        #[arg(short, long, default_value = "logs")]
        exchange: String,

        /// Exchange type
        #[arg(short, long, value_enum, default_value = "fanout")]
        kind: KindArg,

        /// Routing key
        #[arg(short, long, default_value = "")]
        topic: String,

        /// Message words; joined with spaces
        message: Vec<String>,
    },

    /// Print every message routed to a queue bound to an exchange
    Subscribe {
        /// Exchange to bind to
        #[arg(short, long, default_value = "logs")]
        exchange: String,

        /// Exchange type
        #[arg(short, long, value_enum, default_value = "fanout")]
        kind: KindArg,

        /// Queue name; omit for a server-named exclusive queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Binding pattern; repeat to bind several
        #[arg(short, long = "topic")]
        topics: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Logging levels accepted by `--log-level`
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            Self::None => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Exchange types selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum KindArg {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<KindArg> for ExchangeKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Direct => ExchangeKind::Direct,
            KindArg::Fanout => ExchangeKind::Fanout,
            KindArg::Topic => ExchangeKind::Topic,
            KindArg::Headers => ExchangeKind::Headers,
        }
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Session(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(cli.log_level, cli.json_logs)?;

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "rabbit-session", &mut std::io::stdout());
        return Ok(());
    }

    let config = resolve_config(cli.config.as_ref(), &cli.urls)?;
    info!(endpoints = ?config.endpoints, "opening session");
    let session = Session::from_config(Arc::new(AmqpBroker::new()), &config)?;

    let mut stdout = std::io::stdout();
    let result = execute(&session, cli.command, &mut stdout, shutdown_signal()).await;
    session.close().await?;
    result
}

/// Install the global tracing subscriber. Logs go to stderr.
pub fn initialize_logging(level: LogLevel, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_new(level.directive()).map_err(|err| CliError::CommandFailed {
        message: format!("invalid log filter: {}", err),
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|err| CliError::CommandFailed {
        message: format!("failed to initialize logging: {}", err),
    })
}

/// Load configuration and apply command-line endpoint overrides.
pub fn resolve_config(
    path: Option<&PathBuf>,
    urls: &[String],
) -> Result<SessionConfig, ConfigurationError> {
    let mut config = SessionConfig::load(path.map(PathBuf::as_path))?;
    if !urls.is_empty() {
        config.endpoints = urls.to_vec();
        config.validate()?;
    }
    Ok(config)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until the stream ends.
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Run one command against a session, writing its output to `out`.
///
/// Receiving commands run until `shutdown` completes or the subscription ends.
pub async fn execute<W, F>(
    session: &Session,
    command: Commands,
    out: &mut W,
    shutdown: F,
) -> Result<(), CliError>
where
    W: Write + Send,
    F: Future<Output = ()> + Send,
{
    match command {
        Commands::Send { queue, message } => {
            let body = message_body(&message);
            session.queue(queue).publish(body.as_str()).await?;
            writeln!(out, " [x] Sent '{}'", body)?;
            Ok(())
        }
        Commands::Receive {
            queue,
            ack,
            prefetch,
        } => {
            let mut options = if ack {
                ConsumeOptions::manual_ack()
            } else {
                ConsumeOptions::default()
            };
            if let Some(prefetch) = prefetch {
                options = options.with_prefetch(prefetch);
            }

            writeln!(
                out,
                " [*] Waiting for messages in {}. To exit press CTRL+C",
                queue
            )?;
            let subscription = session
                .queue(queue)
                .subscribe(options, TopicFilters::none());
            print_messages(&subscription, ack, out, shutdown).await
        }
        Commands::Publish {
            exchange,
            kind,
            topic,
            message,
        } => {
            let body = message_body(&message);
            session
                .exchange(exchange, kind.into(), ExchangeOptions::default())
                .publish_with(body.as_str(), topic.as_str())
                .await?;
            if topic.is_empty() {
                writeln!(out, " [x] Sent '{}'", body)?;
            } else {
                writeln!(out, " [x] Sent '{}':'{}'", topic, body)?;
            }
            Ok(())
        }
        Commands::Subscribe {
            exchange,
            kind,
            queue,
            topics,
        } => {
            let queue = queue.unwrap_or_default();
            let options = QueueOptions::for_name(&queue);
            let subscription = session
                .exchange(exchange, kind.into(), ExchangeOptions::default())
                .queue_with(queue, options)
                .subscribe(ConsumeOptions::default(), TopicFilters::from(topics));

            writeln!(out, " [*] Waiting for messages. To exit press CTRL+C")?;
            print_messages(&subscription, false, out, shutdown).await
        }
        Commands::Completions { .. } => Err(CliError::CommandFailed {
            message: "completions are generated before a session is opened".to_string(),
        }),
    }
}

fn message_body(words: &[String]) -> String {
    if words.is_empty() {
        DEFAULT_MESSAGE.to_string()
    } else {
        words.join(" ")
    }
}

async fn print_messages<W, F>(
    subscription: &Subscription,
    ack: bool,
    out: &mut W,
    shutdown: F,
) -> Result<(), CliError>
where
    W: Write + Send,
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        let item = tokio::select! {
            _ = &mut shutdown => break,
            item = subscription.next() => item,
        };

        match item {
            Some(Ok(message)) => {
                writeln!(out, " [x] Received {}", describe(&message))?;
                out.flush()?;
                if ack {
                    acknowledge(&message).await?;
                }
            }
            Some(Err(err)) => return Err(err.into()),
            None => break,
        }
    }

    debug!("stopped receiving");
    subscription.unsubscribe();
    Ok(())
}

/// Acknowledge a printed message. A delivery that went stale across a reconnect
/// is redelivered by the broker, so it is logged and skipped.
pub async fn acknowledge(message: &Message) -> Result<(), CliError> {
    match message.ack().await {
        Err(SessionError::Operation(OperationError::StaleDelivery { delivery_tag })) => {
            warn!(delivery_tag, "delivery went stale before it was acknowledged");
            Ok(())
        }
        result => Ok(result?),
    }
}

fn describe(message: &Message) -> String {
    let body = String::from_utf8_lossy(message.content());
    if message.routing_key().is_empty() || message.exchange().is_empty() {
        format!("'{}'", body)
    } else {
        format!("'{}':'{}'", message.routing_key(), body)
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
