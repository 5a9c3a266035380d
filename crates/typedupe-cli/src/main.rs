//! typedupe CLI - typing and deduplication of raw warehouse tables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use typedupe::{
    default_migrations, Config, DestinationHandler, DialectImpl, PostgresDestinationHandler,
    SqlGenerator, SqliteDestinationHandler, StreamSyncSummary, TypeDedupeError,
    TyperDeduperImpl, TypingDedupingState,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "typedupe")]
#[command(about = "Typing and deduplication of raw warehouse tables")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and resolve the catalog
    Validate,

    /// Print the SQL that types one stream, without connecting
    Generate {
        /// Stream as namespace.name, or name for the default namespace
        #[arg(long)]
        stream: String,

        /// Null out unparseable values instead of failing
        #[arg(long)]
        safe_casting: bool,
    },

    /// Migrate raw tables, then type, deduplicate and commit every stream
    Run {
        /// Override number of concurrent typing passes
        #[arg(long)]
        threads: Option<usize>,

        /// Only run raw table migrations
        #[arg(long)]
        disable_type_dedupe: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), TypeDedupeError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    match cli.command {
        Commands::Validate => {
            let config = Config::load(&cli.config)?;
            let catalog = config.catalog()?;
            if cli.output_json {
                let streams: Vec<_> = catalog
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "stream": s.id.to_string(),
                            "final_table": format!("{}.{}", s.id.final_namespace, s.id.final_name),
                            "raw_table": format!("{}.{}", s.id.raw_namespace, s.id.raw_name),
                            "sync_mode": s.sync_mode,
                            "columns": s.columns.len(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&streams)?);
            } else {
                println!("Configuration is valid ({} streams)", catalog.len());
                for stream in catalog.iter() {
                    println!(
                        "  {} -> {}.{} ({} columns)",
                        stream.id,
                        stream.id.final_namespace,
                        stream.id.final_name,
                        stream.columns.len()
                    );
                }
            }
        }

        Commands::Generate {
            stream,
            safe_casting,
        } => {
            let config = Config::load(&cli.config)?;
            let catalog = config.catalog()?;
            let (namespace, name) = match stream.split_once('.') {
                Some((ns, name)) => (Some(ns), name),
                None => (None, stream.as_str()),
            };
            let stream = catalog.get(namespace, name)?;
            let generator = SqlGenerator::new(config.dialect()?);

            let sql = generator.update_table(stream, "", None, safe_casting)?;
            for statement in sql.statements() {
                println!("{};\n", statement);
            }
        }

        Commands::Run {
            threads,
            disable_type_dedupe,
        } => {
            let mut config = Config::load(&cli.config)?;
            if let Some(t) = threads {
                config.typing.threads = Some(t);
            }
            if disable_type_dedupe {
                config.typing.disable_type_dedupe = true;
            }
            let config = config.with_auto_tuning();
            info!("Loaded configuration from {:?}", cli.config);

            let cancel_token = setup_signal_handler();
            let catalog = config.catalog()?;
            let stream_names: Vec<String> = catalog.iter().map(|s| s.id.to_string()).collect();
            let destination = open_destination(&config).await?;

            let mut typer = TyperDeduperImpl::<TypingDedupingState>::new(
                destination,
                catalog,
                default_migrations(),
                config.typing.get_threads(),
                config.typing.disable_type_dedupe,
                cancel_token,
            );

            // Row counts are unknown here, so no stream is skipped.
            let summaries: HashMap<_, StreamSyncSummary> = HashMap::new();
            typer.run(&summaries).await?;

            if cli.output_json {
                let result = serde_json::json!({
                    "status": "completed",
                    "streams": stream_names,
                    "type_dedupe": !config.typing.disable_type_dedupe,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\nTyping and deduplication completed!");
                println!("  Streams: {}", stream_names.len());
                for name in &stream_names {
                    println!("    {}", name);
                }
            }
        }
    }

    Ok(())
}

async fn open_destination(
    config: &Config,
) -> Result<Arc<dyn DestinationHandler<TypingDedupingState>>, TypeDedupeError> {
    match config.dialect()? {
        DialectImpl::Sqlite(_) => {
            let handler = match config.destination.path.as_deref() {
                Some(path) if path.as_os_str() != ":memory:" => {
                    SqliteDestinationHandler::open(path)?
                }
                _ => SqliteDestinationHandler::open_in_memory()?,
            };
            Ok(Arc::new(handler))
        }
        DialectImpl::Postgres(_) => {
            let handler = PostgresDestinationHandler::connect(
                &config.destination,
                &config.typing.raw_namespace,
                config.typing.get_max_connections(),
            )
            .await?;
            Ok(Arc::new(handler))
        }
        DialectImpl::Mysql(_) => Err(TypeDedupeError::unsupported(
            "mysql",
            "destination connections (SQL generation only)",
        )),
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so generated SQL and JSON output stay clean.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, label) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = signal(kind) else {
                eprintln!("Could not install {} handler", label);
                return;
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Stopping after in-flight typing passes...", label);
            token.cancel();
        });
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after in-flight typing passes...");
            token.cancel();
        }
    });

    cancel_token
}
