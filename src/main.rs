use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier::channel::process::ProcessChannelFactory;
use courier::config::{
    Config, KEY_READY_TIMEOUT, KEY_REQUEST_TIMEOUT, KNOWN_KEYS, Settings, parse_timeout,
    split_command, timeout_from_secs,
};
use courier::consts::default_db_path;
use courier::dispatch::Dispatcher;
use courier::engine::process::ProcessEngineProvider;
use courier::engine::{DestroyEngineOptions, EngineAdapter, EngineOptions, InferenceRequest};
use courier::session::{DestroyOptions, LanguagePair, SessionRegistry, TranslationInput};

#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "Brokers translation sessions and ML engines over message channels."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args)]
struct GlobalArgs {
    /// SQLite database for settings (use :memory: for ephemeral)
    #[arg(short, long, global = true)]
    db: Option<String>,

    /// Translator command, overriding the stored translator.command
    #[arg(long, global = true)]
    translator: Option<String>,

    /// Engine command, overriding the stored engine.command
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Seconds to wait for an engine to become ready (0 waits forever)
    #[arg(long, global = true)]
    ready_timeout: Option<u64>,

    /// Seconds to wait for a single request (0 waits forever)
    #[arg(long, global = true)]
    request_timeout: Option<u64>,

    /// Log more (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Translate TEXT, or every line typed at the prompt when TEXT is omitted
    Translate {
        #[arg(short, long)]
        source_language: String,

        #[arg(short, long)]
        target_language: String,

        /// The input is HTML markup
        #[arg(long, default_value_t = false)]
        html: bool,

        text: Option<String>,
    },
    /// Create an ML engine, run it once, and print the result as JSON
    Infer {
        #[arg(long)]
        task_name: String,

        #[arg(long)]
        model_id: String,

        #[arg(long)]
        model_revision: Option<String>,

        /// Extra engine option as key=value (value parsed as JSON when possible)
        #[arg(long = "option", value_parser = parse_key_value)]
        options: Vec<(String, String)>,

        /// Positional inference arguments
        args: Vec<String>,
    },
    /// Read JSON commands from stdin, one per line, and reply on stdout
    Serve,
    /// Manage stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    Unset { key: String },
    List,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let config = open_config(cli.global.db.as_deref())?;

    match cli.command {
        Command::Config { action } => handle_config(&config, action),
        Command::Translate {
            source_language,
            target_language,
            html,
            text,
        } => {
            let settings = load_settings(&config, &cli.global)?;
            let pair = LanguagePair::new(&source_language, &target_language);
            handle_translate(&settings, pair, html, text).await
        }
        Command::Infer {
            task_name,
            model_id,
            model_revision,
            options,
            args,
        } => {
            let mut engine_options = EngineOptions::new(&task_name);
            engine_options.model_id = Some(model_id);
            engine_options.model_revision = model_revision;
            for (key, value) in options {
                let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
                engine_options.extra.insert(key, value);
            }
            let settings = load_settings(&config, &cli.global)?;
            handle_infer(&settings, engine_options, args).await
        }
        Command::Serve => handle_serve(&load_settings(&config, &cli.global)?).await,
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_config(db: Option<&str>) -> Result<Config> {
    let path = match db {
        Some(path) => path.to_string(),
        None => {
            let path = default_db_path();
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            path.to_string_lossy().into_owned()
        }
    };
    Config::open(&path).with_context(|| format!("failed to open settings at {path}"))
}

/// Stored settings, with command-line flags taking precedence.
fn load_settings(config: &Config, global: &GlobalArgs) -> Result<Settings> {
    let mut settings = Settings::load(config)?;
    if let Some(command) = &global.translator {
        settings.translator_command = split_command(command);
    }
    if let Some(command) = &global.engine {
        settings.engine_command = split_command(command);
    }
    if let Some(secs) = global.ready_timeout {
        settings.ready_timeout = timeout_from_secs(secs);
    }
    if let Some(secs) = global.request_timeout {
        settings.request_timeout = timeout_from_secs(secs);
    }
    Ok(settings)
}

fn session_registry(settings: &Settings) -> SessionRegistry {
    SessionRegistry::new(
        Arc::new(ProcessChannelFactory::new(settings.translator_command.clone())),
        settings.session_options(),
    )
}

fn engine_adapter(settings: &Settings) -> EngineAdapter {
    EngineAdapter::new(Arc::new(ProcessEngineProvider::new(
        settings.engine_command.clone(),
    )))
}

fn handle_config(config: &Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => match config.get(&key)? {
            Some(value) => println!("{value}"),
            None => bail!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                eprintln!("warning: {key} is not a setting courier reads");
            }
            if key == KEY_READY_TIMEOUT || key == KEY_REQUEST_TIMEOUT {
                parse_timeout(&key, &value)?;
            }
            config.set(&key, &value)?;
            println!("✓ {key} = {value}");
        }
        ConfigAction::Unset { key } => {
            config.remove(&key)?;
            println!("✓ {key} unset");
        }
        ConfigAction::List => {
            for (key, value) in config.list()? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

async fn handle_translate(
    settings: &Settings,
    pair: LanguagePair,
    is_html: bool,
    text: Option<String>,
) -> Result<()> {
    let registry = session_registry(settings);
    let session = registry
        .create_session(pair)
        .await
        .context("failed to start a translation session")?;

    let result = match text {
        Some(text) => {
            translate_line(&registry, &session.session_id, &text, is_html)
                .await
                .map(|translated| println!("{translated}"))
        }
        None => translate_repl(&registry, &session.session_id, &session.language_pair, is_html)
            .await,
    };

    registry
        .destroy_session(&session.session_id, DestroyOptions::default())
        .await?;
    result
}

async fn translate_line(
    registry: &SessionRegistry,
    session_id: &str,
    text: &str,
    is_html: bool,
) -> Result<String> {
    let input = TranslationInput {
        is_html,
        ..TranslationInput::text(text)
    };
    let outcome = registry
        .run_request(session_id, input)
        .await
        .context("translation failed")?;
    Ok(outcome.target_text)
}

async fn translate_repl(
    registry: &SessionRegistry,
    session_id: &str,
    pair: &LanguagePair,
    is_html: bool,
) -> Result<()> {
    // Async stdin so Ctrl+C is caught at the prompt too
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("\n{pair}> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            result = lines.next_line() => {
                match result {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        println!();
                        break;
                    }
                    Err(e) => {
                        eprintln!("input error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };

        let text = line.trim();
        if text.is_empty() || text == "quit" || text == "exit" {
            break;
        }

        // Ctrl+C during a translation abandons it, not the prompt
        tokio::select! {
            result = translate_line(registry, session_id, text, is_html) => {
                match result {
                    Ok(translated) => println!("{translated}"),
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n\ninterrupted");
            }
        }
    }
    Ok(())
}

async fn handle_infer(settings: &Settings, options: EngineOptions, args: Vec<String>) -> Result<()> {
    let adapter = engine_adapter(settings);
    let engine = adapter
        .create(options)
        .await
        .context("failed to create engine")?;

    let request = InferenceRequest {
        args: args.into_iter().map(Value::String).collect(),
        options: None,
    };
    let result = adapter.run(&engine.engine_id, request).await;

    if let Err(e) = adapter
        .destroy(&engine.engine_id, DestroyEngineOptions::default())
        .await
    {
        warn!(engine = %engine.engine_id, error = %e, "engine did not terminate cleanly");
    }

    let result = result.context("inference failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn handle_serve(settings: &Settings) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(
        session_registry(settings),
        engine_adapter(settings),
    ));

    let (replies, mut outgoing) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = outgoing.recv().await {
            stdout.write_all(reply.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    info!("serving commands on stdin");

    loop {
        let line = tokio::select! {
            result = lines.next_line() => {
                match result {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "input error");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let dispatcher = Arc::clone(&dispatcher);
        let replies = replies.clone();
        in_flight.spawn(async move {
            let reply = dispatcher.handle_line(&line).await;
            let _ = replies.send(reply);
        });
    }

    let (sessions, engines) = dispatcher.shutdown().await;
    info!(sessions, engines, "destroyed remaining sessions and engines");

    // Requests still waiting were just rejected; let their replies go out.
    while in_flight.join_next().await.is_some() {}
    drop(replies);
    writer.await??;
    Ok(())
}
