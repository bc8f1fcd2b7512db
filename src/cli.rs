use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use stockpilot::agent::{
    AgentError, AgentLoop, Tool, ToolError, ToolRegistry, ToolResult, TurnInput,
};
use stockpilot::config::load_config;
use stockpilot::extract::{ExtractionResult, extract_json};
use stockpilot::providers::{ProviderError, ProviderFactory, ProviderKind};
use stockpilot::ratelimit::CallGuard;

/// Exit code used when the user interrupts a turn
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "stockpilot")]
#[command(about = "stockpilot - tool-calling assistant over OpenAI, Anthropic and Gemini")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file (defaults to ~/.stockpilot/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Display version information
    Version,

    /// Run one agent turn against the configured provider
    Ask {
        /// The message to send
        message: String,

        /// Provider to use (openai, anthropic, gemini)
        #[arg(long, value_parser = parse_provider)]
        provider: Option<ProviderKind>,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Print the answer at the end instead of streaming it
        #[arg(long)]
        no_stream: bool,

        /// Session identifier used for persistence and logging
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Recover a JSON value from noisy model output
    Extract {
        /// Input file; stdin when absent
        file: Option<PathBuf>,
    },

    /// Estimate the USD cost of a call
    Cost {
        prompt_tokens: u32,
        completion_tokens: u32,

        #[arg(long, value_parser = parse_provider)]
        provider: Option<ProviderKind>,

        #[arg(long)]
        model: Option<String>,
    },

    /// Show each provider and whether its credential resolves
    Providers,
}

fn parse_provider(value: &str) -> std::result::Result<ProviderKind, String> {
    value.parse().map_err(|e: ProviderError| e.to_string())
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Version => {
            print_version();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ask {
            message,
            provider,
            model,
            no_stream,
            session,
        } => handle_ask(cli.config, message, provider, model, no_stream, session).await,
        Commands::Extract { file } => handle_extract(file),
        Commands::Cost {
            prompt_tokens,
            completion_tokens,
            provider,
            model,
        } => handle_cost(cli.config, prompt_tokens, completion_tokens, provider, model),
        Commands::Providers => handle_providers(cli.config),
    }
}

fn print_version() {
    println!("stockpilot {}", env!("CARGO_PKG_VERSION"));
}

async fn handle_ask(
    config_path: Option<PathBuf>,
    message: String,
    provider: Option<ProviderKind>,
    model: Option<String>,
    no_stream: bool,
    session: String,
) -> Result<ExitCode> {
    let config = load_config(provider, model, config_path).context("Failed to load configuration")?;

    let Some(provider) = ProviderFactory::first_available(&config.provider_candidates()) else {
        bail!(
            "No provider has a credential. Set OPENAI_API_KEY, ANTHROPIC_API_KEY or GEMINI_API_KEY, \
             or add an api_key to the config file."
        );
    };
    tracing::info!(provider = %provider.name(), model = %provider.default_model(), "Using provider");

    let guard = Arc::new(CallGuard::new(config.rate_limit.clone()));
    let agent = AgentLoop::new(provider, Arc::new(watchlist_registry()?))
        .with_config(config.agent.clone())
        .with_call_guard(guard);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("Interrupt received, cancelling turn");
                cancel.cancel();
            }
        })
    };

    let (sink, printer) = if no_stream {
        (None, None)
    } else {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let printer = tokio::spawn(async move {
            let mut stdout = io::stdout();
            while let Some(fragment) = rx.recv().await {
                let _ = write!(stdout, "{}", fragment);
                let _ = stdout.flush();
            }
        });
        (Some(tx), Some(printer))
    };

    let result = agent
        .run_turn(TurnInput::new(session, message), sink, &cancel)
        .await;
    interrupt.abort();
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match result {
        Ok(outcome) => {
            if no_stream {
                println!("{}", outcome.message);
            } else {
                println!();
            }
            if outcome.degraded {
                eprintln!("warning: the answer is incomplete, the provider failed while writing it");
            }
            tracing::info!(
                tool_calls = outcome.tool_calls.len(),
                total_tokens = outcome.usage.total_tokens,
                "Turn finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(AgentError::Cancelled) => {
            eprintln!("Cancelled.");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => Err(e).context("Turn failed"),
    }
}

fn handle_extract(file: Option<PathBuf>) -> Result<ExitCode> {
    let input = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    match extract_json::<Value>(&input) {
        ExtractionResult::Success(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        ExtractionResult::Failure(error) => {
            eprintln!("error: {}", error);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn handle_cost(
    config_path: Option<PathBuf>,
    prompt_tokens: u32,
    completion_tokens: u32,
    provider: Option<ProviderKind>,
    model: Option<String>,
) -> Result<ExitCode> {
    let config = load_config(provider, None, config_path).context("Failed to load configuration")?;
    let kind = config.provider.unwrap_or(ProviderKind::OpenAi);
    let provider = ProviderFactory::create(&config.provider_config(kind))?;

    let model = model.unwrap_or_else(|| provider.default_model().to_string());
    let cost = provider.estimate_cost(prompt_tokens, completion_tokens, Some(&model));
    println!("{} {}: ${:.6}", provider.name(), model, cost);
    Ok(ExitCode::SUCCESS)
}

fn handle_providers(config_path: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(None, None, config_path).context("Failed to load configuration")?;

    for kind in ProviderKind::ALL {
        let provider = ProviderFactory::create(&config.provider_config(kind))?;
        let status = if provider.is_available() {
            "available"
        } else {
            "no credential"
        };
        let selected = if config.provider == Some(kind) { " (selected)" } else { "" };
        println!("{:<10} {:<28} {}{}", kind, provider.default_model(), status, selected);
    }
    Ok(ExitCode::SUCCESS)
}

type Watchlist = Arc<Mutex<BTreeSet<String>>>;

/// In-memory watchlist tools offered to the model by `ask`
fn watchlist_registry() -> Result<ToolRegistry> {
    let watchlist: Watchlist = Arc::default();
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(AddSymbolTool {
        watchlist: watchlist.clone(),
    }))?;
    registry.register(Box::new(ListSymbolsTool { watchlist }))?;
    Ok(registry)
}

struct AddSymbolTool {
    watchlist: Watchlist,
}

#[async_trait::async_trait]
impl Tool for AddSymbolTool {
    fn name(&self) -> &str {
        "add_symbol"
    }

    fn description(&self) -> &str {
        "Add a ticker symbol to the user's watchlist"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string", "description": "Ticker symbol, e.g. AAPL" }
            },
            "required": ["symbol"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> std::result::Result<ToolResult, ToolError> {
        let symbol = args
            .get("symbol")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.'))
            .ok_or_else(|| ToolError::invalid_arguments("add_symbol", "'symbol' must be a ticker symbol"))?;

        let mut watchlist = self.watchlist.lock().unwrap_or_else(|e| e.into_inner());
        let added = watchlist.insert(symbol.clone());
        Ok(ToolResult::ok(json!({ "symbol": symbol, "added": added, "size": watchlist.len() }))
            .with_display(format!("{} on watchlist", symbol)))
    }
}

struct ListSymbolsTool {
    watchlist: Watchlist,
}

#[async_trait::async_trait]
impl Tool for ListSymbolsTool {
    fn name(&self) -> &str {
        "list_symbols"
    }

    fn description(&self) -> &str {
        "List the ticker symbols on the user's watchlist"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: &Map<String, Value>) -> std::result::Result<ToolResult, ToolError> {
        let symbols: Vec<String> = self
            .watchlist
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        let display = if symbols.is_empty() {
            "watchlist is empty".to_string()
        } else {
            symbols.join(", ")
        };
        Ok(ToolResult::ok(json!({ "symbols": symbols })).with_display(display))
    }
}
