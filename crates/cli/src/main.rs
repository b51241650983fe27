mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use runtime::providers::AnyBackend;
use runtime::{Conversation, Error as RuntimeError, Message, Orchestrator, SessionPool, connect_all};
use tracing::warn;

use config::{
    API_KEY_VAR, Config, DEFAULT_CONFIG_FILE, DEFAULT_SERVERS_FILE, MODEL_VAR, load_servers,
};
use error::{Error, Result};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Chat with a language model that can call MCP tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Application config (TOML)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// MCP server list (JSON)
    #[arg(short, long, default_value = DEFAULT_SERVERS_FILE)]
    servers: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat,
    /// Connect to every server and list the tools they expose
    Tools,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Chat) | None => cmd_chat(&cli.config, &cli.servers).await,
        Some(Commands::Tools) => cmd_tools(&cli.servers).await,
    }
}

async fn cmd_chat(config_path: &Path, servers_path: &Path) -> Result<()> {
    println!("switchboard v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_or_default(config_path)?;
    let settings = config.orchestrator.settings()?;
    let backend = config.backend(
        std::env::var(API_KEY_VAR).ok(),
        std::env::var(MODEL_VAR).ok(),
    )?;
    let servers = load_servers(servers_path)?;

    let pool: Arc<SessionPool<mcp::Server>> = Arc::new(SessionPool::new());
    let registry = connect_all(&pool, servers).await;
    if registry.is_empty() {
        warn!("no tools available, the model will answer without them");
    }

    println!("Backend: {backend}");
    println!("Tools: {}", registry.len());
    println!("Type 'quit' or Ctrl+D to exit, '/history' or '/tools' to inspect.\n");

    let mut orchestrator =
        Orchestrator::new(backend, Arc::clone(&pool), registry).with_settings(settings);
    let outcome = chat_loop(&mut orchestrator).await;

    let teardown = pool.close_all().await;
    outcome?;
    teardown?;
    println!("\nSession ended.");
    Ok(())
}

async fn chat_loop(orchestrator: &mut Orchestrator<AnyBackend, mcp::Server>) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit") {
            break;
        }
        match input {
            "/history" => {
                print_history(orchestrator.conversation());
                continue;
            }
            "/tools" => {
                print_tools(orchestrator.registry());
                continue;
            }
            _ => {}
        }

        match orchestrator.ask(input).await {
            Ok(answer) => println!("\n{answer}\n"),
            Err(e) => {
                if let RuntimeError::LoopBudgetExceeded { .. } = e {
                    warn!("the model kept requesting tools; try rephrasing");
                }
                eprintln!("Error: {e}\n");
            }
        }
    }
    Ok(())
}

async fn cmd_tools(servers_path: &Path) -> Result<()> {
    let servers = load_servers(servers_path)?;
    let pool = SessionPool::new();
    let registry = connect_all(&pool, servers).await;

    let mut result = Ok(());
    if pool.is_empty().await {
        result = Err(Error::NoServers(servers_path.display().to_string()));
    } else {
        print_tools(&registry);
    }
    pool.close_all().await?;
    result
}

fn print_tools(registry: &runtime::ToolRegistry) {
    if registry.is_empty() {
        println!("No tools available.");
        return;
    }
    for tool in registry.tools() {
        let description = tool.descriptor.description.lines().next().unwrap_or("");
        println!(
            "{:<24}  {:<12}  {description}",
            tool.descriptor.name,
            tool.owner.to_string()
        );
    }
}

fn print_history(conversation: &Conversation) {
    if conversation.is_empty() {
        println!("No messages yet.");
        return;
    }
    for (at, message) in conversation.history() {
        let time = Local.from_utc_datetime(&at.naive_utc()).format("%H:%M:%S");
        match message {
            Message::User { content } => println!("[{time}] USER: {}", truncate(content)),
            Message::Assistant {
                content,
                tool_calls,
            } => {
                if !content.is_empty() {
                    println!("[{time}] ASSISTANT: {}", truncate(content));
                }
                for call in tool_calls {
                    println!(
                        "[{time}] TOOL CALL: {} {}",
                        call.name,
                        serde_json::Value::Object(call.arguments.clone())
                    );
                }
            }
            Message::ToolResult {
                content, is_error, ..
            } => {
                let label = if *is_error { "TOOL ERROR" } else { "TOOL RESULT" };
                println!("[{time}] {label}: {}", truncate(content));
            }
        }
    }
}

// Truncate long messages for display
fn truncate(content: &str) -> String {
    const LIMIT: usize = 200;
    match content.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}
