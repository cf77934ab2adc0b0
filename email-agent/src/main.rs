use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use email_agent::clients::{LLMClient, create_llm_client};
use email_agent::conversation::{self, ChatEntry};
use email_agent::coordinator::Coordinator;
use email_agent::core::{ReactAgentBuilder, Step};
use email_agent::mcp::{self, McpConnector, SessionConnector, load_mcp_config};
use email_agent::prompts;
use email_agent::tools::{ToolSettings, email_tools};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "email-agent")]
#[command(version)]
#[command(about = "Email assistant backed by MCP tool servers", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    api_key: Option<String>,

    #[arg(short, long, global = true, default_value = "gpt-4o")]
    model: String,

    #[arg(short, long, global = true, default_value = "openai", help = "openai or azure")]
    provider: String,

    #[arg(short, long, global = true, help = "Base URL for the LLM API")]
    base_url: Option<String>,

    #[arg(short, long, global = true, default_value = "mcp_config.json", help = "MCP server configuration")]
    config: PathBuf,

    #[arg(
        long,
        global = true,
        help = "File with a custom agent system prompt [default: config/agent/system_prompt.md if present]"
    )]
    system_prompt: Option<PathBuf>,

    #[arg(long, global = true, default_value = "downloads/sales_orders")]
    orders_dir: PathBuf,

    #[arg(long, global = true, default_value = "config/classification")]
    classification_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a single request through the agent")]
    Run {
        #[arg(short, long, help = "Request text")]
        task: String,

        #[arg(short = 's', long, help = "Maximum steps")]
        max_steps: Option<usize>,
    },

    #[command(about = "Interactive chat")]
    Chat {
        #[arg(short = 's', long, help = "Maximum steps")]
        max_steps: Option<usize>,
    },

    #[command(about = "List the tools exposed by the configured servers")]
    Tools,

    #[command(about = "Check MCP configuration")]
    CheckMcp {
        #[arg(long, help = "Also connect to each server and list its tools")]
        connect: bool,
    },

    #[command(about = "Serve the built-in email tools over stdio")]
    ServeTools,
}

fn get_api_key(explicit: Option<&String>) -> Result<String> {
    if let Some(key) = explicit {
        return Ok(key.clone());
    }
    std::env::var("OPENAI_API_KEY").context(
        "API key not found. Please set OPENAI_API_KEY environment variable or use --api-key flag.",
    )
}

fn build_client(args: &Args) -> Result<Arc<dyn LLMClient>> {
    let api_key = get_api_key(args.api_key.as_ref())?;
    let client = create_llm_client(&args.provider, api_key, args.model.clone(), args.base_url.clone())?;
    Ok(Arc::from(client))
}

async fn read_system_prompt(args: &Args) -> Result<Option<String>> {
    let fallback = Path::new(prompts::DEFAULT_SYSTEM_PROMPT_FILE);
    let path = args.system_prompt.as_deref().unwrap_or(fallback);
    prompts::read_system_prompt(args.system_prompt.as_deref(), fallback)
        .await
        .with_context(|| format!("Failed to read system prompt {}", path.display()))
}

fn print_step(index: usize, step: &Step) {
    eprintln!("{} {}", format!("[{index}]").dimmed(), step.action.cyan());
    if !step.action_input.is_null() {
        eprintln!("    {} {}", "input:".dimmed(), step.action_input);
    }
}

fn print_entries(entries: &[ChatEntry]) {
    for entry in entries {
        match &entry.metadata {
            Some(metadata) => {
                println!("{}", metadata.title.yellow().bold());
                if let Some(log) = &metadata.log {
                    println!("  {}", log.dimmed());
                }
                println!("  {}", entry.content);
            }
            None if entry.content.starts_with("⚠️") => println!("{}", entry.content.red()),
            None => println!("{}", entry.content.green()),
        }
    }
}

async fn start_coordinator(args: &Args, max_steps: Option<usize>, trace_steps: bool) -> Result<Coordinator> {
    let config = load_mcp_config(&args.config).await?;
    let client = build_client(args)?;
    tracing::info!(model = %client.model_info().name, provider = %args.provider, "Using model");
    let mut builder = ReactAgentBuilder::new(client)
        .with_system_prompt(read_system_prompt(args).await?);
    if let Some(max_steps) = max_steps {
        builder = builder.with_max_steps(max_steps);
    }
    if trace_steps {
        builder = builder.with_step_callback(Arc::new(print_step));
    }

    let coordinator = Coordinator::from_config(config, Arc::new(builder));
    coordinator.init().await?;
    Ok(coordinator)
}

async fn chat(coordinator: &Coordinator) -> Result<()> {
    println!("Chat started. Type 'reset' to start over, 'exit' or 'quit' to end.");
    println!();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut history: Vec<ChatEntry> = Vec::new();
    let mut state = None;

    loop {
        print!("{} ", ">".bold());
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();

        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        if input.eq_ignore_ascii_case("reset") {
            history.clear();
            state = None;
            println!("{}", "Conversation reset.".dimmed());
            continue;
        }

        let turn = conversation::respond(coordinator, input, &history, state.take()).await;
        print_entries(&turn.entries);
        println!();

        history.push(ChatEntry::user(input));
        history.extend(turn.entries);
        state = Some(turn.state);
    }

    println!("Goodbye!");
    Ok(())
}

async fn check_mcp(args: &Args, connect: bool) -> Result<()> {
    println!("Checking MCP configuration at: {}", args.config.display());

    let config = match load_mcp_config(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            println!("{} {e}", "Failed to load MCP configuration:".red());
            return Ok(());
        }
    };
    println!("Number of configured servers: {}", config.servers.len());
    for (name, server) in &config.servers {
        println!("  - {}: {:?} {}", name.bold(), server.transport, server.endpoint());
    }
    if !connect {
        return Ok(());
    }

    let names = config.server_names();
    let connector = McpConnector::new(config);
    for name in names {
        match connector.open(&name).await {
            Ok(session) => {
                match mcp::load_catalog(session.as_ref()).await {
                    Ok(tools) => println!("{} {name}: {} tools", "ok".green(), tools.len()),
                    Err(e) => println!("{} {name}: {e}", "failed".red()),
                }
                if let Err(e) = session.close().await {
                    println!("{} {name}: close failed: {e}", "warn".yellow());
                }
            }
            Err(e) => println!("{} {name}: {e}", "failed".red()),
        }
    }
    Ok(())
}

async fn serve_tools(args: &Args) -> Result<()> {
    // Classification needs a model; the other tools work without one.
    let llm = match build_client(args) {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, "No model configured, classify_message will fail");
            None
        }
    };
    let tools = email_tools(ToolSettings {
        orders_dir: args.orders_dir.clone(),
        classification_dir: args.classification_dir.clone(),
        llm,
    })
    .await?;
    mcp::server::serve_stdio(&tools).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Commands::Run { task, max_steps } => {
            let coordinator = start_coordinator(&args, *max_steps, true).await?;
            let result = conversation::respond(&coordinator, task, &[], None).await;
            print_entries(&result.entries);
            coordinator.shutdown().await;
        }

        Commands::Chat { max_steps } => {
            let coordinator = start_coordinator(&args, *max_steps, false).await?;
            let result = chat(&coordinator).await;
            coordinator.shutdown().await;
            result?;
        }

        Commands::Tools => {
            let coordinator = start_coordinator(&args, None, false).await?;
            let catalog = coordinator.catalog().await;
            if catalog.is_empty() {
                println!("No tools available.");
            } else {
                println!("{}", "Available Tools".bold());
                for tool in &catalog {
                    println!("  {} {}", tool.name.cyan(), format!("({})", tool.server).dimmed());
                    if !tool.description.is_empty() {
                        println!("      {}", tool.description);
                    }
                }
            }
            coordinator.shutdown().await;
        }

        Commands::CheckMcp { connect } => check_mcp(&args, *connect).await?,

        Commands::ServeTools => serve_tools(&args).await?,
    }

    Ok(())
}
