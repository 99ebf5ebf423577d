use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_client::ChatSession;
use relay_config::RelayConfig;
use relay_conversation::ConversationStore;
use relay_core::MessageRole;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relay-chat")]
#[command(about = "Chat relay proxy and multi-conversation chat client", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $RELAY_HOME/relay.yaml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay proxy
    Serve,

    /// Send one message in the active conversation
    Send {
        /// The message to send
        message: String,
    },

    /// Interactive conversation mode
    Chat,

    /// Start a new conversation and make it active
    New,

    /// List conversations, most recently updated first
    List,

    /// Print a conversation's messages
    Show {
        /// Conversation id (defaults to the active one)
        id: Option<String>,
    },

    /// Make a conversation active
    Select {
        id: String,
    },

    /// Delete a conversation, or all of them
    Clear {
        /// Conversation id (defaults to the active one)
        id: Option<String>,

        #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "id")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config_path = cli.config.unwrap_or_else(RelayConfig::default_config_path);
    let config = RelayConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    match cli.command {
        Commands::Serve => relay_proxy::serve(&config).await?,
        Commands::Send { message } => {
            let session = ChatSession::from_config(&config)?;
            let reply = session.send(&message).await?;
            println!("{}", reply.response);
            print_usage(&session);
        }
        Commands::Chat => interactive_chat(&config).await?,
        Commands::New => {
            let mut store = ConversationStore::from_settings(&config.store);
            let id = store.create_conversation();
            store.save()?;
            println!("{id}");
        }
        Commands::List => list_conversations(&ConversationStore::from_settings(&config.store)),
        Commands::Show { id } => {
            let store = ConversationStore::from_settings(&config.store);
            show_conversation(&store, id.as_deref())?;
        }
        Commands::Select { id } => {
            let mut store = ConversationStore::from_settings(&config.store);
            store.select(&id)?;
            store.save()?;
            info!("Active conversation is now {}", id);
        }
        Commands::Clear { id, all } => {
            let mut store = ConversationStore::from_settings(&config.store);
            if all {
                store.clear_all();
            } else {
                let id = match id {
                    Some(id) => id,
                    None => store
                        .active_id()
                        .map(str::to_string)
                        .context("No active conversation to clear")?,
                };
                store.clear(&id)?;
                store.save()?;
            }
        }
    }

    Ok(())
}

async fn interactive_chat(config: &RelayConfig) -> Result<()> {
    let session = ChatSession::from_config(config)?;

    println!("relay-chat interactive mode");
    println!("Type 'exit' or 'quit' to end, 'new' for a new conversation");
    println!("═══════════════════════════════════════\n");

    loop {
        print!("You> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        if input.eq_ignore_ascii_case("new") {
            let id = session.store().await.create_conversation();
            println!("Started conversation {id}\n");
            continue;
        }

        match session.send(input).await {
            Ok(reply) => println!("\nAssistant> {}\n", reply.response),
            // The user's turn stays on screen; the failure takes the reply's place.
            Err(e) => println!("\n[error] {e}\n"),
        }
    }

    print_usage(&session);
    Ok(())
}

fn list_conversations(store: &ConversationStore) {
    let active = store.active_id();
    for summary in store.conversations() {
        let marker = if active == Some(summary.id.as_str()) { "*" } else { " " };
        println!(
            "{} {}  {:<32} {:>3} messages  {}",
            marker,
            summary.id,
            summary.title,
            summary.message_count,
            summary.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn show_conversation(store: &ConversationStore, id: Option<&str>) -> Result<()> {
    let id = match id.or(store.active_id()) {
        Some(id) => id.to_string(),
        None => {
            println!("No active conversation");
            return Ok(());
        }
    };

    for message in store.messages(&id)? {
        let role = match message.role {
            MessageRole::User => "You",
            MessageRole::Assistant => "Assistant",
            MessageRole::System => "System",
        };
        println!("[{role}]: {}\n", message.content);
    }
    Ok(())
}

fn print_usage(session: &ChatSession) {
    let usage = session.token_usage();
    let metrics = session.metrics_summary();
    if metrics.total_requests == 0 {
        return;
    }

    println!("\nToken Statistics:");
    println!("  Prompt tokens: {}", usage.prompt_tokens);
    println!("  Completion tokens: {}", usage.completion_tokens);
    println!("  Total tokens: {}", usage.total_tokens);
    println!(
        "  Requests: {} ({:.0}% ok, avg {:.0}ms)",
        metrics.total_requests, metrics.success_rate, metrics.average_latency_ms
    );
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
