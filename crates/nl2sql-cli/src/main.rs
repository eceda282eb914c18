//! Terminal front end: ask questions, browse and manage conversations.

mod render;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser, Subcommand};
use nl2sql_client::prelude::*;
use nl2sql_client::{Clock as _, ConversationStatus, SystemClock, init_observability};
use tracing::debug;

use crate::render::{ProgressPrinter, message_block, step_line};

#[derive(Parser)]
#[command(name = "nl2sql")]
#[command(about = "Ask questions of your data in plain language", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: Connection,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Connection {
    /// Service base URL, for example http://localhost:8000
    #[arg(long, env = "NL2SQL_BASE_URL", global = true)]
    base_url: Option<String>,
    /// Bearer token for the service
    #[arg(long, env = "NL2SQL_ACCESS_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,
    #[arg(long, env = "NL2SQL_API_PREFIX", default_value = "/api/v1", global = true)]
    api_prefix: String,
    #[arg(long, env = "NL2SQL_TIMEOUT_SECS", default_value_t = 120, global = true)]
    timeout_secs: u64,
    #[arg(long, env = "NL2SQL_PAGE_SIZE", default_value_t = 50, global = true)]
    page_size: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question, in a new conversation unless one is given
    Ask {
        text: String,
        #[arg(long, short)]
        conversation: Option<i64>,
        /// Stop at a clarifying question instead of prompting for an answer
        #[arg(long)]
        no_follow_up: bool,
    },
    /// List recent conversations
    List,
    /// Print a conversation's transcript
    Show { id: i64 },
    /// Create an empty conversation
    New,
    /// Delete a conversation
    Delete { id: i64 },
}

impl Connection {
    fn client(self) -> Result<ChatClient> {
        let base_url = self
            .base_url
            .filter(|url| !url.trim().is_empty())
            .context("missing --base-url (or NL2SQL_BASE_URL)")?;
        let mut config = ClientConfig::new(base_url)
            .api_prefix(self.api_prefix)
            .timeout(Duration::from_secs(self.timeout_secs))
            .page_size(self.page_size);
        if let Some(token) = self.token.filter(|t| !t.trim().is_empty()) {
            config = config.access_token(token);
        }
        let page_size = config.page_size;
        let backend = HttpChatBackend::new(config)?;
        Ok(ChatClient::new(Arc::new(backend)).page_size(page_size))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_observability();

    let cli = Cli::parse();
    let mut client = cli.connection.client()?;

    match cli.command {
        Commands::Ask {
            text,
            conversation,
            no_follow_up,
        } => ask(&mut client, text, conversation.map(ConversationId), !no_follow_up).await?,
        Commands::List => list(&mut client).await?,
        Commands::Show { id } => show(&mut client, ConversationId(id)).await?,
        Commands::New => {
            let id = client.create_conversation().await?;
            println!("{id}");
        }
        Commands::Delete { id } => {
            client.delete_conversation(ConversationId(id)).await?;
            println!("deleted {id}");
        }
    }

    Ok(())
}

async fn ask(
    client: &mut ChatClient,
    mut text: String,
    conversation: Option<ConversationId>,
    interactive: bool,
) -> Result<()> {
    match conversation {
        Some(id) => client.select_conversation(id).await?,
        None => {
            let id = client.create_conversation().await?;
            eprintln!("conversation {id}");
        }
    }

    let mut progress = ProgressPrinter::default();
    loop {
        let outcome = run_turn(client, &text, &mut progress).await?;
        if let Some(reply) = client
            .state()
            .transcript()
            .last()
            .filter(|m| m.role == Role::Assistant)
        {
            println!("{}", message_block(reply));
        }
        match outcome {
            TurnOutcome::Answered => return Ok(()),
            TurnOutcome::Ended => {
                eprintln!("the pipeline finished without an answer");
                return Ok(());
            }
            TurnOutcome::Clarification(_) if interactive => {
                let Some(answer) = prompt_line("> ").await? else {
                    return Ok(());
                };
                text = answer;
            }
            TurnOutcome::Clarification(_) => return Ok(()),
            TurnOutcome::Failed(detail) => {
                bail!("{}", detail.as_deref().unwrap_or("turn failed"))
            }
            TurnOutcome::Abandoned => bail!("turn abandoned"),
        }
    }
}

/// Sends one message, printing stage progress to stderr as snapshots arrive.
async fn run_turn(
    client: &mut ChatClient,
    text: &str,
    progress: &mut ProgressPrinter,
) -> Result<TurnOutcome> {
    let clock = SystemClock;
    let mut rx = client.subscribe();
    let outcome = {
        let send = client.send_message(text);
        tokio::pin!(send);
        loop {
            tokio::select! {
                outcome = &mut send => break outcome,
                Ok(()) = rx.changed() => {
                    let lines = progress.update(rx.borrow_and_update().steps(), clock.now_ms());
                    for line in lines {
                        eprintln!("{line}");
                    }
                }
            }
        }
    };
    for line in progress.update(client.state().steps(), clock.now_ms()) {
        eprintln!("{line}");
    }
    Ok(outcome?)
}

async fn prompt_line(prompt: &str) -> Result<Option<String>> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let read = std::io::stdin().read_line(&mut line)?;
        Ok::<_, std::io::Error>((read > 0).then_some(line))
    })
    .await
    .context("stdin reader stopped")??;
    Ok(line
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty()))
}

fn status_label(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Active => "active",
        ConversationStatus::WaitingFollowUp => "waiting_follow_up",
        ConversationStatus::Completed => "completed",
        ConversationStatus::Failed => "failed",
    }
}

async fn list(client: &mut ChatClient) -> Result<()> {
    client.load_conversations().await?;
    debug!(count = client.conversations().len(), "listing conversations");
    if client.conversations().is_empty() {
        println!("no conversations");
    }
    for conversation in client.conversations() {
        println!(
            "{:>6}  {:<17}  {}  {}",
            conversation.id,
            status_label(conversation.status),
            conversation.updated_at.format("%Y-%m-%d %H:%M"),
            conversation.title
        );
    }
    Ok(())
}

async fn show(client: &mut ChatClient, id: ConversationId) -> Result<()> {
    client.select_conversation(id).await?;
    let state = client.state();
    let now = SystemClock.now_ms();
    for step in state.steps() {
        println!("{}", step_line(step, now));
    }
    for message in state.transcript() {
        println!("{}\n", message_block(message));
    }
    if let Some(question) = state.pending_clarification() {
        println!("waiting for an answer to: {question}");
    }
    if let Some(error) = state.last_error() {
        println!("last error: {error}");
    }
    Ok(())
}
