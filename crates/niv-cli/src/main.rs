use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use niv_core::controllers::ChatController;
use niv_core::models::{Conversation, ConversationsStore, ERROR_MARKER, Role};
use niv_core::repositories::{ConversationJsonRepository, ConversationRepository};
use niv_core::services::{SessionGateway, StreamEvent, normalize_site_url};
use niv_core::settings::{
    ClientSettings, SessionSettingsJsonRepository, SessionSettingsRepository,
};

#[derive(Parser)]
#[command(name = "niv")]
#[command(about = "Chat with the Niv assistant from the terminal", long_about = None)]
struct Cli {
    /// Site URL, overriding the stored one for this run
    #[arg(long, global = true)]
    site: Option<String>,

    /// Session token, overriding the stored one for this run
    #[arg(long, global = true)]
    token: Option<String>,

    /// Directory holding session.json and conversations.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair this device using a code shown on the site
    Pair {
        code: String,
        #[arg(long)]
        device_name: Option<String>,
    },
    /// Check that the stored token is still accepted
    Verify,
    /// Send a message, or start an interactive session when none is given
    Chat {
        message: Option<String>,
        /// Continue this conversation instead of the most recent one
        #[arg(long)]
        conversation: Option<String>,
        /// Start a new conversation
        #[arg(long)]
        new: bool,
    },
    /// List conversations, optionally filtered by title
    List { query: Option<String> },
    /// Print a conversation
    Show { id: String },
    Pin { id: String },
    Unpin { id: String },
    Delete { id: String },
    /// Toggle a reaction on a message
    React {
        conversation: String,
        message: String,
        #[arg(default_value = "like")]
        tag: String,
    },
    /// Forget the session token
    Logout {
        /// Also delete local conversation history
        #[arg(long)]
        wipe: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let settings_repo = match &cli.data_dir {
        Some(dir) => SessionSettingsJsonRepository::in_dir(dir),
        None => SessionSettingsJsonRepository::new()?,
    };
    let mut settings = settings_repo
        .load()
        .await
        .context("Failed to load session settings")?;
    debug!(path = %settings_repo.file_path().display(), paired = settings.is_paired(), "Settings loaded");

    if let Some(site) = &cli.site {
        settings.site_url = Some(normalize_site_url(site)?);
    }
    if let Some(token) = &cli.token {
        settings.token = Some(token.clone());
    }

    match cli.command {
        Commands::Pair { code, device_name } => {
            let site = settings
                .site_url
                .clone()
                .context("No site given: pass --site")?;
            let device_name = device_name.unwrap_or_else(|| std::env::consts::OS.to_string());
            let session = SessionGateway::new(&site)?.pair(&code, &device_name).await?;
            settings.apply_pairing(session);
            settings_repo.save(settings.clone()).await?;
            println!("Paired with {site}");
        }
        Commands::Verify => {
            let gateway = gateway(&settings)?;
            let status = gateway.verify_token().await?;
            if !status.valid {
                bail!("Session is no longer valid: pair again");
            }
            if !status.companies.is_empty() {
                settings.companies = status.companies;
                settings_repo.save(settings.clone()).await?;
            }
            println!("Session valid for {}", gateway.site_url());
        }
        Commands::Chat {
            message,
            conversation,
            new,
        } => {
            let mut controller = open_controller(&settings, cli.data_dir.as_ref()).await?;
            if new {
                controller.new_conversation();
            } else if let Some(id) = conversation
                && !controller.select_conversation(&id)
            {
                bail!("No conversation with id {id}");
            }

            match message {
                Some(text) => send_and_stream(&mut controller, &text).await?,
                None => interactive(&mut controller).await?,
            }
            controller.flush().await?;
        }
        Commands::List { query } => {
            let controller = open_controller(&settings, cli.data_dir.as_ref()).await?;
            let conversations: Vec<&Conversation> = match &query {
                Some(q) => controller.search(q),
                None => controller.store().conversations().iter().collect(),
            };
            for conv in conversations {
                println!(
                    "{}{}  {}  ({} messages, {})",
                    if conv.is_pinned() { "* " } else { "  " },
                    conv.id(),
                    conv.title(),
                    conv.message_count(),
                    conv.created_at().format("%Y-%m-%d %H:%M"),
                );
            }
        }
        Commands::Show { id } => {
            let controller = open_controller(&settings, cli.data_dir.as_ref()).await?;
            let conv = controller
                .store()
                .get(&id)
                .with_context(|| format!("No conversation with id {id}"))?;
            print_conversation(conv);
        }
        Commands::Pin { id } => set_pinned(&settings, cli.data_dir.as_ref(), &id, true).await?,
        Commands::Unpin { id } => set_pinned(&settings, cli.data_dir.as_ref(), &id, false).await?,
        Commands::Delete { id } => {
            let mut controller = open_controller(&settings, cli.data_dir.as_ref()).await?;
            if !controller.delete_conversation(&id) {
                bail!("No conversation with id {id}");
            }
            controller.flush().await?;
            println!("Deleted {id}");
        }
        Commands::React {
            conversation,
            message,
            tag,
        } => {
            let mut controller = open_controller(&settings, cli.data_dir.as_ref()).await?;
            if !controller.select_conversation(&conversation) {
                bail!("No conversation with id {conversation}");
            }
            let set = controller
                .toggle_reaction(&message, &tag)
                .with_context(|| format!("No message with id {message}"))?;
            controller.flush().await?;
            println!("{tag} {}", if set { "added" } else { "removed" });
        }
        Commands::Logout { wipe } => {
            logout(&mut settings, cli.data_dir.as_ref(), wipe).await?;
            settings_repo.save(settings).await?;
            println!("Logged out");
        }
    }

    Ok(())
}

fn gateway(settings: &ClientSettings) -> Result<SessionGateway> {
    let (Some(site), Some(token)) = (&settings.site_url, &settings.token) else {
        bail!("Not paired: run `niv pair --site <url> <code>` first");
    };
    Ok(SessionGateway::new(site)?.with_token(token.as_str()))
}

fn conversation_repository(
    settings: &ClientSettings,
    data_dir: Option<&PathBuf>,
) -> Result<Arc<dyn ConversationRepository>> {
    let repo = match (&settings.conversations_path, data_dir) {
        (Some(path), _) => ConversationJsonRepository::with_path(path.clone()),
        (None, Some(dir)) => ConversationJsonRepository::with_path(dir.join("conversations.json")),
        (None, None) => ConversationJsonRepository::new()?,
    };
    Ok(Arc::new(repo))
}

async fn open_controller(
    settings: &ClientSettings,
    data_dir: Option<&PathBuf>,
) -> Result<ChatController> {
    let transport = gateway(settings)?.stream_transport()?;
    info!(endpoint = %transport.endpoint(), "Using chat endpoint");
    let repo = conversation_repository(settings, data_dir)?;
    ChatController::open(settings, Arc::new(transport), repo).await
}

/// Forget the session. With `wipe`, local history goes too, whether or not
/// a session is still stored.
async fn logout(settings: &mut ClientSettings, data_dir: Option<&PathBuf>, wipe: bool) -> Result<()> {
    if settings.is_paired() {
        let mut controller = open_controller(settings, data_dir).await?;
        controller.logout(wipe).await?;
    } else if wipe {
        let repo = conversation_repository(settings, data_dir)?;
        let mut store = ConversationsStore::load(repo)
            .await
            .context("Failed to load conversations")?;
        store.clear();
        store.flush().await?;
    }
    settings.clear_session();
    Ok(())
}

async fn set_pinned(
    settings: &ClientSettings,
    data_dir: Option<&PathBuf>,
    id: &str,
    pinned: bool,
) -> Result<()> {
    let mut controller = open_controller(settings, data_dir).await?;
    if !controller.set_pinned(id, pinned) {
        bail!("No conversation with id {id}");
    }
    controller.flush().await?;
    Ok(())
}

/// Send one message and print the reply as it streams. Ctrl-C stops the
/// reply but keeps what arrived.
async fn send_and_stream(controller: &mut ChatController, text: &str) -> Result<()> {
    controller.send(text)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = std::io::stdout();

    loop {
        let interrupted = tokio::select! {
            event = controller.next_event() => {
                let Some(event) = event else { break };
                match event {
                    StreamEvent::Token(text) => {
                        print!("{text}");
                        stdout.flush()?;
                    }
                    StreamEvent::ToolCall(name) => eprintln!("[tool: {name}]"),
                    StreamEvent::Error(message) => eprintln!("{ERROR_MARKER} {message}"),
                    StreamEvent::Done => {}
                }
                false
            }
            _ = &mut ctrl_c => true,
        };

        if interrupted {
            warn!("Interrupted, stopping reply");
            controller.stop();
            break;
        }
    }

    if let Some(reply) = controller.messages().as_slice().last()
        && !reply.content().is_empty()
        && !reply.content().ends_with('\n')
    {
        println!();
    }
    Ok(())
}

async fn interactive(controller: &mut ChatController) -> Result<()> {
    chat_lines(controller, BufReader::new(tokio::io::stdin())).await
}

/// Send every non-blank line of `input` as a message.
async fn chat_lines<R>(controller: &mut ChatController, input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    eprint!("> ");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            eprint!("> ");
            continue;
        }
        if let Err(e) = send_and_stream(controller, &line).await {
            eprintln!("{e}");
        }
        controller.flush().await?;
        eprint!("> ");
    }
    Ok(())
}

fn print_conversation(conv: &Conversation) {
    println!("# {} ({})", conv.title(), conv.id());
    for message in conv.messages() {
        let who = match message.role() {
            Role::User => "you",
            Role::Assistant => "niv",
        };
        println!("\n[{}] {who}:", message.id());
        println!("{}", message.content());
        if !message.tools().is_empty() {
            println!("  tools: {}", message.tools().join(", "));
        }
        if !message.reactions().is_empty() {
            let tags: Vec<&str> = message.reactions().iter().map(String::as_str).collect();
            println!("  reactions: {}", tags.join(", "));
        }
    }
}
