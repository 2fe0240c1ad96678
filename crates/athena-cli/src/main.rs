use std::sync::Arc;
use std::sync::mpsc::Receiver;

use anyhow::{Result, bail};
use athena_core::models::ErrorEntry;
use athena_core::{
    AthenaSettings, ChatController, ChatOptions, ErrorCollectorLayer, ErrorStore, HttpChatApi,
    HttpReplySource, SettingsJsonRepository, SettingsRepository, SharedHttpClient, UserIdentity,
};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

#[derive(Parser)]
#[command(name = "athena")]
#[command(about = "Terminal client for the Athena chat service", long_about = None)]
struct Cli {
    /// Base URL of the Athena web app (overrides settings)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// User id to act as (overrides settings)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Increase log verbosity
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pinned and recent conversations and folders
    List {
        /// Only show conversations whose title or preview matches
        #[arg(long)]
        search: Option<String>,
    },
    /// Start a new conversation
    New,
    /// Send a message and print the streamed reply
    Send {
        /// Conversation id (defaults to the most recent conversation)
        #[arg(long, short)]
        conversation: Option<String>,
        /// Message text
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Send an earlier message again
    Resend {
        conversation: String,
        message_id: String,
    },
    /// Toggle the pinned flag of a conversation
    Pin { conversation: String },
    /// Delete a conversation (and remove it from its folders)
    Delete { conversation: String },
    /// Manage folders
    Folder {
        #[command(subcommand)]
        action: FolderAction,
    },
    /// Manage prompt templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Show the effective settings
    Config {
        /// Persist the effective settings (including --base-url / --user)
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum FolderAction {
    /// Create a folder from one or more conversations
    Create {
        name: String,
        #[arg(required = true)]
        conversations: Vec<String>,
    },
    /// Rename a folder
    Rename { folder: String, name: String },
    /// Delete a folder (its conversations are kept)
    Delete { folder: String },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List saved templates
    List,
    /// Save a new template
    Create {
        name: String,
        content: String,
        #[arg(long)]
        snippet: Option<String>,
    },
    /// Replace a template's name and body
    Update {
        id: String,
        name: String,
        content: String,
        #[arg(long)]
        snippet: Option<String>,
    },
    /// Delete a template
    Delete { id: String },
    /// Send a template's body as a message
    Use {
        id: String,
        /// Conversation id (defaults to the most recent conversation)
        #[arg(long, short)]
        conversation: Option<String>,
    },
}

fn init_logging(verbose: u8) -> Receiver<ErrorEntry> {
    let default_directive = match verbose {
        0 => "athena=info,athena_core=info",
        1 => "athena=debug,athena_core=debug",
        _ => "athena=trace,athena_core=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let (collector, receiver) = ErrorCollectorLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(collector)
        .init();

    receiver
}

async fn load_settings(repo: &SettingsJsonRepository, cli: &Cli) -> AthenaSettings {
    let mut settings = match repo.load().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = %e, path = %repo.storage_path(), "Failed to load settings, using defaults");
            AthenaSettings::default()
        }
    };

    if let Some(base_url) = &cli.base_url {
        settings.api_base_url = base_url.clone();
    }
    if let Some(user) = &cli.user {
        settings.user = UserIdentity::new(user.clone());
    }
    settings
}

fn report_errors(store: &ErrorStore, receiver: &Receiver<ErrorEntry>, verbose: u8) {
    store.drain_from(receiver);
    let (errors, warnings) = (store.error_count(), store.warning_count());
    if errors + warnings == 0 {
        return;
    }

    eprintln!("{} error(s), {} warning(s) during this run", errors, warnings);
    if verbose > 0 {
        for entry in store.get_all_entries() {
            eprintln!("  [{:?}] {}: {}", entry.level, entry.target, entry.message);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let error_receiver = init_logging(cli.verbose);

    let repo = SettingsJsonRepository::new()?;
    let settings = load_settings(&repo, &cli).await;
    let error_store = ErrorStore::new(settings.error_log_capacity);
    debug!(base_url = %settings.api_base_url, "Settings loaded");

    if let Commands::Config { save } = &cli.command {
        println!("{}", repo.storage_path());
        println!("{}", serde_json::to_string_pretty(&settings)?);
        if *save {
            repo.save(settings.clone()).await?;
            println!("Saved.");
        }
        return Ok(());
    }

    if let Commands::Template { action } = &cli.command
        && !matches!(action, TemplateAction::Use { .. })
    {
        return commands::manage_templates(&repo, action).await;
    }

    if settings.user.is_anonymous() {
        bail!(
            "No user configured; pass --user or set user.id in {}",
            repo.storage_path()
        );
    }

    let http = SharedHttpClient::new();
    let controller = ChatController::new(
        Arc::new(HttpChatApi::new(&settings.api_base_url, http.clone())),
        Arc::new(HttpReplySource::new(&settings.api_base_url, http)),
        settings.user.clone(),
        ChatOptions::from(&settings),
    );

    if let Err(e) = controller.sync_user().await {
        warn!(error = %e, "Continuing without user sync");
    }

    let result = match cli.command {
        Commands::List { search } => {
            commands::list(&controller, search.as_deref(), settings.preview_chars).await
        }
        Commands::New => commands::new_conversation(&controller).await,
        Commands::Send {
            conversation,
            message,
        } => commands::send(&controller, conversation, &message.join(" ")).await,
        Commands::Resend {
            conversation,
            message_id,
        } => commands::resend(&controller, &conversation, &message_id).await,
        Commands::Pin { conversation } => commands::pin(&controller, &conversation).await,
        Commands::Delete { conversation } => commands::delete(&controller, &conversation).await,
        Commands::Folder { action } => match action {
            FolderAction::Create {
                name,
                conversations,
            } => commands::create_folder(&controller, &name, &conversations).await,
            FolderAction::Rename { folder, name } => {
                commands::rename_folder(&controller, &folder, &name).await
            }
            FolderAction::Delete { folder } => commands::delete_folder(&controller, &folder).await,
        },
        Commands::Template {
            action: TemplateAction::Use { id, conversation },
        } => commands::use_template(&controller, &settings.templates, &id, conversation).await,
        Commands::Template { .. } | Commands::Config { .. } => Ok(()),
    };

    controller.shutdown();
    report_errors(&error_store, &error_receiver, cli.verbose);
    result
}
