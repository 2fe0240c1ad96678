use std::io::Write;

use anyhow::{Context, Result, bail};
use athena_core::{
    ChatController, ChatEvent, Conversation, SendOutcome, SettingsJsonRepository,
    SettingsRepository, TemplateStore,
};
use futures::FutureExt;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tracing::warn;

use crate::TemplateAction;

fn print_conversation(conversation: &Conversation, preview_chars: usize) {
    let marker = if conversation.pinned { "*" } else { " " };
    println!(
        "{} {}  {}  ({} messages, {})",
        marker,
        conversation.id,
        conversation.title,
        conversation.message_count(),
        conversation.updated_at.format("%Y-%m-%d %H:%M"),
    );
    println!("    {}", conversation.preview_with_limit(preview_chars));
}

pub async fn list(
    controller: &ChatController,
    search: Option<&str>,
    preview_chars: usize,
) -> Result<()> {
    controller.refresh().await?;

    controller.read(|store| {
        if let Some(query) = search {
            for conversation in store.search(query) {
                print_conversation(conversation, preview_chars);
            }
            return;
        }

        println!("Pinned");
        for conversation in store.pinned() {
            print_conversation(conversation, preview_chars);
        }
        println!("Recent");
        for conversation in store.recent() {
            print_conversation(conversation, preview_chars);
        }
        println!("Folders");
        for folder in store.folders() {
            println!("  {}  {} ({} conversations)", folder.id, folder.name, folder.conversations.len());
            for conversation in &folder.conversations {
                println!("    - {} {}", conversation.id, conversation.title);
            }
        }
    });
    Ok(())
}

pub async fn new_conversation(controller: &ChatController) -> Result<()> {
    controller.refresh().await?;
    let id = controller.create_conversation().await?;
    println!("{}", id);
    Ok(())
}

/// Print the part of `text` not yet written to stdout
fn print_increment(printed: &mut usize, text: &str) {
    if text.len() <= *printed || !text.is_char_boundary(*printed) {
        return;
    }
    print!("{}", &text[*printed..]);
    let _ = std::io::stdout().flush();
    *printed = text.len();
}

fn handle_event(event: ChatEvent, conversation_id: &str, printed: &mut usize) {
    if let ChatEvent::TextRendered {
        conversation_id: id,
        text,
        ..
    } = event
        && id == conversation_id
    {
        print_increment(printed, &text);
    }
}

fn drain_events(rx: &mut Receiver<ChatEvent>, conversation_id: &str, printed: &mut usize) {
    loop {
        match rx.try_recv() {
            Ok(event) => handle_event(event, conversation_id, printed),
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Dropped render events"),
            Err(_) => break,
        }
    }
}

/// Run a send while echoing the streamed reply; Ctrl-C pauses it
async fn stream_send<F>(controller: &ChatController, conversation_id: &str, send: F) -> Result<()>
where
    F: Future<Output = athena_core::ChatResult<SendOutcome>>,
{
    let mut rx = controller.subscribe();
    let mut printed = 0usize;

    let pause_controller = controller.clone();
    let pause_id = conversation_id.to_string();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pause_controller.pause(&pause_id);
        }
    });

    let mut send = std::pin::pin!(send.fuse());
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            event = rx.recv() => match event {
                Ok(event) => handle_event(event, conversation_id, &mut printed),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped render events"),
                Err(RecvError::Closed) => {}
            },
        }
    };
    interrupt.abort();
    drain_events(&mut rx, conversation_id, &mut printed);
    if printed > 0 {
        println!();
    }

    match outcome? {
        SendOutcome::Completed { message_id } => println!("[saved as {}]", message_id),
        SendOutcome::Truncated { message_id, reason } => {
            println!("[{}; partial reply saved as {}]", reason, message_id)
        }
        SendOutcome::Discarded { reason } => println!("[{}; reply discarded]", reason),
        SendOutcome::EmptyReply => println!("[empty reply]"),
    }
    Ok(())
}

/// Refresh, then select the given conversation or the most recent one
async fn select_target(controller: &ChatController, conversation: Option<String>) -> Result<String> {
    controller.refresh().await?;

    let conversation_id = match conversation {
        Some(id) => id,
        None => match controller.read(|s| s.list_all().first().map(|c| c.id.clone())) {
            Some(id) => id,
            None => controller.create_conversation().await?,
        },
    };
    controller.select_conversation(&conversation_id)?;
    Ok(conversation_id)
}

pub async fn send(
    controller: &ChatController,
    conversation: Option<String>,
    message: &str,
) -> Result<()> {
    let conversation_id = select_target(controller, conversation).await?;

    stream_send(
        controller,
        &conversation_id,
        controller.send_to_selected(message),
    )
    .await
}

pub async fn resend(controller: &ChatController, conversation: &str, message_id: &str) -> Result<()> {
    controller.refresh().await?;
    stream_send(
        controller,
        conversation,
        controller.resend_message(conversation, message_id),
    )
    .await
}

pub async fn pin(controller: &ChatController, conversation: &str) -> Result<()> {
    controller.refresh().await?;
    let pinned = controller.toggle_pin(conversation).await?;
    println!("{} {}", if pinned { "Pinned" } else { "Unpinned" }, conversation);
    Ok(())
}

pub async fn delete(controller: &ChatController, conversation: &str) -> Result<()> {
    controller.refresh().await?;
    controller
        .delete_conversation(conversation)
        .await
        .with_context(|| format!("deleting conversation {}", conversation))?;
    println!("Deleted {}", conversation);
    Ok(())
}

pub async fn create_folder(
    controller: &ChatController,
    name: &str,
    conversations: &[String],
) -> Result<()> {
    controller.refresh().await?;
    let id = controller.create_folder(name, conversations).await?;
    println!("{}", id);
    Ok(())
}

pub async fn rename_folder(controller: &ChatController, folder: &str, name: &str) -> Result<()> {
    controller.refresh().await?;
    controller.rename_folder(folder, name).await?;
    println!("Renamed {} to {}", folder, name.trim());
    Ok(())
}

pub async fn delete_folder(controller: &ChatController, folder: &str) -> Result<()> {
    controller.refresh().await?;
    controller.delete_folder(folder).await?;
    println!("Deleted folder {}", folder);
    Ok(())
}

/// Template edits go to the stored settings, without command-line overrides
pub async fn manage_templates(repo: &SettingsJsonRepository, action: &TemplateAction) -> Result<()> {
    let mut settings = repo
        .load()
        .await
        .with_context(|| format!("loading {}", repo.storage_path()))?;
    let templates = &mut settings.templates;

    match action {
        TemplateAction::List | TemplateAction::Use { .. } => {
            for template in templates.list() {
                println!("{}  {}", template.id, template.name);
                println!("    {}", template.snippet());
            }
            return Ok(());
        }
        TemplateAction::Create {
            name,
            content,
            snippet,
        } => {
            let id = templates.create(name, content, snippet.clone()).id.clone();
            println!("{}", id);
        }
        TemplateAction::Update {
            id,
            name,
            content,
            snippet,
        } => {
            if !templates.update(id, name, content, snippet.clone()) {
                bail!("Unknown template: {}", id);
            }
            println!("Updated {}", id);
        }
        TemplateAction::Delete { id } => {
            if !templates.delete(id) {
                bail!("Unknown template: {}", id);
            }
            println!("Deleted template {}", id);
        }
    }

    repo.save(settings).await?;
    Ok(())
}

pub async fn use_template(
    controller: &ChatController,
    templates: &TemplateStore,
    template_id: &str,
    conversation: Option<String>,
) -> Result<()> {
    let conversation_id = select_target(controller, conversation).await?;
    stream_send(
        controller,
        &conversation_id,
        controller.send_template(templates, template_id),
    )
    .await
}
