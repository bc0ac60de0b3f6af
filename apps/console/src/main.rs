use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use client_core::{
    load_settings, ApiAttachmentFetcher, AttachmentCache, ConsoleApi, ConsoleSession,
    ConversationView, Credentials, HttpConsoleApi, PollingFallbackFetcher, ReconnectPolicy,
    SendRequest, TransportSession, WsConnector,
};
use shared::domain::{
    ActorId, ConversationId, DeliveryState, Direction, Message, MessageId, TenantId,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from console.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    actor_id: String,
    #[arg(long)]
    tenant_id: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    token: String,
    /// Conversation to open; the most recent one when omitted.
    #[arg(long)]
    conversation: Option<String>,
    /// Skip the push channel and re-fetch the timeline every `poll_interval`.
    /// Also used when the channel cannot be brought up.
    #[arg(long)]
    poll: bool,
}

/// Where the printed timeline comes from.
enum Feed {
    Live(ConversationView),
    Polling(PollingFallbackFetcher),
}

impl Feed {
    fn timeline(&self) -> watch::Receiver<Vec<Message>> {
        match self {
            Self::Live(view) => view.messages.clone(),
            Self::Polling(poller) => poller.subscribe(),
        }
    }
}

/// Tracks which version of each entry was already printed. A provisional
/// entry is printed again when its delivery state changes, so a failed send
/// shows up even though it never gets a server id.
#[derive(Default)]
struct Printed {
    seen: HashSet<(MessageId, DeliveryState, bool)>,
}

impl Printed {
    fn fresh<'a>(&mut self, messages: &'a [Message]) -> Vec<&'a Message> {
        messages
            .iter()
            .filter(|m| self.seen.insert((m.id.clone(), m.delivery_state, m.edited)))
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }

    let api: Arc<dyn ConsoleApi> = Arc::new(HttpConsoleApi::new(&settings.server_url, &args.token)?);
    let transport = TransportSession::new(
        Arc::new(WsConnector::new(settings.server_url.clone())),
        ReconnectPolicy::from_settings(&settings),
    );
    let attachments = AttachmentCache::from_settings(
        Arc::new(ApiAttachmentFetcher::new(Arc::clone(&api))),
        &settings,
    );
    let tenant_id = TenantId::new(args.tenant_id);
    let session = ConsoleSession::new(
        settings.clone(),
        tenant_id.clone(),
        Arc::clone(&api),
        transport,
        Arc::clone(&attachments),
    );

    let live = if args.poll {
        false
    } else {
        let connected = session
            .connect(Credentials {
                actor_id: ActorId::new(args.actor_id),
                display_name: args.display_name,
                tenant_id,
                bearer: args.token,
            })
            .await;
        match connected {
            Ok(()) => true,
            Err(err) => {
                warn!("push channel unavailable, polling instead: {err}");
                false
            }
        }
    };

    session.load_conversations(0).await?;
    let conversations = session.conversations().await;
    for summary in &conversations {
        println!(
            "{:>3} unread  {}  {}",
            summary.unread_count,
            summary.counterpart_name,
            summary.last_message_preview.as_deref().unwrap_or("")
        );
    }

    let conversation_id = match args.conversation {
        Some(id) => ConversationId::new(id),
        None => conversations
            .first()
            .map(|s| s.id.clone())
            .ok_or_else(|| anyhow!("no conversations to open"))?,
    };
    let feed = if live {
        Feed::Live(session.open_conversation(conversation_id.clone()).await)
    } else {
        Feed::Polling(PollingFallbackFetcher::from_settings(
            Arc::clone(&api),
            conversation_id.clone(),
            &settings,
        ))
    };
    info!(%conversation_id, live, "type a message and press enter; /retry resends failed messages");

    let mut timeline = WatchStream::new(feed.timeline());
    let printer = tokio::spawn(async move {
        let mut printed = Printed::default();
        while let Some(messages) = timeline.next().await {
            for message in printed.fresh(&messages) {
                println!("{}", render(message));
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match &feed {
            Feed::Live(_) if line == "/retry" => {
                for id in session.failed_sends().await {
                    if let Err(err) = session.retry_send(&id).await {
                        warn!(%id, "retry failed: {err}");
                    }
                }
            }
            Feed::Live(_) => {
                if let Err(err) = session.send_text(line, None).await {
                    warn!("send failed, /retry to resend: {err}");
                }
            }
            Feed::Polling(_) if line == "/retry" => {
                warn!("/retry is only available on the push channel");
            }
            Feed::Polling(poller) => {
                let local = poller.append_local(Some(line.to_string()), None, Utc::now());
                let request = SendRequest {
                    content: local.content.clone(),
                    reply_to: None,
                    client_timestamp: local.timestamp,
                    attachment: None,
                };
                if let Err(err) = api.send_message(&conversation_id, request).await {
                    warn!("send failed: {err:#}");
                }
                poller.refresh_now();
            }
        }
    }

    printer.abort();
    drop(feed);
    session.shutdown().await;
    attachments.shutdown();
    Ok(())
}

fn render(message: &Message) -> String {
    let arrow = match message.direction {
        Direction::Outbound => ">>",
        Direction::Inbound => "<<",
    };
    let body = message
        .content
        .clone()
        .or_else(|| {
            message
                .attachment
                .as_ref()
                .and_then(|a| a.file_name.clone())
                .map(|name| format!("[attachment] {name}"))
        })
        .unwrap_or_default();
    let marker = match message.delivery_state {
        DeliveryState::Failed => " (failed)",
        DeliveryState::Pending => " (sending)",
        _ if message.edited => " (edited)",
        _ => "",
    };
    format!(
        "{} {arrow} {body}{marker}",
        message.timestamp.format("%H:%M:%S")
    )
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
