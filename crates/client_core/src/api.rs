use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header::CONTENT_TYPE, multipart, Client, RequestBuilder, Response};
use serde::Serialize;
use shared::{
    domain::{AttachmentKey, ConversationId, ConversationSummary, Message, MessageId},
    error::ApiError,
    protocol::{ConversationPage, EditMessageBody, MessageWire, SendAck, SendMessageBody},
};
use url::Url;

use crate::events::message_from_wire;

/// Outgoing message as handed to the API.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub content: Option<String>,
    pub reply_to: Option<MessageId>,
    pub client_timestamp: DateTime<Utc>,
    pub attachment: Option<AttachmentUpload>,
}

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    pub bytes: Bytes,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationListing {
    pub summaries: Vec<ConversationSummary>,
    pub next_page: Option<u32>,
}

#[async_trait]
pub trait ConsoleApi: Send + Sync {
    async fn list_conversations(&self, page: u32, page_size: u32) -> Result<ConversationListing>;
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<Vec<Message>>;
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendRequest,
    ) -> Result<SendAck>;
    async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<()>;
    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()>;
    async fn fetch_attachment(&self, key: &AttachmentKey) -> Result<FetchedAttachment>;
}

#[derive(Serialize)]
struct HistoryQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<String>,
}

#[derive(Serialize)]
struct PageQuery {
    page: u32,
    page_size: u32,
}

pub struct HttpConsoleApi {
    http: Client,
    base_url: Url,
    bearer: String,
}

impl HttpConsoleApi {
    pub fn new(server_url: &str, bearer: impl Into<String>) -> Result<Self> {
        let mut base_url = Url::parse(server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            bearer: bearer.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.bearer_auth(&self.bearer).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiError>(&body) {
            Ok(api_error) => Err(anyhow!(api_error).context(format!("request failed with {status}"))),
            Err(_) => Err(anyhow!("request failed with {status}: {body}")),
        }
    }
}

fn require_server_id(message_id: &MessageId) -> Result<&str> {
    match message_id {
        MessageId::Server(id) => Ok(id),
        MessageId::Provisional(_) => Err(anyhow!(
            "message {message_id} has not been confirmed by the server yet"
        )),
    }
}

#[async_trait]
impl ConsoleApi for HttpConsoleApi {
    async fn list_conversations(&self, page: u32, page_size: u32) -> Result<ConversationListing> {
        let url = self.endpoint(&["conversations"])?;
        let page: ConversationPage = self
            .dispatch(self.http.get(url).query(&PageQuery {
                page,
                page_size: page_size.clamp(1, 100),
            }))
            .await?
            .json()
            .await?;

        Ok(ConversationListing {
            summaries: page
                .items
                .into_iter()
                .map(|item| ConversationSummary {
                    id: item.id,
                    counterpart_name: item.counterpart_name,
                    last_message_preview: item.last_message_preview,
                    last_message_time: item.last_message_time,
                    last_message_id: None,
                    unread_count: item.unread_count,
                    is_selected: false,
                })
                .collect(),
            next_page: page.next_page,
        })
    }

    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<Vec<Message>> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let wires: Vec<MessageWire> = self
            .dispatch(self.http.get(url).query(&HistoryQuery {
                limit: limit.clamp(1, 100),
                before: before.map(ToString::to_string),
            }))
            .await?
            .json()
            .await?;

        wires
            .into_iter()
            .map(|wire| message_from_wire(wire, conversation_id).map_err(anyhow::Error::from))
            .collect()
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendRequest,
    ) -> Result<SendAck> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let body = SendMessageBody {
            content: request.content,
            reply_to: request.reply_to.map(|id| id.to_string()),
            client_timestamp: request.client_timestamp,
        };

        let builder = match request.attachment {
            None => self.http.post(url).json(&body),
            Some(upload) => {
                let mut part = multipart::Part::bytes(upload.bytes.to_vec())
                    .file_name(upload.file_name);
                if let Some(mime_type) = upload.mime_type.as_deref() {
                    part = part
                        .mime_str(mime_type)
                        .with_context(|| format!("invalid attachment mime type: {mime_type}"))?;
                }
                let form = multipart::Form::new()
                    .text("message", serde_json::to_string(&body)?)
                    .part("file", part);
                self.http.post(url).multipart(form)
            }
        };

        let response = self.dispatch(builder).await?;
        let raw = response.bytes().await?;
        if raw.is_empty() {
            return Ok(SendAck::default());
        }
        Ok(serde_json::from_slice(&raw).context("invalid send acknowledgement")?)
    }

    async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<()> {
        let url = self.endpoint(&[
            "conversations",
            conversation_id.as_str(),
            "messages",
            require_server_id(message_id)?,
        ])?;
        self.dispatch(self.http.patch(url).json(&EditMessageBody {
            content: content.to_string(),
        }))
        .await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()> {
        let url = self.endpoint(&[
            "conversations",
            conversation_id.as_str(),
            "messages",
            require_server_id(message_id)?,
        ])?;
        self.dispatch(self.http.delete(url)).await?;
        Ok(())
    }

    async fn fetch_attachment(&self, key: &AttachmentKey) -> Result<FetchedAttachment> {
        let url = self.endpoint(&[
            "conversations",
            key.conversation_id.as_str(),
            "messages",
            require_server_id(&key.message_id)?,
            "attachment",
        ])?;
        let response = self.dispatch(self.http.get(url)).await?;
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| !value.is_empty());
        let bytes = response.bytes().await?;
        Ok(FetchedAttachment { bytes, mime_type })
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
