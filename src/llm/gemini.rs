//! Gemini calls made with a single rotated key.
//!
//! Unary generation goes through rig's Gemini provider, built per call so the
//! key chosen by the executor is the one on the wire. Streaming reads the
//! `streamGenerateContent` SSE body directly so that error events sent inside
//! the stream reach the caller.

use crate::error::LlmError;
use crate::keys::Secret;
use eventsource_stream::{Event, EventStreamError, Eventsource as _};
use futures::stream::{BoxStream, Stream, StreamExt as _};
use rig::OneOrMany;
use rig::completion::{AssistantContent, CompletionError, CompletionModel as _, CompletionRequest};
use rig::http_client::Error as HttpError;
use rig::message::Message;
use rig::providers::gemini::{self, client::GeminiApiKey};
use serde::{Deserialize, Serialize};

const API_KEY_HEADER: &str = "x-goog-api-key";
const API_VERSION: &str = "v1beta";

/// Who said a turn of a chat transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

/// One prior turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            text: text.into(),
        }
    }

    fn to_message(&self) -> Message {
        match self.role {
            ChatRole::User => Message::user(self.text.clone()),
            ChatRole::Model => Message::assistant(self.text.clone()),
        }
    }

    fn to_content(&self) -> Content {
        Content::text(Some(self.role), &self.text)
    }
}

fn system_text(system_instruction: Option<&str>) -> Option<&str> {
    system_instruction.filter(|s| !s.trim().is_empty())
}

/// History followed by the new user message, in rig's request shape.
pub fn completion_request(
    history: &[ChatMessage],
    message: &str,
    system_instruction: Option<&str>,
) -> CompletionRequest {
    let mut chat_history = OneOrMany::one(Message::user(message));
    for (index, turn) in history.iter().enumerate() {
        chat_history.insert(index, turn.to_message());
    }

    CompletionRequest {
        preamble: system_text(system_instruction).map(str::to_string),
        chat_history,
        documents: Vec::new(),
        tools: Vec::new(),
        temperature: None,
        max_tokens: None,
        tool_choice: None,
        additional_params: None,
    }
}

/// Single-shot generation. A response without a usable candidate yields an
/// empty string; a non-2xx reply becomes [`LlmError::Upstream`].
pub async fn generate_content(
    http_client: &reqwest::Client,
    base_url: &str,
    model: &str,
    secret: &Secret,
    request: CompletionRequest,
) -> Result<String, LlmError> {
    let client = gemini::Client::<reqwest::Client>::builder()
        .api_key::<GeminiApiKey>(secret.expose())
        .base_url(base_url.trim_end_matches('/'))
        .http_client(http_client.clone())
        .build()
        .map_err(CompletionError::from)?;
    let model = gemini::CompletionModel::new(client, model);

    match model.completion(request).await {
        Ok(response) => Ok(response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect()),
        Err(CompletionError::HttpError(HttpError::InvalidStatusCodeWithMessage(status, body))) => {
            Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            })
        }
        Err(CompletionError::ResponseError(reason)) => {
            tracing::debug!(%reason, "gemini returned no usable candidate");
            Ok(String::new())
        }
        Err(error) => Err(error.into()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

impl GenerateContentRequest {
    pub fn chat(history: &[ChatMessage], message: &str, system_instruction: Option<&str>) -> Self {
        let mut contents: Vec<Content> = history.iter().map(ChatMessage::to_content).collect();
        contents.push(Content::text(Some(ChatRole::User), message));
        Self {
            contents,
            system_instruction: system_text(system_instruction).map(|s| Content::text(None, s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<ChatRole>, text: &str) -> Self {
        Self {
            role,
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One `streamGenerateContent` event. Failures after the response has
/// started arrive as an `error` object instead of candidates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

impl StreamChunk {
    /// Concatenated text parts of the first candidate.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn stream_endpoint(base_url: &str, model: &str) -> String {
    format!(
        "{}/{API_VERSION}/models/{model}:streamGenerateContent?alt=sse",
        base_url.trim_end_matches('/')
    )
}

pub async fn stream_generate_content(
    http_client: &reqwest::Client,
    base_url: &str,
    model: &str,
    secret: &Secret,
    request: &GenerateContentRequest,
) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
    let response = http_client
        .post(stream_endpoint(base_url, model))
        .header(API_KEY_HEADER, secret.expose())
        .json(request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Upstream {
            status: status.as_u16(),
            body,
        });
    }
    Ok(text_stream(response.bytes_stream()).boxed())
}

/// Decode an SSE body of [`StreamChunk`] events into text chunks. Events
/// without text are skipped; error events are yielded as errors.
pub fn text_stream<S, B>(bytes: S) -> impl Stream<Item = Result<String, LlmError>> + Send + 'static
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    bytes
        .eventsource()
        .filter_map(|event| futures::future::ready(decode_event(event)))
}

fn decode_event(
    event: Result<Event, EventStreamError<reqwest::Error>>,
) -> Option<Result<String, LlmError>> {
    let event = match event {
        Ok(event) => event,
        Err(EventStreamError::Transport(error)) => return Some(Err(LlmError::Request(error))),
        Err(error) => return Some(Err(LlmError::MalformedResponse(error.to_string()))),
    };
    if event.data.trim().is_empty() {
        return None;
    }

    let chunk: StreamChunk = match serde_json::from_str(&event.data) {
        Ok(chunk) => chunk,
        Err(error) => return Some(Err(LlmError::MalformedResponse(error.to_string()))),
    };
    if let Some(error) = chunk.error {
        tracing::debug!(code = error.code, status = %error.status, "error event in gemini stream");
        return Some(Err(LlmError::Upstream {
            status: error.code,
            body: format!("{}: {}", error.status, error.message),
        }));
    }

    let text = chunk.text();
    (!text.is_empty()).then_some(Ok(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunk(data: &str) -> Result<Vec<u8>, reqwest::Error> {
        Ok(data.as_bytes().to_vec())
    }

    #[test]
    fn chat_request_puts_history_before_message() {
        let history = [ChatMessage::user("hi"), ChatMessage::model("hello, how can I help?")];
        let request = GenerateContentRequest::chat(&history, "tell me a joke", Some("be brief"));
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][1]["parts"][0]["text"], "hello, how can I help?");
        assert_eq!(json["contents"][2]["role"], "user");
        assert_eq!(json["contents"][2]["parts"][0]["text"], "tell me a joke");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(json["systemInstruction"].get("role").is_none());

        let bare = serde_json::to_value(GenerateContentRequest::chat(&[], "hi", Some("  "))).unwrap();
        assert!(bare.get("systemInstruction").is_none());
        assert_eq!(bare["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn completion_request_orders_turns() {
        let history = [ChatMessage::user("first"), ChatMessage::model("second")];
        let request = completion_request(&history, "third", None);

        assert!(request.preamble.is_none());
        let turns: Vec<Message> = request.chat_history.iter().cloned().collect();
        assert_eq!(
            turns,
            [
                Message::user("first"),
                Message::assistant("second"),
                Message::user("third"),
            ]
        );
        assert_eq!(
            completion_request(&[], "hi", Some("be terse")).preamble.as_deref(),
            Some("be terse")
        );
    }

    #[tokio::test]
    async fn events_split_across_chunks() {
        let body = stream::iter(vec![
            chunk("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\nda"),
            chunk("ta: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\n\n"),
            chunk("data: {\"candidates\":[{\"content\":{\"parts\":[]}}]}\n\n"),
            chunk("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"!\"}]}}]}\n\n"),
        ]);

        let chunks: Vec<String> = text_stream(body).map(|item| item.unwrap()).collect().await;
        assert_eq!(chunks, ["Hel", "lo", "!"]);
    }

    #[tokio::test]
    async fn error_event_after_text_is_surfaced() {
        let body = stream::iter(vec![
            chunk("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n"),
            chunk(
                "data: {\"error\":{\"code\":429,\"message\":\"Resource has been exhausted (e.g. check quota).\",\"status\":\"RESOURCE_EXHAUSTED\"}}\n\n",
            ),
        ]);

        let items: Vec<_> = text_stream(body).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hel");
        match &items[1] {
            Err(LlmError::Upstream { status, body }) => {
                assert_eq!(*status, 429);
                assert!(body.contains("RESOURCE_EXHAUSTED"));
                assert!(body.contains("quota"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_event_is_reported() {
        let body = stream::iter(vec![chunk("data: {not json}\n\n")]);
        let items: Vec<_> = text_stream(body).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(LlmError::MalformedResponse(_))));
    }

    #[test]
    fn stream_endpoint_trims_trailing_slash() {
        assert_eq!(
            stream_endpoint("http://localhost:1234/", "gemini-2.5-flash"),
            "http://localhost:1234/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }
}
