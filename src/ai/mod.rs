//! Suggested-reply generation
//!
//! Recovery hands the scorer's verdict plus recent context to a language
//! model and gets back a short opener the business can send as-is. The
//! seam is a trait so the scan stays testable without a network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AiConfig;
use crate::db::StoredMessage;
use crate::scoring::TemperatureResult;
use crate::{Error, Result};

/// A generated reply with the model's reasoning
#[derive(Debug, Clone)]
pub struct SuggestedReply {
    pub text: String,
    pub rationale: String,
}

/// Context handed to the generator
#[derive(Debug)]
pub struct ReplyContext<'a> {
    pub contact_name: Option<&'a str>,
    pub recent_messages: &'a [StoredMessage],
    pub temperature: &'a TemperatureResult,
    pub hours_of_silence: i64,
}

/// Produces replies: conversational answers for the message worker and
/// recovery openers for the scan
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Answer the latest customer message given recent history
    async fn answer_message(
        &self,
        contact_name: Option<&str>,
        history: &[StoredMessage],
    ) -> Result<String>;

    async fn suggest_reply(&self, ctx: &ReplyContext<'_>) -> Result<SuggestedReply>;
}

/// OpenAI-compatible chat-completions client
pub struct HttpReplyGenerator {
    client: reqwest::Client,
    config: AiConfig,
}

impl HttpReplyGenerator {
    #[must_use]
    pub fn new(config: AiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn build_prompt(ctx: &ReplyContext<'_>) -> String {
        use std::fmt::Write as _;

        let name = ctx.contact_name.unwrap_or("the customer");
        let mut prompt = format!(
            "A business stopped hearing from {name} {} hours ago. \
             Lead temperature: {}/10 ({}). \
             Recent conversation, oldest first:\n",
            ctx.hours_of_silence, ctx.temperature.score, ctx.temperature.label
        );
        for msg in ctx.recent_messages {
            let who = match msg.direction {
                crate::db::Direction::Inbound => "customer",
                crate::db::Direction::Outbound => "business",
            };
            let _ = writeln!(prompt, "[{who}] {}", msg.body);
        }
        prompt.push_str(
            "\nWrite a short, warm re-engagement message in the conversation's language, \
             one or two sentences, no salesy pressure. \
             Respond as JSON: {\"reply\": \"...\", \"rationale\": \"...\"}",
        );
        prompt
    }
}

impl HttpReplyGenerator {
    async fn chat(&self, prompt: String, json: bool) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.7,
            response_format: json.then_some(ResponseFormat { kind: "json_object" }),
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response: ChatResponse = builder
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::ReplyGeneration("model returned no choices".to_owned()))
    }
}

#[async_trait]
impl ReplyGenerator for HttpReplyGenerator {
    async fn answer_message(
        &self,
        contact_name: Option<&str>,
        history: &[StoredMessage],
    ) -> Result<String> {
        use std::fmt::Write as _;

        let name = contact_name.unwrap_or("the customer");
        let mut prompt = format!(
            "You answer customer messages for a small service business. \
             {name} just wrote. Conversation, oldest first:\n"
        );
        for msg in history {
            let who = match msg.direction {
                crate::db::Direction::Inbound => "customer",
                crate::db::Direction::Outbound => "business",
            };
            let _ = writeln!(prompt, "[{who}] {}", msg.body);
        }
        prompt.push_str("\nReply helpfully in the conversation's language, one short paragraph.");

        self.chat(prompt, false).await
    }

    async fn suggest_reply(&self, ctx: &ReplyContext<'_>) -> Result<SuggestedReply> {
        let content = self.chat(Self::build_prompt(ctx), true).await?;
        let parsed: ReplyPayload = serde_json::from_str(&content)
            .map_err(|e| Error::ReplyGeneration(format!("unparseable model output: {e}")))?;

        Ok(SuggestedReply {
            text: parsed.reply,
            rationale: parsed.rationale,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReplyPayload {
    reply: String,
    #[serde(default)]
    rationale: String,
}

#[cfg(test)]
pub use mock::MockReplyGenerator;

#[cfg(test)]
mod mock {
    use super::{async_trait, ReplyContext, ReplyGenerator, Result, SuggestedReply};

    /// Deterministic generator for scan tests
    #[derive(Default)]
    pub struct MockReplyGenerator {
        pub fail: bool,
    }

    #[async_trait]
    impl ReplyGenerator for MockReplyGenerator {
        async fn answer_message(
            &self,
            contact_name: Option<&str>,
            _history: &[crate::db::StoredMessage],
        ) -> Result<String> {
            if self.fail {
                return Err(crate::Error::ReplyGeneration("model offline".to_owned()));
            }
            Ok(format!("Claro, {}! Posso ajudar.", contact_name.unwrap_or("tudo bem")))
        }

        async fn suggest_reply(&self, ctx: &ReplyContext<'_>) -> Result<SuggestedReply> {
            if self.fail {
                return Err(crate::Error::ReplyGeneration("model offline".to_owned()));
            }
            Ok(SuggestedReply {
                text: format!("Oi {}! Tudo bem?", ctx.contact_name.unwrap_or("")),
                rationale: "friendly reopening".to_owned(),
            })
        }
    }
}
