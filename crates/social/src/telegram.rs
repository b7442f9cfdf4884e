use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{OperatorContext, OperatorNotifier, SocialError};

/// Sends "please post this by hand" messages to an operator chat.
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    explorer_tx_url: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// HTML body for an undeliverable reply.
pub fn render_reply_needed(text: &str, context: &OperatorContext, explorer_tx_url: &str) -> String {
    let mut message = format!(
        "🐦 <b>Twitter Reply Needed</b>\n\n<b>Reply Text:</b>\n<code>{}</code>\n\n<b>Tweet ID:</b> <code>{}</code>\n",
        escape_html(text),
        escape_html(&context.event_id),
    );
    if let Some(reference) = &context.settlement_ref {
        message.push_str(&format!(
            "<b>Transaction:</b> <a href=\"{explorer_tx_url}{}\">View on BscScan</a>\n",
            escape_html(reference)
        ));
    }
    message.push_str(&format!(
        "\n<b>Twitter Link:</b> <a href=\"https://x.com/i/web/status/{}\">View Tweet</a>",
        escape_html(&context.event_id)
    ));
    message
}

impl TelegramNotifier {
    pub fn new(
        api_base: &str,
        bot_token: &str,
        chat_id: &str,
        explorer_tx_url: &str,
    ) -> Result<Self, SocialError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
            chat_id: chat_id.trim().to_string(),
            explorer_tx_url: explorer_tx_url.to_string(),
        })
    }
}

#[async_trait]
impl OperatorNotifier for TelegramNotifier {
    async fn notify_operator(
        &self,
        text: &str,
        context: &OperatorContext,
    ) -> Result<(), SocialError> {
        let body = json!({
            "chat_id": self.chat_id,
            "text": render_reply_needed(text, context, &self.explorer_tx_url),
            "parse_mode": "HTML",
            "disable_web_page_preview": false,
        });
        let response = self
            .http
            .post(format!("{}/bot{}/sendMessage", self.api_base, self.bot_token))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SocialError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let parsed: TelegramResponse = response.json().await?;
        if !parsed.ok {
            return Err(SocialError::Rejected(
                parsed.description.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        info!(event_id = %context.event_id, "Operator notified");
        Ok(())
    }
}
