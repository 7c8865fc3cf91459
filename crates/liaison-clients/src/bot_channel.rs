use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::instrument;

use liaison_core::messages::{BotMessage, MessageContent};
use liaison_core::{BotChannelClient, ChatError};
use liaison_settings::BotChannelSettings;

use crate::http;

/// Posts outbound messages to the bot front end, which relays them to the
/// user's channel (WhatsApp, Facebook, ...).
pub struct HttpBotChannel {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
    timeout: std::time::Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundPayload<'a> {
    conversation_key: &'a str,
    user_id: &'a str,
    provider: &'a str,
    bot_id: &'a str,
    message: &'a MessageContent,
}

impl HttpBotChannel {
    pub fn new(settings: &BotChannelSettings) -> Result<Self, ChatError> {
        Ok(Self {
            client: http::build_client(settings.request_timeout())?,
            base_url: settings.base_url.clone(),
            token: settings.token.clone().map(SecretString::from),
            timeout: settings.request_timeout(),
        })
    }
}

#[async_trait]
impl BotChannelClient for HttpBotChannel {
    #[instrument(skip(self, message), fields(conversation_key = %message.conversation_key))]
    async fn send_message(&self, message: &BotMessage) -> Result<(), ChatError> {
        let payload = OutboundPayload {
            conversation_key: message.conversation_key.as_str(),
            user_id: message.user_id.as_str(),
            provider: &message.provider,
            bot_id: &message.bot_id,
            message: &message.content,
        };

        let mut req = self.client.post(http::join_url(&self.base_url, "messages"));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }
        let resp = req
            .json(&payload)
            .send()
            .await
            .map_err(|e| http::send_error(e, self.timeout))?;
        http::check_accepted(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_core::ids::UserId;
    use liaison_core::ConversationKey;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(content: MessageContent) -> BotMessage {
        BotMessage {
            conversation_key: ConversationKey::from_raw("u1:s1"),
            user_id: UserId::from_raw("u1"),
            provider: "whatsapp".into(),
            bot_id: "bot-7".into(),
            content,
        }
    }

    fn channel(server: &MockServer, token: Option<&str>) -> HttpBotChannel {
        HttpBotChannel::new(&BotChannelSettings {
            base_url: server.uri(),
            token: token.map(Into::into),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn text_is_posted_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("authorization", "Bearer s3cret"))
            .and(body_partial_json(serde_json::json!({
                "userId": "u1",
                "botId": "bot-7",
                "message": { "kind": "text", "text": "hola" }
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        channel(&server, Some("s3cret"))
            .send_message(&message(MessageContent::text("hola")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn media_payload_carries_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(serde_json::json!({
                "message": { "kind": "media", "url": "https://cdn.example.com/a.pdf" }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let media = MessageContent::Media {
            url: "https://cdn.example.com/a.pdf".into(),
            mime_type: Some("application/pdf".into()),
            caption: None,
        };
        channel(&server, None).send_message(&message(media)).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_send_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("channel down"))
            .mount(&server)
            .await;

        let err = channel(&server, None)
            .send_message(&message(MessageContent::text("x")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
    }
}
