use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use liaison_core::ids::ContactId;
use liaison_core::{ChatError, ContactResolver};
use liaison_settings::ContactsSettings;

use crate::http;

/// Resolves visitors to CRM contacts through the contacts service.
pub struct HttpContactResolver {
    client: reqwest::Client,
    base_url: String,
    timeout: std::time::Duration,
}

#[derive(Deserialize)]
struct ContactResponse {
    #[serde(default)]
    id: String,
}

impl HttpContactResolver {
    pub fn new(settings: &ContactsSettings) -> Result<Self, ChatError> {
        Ok(Self {
            client: http::build_client(settings.request_timeout())?,
            base_url: settings.base_url.clone(),
            timeout: settings.request_timeout(),
        })
    }
}

#[async_trait]
impl ContactResolver for HttpContactResolver {
    #[instrument(skip(self, email, phone))]
    async fn get_or_create_contact(
        &self,
        name: &str,
        email: &str,
        phone: &str,
    ) -> Result<ContactId, ChatError> {
        let resp = self
            .client
            .post(http::join_url(&self.base_url, "contacts"))
            .json(&json!({ "name": name, "email": email, "phone": phone }))
            .send()
            .await
            .map_err(|e| http::send_error(e, self.timeout))?;
        let body: ContactResponse = http::decode_json(http::check_status(resp).await?).await?;

        let id = ContactId::from_raw(body.id);
        if id.is_empty() {
            return Err(ChatError::Decode("contact response without id".into()));
        }
        Ok(id)
    }
}
