//! Settings type definitions.
//!
//! Every section is `#[serde(default)]` so a settings file only has to name
//! the keys it changes. Field names are camelCase on the wire.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings for the liaison bridge.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiaisonSettings {
    pub server: ServerSettings,
    pub live_agent: LiveAgentSettings,
    pub bot_channel: BotChannelSettings,
    pub contacts: ContactsSettings,
    pub session: SessionSettings,
    pub messages: MessageTemplates,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// HTTP listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

/// Live-agent chat backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveAgentSettings {
    /// REST root, e.g. `https://host/chat/rest`.
    pub base_url: String,
    pub api_version: String,
    pub organization_id: String,
    pub deployment_id: String,
    pub button_id: String,
    /// Upper bound on one long-poll request. Must exceed the backend's own hold time.
    pub poll_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub visitor_language: String,
    pub screen_resolution: String,
    pub user_agent: String,
}

impl Default for LiveAgentSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8181/chat/rest".to_string(),
            api_version: "58".to_string(),
            organization_id: String::new(),
            deployment_id: String::new(),
            button_id: String::new(),
            poll_timeout_ms: 40_000,
            request_timeout_ms: 10_000,
            visitor_language: "en-US".to_string(),
            screen_resolution: "1920x1080".to_string(),
            user_agent: "liaison/0.1".to_string(),
        }
    }
}

impl LiveAgentSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Outbound channel back to the end user.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotChannelSettings {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BotChannelSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8282".to_string(),
            token: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl BotChannelSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// CRM contact lookup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactsSettings {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for ContactsSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8383".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ContactsSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Session lifecycle tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Partition of the durable store owned by this deployment.
    pub client_scope: String,
    /// Delay between poll iterations.
    pub poll_interval_ms: u64,
    /// Persisted sessions older than this are discarded on recovery.
    pub stale_after_secs: u64,
    /// Upper bound on a single outbound send.
    pub dispatch_timeout_ms: u64,
    pub dedup_ttl_ms: u64,
    pub context_retention_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            client_scope: "default".to_string(),
            poll_interval_ms: 5_000,
            stale_after_secs: 86_400,
            dispatch_timeout_ms: 10_000,
            dedup_ttl_ms: 5_000,
            context_retention_secs: 86_400,
        }
    }
}

impl SessionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn context_retention(&self) -> Duration {
        Duration::from_secs(self.context_retention_secs)
    }
}

/// User- and agent-facing texts. Placeholders are `{name}` style.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageTemplates {
    pub waiting: String,
    /// `{position}`
    pub queue_position: String,
    /// `{minutes}`
    pub estimated_wait: String,
    pub no_agents: String,
    pub chat_ended: String,
    /// `{agent}`
    pub agent_joined: String,
    /// `{name}`, `{provider}`
    pub greeting: String,
    pub user_prefix: String,
    pub bot_prefix: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            waiting: "Please wait, an agent will be with you shortly.".to_string(),
            queue_position: "You are number {position} in the queue.".to_string(),
            estimated_wait: "Estimated wait: {minutes} min.".to_string(),
            no_agents: "No agents are available right now. Please try again later.".to_string(),
            chat_ended: "The agent has ended the chat.".to_string(),
            agent_joined: "{agent} joined the chat.".to_string(),
            greeting: "{name} started a chat from {provider}. Conversation so far:".to_string(),
            user_prefix: "User".to_string(),
            bot_prefix: "Bot".to_string(),
        }
    }
}

/// Substitute `{key}` placeholders. Unknown placeholders are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Database locations. Relative paths resolve under `~/.liaison`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub db_path: String,
    pub log_db_path: String,
    pub log_to_sqlite: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "database/liaison.db".to_string(),
            log_db_path: "database/logs.db".to_string(),
            log_to_sqlite: true,
        }
    }
}

impl StorageSettings {
    pub fn resolved_db_path(&self) -> PathBuf {
        resolve_under_home(&self.db_path)
    }

    pub fn resolved_log_db_path(&self) -> PathBuf {
        resolve_under_home(&self.log_db_path)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Module path => level, e.g. `{"liaison_engine": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
        }
    }
}

/// `~/.liaison`, or `/tmp/.liaison` without a HOME.
pub fn liaison_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".liaison")
}

fn resolve_under_home(raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        liaison_home().join(path)
    }
}
