pub mod clients;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod session;

pub use clients::{AgentChatClient, BotChannelClient, ContactResolver, OpenedChatSession};
pub use errors::{ChatError, PollOutcome};
pub use events::{AgentChatEvent, PollBatch};
pub use ids::ConversationKey;
pub use session::{ChatCredentials, RequestError, SessionRecord, SessionStatus, StartChatRequest};
