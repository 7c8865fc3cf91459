pub mod bot_channel;
pub mod contacts;
mod http;
pub mod live_agent;
pub mod mock;

pub use bot_channel::HttpBotChannel;
pub use contacts::HttpContactResolver;
pub use live_agent::LiveAgentClient;
