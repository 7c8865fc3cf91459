use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use liaison_core::messages::{AgentMessage, BotMessage};
use liaison_core::{AgentChatClient, BotChannelClient};

/// Delivery counters, shared by both consumers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Producer side of the outbound queues. Cheap to clone; enqueueing never blocks.
#[derive(Clone)]
pub struct Dispatcher {
    bot_tx: mpsc::UnboundedSender<BotMessage>,
    agent_tx: mpsc::UnboundedSender<AgentMessage>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Queue a message for the end user. False once the router has stopped.
    pub fn to_user(&self, message: BotMessage) -> bool {
        self.bot_tx.send(message).is_ok()
    }

    /// Queue a message for the agent chat. False once the router has stopped.
    pub fn to_agent(&self, message: AgentMessage) -> bool {
        self.agent_tx.send(message).is_ok()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

/// Owns the two queue consumers (bot channel, agent chat).
///
/// Each consumer sends one message at a time, in queue order, with a bounded
/// timeout. A failed or timed-out send is logged and dropped.
pub struct DispatchRouter {
    bot_consumer: JoinHandle<()>,
    agent_consumer: JoinHandle<()>,
}

impl DispatchRouter {
    pub fn start(
        bot_channel: Arc<dyn BotChannelClient>,
        agent_chat: Arc<dyn AgentChatClient>,
        send_timeout: Duration,
        cancel: CancellationToken,
    ) -> (Dispatcher, DispatchRouter) {
        let (bot_tx, mut bot_rx) = mpsc::unbounded_channel::<BotMessage>();
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel::<AgentMessage>();
        let stats = Arc::new(DispatchStats::default());

        let bot_consumer = {
            let cancel = cancel.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        message = bot_rx.recv() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    let key = message.conversation_key.clone();
                    let send = bot_channel.send_message(&message);
                    let result = tokio::time::timeout(send_timeout, send)
                        .await
                        .map_err(|_| send_timeout);
                    record(&stats, "bot_channel", key.as_str(), result);
                }
                debug!("bot channel consumer stopped");
            })
        };

        let agent_consumer = {
            let stats = stats.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        message = agent_rx.recv() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    let result = tokio::time::timeout(
                        send_timeout,
                        agent_chat.send_message(&message.credentials, &message.text),
                    )
                    .await;
                    record(
                        &stats,
                        "agent_chat",
                        message.conversation_key.as_str(),
                        result.map_err(|_| send_timeout),
                    );
                }
                debug!("agent chat consumer stopped");
            })
        };

        (
            Dispatcher {
                bot_tx,
                agent_tx,
                stats,
            },
            DispatchRouter {
                bot_consumer,
                agent_consumer,
            },
        )
    }

    /// Wait for both consumers to exit (after cancellation).
    pub async fn join(self) {
        let _ = self.bot_consumer.await;
        let _ = self.agent_consumer.await;
    }
}

fn record(
    stats: &DispatchStats,
    queue: &'static str,
    conversation_key: &str,
    result: Result<Result<(), liaison_core::ChatError>, Duration>,
) {
    match result {
        Ok(Ok(())) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                queue,
                conversation_key,
                error = %e,
                error_kind = e.error_kind(),
                "dispatch failed"
            );
        }
        Err(limit) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                queue,
                conversation_key,
                timeout_ms = limit.as_millis() as u64,
                "dispatch timed out"
            );
        }
    }
}
