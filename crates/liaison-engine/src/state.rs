//! Session state machine: which agent-chat events move a session where, and
//! what has to be said on the way.
//!
//! Everything here is pure. The polling worker owns the record, applies the
//! returned [`Transition`] and carries out its effects.

use liaison_core::ids::CaseId;
use liaison_core::messages::MessageContent;
use liaison_core::{AgentChatEvent, PollOutcome, SessionStatus};
use liaison_settings::{render, MessageTemplates};

/// Side effect requested by a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Send to the end user on their channel.
    ToUser(MessageContent),
    /// Brief the agent: greeting line followed by the stored transcript.
    Greet,
    /// Remember the case the backend opened for this chat.
    RecordCaseId(CaseId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(status: SessionStatus) -> Self {
        Self {
            next: status,
            effects: Vec::new(),
        }
    }

    fn to(next: SessionStatus, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

/// Decide what `event` does to a session in `status`.
///
/// Returns `None` when the event has no meaning in that status (an agent
/// message before the chat is established, anything after a terminal state).
/// The caller logs and drops those.
pub fn on_event(
    status: SessionStatus,
    event: &AgentChatEvent,
    templates: &MessageTemplates,
) -> Option<Transition> {
    use SessionStatus::*;

    if status.is_terminal() {
        return None;
    }

    let transition = match (status, event) {
        (
            OnHold,
            AgentChatEvent::ChatRequestSuccess {
                queue_position,
                estimated_wait_secs,
                case_id,
            },
        ) => {
            let mut effects = vec![Effect::ToUser(MessageContent::text(waiting_text(
                templates,
                *queue_position,
                *estimated_wait_secs,
            )))];
            if let Some(case_id) = case_id.as_ref().filter(|c| !c.is_empty()) {
                effects.push(Effect::RecordCaseId(case_id.clone()));
            }
            Transition::to(OnHold, effects)
        }

        (
            OnHold,
            AgentChatEvent::QueueUpdate {
                position,
                estimated_wait_secs,
            },
        ) => match position {
            Some(position) => {
                let mut text = position_text(templates, *position);
                if let Some(wait) = wait_text(templates, *estimated_wait_secs) {
                    text.push(' ');
                    text.push_str(&wait);
                }
                Transition::to(OnHold, vec![Effect::ToUser(MessageContent::text(text))])
            }
            None => Transition::stay(OnHold),
        },

        (OnHold, AgentChatEvent::ChatEstablished { agent_name }) => Transition::to(
            Active,
            vec![
                Effect::Greet,
                Effect::ToUser(MessageContent::text(render(
                    &templates.agent_joined,
                    &[("agent", agent_display(agent_name))],
                ))),
            ],
        ),

        (OnHold, AgentChatEvent::ChatRequestFail { .. }) => Transition::to(
            Failed,
            vec![Effect::ToUser(MessageContent::text(templates.no_agents.clone()))],
        ),

        (Active, AgentChatEvent::ChatMessage { text, .. }) => {
            Transition::to(Active, vec![Effect::ToUser(MessageContent::text(text.clone()))])
        }

        (OnHold | Active, AgentChatEvent::ChatEnded { .. }) => Transition::to(
            Closed,
            vec![Effect::ToUser(MessageContent::text(templates.chat_ended.clone()))],
        ),

        (
            _,
            AgentChatEvent::AgentTyping
            | AgentChatEvent::AgentNotTyping
            | AgentChatEvent::Unknown { .. },
        ) => Transition::stay(status),

        _ => return None,
    };

    debug_assert!(status.can_transition_to(transition.next));
    Some(transition)
}

/// Status after a failed poll. `None` means keep polling unchanged.
pub fn on_poll_failure(status: SessionStatus, outcome: PollOutcome) -> Option<SessionStatus> {
    if status.is_terminal() || outcome.is_transient() {
        return None;
    }
    Some(SessionStatus::Closed)
}

fn waiting_text(
    templates: &MessageTemplates,
    queue_position: Option<u32>,
    estimated_wait_secs: Option<u64>,
) -> String {
    let mut text = templates.waiting.clone();
    if let Some(position) = queue_position.filter(|p| *p > 0) {
        text.push(' ');
        text.push_str(&position_text(templates, position));
    }
    if let Some(wait) = wait_text(templates, estimated_wait_secs) {
        text.push(' ');
        text.push_str(&wait);
    }
    text
}

fn position_text(templates: &MessageTemplates, position: u32) -> String {
    render(&templates.queue_position, &[("position", &position.to_string())])
}

fn wait_text(templates: &MessageTemplates, estimated_wait_secs: Option<u64>) -> Option<String> {
    let minutes = wait_minutes(estimated_wait_secs?);
    Some(render(&templates.estimated_wait, &[("minutes", &minutes.to_string())]))
}

/// Whole minutes, rounded up, never zero.
fn wait_minutes(secs: u64) -> u64 {
    secs.div_ceil(60).max(1)
}

fn agent_display(name: &str) -> &str {
    if name.trim().is_empty() {
        "An agent"
    } else {
        name
    }
}
