//! Generative assistant sampling.
//!
//! Final transcripts accumulate into a per-call conversation log. A
//! background timer periodically posts conversations that have both grown
//! since the last send and passed the minimum-size threshold; replies marked
//! for the agent are published to the call's room and appended to the log.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::StreamGateway;
use super::rooms::{WidgetEvent, now_millis};
use crate::config::AssistConfig;

/// Who said a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    Assistant,
}

/// One conversation item.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    pub timestamp: u64,
    pub role: Role,
    pub text: String,
}

#[derive(Default)]
struct Conversation {
    entries: Vec<ConversationEntry>,
    chars: usize,
    last_sent_items: usize,
}

/// A conversation snapshot ready to be posted.
struct DueSample {
    call_id: String,
    /// Item count at snapshot time; committed back after a successful send.
    items: usize,
    entries: Vec<ConversationEntry>,
}

#[derive(Serialize)]
struct AssistRequest<'a> {
    call_id: &'a str,
    engine: &'a str,
    conversation: &'a [ConversationEntry],
}

#[derive(Debug, Deserialize)]
struct AssistResponse {
    assistant: Option<AssistReply>,
}

#[derive(Debug, Deserialize)]
struct AssistReply {
    #[serde(default)]
    visibility: String,
    #[serde(default)]
    text: String,
}

/// Conversation log plus the HTTP side of the sampler.
pub struct AssistState {
    config: AssistConfig,
    http: reqwest::Client,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl AssistState {
    pub fn new(config: AssistConfig) -> Arc<Self> {
        Arc::new(AssistState {
            config,
            http: reqwest::Client::new(),
            conversations: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AssistConfig {
        &self.config
    }

    /// Append a final transcript to a call's conversation.
    pub fn append(&self, call_id: &str, role: Role, text: &str) {
        let mut map = self.conversations.lock();
        let conversation = map.entry(call_id.to_string()).or_default();
        conversation.chars += text.chars().count();
        conversation.entries.push(ConversationEntry {
            timestamp: now_millis(),
            role,
            text: text.to_string(),
        });
    }

    /// Drop a call's conversation (call ended).
    pub fn remove(&self, call_id: &str) {
        self.conversations.lock().remove(call_id);
    }

    /// Whether a call currently has conversation state.
    pub fn has_conversation(&self, call_id: &str) -> bool {
        self.conversations.lock().contains_key(call_id)
    }

    /// Conversations that meet the character budget and have grown since the
    /// last send, snapshotted with the tail window applied.
    fn due(&self) -> Vec<DueSample> {
        let map = self.conversations.lock();
        map.iter()
            .filter(|(_, c)| c.chars >= self.config.min_chars)
            .filter(|(_, c)| c.entries.len() > c.last_sent_items)
            .map(|(call_id, c)| DueSample {
                call_id: call_id.clone(),
                items: c.entries.len(),
                entries: tail_window(&c.entries, self.config.tail_chars),
            })
            .collect()
    }

    /// Record a successful send, but only while the conversation still
    /// exists; the call may have ended between snapshot and response.
    fn commit(&self, call_id: &str, items: usize) {
        if let Some(conversation) = self.conversations.lock().get_mut(call_id) {
            conversation.last_sent_items = items;
        }
    }

    async fn post(&self, sample: &DueSample) -> Option<AssistResponse> {
        let request = AssistRequest {
            call_id: &sample.call_id,
            engine: &self.config.engine,
            conversation: &sample.entries,
        };

        let mut builder = self.http.post(&self.config.url).json(&request);
        if let Some(authorization) = &self.config.authorization {
            builder = builder.header("Authorization", authorization);
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                response.json::<AssistResponse>().await.ok()
            }
            Ok(response) => {
                warn!(
                    call = %sample.call_id,
                    status = response.status().as_u16(),
                    "assistant endpoint rejected sample"
                );
                None
            }
            Err(e) => {
                warn!(call = %sample.call_id, "assistant request failed: {e}");
                None
            }
        }
    }
}

/// Keep the trailing entries whose combined length fits `max_chars`, always
/// keeping at least the newest entry.
fn tail_window(entries: &[ConversationEntry], max_chars: usize) -> Vec<ConversationEntry> {
    let mut budget = 0usize;
    let mut start = entries.len();
    for (index, entry) in entries.iter().enumerate().rev() {
        let length = entry.text.chars().count();
        if start < entries.len() && budget + length > max_chars {
            break;
        }
        budget += length;
        start = index;
    }
    entries[start..].to_vec()
}

/// The sampling loop; runs until the gateway shuts down.
pub(crate) async fn sampler(gateway: Arc<StreamGateway>, state: Arc<AssistState>) {
    let mut ticker = tokio::time::interval(state.config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        for sample in state.due() {
            gateway.metrics().assist_requests.inc();
            let Some(response) = state.post(&sample).await else {
                continue;
            };

            if let Some(reply) = response.assistant
                && reply.visibility == "agent"
                && !reply.text.is_empty()
            {
                if let Some(room) = gateway.room_for_call(&sample.call_id) {
                    gateway.rooms().publish(
                        &room,
                        &WidgetEvent::Assist {
                            text: reply.text.clone(),
                            speaker: state.config.speaker.clone(),
                        },
                    );
                } else {
                    debug!(call = %sample.call_id, "no room for assist reply");
                }
                state.append(&sample.call_id, Role::Assistant, &reply.text);
            }

            state.commit(&sample.call_id, sample.items);
        }
    }
}
