//! The front door: selects a supervisor per message.
//!
//! Conversations tagged `mission`/`pillar` go to the mission-lead
//! supervisor; everything else (including untagged and unknown
//! conversations) goes to the default. Tags are read once per
//! conversation and cached.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use fm_domain::message::{channel_tag, InboundMessage};
use fm_domain::Result;
use fm_store::ConversationStore;

use crate::agent::supervisor::SupervisorAgent;
use crate::ports::ChannelSink;

pub struct MessageRouter {
    default_supervisor: Arc<SupervisorAgent>,
    mission_supervisor: Option<Arc<SupervisorAgent>>,
    store: Arc<dyn ConversationStore>,
    /// conversation id → channel tag (None = looked up, untagged).
    tag_cache: Mutex<HashMap<String, Option<String>>>,
}

impl MessageRouter {
    pub fn new(
        default_supervisor: Arc<SupervisorAgent>,
        mission_supervisor: Option<Arc<SupervisorAgent>>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            default_supervisor,
            mission_supervisor,
            store,
            tag_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Wire this router as the channel's ingress handler.
    pub fn attach(self: &Arc<Self>, channel: &Arc<dyn ChannelSink>) {
        let router = Arc::clone(self);
        channel.on_message(Arc::new(move |message| {
            router.deliver(message);
        }));
    }

    /// Pick the supervisor for a message by its conversation's tag.
    pub async fn route(&self, message: &InboundMessage) -> Arc<SupervisorAgent> {
        let Some(conversation_id) = &message.conversation_id else {
            return self.default_supervisor.clone();
        };

        let cached = self.tag_cache.lock().get(conversation_id).cloned();
        let tag = match cached {
            Some(tag) => tag,
            None => {
                let tag = match self.store.find_conversation(conversation_id).await {
                    Ok(conversation) => conversation.and_then(|c| c.channel_tag),
                    Err(e) => {
                        tracing::warn!(error = %e, "conversation tag lookup failed");
                        None
                    }
                };
                self.tag_cache
                    .lock()
                    .insert(conversation_id.clone(), tag.clone());
                tag
            }
        };

        match (&tag, &self.mission_supervisor) {
            (Some(tag), Some(mission)) if channel_tag::is_mission_led(tag) => mission.clone(),
            _ => self.default_supervisor.clone(),
        }
    }

    /// Route and handle one message, awaiting the full turn.
    pub async fn dispatch(&self, message: InboundMessage) -> Result<()> {
        let supervisor = self.route(&message).await;
        supervisor.handle_message(message).await
    }

    /// Fire-and-forget ingress: each message runs as its own task.
    pub fn deliver(self: &Arc<Self>, message: InboundMessage) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let message_id = message.id.clone();
            if let Err(e) = router.dispatch(message).await {
                tracing::error!(error = %e, message_id = %message_id, "message handling failed");
            }
        });
    }

    /// Cached tags (for inspection).
    pub fn cached_tag(&self, conversation_id: &str) -> Option<Option<String>> {
        self.tag_cache.lock().get(conversation_id).cloned()
    }
}
