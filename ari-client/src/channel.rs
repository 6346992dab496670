//! Channel handles.
//!
//! A handle is created or refreshed whenever an event carrying a channel
//! snapshot arrives, and by the REST calls that create channels. Handles hold
//! a weak reference back to the client internals so the registry of handles
//! inside the client does not form an ownership cycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::client::ClientInner;
use crate::error::{AriError, AriResult};
use crate::events::AriEvent;
use crate::ChannelEventHandler;

pub(crate) struct ChannelState {
    pub(crate) id: String,
    pub(crate) name: RwLock<String>,
    pub(crate) client: Weak<ClientInner>,
    pub(crate) handlers: RwLock<HashMap<String, Vec<ChannelEventHandler>>>,
}

/// Handle to one PBX channel.
#[derive(Clone)]
pub struct ChannelHandle {
    pub(crate) state: Arc<ChannelState>,
}

impl ChannelHandle {
    pub(crate) fn new(id: String, name: String, client: Weak<ClientInner>) -> Self {
        ChannelHandle {
            state: Arc::new(ChannelState {
                id,
                name: RwLock::new(name),
                client,
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The PBX channel id.
    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// The human-readable channel name, e.g. `SIP/100-000001`.
    pub fn name(&self) -> String {
        self.state.name.read().clone()
    }

    pub(crate) fn refresh_name(&self, name: &str) {
        if !name.is_empty() {
            *self.state.name.write() = name.to_string();
        }
    }

    /// Subscribe to events dispatched to this channel.
    pub fn on<F, Fut>(&self, event_type: &str, handler: F)
    where
        F: Fn(AriEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ChannelEventHandler = Arc::new(move |ev| Box::pin(handler(ev)));
        self.state
            .handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Hang the channel up. The PBX answering 404 means the channel is
    /// already gone, which is not an error here.
    pub async fn hangup(&self) -> AriResult<()> {
        let client = self.client()?;
        match client.delete(&format!("channels/{}", self.state.id)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn dispatch(&self, event: &AriEvent) {
        let handlers: Vec<ChannelEventHandler> = {
            let map = self.state.handlers.read();
            map.get(&event.event_type).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(event.clone()).await;
        }
    }

    fn client(&self) -> AriResult<Arc<ClientInner>> {
        self.state.client.upgrade().ok_or(AriError::ClientGone)
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.state.id)
            .field("name", &*self.state.name.read())
            .finish()
    }
}
