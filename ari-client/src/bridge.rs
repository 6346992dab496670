//! Bridge handles.

use std::sync::{Arc, Weak};

use crate::client::ClientInner;
use crate::error::{AriError, AriResult};

/// Handle to one PBX mixing bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    pub(crate) id: Arc<String>,
    pub(crate) client: Weak<ClientInner>,
}

impl BridgeHandle {
    pub(crate) fn new(id: String, client: Weak<ClientInner>) -> Self {
        BridgeHandle {
            id: Arc::new(id),
            client,
        }
    }

    /// The PBX bridge id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a channel to the bridge by channel id.
    pub async fn add_channel(&self, channel_id: &str) -> AriResult<()> {
        let client = self.client()?;
        client
            .post(
                &format!("bridges/{}/addChannel", self.id),
                &[("channel", channel_id)],
            )
            .await?;
        Ok(())
    }

    /// Destroy the bridge. Destroying an already-gone bridge yields 404,
    /// which is not an error here.
    pub async fn destroy(&self) -> AriResult<()> {
        let client = self.client()?;
        match client.delete(&format!("bridges/{}", self.id)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn client(&self) -> AriResult<Arc<ClientInner>> {
        self.client.upgrade().ok_or(AriError::ClientGone)
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle").field("id", &self.id).finish()
    }
}
