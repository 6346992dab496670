//! Single-flight bridge creation.
//!
//! The two snoops of a streaming tap enter stasis concurrently and both need
//! the direction's bridge. Each `(call, key)` pair owns one async slot:
//! concurrent callers serialize on the slot's mutex, the first one creates
//! the bridge, and the rest see the cached handle. A failed creation leaves
//! the slot empty so a later arrival can retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ari_client::{AriResult, BridgeHandle};
use parking_lot::Mutex;

use crate::stream::Direction;

/// Bridge identity within one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeKey {
    /// The single bridge of a framed tap (spy = both).
    Mixed,
    /// One bridge per direction for streaming taps.
    Direction(Direction),
}

type Slot = Arc<tokio::sync::Mutex<Option<BridgeHandle>>>;

#[derive(Default)]
pub struct BridgeSlots {
    slots: Mutex<HashMap<(String, BridgeKey), Slot>>,
}

impl BridgeSlots {
    /// Get the bridge for `(uuid, key)`, creating it through `create` if no
    /// concurrent caller has done so already.
    pub async fn get_or_create<F, Fut>(
        &self,
        uuid: &str,
        key: BridgeKey,
        create: F,
    ) -> AriResult<BridgeHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AriResult<BridgeHandle>>,
    {
        let slot: Slot = {
            let mut slots = self.slots.lock();
            slots
                .entry((uuid.to_string(), key))
                .or_default()
                .clone()
        };

        let mut guard = slot.lock().await;
        if let Some(bridge) = guard.as_ref() {
            return Ok(bridge.clone());
        }
        let bridge = create().await?;
        *guard = Some(bridge.clone());
        Ok(bridge)
    }

    /// Drop every slot of a call (cleanup).
    pub fn forget_call(&self, uuid: &str) {
        self.slots.lock().retain(|(call, _), _| call != uuid);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}
