//! Tap session resource graph.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use ari_client::{BridgeHandle, ChannelHandle};
use parking_lot::Mutex;

use super::singleflight::BridgeKey;

/// Which media pipeline a tap feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Framed,
    Streaming,
}

impl Backend {
    /// Parse the `gw` query parameter; absent means framed.
    pub fn from_query(raw: Option<&str>) -> Option<Backend> {
        match raw {
            None | Some("framed") => Some(Backend::Framed),
            Some("streaming") => Some(Backend::Streaming),
            Some(_) => None,
        }
    }
}

/// Call metadata carried through `/start_tap`.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    pub extension: String,
    pub caller: String,
    pub caller_name: String,
    pub agent_extension: String,
    pub agent_username: String,
    pub agent_id: String,
}

/// PBX-side resources owned by one tap.
#[derive(Default)]
pub struct SessionResources {
    pub snoops: Vec<ChannelHandle>,
    pub external_media: Vec<ChannelHandle>,
    pub bridges: HashMap<BridgeKey, BridgeHandle>,
    /// Allocated UDP port (framed backend only).
    pub port: Option<u16>,
}

/// One tapped call: its backend, metadata, and the resource graph built up
/// as snoop channels enter stasis. The `cleaned` latch makes teardown
/// idempotent and blocks late resource acquisition.
pub struct TapSession {
    pub uuid: String,
    pub backend: Backend,
    metadata: Mutex<CallMetadata>,
    resources: Mutex<SessionResources>,
    cleaned: AtomicBool,
}

impl TapSession {
    pub fn new(uuid: &str, backend: Backend, metadata: CallMetadata) -> Self {
        TapSession {
            uuid: uuid.to_string(),
            backend,
            metadata: Mutex::new(metadata),
            resources: Mutex::new(SessionResources::default()),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn metadata(&self) -> CallMetadata {
        self.metadata.lock().clone()
    }

    /// Refresh metadata on a repeated `/start_tap` for the same call.
    pub fn refresh_metadata(&self, metadata: CallMetadata) {
        *self.metadata.lock() = metadata;
    }

    /// Whether teardown has begun; a cleaned session acquires no resources.
    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Set the cleaned latch. Returns true when it was already set, in which
    /// case the caller must not run teardown again.
    pub fn mark_cleaned(&self) -> bool {
        self.cleaned.swap(true, Ordering::AcqRel)
    }

    pub fn add_snoop(&self, channel: ChannelHandle) {
        self.resources.lock().snoops.push(channel);
    }

    pub fn add_external_media(&self, channel: ChannelHandle) {
        self.resources.lock().external_media.push(channel);
    }

    pub fn set_bridge(&self, key: BridgeKey, bridge: BridgeHandle) {
        self.resources.lock().bridges.insert(key, bridge);
    }

    pub fn set_port(&self, port: u16) {
        self.resources.lock().port = Some(port);
    }

    /// Move the resource graph out for teardown.
    pub fn take_resources(&self) -> SessionResources {
        std::mem::take(&mut *self.resources.lock())
    }
}

/// Recover the snooped channel's id from a snoop channel name
/// (`Snoop/<channel-id>-<serial>`).
pub fn original_id_from_snoop_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix("Snoop/")?;
    let (id, _serial) = rest.rsplit_once('-')?;
    if id.is_empty() { None } else { Some(id.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_query_parsing() {
        assert_eq!(Backend::from_query(None), Some(Backend::Framed));
        assert_eq!(Backend::from_query(Some("framed")), Some(Backend::Framed));
        assert_eq!(
            Backend::from_query(Some("streaming")),
            Some(Backend::Streaming)
        );
        assert_eq!(Backend::from_query(Some("tape")), None);
    }

    #[test]
    fn cleaned_latch_fires_once() {
        let session = TapSession::new("A1", Backend::Framed, CallMetadata::default());
        assert!(!session.is_cleaned());
        assert!(!session.mark_cleaned(), "first caller runs teardown");
        assert!(session.mark_cleaned(), "second caller backs off");
        assert!(session.is_cleaned());
    }

    #[test]
    fn snoop_names_resolve_to_original_ids() {
        assert_eq!(
            original_id_from_snoop_name("Snoop/1722450800.12-00000001").as_deref(),
            Some("1722450800.12")
        );
        assert_eq!(original_id_from_snoop_name("SIP/100-000001"), None);
        assert_eq!(original_id_from_snoop_name("Snoop/noserial"), None);
    }
}
