//! The ARI client: REST surface and the stasis event stream.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bridge::BridgeHandle;
use crate::channel::ChannelHandle;
use crate::error::{AriError, AriResult};
use crate::events::{AriEvent, ChannelInfo};
use crate::{GlobalEventHandler, HandlerFuture};

/// Which event-stream endpoint layout the PBX exposes.
///
/// Classic Asterisk serves the stream at `<base>/events` when the REST base
/// ends in `/ari`; deployments that put ARI behind a rewriting proxy expose a
/// bare `/ws` endpoint instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventEndpoint {
    /// Pick from the base URL: a path ending in `/ari` selects `Events`,
    /// anything else selects `Ws`.
    #[default]
    Auto,
    /// `<base>/events`
    Events,
    /// `<base>/ws`
    Ws,
}

/// Optional connection settings.
#[derive(Debug, Clone, Default)]
pub struct AriOptions {
    /// Path prefix expected in front of every REST path and the event
    /// stream. Not appended again when the base URL already ends with it.
    pub path_prefix: Option<String>,
    /// Event-stream endpoint selection.
    pub event_endpoint: EventEndpoint,
}

pub(crate) struct ClientInner {
    http: reqwest::Client,
    /// Normalized REST base, prefix applied, no trailing slash.
    base: String,
    username: String,
    password: String,
    event_endpoint: EventEndpoint,
    channels: RwLock<HashMap<String, ChannelHandle>>,
    global_handlers: RwLock<HashMap<String, Vec<GlobalEventHandler>>>,
    stream_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Handle to one PBX control-plane connection. Cloning is cheap; all clones
/// share the channel registry and subscriptions.
#[derive(Clone)]
pub struct AriClient {
    inner: Arc<ClientInner>,
}

/// Spy direction for snoop channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyDirection {
    In,
    Out,
    Both,
}

impl SpyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpyDirection::In => "in",
            SpyDirection::Out => "out",
            SpyDirection::Both => "both",
        }
    }
}

/// An Asterisk channel id is `<timestamp>.<seq>`; names carry the technology
/// prefix (`SIP/100-000001`). The slash is the tell.
fn looks_like_name(channel: &str) -> bool {
    channel.contains('/')
}

/// Percent-encode a channel identifier for use as one URL path segment.
/// Channel names carry slashes that must not act as path separators.
fn encode_segment(segment: &str) -> String {
    segment
        .replace('%', "%25")
        .replace('/', "%2F")
        .replace('?', "%3F")
        .replace('#', "%23")
        .replace(' ', "%20")
}

fn normalize_base(base_url: &str, prefix: Option<&str>) -> AriResult<String> {
    let url = Url::parse(base_url).map_err(|e| AriError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AriError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )));
        }
    }

    let mut base = base_url.trim_end_matches('/').to_string();
    if let Some(prefix) = prefix {
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() && !base.ends_with(&format!("/{prefix}")) {
            base.push('/');
            base.push_str(prefix);
        }
    }
    Ok(base)
}

impl AriClient {
    /// Create a client for the given REST base URL with basic-auth
    /// credentials. The base may already include a path prefix.
    pub fn connect(base_url: &str, username: &str, password: &str) -> AriResult<Self> {
        Self::with_options(base_url, username, password, AriOptions::default())
    }

    /// Create a client with explicit prefix and endpoint settings.
    pub fn with_options(
        base_url: &str,
        username: &str,
        password: &str,
        options: AriOptions,
    ) -> AriResult<Self> {
        let base = normalize_base(base_url, options.path_prefix.as_deref())?;
        Ok(AriClient {
            inner: Arc::new(ClientInner {
                http: reqwest::Client::new(),
                base,
                username: username.to_string(),
                password: password.to_string(),
                event_endpoint: options.event_endpoint,
                channels: RwLock::new(HashMap::new()),
                global_handlers: RwLock::new(HashMap::new()),
                stream_shutdown: Mutex::new(None),
            }),
        })
    }

    /// Subscribe to every event of the given type, regardless of channel.
    /// The handler additionally receives the channel handle when the event
    /// carries a channel snapshot.
    pub fn on<F, Fut>(&self, event_type: &str, handler: F)
    where
        F: Fn(AriEvent, Option<ChannelHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: GlobalEventHandler =
            Arc::new(move |ev, ch| Box::pin(handler(ev, ch)) as HandlerFuture);
        self.inner
            .global_handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Open the stasis event stream subscribed to `app` (with
    /// `subscribeAll=true`). Returns the stream task handle; the task ends
    /// when the stream closes or `stop` is called. Reconnection is the
    /// caller's policy, not the client's.
    pub async fn start(&self, app: &str) -> AriResult<JoinHandle<()>> {
        let ws_url = self.inner.events_url(app)?;
        debug!(url = %ws_url, "connecting stasis event stream");

        let (ws_stream, _response) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| AriError::EventStream(e.to_string()))?;
        info!(app, "stasis event stream connected");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *self.inner.stream_shutdown.lock() = Some(shutdown_tx);

        let inner = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let (mut sink, mut stream) = ws_stream.split();
            loop {
                tokio::select! {
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            let Some(inner) = inner.upgrade() else { break };
                            dispatch(&inner, &text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!(?frame, "stasis event stream closed by PBX");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("stasis event stream error: {e}");
                            break;
                        }
                        None => {
                            warn!("stasis event stream ended");
                            break;
                        }
                    },
                    _ = &mut shutdown_rx => {
                        debug!("stasis event stream shutting down");
                        break;
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Close the event stream, if one is running.
    pub fn stop(&self) {
        if let Some(tx) = self.inner.stream_shutdown.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Create a snoop channel on `channel` (id or name). When the PBX
    /// answers "not found" for something that looks like a name, the channel
    /// list is consulted once to resolve the id and the snoop is retried.
    pub async fn snoop_channel(
        &self,
        channel: &str,
        app: &str,
        spy: SpyDirection,
        app_args: &str,
    ) -> AriResult<ChannelHandle> {
        let query = [
            ("spy", spy.as_str()),
            ("app", app),
            ("appArgs", app_args),
        ];

        match self.snoop_once(channel, &query).await {
            Ok(handle) => Ok(handle),
            Err(e) if e.is_not_found() && looks_like_name(channel) => {
                debug!(channel, "snoop target not found by name, resolving id");
                let id = self.resolve_channel_id(channel).await?;
                self.snoop_once(&id, &query).await
            }
            Err(e) => Err(e),
        }
    }

    async fn snoop_once(
        &self,
        channel: &str,
        query: &[(&str, &str)],
    ) -> AriResult<ChannelHandle> {
        let path = format!("channels/{}/snoop", encode_segment(channel));
        let info: ChannelInfo = self.inner.post_json(&path, query).await?;
        Ok(self.inner.register_channel(&info.id, &info.name))
    }

    async fn resolve_channel_id(&self, name: &str) -> AriResult<String> {
        let channels = self.channels().await?;
        channels
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
            .ok_or_else(|| AriError::ChannelNotFound(name.to_string()))
    }

    /// Create an external-media channel emitting the bridge audio to
    /// `external_host` (a `host:port`).
    pub async fn external_media(
        &self,
        app: &str,
        app_args: &str,
        external_host: &str,
        format: &str,
        transport: &str,
        encapsulation: &str,
    ) -> AriResult<ChannelHandle> {
        let query = [
            ("app", app),
            ("app_args", app_args),
            ("external_host", external_host),
            ("format", format),
            ("transport", transport),
            ("encapsulation", encapsulation),
        ];
        let info: ChannelInfo = self
            .inner
            .post_json("channels/externalMedia", &query)
            .await?;
        Ok(self.inner.register_channel(&info.id, &info.name))
    }

    /// List all live channels.
    pub async fn channels(&self) -> AriResult<Vec<ChannelInfo>> {
        let body = self.inner.send(Method::GET, "channels", &[]).await?;
        serde_json::from_str(&body).map_err(|e| AriError::Transport(e.to_string()))
    }

    /// Get (or lazily create) the handle for a channel id.
    pub fn get_channel(&self, id: &str) -> ChannelHandle {
        self.inner.register_channel(id, "")
    }

    /// Drop a channel handle from the registry.
    pub fn forget_channel(&self, id: &str) {
        self.inner.channels.write().remove(id);
    }

    /// Handle for an already-existing bridge id.
    pub fn get_bridge(&self, id: &str) -> BridgeHandle {
        BridgeHandle::new(id.to_string(), Arc::downgrade(&self.inner))
    }

    /// Create a bridge of the given type (here always "mixing").
    pub async fn create_bridge(&self, bridge_type: &str) -> AriResult<BridgeHandle> {
        #[derive(serde::Deserialize)]
        struct BridgeInfo {
            id: String,
        }
        let info: BridgeInfo = self
            .inner
            .post_json("bridges", &[("type", bridge_type)])
            .await?;
        Ok(BridgeHandle::new(info.id, Arc::downgrade(&self.inner)))
    }

    /// The normalized REST base this client talks to.
    pub fn base_url(&self) -> &str {
        &self.inner.base
    }

    /// The event-stream URL that `start` would connect to for `app`.
    pub fn events_url(&self, app: &str) -> AriResult<Url> {
        self.inner.events_url(app)
    }
}

async fn dispatch(inner: &Arc<ClientInner>, text: &str) {
    let Some(event) = AriEvent::parse(text) else {
        debug!("dropping unparsable stream message");
        return;
    };

    let channel = event
        .channel
        .as_ref()
        .map(|info| inner.register_channel(&info.id, &info.name));

    let handlers: Vec<GlobalEventHandler> = {
        let map = inner.global_handlers.read();
        map.get(&event.event_type).cloned().unwrap_or_default()
    };
    for handler in handlers {
        handler(event.clone(), channel.clone()).await;
    }

    if let Some(channel) = &channel {
        channel.dispatch(&event).await;
    }
}

impl ClientInner {
    pub(crate) fn register_channel(self: &Arc<Self>, id: &str, name: &str) -> ChannelHandle {
        let mut map = self.channels.write();
        if let Some(handle) = map.get(id) {
            handle.refresh_name(name);
            return handle.clone();
        }
        let handle = ChannelHandle::new(id.to_string(), name.to_string(), Arc::downgrade(self));
        map.insert(id.to_string(), handle.clone());
        handle
    }

    fn events_url(&self, app: &str) -> AriResult<Url> {
        let mut url =
            Url::parse(&self.base).map_err(|e| AriError::InvalidUrl(e.to_string()))?;
        let ws_scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(ws_scheme)
            .map_err(|_| AriError::InvalidUrl("cannot derive ws scheme".into()))?;

        let endpoint = match self.event_endpoint {
            EventEndpoint::Events => "events",
            EventEndpoint::Ws => "ws",
            EventEndpoint::Auto => {
                if url.path().trim_end_matches('/').ends_with("/ari") {
                    "events"
                } else {
                    "ws"
                }
            }
        };
        let path = format!("{}/{}", url.path().trim_end_matches('/'), endpoint);
        url.set_path(&path);
        url.query_pairs_mut()
            .append_pair("app", app)
            .append_pair("subscribeAll", "true")
            .append_pair("api_key", &format!("{}:{}", self.username, self.password));
        Ok(url)
    }

    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> AriResult<String> {
        let url = format!("{}/{}", self.base, path);
        let response = self
            .http
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(AriError::Rest {
                status: status.as_u16(),
                body,
            })
        }
    }

    pub(crate) async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> AriResult<T> {
        let body = self.send(Method::POST, path, query).await?;
        serde_json::from_str(&body).map_err(|e| AriError::Transport(e.to_string()))
    }

    pub(crate) async fn post(&self, path: &str, query: &[(&str, &str)]) -> AriResult<String> {
        self.send(Method::POST, path, query).await
    }

    pub(crate) async fn delete(&self, path: &str) -> AriResult<String> {
        self.send(Method::DELETE, path, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str, options: AriOptions) -> AriClient {
        AriClient::with_options(base, "tap", "secret", options).unwrap()
    }

    #[test]
    fn prefix_is_applied_once() {
        let options = AriOptions {
            path_prefix: Some("ari".into()),
            ..Default::default()
        };
        let c = client("http://pbx:8088", options.clone());
        assert_eq!(c.base_url(), "http://pbx:8088/ari");

        // Already-suffixed base is not doubled.
        let c = client("http://pbx:8088/ari", options);
        assert_eq!(c.base_url(), "http://pbx:8088/ari");
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let c = client("http://pbx:8088/ari/", AriOptions::default());
        assert_eq!(c.base_url(), "http://pbx:8088/ari");
    }

    #[test]
    fn rejects_non_http_bases() {
        assert!(AriClient::connect("ftp://pbx", "u", "p").is_err());
        assert!(AriClient::connect("not a url", "u", "p").is_err());
    }

    #[test]
    fn events_url_auto_selects_ari_events() {
        let c = client("http://pbx:8088/ari", AriOptions::default());
        let url = c.events_url("tap").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/ari/events");
        let query = url.query().unwrap();
        assert!(query.contains("app=tap"));
        assert!(query.contains("subscribeAll=true"));
        assert!(query.contains("api_key=tap%3Asecret"));
    }

    #[test]
    fn events_url_auto_selects_ws_without_ari_suffix() {
        let c = client("https://pbx.example.com/pbx", AriOptions::default());
        let url = c.events_url("tap").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/pbx/ws");
    }

    #[test]
    fn events_url_honors_explicit_endpoint() {
        let options = AriOptions {
            event_endpoint: EventEndpoint::Ws,
            ..Default::default()
        };
        let c = client("http://pbx:8088/ari", options);
        assert_eq!(c.events_url("tap").unwrap().path(), "/ari/ws");
    }

    #[test]
    fn channel_names_have_slashes() {
        assert!(looks_like_name("SIP/100-000001"));
        assert!(looks_like_name("PJSIP/agent-00000042"));
        assert!(!looks_like_name("1722450800.17"));
    }

    #[test]
    fn channel_registry_refreshes_names() {
        let c = client("http://pbx:8088/ari", AriOptions::default());
        let first = c.get_channel("100.1");
        assert_eq!(first.name(), "");

        let again = c.inner.register_channel("100.1", "SIP/100-000001");
        assert_eq!(again.name(), "SIP/100-000001");
        assert_eq!(first.name(), "SIP/100-000001");

        c.forget_channel("100.1");
        assert!(c.inner.channels.read().is_empty());
    }
}
