//! HTTP signaling from the orchestrator to the media gateways.

use tracing::debug;

use super::session::CallMetadata;
use crate::error::{GatewayError, GatewayResult};
use crate::stream::Direction;

/// Client side of the gateways' `/register` / `/unregister` endpoints.
pub struct GatewaySignals {
    http: reqwest::Client,
    framed_base: String,
    stream_base: String,
}

impl GatewaySignals {
    pub fn new(framed_base: &str, stream_base: &str) -> Self {
        GatewaySignals {
            http: reqwest::Client::new(),
            framed_base: framed_base.trim_end_matches('/').to_string(),
            stream_base: stream_base.trim_end_matches('/').to_string(),
        }
    }

    /// Reserve `port` for a call at the framed gateway. Non-200 is fatal for
    /// the tap: the caller frees the port and abandons.
    pub async fn framed_register(
        &self,
        port: u16,
        uuid: &str,
        metadata: &CallMetadata,
    ) -> GatewayResult<()> {
        let port_string = port.to_string();
        let response = self
            .http
            .get(format!("{}/register", self.framed_base))
            .query(&[
                ("uuid", uuid),
                ("port", port_string.as_str()),
                ("agent_extension", metadata.agent_extension.as_str()),
                ("agent_username", metadata.agent_username.as_str()),
                ("agent_id", metadata.agent_id.as_str()),
            ])
            .send()
            .await?;

        if response.status().as_u16() == 200 {
            debug!(port, call = %uuid, "framed gateway accepted registration");
            Ok(())
        } else {
            Err(GatewayError::Signaling(format!(
                "framed register for port {port} answered {}",
                response.status()
            )))
        }
    }

    /// Release a framed port. Best-effort.
    pub async fn framed_unregister(&self, port: u16) -> GatewayResult<()> {
        self.http
            .get(format!("{}/unregister", self.framed_base))
            .query(&[("port", port.to_string().as_str())])
            .send()
            .await?;
        Ok(())
    }

    /// Announce a call context for a direction at the streaming gateway.
    /// Non-200 is surfaced but callers treat it as non-fatal.
    pub async fn stream_register(
        &self,
        uuid: &str,
        metadata: &CallMetadata,
        direction: Direction,
    ) -> GatewayResult<()> {
        let response = self
            .http
            .get(format!("{}/register", self.stream_base))
            .query(&[
                ("uuid", uuid),
                ("exten", metadata.extension.as_str()),
                ("caller", metadata.caller.as_str()),
                ("callername", metadata.caller_name.as_str()),
                ("dir", direction.as_str()),
            ])
            .send()
            .await?;

        if response.status().as_u16() == 200 {
            Ok(())
        } else {
            Err(GatewayError::Signaling(format!(
                "stream register for {uuid}/{} answered {}",
                direction.as_str(),
                response.status()
            )))
        }
    }

    /// Drop a call's context at the streaming gateway. Best-effort.
    pub async fn stream_unregister(&self, uuid: &str) -> GatewayResult<()> {
        self.http
            .get(format!("{}/unregister", self.stream_base))
            .query(&[("uuid", uuid)])
            .send()
            .await?;
        Ok(())
    }
}
