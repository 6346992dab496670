//! Environment-based configuration.
//!
//! Each component reads its own config struct with a `from_env()`
//! constructor. Missing required variables are fatal at startup; everything
//! else falls back to defaults suitable for a single-host deployment.
//!
//! Call `dotenvy::dotenv()` before any `from_env()` so a local `.env` file
//! is honored.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use ari_client::EventEndpoint;

use crate::error::{GatewayError, GatewayResult};

mod framed;
mod stream;
mod tap;

pub use framed::FramedConfig;
pub use stream::{AssistConfig, RoleMode, SpeechConfig, StreamConfig};
pub use tap::TapConfig;

/// Read a required variable; empty values count as missing.
fn require(name: &str) -> GatewayResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(GatewayError::Configuration(format!(
            "required environment variable {name} is not set"
        ))),
    }
}

/// Read an optional variable; empty values count as unset.
fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Read and parse an optional variable, falling back to `default`.
fn parse_or<T>(name: &str, default: T) -> GatewayResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(name) {
        Some(raw) => raw.parse::<T>().map_err(|e| {
            GatewayError::Configuration(format!("invalid value for {name}: {e}"))
        }),
        None => Ok(default),
    }
}

/// Boolean flags accept 1/true/yes (case-insensitive).
fn flag(name: &str, default: bool) -> bool {
    match optional(name) {
        Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

fn socket_addr(name: &str, default: &str) -> GatewayResult<SocketAddr> {
    let raw = optional(name).unwrap_or_else(|| default.to_string());
    raw.parse().map_err(|e| {
        GatewayError::Configuration(format!("invalid socket address for {name} ({raw}): {e}"))
    })
}

fn events_endpoint(name: &str) -> GatewayResult<EventEndpoint> {
    match optional(name).as_deref() {
        None | Some("auto") => Ok(EventEndpoint::Auto),
        Some("events") => Ok(EventEndpoint::Events),
        Some("ws") => Ok(EventEndpoint::Ws),
        Some(other) => Err(GatewayError::Configuration(format!(
            "invalid value for {name}: '{other}' (expected auto, events or ws)"
        ))),
    }
}

fn dump_dir(name: &str) -> PathBuf {
    optional(name)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}
