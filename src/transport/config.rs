//! Parsing helpers for engine names and broker endpoints.

use super::{Engine, TransportError};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

pub fn parse_engine(s: &str) -> Option<Engine> {
    match s.to_ascii_lowercase().as_str() {
        "mqtt" => Some(Engine::Mqtt),
        #[cfg(any(test, feature = "transport-mock"))]
        "mock" => Some(Engine::Mock),
        _ => None,
    }
}

/// Split `host:port` (or bare `host`, defaulting to 1883). IPv6 literals must be
/// bracketed: `[::1]:1883`.
pub fn split_endpoint(endpoint: &str) -> Result<(String, u16), TransportError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(TransportError::Endpoint("empty endpoint".into()));
    }

    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| TransportError::Endpoint(format!("bad endpoint '{}'", endpoint)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(endpoint, p)?,
            None if tail.is_empty() => DEFAULT_MQTT_PORT,
            None => return Err(TransportError::Endpoint(format!("bad endpoint '{}'", endpoint))),
        };
        return Ok((host.to_string(), port));
    }

    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            Ok((host.to_string(), parse_port(endpoint, port)?))
        }
        Some(_) => Err(TransportError::Endpoint(format!("bad endpoint '{}'", endpoint))),
        None => Ok((endpoint.to_string(), DEFAULT_MQTT_PORT)),
    }
}

fn parse_port(endpoint: &str, port: &str) -> Result<u16, TransportError> {
    port.parse()
        .map_err(|_| TransportError::Endpoint(format!("bad port in endpoint '{}'", endpoint)))
}
