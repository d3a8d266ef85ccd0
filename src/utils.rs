use crate::peer::types::ServerConfig;
use rand::Rng;

/// 16 hex chars, used for session and track ids.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Adds the protocol scheme to an ICE server URL when it is missing.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // "turn:", "turns:" and "stun:" urls are returned untouched
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        // the server type decides which scheme to add
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
