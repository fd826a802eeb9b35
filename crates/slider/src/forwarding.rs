//! Player identity forwarding to backend servers.
//!
//! Backends run in offline mode and learn who the player is from the proxy,
//! either through the BungeeCord legacy handshake address or through the
//! Velocity modern login plugin exchange signed with HMAC-SHA256.

use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use slider_mc::buf::write_string;
use slider_mc::packets::{LoginPluginRequest, LoginPluginResponse, Property};
use slider_mc::varint::write_varint;

use crate::error::BackendError;

type HmacSha256 = Hmac<Sha256>;

/// The current Velocity forwarding protocol version.
pub const VELOCITY_FORWARDING_VERSION: i32 = 1;

/// The Velocity forwarding channel identifier.
pub const VELOCITY_CHANNEL: &str = "velocity:player_info";

/// Identity of the player being forwarded.
#[derive(Debug, Clone, Copy)]
pub struct ForwardedPlayer<'a> {
    /// Address the player connected from.
    pub addr: IpAddr,
    /// Authenticated (or offline) UUID.
    pub uuid: Uuid,
    /// Player name.
    pub name: &'a str,
    /// Profile properties such as skin textures.
    pub properties: &'a [Property],
}

/// How player identity reaches backends.
#[derive(Clone, Default)]
pub enum Forwarding {
    /// Backends see the proxy's address and the offline UUID.
    #[default]
    None,
    /// BungeeCord: identity packed into the handshake address.
    Legacy,
    /// Velocity: identity signed with a shared secret.
    Modern {
        /// HMAC key shared with the backends.
        secret: Bytes,
    },
}

impl std::fmt::Debug for Forwarding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Legacy => f.write_str("Legacy"),
            Self::Modern { .. } => f.debug_struct("Modern").finish_non_exhaustive(),
        }
    }
}

impl Forwarding {
    /// Build the forwarding mode from its configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown modes or a missing modern secret.
    pub fn from_settings(mode: &str, secret: Option<&str>) -> Result<Self, String> {
        match mode.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "legacy" | "bungeecord" => Ok(Self::Legacy),
            "modern" | "velocity" => {
                let secret = secret
                    .filter(|s| !s.is_empty())
                    .ok_or("FORWARDING_SECRET: required for modern forwarding")?;
                Ok(Self::Modern {
                    secret: Bytes::copy_from_slice(secret.as_bytes()),
                })
            }
            other => Err(format!(
                "FORWARDING: invalid value '{other}' (expected 'none', 'legacy' or 'modern')"
            )),
        }
    }

    /// The server address to put in the backend handshake.
    #[must_use]
    pub fn handshake_address(&self, host: &str, player: &ForwardedPlayer<'_>) -> String {
        match self {
            Self::Legacy => legacy_address(host, player),
            Self::None | Self::Modern { .. } => host.to_string(),
        }
    }

    /// Answer a login plugin request from a backend.
    ///
    /// Requests on channels the proxy does not speak get a failure reply, as
    /// a vanilla client would send.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Forwarding`] if the signing key is unusable.
    pub fn answer(
        &self,
        request: &LoginPluginRequest,
        player: &ForwardedPlayer<'_>,
    ) -> Result<LoginPluginResponse, BackendError> {
        match self {
            Self::Modern { secret } if request.channel == VELOCITY_CHANNEL => {
                let data = build_forwarding_data(secret, player)?;
                Ok(LoginPluginResponse::success(request.message_id, data))
            }
            _ => Ok(LoginPluginResponse::failure(request.message_id)),
        }
    }
}

/// BungeeCord host field: `host\0ip\0uuid[\0properties]`.
fn legacy_address(host: &str, player: &ForwardedPlayer<'_>) -> String {
    let mut address = format!("{host}\0{}\0{}", player.addr, player.uuid);

    if !player.properties.is_empty() {
        let properties: Vec<_> = player
            .properties
            .iter()
            .map(|p| {
                let mut value = serde_json::json!({ "name": p.name, "value": p.value });
                if let Some(signature) = &p.signature {
                    value["signature"] = serde_json::Value::from(signature.as_str());
                }
                value
            })
            .collect();
        address.push('\0');
        address.push_str(&serde_json::Value::from(properties).to_string());
    }

    address
}

/// Build Velocity modern forwarding data.
///
/// This creates the signed payload that the proxy sends to the backend server
/// to identify the authenticated player: the HMAC signature followed by the
/// forwarding data.
///
/// # Errors
///
/// Returns [`BackendError::Forwarding`] if the key is rejected.
pub fn build_forwarding_data(secret: &[u8], player: &ForwardedPlayer<'_>) -> Result<Bytes, BackendError> {
    let mut data = BytesMut::new();

    write_varint(&mut data, VELOCITY_FORWARDING_VERSION);
    write_string(&mut data, &player.addr.to_string());
    data.put_slice(player.uuid.as_bytes());
    write_string(&mut data, player.name);
    write_properties(&mut data, player.properties);

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| BackendError::Forwarding(format!("invalid secret: {e}")))?;
    mac.update(&data);
    let signature = mac.finalize().into_bytes();

    let mut result = BytesMut::with_capacity(signature.len() + data.len());
    result.put_slice(&signature);
    result.extend_from_slice(&data);

    Ok(result.freeze())
}

/// Write player properties to a buffer.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn write_properties(buf: &mut BytesMut, properties: &[Property]) {
    write_varint(buf, properties.len() as i32);

    for prop in properties {
        write_string(buf, &prop.name);
        write_string(buf, &prop.value);

        if let Some(sig) = &prop.signature {
            buf.put_u8(1);
            write_string(buf, sig);
        } else {
            buf.put_u8(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textures() -> Vec<Property> {
        vec![Property {
            name: "textures".to_string(),
            value: "base64encodeddata".to_string(),
            signature: Some("signaturedata".to_string()),
        }]
    }

    fn player<'a>(properties: &'a [Property]) -> ForwardedPlayer<'a> {
        ForwardedPlayer {
            addr: "192.168.1.100".parse().unwrap(),
            uuid: Uuid::new_v4(),
            name: "TestPlayer",
            properties,
        }
    }

    fn verify(secret: &[u8], data: &[u8]) -> bool {
        let (signature, payload) = data.split_at(32);
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(payload);
        mac.verify_slice(signature).is_ok()
    }

    #[test]
    fn test_build_forwarding_data() {
        let data = build_forwarding_data(b"test_secret", &player(&[])).unwrap();
        assert!(data.len() >= 32);
        assert!(verify(b"test_secret", &data));
        assert!(!verify(b"other_secret", &data));
    }

    #[test]
    fn test_build_forwarding_data_with_properties() {
        let properties = textures();
        let data = build_forwarding_data(b"test_secret", &player(&properties)).unwrap();
        assert!(verify(b"test_secret", &data));
    }

    #[test]
    fn test_legacy_address() {
        let player = player(&[]);
        let address = Forwarding::Legacy.handshake_address("mc.example.com", &player);
        let uuid = player.uuid.to_string();
        let parts: Vec<_> = address.split('\0').collect();
        assert_eq!(parts, vec!["mc.example.com", "192.168.1.100", uuid.as_str()]);

        let properties = textures();
        let player = ForwardedPlayer { properties: &properties, ..player };
        let address = Forwarding::Legacy.handshake_address("mc.example.com", &player);
        let json: serde_json::Value = serde_json::from_str(address.split('\0').nth(3).unwrap()).unwrap();
        assert_eq!(json[0]["name"], "textures");
        assert_eq!(json[0]["signature"], "signaturedata");

        assert_eq!(Forwarding::None.handshake_address("host", &player), "host");
    }

    #[test]
    fn test_answer_plugin_requests() {
        let forwarding = Forwarding::from_settings("modern", Some("s3cret")).unwrap();
        let player = player(&[]);

        let request = LoginPluginRequest::new(7, VELOCITY_CHANNEL, Bytes::new());
        let response = forwarding.answer(&request, &player).unwrap();
        assert_eq!(response.message_id, 7);
        assert!(verify(b"s3cret", &response.data.unwrap()));

        let request = LoginPluginRequest::new(8, "fml:handshake", Bytes::new());
        let response = forwarding.answer(&request, &player).unwrap();
        assert!(response.data.is_none());

        let request = LoginPluginRequest::new(9, VELOCITY_CHANNEL, Bytes::new());
        assert!(Forwarding::None.answer(&request, &player).unwrap().data.is_none());
    }

    #[test]
    fn test_from_settings() {
        assert!(matches!(Forwarding::from_settings("NONE", None), Ok(Forwarding::None)));
        assert!(matches!(Forwarding::from_settings("legacy", None), Ok(Forwarding::Legacy)));
        assert!(Forwarding::from_settings("modern", None).is_err());
        assert!(Forwarding::from_settings("modern", Some("")).is_err());
        assert!(Forwarding::from_settings("magic", None).is_err());
    }
}
