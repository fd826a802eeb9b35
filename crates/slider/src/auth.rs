//! Player authentication.
//!
//! Online mode runs the full Mojang flow:
//! 1. Send the proxy's RSA public key and a verify token
//! 2. Decrypt the shared secret and token the client sends back
//! 3. Verify the session with Mojang's sessionserver API
//!
//! Enabling AES-128-CFB8 on the connection is left to the caller. Offline
//! mode derives the UUID from the player name, the way vanilla servers do.

use std::io;

use bytes::Bytes;
use md5::Md5;
use num_bigint::BigInt;
use rand::Rng;
use rsa::pkcs8::EncodePublicKey;
use rsa::rand_core::OsRng;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use slider_mc::cipher::SHARED_SECRET_LEN;
use slider_mc::packets::Property;

/// RSA key size in bits.
const RSA_KEY_SIZE: usize = 1024;

/// Verify token size in bytes.
const VERIFY_TOKEN_SIZE: usize = 4;

/// Mojang session server URL.
const SESSION_SERVER_URL: &str = "https://sessionserver.mojang.com/session/minecraft/hasJoined";

/// Error type for authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("PKCS8 error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::spki::Error),

    #[error("Verify token mismatch")]
    VerifyTokenMismatch,

    #[error("Shared secret has {0} bytes, expected 16")]
    InvalidSharedSecret(usize),

    #[error("Session verification failed: {0}")]
    SessionVerification(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Authentication keypair for online-mode.
pub struct AuthKeys {
    /// RSA private key for decryption.
    private_key: RsaPrivateKey,
    /// RSA public key for encryption (DER-encoded).
    public_key_der: Bytes,
    /// Random verify token.
    verify_token: [u8; VERIFY_TOKEN_SIZE],
}

impl AuthKeys {
    /// Generate a new authentication keypair.
    ///
    /// # Errors
    ///
    /// Returns an error if RSA key generation fails.
    pub fn generate() -> Result<Self, AuthError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_SIZE)?;
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_der = public_key.to_public_key_der()?.into_vec();

        let mut verify_token = [0u8; VERIFY_TOKEN_SIZE];
        rand::rng().fill(&mut verify_token);

        Ok(Self {
            private_key,
            public_key_der: Bytes::from(public_key_der),
            verify_token,
        })
    }

    /// Get the DER-encoded public key.
    #[must_use]
    pub fn public_key_der(&self) -> Bytes {
        self.public_key_der.clone()
    }

    /// Get the verify token.
    #[must_use]
    pub fn verify_token(&self) -> Bytes {
        Bytes::copy_from_slice(&self.verify_token)
    }

    /// Decrypt the shared secret and verify token from the client.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption fails, the verify token doesn't match
    /// or the secret is not 16 bytes long.
    pub fn decrypt_response(
        &self,
        encrypted_secret: &[u8],
        encrypted_token: &[u8],
    ) -> Result<[u8; SHARED_SECRET_LEN], AuthError> {
        let shared_secret = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, encrypted_secret)?;

        let decrypted_token = self.private_key.decrypt(Pkcs1v15Encrypt, encrypted_token)?;
        if decrypted_token != self.verify_token {
            return Err(AuthError::VerifyTokenMismatch);
        }

        <[u8; SHARED_SECRET_LEN]>::try_from(shared_secret.as_slice())
            .map_err(|_| AuthError::InvalidSharedSecret(shared_secret.len()))
    }

    /// Calculate the server hash for Mojang session verification.
    ///
    /// The hash is calculated as: `SHA1(server_id + shared_secret + public_key)`
    /// and formatted as a signed hex string (Minecraft's non-standard format).
    #[must_use]
    pub fn calculate_server_hash(&self, shared_secret: &[u8; SHARED_SECRET_LEN]) -> String {
        let mut hasher = Sha1::new();

        // Server ID is empty string for online-mode
        hasher.update(b"");
        hasher.update(shared_secret);
        hasher.update(&self.public_key_der);

        minecraft_hex_digest(&hasher.finalize())
    }
}

impl std::fmt::Debug for AuthKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKeys").finish_non_exhaustive()
    }
}

/// How players prove who they are.
#[derive(Debug)]
pub enum Authenticator {
    /// Mojang session verification with an encrypted connection.
    Online(AuthKeys),
    /// Names are trusted and UUIDs derived from them.
    Offline,
}

impl Authenticator {
    /// Build the authenticator for the configured mode.
    ///
    /// # Errors
    ///
    /// Returns an error if online mode keys cannot be generated.
    pub fn new(online_mode: bool) -> Result<Self, AuthError> {
        if online_mode {
            Ok(Self::Online(AuthKeys::generate()?))
        } else {
            Ok(Self::Offline)
        }
    }
}

/// Player profile returned from Mojang session verification.
#[derive(Debug, Clone)]
pub struct PlayerProfile {
    /// Player UUID.
    pub uuid: Uuid,
    /// Player username.
    pub username: String,
    /// Player properties (e.g., skin textures).
    pub properties: Vec<Property>,
}

impl PlayerProfile {
    /// Profile of an offline-mode player.
    #[must_use]
    pub fn offline(username: &str) -> Self {
        Self {
            uuid: offline_uuid(username),
            username: username.to_string(),
            properties: Vec::new(),
        }
    }
}

/// Response from Mojang session server.
#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    name: String,
    #[serde(default)]
    properties: Vec<SessionProperty>,
}

#[derive(Debug, Deserialize)]
struct SessionProperty {
    name: String,
    value: String,
    signature: Option<String>,
}

/// Verify a player's session with Mojang's session server.
///
/// # Errors
///
/// Returns an error if verification fails or the session is invalid.
pub async fn verify_session(
    username: &str,
    server_hash: &str,
    client_ip: Option<&str>,
) -> Result<PlayerProfile, AuthError> {
    let client = reqwest::Client::new();

    let mut query = vec![("username", username), ("serverId", server_hash)];
    if let Some(ip) = client_ip {
        query.push(("ip", ip));
    }

    let response = client.get(SESSION_SERVER_URL).query(&query).send().await?;

    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Err(AuthError::SessionVerification(
            "Session not found (player may not have authenticated with Mojang)".to_string(),
        ));
    }

    if !response.status().is_success() {
        return Err(AuthError::SessionVerification(format!(
            "Session server returned status {}",
            response.status()
        )));
    }

    let session: SessionResponse = response.json().await?;

    // Mojang returns the UUID without hyphens
    let uuid = Uuid::parse_str(&session.id).map_err(|e| {
        AuthError::SessionVerification(format!("Invalid UUID from session server: {e}"))
    })?;

    let properties = session
        .properties
        .into_iter()
        .map(|p| Property {
            name: p.name,
            value: p.value,
            signature: p.signature,
        })
        .collect();

    Ok(PlayerProfile {
        uuid,
        username: session.name,
        properties,
    })
}

/// The UUID vanilla servers give an offline player: an MD5 name-based
/// (version 3) UUID of `OfflinePlayer:<name>` without a namespace.
#[must_use]
pub fn offline_uuid(username: &str) -> Uuid {
    let digest = Md5::digest(format!("OfflinePlayer:{username}").as_bytes());
    uuid::Builder::from_md5_bytes(digest.into()).into_uuid()
}

/// Convert a SHA1 hash to Minecraft's signed hex digest format.
///
/// Minecraft uses a non-standard format where the hash is treated as a
/// two's complement signed number and converted to hex without leading zeros.
fn minecraft_hex_digest(hash: &[u8]) -> String {
    let bigint = BigInt::from_signed_bytes_be(hash);
    format!("{bigint:x}")
}
