//! Cryptographic utilities for Huddle Server
//!
//! Server-side crypto is minimal - only for:
//! - Session token issue and lookup hashing
//! - User and device id generation
//! - Time-limited TURN credentials

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use ring::{digest, hmac};

const USER_ID_LENGTH: usize = 8;
const SESSION_TOKEN_LENGTH: usize = 32;
const DEVICE_ID_LENGTH: usize = 16;

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random user ID (8 characters, alphanumeric)
pub fn generate_user_id() -> String {
    let chars: Vec<char> = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz"
        .chars()
        .collect();

    random_bytes::<USER_ID_LENGTH>()
        .iter()
        .map(|b| chars[(*b as usize) % chars.len()])
        .collect()
}

/// Generate a session token (base64url, 32 bytes)
pub fn generate_session_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<SESSION_TOKEN_LENGTH>())
}

pub fn generate_device_id() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<DEVICE_ID_LENGTH>())
}

/// Tokens are stored and looked up by their SHA-256.
pub fn hash_token(token: &str) -> String {
    let hash = digest::digest(&digest::SHA256, token.as_bytes());
    hex::encode(hash.as_ref())
}

/// Generate TURN credentials with time-limited validity (TURN REST API
/// scheme: `expiry:username`, HMAC-SHA1 keyed with the shared secret).
pub fn generate_turn_credentials(username: &str, secret: &str, ttl_seconds: u64) -> (String, String) {
    let expires = Utc::now().timestamp() as u64 + ttl_seconds;
    let turn_username = format!("{}:{}", expires, username);
    let turn_credential = sign_turn_username(&turn_username, secret);
    (turn_username, turn_credential)
}

fn sign_turn_username(turn_username: &str, secret: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let signature = hmac::sign(&key, turn_username.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(signature.as_ref())
}
