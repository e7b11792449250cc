//! HMAC-SHA256 authentication of critical messages.
//!
//! The coordinator distributes a hex-encoded secret in `agent_connect_ack`.
//! Until one is installed the signer is transparent in both directions so
//! that coordinators without signing support keep working.

use ab_protocol::{rfc3339_nano, AgentMessage};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::types::BridgeError;

type HmacSha256 = Hmac<Sha256>;

/// Signs outbound and verifies inbound critical messages.
#[derive(Default)]
pub struct MessageSigner {
    secret: RwLock<Option<Vec<u8>>>,
}

impl std::fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSigner")
            .field("has_secret", &self.has_secret())
            .finish()
    }
}

impl MessageSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        let signer = Self::new();
        signer.set_secret(secret);
        signer
    }

    pub fn set_secret(&self, secret: impl Into<Vec<u8>>) {
        *self.secret.write() = Some(secret.into());
    }

    /// Install a secret received as hex. Malformed or empty input is a
    /// configuration error and leaves the current secret untouched.
    pub fn set_secret_hex(&self, secret_hex: &str) -> Result<(), BridgeError> {
        let trimmed = secret_hex.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::Config("signing secret is empty".into()));
        }
        let bytes = hex::decode(trimmed)
            .map_err(|e| BridgeError::Config(format!("signing secret is not valid hex: {e}")))?;
        self.set_secret(bytes);
        Ok(())
    }

    pub fn clear_secret(&self) {
        *self.secret.write() = None;
    }

    pub fn has_secret(&self) -> bool {
        self.secret.read().is_some()
    }

    /// Attach a signature to critical messages when a secret is installed.
    /// Every other message passes through unchanged.
    pub fn sign(&self, msg: &mut AgentMessage) {
        if !msg.is_critical() {
            return;
        }
        let guard = self.secret.read();
        let Some(secret) = guard.as_deref() else {
            return;
        };
        if let Some(mac) = compute_mac(secret, &signing_input(msg)) {
            msg.signature = Some(hex::encode(mac));
        }
    }

    /// Check a message's signature, re-encoding the payload to recover the
    /// signed bytes. Always `true` without a secret or for non-critical
    /// types. For critical types a missing or malformed signature fails.
    pub fn verify(&self, msg: &AgentMessage) -> bool {
        self.check(msg, || signing_input(msg))
    }

    /// Check a decoded message against the payload bytes of the frame it
    /// arrived in (see [`ab_protocol::raw_payload`]).
    pub fn verify_received(&self, msg: &AgentMessage, raw_payload: Option<&str>) -> bool {
        self.check(msg, || signing_input_for(msg, raw_payload.unwrap_or_default()))
    }

    fn check(&self, msg: &AgentMessage, input: impl FnOnce() -> String) -> bool {
        if !msg.is_critical() {
            return true;
        }
        let guard = self.secret.read();
        let Some(secret) = guard.as_deref() else {
            return true;
        };
        let Some(provided) = msg.signature.as_deref().filter(|s| !s.is_empty()) else {
            return false;
        };
        let Ok(provided) = hex::decode(provided) else {
            return false;
        };
        let Some(expected) = compute_mac(secret, &input()) else {
            return false;
        };
        expected.ct_eq(&provided).into()
    }
}

/// The exact bytes covered by a signature:
/// `type|id|timestamp(RFC 3339, ns)|payload`, with the payload in the
/// compact encoding this crate writes on the wire.
pub fn signing_input(msg: &AgentMessage) -> String {
    let payload = if msg.payload.is_null() {
        String::new()
    } else {
        msg.payload.to_string()
    };
    signing_input_for(msg, &payload)
}

/// Like [`signing_input`], over payload bytes supplied by the caller.
pub fn signing_input_for(msg: &AgentMessage, payload: &str) -> String {
    format!(
        "{}|{}|{}|{}",
        msg.msg_type,
        msg.id,
        rfc3339_nano(&msg.timestamp),
        payload
    )
}

fn compute_mac(secret: &[u8], input: &str) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(input.as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}
