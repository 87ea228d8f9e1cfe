//! Deterministic device fingerprints.
//!
//! A fingerprint is derived from a salt and the account id, so re-deriving
//! always yields the same device. It is persisted on the account the first
//! time the account logs in and never regenerated afterwards; the platform
//! treats a new device on every login as suspicious.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Client identities a fingerprint can present
const USER_AGENTS: &[&str] = &[
    "Instagram 309.1.0.41.113 Android (33/13; 420dpi; 1080x2400; samsung; SM-S911B; dm1q; qcom; en_US; 541635890)",
    "Instagram 309.1.0.41.113 Android (34/14; 480dpi; 1080x2340; Google; Pixel 8; shiba; shiba; en_US; 541635890)",
    "Instagram 309.1.0.41.113 Android (31/12; 440dpi; 1080x2400; Xiaomi; 2201116SG; veux; qcom; en_US; 541635890)",
    "Instagram 309.1.0.41.113 Android (33/13; 450dpi; 1080x2412; OnePlus; CPH2449; OP5961L1; qcom; en_US; 541635890)",
];

/// The simulated device an account logs in from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceFingerprint {
    /// `android-` followed by 16 hex digits
    pub device_id: String,
    pub uuid: String,
    pub phone_id: String,
    pub user_agent: String,
}

impl DeviceFingerprint {
    pub fn derive(salt: &str, account_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(b":");
        hasher.update(account_id.as_bytes());
        let digest = hasher.finalize();

        let device_id = format!("android-{}", to_hex(&digest[..8]));

        let mut first = [0u8; 16];
        first.copy_from_slice(&digest[..16]);
        let mut second = [0u8; 16];
        second.copy_from_slice(&digest[16..]);

        let user_agent = USER_AGENTS[digest[31] as usize % USER_AGENTS.len()];

        Self {
            device_id,
            uuid: uuid::Builder::from_random_bytes(first).into_uuid().to_string(),
            phone_id: uuid::Builder::from_random_bytes(second).into_uuid().to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    /// Parse back the UUID fields, for clients that need them typed
    pub fn uuids(&self) -> Option<(Uuid, Uuid)> {
        let uuid = Uuid::parse_str(&self.uuid).ok()?;
        let phone_id = Uuid::parse_str(&self.phone_id).ok()?;
        Some((uuid, phone_id))
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
