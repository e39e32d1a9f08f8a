use chrono::{DateTime, Utc};
use common::hash::Hasher;

/// Lookup identity of a key inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRef {
    pub project: String,
    pub hash: String,
    pub manual: bool,
}

impl KeyRef {
    /// Explicit keys are looked up by hash, IP identities by the IP itself.
    pub fn new(project: &str, token: &str, manual: bool, hasher: &Hasher) -> Self {
        Self {
            project: project.to_string(),
            hash: if manual {
                hasher.hash_key(token)
            } else {
                token.to_string()
            },
            manual,
        }
    }

    pub fn ip(project: &str, ip: &str) -> Self {
        Self {
            project: project.to_string(),
            hash: ip.to_string(),
            manual: false,
        }
    }
}

pub struct KeyCreateRequest {
    pub project: String,
    pub key_hash: String,
    pub limit: f64,
    pub valid_to: DateTime<Utc>,
    pub tags: Vec<String>,
    pub ip_white_list: String,
    pub description: String,
    pub external_id: Option<String>,
}
