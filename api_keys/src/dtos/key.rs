use uuid::Uuid;

use db::models::key::ApiKey;

/// Result of checking a key. Denials are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid { key_id: Uuid, tags: Vec<String> },
    NotFound,
    Disabled,
    Expired,
    IpNotAllowed,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid { .. })
    }

    /// Client facing reason of a denial.
    pub fn reason(&self) -> &'static str {
        match self {
            Validation::Valid { .. } => "valid",
            Validation::NotFound => "Key not found",
            Validation::Disabled => "Key disabled",
            Validation::Expired => "Key expired",
            Validation::IpNotAllowed => "IP not allowed",
        }
    }
}

pub struct CreateKeyRequest {
    pub limit: f64,
    pub valid_to: chrono::DateTime<chrono::Utc>,
    pub tags: Vec<String>,
    pub ip_white_list: String,
    pub description: String,
    pub external_id: Option<String>,
}

/// A freshly issued key. `secret` is shown once and never stored.
pub struct CreateKeyResponse {
    pub key: ApiKey,
    pub secret: String,
}
