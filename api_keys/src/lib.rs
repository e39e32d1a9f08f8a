use std::sync::Arc;

use common::hash::Hasher;
use db::Store;

pub mod stages {
    pub mod identity;
    pub mod key;
}

pub mod service {
    pub mod key;
}

pub mod dtos {
    pub mod key;
}

use service::key::KeyValidator;
use stages::{identity::IdentityStage, key::KeyValidStage};

pub fn identity() -> IdentityStage {
    IdentityStage
}

/// Key validation for `project`; `ip_quota > 0` admits IP identities.
pub fn key_valid(store: Arc<dyn Store>, hasher: Arc<Hasher>, project: &str, ip_quota: f64) -> KeyValidStage {
    KeyValidStage::new(KeyValidator::new(store, hasher, project), ip_quota)
}
