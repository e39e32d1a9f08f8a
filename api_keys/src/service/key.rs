use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{
    error::{AppError, Res},
    hash::{Hasher, generate_secret},
    ip::ip_allowed,
};
use db::{
    Store,
    dtos::key::{KeyCreateRequest, KeyRef},
    models::key::ApiKey,
};
use uuid::Uuid;

use crate::dtos::key::{CreateKeyRequest, CreateKeyResponse, Validation};

/// Checks identities of one project against the key store.
#[derive(Clone)]
pub struct KeyValidator {
    store: Arc<dyn Store>,
    hasher: Arc<Hasher>,
    project: String,
}

impl KeyValidator {
    pub fn new(store: Arc<dyn Store>, hasher: Arc<Hasher>, project: &str) -> Self {
        Self {
            store,
            hasher,
            project: project.to_string(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn key_ref(&self, token: &str, manual: bool) -> KeyRef {
        KeyRef::new(&self.project, token, manual, &self.hasher)
    }

    /// Provisions the IP identity on first sight.
    pub async fn check_create_ip_key(&self, ip: &str, limit: f64) -> Res<Uuid> {
        self.store.check_create_ip_key(&self.project, ip, limit).await
    }

    /// Looks the key up and checks it for `ip`. Store failures are errors,
    /// everything else is a [`Validation`].
    pub async fn is_valid(&self, token: &str, manual: bool, ip: &str) -> Res<Validation> {
        match self.store.find_key(&self.key_ref(token, manual)).await? {
            Some(key) => check_key(&key, ip, Utc::now()),
            None => Ok(Validation::NotFound),
        }
    }
}

pub fn check_key(key: &ApiKey, ip: &str, now: DateTime<Utc>) -> Res<Validation> {
    if key.disabled {
        return Ok(Validation::Disabled);
    }
    if key.valid_to <= now {
        return Ok(Validation::Expired);
    }
    let allowed = ip_allowed(&key.ip_white_list, ip)
        .map_err(|e| AppError::Internal(format!("key {}: {}", key.id, e)))?;
    if !allowed {
        return Ok(Validation::IpNotAllowed);
    }
    Ok(Validation::Valid {
        key_id: key.id,
        tags: key.tags.clone(),
    })
}

/// Issues a new explicit key with a random secret.
pub async fn create_key(
    store: &dyn Store,
    hasher: &Hasher,
    project: &str,
    request: CreateKeyRequest,
) -> Res<CreateKeyResponse> {
    let secret = generate_secret();
    let key = store
        .create_key(KeyCreateRequest {
            project: project.to_string(),
            key_hash: hasher.hash_key(&secret),
            limit: request.limit,
            valid_to: request.valid_to,
            tags: request.tags,
            ip_white_list: request.ip_white_list,
            description: request.description,
            external_id: request.external_id,
        })
        .await?;
    log::info!("Created key {} in project '{}'", key.id, project);
    Ok(CreateKeyResponse { key, secret })
}

/// Soft delete: the key stays for accounting but fails validation.
pub async fn revoke_key(store: &dyn Store, key_id: Uuid) -> Res<ApiKey> {
    let key = store.set_disabled(key_id, true).await?;
    log::info!("Disabled key {}", key_id);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use db::MemoryStore;

    const SALT: &str = "0123456789012345678901234567890123456789";

    fn request(limit: f64) -> CreateKeyRequest {
        CreateKeyRequest {
            limit,
            valid_to: Utc::now() + TimeDelta::days(1),
            tags: vec!["x-voice:olga".into()],
            ip_white_list: String::new(),
            description: "test".into(),
            external_id: Some("cust-1".into()),
        }
    }

    #[tokio::test]
    async fn validates_issued_key() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hasher = Arc::new(Hasher::new(SALT).unwrap());
        let created = create_key(store.as_ref(), &hasher, "tts", request(10.0)).await.unwrap();
        assert_ne!(created.key.key_hash, created.secret);

        let validator = KeyValidator::new(store.clone(), hasher.clone(), "tts");
        assert_eq!(
            validator.is_valid(&created.secret, true, "1.2.3.4").await.unwrap(),
            Validation::Valid {
                key_id: created.key.id,
                tags: vec!["x-voice:olga".into()]
            }
        );
        assert_eq!(
            validator.is_valid("other", true, "1.2.3.4").await.unwrap(),
            Validation::NotFound
        );

        let other_project = KeyValidator::new(store.clone(), hasher, "asr");
        assert_eq!(
            other_project.is_valid(&created.secret, true, "1.2.3.4").await.unwrap(),
            Validation::NotFound
        );

        revoke_key(store.as_ref(), created.key.id).await.unwrap();
        assert_eq!(
            validator.is_valid(&created.secret, true, "1.2.3.4").await.unwrap(),
            Validation::Disabled
        );
    }

    #[tokio::test]
    async fn denies_expired_and_foreign_ip() {
        let store = Arc::new(MemoryStore::new());
        let hasher = Hasher::new(SALT).unwrap();
        let mut req = request(10.0);
        req.ip_white_list = "10.0.0.0/8".into();
        let created = create_key(store.as_ref(), &hasher, "tts", req).await.unwrap();

        let now = Utc::now();
        assert!(check_key(&created.key, "10.1.2.3", now).unwrap().is_valid());
        assert_eq!(check_key(&created.key, "11.1.2.3", now).unwrap(), Validation::IpNotAllowed);
        assert_eq!(check_key(&created.key, "", now).unwrap(), Validation::IpNotAllowed);
        assert_eq!(
            check_key(&created.key, "10.1.2.3", now + TimeDelta::days(2)).unwrap(),
            Validation::Expired
        );

        // a stored list that no longer parses is a server fault
        let mut broken = created.key.clone();
        broken.ip_white_list = "10.0.0.0/40".into();
        assert!(matches!(check_key(&broken, "10.1.2.3", now), Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn store_failure_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let validator = KeyValidator::new(store.clone(), Arc::new(Hasher::new(SALT).unwrap()), "tts");
        store.set_unavailable(true);
        assert!(validator.is_valid("k", true, "1.1.1.1").await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_white_list_on_create() {
        let store = MemoryStore::new();
        let hasher = Hasher::new(SALT).unwrap();
        let mut req = request(1.0);
        req.ip_white_list = "not-a-cidr".into();
        assert!(create_key(&store, &hasher, "tts", req).await.is_err());
    }
}
