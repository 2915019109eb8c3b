//! Key Resolver: authenticate presented keys and manage key lifecycle.

use crate::clock::Clock;
use crate::crypto::digest::hash_api_key;
use crate::crypto::keygen::{display_prefix, generate_api_key};
use crate::model::{ApiKeyRecord, ApiScope, RateLimitTier};
use crate::policy::network::{validate_domain_entry, validate_ip_entry};
use crate::store::Store;
use crate::KeywardenError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parameters for issuing a key.
#[derive(Debug, Clone, Deserialize)]
pub struct NewApiKey {
    /// Human-readable label.
    pub name: String,
    /// Owning account.
    pub account_id: String,
    /// Rate-limit tier.
    pub tier: RateLimitTier,
    /// Granted scopes.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<ApiScope>,
    /// Primary domain the key is registered for.
    #[serde(default)]
    pub registered_domain: Option<String>,
    /// Allowed client IPs and IPv4 CIDR ranges.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Allowed calling domains.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Expiry time.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_scopes() -> Vec<ApiScope> {
    vec![ApiScope::Read]
}

impl NewApiKey {
    /// Unrestricted read-only key with no expiry.
    pub fn new(name: impl Into<String>, account_id: impl Into<String>, tier: RateLimitTier) -> Self {
        Self {
            name: name.into(),
            account_id: account_id.into(),
            tier,
            scopes: default_scopes(),
            registered_domain: None,
            allowed_ips: Vec::new(),
            allowed_domains: Vec::new(),
            expires_at: None,
        }
    }
}

/// A freshly generated secret and the record stored for it.
///
/// The raw key is only ever available here.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    /// The raw secret to hand to the client.
    pub raw_key: String,
    /// Stored record (holds only the hash).
    pub record: ApiKeyRecord,
}

/// Resolves presented keys to records and manages their lifecycle.
pub struct KeyResolver {
    store: Store,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl KeyResolver {
    /// Create a resolver over the given store.
    pub fn new(store: Store, clock: Arc<dyn Clock>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
        }
    }

    /// Authenticate a raw key.
    ///
    /// On success a `last_used_at` update is spawned in the background; its
    /// failure is logged and dropped.
    ///
    /// # Errors
    /// - `InvalidKey` - blank input or no key with that hash
    /// - `InactiveKey` - the key was deactivated
    /// - `RevokedKey` - the key was revoked
    /// - `ExpiredKey` - the key is past its expiry
    pub async fn authenticate(&self, raw_key: &str) -> Result<ApiKeyRecord, KeywardenError> {
        if raw_key.trim().is_empty() {
            return Err(KeywardenError::InvalidKey);
        }

        let key_hash = hash_api_key(raw_key);
        let key = self
            .store
            .find_key_by_hash(&key_hash)
            .await?
            .ok_or(KeywardenError::InvalidKey)?;

        let now = self.clock.now_utc();
        if let Err(e) = key.check_usable(now) {
            warn!(key_id = %key.id, account_id = %key.account_id, error = %e, "API key rejected");
            return Err(e);
        }

        let store = self.store.clone();
        let key_id = key.id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_key_last_used(&key_id, now).await {
                warn!(key_id = %key_id, error = %e, "Failed to update last_used_at");
            }
        });

        debug!(key_id = %key.id, account_id = %key.account_id, "API key authenticated");
        Ok(key)
    }

    /// Issue a new key. Allow-list entries are validated and normalized.
    ///
    /// # Errors
    /// - `InvalidAllowListEntry` - an IP, CIDR, or domain entry is malformed
    pub async fn issue(&self, request: NewApiKey) -> Result<IssuedKey, KeywardenError> {
        let allowed_ips = request
            .allowed_ips
            .iter()
            .map(|entry| validate_ip_entry(entry))
            .collect::<Result<Vec<_>, _>>()?;
        let allowed_domains = request
            .allowed_domains
            .iter()
            .map(|entry| validate_domain_entry(entry))
            .collect::<Result<Vec<_>, _>>()?;
        let registered_domain = request
            .registered_domain
            .as_deref()
            .map(validate_domain_entry)
            .transpose()?;

        let raw_key = generate_api_key(&self.key_prefix);
        let now = self.clock.now_utc();
        let mut seen = HashSet::new();
        let scopes: Vec<ApiScope> = request
            .scopes
            .into_iter()
            .filter(|scope| seen.insert(*scope))
            .collect();

        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            key_hash: hash_api_key(&raw_key),
            key_prefix: display_prefix(&raw_key),
            name: request.name,
            account_id: request.account_id,
            active: true,
            expires_at: request.expires_at,
            revoked_at: None,
            registered_domain,
            allowed_ips,
            allowed_domains,
            tier: request.tier,
            scopes,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        };

        self.store.insert_key(&record).await?;
        info!(key_id = %record.id, account_id = %record.account_id, tier = %record.tier, "API key issued");

        Ok(IssuedKey { raw_key, record })
    }

    /// Replace a key's secret. The old secret stops authenticating immediately.
    pub async fn rotate(&self, key_id: &str) -> Result<IssuedKey, KeywardenError> {
        let raw_key = generate_api_key(&self.key_prefix);
        let now = self.clock.now_utc();

        let found = self
            .store
            .replace_key_hash(key_id, &hash_api_key(&raw_key), &display_prefix(&raw_key), now)
            .await?;
        if !found {
            return Err(KeywardenError::KeyNotFound(key_id.to_string()));
        }

        let record = self.find(key_id).await?;
        info!(key_id, account_id = %record.account_id, "API key rotated");
        Ok(IssuedKey { raw_key, record })
    }

    /// Revoke a key permanently.
    pub async fn revoke(&self, key_id: &str) -> Result<(), KeywardenError> {
        let found = self.store.revoke_key(key_id, self.clock.now_utc()).await?;
        self.expect_found(found, key_id, "API key revoked")
    }

    /// Deactivate a key (reversible).
    pub async fn deactivate(&self, key_id: &str) -> Result<(), KeywardenError> {
        let found = self
            .store
            .set_key_active(key_id, false, self.clock.now_utc())
            .await?;
        self.expect_found(found, key_id, "API key deactivated")
    }

    /// Reactivate a deactivated key. Revocation is not undone.
    pub async fn activate(&self, key_id: &str) -> Result<(), KeywardenError> {
        let found = self
            .store
            .set_key_active(key_id, true, self.clock.now_utc())
            .await?;
        self.expect_found(found, key_id, "API key activated")
    }

    /// Set or clear a key's expiry.
    pub async fn set_expiry(
        &self,
        key_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), KeywardenError> {
        let found = self
            .store
            .set_key_expiry(key_id, expires_at, self.clock.now_utc())
            .await?;
        self.expect_found(found, key_id, "API key expiry updated")
    }

    /// Load a key by id.
    pub async fn find(&self, key_id: &str) -> Result<ApiKeyRecord, KeywardenError> {
        self.store
            .find_key(key_id)
            .await?
            .ok_or_else(|| KeywardenError::KeyNotFound(key_id.to_string()))
    }

    /// All keys of an account.
    pub async fn list_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<ApiKeyRecord>, KeywardenError> {
        self.store.list_keys_for_account(account_id).await
    }

    fn expect_found(&self, found: bool, key_id: &str, event: &str) -> Result<(), KeywardenError> {
        if found {
            info!(key_id, "{}", event);
            Ok(())
        } else {
            Err(KeywardenError::KeyNotFound(key_id.to_string()))
        }
    }
}
