//! Gatekeeper - the main public API for Keywarden.
//!
//! The `Gatekeeper` runs the request path in order:
//! - Key resolution (hash lookup and usability)
//! - Network restrictions (domain or IP allow-lists)
//! - Rate limiting (per-tier window)
//! - Monthly quota (with add-on and grace overage)
//!
//! After the host has served the request, the outcome is recorded against
//! the monthly quota in the background.

use crate::auth::{extract_api_key, KeyResolver};
use crate::client::{AccountDirectory, Notifier};
use crate::clock::{Clock, SystemClock};
use crate::config::KeywardenConfig;
use crate::meter::{AddOnLedger, QuotaAccountant, QuotaDecision, RateLimitStatus, RateLimiter};
use crate::model::{ApiKeyRecord, ApiScope, CallOutcome, UsageSnapshot};
use crate::policy::{AccessGuard, MatchInfo, RequestContext};
use crate::protocol::headers::{insert_quota_headers, insert_rate_limit_headers};
use crate::scheduler::{Maintenance, QuotaResetJob, ResetScheduler};
use crate::store::Store;
use crate::KeywardenError;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tracing::debug;

/// An admitted request.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The authenticated key.
    pub key: ApiKeyRecord,
    /// Which network rule admitted the request.
    pub matched: MatchInfo,
    /// Rate-limit position after counting this request.
    pub rate_limit: RateLimitStatus,
    /// Quota decision for this request.
    pub quota: QuotaDecision,
}

impl Admission {
    /// Write the `X-RateLimit-*` and `X-Quota-*` response headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        insert_rate_limit_headers(headers, &self.rate_limit);
        insert_quota_headers(headers, self.quota.status(), self.quota.overage());
    }

    /// Response headers as a fresh map.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply_headers(&mut headers);
        headers
    }
}

/// Main gatekeeping facade for Keywarden.
///
/// Create one instance per service and share it across requests.
pub struct Gatekeeper {
    config: KeywardenConfig,
    clock: Arc<dyn Clock>,
    store: Store,
    notifier: Arc<dyn Notifier>,
    resolver: KeyResolver,
    guard: AccessGuard,
    limiter: RateLimiter,
    accountant: QuotaAccountant,
    ledger: AddOnLedger,
}

impl Gatekeeper {
    /// Create a gatekeeper over an opened store.
    ///
    /// Uses the system clock for time operations.
    ///
    /// # Errors
    /// Returns an error if configuration validation fails.
    pub fn new(
        config: KeywardenConfig,
        store: Store,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, KeywardenError> {
        config.validate()?;
        Ok(Self::with_clock(config, store, notifier, Arc::new(SystemClock)))
    }

    /// Create a gatekeeper with a custom clock (for testing).
    #[cfg(any(test, feature = "test-seams"))]
    pub fn new_with_clock(
        config: KeywardenConfig,
        store: Store,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KeywardenError> {
        config.validate()?;
        Ok(Self::with_clock(config, store, notifier, clock))
    }

    fn with_clock(
        config: KeywardenConfig,
        store: Store,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resolver = KeyResolver::new(store.clone(), clock.clone(), config.key_prefix.clone());
        let guard = AccessGuard::new(&config);
        let limiter = RateLimiter::new(store.clone(), clock.clone());
        let accountant =
            QuotaAccountant::new(&config, store.clone(), clock.clone(), notifier.clone());
        let ledger = AddOnLedger::new(store.clone(), clock.clone(), notifier.clone());

        Self {
            config,
            clock,
            store,
            notifier,
            resolver,
            guard,
            limiter,
            accountant,
            ledger,
        }
    }

    /// Admit a request or reject it.
    ///
    /// # Errors
    /// - `MissingKey` - no key in the request
    /// - `InvalidKey` / `InactiveKey` / `RevokedKey` / `ExpiredKey` - key not usable
    /// - `DomainNotAllowed` / `IpNotAllowed` - network restrictions not met
    /// - `RateLimitExceeded` - tier ceiling reached for the current window
    /// - `QuotaExceeded` / `GraceExceeded` / `AddOnDepleted` - monthly quota exhausted
    pub async fn admit(&self, ctx: &RequestContext) -> Result<Admission, KeywardenError> {
        self.admit_inner(ctx, None).await
    }

    /// Like [`Gatekeeper::admit`], and additionally require a scope.
    ///
    /// # Errors
    /// As `admit`, plus `ScopeNotGranted`.
    pub async fn admit_with_scope(
        &self,
        ctx: &RequestContext,
        scope: ApiScope,
    ) -> Result<Admission, KeywardenError> {
        self.admit_inner(ctx, Some(scope)).await
    }

    async fn admit_inner(
        &self,
        ctx: &RequestContext,
        scope: Option<ApiScope>,
    ) -> Result<Admission, KeywardenError> {
        let raw_key = extract_api_key(ctx, &self.config.api_key_header)?;
        let key = self.resolver.authenticate(raw_key).await?;

        if let Some(scope) = scope {
            key.require_scope(scope)?;
        }

        let matched = self.guard.validate(&key, ctx)?;
        let rate_limit = self.limiter.check(&key.key_hash, key.tier).await?;
        let quota = self.accountant.evaluate(&key).await?;

        debug!(
            key_id = %key.id,
            account_id = %key.account_id,
            overage = quota.overage().unwrap_or("none"),
            "Request admitted"
        );
        Ok(Admission {
            key,
            matched,
            rate_limit,
            quota,
        })
    }

    /// Record the outcome of an admitted request in the background.
    pub fn complete(&self, admission: &Admission, outcome: CallOutcome) {
        self.accountant
            .record_in_background(&admission.key.id, &admission.key.account_id, outcome);
    }

    /// Record the outcome of an admitted request and wait for the counters.
    pub async fn complete_now(
        &self,
        admission: &Admission,
        outcome: CallOutcome,
    ) -> Result<UsageSnapshot, KeywardenError> {
        self.accountant
            .record(&admission.key.id, &admission.key.account_id, outcome)
            .await
    }

    /// Build the monthly reset job over this gatekeeper's store.
    pub fn reset_job(&self, directory: Arc<dyn AccountDirectory>) -> QuotaResetJob {
        QuotaResetJob::new(
            &self.config,
            self.store.clone(),
            directory,
            self.notifier.clone(),
            self.clock.clone(),
        )
    }

    /// Build the background reset scheduler (not yet spawned).
    pub fn reset_scheduler(&self, directory: Arc<dyn AccountDirectory>) -> ResetScheduler {
        let maintenance = Maintenance::new(
            &self.config,
            self.limiter.clone(),
            self.ledger.clone(),
            self.accountant.clone(),
            self.clock.clone(),
        );
        ResetScheduler::new(
            self.reset_job(directory),
            maintenance,
            self.clock.clone(),
            self.config.run_reset_on_startup,
        )
    }

    /// Key lifecycle management.
    pub fn keys(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Add-on grants.
    pub fn add_ons(&self) -> &AddOnLedger {
        &self.ledger
    }

    /// Monthly quota queries.
    pub fn quota(&self) -> &QuotaAccountant {
        &self.accountant
    }

    /// Rate-limit queries.
    pub fn rate_limits(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Get the current configuration.
    pub fn config(&self) -> &KeywardenConfig {
        &self.config
    }
}
