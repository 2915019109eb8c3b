//! # Keywarden
//!
//! **API key gatekeeping for Rust services.**
//!
//! Keywarden decides, per request, whether a caller holding an API key may
//! proceed, and meters what it consumes. It runs on the host's tokio
//! runtime and keeps its state in SQLite.
//!
//! ## Features
//!
//! - **Hashed keys**: only the SHA-256 of a key is stored; raw keys are shown once at issuance
//! - **Network allow-lists**: registered domain, suffix-matched domains, exact IPs and IPv4 CIDR ranges
//! - **Tiered rate limits**: fixed windows per key, updated by a single atomic upsert
//! - **Monthly quotas**: purchased add-on capacity first, then a grace band, then rejection
//! - **Audited monthly reset**: idempotent, batch-wise, safe to run twice
//!
//! ## Quickstart
//!
//! ```no_run
//! use keywarden::{CallOutcome, Gatekeeper, KeywardenConfig, LogNotifier, RequestContext, Store};
//! use std::sync::Arc;
//!
//! # async fn run(ctx: RequestContext) -> Result<(), keywarden::KeywardenError> {
//! let config = KeywardenConfig::default();
//! let store = Store::from_config(&config).await?;
//! let gatekeeper = Gatekeeper::new(config, store, Arc::new(LogNotifier))?;
//!
//! match gatekeeper.admit(&ctx).await {
//!     Ok(admission) => {
//!         // ... serve the request, adding admission.headers() to the response ...
//!         gatekeeper.complete(&admission, CallOutcome::Success);
//!     }
//!     Err(rejection) => {
//!         let response = keywarden::Rejection::from(&rejection);
//!         println!("{} {:?}", response.status, response.body);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Monthly reset
//!
//! Build the scheduler from the gatekeeper with an [`AccountDirectory`]
//! that knows each account's plan, and spawn it:
//!
//! ```no_run
//! # use keywarden::{Gatekeeper, StaticAccountDirectory};
//! # use std::sync::Arc;
//! # async fn run(gatekeeper: Gatekeeper) {
//! let handle = gatekeeper
//!     .reset_scheduler(Arc::new(StaticAccountDirectory::new()))
//!     .spawn();
//! // ...
//! handle.shutdown().await;
//! # }
//! ```
//!
//! See [`KeywardenConfig`] for the tunables.

#![deny(missing_docs)]
#![doc(html_root_url = "https://docs.rs/keywarden/0.1.0")]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;
pub mod model;

// Crypto layer
pub mod crypto;

// Storage layer
pub mod store;

// Authentication and policy layers
pub mod auth;
pub mod policy;

// Metering layer
pub mod meter;

// Collaborators
pub mod client;

// Quota reset
pub mod scheduler;

// Protocol layer
pub mod protocol;

// Gatekeeper (main public API)
pub mod gatekeeper;

// Re-exports for public API
pub use auth::{IssuedKey, KeyResolver, NewApiKey};
pub use client::{
    AccountDirectory, AccountPlan, LogNotifier, Notification, Notifier, StaticAccountDirectory,
};
pub use client::http::{HttpAccountDirectory, WebhookNotifier};
pub use clock::{Clock, SystemClock};
pub use config::KeywardenConfig;
pub use errors::KeywardenError;
pub use gatekeeper::{Admission, Gatekeeper};
pub use meter::{AddOnLedger, QuotaAccountant, QuotaDecision, RateLimitStatus, RateLimiter};
pub use model::{
    AddOnGrant, AddOnPackage, ApiKeyRecord, ApiScope, CallOutcome, ExecutionStatus, MonthlyUsage,
    QuotaResetAuditRecord, QuotaStatus, RateLimitTier, TriggerSource, UsageSnapshot,
};
pub use policy::{AccessGuard, MatchInfo, RequestContext};
pub use protocol::{Rejection, RejectionBody};
pub use scheduler::{
    Maintenance, MaintenanceReport, QuotaResetJob, ResetReport, ResetScheduler, SchedulerHandle,
    SchedulerState,
};
pub use store::Store;

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
