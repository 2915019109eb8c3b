//! Housekeeping run after each monthly reset.

use crate::clock::Clock;
use crate::config::KeywardenConfig;
use crate::meter::{AddOnLedger, QuotaAccountant, RateLimiter};
use crate::model::usage::month_before;
use crate::KeywardenError;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// What a maintenance pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Closed rate-limit windows deleted.
    pub windows_purged: u64,
    /// Add-on grants deactivated at expiry.
    pub grants_expired: usize,
    /// Monthly usage rows deleted past retention.
    pub usage_rows_purged: u64,
}

/// Purges closed windows, expires add-ons, and trims usage history.
#[derive(Clone)]
pub struct Maintenance {
    limiter: RateLimiter,
    ledger: AddOnLedger,
    accountant: QuotaAccountant,
    clock: Arc<dyn Clock>,
    retention_months: u32,
}

impl Maintenance {
    /// Create a maintenance task over the metering components.
    pub fn new(
        config: &KeywardenConfig,
        limiter: RateLimiter,
        ledger: AddOnLedger,
        accountant: QuotaAccountant,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            ledger,
            accountant,
            clock,
            retention_months: config.usage_retention_months,
        }
    }

    /// Run one maintenance pass.
    pub async fn run(&self) -> Result<MaintenanceReport, KeywardenError> {
        let windows_purged = self.limiter.purge_expired().await?;
        let grants_expired = self.ledger.sweep_expired().await?.len();

        let cutoff = month_before(&self.clock.now_utc(), self.retention_months);
        let usage_rows_purged = self.accountant.purge_before(&cutoff).await?;

        let report = MaintenanceReport {
            windows_purged,
            grants_expired,
            usage_rows_purged,
        };
        info!(
            windows_purged,
            grants_expired,
            usage_rows_purged,
            retention_cutoff = %cutoff,
            "Maintenance finished"
        );
        Ok(report)
    }
}
