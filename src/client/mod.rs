//! External collaborators: the account directory and the notifier.
//!
//! Both are traits so the host can plug in its own services; in-process
//! and HTTP implementations are provided.

pub mod http;

use crate::KeywardenError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Subscription plan of an account, as far as quota is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPlan {
    /// Account id.
    pub account_id: String,
    /// Plan name, for logs.
    pub plan_name: String,
    /// Monthly request allowance (`-1` = unlimited).
    pub monthly_allowance: i64,
}

/// Source of truth for account plans.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Current plan of an account, or `None` when the account is unknown.
    async fn current_plan(&self, account_id: &str) -> Result<Option<AccountPlan>, KeywardenError>;
}

/// In-process account directory built up front.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountDirectory {
    plans: HashMap<String, AccountPlan>,
}

impl StaticAccountDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an account's plan.
    pub fn with_plan(mut self, plan: AccountPlan) -> Self {
        self.plans.insert(plan.account_id.clone(), plan);
        self
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn current_plan(&self, account_id: &str) -> Result<Option<AccountPlan>, KeywardenError> {
        Ok(self.plans.get(account_id).cloned())
    }
}

/// Events emitted for the host's notification service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Usage crossed the warning threshold.
    QuotaWarning {
        /// Metered key.
        api_key_id: String,
        /// Owning account.
        account_id: String,
        /// Month, `YYYY-MM`.
        month_year: String,
        /// Calls counted so far.
        used: i64,
        /// Monthly quota.
        quota_limit: i64,
        /// Configured warning percentage.
        threshold_percent: u32,
    },
    /// Usage reached the quota.
    QuotaExhausted {
        /// Metered key.
        api_key_id: String,
        /// Owning account.
        account_id: String,
        /// Month, `YYYY-MM`.
        month_year: String,
        /// Monthly quota.
        quota_limit: i64,
    },
    /// A usage row was reset into a new month.
    QuotaReset {
        /// Metered key.
        api_key_id: String,
        /// Owning account.
        account_id: String,
        /// New month, `YYYY-MM`.
        month_year: String,
        /// New monthly quota.
        quota_limit: i64,
        /// New grace limit.
        grace_limit: i64,
    },
    /// An add-on grant reached its expiry.
    AddOnExpired {
        /// Grant id.
        grant_id: String,
        /// Key the grant applied to.
        api_key_id: String,
        /// Owning account.
        account_id: String,
        /// Package name.
        package: String,
        /// Requests left unused.
        requests_remaining: i64,
        /// Whether billing should renew it.
        auto_renew: bool,
    },
}

impl Notification {
    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuotaWarning { .. } => "quota_warning",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::QuotaReset { .. } => "quota_reset",
            Self::AddOnExpired { .. } => "add_on_expired",
        }
    }
}

/// Delivery channel for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    async fn notify(&self, notification: Notification) -> Result<(), KeywardenError>;
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), KeywardenError> {
        info!(kind = notification.kind(), ?notification, "Notification");
        Ok(())
    }
}

/// Deliver a notification in the background. Failures are logged and dropped.
pub fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        let kind = notification.kind();
        if let Err(e) = notifier.notify(notification).await {
            warn!(kind, error = %e, "Failed to deliver notification");
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Notifier that keeps everything it was sent.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }

        /// Poll until `count` notifications arrived (background delivery).
        pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
            for _ in 0..100 {
                let sent = self.sent();
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.sent()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) -> Result<(), KeywardenError> {
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }
    }

    /// Directory whose lookups always fail.
    pub struct FailingDirectory;

    #[async_trait]
    impl AccountDirectory for FailingDirectory {
        async fn current_plan(
            &self,
            account_id: &str,
        ) -> Result<Option<AccountPlan>, KeywardenError> {
            Err(KeywardenError::Collaborator(format!(
                "directory unavailable for {}",
                account_id
            )))
        }
    }
}
