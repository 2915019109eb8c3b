//! Domain records shared by the gatekeeping components.

pub mod addon;
pub mod audit;
pub mod key;
pub mod usage;

pub use addon::{AddOnGrant, AddOnPackage};
pub use audit::{ExecutionStatus, QuotaResetAuditRecord, TriggerSource};
pub use key::{ApiKeyRecord, ApiScope, RateLimitTier};
pub use usage::{CallOutcome, MonthlyUsage, QuotaStatus, UsageSnapshot, UNLIMITED};
