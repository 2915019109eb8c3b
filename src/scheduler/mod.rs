//! Monthly quota reset: the audited job, its background runner, and maintenance.

pub mod maintenance;
pub mod reset;
pub mod runner;

pub use maintenance::{Maintenance, MaintenanceReport};
pub use reset::{QuotaResetJob, ResetReport, SchedulerState};
pub use runner::{next_reset_boundary, ResetScheduler, SchedulerHandle};
