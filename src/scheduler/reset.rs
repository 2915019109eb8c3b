//! Monthly quota reset job.
//!
//! Each run writes a `STARTED` audit row, walks the usage rows due for the
//! new month in id-ordered batches, and resets each one in its own
//! transaction. Plan lookups happen outside those transactions. Runs may
//! overlap: the `last_reset_date < reset_date` guard makes every row reset
//! at most once.

use crate::client::{dispatch, AccountDirectory, Notification, Notifier};
use crate::clock::Clock;
use crate::config::KeywardenConfig;
use crate::model::usage::{first_of_month, format_month, grace_limit_for};
use crate::model::{ExecutionStatus, MonthlyUsage, QuotaResetAuditRecord, TriggerSource, UNLIMITED};
use crate::store::{ResetApplied, Store};
use crate::KeywardenError;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle of the reset job, observable through [`QuotaResetJob::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No run has happened yet.
    Idle,
    /// A run is in progress.
    Running,
    /// The last run finished without record failures.
    Completed,
    /// The last run reset some records and failed on others.
    CompletedWithErrors,
    /// The last run could not reset anything.
    Failed,
}

impl From<ExecutionStatus> for SchedulerState {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Started => Self::Running,
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::CompletedWithErrors => Self::CompletedWithErrors,
            ExecutionStatus::Failed => Self::Failed,
        }
    }
}

/// Result of one reset run.
#[derive(Debug)]
pub struct ResetReport {
    /// The finalized audit row.
    pub audit: QuotaResetAuditRecord,
    /// Per-record failures (`SchedulerRecordFailed`).
    pub failures: Vec<KeywardenError>,
}

impl ResetReport {
    /// Final execution status.
    pub fn status(&self) -> ExecutionStatus {
        self.audit.status
    }
}

enum RecordOutcome {
    Reset,
    Skipped,
}

#[derive(Default)]
struct Tally {
    processed: u64,
    successful: u64,
    failed: u64,
    skipped: u64,
}

/// Resets monthly usage rows into the current month.
#[derive(Clone)]
pub struct QuotaResetJob {
    store: Store,
    directory: Arc<dyn AccountDirectory>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    grace_percent: u32,
    batch_size: u32,
    state: Arc<watch::Sender<SchedulerState>>,
}

impl QuotaResetJob {
    /// Create a reset job.
    pub fn new(
        config: &KeywardenConfig,
        store: Store,
        directory: Arc<dyn AccountDirectory>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            store,
            directory,
            notifier,
            clock,
            grace_percent: config.grace_percent,
            batch_size: config.reset_batch_size.max(1),
            state: Arc::new(state),
        }
    }

    /// Watch the job's state.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Operator-invoked reset.
    pub async fn run_manual(&self, operator: &str) -> Result<ResetReport, KeywardenError> {
        self.run(TriggerSource::Manual {
            operator: operator.to_string(),
        })
        .await
    }

    /// Reset every row due for the current month.
    ///
    /// Record-level failures are tallied into the report; a run where every
    /// record failed still returns `Ok` with status `Failed`.
    ///
    /// # Errors
    /// - `SchedulerRunFailed` - the audit row could not be written or the
    ///   candidate query failed
    pub async fn run(&self, trigger: TriggerSource) -> Result<ResetReport, KeywardenError> {
        let timer = Instant::now();
        let started_at = self.clock.now_utc();
        let reset_date = first_of_month(&started_at);
        let month_year = format_month(&started_at);

        let mut audit = QuotaResetAuditRecord {
            id: Uuid::new_v4().to_string(),
            reset_date,
            month_year: month_year.clone(),
            records_processed: 0,
            records_successful: 0,
            records_failed: 0,
            records_skipped: 0,
            duration_ms: 0,
            triggered_by: trigger.to_string(),
            status: ExecutionStatus::Started,
            error_message: None,
            started_at,
            completed_at: None,
        };

        self.state.send_replace(SchedulerState::Running);
        if let Err(e) = self.store.begin_reset_audit(&audit).await {
            error!(error = %e, trigger = %trigger, "Failed to start quota reset run");
            self.state.send_replace(SchedulerState::Failed);
            return Err(KeywardenError::SchedulerRunFailed(e.to_string()));
        }
        info!(execution_id = %audit.id, month_year = %month_year, trigger = %trigger, "Quota reset started");

        let mut tally = Tally::default();
        let mut failures = Vec::new();
        let mut after_id = String::new();

        loop {
            let batch = match self
                .store
                .reset_candidates(reset_date, &month_year, &after_id, self.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(execution_id = %audit.id, error = %e, "Quota reset candidate query failed");
                    audit.error_message = Some(e.to_string());
                    self.finalize(&mut audit, &tally, ExecutionStatus::Failed, timer)
                        .await?;
                    return Err(KeywardenError::SchedulerRunFailed(e.to_string()));
                }
            };

            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id.clone();
            let full_page = batch.len() >= self.batch_size as usize;

            for usage in &batch {
                tally.processed += 1;
                match self.reset_record(usage, reset_date, &month_year).await {
                    Ok(RecordOutcome::Reset) => tally.successful += 1,
                    Ok(RecordOutcome::Skipped) => tally.skipped += 1,
                    Err(e) => {
                        warn!(record_id = %usage.id, error = %e, "Quota reset failed for record");
                        tally.failed += 1;
                        failures.push(e);
                    }
                }
            }

            if !full_page {
                break;
            }
        }

        let status = ExecutionStatus::from_tally(tally.successful, tally.failed);
        self.finalize(&mut audit, &tally, status, timer).await?;

        info!(
            execution_id = %audit.id,
            status = %status,
            processed = tally.processed,
            successful = tally.successful,
            failed = tally.failed,
            skipped = tally.skipped,
            duration_ms = audit.duration_ms,
            "Quota reset finished"
        );
        Ok(ResetReport { audit, failures })
    }

    async fn reset_record(
        &self,
        usage: &MonthlyUsage,
        reset_date: NaiveDate,
        month_year: &str,
    ) -> Result<RecordOutcome, KeywardenError> {
        let record_failed = |reason: String| KeywardenError::SchedulerRecordFailed {
            record_id: usage.id.clone(),
            reason,
        };

        let plan = match self.directory.current_plan(&usage.account_id).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                warn!(record_id = %usage.id, account_id = %usage.account_id, "No plan for account, skipping quota reset");
                return Ok(RecordOutcome::Skipped);
            }
            Err(e) => return Err(record_failed(e.to_string())),
        };

        let quota_limit = plan.monthly_allowance;
        if quota_limit < UNLIMITED {
            return Err(record_failed(format!(
                "Invalid monthly allowance {} for plan {}",
                quota_limit, plan.plan_name
            )));
        }
        let grace_limit = grace_limit_for(quota_limit, self.grace_percent).ok_or_else(|| {
            record_failed(format!(
                "Grace limit for monthly allowance {} of plan {} overflows",
                quota_limit, plan.plan_name
            ))
        })?;

        let applied = self
            .store
            .apply_monthly_reset(
                &usage.id,
                &usage.api_key_id,
                reset_date,
                month_year,
                quota_limit,
                grace_limit,
                self.clock.now_utc(),
            )
            .await
            .map_err(|e| record_failed(e.to_string()))?;

        match applied {
            ResetApplied::AlreadyReset => Ok(RecordOutcome::Skipped),
            ResetApplied::Reset | ResetApplied::Merged => {
                dispatch(
                    &self.notifier,
                    Notification::QuotaReset {
                        api_key_id: usage.api_key_id.clone(),
                        account_id: usage.account_id.clone(),
                        month_year: month_year.to_string(),
                        quota_limit,
                        grace_limit,
                    },
                );
                Ok(RecordOutcome::Reset)
            }
        }
    }

    async fn finalize(
        &self,
        audit: &mut QuotaResetAuditRecord,
        tally: &Tally,
        status: ExecutionStatus,
        timer: Instant,
    ) -> Result<(), KeywardenError> {
        audit.records_processed = tally.processed;
        audit.records_successful = tally.successful;
        audit.records_failed = tally.failed;
        audit.records_skipped = tally.skipped;
        audit.status = status;
        audit.duration_ms = i64::try_from(timer.elapsed().as_millis()).unwrap_or(i64::MAX);
        audit.completed_at = Some(self.clock.now_utc());

        self.state.send_replace(status.into());
        match self.store.finalize_reset_audit(audit).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(execution_id = %audit.id, "Reset audit row was already finalized");
                Ok(())
            }
            Err(e) => {
                error!(execution_id = %audit.id, error = %e, "Failed to finalize reset audit row");
                self.state.send_replace(SchedulerState::Failed);
                Err(KeywardenError::SchedulerRunFailed(e.to_string()))
            }
        }
    }
}
