//! Background runner for the monthly reset.

use crate::clock::Clock;
use crate::model::usage::first_of_next_month;
use crate::model::TriggerSource;
use crate::scheduler::maintenance::Maintenance;
use crate::scheduler::reset::QuotaResetJob;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 00:00 UTC on the first day of the month after `now`.
pub fn next_reset_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    first_of_next_month(&now)
}

/// Runs the reset job at every month boundary, then maintenance.
pub struct ResetScheduler {
    job: QuotaResetJob,
    maintenance: Maintenance,
    clock: Arc<dyn Clock>,
    run_on_startup: bool,
}

impl ResetScheduler {
    /// Create a scheduler. Nothing runs until [`ResetScheduler::spawn`].
    pub fn new(
        job: QuotaResetJob,
        maintenance: Maintenance,
        clock: Arc<dyn Clock>,
        run_on_startup: bool,
    ) -> Self {
        Self {
            job,
            maintenance,
            clock,
            run_on_startup,
        }
    }

    /// Start the scheduler on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(self.run_loop(signal));
        SchedulerHandle { shutdown, task }
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        if self.run_on_startup {
            self.run_once(TriggerSource::Startup).await;
        }

        let mut after = self.clock.now_utc();
        loop {
            let now = self.clock.now_utc();
            let boundary = next_reset_boundary(after.max(now));
            let wait = (boundary - now).to_std().unwrap_or_default();
            info!(next_run = %boundary, "Next quota reset scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.run_once(TriggerSource::Scheduled).await;
                    after = boundary;
                }
                _ = shutdown.changed() => {
                    info!("Quota reset scheduler stopping");
                    break;
                }
            }
        }
    }

    async fn run_once(&self, trigger: TriggerSource) {
        if let Err(e) = self.job.run(trigger).await {
            error!(error = %e, "Quota reset run failed");
        }
        if let Err(e) = self.maintenance.run().await {
            warn!(error = %e, "Maintenance failed");
        }
    }
}

/// Handle to a spawned [`ResetScheduler`].
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the scheduler and wait for the current run to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Quota reset scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingNotifier;
    use crate::client::{AccountPlan, StaticAccountDirectory};
    use crate::clock::MockClock;
    use crate::config::KeywardenConfig;
    use crate::meter::{AddOnLedger, QuotaAccountant, RateLimiter};
    use crate::scheduler::reset::SchedulerState;
    use crate::store::usage_fixtures::january_usage;
    use crate::store::Store;
    use chrono::TimeZone;

    #[test]
    fn test_next_reset_boundary() {
        let late_january = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap();
        assert_eq!(
            next_reset_boundary(late_january),
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
        );

        let on_boundary = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(
            next_reset_boundary(on_boundary),
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
        );

        let december = Utc.with_ymd_and_hms(2024, 12, 15, 8, 0, 0).unwrap();
        assert_eq!(
            next_reset_boundary(december),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_startup_run_catches_up() {
        let store = Store::in_memory().await.unwrap();
        let clock = Arc::new(MockClock::from_rfc3339("2025-02-03T10:00:00Z"));
        let notifier = Arc::new(RecordingNotifier::default());
        let config = KeywardenConfig::default();
        let directory = StaticAccountDirectory::new().with_plan(AccountPlan {
            account_id: "acct-1".to_string(),
            plan_name: "growth".to_string(),
            monthly_allowance: 300,
        });
        store.insert_usage(&january_usage("u1", "key-1")).await.unwrap();

        let job = QuotaResetJob::new(
            &config,
            store.clone(),
            Arc::new(directory),
            notifier.clone(),
            clock.clone(),
        );
        let maintenance = Maintenance::new(
            &config,
            RateLimiter::new(store.clone(), clock.clone()),
            AddOnLedger::new(store.clone(), clock.clone(), notifier.clone()),
            QuotaAccountant::new(&config, store.clone(), clock.clone(), notifier.clone()),
            clock.clone(),
        );

        let mut state = job.subscribe();
        let handle = ResetScheduler::new(job, maintenance, clock.clone(), true).spawn();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while *state.borrow_and_update() != SchedulerState::Completed {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;

        let row = store.find_usage("key-1", "2025-02").await.unwrap().unwrap();
        assert_eq!(row.quota_limit, 300);
        assert_eq!(row.total_calls, 0);
    }
}
