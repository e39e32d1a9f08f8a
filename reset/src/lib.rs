use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use common::{date::start_of_month, error::Res};
use db::{Store, dtos::ledger::ResetGate};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ResetOutcome {
    /// The gate refused the run.
    Skipped(ResetGate),
    Applied { topped_up: usize, unchanged: usize },
}

/// Monthly replenishment of IP identities back to a target balance.
pub struct Resetter {
    store: Arc<dyn Store>,
    /// `(project, target balance)`
    projects: Vec<(String, f64)>,
    grace: Duration,
}

impl Resetter {
    pub fn new(store: Arc<dyn Store>, projects: Vec<(String, f64)>, grace: Duration) -> Self {
        Self {
            store,
            projects,
            grace,
        }
    }

    /// One reset of `project` as of `now`. Safe to repeat: a finished
    /// period is skipped and keys stamped in this period are not touched.
    pub async fn reset_project(&self, project: &str, target: f64, now: DateTime<Utc>) -> Res<ResetOutcome> {
        let period_start = match self.store.begin_reset(project, now, self.grace).await? {
            ResetGate::Proceed { period_start } => period_start,
            gate => {
                log::debug!("Reset of '{}' skipped: {:?}", project, gate);
                return Ok(ResetOutcome::Skipped(gate));
            }
        };

        log::info!("Resetting project '{}' to {}", project, target);
        let keys = self.store.resettable_keys(project, now, period_start).await?;
        let (mut topped_up, mut unchanged) = (0, 0);
        for key in keys {
            let operation_id = Uuid::new_v4().to_string();
            match self
                .store
                .reset_key(key.id, &operation_id, target, period_start, now)
                .await?
            {
                Some(grant) => {
                    log::debug!("Key {} topped up to limit {}", key.id, grant.key().quota_limit);
                    topped_up += 1;
                }
                None => unchanged += 1,
            }
        }

        let next_reset = start_of_month(now, 1);
        self.store.finish_reset(project, next_reset).await?;
        log::info!(
            "Reset of '{}' done: {} topped up, {} unchanged, next at {}",
            project,
            topped_up,
            unchanged,
            next_reset
        );
        Ok(ResetOutcome::Applied { topped_up, unchanged })
    }

    /// Resets every configured project. Fails if any project failed, after
    /// trying all of them.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Res<Vec<(String, ResetOutcome)>> {
        let mut outcomes = Vec::with_capacity(self.projects.len());
        let mut failure = None;
        for (project, target) in &self.projects {
            match self.reset_project(project, *target, now).await {
                Ok(outcome) => outcomes.push((project.clone(), outcome)),
                Err(e) => {
                    log::error!("Reset of '{}' failed: {}", project, e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }
}

/// Delay before the next iteration given the last one's result.
fn next_wait(result: &Res<Vec<(String, ResetOutcome)>>, now: DateTime<Utc>, retry: Duration) -> Duration {
    match result {
        Ok(outcomes)
            if !outcomes
                .iter()
                .any(|(_, o)| matches!(o, ResetOutcome::Skipped(ResetGate::InProgress { .. }))) =>
        {
            (start_of_month(now, 1) - now).to_std().unwrap_or(retry)
        }
        _ => retry,
    }
}

/// Runs resets at start and then once per month until `shutdown` flips.
/// An iteration in progress is always completed before returning.
pub async fn run(resetter: Resetter, retry: Duration, mut shutdown: watch::Receiver<bool>) {
    log::info!("Reset task started for {} project(s)", resetter.projects.len());
    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        let result = resetter.run_once(now).await;
        let wait = next_wait(&result, now, retry);
        log::debug!("Next reset check in {}s", wait.as_secs());

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
    }
    log::info!("Reset task stopped");
}
