use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use retail_etl_common::{
    error::Error,
    event::{EventLogRecord, EventType},
    pipeline::{PipelineDefinition, PipelineRun, PipelineRunStatus},
};
use tokio::sync::watch;
use tracing::{error, info};

use crate::launcher::Launcher;

/// Fires pipeline runs on the pipeline's schedule until shutdown.
/// ---
/// Runs never overlap and missed boundaries are not replayed.
pub struct PipelineScheduler {
    launcher: Arc<Launcher>,
    pipeline_def: Arc<PipelineDefinition>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PipelineScheduler {
    pub fn new(
        launcher: Arc<Launcher>,
        pipeline_def: Arc<PipelineDefinition>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            launcher,
            pipeline_def,
            shutdown_rx,
        }
    }

    async fn sleep_until(&mut self, fire_time: DateTime<Utc>) -> bool {
        let wait = (fire_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            res = self.shutdown_rx.wait_for(|requested| *requested) => {
                // A dropped sender cannot request shutdown; keep the schedule.
                if res.is_err() {
                    tokio::time::sleep(wait).await;
                    return true;
                }
                false
            }
        }
    }

    /// Runs forever, returning when shutdown is requested. Every completed
    /// run is handed to `on_run`.
    pub async fn run_loop<F>(&mut self, mut on_run: F) -> Result<(), Error>
    where
        F: FnMut(&PipelineRun),
    {
        let schedule = self.pipeline_def.info.schedule.clone();

        loop {
            let fire_time = schedule.next_fire_after(Utc::now());
            EventLogRecord::new(
                EventType::RunScheduled,
                None,
                None,
                Some(format!(
                    "Next run of {} at {}",
                    self.pipeline_def.info.name, fire_time
                )),
            )
            .emit();

            if !self.sleep_until(fire_time).await {
                info!("Scheduler: shutdown requested, leaving schedule loop.");
                return Ok(());
            }

            let logical_date = schedule.logical_date(fire_time);
            let run = self
                .launcher
                .execute_pipeline(&self.pipeline_def, logical_date)
                .await?;

            if run.status != PipelineRunStatus::Succeeded {
                error!(
                    "Scheduler: run {} for {} ended {}",
                    run.id, logical_date, run.status
                );
            }
            on_run(&run);

            let missed = schedule.missed_between(fire_time, Utc::now());
            if missed > 0 {
                EventLogRecord::new(
                    EventType::RunSkipped,
                    Some(run.id),
                    None,
                    Some(format!(
                        "Run outlasted {missed} schedule boundaries; they will not be caught up"
                    )),
                )
                .emit();
            }

            if *self.shutdown_rx.borrow() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use retail_etl_common::pipeline::{PipelineInfo, Schedule};

    use super::*;
    use crate::launcher::ExecutionManagerRegistry;

    #[tokio::test]
    async fn test_shutdown_ends_loop_without_running() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let launcher = Arc::new(Launcher::new(
            Arc::new(ExecutionManagerRegistry::new()),
            shutdown_rx.clone(),
        ));
        let pipeline_def = Arc::new(PipelineDefinition {
            info: PipelineInfo::new(
                "idle",
                None,
                Schedule::daily(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            ),
            task_definitions: Vec::new(),
        });

        let mut scheduler = PipelineScheduler::new(launcher, pipeline_def, shutdown_rx);
        shutdown_tx.send(true).unwrap();

        let mut runs = 0;
        tokio::time::timeout(Duration::from_secs(5), scheduler.run_loop(|_| runs += 1))
            .await
            .expect("loop should exit on shutdown")
            .unwrap();
        assert_eq!(runs, 0);
    }
}
