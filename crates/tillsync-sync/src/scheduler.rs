use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tillsync_core::CadenceTier;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::ScheduleOrchestrator;

/// Six-field (seconds first) cron expression for a tier. The daily tier fires
/// at local midnight, the others in UTC.
pub fn cron_for(tier: CadenceTier) -> &'static str {
    match tier {
        CadenceTier::EveryTwoMinutes => "0 */2 * * * *",
        CadenceTier::EveryFiveMinutes => "0 */5 * * * *",
        CadenceTier::EveryThirtyMinutes => "0 */30 * * * *",
        CadenceTier::Hourly => "0 0 * * * *",
        CadenceTier::Daily => "0 0 0 * * *",
    }
}

async fn fire(orchestrator: Arc<ScheduleOrchestrator>, tier: CadenceTier) {
    let report = orchestrator.run_tier(tier).await;
    if report.skipped {
        warn!(%tier, run_id = %report.run_id, "tier firing skipped");
    } else {
        info!(
            %tier,
            run_id = %report.run_id,
            failed = report.failed(),
            "scheduled tier tick done"
        );
    }
}

fn tier_job(tier: CadenceTier, orchestrator: Arc<ScheduleOrchestrator>) -> Result<Job> {
    let cron = cron_for(tier);
    let job = if tier == CadenceTier::Daily {
        Job::new_async_tz(cron, Local, move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move { fire(orchestrator, tier).await })
        })
    } else {
        Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move { fire(orchestrator, tier).await })
        })
    };
    job.with_context(|| format!("creating scheduler job for tier {tier} ({cron})"))
}

/// One cron job per tier, each calling straight into the orchestrator.
/// Returns `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    orchestrator: Arc<ScheduleOrchestrator>,
    enabled: bool,
) -> Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for tier in CadenceTier::ALL {
        let job = tier_job(tier, Arc::clone(&orchestrator))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%tier, cron = cron_for(tier), "tier scheduled");
    }
    Ok(Some(sched))
}
