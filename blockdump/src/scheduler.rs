//! Recurring dumps of the configured pages.
//!
//! A tick only submits jobs through the [`JobManager`]; it has no execution
//! path of its own.

use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScheduleConfig;
use crate::jobs::{JobKind, JobManager};
use crate::utils::errors::{EngineError, Result};

/// Accept 5-field crontab (minute first) or 6-field (second first) patterns.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => Err(EngineError::Config(format!(
            "cron pattern must have 5 or 6 fields, got {n}: {expr:?}"
        ))),
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::Config(format!("unknown time zone: {name:?}")))
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub submitted: Vec<Uuid>,
    pub skipped: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

struct Plan {
    page_ids: Vec<String>,
    skip_if_busy: bool,
}

pub struct DumpScheduler {
    scheduler: Mutex<JobScheduler>,
    manager: JobManager,
    plan: Arc<Plan>,
    cron: String,
    timezone: Tz,
}

impl DumpScheduler {
    pub async fn new(manager: JobManager, config: &ScheduleConfig) -> anyhow::Result<Self> {
        let cron = normalize_cron(&config.cron)?;
        let timezone = parse_timezone(&config.timezone)?;
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            manager,
            plan: Arc::new(Plan {
                page_ids: config.page_ids.clone(),
                skip_if_busy: config.skip_if_busy,
            }),
            cron,
            timezone,
        })
    }

    pub fn cron(&self) -> &str {
        &self.cron
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Register the tick and start the clock. Returns `false` without
    /// starting anything when no pages are configured.
    pub async fn start(&self) -> anyhow::Result<bool> {
        if self.plan.page_ids.is_empty() {
            info!("No pages configured for scheduled dumps, scheduler not started");
            return Ok(false);
        }

        let manager = self.manager.clone();
        let plan = self.plan.clone();
        let job = CronJob::new_async_tz(self.cron.as_str(), self.timezone, move |_uuid, _lock| {
            let manager = manager.clone();
            let plan = plan.clone();
            Box::pin(async move {
                let report = run_tick(&manager, &plan).await;
                info!(
                    submitted = report.submitted.len(),
                    skipped = report.skipped.len(),
                    rejected = report.rejected.len(),
                    "Scheduled dump tick"
                );
            })
        })?;

        let scheduler = self.scheduler.lock().await;
        scheduler.add(job).await?;
        scheduler.start().await?;
        info!(
            cron = %self.cron,
            timezone = %self.timezone,
            pages = self.plan.page_ids.len(),
            "Dump scheduler started"
        );
        Ok(true)
    }

    /// Run one tick now, exactly as the clock would.
    pub async fn trigger(&self) -> TickReport {
        run_tick(&self.manager, &self.plan).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

async fn run_tick(manager: &JobManager, plan: &Plan) -> TickReport {
    let mut report = TickReport::default();
    if plan.skip_if_busy && manager.is_saturated(JobKind::Dump) {
        warn!("Dump pool busy, skipping scheduled dumps");
        report.skipped = plan.page_ids.clone();
        return report;
    }
    for page_id in &plan.page_ids {
        match manager.submit_dump(page_id).await {
            Ok(job) => report.submitted.push(job.id),
            Err(e) => {
                warn!(page_id = %page_id, "Scheduled dump rejected: {}", e);
                report.rejected.push((page_id.clone(), e.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::{JobSettings, JobState};
    use crate::store::DumpStore;
    use crate::testing::{FakeRemote, Op};
    use std::time::Duration;

    const PAGE_A: &str = "1f2e3d4c-5b6a-7980-a1b2-c3d4e5f60718";
    const PAGE_B: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

    fn manager(fake: &FakeRemote, root: &std::path::Path) -> JobManager {
        JobManager::new(
            Arc::new(fake.clone()),
            DumpStore::new(root),
            JobSettings {
                max_dump: 1,
                max_migrate: 1,
                deadline: None,
                static_base_url: "http://127.0.0.1:8000/files".into(),
                history_dir: None,
            },
        )
    }

    fn schedule(page_ids: &[&str], skip_if_busy: bool) -> ScheduleConfig {
        let mut config = Config::default().schedule;
        config.page_ids = page_ids.iter().map(|s| s.to_string()).collect();
        config.skip_if_busy = skip_if_busy;
        config
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 * * * *").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_cron(" */5  9-18 * * 1-5 ").unwrap(), "0 */5 9-18 * * 1-5");
        assert_eq!(normalize_cron("30 0 3 * * *").unwrap(), "30 0 3 * * *");
        assert!(normalize_cron("* * *").is_err());
        assert!(normalize_cron("").is_err());
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Asia/Seoul").unwrap(), chrono_tz::Asia::Seoul);
        assert_eq!(parse_timezone("UTC").unwrap(), chrono_tz::UTC);
        assert!(matches!(parse_timezone("Mars/Olympus"), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_trigger_submits_like_manual_requests() {
        let fake = FakeRemote::new();
        fake.add_page(PAGE_A, "A", vec![]);
        fake.add_page(PAGE_B, "B", vec![]);
        let root = tempfile::tempdir().unwrap();
        let manager = manager(&fake, root.path());
        let scheduler = DumpScheduler::new(manager.clone(), &schedule(&[PAGE_A, PAGE_B, "bogus"], false))
            .await
            .unwrap();

        let report = scheduler.trigger().await;
        assert_eq!(report.submitted.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "bogus");

        // Saturation does not drop submissions without skip_if_busy.
        let second = scheduler.trigger().await;
        assert_eq!(second.submitted.len(), 2);
        assert_eq!(manager.list().len(), 4);
    }

    #[tokio::test]
    async fn test_skip_if_busy() {
        let fake = FakeRemote::new();
        fake.add_page(PAGE_A, "A", vec![]);
        let gate = fake.gate(Op::FetchChildren, 0);
        let root = tempfile::tempdir().unwrap();
        let manager = manager(&fake, root.path());
        let scheduler = DumpScheduler::new(manager.clone(), &schedule(&[PAGE_A], true))
            .await
            .unwrap();

        let first = scheduler.trigger().await;
        assert_eq!(first.submitted.len(), 1);
        while manager.running_count(JobKind::Dump) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let busy = scheduler.trigger().await;
        assert!(busy.submitted.is_empty());
        assert_eq!(busy.skipped, vec![PAGE_A.to_string()]);

        gate.add_permits(10);
        let job = manager.get(first.submitted[0]).unwrap();
        for _ in 0..500 {
            if manager.get(job.id).unwrap().state == JobState::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.trigger().await.submitted.len(), 1);
    }

    #[tokio::test]
    async fn test_start_requires_pages() {
        let fake = FakeRemote::new();
        let root = tempfile::tempdir().unwrap();
        let manager = manager(&fake, root.path());

        let idle = DumpScheduler::new(manager.clone(), &schedule(&[], false)).await.unwrap();
        assert!(!idle.start().await.unwrap());

        let active = DumpScheduler::new(manager, &schedule(&[PAGE_A], false)).await.unwrap();
        assert_eq!(active.cron(), "0 0 * * * *");
        assert_eq!(active.timezone(), chrono_tz::Asia::Seoul);
        assert!(active.start().await.unwrap());
        active.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_rejected() {
        let fake = FakeRemote::new();
        let root = tempfile::tempdir().unwrap();
        let mut config = schedule(&[PAGE_A], false);
        config.timezone = "Nowhere/Special".into();
        assert!(DumpScheduler::new(manager(&fake, root.path()), &config).await.is_err());
    }
}
