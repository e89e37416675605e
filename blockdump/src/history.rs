//! Daily log of finished jobs.
//!
//! One `jobs_YYYYMMDD.jsonl` file per local calendar day, one finished job
//! per line.

use chrono::{Duration as ChronoDuration, Local, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::jobs::model::{Job, JobKind, JobState};
use crate::utils::errors::{EngineError, Result};

const FILE_PREFIX: &str = "jobs_";
const FILE_SUFFIX: &str = ".jsonl";

/// Longest span a range query may cover, in days.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Aggregate over a window of finished jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub days: u32,
    pub total_jobs: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_state: BTreeMap<String, usize>,
    /// Percentage of succeeded jobs, one decimal.
    pub success_rate: f64,
    /// Mean of `finished_at - started_at` over jobs that ran, one decimal.
    pub average_duration_secs: f64,
    /// Jobs per day, days without jobs omitted.
    pub daily_counts: BTreeMap<NaiveDate, usize>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub struct JobHistory {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JobHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn day_file(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", day.format("%Y%m%d")))
    }

    /// Append a finished job to the file of the day it finished.
    pub async fn record(&self, job: &Job) -> Result<()> {
        let finished = job.finished_at.unwrap_or_else(Utc::now);
        let day = finished.with_timezone(&Local).date_naive();
        let mut line = serde_json::to_vec(job)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.day_file(day))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        debug!(job_id = %job.id, "Recorded job in history");
        Ok(())
    }

    /// Jobs finished on `day`, in the order they finished.
    pub async fn read_day(&self, day: NaiveDate) -> Result<Vec<Job>> {
        let path = self.day_file(day);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut jobs = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Job>(line) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping malformed line {} of {}: {}", n + 1, path.display(), e),
            }
        }
        Ok(jobs)
    }

    /// Jobs of the last `days` days including today, most recent first.
    pub async fn recent(&self, days: u32) -> Result<Vec<Job>> {
        let today = Local::now().date_naive();
        let mut jobs = Vec::new();
        for offset in 0..days.max(1) {
            let day = today - ChronoDuration::days(i64::from(offset));
            jobs.extend(self.read_day(day).await?);
        }
        jobs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        Ok(jobs)
    }

    /// Jobs finished between `start` and `end` inclusive, grouped by day.
    /// Days left with no job after filtering are omitted.
    pub async fn range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        kind: Option<JobKind>,
        state: Option<JobState>,
    ) -> Result<BTreeMap<NaiveDate, Vec<Job>>> {
        if end < start {
            return Err(EngineError::Validation(format!(
                "range end {end} is before start {start}"
            )));
        }
        if (end - start).num_days() >= MAX_RANGE_DAYS {
            return Err(EngineError::Validation(format!(
                "range may span at most {MAX_RANGE_DAYS} days"
            )));
        }

        let mut grouped = BTreeMap::new();
        for day in start.iter_days().take_while(|d| *d <= end) {
            let jobs: Vec<Job> = self
                .read_day(day)
                .await?
                .into_iter()
                .filter(|j| kind.map_or(true, |k| j.kind == k))
                .filter(|j| state.map_or(true, |s| j.state == s))
                .collect();
            if !jobs.is_empty() {
                grouped.insert(day, jobs);
            }
        }
        Ok(grouped)
    }

    /// Counts and averages over the last `days` days including today.
    pub async fn statistics(&self, days: u32) -> Result<HistoryStats> {
        let days = days.max(1);
        let today = Local::now().date_naive();
        let start = today - ChronoDuration::days(i64::from(days) - 1);

        let mut stats = HistoryStats {
            days,
            ..HistoryStats::default()
        };
        for kind in [JobKind::Dump, JobKind::Migrate] {
            stats.by_kind.insert(kind.to_string(), 0);
        }
        for state in [JobState::Succeeded, JobState::Failed, JobState::Cancelled] {
            stats.by_state.insert(state.to_string(), 0);
        }

        let mut total_secs = 0.0;
        let mut timed = 0usize;
        for (day, jobs) in self.range(start, today, None, None).await? {
            stats.daily_counts.insert(day, jobs.len());
            stats.total_jobs += jobs.len();
            for job in &jobs {
                *stats.by_kind.entry(job.kind.to_string()).or_default() += 1;
                *stats.by_state.entry(job.state.to_string()).or_default() += 1;
                if let (Some(started), Some(finished)) = (job.started_at, job.finished_at) {
                    total_secs += (finished - started).num_milliseconds() as f64 / 1000.0;
                    timed += 1;
                }
            }
        }

        if stats.total_jobs > 0 {
            let succeeded = stats.by_state[&JobState::Succeeded.to_string()];
            stats.success_rate = round1(succeeded as f64 * 100.0 / stats.total_jobs as f64);
        }
        if timed > 0 {
            stats.average_duration_secs = round1(total_secs / timed as f64);
        }
        Ok(stats)
    }

    /// Days that have a history file, newest first.
    pub async fn available_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let date = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|stamp| NaiveDate::parse_from_str(stamp, "%Y%m%d").ok());
            if let Some(date) = date {
                dates.push(date);
            }
        }
        dates.sort_unstable_by(|a, b| b.cmp(a));
        Ok(dates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobParams, JobState};

    fn finished_job(page: &str, minutes_ago: i64) -> Job {
        let mut job = Job::new(JobParams::Dump { page_id: page.to_string() });
        job.state = JobState::Succeeded;
        job.finished_at = Some(Utc::now() - ChronoDuration::minutes(minutes_ago));
        job
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path().join("history"));

        history.record(&finished_job("a", 0)).await.unwrap();
        history.record(&finished_job("b", 0)).await.unwrap();

        let today = Local::now().date_naive();
        let jobs = history.read_day(today).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].params, JobParams::Dump { page_id: "a".into() });
        assert_eq!(history.available_dates().await.unwrap(), vec![today]);
    }

    #[tokio::test]
    async fn test_recent_skips_bad_lines_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        let older = finished_job("older", 1);
        let newer = finished_job("newer", 0);
        history.record(&older).await.unwrap();
        history.record(&newer).await.unwrap();

        let today = Local::now().date_naive();
        let path = history.day_file(today);
        let mut raw = fs::read_to_string(&path).await.unwrap();
        raw.push_str("not json\n");
        fs::write(&path, raw).await.unwrap();

        let jobs = history.recent(1).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        // Both may straddle midnight; only assert order among what is there.
        if ids.len() == 2 {
            assert_eq!(ids, vec![newer.id, older.id]);
        }
        assert!(!jobs.is_empty());
    }

    fn ran(params: JobParams, state: JobState, secs: i64) -> Job {
        let mut job = Job::new(params);
        let finished = Utc::now();
        job.state = state;
        job.started_at = Some(finished - ChronoDuration::seconds(secs));
        job.finished_at = Some(finished);
        job
    }

    fn migrate_params() -> JobParams {
        JobParams::Migrate {
            dump_name: "d".into(),
            target_page_id: "t".into(),
        }
    }

    /// Write one job straight into the file of `day`.
    async fn seed(history: &JobHistory, day: NaiveDate, job: &Job) {
        fs::create_dir_all(history.dir()).await.unwrap();
        let mut line = serde_json::to_string(job).unwrap();
        line.push('\n');
        let path = history.day_file(day);
        let mut raw = fs::read_to_string(&path).await.unwrap_or_default();
        raw.push_str(&line);
        fs::write(&path, raw).await.unwrap();
    }

    #[tokio::test]
    async fn test_range_groups_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let d3 = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let outside = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();

        let dump_ok = ran(JobParams::Dump { page_id: "a".into() }, JobState::Succeeded, 4);
        let dump_failed = ran(JobParams::Dump { page_id: "b".into() }, JobState::Failed, 2);
        let migrate_ok = ran(migrate_params(), JobState::Succeeded, 6);
        seed(&history, d1, &dump_ok).await;
        seed(&history, d1, &migrate_ok).await;
        seed(&history, d3, &dump_failed).await;
        seed(&history, outside, &dump_ok).await;

        let all = history.range(d1, d3, None, None).await.unwrap();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![d1, d3]);
        assert_eq!(all[&d1].len(), 2);

        let dumps = history.range(d1, d3, Some(JobKind::Dump), None).await.unwrap();
        assert_eq!(dumps[&d1].len(), 1);
        assert_eq!(dumps[&d1][0].id, dump_ok.id);

        let failed_migrations = history
            .range(d1, d3, Some(JobKind::Migrate), Some(JobState::Failed))
            .await
            .unwrap();
        assert!(failed_migrations.is_empty());

        let single = history.range(d3, d3, None, Some(JobState::Failed)).await.unwrap();
        assert_eq!(single[&d3][0].id, dump_failed.id);
    }

    #[tokio::test]
    async fn test_range_rejects_bad_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let far = d1 + ChronoDuration::days(MAX_RANGE_DAYS);

        assert!(matches!(
            history.range(d1, d1 - ChronoDuration::days(1), None, None).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            history.range(d1, far, None, None).await,
            Err(EngineError::Validation(_))
        ));
        assert!(history
            .range(d1, far - ChronoDuration::days(1), None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        let today = Local::now().date_naive();
        let long_ago = today - ChronoDuration::days(40);

        seed(&history, today, &ran(JobParams::Dump { page_id: "a".into() }, JobState::Succeeded, 4)).await;
        seed(&history, today, &ran(JobParams::Dump { page_id: "b".into() }, JobState::Failed, 2)).await;
        seed(&history, today, &ran(migrate_params(), JobState::Succeeded, 6)).await;
        // Never started: counted, but not in the average.
        let mut never_ran = Job::new(JobParams::Dump { page_id: "c".into() });
        never_ran.state = JobState::Cancelled;
        never_ran.finished_at = Some(Utc::now());
        seed(&history, today, &never_ran).await;
        seed(&history, long_ago, &ran(migrate_params(), JobState::Failed, 100)).await;

        let stats = history.statistics(30).await.unwrap();
        assert_eq!(stats.days, 30);
        assert_eq!(stats.total_jobs, 4);
        assert_eq!(stats.by_kind["dump"], 3);
        assert_eq!(stats.by_kind["migrate"], 1);
        assert_eq!(stats.by_state["succeeded"], 2);
        assert_eq!(stats.by_state["failed"], 1);
        assert_eq!(stats.by_state["cancelled"], 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.average_duration_secs, 4.0);
        assert_eq!(stats.daily_counts.len(), 1);
        assert_eq!(stats.daily_counts[&today], 4);

        let wide = history.statistics(60).await.unwrap();
        assert_eq!(wide.total_jobs, 5);
        assert_eq!(wide.success_rate, 40.0);
    }

    #[tokio::test]
    async fn test_statistics_of_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path().join("absent"));
        let stats = history.statistics(0).await.unwrap();
        assert_eq!(stats.days, 1);
        assert_eq!(stats.total_jobs, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.by_kind["migrate"], 0);
        assert!(stats.daily_counts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path().join("absent"));
        assert!(history.available_dates().await.unwrap().is_empty());
        assert!(history.recent(7).await.unwrap().is_empty());
    }
}
