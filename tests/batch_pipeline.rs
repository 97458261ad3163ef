//! End-to-end tests of one batch: concurrent jobs, packaging, transfer and
//! directory reclamation, against an in-memory backup service.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use frosty::core::{
    BackupService, Batcher, JobSpec, JobStatus, RunId, Status, Workspace,
};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

/// Records every call; optionally fails initialization or specific stores.
#[derive(Default)]
struct RecordingService {
    fail_init: bool,
    reject: HashSet<String>,
    /// Replace the job directory with a plain file once its archive is stored.
    squat_job_dir: bool,
    /// Panic when asked to name this job's archive.
    panic_for: Option<String>,
    init_calls: Mutex<usize>,
    stored: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl RecordingService {
    fn failing_init() -> Self {
        Self {
            fail_init: true,
            ..Default::default()
        }
    }

    fn rejecting(names: &[&str]) -> Self {
        Self {
            reject: names.iter().map(|n| format!("{n}.zip")).collect(),
            ..Default::default()
        }
    }

    fn stored_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stored
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl BackupService for RecordingService {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn display_location(&self) -> String {
        "memory".to_string()
    }

    fn artifact_file_base_name(&self, job_name: &str) -> String {
        if self.panic_for.as_deref() == Some(job_name) {
            panic!("no archive name for {job_name}");
        }
        job_name.to_string()
    }

    async fn initialize(&self) -> Result<()> {
        *self.init_calls.lock().unwrap() += 1;
        if self.fail_init {
            bail!("vault unreachable");
        }
        Ok(())
    }

    async fn store_file(&self, path: &Path) -> Result<()> {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if self.reject.contains(&name) {
            bail!("quota exceeded");
        }
        let bytes = std::fs::read(path)?;
        self.stored.lock().unwrap().push((path.to_path_buf(), bytes));

        if self.squat_job_dir {
            let job_dir = path.parent().and_then(Path::parent).unwrap();
            std::fs::remove_dir_all(job_dir)?;
            std::fs::write(job_dir, b"not a directory")?;
        }
        Ok(())
    }
}

struct Fixture {
    _temp: TempDir,
    workspace: Workspace,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let workspace = Workspace::new(temp.path().join("work")).unwrap();
        Self {
            _temp: temp,
            workspace,
        }
    }

    fn batcher(&self, service: &Arc<RecordingService>) -> Batcher {
        Batcher::new(self.workspace.clone(), service.clone() as Arc<dyn BackupService>)
    }
}

fn sh(name: &str, script: &str) -> JobSpec {
    JobSpec::new(name, "/bin/sh").with_args(["-c", script])
}

fn writes(name: &str, file: &str, content: &str) -> JobSpec {
    sh(
        name,
        &format!(r#"printf '%s' '{content}' > "$FROSTY_JOB_ARTIFACTS_DIR/{file}""#),
    )
}

fn find<'a>(statuses: &'a [JobStatus], name: &str) -> &'a JobStatus {
    statuses.iter().find(|s| s.job.name == name).unwrap()
}

fn zip_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            (entry.name().to_string(), content)
        })
        .collect()
}

#[tokio::test]
async fn test_every_job_yields_exactly_one_status() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::default());

    let jobs = vec![
        writes("a", "a.txt", "alpha"),
        JobSpec::new("b", "/bin/false"),
        JobSpec::new("c", "/nonexistent/binary"),
        sh("d", "exit 0"),
        writes("e", "e.txt", "echo"),
    ];

    let report = fx.batcher(&service).execute("nightly", jobs).await;

    assert_eq!(report.jobs.len(), 5);
    let names: HashSet<&str> = report.jobs.iter().map(|s| s.job.name.as_str()).collect();
    assert_eq!(names, HashSet::from(["a", "b", "c", "d", "e"]));
    assert_eq!(report.failed_count(), 2);
    assert!(!report.is_successful());
    assert_eq!(*service.init_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_db_dump_and_broken_job_scenario() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::default());
    let run = RunId::generate();

    let jobs = vec![
        writes("db", "dump.sql", "CREATE TABLE t (id int);"),
        JobSpec::new("broken", "/bin/false"),
    ];

    let batcher = fx.batcher(&service);
    let mut statuses = batcher.run_jobs(&run, jobs).await;

    let broken = find(&statuses, "broken");
    assert_eq!(broken.status, Status::Failure);
    assert!(!broken.archive_created);

    batcher.transfer_archives(&run, &mut statuses).await;

    let db = find(&statuses, "db");
    assert_eq!(db.status, Status::Success, "error: {}", db.error);
    assert!(db.archive_created);
    assert!(db.archive_size > 0);
    assert!(db.transfer_ended_at.is_some());
    assert!(db.transfer_error.is_empty());
    assert!(!fx.workspace.job_dir("db", &run).exists());

    // No archive: left for the run-level cleanup.
    let broken = find(&statuses, "broken");
    assert!(broken.transfer_started_at.is_none());
    assert!(fx.workspace.job_dir("broken", &run).exists());

    batcher.finish_run(&run, &statuses).await;
    assert!(!fx.workspace.run_dir(&run).exists());

    let stored = service.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        zip_entries(&stored[0].1),
        vec![("dump.sql".to_string(), b"CREATE TABLE t (id int);".to_vec())]
    );
}

#[tokio::test]
async fn test_backend_init_failure_fails_every_job() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::failing_init());

    let jobs = vec![
        writes("a", "a.txt", "alpha"),
        sh("b", "exit 0"),
        JobSpec::new("c", "/bin/false"),
    ];

    let report = fx.batcher(&service).execute("nightly", jobs).await;

    assert_eq!(report.jobs.len(), 3);
    assert!(report.jobs.iter().all(|s| s.status == Status::Failure));

    let first = &report.jobs[0].transfer_error;
    assert!(first.contains("vault unreachable"));
    assert!(report.jobs.iter().all(|s| &s.transfer_error == first));
    assert!(report.jobs.iter().all(|s| s.transfer_ended_at.is_none()));
    assert!(service.stored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_transfer_keeps_job_directory() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::rejecting(&["bad"]));
    let run = RunId::generate();

    let batcher = fx.batcher(&service);
    let mut statuses = batcher
        .run_jobs(
            &run,
            vec![writes("good", "g.txt", "good"), writes("bad", "b.txt", "bad")],
        )
        .await;
    batcher.transfer_archives(&run, &mut statuses).await;

    let good = find(&statuses, "good");
    assert_eq!(good.status, Status::Success);
    assert!(!fx.workspace.job_dir("good", &run).exists());

    let bad = find(&statuses, "bad");
    assert_eq!(bad.status, Status::Failure);
    assert!(bad.transfer_error.contains("quota exceeded"));
    assert!(bad.transfer_ended_at.is_some());
    assert!(bad.archive_path.as_ref().unwrap().exists());
    assert!(fx.workspace.job_dir("bad", &run).exists());

    assert_eq!(service.stored_names(), vec!["good.zip"]);
}

#[tokio::test]
async fn test_keep_failed_runs_retains_stranded_archives() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::rejecting(&["bad"]));
    let run = RunId::generate();

    let batcher = fx.batcher(&service).keep_failed_runs(true);
    let report = batcher
        .execute_run(run.clone(), "nightly", vec![writes("bad", "b.txt", "bad")])
        .await;

    assert!(!report.is_successful());
    assert!(fx.workspace.job_dir("bad", &run).exists());
}

#[tokio::test]
async fn test_same_file_names_never_collide() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::default());

    let jobs = vec![
        writes("first", "data.bin", "one"),
        writes("second", "data.bin", "two"),
    ];

    let report = fx.batcher(&service).execute("nightly", jobs).await;
    assert!(report.is_successful());

    let stored = service.stored.lock().unwrap();
    let mut contents: Vec<(String, Vec<(String, Vec<u8>)>)> = stored
        .iter()
        .map(|(p, bytes)| {
            (
                p.file_name().unwrap().to_string_lossy().into_owned(),
                zip_entries(bytes),
            )
        })
        .collect();
    contents.sort();

    assert_eq!(
        contents,
        vec![
            (
                "first.zip".to_string(),
                vec![("data.bin".to_string(), b"one".to_vec())]
            ),
            (
                "second.zip".to_string(),
                vec![("data.bin".to_string(), b"two".to_vec())]
            ),
        ]
    );
}

#[tokio::test]
async fn test_jobs_run_concurrently() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::default());

    // Each job waits for the other's marker; only concurrent execution finishes.
    let marker_dir = fx.workspace.root().join("markers");
    std::fs::create_dir_all(&marker_dir).unwrap();
    let dir = marker_dir.display();
    let jobs = vec![
        sh(
            "left",
            &format!("touch {dir}/left; for i in $(seq 1 100); do [ -e {dir}/right ] && exit 0; sleep 0.05; done; exit 1"),
        ),
        sh(
            "right",
            &format!("touch {dir}/right; for i in $(seq 1 100); do [ -e {dir}/left ] && exit 0; sleep 0.05; done; exit 1"),
        ),
    ];

    let report = fx.batcher(&service).execute("nightly", jobs).await;
    assert!(report.is_successful(), "{:?}", report.jobs);
}

#[tokio::test]
async fn test_failing_command_output_is_still_stored() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::default());

    let job = sh(
        "partial",
        r#"echo partial > "$FROSTY_JOB_ARTIFACTS_DIR/part.txt"; echo boom >&2; exit 2"#,
    );

    let report = fx.batcher(&service).execute("nightly", vec![job]).await;
    let status = &report.jobs[0];

    assert_eq!(status.status, Status::Failure);
    assert!(status.error.starts_with("boom"));
    assert!(status.archive_created);
    assert!(status.transfer_error.is_empty());
    assert_eq!(service.stored_names(), vec!["partial.zip"]);
}

#[tokio::test]
async fn test_run_directory_is_reclaimed() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::default());
    let run = RunId::generate();

    let report = fx
        .batcher(&service)
        .execute_run(run.clone(), "nightly", vec![sh("quiet", "exit 0")])
        .await;

    assert!(report.is_successful());
    assert_eq!(report.run_id, run);
    assert!(!fx.workspace.run_dir(&run).exists());
}

#[tokio::test]
async fn test_reclaim_failure_after_store_fails_job() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService {
        squat_job_dir: true,
        ..Default::default()
    });
    let run = RunId::generate();

    let batcher = fx.batcher(&service);
    let mut statuses = batcher
        .run_jobs(&run, vec![writes("db", "dump.sql", "rows")])
        .await;
    batcher.transfer_archives(&run, &mut statuses).await;

    let db = find(&statuses, "db");
    assert_eq!(db.status, Status::Failure);
    assert!(db.error.contains("failed to remove directory"), "error: {}", db.error);
    assert!(db.transfer_error.is_empty());
    assert!(db.transfer_ended_at.is_some());
    assert_eq!(service.stored_names(), vec!["db.zip"]);

    batcher.finish_run(&run, &statuses).await;
    assert!(!fx.workspace.run_dir(&run).exists());
}

#[tokio::test]
async fn test_archive_missing_at_transfer_is_skipped() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService::default());
    let run = RunId::generate();

    let batcher = fx.batcher(&service);
    let mut statuses = batcher
        .run_jobs(&run, vec![writes("db", "dump.sql", "rows")])
        .await;
    let archive = statuses[0].archive_path.clone().unwrap();
    std::fs::remove_file(&archive).unwrap();

    batcher.transfer_archives(&run, &mut statuses).await;

    let db = find(&statuses, "db");
    assert_eq!(db.status, Status::Success);
    assert!(db.transfer_started_at.is_none());
    assert!(db.transfer_ended_at.is_none());
    assert!(db.transfer_error.is_empty());
    assert_eq!(*service.init_calls.lock().unwrap(), 1);
    assert!(service.stored.lock().unwrap().is_empty());
    assert!(fx.workspace.job_dir("db", &run).exists());
}

#[tokio::test]
async fn test_panicking_job_task_still_reports_once() {
    let fx = Fixture::new();
    let service = Arc::new(RecordingService {
        panic_for: Some("boom".to_string()),
        ..Default::default()
    });

    let jobs = vec![
        sh("boom", "sleep 0.3"),
        writes("fine", "f.txt", "ok"),
    ];

    let before = Utc::now();
    let report = fx.batcher(&service).execute("nightly", jobs).await;

    assert_eq!(report.jobs.len(), 2);

    let boom = find(&report.jobs, "boom");
    assert_eq!(boom.status, Status::Failure);
    assert!(boom.error.contains("job task aborted"), "error: {}", boom.error);
    assert!(!boom.archive_created);
    assert!(boom.transfer_started_at.is_none());
    // Timed from when the task was spawned, not from when it was joined.
    assert!(boom.started_at >= before);
    assert!(boom.elapsed() >= Duration::milliseconds(300), "elapsed: {}", boom.elapsed());

    assert_eq!(find(&report.jobs, "fine").status, Status::Success);
    assert_eq!(service.stored_names(), vec!["fine.zip"]);
}
