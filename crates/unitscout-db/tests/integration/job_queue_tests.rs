use std::collections::HashSet;
use std::time::Duration;

use unitscout_core::job::{JobKind, JobState, NewJob};
use unitscout_core::job_queue::JobQueue;
use unitscout_db::CrawlJobRepository;

use crate::common::setup_test_db;

fn scrape(code: &str) -> NewJob {
    NewJob::scrape("U1", code).unwrap()
}

async fn make_due(pool: &sqlx::PgPool, job_id: &str) {
    sqlx::query("UPDATE crawl_jobs SET run_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn enqueue_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    assert!(repo.enqueue(scrape("A1")).await.unwrap());

    let job = repo.get_job("scrape-U1-A1").await.unwrap().unwrap();
    assert_eq!(job.kind, JobKind::Scrape);
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.university_id(), "U1");
    assert_eq!(job.unit_code().unwrap(), "A1");
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.backoff.base, Duration::from_secs(5));
    assert!(job.run_at.is_none());
    assert!(job.worker_id.is_none());
}

#[tokio::test]
async fn enqueue_duplicate_of_live_job_is_noop() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    assert!(repo.enqueue(scrape("A1")).await.unwrap());
    assert!(!repo.enqueue(scrape("A1")).await.unwrap());

    repo.claim_job("worker-1").await.unwrap().unwrap();
    assert!(!repo.enqueue(scrape("A1")).await.unwrap());

    let job = repo.get_job("scrape-U1-A1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Active);
    assert_eq!(repo.counts().await.unwrap().active, 1);
}

#[tokio::test]
async fn enqueue_resets_terminal_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue(scrape("A1")).await.unwrap();
    repo.claim_job("worker-1").await.unwrap().unwrap();
    repo.complete_job("scrape-U1-A1").await.unwrap();

    assert!(repo.enqueue(scrape("A1")).await.unwrap());
    let job = repo.get_job("scrape-U1-A1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts_made, 0);
    assert!(job.finished_at.is_none());
}

#[tokio::test]
async fn enqueue_bulk_counts_only_new_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue(scrape("A2")).await.unwrap();
    let batch = vec![scrape("A1"), scrape("A2"), scrape("A3"), scrape("A1")];

    assert_eq!(repo.enqueue_bulk(&batch).await.unwrap(), 2);
    assert_eq!(repo.counts().await.unwrap().waiting, 3);
    assert_eq!(repo.enqueue_bulk(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn delayed_job_becomes_claimable_when_due() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    let job = scrape("A1").with_delay(Some(Duration::from_millis(500)));
    repo.enqueue(job).await.unwrap();

    let stored = repo.get_job("scrape-U1-A1").await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Delayed);
    assert!(stored.run_at.is_some());
    assert!(repo.claim_job("worker-1").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(800)).await;
    let claimed = repo.claim_job("worker-1").await.unwrap();
    assert_eq!(claimed.map(|j| j.id).as_deref(), Some("scrape-U1-A1"));
}

#[tokio::test]
async fn claim_job_sets_active_and_worker() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue(scrape("A1")).await.unwrap();
    let claimed = repo
        .claim_job("worker-1")
        .await
        .unwrap()
        .expect("Should claim the job");

    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert!(claimed.started_at.is_some());
    assert!(repo.claim_job("worker-2").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue_bulk(&[scrape("A1"), scrape("A2"), scrape("A3")])
        .await
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let repo = repo.clone();
            tokio::spawn(async move { repo.claim_job(&format!("worker-{i}")).await.unwrap() })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed.push(job.id);
        }
    }

    let distinct: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), 3);
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn fail_job_schedules_retry_with_backoff() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue(scrape("A1")).await.unwrap();
    repo.claim_job("worker-1").await.unwrap().unwrap();

    let before = chrono::Utc::now();
    let state = repo
        .fail_job("scrape-U1-A1", "[rate_limited] HTTP 429", true)
        .await
        .unwrap();
    assert_eq!(state, JobState::Delayed);

    let job = repo.get_job("scrape-U1-A1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.last_error.as_deref(), Some("[rate_limited] HTTP 429"));
    assert!(job.worker_id.is_none());
    let run_at = job.run_at.unwrap();
    assert!(run_at >= before + chrono::TimeDelta::seconds(4));
    assert!(run_at <= chrono::Utc::now() + chrono::TimeDelta::seconds(6));
    assert!(repo.claim_job("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn fail_job_exhausts_attempts() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool.clone());

    repo.enqueue(scrape("A1").with_max_attempts(2)).await.unwrap();

    repo.claim_job("worker-1").await.unwrap().unwrap();
    let state = repo.fail_job("scrape-U1-A1", "first", true).await.unwrap();
    assert_eq!(state, JobState::Delayed);

    make_due(&pool, "scrape-U1-A1").await;
    let job = repo.claim_job("worker-1").await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 1);

    let state = repo.fail_job("scrape-U1-A1", "second", true).await.unwrap();
    assert_eq!(state, JobState::Failed);

    let job = repo.get_job("scrape-U1-A1").await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 2);
    assert_eq!(job.last_error.as_deref(), Some("second"));
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn fail_job_not_retryable_fails_immediately() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue(scrape("A1")).await.unwrap();
    repo.claim_job("worker-1").await.unwrap().unwrap();

    let state = repo
        .fail_job("scrape-U1-A1", "Invalid job: no unit code", false)
        .await
        .unwrap();
    assert_eq!(state, JobState::Failed);
    assert_eq!(repo.counts().await.unwrap().failed, 1);
}

#[tokio::test]
async fn unknown_job_is_reported() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    assert!(repo.get_job("scrape-U1-missing").await.unwrap().is_none());
    assert!(repo.fail_job("scrape-U1-missing", "x", true).await.is_err());
    assert!(repo.complete_job("scrape-U1-missing").await.is_err());
}

#[tokio::test]
async fn complete_job_sets_completed_state() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue(scrape("A1")).await.unwrap();
    repo.claim_job("worker-1").await.unwrap().unwrap();
    repo.complete_job("scrape-U1-A1").await.unwrap();

    let job = repo.get_job("scrape-U1-A1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    assert!(job.finished_at.is_some());
    assert!(job.worker_id.is_none());
}

#[tokio::test]
async fn release_returns_jobs_to_waiting() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue_bulk(&[scrape("A1"), scrape("A2"), scrape("A3")])
        .await
        .unwrap();
    let first = repo.claim_job("worker-1").await.unwrap().unwrap();
    repo.claim_job("worker-1").await.unwrap().unwrap();
    repo.claim_job("worker-2").await.unwrap().unwrap();

    repo.release_job(&first.id).await.unwrap();
    assert_eq!(repo.release_worker_jobs("worker-1").await.unwrap(), 1);

    let counts = repo.counts().await.unwrap();
    assert_eq!(counts.waiting, 2);
    assert_eq!(counts.active, 1);
    assert_eq!(counts.pending(), 3);
}

#[tokio::test]
async fn list_jobs_filters_by_state() {
    let (pool, _container) = setup_test_db().await;
    let repo = CrawlJobRepository::new(pool);

    repo.enqueue_bulk(&[scrape("A1"), scrape("A2")]).await.unwrap();
    repo.enqueue(NewJob::discovery("U1").unwrap()).await.unwrap();
    repo.claim_job("worker-1").await.unwrap().unwrap();

    assert_eq!(repo.list_jobs(None, 10).await.unwrap().len(), 3);
    assert_eq!(repo.list_jobs(None, 2).await.unwrap().len(), 2);
    assert_eq!(repo.list_jobs(Some(JobState::Waiting), 10).await.unwrap().len(), 2);
    assert_eq!(repo.list_jobs(Some(JobState::Failed), 10).await.unwrap().len(), 0);
}
