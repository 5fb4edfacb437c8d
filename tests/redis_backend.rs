//! Redis queue and result store against a live server.
//!
//! Gated behind `REDIS_URL` so they do not run in CI unless requested:
//!   REDIS_URL=redis://127.0.0.1:6379/ cargo test --test redis_backend

#![cfg(feature = "redis")]

use edgequake_jobkit::orchestrator::durable::redis::{connect, RedisJobQueue, RedisResultStore};
use edgequake_jobkit::orchestrator::durable::{JobCommand, JobQueue, JobState, ResultStore};
use edgequake_jobkit::{ConvertOptions, Task, TaskTarget};
use std::time::Duration;

/// Skip this test if REDIS_URL is not set.
macro_rules! redis_skip_unless_ready {
    () => {{
        match std::env::var("REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                println!("SKIP: set REDIS_URL to run Redis tests");
                return;
            }
        }
    }};
}

fn command() -> (String, JobCommand) {
    let task = Task::new(vec![], ConvertOptions::default(), TaskTarget::InBody);
    (task.task_id.to_string(), JobCommand::convert(task.payload()))
}

async fn queue(url: &str) -> RedisJobQueue {
    let conn = connect(url).await.unwrap();
    // A fresh namespace per test keeps runs isolated.
    RedisJobQueue::new(conn, "conversion_queue")
        .with_namespace(format!("jobkit-test-{}", uuid::Uuid::new_v4().simple()))
}

#[tokio::test]
async fn push_claim_complete() {
    let url = redis_skip_unless_ready!();
    let q = queue(&url).await;
    q.ping().await.unwrap();

    let (a, cmd_a) = command();
    let (b, cmd_b) = command();
    q.push(&a, &cmd_a).await.unwrap();
    q.push(&b, &cmd_b).await.unwrap();
    assert_eq!(q.queue_len().await.unwrap(), 2);
    assert_eq!(q.job_info(&b).await.unwrap().unwrap().position, Some(2));

    let claimed = q.claim("w1").await.unwrap().unwrap();
    assert_eq!(claimed.job_id, a);
    assert_eq!(claimed.command, cmd_a);
    assert_eq!(q.job_info(&a).await.unwrap().unwrap().state, JobState::Started);

    q.complete(&a, "w1", "results:a", Duration::from_secs(60))
        .await
        .unwrap();
    let info = q.job_info(&a).await.unwrap().unwrap();
    assert_eq!(info.state, JobState::Finished);
    assert_eq!(info.result_key.as_deref(), Some("results:a"));
    assert!(q.job_info("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn orphaned_jobs_return_to_the_head() {
    let url = redis_skip_unless_ready!();
    let q = queue(&url).await;
    let (a, cmd_a) = command();
    let (b, cmd_b) = command();
    q.push(&a, &cmd_a).await.unwrap();
    q.push(&b, &cmd_b).await.unwrap();

    q.heartbeat("dead", Duration::from_millis(100)).await.unwrap();
    q.claim("dead").await.unwrap().unwrap();
    assert_eq!(q.live_workers().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(q.live_workers().await.unwrap(), 0);

    assert_eq!(q.requeue_orphans().await.unwrap(), 1);
    let info = q.job_info(&a).await.unwrap().unwrap();
    assert_eq!(info.state, JobState::Queued);
    assert_eq!(info.position, Some(1));
}

#[tokio::test]
async fn unregistered_worker_releases_its_job() {
    let url = redis_skip_unless_ready!();
    let q = queue(&url).await;
    let (a, cmd_a) = command();
    q.push(&a, &cmd_a).await.unwrap();

    q.heartbeat("leaving", Duration::from_secs(60)).await.unwrap();
    q.claim("leaving").await.unwrap().unwrap();
    q.unregister("leaving").await.unwrap();
    assert_eq!(q.live_workers().await.unwrap(), 0);

    assert_eq!(q.requeue_orphans().await.unwrap(), 1);
    assert_eq!(q.job_info(&a).await.unwrap().unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn result_blobs_expire() {
    let url = redis_skip_unless_ready!();
    let store = RedisResultStore::new(connect(&url).await.unwrap());
    let key = format!("jobkit-test:results:{}", uuid::Uuid::new_v4());
    store.put(&key, vec![0x92, 0x01, 0x02], Duration::from_secs(1)).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), Some(vec![0x92, 0x01, 0x02]));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}
