mod common;

use common::*;
use std::collections::HashMap;
use warden_core::domain::job::{JobKind, JobStatus};
use warden_core::dto::job::StartJob;
use warden_engine::JobError;
use warden_engine::notifier::DeviceSignal;

fn custom(script: &str) -> StartJob {
    StartJob {
        project: "site".into(),
        kind: JobKind::Custom,
        script: Some(script.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_successful_job_has_contiguous_events_and_full_progress() {
    let h = Harness::new().await;
    let job_id = h.service.start_job(custom("echo hello")).await.unwrap();

    let events = h.events(job_id).await;
    assert_eq!(seqs(&events), (1..=events.len() as u64).collect::<Vec<_>>());
    assert_eq!(events[0].data["status"], "running");
    assert_eq!(events[0].data["project"], "site");
    assert_eq!(events[0].data["kind"], "custom");
    assert_eq!(states(&events).last().map(String::as_str), Some("ok"));
    assert_eq!(progress_values(&events).last().copied(), Some(1.0));
    assert!(logs(&events).contains(&"hello".to_string()));
    assert!(logs(&events).contains(&"[exit 0]".to_string()));

    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Ok);
    assert_eq!(job.progress, 1.0);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.finished_at.is_some());
    assert_eq!(job.cmd, "/bin/sh");
    assert_eq!(job.args, vec!["-c".to_string(), "echo hello".to_string()]);

    assert_eq!(h.notifier.signals().last(), Some(&DeviceSignal::success()));
}

#[tokio::test]
async fn test_explicit_command_and_failure_exit_code() {
    let h = Harness::new().await;
    let req = StartJob {
        project: "site".into(),
        kind: JobKind::Custom,
        cmd: Some("/bin/sh".into()),
        args: vec!["-c".into(), "echo failing >&2; exit 7".into()],
        ..Default::default()
    };
    let job_id = h.service.start_job(req).await.unwrap();

    let events = h.events(job_id).await;
    assert!(logs(&events).contains(&"failing".to_string()));
    assert!(logs(&events).contains(&"[exit 7]".to_string()));
    assert_eq!(states(&events), vec!["running".to_string(), "error".to_string()]);

    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.exit_code, Some(7));
    assert_eq!(h.notifier.signals().last(), Some(&DeviceSignal::failure()));
}

#[tokio::test]
async fn test_percentage_marker_emits_progress() {
    let h = Harness::new().await;
    let job_id = h
        .service
        .start_job(custom("echo '[[PROGRESS 45%]]'"))
        .await
        .unwrap();

    let events = h.events(job_id).await;
    assert_eq!(progress_values(&events), vec![0.45, 1.0]);
}

#[tokio::test]
async fn test_json_progress_line_emits_progress() {
    let h = Harness::new().await;
    let job_id = h
        .service
        .start_job(custom(r#"echo '{"progress":0.2}'"#))
        .await
        .unwrap();

    let events = h.events(job_id).await;
    assert_eq!(progress_values(&events), vec![0.2, 1.0]);
}

#[tokio::test]
async fn test_plain_output_emits_no_progress_until_completion() {
    let h = Harness::new().await;
    let job_id = h.service.start_job(custom("echo just text")).await.unwrap();

    let events = h.events(job_id).await;
    // Only the completion value
    assert_eq!(progress_values(&events), vec![1.0]);
}

#[tokio::test]
async fn test_stage_markers_become_stage_events() {
    let h = Harness::new().await;
    let job_id = h
        .service
        .start_job(custom("echo '[[STAGE compile]]'; echo '[[STAGE compile done shard=2]]'"))
        .await
        .unwrap();

    let events = h.events(job_id).await;
    assert_eq!(stages(&events, "start"), vec!["custom".to_string(), "compile".to_string()]);
    let done: Vec<_> = events
        .iter()
        .filter(|e| e.data["name"] == "compile" && e.data["status"] == "done")
        .collect();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].data["attrs"]["shard"], "2");
}

#[tokio::test]
async fn test_environment_is_filtered() {
    let h = Harness::new().await;
    let mut req = custom("echo \"greeting=$GREETING secret=$SECRET\"");
    req.env = HashMap::from([
        ("GREETING".to_string(), "hi".to_string()),
        ("SECRET".to_string(), "leak".to_string()),
    ]);
    let job_id = h.service.start_job(req).await.unwrap();

    let events = h.events(job_id).await;
    assert!(logs(&events).contains(&"greeting=hi secret=".to_string()));
}

#[tokio::test]
async fn test_start_rejects_bad_requests_synchronously() {
    let h = Harness::new().await;

    let err = h
        .service
        .start_job(StartJob {
            project: "missing".into(),
            ..custom("true")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::ProjectNotFound(_)));

    let err = h
        .service
        .start_job(StartJob {
            project: "site".into(),
            kind: JobKind::Custom,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidRequest(_)));

    assert!(h.service.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_and_list_jobs() {
    let h = Harness::new().await;
    let first = h.service.start_job(custom("true")).await.unwrap();
    h.events(first).await;
    let second = h.service.start_job(custom("true")).await.unwrap();
    h.events(second).await;

    let jobs = h.service.list_jobs(Some("site")).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job_id, second);
    assert_eq!(jobs[1].job_id, first);
    assert!(h.service.list_jobs(Some("blog")).await.unwrap().is_empty());

    let unknown = uuid::Uuid::new_v4();
    assert!(matches!(
        h.service.get_job(unknown).await,
        Err(JobError::NotFound(id)) if id == unknown
    ));
}

#[tokio::test]
async fn test_mid_job_subscriber_gets_replay_then_live() {
    let h = Harness::new().await;
    let job_id = h
        .service
        .start_job(custom("echo first; sleep 1; echo second"))
        .await
        .unwrap();

    // Wait until output is flowing, then subscribe
    for _ in 0..250 {
        if logs(&h.stored_events(job_id).await).contains(&"first".to_string()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let events = h.events(job_id).await;
    assert_eq!(seqs(&events), (1..=events.len() as u64).collect::<Vec<_>>());
    let stored = h.stored_events(job_id).await;
    assert_eq!(seqs(&events), seqs(&stored));
    assert_eq!(logs(&events), logs(&stored));
    let lines = logs(&events);
    let first = lines.iter().position(|l| l == "first").unwrap();
    let second = lines.iter().position(|l| l == "second").unwrap();
    assert!(first < second);
    assert_eq!(states(&events).last().map(String::as_str), Some("ok"));
}

#[tokio::test]
async fn test_cancel_is_recorded_once_and_stops_the_process() {
    let h = Harness::new().await;
    let job_id = h
        .service
        .start_job(custom("sleep 30; echo too-late"))
        .await
        .unwrap();
    h.wait_for_pid(job_id).await;

    h.service.cancel_job(job_id).await.unwrap();
    h.service.cancel_job(job_id).await.unwrap();

    let events = h.events(job_id).await;
    assert_eq!(
        states(&events),
        vec!["running".to_string(), "canceled".to_string()]
    );
    let lines = logs(&events);
    assert_eq!(lines.iter().filter(|l| *l == "[cancel requested]").count(), 1);
    assert!(!lines.contains(&"too-late".to_string()));

    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn test_live_subscriber_sees_cancel_request_before_canceled_state() {
    let h = Harness::new().await;
    let job_id = h.service.start_job(custom("sleep 30")).await.unwrap();
    h.wait_for_pid(job_id).await;

    let stream = h.service.subscribe_events(job_id).await.unwrap();
    h.service.cancel_job(job_id).await.unwrap();
    let events = tokio::time::timeout(
        std::time::Duration::from_secs(20),
        tokio_stream::StreamExt::collect::<Vec<_>>(stream),
    )
    .await
    .unwrap();

    let cancel_log = events
        .iter()
        .position(|e| e.data == "[cancel requested]")
        .expect("cancel request was not delivered");
    let canceled = events
        .iter()
        .position(|e| e.state_status() == Some("canceled"))
        .expect("canceled state was not delivered");
    assert!(cancel_log < canceled);
    assert_eq!(seqs(&events), (1..=events.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cancel_after_completion_is_a_no_op() {
    let h = Harness::new().await;
    let job_id = h.service.start_job(custom("true")).await.unwrap();
    let before = h.events(job_id).await;

    h.service.cancel_job(job_id).await.unwrap();
    h.service.cancel_job(uuid::Uuid::new_v4()).await.unwrap();

    assert_eq!(seqs(&h.stored_events(job_id).await), seqs(&before));
    assert_eq!(h.job(job_id).await.status, JobStatus::Ok);
}

#[tokio::test]
async fn test_dropping_a_subscription_does_not_affect_the_job() {
    let h = Harness::new().await;
    let job_id = h
        .service
        .start_job(custom("for i in 1 2 3 4 5; do echo line $i; done"))
        .await
        .unwrap();

    drop(h.service.subscribe_events(job_id).await.unwrap());

    let events = h.events(job_id).await;
    assert_eq!(states(&events).last().map(String::as_str), Some("ok"));
    assert_eq!(logs(&events).iter().filter(|l| l.starts_with("line ")).count(), 5);
}
