mod test_harness;

use std::collections::BTreeMap;
use std::time::Duration;

use cyclone::logsink::LogType;
use cyclone::mailbox::MailboxStore;
use cyclone::provision::Provisioner;
use cyclone::scheduler::{JobSpec, JobStatus, JobStore};
use test_harness::{test_config, wait_until, TestNode, DEFINITION, QUEUE};

const JOB_TIMEOUT: Duration = Duration::from_secs(15);

/// Test that a submitted job runs on a provisioned worker and succeeds
#[tokio::test]
async fn test_job_runs_to_success() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let id = node
        .submitter
        .submit(JobSpec::new(QUEUE, DEFINITION, "echo hello from cyclone"))
        .await
        .unwrap();

    let job = node.wait_for_job(QUEUE, &id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.output, "hello from cyclone\n");
    assert!(job.timestamps.running.is_some());
    assert!(job.timestamps.successful.is_some());

    // Stdout went to the log sink under the job id
    let (sink, id) = (&cluster.sink, &id);
    let stdout = wait_until(Duration::from_secs(2), move || async move {
        sink.of_type(LogType::Stdout)
            .into_iter()
            .find(|r| &r.id == id)
    })
    .await;
    assert!(stdout.is_some(), "Job stdout should be shipped");

    cluster.shutdown().await;
}

/// Test that the status log shipper records each transition of a job
#[tokio::test]
async fn test_status_transitions_are_logged() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let id = node
        .submitter
        .submit(JobSpec::new(QUEUE, DEFINITION, "true"))
        .await
        .unwrap();
    node.wait_for_job(QUEUE, &id, JOB_TIMEOUT).await.unwrap();

    let (sink, id) = (&cluster.sink, &id);
    let statuses = wait_until(Duration::from_secs(2), move || async move {
        let statuses: Vec<String> = sink
            .of_type(LogType::System)
            .into_iter()
            .filter(|r| &r.id == id)
            .filter_map(|r| r.data["status"].as_str().map(str::to_string))
            .collect();
        statuses.contains(&"Successful".to_string()).then_some(statuses)
    })
    .await
    .expect("Successful transition should be logged");

    assert_eq!(statuses.first().map(String::as_str), Some("Waiting"));
    assert!(statuses.iter().any(|s| s == "Running"));

    cluster.shutdown().await;
}

/// Test that a failing job uses up its retries before settling as Failed
#[tokio::test]
async fn test_failing_job_is_retried_then_failed() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let id = node
        .submitter
        .submit(JobSpec::new(QUEUE, DEFINITION, "echo attempt; echo broken >&2; exit 1").with_retries(1))
        .await
        .unwrap();

    let job = node.wait_for_job(QUEUE, &id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries_available, 0);
    assert!(job.timestamps.retried.is_some());
    assert!(job.timestamps.failed.is_some());
    assert_eq!(job.output, "attempt\nFAILED\nbroken\n");

    cluster.shutdown().await;
}

/// Test that every member of an array submission runs
#[tokio::test]
async fn test_array_job_members_all_succeed() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let params: Vec<BTreeMap<String, String>> = (1..=5)
        .map(|i| BTreeMap::from([("INDEX".to_string(), i.to_string())]))
        .collect();
    let submitted = node
        .submitter
        .submit_array(JobSpec::new(QUEUE, DEFINITION, "echo member INDEX"), &params)
        .await
        .unwrap();

    for (n, id) in submitted.ids.iter().enumerate() {
        let job = node.wait_for_job(QUEUE, id, JOB_TIMEOUT).await.unwrap();
        assert_eq!(job.status, JobStatus::Successful);
        assert_eq!(job.output, format!("member {}\n", n + 1));
    }

    cluster.shutdown().await;
}

/// Test that a job whose definition has no sizing ratio ends in Error
#[tokio::test]
async fn test_unsized_definition_ends_in_error() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let id = node
        .submitter
        .submit(JobSpec::new(QUEUE, "unconfigured", "true"))
        .await
        .unwrap();

    let job = node.wait_for_job(QUEUE, &id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error.is_some());

    cluster.shutdown().await;
}

/// Test that idle workers wind down and their slots are removed
#[tokio::test]
async fn test_workers_wind_down_after_work() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let id = node
        .submitter
        .submit(JobSpec::new(QUEUE, DEFINITION, "true"))
        .await
        .unwrap();
    node.wait_for_job(QUEUE, &id, JOB_TIMEOUT).await.unwrap();

    let mailbox = node.mailbox_store();
    let (mailbox, provisioner) = (mailbox.as_ref(), node.provisioner.as_ref());
    let drained = wait_until(Duration::from_secs(5), move || async move {
        let idle = mailbox.list().await.unwrap().is_empty() && provisioner.running() == 0;
        idle.then_some(())
    })
    .await;
    assert!(drained.is_some(), "Workers should stop once the queue is empty");

    cluster.shutdown().await;
}

/// Test that deleting a waiting job before it runs leaves nothing behind
#[tokio::test]
async fn test_deleted_job_is_gone() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let id = node
        .submitter
        .submit(JobSpec::new(QUEUE, DEFINITION, "true"))
        .await
        .unwrap();
    assert!(node.submitter.delete(QUEUE, &id).await.unwrap());
    assert!(node.jobs.get(QUEUE, &id).await.unwrap().is_none());
    assert!(!node.submitter.delete(QUEUE, &id).await.unwrap());

    cluster.shutdown().await;
}

/// Test that terminating a busy worker stops its instance
#[tokio::test]
async fn test_terminate_stops_busy_worker() {
    let cluster = TestNode::start(test_config()).await;
    let node = &cluster.node;

    let id = node
        .submitter
        .submit(JobSpec::new(QUEUE, DEFINITION, "sleep 30"))
        .await
        .unwrap();

    let (jobs, id_ref) = (node.jobs.as_ref(), &id);
    let running = wait_until(Duration::from_secs(5), move || async move {
        jobs.get(QUEUE, id_ref)
            .await
            .unwrap()
            .filter(|job| job.status == JobStatus::Running)
    })
    .await;
    assert!(running.is_some(), "Job should start running");

    let slots = node.mailbox_store().list().await.unwrap();
    assert_eq!(slots.len(), 1);
    let slot = slots[0].uuid;

    assert!(node.provisioner.terminate(slot).await.unwrap());
    assert_eq!(node.provisioner.running(), 0);
    assert!(!node.provisioner.terminate(slot).await.unwrap());

    cluster.shutdown().await;
}
