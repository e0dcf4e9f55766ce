//! Parallel workflow scenarios: streaming collection and the staleness
//! circuit breaker keeping a hung worker from stalling the batch.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tabmux::{Registry, WorkerStatus, WorkerTask, Workflow, WorkflowConfig, WorkflowPhase};
use tabmux_runtime::ProtocolClient;
use tabmux_runtime::testing::FakeBrowser;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn five_worker_batch() -> (Arc<Workflow>, FakeBrowser) {
    init_tracing();
    let fake = FakeBrowser::new();
    let client: Arc<dyn ProtocolClient> = Arc::new(fake.clone());
    let registry = Arc::new(Registry::new(client));

    let tasks = (0..5)
        .map(|i| WorkerTask {
            name: format!("w{i}"),
            url: format!("https://shard-{i}.example/scrape"),
        })
        .collect();

    let workflow = Workflow::init(registry, "batch", tasks, WorkflowConfig::default())
        .await
        .unwrap();
    (workflow, fake)
}

#[tokio::test]
async fn one_stale_worker_cannot_stall_the_batch() {
    let (workflow, _fake) = five_worker_batch().await;
    let stuck_payload = json!({"phase": "extracting", "rows": 40});

    // Worker 0 claims progress three times with byte-identical payloads,
    // then goes silent forever.
    for _ in 0..3 {
        workflow
            .update("w0", WorkerStatus::InProgress, Some(stuck_payload.clone()))
            .unwrap();
    }

    for i in 1..5 {
        workflow
            .update(
                &format!("w{i}"),
                WorkerStatus::Success,
                Some(json!({"rows": i * 10})),
            )
            .unwrap();
    }

    // collect() must return in bounded time even though w0 never reports
    // again after tripping the breaker.
    let results = workflow
        .collect_within(Duration::from_secs(2))
        .await
        .expect("bounded collection");

    assert_eq!(results.len(), 5);
    assert_eq!(results[0].name, "w0");
    assert_eq!(results[0].status, WorkerStatus::StaleCompleted);
    assert_eq!(
        results[0].payload,
        Some(stuck_payload),
        "breaker keeps the worker's last payload"
    );
    for result in &results[1..] {
        assert_eq!(result.status, WorkerStatus::Success);
    }
}

#[tokio::test]
async fn partial_collection_streams_exactly_the_finished_workers() {
    let (workflow, _fake) = five_worker_batch().await;

    workflow
        .update("w1", WorkerStatus::Success, Some(json!({"rows": 10})))
        .unwrap();
    workflow
        .update("w3", WorkerStatus::Error, Some(json!("proxy refused")))
        .unwrap();

    // K of N are terminal: collect_partial returns exactly those K.
    let partial = workflow.collect_partial(false);
    let names: Vec<&str> = partial.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["w1", "w3"]);
    assert_eq!(workflow.phase(), WorkflowPhase::PartiallyCollected);

    // The rest finish; a subsequent collect returns all N.
    for name in ["w0", "w2", "w4"] {
        workflow
            .update(name, WorkerStatus::Success, Some(json!({"done": true})))
            .unwrap();
    }
    let all = workflow.collect().await;
    assert_eq!(all.len(), 5);
    assert_eq!(workflow.phase(), WorkflowPhase::Completed);
}

#[tokio::test]
async fn workers_in_a_batch_are_isolated_from_each_other() {
    let (workflow, fake) = five_worker_batch().await;

    for i in 0..5 {
        workflow
            .update(&format!("w{i}"), WorkerStatus::Success, None)
            .unwrap();
    }
    let results = workflow.collect().await;

    // Every workflow worker got its own browsing context.
    let mut contexts: Vec<String> = results
        .iter()
        .map(|r| fake.context_of_target(&r.target_id).unwrap())
        .collect();
    contexts.sort();
    contexts.dedup();
    assert_eq!(contexts.len(), 5);
}

#[tokio::test]
async fn collect_waits_for_live_workers_then_completes() {
    let (workflow, _fake) = five_worker_batch().await;

    let collector = tokio::spawn({
        let workflow = Arc::clone(&workflow);
        async move { workflow.collect().await }
    });

    for i in 0..5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        workflow
            .update(&format!("w{i}"), WorkerStatus::Success, Some(json!(i)))
            .unwrap();
    }

    let results = tokio::time::timeout(Duration::from_secs(2), collector)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.status == WorkerStatus::Success));
}
