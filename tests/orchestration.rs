mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, SERVER, local_files};
use sftp_mover::core::{Action, ErrorKind, ResultSummary, TransferRequest};
use sftp_mover::fs::{SimulatedConnector, SimulatedFs};

#[tokio::test]
async fn authentication_failure_is_one_task_level_result() {
    let h = Harness::new();
    let out = h.local_dir("out");
    h.write_local("out/a.csv", b"a");
    h.write_local("out/b.csv", b"b");
    let connector = Arc::new(SimulatedConnector::new(SERVER, h.remote.clone()).reject_auth());

    let results = h
        .orchestrator()
        .run_to_end(connector, vec![TransferRequest::upload(&out, "/in")], 3)
        .await;

    assert_eq!(results.len(), 1);
    assert!(results[0].file_name.is_none());
    assert_eq!(results[0].error_kind, Some(ErrorKind::Session));
    assert!(results[0].error.as_deref().unwrap().contains(SERVER));
    assert_eq!(local_files(&out), vec!["a.csv", "b.csv"]);
    assert!(h.remote.files_in("/in").is_empty());
}

#[tokio::test]
async fn missing_sftp_root_aborts_the_task() {
    let h = Harness::new();
    let out = h.local_dir("out");
    h.write_local("out/a.csv", b"a");
    let connector = Arc::new(SimulatedConnector::new(SERVER, h.remote.clone()).missing_root());

    let results = h
        .orchestrator()
        .run_to_end(connector, vec![TransferRequest::upload(&out, "/in")], 1)
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error_kind, Some(ErrorKind::Session));
    assert!(results[0].is_task_level());
}

#[tokio::test]
async fn one_failing_group_does_not_stop_its_siblings() {
    let h = Harness::new();
    h.remote.add_dir("/in/a");
    h.remote.add_dir("/in/b");
    h.remote.add_file("/in/b/dup.csv", b"old");
    let a = h.local_dir("a");
    let b = h.local_dir("b");
    h.write_local("a/one.csv", b"1");
    h.write_local("b/dup.csv", b"new");
    h.write_local("b/two.csv", b"2");

    let requests = vec![
        TransferRequest::upload(&b, "/in/b"),
        TransferRequest::upload(h.local("missing"), "/in"),
        TransferRequest::upload(&a, "/in/a"),
    ];
    let results = h.run(requests, 1).await;

    let summary = ResultSummary::from_results(&results);
    assert_eq!(summary.transferred, 2);
    assert_eq!(summary.failed, 2);
    assert!(summary.has_failures());

    assert_eq!(results[0].error_kind, Some(ErrorKind::DuplicateDestination));
    assert_eq!(results[1].last_action(), Some(Action::Uploaded));
    assert_eq!(results[2].error_kind, Some(ErrorKind::PathNotFound));
    assert_eq!(results[3].last_action(), Some(Action::Uploaded));
    assert_eq!(h.remote.read("/in/b/dup.csv").unwrap(), b"old");
}

/// Five groups of two files plus one group whose source is missing.
fn scenario(h: &Harness) -> Vec<TransferRequest> {
    let mut requests = Vec::new();
    for group in 0..5 {
        let dir = h.local_dir(&format!("g{group}"));
        h.write_local(&format!("g{group}/x.csv"), b"x");
        h.write_local(&format!("g{group}/y.csv"), b"y");
        h.remote.add_dir(format!("/in/g{group}"));
        requests.push(TransferRequest::upload(dir, format!("/in/g{group}")));
    }
    requests.push(TransferRequest::upload(h.local("gone"), "/in"));
    requests
}

#[tokio::test]
async fn result_count_does_not_depend_on_concurrency() {
    let mut counts = BTreeMap::new();
    for n in [1, 2, 4, 8] {
        let h = Harness::new();
        let requests = scenario(&h);
        let results = h.run(requests, n).await;

        let summary = ResultSummary::from_results(&results);
        assert_eq!(summary.transferred, 10, "n = {n}");
        assert_eq!(summary.failed, 1, "n = {n}");
        counts.insert(n, results.len());
    }
    assert!(counts.values().all(|&count| count == 11), "{counts:?}");
}

#[tokio::test]
async fn concurrent_groups_keep_their_own_file_order() {
    let h = Harness::with_remote(SimulatedFs::named("remote").with_latency(Duration::from_millis(2)));
    let requests = scenario(&h);
    let results = h.run(requests, 3).await;

    let mut per_group: BTreeMap<_, Vec<String>> = BTreeMap::new();
    for result in results.iter().filter(|r| !r.is_task_level()) {
        per_group
            .entry(result.request_id)
            .or_default()
            .push(result.file_name.clone().unwrap());
    }
    assert_eq!(per_group.len(), 5);
    for names in per_group.values() {
        assert_eq!(names, &vec!["x.csv".to_string(), "y.csv".to_string()]);
    }
}

#[tokio::test]
async fn never_more_groups_than_the_limit() {
    for n in [1, 2, 3] {
        let h = Harness::with_remote(
            SimulatedFs::named("remote").with_latency(Duration::from_millis(5)),
        );
        let requests = scenario(&h);
        let connector = h.connector();
        let orchestrator = h.orchestrator();

        let results = orchestrator.run_to_end(connector.clone(), requests, n).await;

        assert_eq!(results.len(), 11);
        let peak = orchestrator.progress().peak().await;
        assert!((1..=n).contains(&peak), "peak {peak} with limit {n}");
        assert!(connector.connections() <= n);
        assert_eq!(orchestrator.progress().active_count().await, 0);
    }
}

#[tokio::test]
async fn sequential_results_follow_request_order() {
    let h = Harness::new();
    let requests = scenario(&h);
    let ids: Vec<_> = requests.iter().map(|r| r.id).collect();

    let results = h.run(requests, 1).await;

    let mut seen = Vec::new();
    for result in &results {
        let id = result.request_id.unwrap();
        if seen.last() != Some(&id) {
            seen.push(id);
        }
    }
    assert_eq!(seen, ids);
}
