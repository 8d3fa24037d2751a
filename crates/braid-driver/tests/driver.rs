//! End-to-end tests for the driver against an in-memory store and a
//! scripted dispatch service.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use braid_config::Pipeline;
use braid_driver::{
  DispatchError, Driver, DriverConfig, DriverDeps, DriverError, JobState, ObservedTask,
  TaskDispatcher, TaskEvent, TaskRequest, ToleranceMode,
};
use braid_graph::{NodeState, TaskStatus};
use braid_progress::{ChannelSink, ProgressEvent};
use braid_store::{InMemoryStore, JobRecord, StateStore};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Records created tasks and answers status queries from a script.
#[derive(Default)]
struct MockDispatcher {
  created: Option<mpsc::UnboundedSender<TaskRequest>>,
  broken: HashSet<String>,
  statuses: Mutex<HashMap<String, ObservedTask>>,
  watched: Mutex<Vec<String>>,
  unwatched: Mutex<Vec<String>>,
}

impl MockDispatcher {
  fn new(created: mpsc::UnboundedSender<TaskRequest>) -> Self {
    Self {
      created: Some(created),
      ..Default::default()
    }
  }

  fn with_broken(mut self, algorithm: &str) -> Self {
    self.broken.insert(algorithm.to_string());
    self
  }

  fn set_status(&self, task_id: &str, status: TaskStatus, result: Option<Value>) {
    self.statuses.lock().unwrap().insert(
      task_id.to_string(),
      ObservedTask {
        status,
        result,
        error: None,
      },
    );
  }

  fn watched(&self) -> Vec<String> {
    self.watched.lock().unwrap().clone()
  }

  fn unwatched(&self) -> Vec<String> {
    self.unwatched.lock().unwrap().clone()
  }
}

#[async_trait]
impl TaskDispatcher for MockDispatcher {
  async fn create_task(&self, request: TaskRequest) -> Result<(), DispatchError> {
    if self.broken.contains(&request.algorithm_name) {
      return Err(DispatchError::new(format!(
        "no workers for {}",
        request.algorithm_name
      )));
    }
    if let Some(sender) = &self.created {
      let _ = sender.send(request);
    }
    Ok(())
  }

  async fn watch_task(&self, _job_id: &str, task_id: &str) -> Result<(), DispatchError> {
    self.watched.lock().unwrap().push(task_id.to_string());
    Ok(())
  }

  async fn unwatch_task(&self, _job_id: &str, task_id: &str) -> Result<(), DispatchError> {
    self.unwatched.lock().unwrap().push(task_id.to_string());
    Ok(())
  }

  async fn task_status(
    &self,
    _job_id: &str,
    task_id: &str,
  ) -> Result<Option<ObservedTask>, DispatchError> {
    Ok(self.statuses.lock().unwrap().get(task_id).cloned())
  }
}

struct Harness {
  driver: Driver,
  store: Arc<InMemoryStore>,
  dispatcher: Arc<MockDispatcher>,
  created: mpsc::UnboundedReceiver<TaskRequest>,
}

impl Harness {
  fn new(config: DriverConfig) -> Self {
    Self::build(config, Arc::new(InMemoryStore::default()), None)
  }

  fn build(config: DriverConfig, store: Arc<InMemoryStore>, broken: Option<&str>) -> Self {
    let (tx, created) = mpsc::unbounded_channel();
    let mut dispatcher = MockDispatcher::new(tx);
    if let Some(algorithm) = broken {
      dispatcher = dispatcher.with_broken(algorithm);
    }
    let dispatcher = Arc::new(dispatcher);
    let deps = DriverDeps::new(store.clone(), dispatcher.clone());
    Self {
      driver: Driver::new(deps, config),
      store,
      dispatcher,
      created,
    }
  }

  async fn next_task(&mut self) -> TaskRequest {
    timeout(Duration::from_secs(5), self.created.recv())
      .await
      .expect("timed out waiting for a task")
      .expect("dispatcher closed")
  }

  async fn next_tasks(&mut self, count: usize) -> Vec<TaskRequest> {
    let mut tasks = Vec::with_capacity(count);
    for _ in 0..count {
      tasks.push(self.next_task().await);
    }
    tasks.sort_by_key(|t| t.batch_index);
    tasks
  }

  async fn assert_no_task(&mut self) {
    let next = timeout(Duration::from_millis(100), self.created.recv()).await;
    assert!(next.is_err(), "unexpected task: {:?}", next);
  }

  async fn complete(&self, task: &TaskRequest, result: Value) {
    let event = TaskEvent::completed(&task.job_id, &task.task_id, result);
    assert!(self.driver.task_event(event).await);
  }

  async fn fail(&self, task: &TaskRequest, error: &str) {
    let event = TaskEvent::failed(&task.job_id, &task.task_id, error);
    assert!(self.driver.task_event(event).await);
  }
}

fn pipeline(value: Value) -> Pipeline {
  serde_json::from_value(value).unwrap()
}

fn chain() -> Pipeline {
  pipeline(json!({
    "name": "chain",
    "flowInput": { "x": 1 },
    "nodes": [
      { "nodeName": "a", "algorithmName": "echo", "input": ["@flowInput.x"] },
      { "nodeName": "b", "algorithmName": "echo", "input": ["@a"] }
    ]
  }))
}

fn fan_out(tolerance: f64) -> Pipeline {
  pipeline(json!({
    "name": "fan-out",
    "flowInput": { "files": ["f1", "f2", "f3"] },
    "batchTolerance": tolerance,
    "nodes": [
      { "nodeName": "green", "algorithmName": "scan", "input": ["#@flowInput.files"] },
      { "nodeName": "yellow", "algorithmName": "merge", "input": ["@green"] }
    ]
  }))
}

#[tokio::test]
async fn test_chain_runs_to_completion() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", chain()).await.unwrap();

  let a = h.next_task().await;
  assert_eq!(a.node_name, "a");
  assert_eq!(a.input, vec![json!(1)]);
  assert!(a.task_id.starts_with("echo:"));
  h.assert_no_task().await;

  h.complete(&a, json!({ "n": 2 })).await;
  let b = h.next_task().await;
  assert_eq!(b.node_name, "b");
  assert_eq!(b.input, vec![json!({ "n": 2 })]);

  h.complete(&b, json!("done")).await;
  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Completed);
  let results = outcome.results.unwrap();
  assert_eq!(results.len(), 2);
  assert_eq!(results[1].result, Some(json!("done")));

  let record = h.store.get_job("job-1").await.unwrap().unwrap();
  assert_eq!(record.state, JobState::Completed);
  assert!(record.results.is_some());
  let tasks = h.store.list_tasks("job-1").await.unwrap();
  assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

  assert!(h.dispatcher.watched().contains(&a.task_id));
  assert!(h.dispatcher.unwatched().contains(&a.task_id));
  assert!(!h.driver.is_running("job-1").await);
}

#[tokio::test]
async fn test_task_failure_fails_job() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", chain()).await.unwrap();

  let a = h.next_task().await;
  h.fail(&a, "boom").await;

  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Failed);
  let failure = outcome.failure.unwrap();
  assert_eq!(failure.error, "boom");
  assert_eq!(failure.node.as_deref(), Some("a"));
  assert!(h.created.try_recv().is_err());

  let record = h.store.get_job("job-1").await.unwrap().unwrap();
  assert_eq!(record.state, JobState::Failed);
  assert_eq!(record.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_batch_failure_within_tolerance_passes_null() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", fan_out(34.0)).await.unwrap();

  let green = h.next_tasks(3).await;
  assert_eq!(green[0].input, vec![json!("f1")]);
  assert_eq!(green[2].batch_index, Some(2));

  h.complete(&green[0], json!(10)).await;
  h.fail(&green[1], "corrupt file").await;
  h.complete(&green[2], json!(30)).await;

  let yellow = h.next_task().await;
  assert_eq!(yellow.node_name, "yellow");
  assert_eq!(yellow.input, vec![json!([10, null, 30])]);

  h.complete(&yellow, json!(40)).await;
  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Completed);
  assert_eq!(outcome.results.unwrap().len(), 4);
}

#[tokio::test]
async fn test_batch_over_tolerance_fails_once_batch_is_done() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", fan_out(34.0)).await.unwrap();

  let green = h.next_tasks(3).await;
  h.fail(&green[0], "first").await;
  h.fail(&green[1], "second").await;

  tokio::time::sleep(Duration::from_millis(50)).await;
  assert!(h.driver.is_running("job-1").await);

  h.complete(&green[2], json!(30)).await;
  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Failed);

  let failure = outcome.failure.unwrap();
  assert_eq!(failure.error, "second");
  let tolerance = failure.tolerance.unwrap();
  assert_eq!((tolerance.failed, tolerance.total), (2, 3));
  assert!(h.created.try_recv().is_err());
}

#[tokio::test]
async fn test_fail_fast_tolerance() {
  let config = DriverConfig {
    tolerance_mode: ToleranceMode::FailFast,
    ..Default::default()
  };
  let mut h = Harness::new(config);
  let handle = h.driver.start("job-1", fan_out(34.0)).await.unwrap();

  let green = h.next_tasks(3).await;
  h.fail(&green[0], "first").await;
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert!(h.driver.is_running("job-1").await);

  h.fail(&green[1], "second").await;
  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Failed);
  assert_eq!(outcome.failure.unwrap().tolerance.unwrap().failed, 2);
}

#[tokio::test]
async fn test_pipeline_tolerance_overrides_default() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", fan_out(0.0)).await.unwrap();

  let green = h.next_tasks(3).await;
  h.complete(&green[0], json!(1)).await;
  h.complete(&green[1], json!(2)).await;
  h.fail(&green[2], "one is too many").await;

  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Failed);
}

#[tokio::test]
async fn test_wait_any_fires_once() {
  let mut h = Harness::new(DriverConfig::default());
  let p = pipeline(json!({
    "name": "race",
    "nodes": [
      { "nodeName": "red", "algorithmName": "echo", "input": [1] },
      { "nodeName": "blue", "algorithmName": "echo", "input": [2] },
      { "nodeName": "black", "algorithmName": "echo", "input": ["*@red|@blue"] }
    ]
  }));
  let handle = h.driver.start("job-1", p).await.unwrap();

  let mut entries = h.next_tasks(2).await;
  entries.sort_by(|a, b| a.node_name.cmp(&b.node_name));
  let (blue, red) = (&entries[0], &entries[1]);

  h.complete(blue, json!("from blue")).await;
  let black = h.next_task().await;
  assert_eq!(black.node_name, "black");
  assert_eq!(black.input, vec![json!("from blue")]);

  h.complete(red, json!("from red")).await;
  h.assert_no_task().await;

  h.complete(&black, json!("won")).await;
  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Completed);
}

#[tokio::test]
async fn test_batch_alternative_wins_only_when_whole_batch_is_done() {
  let mut h = Harness::new(DriverConfig::default());
  let p = pipeline(json!({
    "name": "race",
    "nodes": [
      { "nodeName": "red", "algorithmName": "echo", "input": ["#[1, 2]"] },
      { "nodeName": "blue", "algorithmName": "echo", "input": [3] },
      { "nodeName": "black", "algorithmName": "echo", "input": ["*@red|@blue"] }
    ]
  }));
  let handle = h.driver.start("job-1", p).await.unwrap();

  let entries = h.next_tasks(3).await;
  let blue = entries.iter().find(|t| t.node_name == "blue").unwrap();
  let red: Vec<&TaskRequest> = entries.iter().filter(|t| t.node_name == "red").collect();
  assert_eq!(red.len(), 2);

  h.complete(red[0], json!("red-0")).await;
  h.assert_no_task().await;

  h.complete(red[1], json!("red-1")).await;
  let black = h.next_task().await;
  assert_eq!(black.node_name, "black");
  assert_eq!(black.input, vec![json!(["red-0", "red-1"])]);

  h.complete(blue, json!("late blue")).await;
  h.assert_no_task().await;

  h.complete(&black, json!("done")).await;
  assert_eq!(handle.wait().await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_wait_any_waits_for_other_parents() {
  let mut h = Harness::new(DriverConfig::default());
  let p = pipeline(json!({
    "name": "gated-race",
    "nodes": [
      { "nodeName": "base", "algorithmName": "echo", "input": [0] },
      { "nodeName": "red", "algorithmName": "echo", "input": [1] },
      { "nodeName": "blue", "algorithmName": "echo", "input": [2] },
      { "nodeName": "black", "algorithmName": "echo", "input": ["*@red|@blue", "@base"] }
    ]
  }));
  let handle = h.driver.start("job-1", p).await.unwrap();

  let mut entries = h.next_tasks(3).await;
  entries.sort_by(|a, b| a.node_name.cmp(&b.node_name));
  let (base, blue, red) = (&entries[0], &entries[1], &entries[2]);

  h.complete(blue, json!("from blue")).await;
  h.assert_no_task().await;

  h.complete(base, json!("from base")).await;
  let black = h.next_task().await;
  assert_eq!(black.node_name, "black");
  assert_eq!(black.input, vec![json!("from blue"), json!("from base")]);

  h.complete(red, json!("from red")).await;
  h.assert_no_task().await;

  h.complete(&black, json!("done")).await;
  assert_eq!(handle.wait().await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_duplicate_terminal_event_is_ignored() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", chain()).await.unwrap();

  let a = h.next_task().await;
  h.complete(&a, json!(1)).await;
  h.fail(&a, "late").await;
  let b = h.next_task().await;
  h.complete(&b, json!(2)).await;

  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Completed);
  assert_eq!(outcome.results.unwrap()[0].result, Some(json!(1)));
}

#[tokio::test]
async fn test_dispatch_failure_fails_job() {
  let store = Arc::new(InMemoryStore::default());
  let h = Harness::build(DriverConfig::default(), store, Some("broken"));
  let p = pipeline(json!({
    "name": "broken",
    "nodes": [{ "nodeName": "a", "algorithmName": "broken" }]
  }));

  let outcome = h.driver.start("job-1", p).await.unwrap().wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Failed);
  assert!(outcome.failure.unwrap().error.contains("no workers for broken"));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", chain()).await.unwrap();
  let a = h.next_task().await;

  assert!(h.driver.stop("job-1").await);
  let _ = h.driver.stop("job-1").await;

  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Stopped);
  assert!(!h.driver.stop("job-1").await);
  assert!(h.dispatcher.unwatched().contains(&a.task_id));

  let record = h.store.get_job("job-1").await.unwrap().unwrap();
  assert_eq!(record.state, JobState::Stopped);
}

#[tokio::test]
async fn test_invalid_pipelines_are_rejected() {
  let h = Harness::new(DriverConfig::default());

  let cycle = pipeline(json!({
    "name": "cycle",
    "nodes": [
      { "nodeName": "a", "algorithmName": "echo", "input": ["@b"] },
      { "nodeName": "b", "algorithmName": "echo", "input": ["@a"] }
    ]
  }));
  let result = h.driver.start("job-1", cycle).await;
  assert!(matches!(result, Err(DriverError::Graph(_))));

  let empty = pipeline(json!({ "name": "empty", "nodes": [] }));
  let result = h.driver.start("job-2", empty).await;
  assert!(matches!(result, Err(DriverError::Graph(_))));

  assert!(h.store.get_job("job-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_start_rejected() {
  let h = Harness::new(DriverConfig::default());
  let _handle = h.driver.start("job-1", chain()).await.unwrap();

  let result = h.driver.start("job-1", chain()).await;
  assert!(matches!(result, Err(DriverError::JobAlreadyRunning { .. })));
  h.driver.shutdown();
}

#[tokio::test]
async fn test_concurrent_start_leaves_store_alone() {
  let h = Harness::new(DriverConfig::default());
  let (first, second) = tokio::join!(
    h.driver.start("job-1", chain()),
    h.driver.start("job-1", chain())
  );

  let rejected = [&first, &second]
    .iter()
    .filter(|r| matches!(r, Err(DriverError::JobAlreadyRunning { .. })))
    .count();
  assert_eq!(rejected, 1);
  assert!(first.is_ok() || second.is_ok());

  let record = h.store.get_job("job-1").await.unwrap().unwrap();
  assert_eq!(record.state, JobState::Active);
  h.driver.shutdown();
}

#[tokio::test]
async fn test_out_of_range_tolerance_rejected() {
  let h = Harness::new(DriverConfig::default());
  for tolerance in [-5.0, 150.0] {
    let result = h.driver.start("job-1", fan_out(tolerance)).await;
    assert!(matches!(result, Err(DriverError::InvalidTolerance { .. })));
  }

  let strict = Harness::new(DriverConfig {
    default_batch_tolerance: 120.0,
    ..DriverConfig::default()
  });
  let result = strict.driver.start("job-1", chain()).await;
  assert!(matches!(result, Err(DriverError::InvalidTolerance { .. })));

  assert!(h.store.get_job("job-1").await.unwrap().is_none());
  assert!(!h.driver.is_running("job-1").await);
}

#[tokio::test]
async fn test_event_for_unknown_job() {
  let h = Harness::new(DriverConfig::default());
  assert!(!h.driver.task_event(TaskEvent::active("ghost", "echo:1")).await);
}

#[tokio::test]
async fn test_progress_events_reach_sink() {
  let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
  let (created_tx, mut created) = mpsc::unbounded_channel();
  let store = Arc::new(InMemoryStore::default());
  let deps = DriverDeps::new(store, Arc::new(MockDispatcher::new(created_tx)))
    .with_progress(Arc::new(ChannelSink::new(tx)));
  let config = DriverConfig {
    progress_throttle_ms: 0,
    ..Default::default()
  };
  let driver = Driver::new(deps, config);

  let p = pipeline(json!({
    "name": "single",
    "nodes": [{ "nodeName": "a", "algorithmName": "echo" }]
  }));
  let handle = driver.start("job-1", p).await.unwrap();
  let a = created.recv().await.unwrap();
  driver
    .task_event(TaskEvent::completed("job-1", &a.task_id, json!(1)))
    .await;
  handle.wait().await.unwrap();

  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  let last = events.last().unwrap();
  assert_eq!(last.status, JobState::Completed);
  assert_eq!(last.progress, 100.0);
}

#[tokio::test]
async fn test_graph_snapshot_written_on_completion() {
  let mut h = Harness::new(DriverConfig::default());
  let handle = h.driver.start("job-1", chain()).await.unwrap();

  let a = h.next_task().await;
  h.complete(&a, json!(1)).await;
  let b = h.next_task().await;
  h.complete(&b, json!(2)).await;
  handle.wait().await.unwrap();

  let snapshot = h.driver.get_graph("job-1").await.unwrap().unwrap();
  let node = serde_json::to_value(snapshot.node("b").unwrap()).unwrap();
  assert_eq!(node["status"], json!("completed"));
  assert_eq!(node["output"], json!(2));
  assert!(h.driver.get_graph("ghost").await.unwrap().is_none());
}

// Recovery

async fn seed_job(store: &InMemoryStore, job_id: &str, pipeline: Pipeline, tasks: &[NodeState]) {
  store
    .put_job(&JobRecord::new(job_id, pipeline))
    .await
    .unwrap();
  for task in tasks {
    store.put_task(job_id, task).await.unwrap();
  }
}

fn finished(task_id: &str, node: &str, batch_index: Option<usize>, result: Value) -> NodeState {
  let mut state = NodeState::new(task_id, node, "echo", batch_index);
  state.status = TaskStatus::Completed;
  state.result = Some(result);
  state.end_time = Some(Utc::now());
  state
}

#[tokio::test]
async fn test_recovering_finished_job_dispatches_nothing() {
  let mut first = Harness::new(DriverConfig::default());
  let handle = first.driver.start("job-1", chain()).await.unwrap();
  let a = first.next_task().await;
  first.complete(&a, json!(1)).await;
  let b = first.next_task().await;
  first.complete(&b, json!(2)).await;
  let original = handle.wait().await.unwrap();

  let mut second = Harness::build(DriverConfig::default(), first.store.clone(), None);
  let outcome = second
    .driver
    .start("job-1", chain())
    .await
    .unwrap()
    .wait()
    .await
    .unwrap();

  assert_eq!(outcome.state, JobState::Completed);
  assert_eq!(outcome.results, original.results);
  assert!(second.created.try_recv().is_err());
}

#[tokio::test]
async fn test_recovery_replays_task_finished_while_down() {
  let store = Arc::new(InMemoryStore::default());
  let mut running = NodeState::new("echo:a1", "a", "echo", None);
  running.status = TaskStatus::Active;
  seed_job(&store, "job-1", chain(), &[running]).await;

  let mut h = Harness::build(DriverConfig::default(), store, None);
  h.dispatcher
    .set_status("echo:a1", TaskStatus::Completed, Some(json!(5)));
  let handle = h.driver.start("job-1", chain()).await.unwrap();

  let b = h.next_task().await;
  assert_eq!(b.node_name, "b");
  assert_eq!(b.input, vec![json!(5)]);

  h.complete(&b, json!(6)).await;
  let outcome = handle.wait().await.unwrap();
  assert_eq!(outcome.state, JobState::Completed);
}

#[tokio::test]
async fn test_recovery_watches_task_still_running() {
  let store = Arc::new(InMemoryStore::default());
  let mut running = NodeState::new("echo:a1", "a", "echo", None);
  running.status = TaskStatus::Pending;
  seed_job(&store, "job-1", chain(), &[running]).await;

  let mut h = Harness::build(DriverConfig::default(), store, None);
  h.dispatcher.set_status("echo:a1", TaskStatus::Active, None);
  let handle = h.driver.start("job-1", chain()).await.unwrap();

  h.assert_no_task().await;
  assert!(h.dispatcher.watched().contains(&"echo:a1".to_string()));

  h.driver
    .task_event(TaskEvent::completed("job-1", "echo:a1", json!(1)))
    .await;
  let b = h.next_task().await;
  h.complete(&b, json!(2)).await;
  assert_eq!(handle.wait().await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_recovery_dispatches_children_missed_before_crash() {
  let store = Arc::new(InMemoryStore::default());
  seed_job(
    &store,
    "job-1",
    chain(),
    &[finished("echo:a1", "a", None, json!(1))],
  )
  .await;

  let mut h = Harness::build(DriverConfig::default(), store, None);
  let handle = h.driver.start("job-1", chain()).await.unwrap();

  let b = h.next_task().await;
  assert_eq!(b.node_name, "b");
  assert_eq!(b.input, vec![json!(1)]);
  h.assert_no_task().await;

  h.complete(&b, json!(2)).await;
  assert_eq!(handle.wait().await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_recovery_creates_missing_batch_elements() {
  let store = Arc::new(InMemoryStore::default());
  let p = fan_out(34.0);
  seed_job(
    &store,
    "job-1",
    p.clone(),
    &[finished("scan:g1", "green", Some(0), json!(10))],
  )
  .await;

  let mut h = Harness::build(DriverConfig::default(), store, None);
  let handle = h.driver.start("job-1", p).await.unwrap();

  let green = h.next_tasks(2).await;
  assert_eq!(green[0].batch_index, Some(1));
  assert_eq!(green[0].input, vec![json!("f2")]);
  assert_eq!(green[1].batch_index, Some(2));

  h.complete(&green[0], json!(20)).await;
  h.complete(&green[1], json!(30)).await;
  let yellow = h.next_task().await;
  assert_eq!(yellow.input, vec![json!([10, 20, 30])]);

  h.complete(&yellow, json!(60)).await;
  assert_eq!(handle.wait().await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_stopped_job_is_not_resumed() {
  let store = Arc::new(InMemoryStore::default());
  seed_job(&store, "job-1", chain(), &[]).await;
  store
    .update_job_state("job-1", JobState::Stopped, None, None)
    .await
    .unwrap();

  let mut h = Harness::build(DriverConfig::default(), store, None);
  let outcome = h
    .driver
    .start("job-1", chain())
    .await
    .unwrap()
    .wait()
    .await
    .unwrap();

  assert_eq!(outcome.state, JobState::Stopped);
  assert!(h.created.try_recv().is_err());
}

#[tokio::test]
async fn test_recovery_ignores_half_finished_batch_alternative() {
  let store = Arc::new(InMemoryStore::default());
  let p = pipeline(json!({
    "name": "race",
    "nodes": [
      { "nodeName": "red", "algorithmName": "echo", "input": ["#[1, 2]"] },
      { "nodeName": "blue", "algorithmName": "echo", "input": [3] },
      { "nodeName": "black", "algorithmName": "echo", "input": ["*@red|@blue"] }
    ]
  }));
  let mut red_1 = NodeState::new("echo:r2", "red", "echo", Some(1));
  red_1.status = TaskStatus::Active;
  let mut blue = NodeState::new("echo:b1", "blue", "echo", None);
  blue.status = TaskStatus::Active;
  seed_job(
    &store,
    "job-1",
    p.clone(),
    &[finished("echo:r1", "red", Some(0), json!("red-0")), red_1, blue],
  )
  .await;

  let mut h = Harness::build(DriverConfig::default(), store, None);
  h.dispatcher.set_status("echo:r2", TaskStatus::Active, None);
  h.dispatcher.set_status("echo:b1", TaskStatus::Active, None);
  let handle = h.driver.start("job-1", p).await.unwrap();
  h.assert_no_task().await;

  h.driver
    .task_event(TaskEvent::completed("job-1", "echo:r2", json!("red-1")))
    .await;
  let black = h.next_task().await;
  assert_eq!(black.input, vec![json!(["red-0", "red-1"])]);

  h.driver
    .task_event(TaskEvent::completed("job-1", "echo:b1", json!("blue")))
    .await;
  h.complete(&black, json!("done")).await;
  assert_eq!(handle.wait().await.unwrap().state, JobState::Completed);
}
