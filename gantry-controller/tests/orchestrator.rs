mod common;

use common::{Journal, TestAgent, client_job, orchestrator_options, server_job, spawn_agent};
use gantry_client::AgentClient;
use gantry_controller::{
    IterationResults, JobResult, Orchestrator, OrchestratorError, ResultsSink, RunOptions,
    Scenario, ServiceDefinition,
};
use gantry_core::domain::job::{Job, JobState};
use gantry_core::domain::measurement::{MeasurementMetadata, Operation};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
struct CollectingSink(Arc<Mutex<Vec<IterationResults>>>);

impl CollectingSink {
    fn iterations(&self) -> Vec<IterationResults> {
        self.0.lock().unwrap().clone()
    }
}

impl ResultsSink for CollectingSink {
    fn write(&mut self, results: &IterationResults) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(results.clone());
        Ok(())
    }
}

fn service(name: &str, agent: &TestAgent, job: Job) -> ServiceDefinition {
    ServiceDefinition {
        name: name.to_string(),
        endpoints: vec![agent.url.clone()],
        job,
        attachments: Vec::new(),
    }
}

fn scenario(services: Vec<ServiceDefinition>) -> Scenario {
    Scenario {
        name: "test".to_string(),
        services,
        dependencies: Vec::new(),
    }
}

fn orchestrator(scenario: Scenario, run: RunOptions, sink: &CollectingSink) -> Orchestrator {
    Orchestrator::new(scenario, run)
        .with_options(orchestrator_options())
        .with_run_id("our-run")
        .with_sink(Box::new(sink.clone()))
}

async fn states(agent: &TestAgent) -> Vec<JobState> {
    agent.repository.list().await.iter().map(|j| j.state).collect()
}

/// Adds a metadata entry named "marker" to `service` once it runs on `agent`
fn mark_when_running(agent: &TestAgent, service: &str) -> tokio::task::JoinHandle<()> {
    let repository = Arc::clone(&agent.repository);
    let service = service.to_string();
    tokio::spawn(async move {
        loop {
            let running = repository
                .list()
                .await
                .into_iter()
                .find(|j| j.service == service && j.state == JobState::Running);
            if let Some(job) = running {
                repository
                    .update(job.id, |j| {
                        j.metadata.push(MeasurementMetadata {
                            source: "test".to_string(),
                            name: "marker".to_string(),
                            aggregate: Operation::Max,
                            reduce: Operation::Max,
                            short_description: String::new(),
                            long_description: String::new(),
                            format: String::new(),
                        })
                    })
                    .await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

fn has_marker(result: &JobResult) -> bool {
    result.job.metadata.iter().any(|m| m.name == "marker")
}

fn result_of<'a>(iteration: &'a IterationResults, service: &str) -> &'a JobResult {
    iteration.jobs.iter().find(|r| r.service == service).unwrap()
}

/// Runs an application kept across iterations next to a restarted load
async fn run_with_kept_application(run: RunOptions) -> (Vec<IterationResults>, Journal) {
    let journal = Journal::default();
    let server = spawn_agent(&journal).await;
    let load = spawn_agent(&journal).await;
    let sink = CollectingSink::default();

    let scenario = scenario(vec![
        service("application", &server, server_job()),
        service("load", &load, client_job()),
    ]);
    let run = RunOptions {
        repeat_from: Some("load".to_string()),
        ..run
    };

    let marker = mark_when_running(&server, "application");
    orchestrator(scenario, run, &sink).run().await.unwrap();
    marker.await.unwrap();

    (sink.iterations(), journal)
}

#[tokio::test]
async fn test_services_stop_in_reverse_start_order() {
    let journal = Journal::default();
    let first = spawn_agent(&journal).await;
    let second = spawn_agent(&journal).await;
    let sink = CollectingSink::default();

    let mut scenario = scenario(vec![
        service("c", &first, server_job()),
        service("a", &first, server_job()),
        service("b", &second, server_job()),
    ]);
    scenario.dependencies = vec!["a".to_string(), "b".to_string(), "c".to_string()];

    let summary = orchestrator(scenario, RunOptions::default(), &sink)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.deadlock_retries, 0);
    assert!(!summary.skipped);
    assert_eq!(journal.launched(), vec!["a", "b", "c"]);
    assert_eq!(journal.stopped(), vec!["c", "b", "a"]);

    let iterations = sink.iterations();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].run_id, "our-run");
    assert_eq!(iterations[0].jobs.len(), 3);
    assert!(iterations[0].jobs.iter().all(|r| r.job.state == JobState::Stopped));

    for state in states(&first).await.into_iter().chain(states(&second).await) {
        assert!(matches!(state, JobState::Deleting | JobState::Deleted));
    }
}

#[tokio::test]
async fn test_waits_for_exiting_service() {
    let journal = Journal::default();
    let server = spawn_agent(&journal).await;
    let load = spawn_agent(&journal).await;
    let sink = CollectingSink::default();

    let scenario = scenario(vec![
        service("application", &server, server_job()),
        service("load", &load, client_job()),
    ]);

    let started = Instant::now();
    let summary = orchestrator(scenario, RunOptions::default(), &sink)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.iterations, 1);
    assert!(started.elapsed() >= common::CLIENT_RUNTIME);

    let iterations = sink.iterations();
    let load = iterations[0].jobs.iter().find(|r| r.service == "load").unwrap();
    assert_eq!(load.job.state, JobState::Stopped);
    assert!(load.job.error.is_none());
}

#[tokio::test]
async fn test_repeat_boundary_keeps_leading_services() {
    let journal = Journal::default();
    let server = spawn_agent(&journal).await;
    let load = spawn_agent(&journal).await;
    let sink = CollectingSink::default();

    let scenario = scenario(vec![
        service("application", &server, server_job()),
        service("load", &load, client_job()),
    ]);
    let run = RunOptions {
        iterations: 2,
        repeat_from: Some("load".to_string()),
        ..Default::default()
    };

    let summary = orchestrator(scenario, run, &sink).run().await.unwrap();

    assert_eq!(summary.iterations, 2);
    assert_eq!(journal.launches_of("application"), 1);
    assert_eq!(journal.launches_of("load"), 2);

    let iterations = sink.iterations();
    assert_eq!(iterations.len(), 2);
    assert!(iterations.iter().all(|i| i.jobs.len() == 2));

    // The kept service ran through the first iteration
    let first = iterations[0]
        .jobs
        .iter()
        .find(|r| r.service == "application")
        .unwrap();
    assert_eq!(first.job.state, JobState::Running);
}

#[tokio::test]
async fn test_unsupported_platform_skips_scenario() {
    let journal = Journal::default();
    let agent = spawn_agent(&journal).await;
    let sink = CollectingSink::default();

    let mut job = server_job();
    job.platform.os = Some("plan9".to_string());
    let scenario = scenario(vec![service("application", &agent, job)]);

    let summary = orchestrator(scenario, RunOptions::default(), &sink)
        .run()
        .await
        .unwrap();

    assert!(summary.skipped);
    assert_eq!(summary.iterations, 0);
    assert!(journal.launched().is_empty());
    assert!(agent.repository.list().await.is_empty());
    assert!(sink.iterations().is_empty());
}

#[tokio::test]
async fn test_failed_dependency_aborts_run() {
    let journal = Journal::default();
    let agent = spawn_agent(&journal).await;
    let sink = CollectingSink::default();

    let scenario = scenario(vec![
        service("application", &agent, server_job()),
        service("broken", &agent, server_job()),
        service("load", &agent, client_job()),
    ]);

    let error = orchestrator(scenario, RunOptions::default(), &sink)
        .run()
        .await
        .unwrap_err();

    match error {
        OrchestratorError::ServiceFailed { service, error } => {
            assert_eq!(service, "broken");
            assert!(error.contains("compilation failed"));
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(journal.launched(), vec!["application"]);
    assert_eq!(journal.stopped(), vec!["application"]);
    assert!(sink.iterations().is_empty());
}

/// Another run holds the second agent and queues on the first one after we
/// take it; we must give way and complete once it is gone.
#[tokio::test]
async fn test_yields_to_deadlocked_run() {
    let journal = Journal::default();
    let first = spawn_agent(&journal).await;
    let second = spawn_agent(&journal).await;
    let sink = CollectingSink::default();

    let other = |service: &str| Job {
        run_id: "other-run".to_string(),
        service: service.to_string(),
        ..server_job()
    };

    let on_first = AgentClient::new(&first.url);
    let on_second = AgentClient::new(&second.url);
    let holder = on_second.submit_job(&other("holder")).await.unwrap().job.id;
    drive_until_running(&on_second, holder).await;

    let driver = tokio::spawn(async move {
        // Queue behind our run once it occupies the first agent
        loop {
            let queue = on_first.list_jobs().await.unwrap();
            if queue.iter().any(|j| j.run_id == "our-run" && j.state == JobState::Running) {
                break;
            }
            on_second.touch(holder).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let waiter = on_first.submit_job(&other("waiter")).await.unwrap().job.id;
        let mut running_since = None;
        loop {
            on_second.touch(holder).await.unwrap();
            match on_first.get_state(waiter).await.unwrap() {
                JobState::Initializing => on_first.start_job(waiter).await.unwrap(),
                JobState::Running => {
                    let since = *running_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= Duration::from_millis(300) {
                        break;
                    }
                }
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        on_first.delete_job(waiter).await.unwrap();
        on_second.delete_job(holder).await.unwrap();
    });

    let scenario = scenario(vec![
        service("application", &first, server_job()),
        service("worker", &second, server_job()),
    ]);
    let summary = tokio::time::timeout(
        Duration::from_secs(20),
        orchestrator(scenario, RunOptions::default(), &sink).run(),
    )
    .await
    .unwrap()
    .unwrap();

    driver.await.unwrap();

    assert!(summary.deadlock_retries >= 1);
    assert!(summary.deadlock_retries <= orchestrator_options().max_deadlock_retries);
    assert_eq!(summary.iterations, 1);
    assert!(journal.launches_of("application") >= 2);
    assert_eq!(journal.launches_of("worker"), 1);
    assert_eq!(journal.launches_of("waiter"), 1);
}

async fn drive_until_running(client: &AgentClient, id: u64) {
    for _ in 0..250 {
        match client.get_state(id).await.unwrap() {
            JobState::Running => return,
            JobState::Initializing => client.start_job(id).await.unwrap(),
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} never reached Running", id);
}

#[tokio::test]
async fn test_kept_service_is_reset_between_iterations() {
    let (iterations, journal) = run_with_kept_application(RunOptions {
        iterations: 2,
        ..Default::default()
    })
    .await;

    assert_eq!(iterations.len(), 2);
    assert_eq!(journal.launches_of("application"), 1);
    assert!(has_marker(result_of(&iterations[0], "application")));
    assert!(!has_marker(result_of(&iterations[1], "application")));
}

#[tokio::test]
async fn test_auto_flush_keeps_metadata_of_kept_service() {
    let (iterations, journal) = run_with_kept_application(RunOptions {
        iterations: 2,
        auto_flush: true,
        ..Default::default()
    })
    .await;

    assert_eq!(iterations.len(), 2);
    assert_eq!(journal.launches_of("application"), 1);
    assert!(iterations.iter().all(|i| has_marker(result_of(i, "application"))));
}

#[tokio::test]
async fn test_span_repeats_until_elapsed_and_flushes() {
    let span = Duration::from_millis(600);
    let started = Instant::now();
    let (iterations, journal) = run_with_kept_application(RunOptions {
        span: Some(span),
        ..Default::default()
    })
    .await;

    assert!(started.elapsed() >= span);
    assert!(iterations.len() >= 2);
    assert_eq!(journal.launches_of("application"), 1);
    assert_eq!(journal.launches_of("load"), iterations.len());
    assert!(iterations.iter().all(|i| has_marker(result_of(i, "application"))));
}

#[tokio::test]
async fn test_traces_are_downloaded_on_teardown() {
    let journal = Journal::default();
    let agent = spawn_agent(&journal).await;
    let sink = CollectingSink::default();
    let traces = std::env::temp_dir().join(format!("gantry-traces-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&traces);

    let mut traced = server_job();
    traced.collect_trace = true;
    let scenario = scenario(vec![
        service("application", &agent, traced),
        service("load", &agent, client_job()),
    ]);
    let run = RunOptions {
        trace_directory: traces.clone(),
        ..Default::default()
    };

    orchestrator(scenario, run, &sink).run().await.unwrap();

    let files: Vec<String> = std::fs::read_dir(&traces)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("application-"));
    assert!(files[0].ends_with(".trace"));

    let trace: serde_json::Value =
        serde_json::from_slice(&std::fs::read(traces.join(&files[0])).unwrap()).unwrap();
    assert_eq!(trace["service"], "application");
    assert_eq!(trace["runId"], "our-run");

    let _ = std::fs::remove_dir_all(traces);
}

/// Two runs take one agent each and then queue on each other's agent; the
/// run with the greater id gives way and both complete.
#[tokio::test]
async fn test_crossed_runs_both_complete() {
    let journal = Journal::with_rendezvous(&["x1", "y1"]);
    let first = spawn_agent(&journal).await;
    let second = spawn_agent(&journal).await;
    let x_sink = CollectingSink::default();
    let y_sink = CollectingSink::default();

    let mut x = Orchestrator::new(
        scenario(vec![
            service("x1", &second, server_job()),
            service("x2", &first, server_job()),
        ]),
        RunOptions::default(),
    )
    .with_options(orchestrator_options())
    .with_run_id("run-x")
    .with_sink(Box::new(x_sink.clone()));

    let mut y = Orchestrator::new(
        scenario(vec![
            service("y1", &first, server_job()),
            service("y2", &second, server_job()),
        ]),
        RunOptions::default(),
    )
    .with_options(orchestrator_options())
    .with_run_id("run-y")
    .with_sink(Box::new(y_sink.clone()));

    let (x_summary, y_summary) =
        tokio::time::timeout(Duration::from_secs(30), async { tokio::join!(x.run(), y.run()) })
            .await
            .unwrap();
    let x_summary = x_summary.unwrap();
    let y_summary = y_summary.unwrap();

    assert_eq!(x_summary.iterations, 1);
    assert_eq!(y_summary.iterations, 1);
    assert_eq!(x_summary.deadlock_retries, 0);
    assert!(y_summary.deadlock_retries >= 1);
    assert_eq!(x_sink.iterations().len(), 1);
    assert_eq!(y_sink.iterations().len(), 1);

    assert_eq!(journal.launches_of("x1"), 1);
    assert_eq!(journal.launches_of("x2"), 1);
    assert_eq!(journal.launches_of("y2"), 1);
    assert!(journal.launches_of("y1") >= 2);

    // The abandoned queued job is finished along with the rest
    for _ in 0..100 {
        let pending = states(&first)
            .await
            .into_iter()
            .chain(states(&second).await)
            .any(|state| state != JobState::Deleted);
        if !pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for state in states(&first).await.into_iter().chain(states(&second).await) {
        assert_eq!(state, JobState::Deleted);
    }
}

