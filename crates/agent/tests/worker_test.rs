//! Agent worker lifecycle tests against an in-memory coordinator

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use raibid_agent::{AgentPool, AgentWorker, WorkerError, WorkerState};
use raibid_common::{JobState, JobStatusReport, ProcessSignal, SignalReason, StatusCode};
use tokio::time::Instant;

fn worker(
    config: raibid_agent::WorkerConfig,
    coordinator: &Arc<FakeCoordinator>,
    runners: &Arc<FakeRunnerFactory>,
) -> AgentWorker {
    AgentWorker::new(config, coordinator.clone(), runners.clone())
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_after_job_runs_exactly_one_job() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1"), offer("job-2")]);
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let config = worker_config("ci-1").with_disconnect_after_job(true);
    let pool = AgentPool::new(vec![worker(config, &coordinator, &runners)]);

    pool.start().await.unwrap();

    assert_eq!(runners.log.runs(), 1);
    assert_eq!(coordinator.report_kinds("job-1"), vec!["start", "finish"]);
    assert!(coordinator.report_kinds("job-2").is_empty());

    let (report, _) = coordinator.finish_report("job-1").unwrap();
    match report {
        JobStatusReport::Finished {
            exit_status,
            signal,
            chunks_failed_count,
            ..
        } => {
            assert_eq!(exit_status, 0);
            assert!(signal.is_none());
            assert_eq!(chunks_failed_count, 0);
        }
        other => panic!("unexpected report {:?}", other),
    }

    assert_eq!(coordinator.uploaded_output(), "hello\n");
    assert_eq!(coordinator.disconnects.lock().len(), 1);
    assert!(pool.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_never_runs_two_jobs_at_once() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    let mut replies: Vec<Reply> = (1..=5).map(|n| offer(&format!("job-{}", n))).collect();
    replies.push(disconnect_action());
    coordinator.script_pings("ci-1", replies);
    let runners = FakeRunnerFactory::new(FakeJob::lasting(Duration::from_secs(3)));

    let pool = AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]);
    pool.start().await.unwrap();

    assert_eq!(runners.log.runs(), 5);
    assert_eq!(runners.log.max_active(), 1);

    // Each job is finished and reported before the next one starts
    let reports = coordinator.reports.lock();
    let order: Vec<String> = reports
        .iter()
        .map(|(id, report, _)| format!("{}:{}", id, report.kind()))
        .collect();
    let expected: Vec<String> = (1..=5)
        .flat_map(|n| vec![format!("job-{}:start", n), format!("job-{}:finish", n)])
        .collect();
    assert_eq!(order, expected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_is_reported_not_fatal() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1"), offer("job-2"), disconnect_action()]);
    let runners = FakeRunnerFactory::new(FakeJob::default());
    runners.push_job(FakeJob {
        exit_code: 2,
        ..Default::default()
    });

    let pool = AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]);
    pool.start().await.unwrap();

    let (failed, _) = coordinator.finish_report("job-1").unwrap();
    assert!(matches!(failed, JobStatusReport::Finished { exit_status: 2, .. }));
    assert_eq!(runners.log.runs(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_runner_that_cannot_start_reports_run_error() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1"), disconnect_action()]);
    let runners = FakeRunnerFactory::failing();

    let pool = AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]);
    pool.start().await.unwrap();

    let (report, _) = coordinator.finish_report("job-1").unwrap();
    match report {
        JobStatusReport::Finished {
            exit_status,
            signal_reason,
            ..
        } => {
            assert_eq!(exit_status, -1);
            assert_eq!(signal_reason, Some(SignalReason::ProcessRunError));
        }
        other => panic!("unexpected report {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_waits_for_grace_period() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1")]);
    let runners = FakeRunnerFactory::new(FakeJob::lasting(Duration::from_secs(600)));

    let config =
        worker_config("ci-1").with_cancel(ProcessSignal::Term, Duration::from_secs(10));
    let pool = Arc::new(AgentPool::new(vec![worker(config, &coordinator, &runners)]));

    let running = pool.clone();
    let task = tokio::spawn(async move { running.start().await });

    wait_until(|| runners.log.runs() == 1).await;
    let stopped_at = Instant::now();
    pool.stop(true);

    task.await.unwrap().unwrap();

    let cancels = runners.log.cancels.lock();
    assert_eq!(cancels.len(), 1);
    let (request, sent_at) = cancels[0];
    assert!(sent_at - stopped_at >= Duration::from_secs(10));
    assert_eq!(request.signal, ProcessSignal::Term);
    assert_eq!(request.reason, SignalReason::AgentStop);

    // Stopped while running: no further pings for work after the job
    assert_eq!(coordinator.report_kinds("job-1"), vec!["start", "finish"]);
    assert_eq!(coordinator.disconnects.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_job_finishing_within_grace_period_is_not_signalled() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1")]);
    let runners = FakeRunnerFactory::new(FakeJob::lasting(Duration::from_secs(5)));

    let config = worker_config("ci-1").with_cancel(ProcessSignal::Term, Duration::from_secs(30));
    let pool = Arc::new(AgentPool::new(vec![worker(config, &coordinator, &runners)]));

    let running = pool.clone();
    let task = tokio::spawn(async move { running.start().await });

    wait_until(|| runners.log.runs() == 1).await;
    pool.stop(true);
    task.await.unwrap().unwrap();

    assert!(runners.log.cancels.lock().is_empty());
    let (report, _) = coordinator.finish_report("job-1").unwrap();
    assert!(matches!(report, JobStatusReport::Finished { exit_status: 0, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_forceful_stop_signals_immediately() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1")]);
    let runners = FakeRunnerFactory::new(FakeJob::lasting(Duration::from_secs(600)));

    let config = worker_config("ci-1").with_cancel(ProcessSignal::Int, Duration::from_secs(10));
    let pool = Arc::new(AgentPool::new(vec![worker(config, &coordinator, &runners)]));

    let running = pool.clone();
    let task = tokio::spawn(async move { running.start().await });

    wait_until(|| runners.log.runs() == 1).await;
    let stopped_at = Instant::now();
    pool.stop(false);
    task.await.unwrap().unwrap();

    let (request, sent_at) = runners.log.cancels.lock()[0];
    assert!(sent_at - stopped_at < Duration::from_secs(1));
    assert_eq!(request.signal, ProcessSignal::Int);

    let (report, _) = coordinator.finish_report("job-1").unwrap();
    match report {
        JobStatusReport::Finished {
            signal,
            signal_reason,
            ..
        } => {
            assert_eq!(signal.as_deref(), Some("SIGINT"));
            assert_eq!(signal_reason, Some(SignalReason::AgentStop));
        }
        other => panic!("unexpected report {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_graceful_stop_escalates() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1")]);
    let runners = FakeRunnerFactory::new(FakeJob::lasting(Duration::from_secs(600)));

    let config = worker_config("ci-1").with_cancel(ProcessSignal::Term, Duration::from_secs(60));
    let pool = Arc::new(AgentPool::new(vec![worker(config, &coordinator, &runners)]));

    let running = pool.clone();
    let task = tokio::spawn(async move { running.start().await });

    wait_until(|| runners.log.runs() == 1).await;
    pool.stop(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let escalated_at = Instant::now();
    pool.stop(true);
    task.await.unwrap().unwrap();

    let (_, sent_at) = runners.log.cancels.lock()[0];
    assert!(sent_at - escalated_at < Duration::from_secs(1));
    assert!(pool.status().workers.iter().all(|w| w.stopping));
}

#[tokio::test(start_paused = true)]
async fn test_kill_follows_when_job_ignores_signal() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1")]);
    let runners = FakeRunnerFactory::new(FakeJob {
        duration: Duration::from_secs(600),
        exit_code: 0,
        ignores_signal: true,
    });

    let config = worker_config("ci-1").with_cancel(ProcessSignal::Term, Duration::from_secs(1));
    let pool = Arc::new(AgentPool::new(vec![worker(config, &coordinator, &runners)]));

    let running = pool.clone();
    let task = tokio::spawn(async move { running.start().await });

    wait_until(|| runners.log.runs() == 1).await;
    pool.stop(false);
    task.await.unwrap().unwrap();

    let (_, signalled_at) = runners.log.cancels.lock()[0];
    let killed_at = runners.log.kills.lock()[0];
    let gap = killed_at - signalled_at;
    assert!(gap >= Duration::from_secs(1) && gap < Duration::from_secs(2), "{:?}", gap);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_of_stubborn_job_takes_two_grace_periods() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1")]);
    let runners = FakeRunnerFactory::new(FakeJob {
        duration: Duration::from_secs(600),
        exit_code: 0,
        ignores_signal: true,
    });

    let config = worker_config("ci-1").with_cancel(ProcessSignal::Term, Duration::from_secs(10));
    let pool = Arc::new(AgentPool::new(vec![worker(config, &coordinator, &runners)]));

    let running = pool.clone();
    let task = tokio::spawn(async move { running.start().await });

    wait_until(|| runners.log.runs() == 1).await;
    let stopped_at = Instant::now();
    pool.stop(true);
    task.await.unwrap().unwrap();

    // Quiet for one grace period, then the cancel signal
    let cancels = runners.log.cancels.lock();
    assert_eq!(cancels.len(), 1);
    let (request, signalled_at) = cancels[0];
    let signalled = signalled_at - stopped_at;
    assert!(
        signalled >= Duration::from_secs(10) && signalled < Duration::from_secs(11),
        "{:?}",
        signalled
    );
    assert_eq!(request.signal, ProcessSignal::Term);
    assert_eq!(request.reason, SignalReason::AgentStop);

    // Then SIGKILL one more grace period later
    let kills = runners.log.kills.lock();
    assert_eq!(kills.len(), 1);
    let killed = kills[0] - stopped_at;
    assert!(
        killed >= Duration::from_secs(20) && killed < Duration::from_secs(21),
        "{:?}",
        killed
    );

    let (report, _) = coordinator.finish_report("job-1").unwrap();
    match report {
        JobStatusReport::Finished {
            exit_status,
            signal,
            signal_reason,
            ..
        } => {
            assert_eq!(exit_status, -1);
            assert_eq!(signal.as_deref(), Some("SIGKILL"));
            assert_eq!(signal_reason, Some(SignalReason::AgentStop));
        }
        other => panic!("unexpected report {:?}", other),
    }
    assert_eq!(coordinator.disconnects.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_waiting_disconnects_at_once() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    let runners = FakeRunnerFactory::new(FakeJob::default());
    let pool = Arc::new(AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]));

    let running = pool.clone();
    let task = tokio::spawn(async move { running.start().await });

    wait_until(|| pool.status().workers[0].state == WorkerState::WaitingForWork).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stopped_at = Instant::now();
    pool.stop(true);
    task.await.unwrap().unwrap();

    let (_, disconnected_at) = coordinator.disconnects.lock()[0];
    assert!(disconnected_at - stopped_at < Duration::from_secs(1));
    assert_eq!(runners.log.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_cancellation_cancels_job() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![offer("job-1"), disconnect_action()]);
    coordinator.set_job_state("job-1", JobState::Canceling);
    let runners = FakeRunnerFactory::new(FakeJob::lasting(Duration::from_secs(600)));

    let pool = AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]);
    pool.start().await.unwrap();

    let (request, _) = runners.log.cancels.lock()[0];
    assert_eq!(request.reason, SignalReason::Cancel);

    let (report, _) = coordinator.finish_report("job-1").unwrap();
    assert!(matches!(
        report,
        JobStatusReport::Finished {
            signal_reason: Some(SignalReason::Cancel),
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_disconnects() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let config = worker_config("ci-1").with_idle_timeout(Duration::from_secs(5));
    let pool = AgentPool::new(vec![worker(config, &coordinator, &runners)]);

    let started = Instant::now();
    pool.start().await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(8), "{:?}", elapsed);
    assert_eq!(coordinator.disconnects.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_waits_for_busy_pool() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("busy", vec![offer("job-1"), disconnect_action()]);
    let runners = FakeRunnerFactory::new(FakeJob::lasting(Duration::from_secs(30)));

    let busy = worker(worker_config("busy"), &coordinator, &runners);
    let idle = worker(
        worker_config("idle").with_idle_timeout(Duration::from_secs(5)),
        &coordinator,
        &runners,
    );
    let pool = AgentPool::new(vec![busy, idle]);
    pool.start().await.unwrap();

    let (_, job_finished_at) = coordinator.finish_report("job-1").unwrap();
    let disconnects = coordinator.disconnects.lock();
    let (_, idle_left_at) = disconnects
        .iter()
        .find(|(name, _)| name == "idle")
        .cloned()
        .unwrap();
    assert!(idle_left_at >= job_finished_at);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_accept_goes_back_to_polling() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings(
        "ci-1",
        vec![offer("job-1"), offer("job-1"), offer("job-1"), disconnect_action()],
    );
    coordinator.fail_accept(StatusCode::UNPROCESSABLE_ENTITY);
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let config = worker_config("ci-1").with_disconnect_after_job(true);
    let pool = AgentPool::new(vec![worker(config, &coordinator, &runners)]);
    pool.start().await.unwrap();

    assert_eq!(Calls::get(&coordinator.calls.accept), 3);
    assert_eq!(Calls::get(&coordinator.calls.ping), 4);
    assert_eq!(runners.log.runs(), 0);
    assert!(coordinator.reports.lock().is_empty());

    // Each ping after a rejected accept waits a full ping interval
    let pings = coordinator.ping_times.lock();
    for pair in pings.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_secs(1),
            "pinged again after {:?}",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_ping_failures_are_retried_then_skipped() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    let server_error = Err(StatusCode::INTERNAL_SERVER_ERROR);
    coordinator.script_pings(
        "ci-1",
        vec![
            server_error.clone(),
            server_error.clone(),
            server_error.clone(),
            server_error,
            disconnect_action(),
        ],
    );
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let pool = AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]);
    pool.start().await.unwrap();

    // Three attempts for the first round, then two more pings
    assert_eq!(Calls::get(&coordinator.calls.ping), 5);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_ping_is_fatal() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![Err(StatusCode::UNAUTHORIZED)]);
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let pool = AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]);
    let err = pool.start().await.unwrap_err();

    assert_eq!(err.failures().len(), 1);
    assert!(matches!(err.failures()[0].error, WorkerError::Rejected(_)));
    assert_eq!(Calls::get(&coordinator.calls.ping), 1);
    // Still told the coordinator it is leaving
    assert_eq!(coordinator.disconnects.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pause_action_takes_no_work() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings(
        "ci-1",
        vec![pause_action(), pause_action(), disconnect_action()],
    );
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let pool = AgentPool::new(vec![worker(worker_config("ci-1"), &coordinator, &runners)]);
    pool.start().await.unwrap();

    assert_eq!(Calls::get(&coordinator.calls.ping), 3);
    assert_eq!(runners.log.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_worker_cannot_start_twice() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("ci-1", vec![disconnect_action()]);
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let mut worker = worker(worker_config("ci-1"), &coordinator, &runners);
    worker.connect().await.unwrap();
    assert_eq!(worker.state(), WorkerState::WaitingForWork);
    worker.start().await.unwrap();
    assert!(matches!(worker.start().await, Err(WorkerError::AlreadyStarted)));

    worker.disconnect().await;
    assert_eq!(worker.state(), WorkerState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_preregistered_identity_skips_register() {
    init_test_tracing();
    let coordinator = FakeCoordinator::new();
    coordinator.script_pings("existing", vec![disconnect_action()]);
    let runners = FakeRunnerFactory::new(FakeJob::default());

    let worker = worker(worker_config("ignored"), &coordinator, &runners)
        .with_identity(coordinator.identity("existing"));
    assert_eq!(worker.name(), "existing");

    let pool = AgentPool::new(vec![worker]);
    pool.start().await.unwrap();

    assert_eq!(Calls::get(&coordinator.calls.register), 0);
    assert_eq!(Calls::get(&coordinator.calls.connect), 1);
    assert_eq!(pool.status().workers[0].state, WorkerState::Disconnected);
    assert_eq!(pool.status().workers[0].name, "existing");
}
