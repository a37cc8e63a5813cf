//! End-to-end scenarios against a real coordination store.
//!
//! These need an etcd reachable at 127.0.0.1:2379 and are ignored by
//! default:
//!
//! ```text
//! cargo test --test e2e_etcd_tests -- --ignored
//! ```


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use uuid::Uuid;

use cronfleet::config::Config;
use cronfleet::job::{ConcurrencyPolicy, ExecutionStatus, ExecutorKind};
use cronfleet::master::{
    CronWheel, GrpcDispatcher, JobService, SchedulerService, WorkerDiscovery,
};
use cronfleet::metrics::Metrics;
use cronfleet::proto::worker_server::WorkerServer;
use cronfleet::store::{
    EtcdExecutionStore, EtcdJobStore, EtcdLocker, ExecutionStore, JobStore, LeaderElection, Store,
};
use cronfleet::worker::shell_exec::ShellExecutor;
use cronfleet::worker::{ExecutorRegistry, WorkerRegistry, WorkerService};
use test_harness::{assert_eventually, shell_job};

const ELECTION_TTL_SECS: i64 = 3;

async fn connect() -> Store {
    let config = Config {
        leader_election_ttl: Duration::from_secs(ELECTION_TTL_SECS as u64),
        ..Default::default()
    };
    Store::connect(&config)
        .await
        .expect("etcd must be running at 127.0.0.1:2379 for e2e tests")
}

struct TestWorker {
    worker_id: String,
    registry: Option<WorkerRegistry>,
    cancel: CancellationToken,
}

impl TestWorker {
    async fn start(store: &Store, port: u16) -> Self {
        let worker_id = format!("w-{}", Uuid::new_v4());
        let addr = format!("127.0.0.1:{port}");

        let mut executors = ExecutorRegistry::new();
        executors.insert(ExecutorKind::Shell, Arc::new(ShellExecutor::new()));
        let service = WorkerService::new(
            executors,
            Arc::new(EtcdLocker::new(store.client())),
            Arc::new(EtcdExecutionStore::new(store.client())),
            Arc::new(Metrics::new().unwrap()),
            worker_id.clone(),
        );

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let listen = addr.parse().unwrap();
        tokio::spawn(async move {
            Server::builder()
                .add_service(WorkerServer::new(service))
                .serve_with_shutdown(listen, shutdown.cancelled_owned())
                .await
                .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let registry =
            WorkerRegistry::register(store.client(), &worker_id, &addr, ELECTION_TTL_SECS)
                .await
                .unwrap();

        Self {
            worker_id,
            registry: Some(registry),
            cancel,
        }
    }

    async fn stop(mut self) {
        if let Some(registry) = self.registry.take() {
            registry.deregister().await.unwrap();
        }
        self.cancel.cancel();
    }
}

struct TestMaster {
    #[allow(dead_code)]
    node_id: String,
    discovery: Arc<WorkerDiscovery>,
    election: Arc<LeaderElection>,
    jobs: Arc<JobService>,
    cancel: CancellationToken,
}

impl TestMaster {
    async fn start(store: &Store) -> Self {
        let node_id = format!("m-{}", Uuid::new_v4());
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Metrics::new().unwrap());

        let discovery = Arc::new(WorkerDiscovery::new());
        {
            let discovery = discovery.clone();
            let client = store.client();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                discovery.run(client, cancel).await;
            });
        }

        let dispatcher = Arc::new(GrpcDispatcher::new(discovery.clone()));
        let wheel = Arc::new(CronWheel::new(dispatcher));
        let election = Arc::new(LeaderElection::new(
            store.client(),
            node_id.clone(),
            ELECTION_TTL_SECS,
            metrics,
        ));
        let jobs: Arc<dyn JobStore> = Arc::new(EtcdJobStore::new(store.client()));
        let history = Arc::new(EtcdExecutionStore::new(store.client()));
        let job_service = Arc::new(JobService::new(
            jobs.clone(),
            history,
            wheel.clone(),
            election.clone(),
        ));

        let service = SchedulerService::new(
            election.clone(),
            wheel.clone(),
            jobs.clone(),
            node_id.clone(),
        );
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                service.run(cancel).await;
            });
        }

        Self {
            node_id,
            discovery,
            election,
            jobs: job_service,
            cancel,
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
#[ignore = "requires a running etcd at 127.0.0.1:2379"]
async fn fire_and_dispatch_records_success_on_both_workers() {
    let store = connect().await;
    let history = EtcdExecutionStore::new(store.client());

    let w1 = TestWorker::start(&store, 52511).await;
    let w2 = TestWorker::start(&store, 52512).await;
    let master = TestMaster::start(&store).await;

    assert_eventually(
        || async { master.election.is_leader() },
        Duration::from_secs(10),
        "the single master must win the campaign",
    )
    .await;
    assert_eventually(
        || async { master.discovery.worker_count().await == 2 },
        Duration::from_secs(5),
        "both workers must be discovered",
    )
    .await;

    let job_name = format!("e2e-fire-{}", Uuid::new_v4());
    let job = shell_job(&job_name, "*/1 * * * * *", "echo hi");
    master.jobs.save(job).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;

    let records = history.list_by_job(&job_name, 1, 100).await.unwrap();
    let successes: Vec<_> = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Success)
        .collect();
    assert!(
        successes.len() >= 2,
        "expected at least two successful firings, got {records:?}"
    );
    for record in &successes {
        assert!(record.output.contains("hi"));
        assert!(
            record.worker_id == w1.worker_id || record.worker_id == w2.worker_id,
            "unexpected worker: {}",
            record.worker_id
        );
    }

    master.jobs.delete(&job_name).await.unwrap();
    master.stop();
    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd at 127.0.0.1:2379"]
async fn leader_failover_moves_scheduling_to_the_survivor() {
    let store = connect().await;
    let history = EtcdExecutionStore::new(store.client());

    let worker = TestWorker::start(&store, 52521).await;

    let job_name = format!("e2e-failover-{}", Uuid::new_v4());
    let jobs = EtcdJobStore::new(store.client());
    jobs.save(&shell_job(&job_name, "*/1 * * * * *", "echo hi"))
        .await
        .unwrap();

    let master_a = TestMaster::start(&store).await;
    assert_eventually(
        || async { master_a.election.is_leader() },
        Duration::from_secs(10),
        "master A must lead first",
    )
    .await;

    let master_b = TestMaster::start(&store).await;
    assert_eventually(
        || async {
            history
                .list_by_job(&job_name, 1, 10)
                .await
                .map(|r| !r.is_empty())
                .unwrap_or(false)
        },
        Duration::from_secs(10),
        "master A must dispatch at least once",
    )
    .await;

    // Kill A; B must take over within the TTL plus a grace period.
    master_a.stop();
    assert_eventually(
        || async { master_b.election.is_leader() },
        Duration::from_secs(ELECTION_TTL_SECS as u64 + 5),
        "master B must take over leadership",
    )
    .await;

    let count_at_failover = history.list_by_job(&job_name, 1, 100).await.unwrap().len();
    assert_eventually(
        || async {
            history
                .list_by_job(&job_name, 1, 100)
                .await
                .map(|r| r.len() > count_at_failover)
                .unwrap_or(false)
        },
        Duration::from_secs(10),
        "master B must dispatch after taking over",
    )
    .await;

    jobs.delete(&job_name).await.unwrap();
    master_b.stop();
    worker.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd at 127.0.0.1:2379"]
async fn forbid_concurrency_serializes_executions() {
    let store = connect().await;
    let history = EtcdExecutionStore::new(store.client());

    let w1 = TestWorker::start(&store, 52531).await;
    let w2 = TestWorker::start(&store, 52532).await;
    let master = TestMaster::start(&store).await;
    assert_eventually(
        || async { master.election.is_leader() && master.discovery.worker_count().await == 2 },
        Duration::from_secs(10),
        "leader and both workers must be up",
    )
    .await;

    let job_name = format!("e2e-forbid-{}", Uuid::new_v4());
    let mut job = shell_job(&job_name, "*/1 * * * * *", "sleep 3");
    job.concurrency_policy = ConcurrencyPolicy::Forbid;
    master.jobs.save(job).await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;

    let records = history.list_by_job(&job_name, 1, 100).await.unwrap();
    assert!(!records.is_empty(), "the job must have fired");

    // Never two concurrently running executions.
    let running = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Running)
        .count();
    assert!(running <= 1, "at most one running execution, got {records:?}");

    // Overlapping firings lost the lock and were skipped.
    let skipped: Vec<_> = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Failed)
        .collect();
    for record in &skipped {
        assert!(
            record.error.contains("skipped execution"),
            "failed record without skip marker: {record:?}"
        );
        assert!(record.error.contains("lock not acquired"));
    }
    assert!(
        !skipped.is_empty(),
        "a 3s Forbid job firing every second must produce skips"
    );

    master.jobs.delete(&job_name).await.unwrap();
    master.stop();
    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
#[ignore = "requires a running etcd at 127.0.0.1:2379"]
async fn graceful_worker_shutdown_leaves_discovery_promptly() {
    let store = connect().await;

    let w1 = TestWorker::start(&store, 52541).await;
    let w2 = TestWorker::start(&store, 52542).await;
    let master = TestMaster::start(&store).await;
    assert_eventually(
        || async { master.discovery.worker_count().await == 2 },
        Duration::from_secs(5),
        "both workers must be discovered",
    )
    .await;

    w1.stop().await;

    // Revocation removes the key immediately; the watcher must see it
    // well before the TTL.
    assert_eventually(
        || async { master.discovery.worker_count().await == 1 },
        Duration::from_secs(ELECTION_TTL_SECS as u64),
        "the deregistered worker must leave the live set",
    )
    .await;

    master.stop();
    w2.stop().await;
}
