//! End-to-end tests for the write queue over the in-memory bus.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use testfleet::transport::{InMemoryBus, MessageNames};
use testfleet::write_queue::{FileNameRequest, QueueServer, WriteAccessClient};
use testfleet::{WorkerId, WriteQueueConfig};

const WAIT: Duration = Duration::from_millis(50);

struct Harness {
    bus: InMemoryBus,
    names: MessageNames,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<QueueServer<InMemoryBus>>,
}

impl Harness {
    fn client(&self, worker: &str) -> WriteAccessClient {
        WriteAccessClient::new(self.bus.connect(worker), self.names.clone())
    }

    async fn stop(self) -> QueueServer<InMemoryBus> {
        self.shutdown.send(true).unwrap();
        self.server.await.unwrap()
    }
}

async fn start(
    dir: &Path,
    config: WriteQueueConfig,
    configure: impl FnOnce(&QueueServer<InMemoryBus>),
) -> Harness {
    let (bus, inbox) = InMemoryBus::new();
    let mut server = QueueServer::new(bus.clone());
    server
        .init(&config.with_save_path_base(dir))
        .await
        .unwrap();
    configure(&server);

    let names = server.names().clone();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server.run(inbox, shutdown_rx));
    Harness {
        bus,
        names,
        shutdown,
        server,
    }
}

fn record_grants(server: &QueueServer<InMemoryBus>) -> Arc<Mutex<Vec<WorkerId>>> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&order);
    server
        .hooks()
        .on_file_name
        .read_hook("recorder", move |request: &FileNameRequest| {
            sink.lock().unwrap().push(request.worker_id.clone());
            Ok(())
        });
    order
}

#[tokio::test]
async fn test_second_writer_waits_for_release() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        WriteQueueConfig::new().with_max_write_thread_count(1),
        |_| {},
    )
    .await;
    let mut first = harness.client("worker/1");
    let mut second = harness.client("worker/2");

    let first_path = first.acquire("shot-1").await.unwrap();
    assert!(first_path.starts_with(dir.path()));
    assert_eq!(first_path.extension().unwrap(), "png");

    second.request("shot-1").unwrap();
    assert!(timeout(WAIT, second.wait_for_grant("shot-1")).await.is_err());

    first.release("shot-1").unwrap();
    let second_path = timeout(WAIT, second.wait_for_grant("shot-1"))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first_path, second_path);

    let server = harness.stop().await;
    assert_eq!(server.name_list(), vec![second_path]);
    assert_eq!(server.queue().unwrap().granted_count(), 1);
}

#[tokio::test]
async fn test_waiters_are_granted_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut order = None;
    let harness = start(
        dir.path(),
        WriteQueueConfig::new().with_max_write_thread_count(1),
        |server| order = Some(record_grants(server)),
    )
    .await;
    let order = order.unwrap();
    let mut a = harness.client("a");
    let mut b = harness.client("b");
    let mut c = harness.client("c");

    a.acquire("1").await.unwrap();
    c.request("1").unwrap();
    b.request("1").unwrap();
    // Let the server queue both waiters before the slot frees up.
    tokio::time::sleep(Duration::from_millis(10)).await;

    a.release("1").unwrap();
    timeout(WAIT, c.wait_for_grant("1")).await.unwrap().unwrap();
    c.release("1").unwrap();
    timeout(WAIT, b.wait_for_grant("1")).await.unwrap().unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec![WorkerId::from("a"), WorkerId::from("c"), WorkerId::from("b")]
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_capacity_allows_parallel_writers() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        WriteQueueConfig::new().with_max_write_thread_count(3),
        |_| {},
    )
    .await;

    let mut clients: Vec<_> = (0..3).map(|i| harness.client(&format!("w/{}", i))).collect();
    for client in &mut clients {
        timeout(WAIT, client.acquire("r")).await.unwrap().unwrap();
    }
    let mut fourth = harness.client("w/3");
    fourth.request("r").unwrap();
    assert!(timeout(WAIT, fourth.wait_for_grant("r")).await.is_err());

    let server = harness.stop().await;
    let queue = server.queue().unwrap();
    assert_eq!(queue.granted_count(), 3);
    assert_eq!(queue.waiting_count(), 1);
    assert_eq!(server.name_list().len(), 3);
}

#[tokio::test]
async fn test_release_worker_frees_all_its_slots() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        WriteQueueConfig::new().with_max_write_thread_count(2),
        |_| {},
    )
    .await;
    let mut greedy = harness.client("greedy");
    let mut patient = harness.client("patient");

    greedy.acquire("1").await.unwrap();
    greedy.acquire("2").await.unwrap();
    patient.request("1").unwrap();
    assert!(timeout(WAIT, patient.wait_for_grant("1")).await.is_err());

    greedy.release_worker().unwrap();
    timeout(WAIT, patient.wait_for_grant("1"))
        .await
        .unwrap()
        .unwrap();

    let server = harness.stop().await;
    assert_eq!(server.name_list().len(), 1);
    assert_eq!(server.queue().unwrap().granted_count(), 1);
}

#[tokio::test]
async fn test_unreachable_worker_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        WriteQueueConfig::new().with_max_write_thread_count(1),
        |_| {},
    )
    .await;
    let mut holder = harness.client("holder");
    let gone = harness.client("gone");
    let mut next = harness.client("next");

    holder.acquire("1").await.unwrap();
    gone.request("1").unwrap();
    next.request("1").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    harness.bus.disconnect(gone.endpoint().worker_id());

    holder.release("1").unwrap();
    timeout(WAIT, next.wait_for_grant("1"))
        .await
        .unwrap()
        .unwrap();

    let server = harness.stop().await;
    let queue = server.queue().unwrap();
    assert_eq!(queue.state_of(&WorkerId::from("gone"), "1"), None);
    assert_eq!(queue.granted_count(), 1);
}

#[tokio::test]
async fn test_custom_message_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        WriteQueueConfig::new().with_message_prefix("shots"),
        |_| {},
    )
    .await;
    assert_eq!(harness.names.request_write, "shots_request_write");

    let mut client = harness.client("w");
    let path = timeout(WAIT, client.acquire("r")).await.unwrap().unwrap();
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("w-r-"));

    harness.stop().await;
}
