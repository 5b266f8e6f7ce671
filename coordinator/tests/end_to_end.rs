//! End-to-end tests: real branches and a coordinator over loopback TCP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use bankcoord_common::{AccountId, ResourceId};
use bankcoord_coordinator::config::BranchEndpoint;
use bankcoord_coordinator::{Coordinator, CoordinatorConfig, LockGranularity};
use bankcoord_participant::{
    BranchServer, CallbackHandler, Ledger, LedgerHandler, RequestHandler,
};
use bankcoord_protocol::{BranchCommand, Reply};

async fn spawn_branch<H: RequestHandler + 'static>(handler: H) -> SocketAddr {
    let server = BranchServer::bind("127.0.0.1:0", Arc::new(handler))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

struct Cluster {
    coordinator: Arc<Coordinator>,
    addr: SocketAddr,
    ledgers: HashMap<&'static str, Arc<Ledger>>,
}

impl Cluster {
    async fn start(granularity: LockGranularity) -> Self {
        Self::start_with(granularity, Vec::new()).await
    }

    /// Branches `A` and `B` backed by ledgers, plus any scripted extras.
    async fn start_with(
        granularity: LockGranularity,
        extra: Vec<(&'static str, CallbackHandler)>,
    ) -> Self {
        let mut ledgers = HashMap::new();
        let mut branches = Vec::new();

        for name in ["A", "B"] {
            let ledger = Arc::new(Ledger::new());
            let addr = spawn_branch(LedgerHandler::new(ledger.clone())).await;
            ledgers.insert(name, ledger);
            branches.push(BranchEndpoint::new(name, addr.to_string()));
        }
        for (name, handler) in extra {
            let addr = spawn_branch(handler).await;
            branches.push(BranchEndpoint::new(name, addr.to_string()));
        }

        let mut config = CoordinatorConfig::default();
        config.listen_addr = "127.0.0.1".to_string();
        config.listen_port = 0;
        config.lock_config.granularity = granularity;
        config.participant_config.branches = branches;
        config.validate().unwrap();

        let coordinator = Arc::new(Coordinator::new(config, "test-coordinator".to_string()));
        coordinator.connect_participants().await.unwrap();
        let addr = coordinator.start().await.unwrap();
        tokio::spawn(coordinator.clone().serve());

        Self {
            coordinator,
            addr,
            ledgers,
        }
    }

    async fn client(&self) -> Client {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (read, write) = stream.into_split();
        Client {
            lines: BufReader::new(read).lines(),
            writer: write,
        }
    }

    fn balance(&self, account: &str) -> Decimal {
        let account = AccountId::parse(account).unwrap();
        self.ledgers[account.branch.as_str()].balance(&account)
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a reply")
            .unwrap()
            .expect("connection closed")
    }

    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.lines.next_line()).await;
        assert!(next.is_err(), "unexpected reply {:?}", next);
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_deposit_and_commit() {
    let cluster = Cluster::start(LockGranularity::Branch).await;
    let mut client = cluster.client().await;

    client.send("BEGIN").await;
    client.send("DEPOSIT A.foo 100").await;
    assert_eq!(client.recv().await, "OK");
    client.send("COMMIT").await;
    assert_eq!(client.recv().await, "COMMIT OK");

    assert_eq!(cluster.balance("A.foo"), Decimal::from(100));
    eventually(|| cluster.coordinator.active_transaction_count() == 0).await;
    assert_eq!(cluster.coordinator.metrics().transactions_committed, 1);
}

#[tokio::test]
async fn test_overdraft_aborts_at_commit() {
    let cluster = Cluster::start(LockGranularity::Branch).await;
    let mut client = cluster.client().await;

    client.send("BEGIN").await;
    client.send("DEPOSIT A.foo 10").await;
    client.send("COMMIT").await;
    assert_eq!(client.recv().await, "OK");
    assert_eq!(client.recv().await, "COMMIT OK");

    client.send("BEGIN").await;
    client.send("WITHDRAW A.foo 50").await;
    assert_eq!(client.recv().await, "OK");
    client.send("COMMIT").await;
    assert_eq!(client.recv().await, "ABORTED");

    // The write lock was released, so a fresh transaction reads the old value.
    client.send("BEGIN").await;
    client.send("BALANCE A.foo").await;
    assert_eq!(client.recv().await, "A.foo = 10");
    client.send("COMMIT").await;
    assert_eq!(client.recv().await, "COMMIT OK");

    eventually(|| {
        cluster
            .coordinator
            .lock_manager()
            .holders(&ResourceId::new("A"))
            .is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_opposite_order_deadlock() {
    let cluster = Cluster::start(LockGranularity::Branch).await;
    let mut first = cluster.client().await;
    let mut second = cluster.client().await;

    first.send("BEGIN").await;
    first.send("DEPOSIT A.x 1").await;
    assert_eq!(first.recv().await, "OK");

    second.send("BEGIN").await;
    second.send("DEPOSIT B.y 1").await;
    assert_eq!(second.recv().await, "OK");

    first.send("DEPOSIT B.y 1").await;
    eventually(|| cluster.coordinator.metrics().locks_waited == 1).await;

    second.send("DEPOSIT A.x 1").await;
    assert_eq!(second.recv().await, "ABORTED");

    // The survivor is promoted and finishes.
    assert_eq!(first.recv().await, "OK");
    first.send("COMMIT").await;
    assert_eq!(first.recv().await, "COMMIT OK");

    assert_eq!(cluster.coordinator.metrics().deadlocks_detected, 1);
    assert_eq!(cluster.balance("A.x"), Decimal::from(1));
    assert_eq!(cluster.balance("B.y"), Decimal::from(1));
}

#[tokio::test]
async fn test_readers_share_a_branch() {
    let cluster = Cluster::start(LockGranularity::Branch).await;
    let mut first = cluster.client().await;
    let mut second = cluster.client().await;

    first.send("BEGIN").await;
    first.send("BALANCE A.x").await;
    assert_eq!(first.recv().await, "A.x = 0");

    second.send("BEGIN").await;
    second.send("BALANCE A.y").await;
    assert_eq!(second.recv().await, "A.y = 0");

    assert_eq!(
        cluster
            .coordinator
            .lock_manager()
            .holders(&ResourceId::new("A"))
            .len(),
        2
    );
    assert_eq!(cluster.coordinator.metrics().locks_waited, 0);
}

#[tokio::test]
async fn test_writer_waits_for_reader() {
    let cluster = Cluster::start(LockGranularity::Branch).await;
    let mut reader = cluster.client().await;
    let mut writer = cluster.client().await;

    reader.send("BEGIN").await;
    reader.send("BALANCE A.x").await;
    assert_eq!(reader.recv().await, "A.x = 0");

    writer.send("BEGIN").await;
    writer.send("DEPOSIT A.x 5").await;
    eventually(|| cluster.coordinator.metrics().locks_waited == 1).await;
    writer.expect_silence().await;

    reader.send("COMMIT").await;
    assert_eq!(reader.recv().await, "COMMIT OK");
    assert_eq!(writer.recv().await, "OK");
    writer.send("COMMIT").await;
    assert_eq!(writer.recv().await, "COMMIT OK");
    assert_eq!(cluster.balance("A.x"), Decimal::from(5));
}

#[tokio::test]
async fn test_account_granularity_does_not_block_siblings() {
    let cluster = Cluster::start(LockGranularity::Account).await;
    let mut first = cluster.client().await;
    let mut second = cluster.client().await;

    first.send("BEGIN").await;
    first.send("DEPOSIT A.x 1").await;
    assert_eq!(first.recv().await, "OK");

    second.send("BEGIN").await;
    second.send("DEPOSIT A.y 1").await;
    assert_eq!(second.recv().await, "OK");

    assert_eq!(cluster.coordinator.metrics().locks_waited, 0);
}

#[tokio::test]
async fn test_client_abort_rolls_back() {
    let cluster = Cluster::start(LockGranularity::Branch).await;
    let mut client = cluster.client().await;

    client.send("BEGIN").await;
    client.send("DEPOSIT A.x 5").await;
    assert_eq!(client.recv().await, "OK");
    assert_eq!(cluster.balance("A.x"), Decimal::from(5));

    client.send("ABORT").await;
    assert_eq!(client.recv().await, "ABORTED");
    eventually(|| cluster.balance("A.x") == Decimal::ZERO).await;
    eventually(|| cluster.coordinator.active_transaction_count() == 0).await;
}

#[tokio::test]
async fn test_branch_abort_vote_aborts() {
    let refusing = CallbackHandler::new(|request| match request.command {
        BranchCommand::Commit | BranchCommand::Abort => Reply::Aborted,
        _ => Reply::Ok,
    });
    let cluster = Cluster::start_with(LockGranularity::Branch, vec![("C", refusing)]).await;
    let mut client = cluster.client().await;

    client.send("BEGIN").await;
    client.send("DEPOSIT A.x 3").await;
    assert_eq!(client.recv().await, "OK");
    client.send("COMMIT").await;
    assert_eq!(client.recv().await, "ABORTED");

    eventually(|| cluster.coordinator.metrics().transactions_aborted == 1).await;
    assert_eq!(cluster.coordinator.metrics().transactions_committed, 0);
    eventually(|| cluster.coordinator.active_transaction_count() == 0).await;
}

#[tokio::test]
async fn test_disconnect_releases_locks() {
    let cluster = Cluster::start(LockGranularity::Branch).await;
    let mut leaving = cluster.client().await;
    let mut staying = cluster.client().await;

    leaving.send("BEGIN").await;
    leaving.send("DEPOSIT A.x 9").await;
    assert_eq!(leaving.recv().await, "OK");
    drop(leaving);

    staying.send("BEGIN").await;
    staying.send("BALANCE A.x").await;
    assert_eq!(staying.recv().await, "A.x = 0");
}
