use remex::{
    fortune::{Database, FortuneClient, FortuneServer},
    lock::LockState,
    rpc::{CallError, ErrorKind},
};
use futures::future::join_all;
use std::{path::PathBuf, sync::Arc};

use crate::Network;

struct TempDb(PathBuf);

impl TempDb {
    async fn new(content: &str) -> Self {
        let path = std::env::temp_dir().join(format!("remex-test-{}.db", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, content).await.unwrap();
        Self(path)
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn server(net: &Network, db: &TempDb) -> Arc<FortuneServer> {
    let database = Database::open(&db.0).await.unwrap();
    FortuneServer::join(crate::cfg(), "127.0.0.1:0", net.client.clone(), database).await.unwrap()
}

#[tokio::test]
async fn read_and_write_through_client() {
    crate::init();
    let net = Network::new().await;
    let db = TempDb::new("").await;
    let server = server(&net, &db).await;
    let client = FortuneClient::new(server.member().address().clone(), crate::cfg());

    println!("Reading from empty database");
    assert_eq!(client.read().await.unwrap(), None);

    println!("Writing fortune");
    client.write("Fortune favours the bold.").await.unwrap();
    assert_eq!(client.read().await.unwrap().as_deref(), Some("Fortune favours the bold."));
    assert_eq!(tokio::fs::read_to_string(&db.0).await.unwrap(), "Fortune favours the bold.\n%\n");
    assert_eq!(server.member().lock_state().await, LockState::TokenPresent);
}

#[tokio::test]
async fn invalid_fortune_is_database_error() {
    crate::init();
    let net = Network::new().await;
    let db = TempDb::new("one\n%\n").await;
    let server = server(&net, &db).await;
    let client = FortuneClient::new(server.member().address().clone(), crate::cfg());

    match client.write("first\n%\nsecond").await {
        Err(CallError::Remote(err)) => assert_eq!(err.kind, ErrorKind::Database),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(server.database().len().await, 1);
    assert_ne!(server.member().lock_state().await, LockState::TokenHeld);
}

#[tokio::test]
async fn servers_take_turns() {
    crate::init();
    let net = Network::new().await;
    let db1 = TempDb::new("from one\n%\n").await;
    let db2 = TempDb::new("from two\n%\n").await;
    let first = server(&net, &db1).await;
    let second = server(&net, &db2).await;

    assert_eq!(first.member().lock_state().await, LockState::TokenPresent);
    assert_eq!(second.member().lock_state().await, LockState::NoToken);

    println!("Reading from second server");
    let client = FortuneClient::new(second.member().address().clone(), crate::cfg());
    assert_eq!(client.read().await.unwrap().as_deref(), Some("from two"));
    assert_eq!(first.member().lock_state().await, LockState::NoToken);
    assert_eq!(second.member().lock_state().await, LockState::TokenPresent);

    println!("Writing to first server");
    first.write("also from one").await.unwrap();
    assert_eq!(first.database().len().await, 2);
    assert_eq!(second.database().len().await, 1);
    assert_eq!(first.member().lock_state().await, LockState::TokenPresent);

    first.leave().await.unwrap();
    assert_eq!(second.member().lock_state().await, LockState::TokenPresent);
    second.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_wait_their_turn() {
    crate::init();
    let net = Network::new().await;
    let db = TempDb::new("").await;
    let server = server(&net, &db).await;
    let address = server.member().address().clone();

    println!("Writing 16 fortunes concurrently");
    let writes = (0..16).map(|n| {
        let client = FortuneClient::new(address.clone(), crate::cfg());
        tokio::spawn(async move { client.write(&format!("fortune {}", n)).await })
    });
    for res in join_all(writes).await {
        res.unwrap().unwrap();
    }

    assert_eq!(server.database().len().await, 16);
    assert_eq!(server.member().lock_state().await, LockState::TokenPresent);
}
