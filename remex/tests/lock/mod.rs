use futures::StreamExt;
use remex::{
    lock::{LockError, LockState, Token},
    member::{Member, MemberClient},
    rpc::{Address, ErrorKind},
    PeerId,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::codec::{Framed, LinesCodec};

use crate::{eventually, within, Network};

async fn states(members: &[Arc<Member>]) -> Vec<LockState> {
    let mut states = Vec::new();
    for member in members {
        states.push(member.lock_state().await);
    }
    states
}

fn acquire_in_background(member: &Arc<Member>) -> JoinHandle<Result<(), LockError>> {
    let member = member.clone();
    tokio::spawn(async move { member.lock().acquire().await })
}

async fn wait_for_request(holder: &Member, from: PeerId) {
    eventually(move || async move {
        holder.display_status().await.request.get(&from).copied().unwrap_or_default() > 0
    })
    .await
}

#[tokio::test]
async fn smallest_id_starts_with_token() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 3).await;

    assert_eq!(states(&members).await, vec![LockState::TokenPresent, LockState::NoToken, LockState::NoToken]);

    for member in &members {
        let status = member.display_status().await;
        println!("Peer {}:\n{}", member.id(), &status);
        assert!(status.request.values().all(|t| *t == 0));
        assert!(status.token.values().all(|t| *t == 0));
    }
}

#[tokio::test]
async fn idle_holder_passes_token_to_requester() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 3).await;

    println!("Peer 3 acquires");
    within(members[2].lock().acquire()).await.unwrap();
    assert_eq!(states(&members).await, vec![LockState::NoToken, LockState::NoToken, LockState::TokenHeld]);

    println!("Peer 3 releases");
    members[2].lock().release().await.unwrap();
    assert_eq!(states(&members).await, vec![LockState::NoToken, LockState::NoToken, LockState::TokenPresent]);

    let status = members[2].display_status().await;
    assert!(status.token[&1] > 0);
    assert!(status.token[&3] > status.token[&1]);
}

#[tokio::test]
async fn holder_keeps_token_without_requests() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 2).await;

    for _ in 0..3 {
        within(members[0].lock().acquire()).await.unwrap();
        assert_eq!(members[0].lock_state().await, LockState::TokenHeld);
        members[0].lock().release().await.unwrap();
        assert_eq!(members[0].lock_state().await, LockState::TokenPresent);
    }
    assert_eq!(members[1].lock_state().await, LockState::NoToken);
}

#[tokio::test]
async fn release_serves_waiting_peer() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 3).await;

    within(members[0].lock().acquire()).await.unwrap();
    let waiting = acquire_in_background(&members[1]);
    wait_for_request(&members[0], 2).await;
    assert_eq!(members[1].lock_state().await, LockState::NoToken);

    members[0].lock().release().await.unwrap();
    within(waiting).await.unwrap().unwrap();
    assert_eq!(states(&members).await, vec![LockState::NoToken, LockState::TokenHeld, LockState::NoToken]);
    members[1].lock().release().await.unwrap();
}

#[tokio::test]
async fn release_skips_unregistered_requester() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 3).await;

    within(members[0].lock().acquire()).await.unwrap();
    let waiting = acquire_in_background(&members[1]);
    wait_for_request(&members[0], 2).await;

    println!("Peer 2 leaves while waiting");
    waiting.abort();
    members[1].leave().await.unwrap();

    members[0].lock().release().await.unwrap();
    assert_eq!(members[0].lock_state().await, LockState::TokenPresent);
    assert_eq!(members[2].lock_state().await, LockState::NoToken);

    let status = members[0].display_status().await;
    assert_eq!(status.request.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(status.token.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
}

#[tokio::test]
async fn release_continues_past_unreachable_peer() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 3).await;

    within(members[0].lock().acquire()).await.unwrap();
    let crashed = acquire_in_background(&members[1]);
    wait_for_request(&members[0], 2).await;
    let waiting = acquire_in_background(&members[2]);
    wait_for_request(&members[0], 3).await;

    println!("Peer 2 crashes");
    crashed.abort();
    members[1].halt().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    members[0].lock().release().await.unwrap();
    within(waiting).await.unwrap().unwrap();
    assert_eq!(members[0].lock_state().await, LockState::NoToken);
    assert_eq!(members[2].lock_state().await, LockState::TokenHeld);
}

#[tokio::test]
async fn release_keeps_token_when_requester_unreachable() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 2).await;

    within(members[0].lock().acquire()).await.unwrap();
    let crashed = acquire_in_background(&members[1]);
    wait_for_request(&members[0], 2).await;

    println!("Peer 2 crashes");
    crashed.abort();
    members[1].halt().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    members[0].lock().release().await.unwrap();
    assert_eq!(members[0].lock_state().await, LockState::TokenPresent);

    println!("Peer 1 acquires again");
    within(members[0].lock().acquire()).await.unwrap();
    members[0].lock().release().await.unwrap();
}

#[tokio::test]
async fn leaving_holder_hands_token_on() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 3).await;

    println!("Peer 1 leaves with the token");
    members[0].leave().await.unwrap();
    assert_eq!(members[1].lock_state().await, LockState::TokenPresent);
    assert_eq!(members[2].lock_state().await, LockState::NoToken);

    within(members[2].lock().acquire()).await.unwrap();
    assert_eq!(members[2].lock_state().await, LockState::TokenHeld);
    members[2].lock().release().await.unwrap();
}

#[tokio::test]
async fn misuse_is_reported() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 2).await;

    assert_eq!(members[1].lock().release().await, Err(LockError::NotHolding));

    within(members[0].lock().acquire()).await.unwrap();
    assert_eq!(members[0].lock().acquire().await, Err(LockError::AlreadyHeld));

    let client = MemberClient::new(members[0].address().clone(), crate::cfg());
    let err = client.obtain_token(&Token(BTreeMap::from([(1, 0), (2, 0)]))).await.unwrap_err();
    assert_eq!(err.remote().map(|err| &err.kind), Some(&ErrorKind::LockMisuse));

    let err = client.request_token(5, 42).await.unwrap_err();
    assert_eq!(err.remote().map(|err| &err.kind), Some(&ErrorKind::LockMisuse));

    members[0].lock().release().await.unwrap();
    assert_eq!(members[0].lock_state().await, LockState::TokenPresent);
}

#[tokio::test]
async fn returned_token_survives_unconfirmed_handoff() {
    crate::init();
    let net = Network::new().await;
    let member = net.join("object").await;
    let client = MemberClient::new(member.address().clone(), crate::cfg());

    println!("Peer 2 is served by hand and never confirms the token");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = Address::new("127.0.0.1", listener.local_addr().unwrap().port());
    client.register_peer(2, &address).await.unwrap();

    let request = {
        let client = client.clone();
        tokio::spawn(async move { client.request_token(1, 2).await })
    };
    let (socket, _) = within(listener.accept()).await.unwrap();
    let mut lines = Framed::new(socket, LinesCodec::new());
    let line = within(lines.next()).await.unwrap().unwrap();
    assert!(line.contains("obtain_token"), "unexpected request {}", line);

    println!("Token comes back and is taken before the handoff fails");
    client.obtain_token(&Token(BTreeMap::from([(1, 1), (2, 1)]))).await.unwrap();
    within(member.lock().acquire()).await.unwrap();
    drop(lines);

    within(request).await.unwrap().unwrap();
    assert_eq!(member.lock_state().await, LockState::TokenHeld);
    assert_eq!(member.lock().acquire().await, Err(LockError::AlreadyHeld));
    member.lock().release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutual_exclusion_under_contention() {
    crate::init();
    let net = Network::new().await;
    let members = net.join_many("object", 4).await;

    let inside = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for member in &members {
        let member = member.clone();
        let inside = inside.clone();
        let entered = entered.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                member.lock().acquire().await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two peers in critical section");
                entered.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                member.lock().release().await.unwrap();
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(60), futures::future::try_join_all(tasks))
        .await
        .expect("peers starved")
        .unwrap();
    assert_eq!(entered.load(Ordering::SeqCst), 20);

    let holders = states(&members).await.into_iter().filter(|state| *state != LockState::NoToken).count();
    assert_eq!(holders, 1);
}
