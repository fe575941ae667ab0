//! Multi-member scenarios: leader arbitration, replication and failover

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use wolfcollective::error::Error;
use wolfcollective::network::{ConnectionHandler, Dialer, MemoryNetwork, PeerConnection};
use wolfcollective::replication::{ErrorReply, Message, Request};
use wolfcollective::state::Role;
use wolfcollective::store::{ConfigStore, TxCount, COLLECTIVE_UUID};

const SETTLE: Duration = Duration::from_secs(20);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_highest_txcount_leads() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    for member in &members {
        member.collective.startup().await;
    }

    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);
    assert_eq!(leader_count(&[alpha, beta, gamma]).await, 1);

    // Followers hold the leader's snapshot, not their own seed data
    assert_eq!(beta.store.txcount().await, alpha.store.txcount().await);
    assert!(beta.store.get("seed/alpha/0").await.is_some());
    assert!(beta.store.get("seed/beta/0").await.is_none());
    assert!(alpha.store.global(COLLECTIVE_UUID).await.is_some());
    assert_eq!(
        gamma.store.global(COLLECTIVE_UUID).await,
        alpha.store.global(COLLECTIVE_UUID).await
    );

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_replicate_and_followers_are_read_only() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    for member in &members {
        member.collective.startup().await;
    }
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);

    alpha.store.set("node/n1/collective.manager", "alpha").await.unwrap();
    let replicated = wait_until(Duration::from_secs(5), || async move {
        beta.store.get("node/n1/collective.manager").await.as_deref() == Some("alpha")
            && gamma.store.get("node/n1/collective.manager").await.as_deref() == Some("alpha")
    })
    .await;
    assert!(replicated);
    assert_eq!(gamma.store.txcount().await, alpha.store.txcount().await);

    assert!(matches!(beta.store.set("node/n2/collective.manager", "beta").await, Err(Error::ReadOnly)));

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_and_rejoin_as_follower() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    for member in &members {
        member.collective.startup().await;
    }
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);

    // Leader disappears
    network.take_down(&alpha.address).await;
    alpha.collective.shutdown().await;

    // Equal transaction counts: the naturally smaller name takes over
    assert!(wait_until(SETTLE, || async move { settled_on(beta, &[gamma]).await }).await);
    assert_eq!(leader_count(&[beta, gamma]).await, 1);
    assert!(gamma.store.is_read_only().await);
    assert!(!beta.store.is_read_only().await);
    let (new_leader, other) = (beta, gamma);

    // Writes made after the failover leave the old leader behind
    new_leader.store.set("node/n3/collective.manager", &new_leader.name).await.unwrap();

    // The old leader comes back with its stale store and must follow
    let restarted = member(&network, "alpha", &alpha.address, alpha.store.clone()).await;
    restarted.collective.startup().await;
    let rejoined = &restarted;

    assert!(wait_until(SETTLE, || async move { settled_on(new_leader, &[other, rejoined]).await }).await);
    assert_eq!(leader_count(&[new_leader, other, rejoined]).await, 1);
    assert_eq!(
        restarted.store.get("node/n3/collective.manager").await.as_deref(),
        Some(new_leader.name.as_str())
    );

    let info = new_leader.collective.show().await.unwrap();
    assert_eq!(info.leader, new_leader.name);
    assert_eq!(info.active.len(), 2);
    assert!(info.offline.is_empty());
    assert_eq!(info.quorum, Some(true));

    restarted.collective.shutdown().await;
    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_pair_elects_exactly_one_leader() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("mgt1", 5), ("mgt2", 5)]).await;
    for member in &members {
        member.collective.startup().await;
    }
    let (first, second) = (&members[0], &members[1]);

    // Whoever dials first, the tie goes to mgt1
    assert!(wait_until(SETTLE, || async move { settled_on(first, &[second]).await }).await);
    assert_eq!(leader_count(&[first, second]).await, 1);
    assert_eq!(second.collective.leader().await.as_deref(), Some(first.address.as_str()));

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_show_and_delete() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    for member in &members {
        member.collective.startup().await;
    }
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);

    // Followers ask the leader
    let info = beta.collective.show().await.unwrap();
    assert_eq!(info.leader, "alpha");
    assert_eq!(info.active, vec!["beta", "gamma"]);
    assert_eq!(info.quorum, Some(true));

    assert!(matches!(alpha.collective.delete("beta").await, Err(Error::MemberActive(_))));
    assert!(matches!(alpha.collective.delete("alpha").await, Err(Error::MemberActive(_))));
    assert!(matches!(alpha.collective.delete("delta").await, Err(Error::UnknownMember(_))));

    network.take_down(&gamma.address).await;
    gamma.collective.shutdown().await;
    let offline = wait_until(Duration::from_secs(5), || async move {
        alpha.collective.show().await.is_ok_and(|info| info.offline == vec!["gamma"])
    })
    .await;
    assert!(offline);

    assert_eq!(alpha.collective.delete("gamma").await.unwrap(), "Successfully deleted gamma");
    assert!(alpha.store.member("gamma").await.is_none());
    let removed = wait_until(Duration::from_secs(5), || async move { beta.store.member("gamma").await.is_none() }).await;
    assert!(removed);

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admin_operations_need_quorum() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    let alpha = &members[0];

    // Nobody else is reachable
    network.take_down(&members[1].address).await;
    network.take_down(&members[2].address).await;
    alpha.collective.startup().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(alpha.collective.check_quorum().await.is_err());
    assert!(matches!(alpha.collective.invite("delta").await, Err(Error::DegradedCollective)));
    assert!(matches!(alpha.collective.delete("gamma").await, Err(Error::DegradedCollective)));

    let status = alpha.collective.status().await;
    assert!(!status.quorum);
    assert_ne!(status.role, Role::Follower);

    // A majority coming back restores quorum
    let (beta, gamma) = (&members[1], &members[2]);
    network.bring_up(&beta.address).await;
    network.bring_up(&gamma.address).await;
    beta.collective.startup().await;
    gamma.collective.startup().await;

    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);
    assert!(alpha.collective.invite("delta").await.is_ok());

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_cannot_invite() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    for member in &members {
        member.collective.startup().await;
    }
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);

    assert!(matches!(beta.collective.invite("delta").await, Err(Error::NotLeader(_))));
    assert!(alpha.collective.invite("delta").await.is_ok());

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_keeps_pulling_in_missing_members() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);

    network.take_down(&gamma.address).await;
    alpha.collective.startup().await;
    beta.collective.startup().await;
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta]).await }).await);

    // Let a few sweeps and retry rounds pass with gamma unreachable
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(settled_on(alpha, &[beta]).await);

    // gamma returns without looking for a leader itself
    network.bring_up(&gamma.address).await;
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);
    assert_eq!(leader_count(&[alpha, beta, gamma]).await, 1);

    shutdown_all(&network, &members).await;
}

#[tokio::test]
async fn test_single_member_stays_idle() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 3)]).await;
    let alpha = &members[0];

    alpha.collective.startup().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(alpha.collective.role().await, Role::Uninitialized);
    assert!(alpha.collective.check_quorum().await.is_ok());
    assert!(!alpha.store.is_read_only().await);

    shutdown_all(&network, &members).await;
}

/// Answers like a follower of `leader`
struct Redirector {
    leader: String,
    requests: AtomicUsize,
}

#[async_trait]
impl ConnectionHandler for Redirector {
    async fn handle(self: Arc<Self>, mut conn: PeerConnection) {
        if conn.greet().await.is_err() {
            return;
        }
        if let Ok(Message::Request(_)) = conn.recv().await {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let reply = ErrorReply::new("Cannot assimilate, our leader is in another castle")
                .with_leader(Some(self.leader.clone()));
            let _ = conn.send(&reply.into()).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redirect_leads_to_real_leader() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 3), ("beta", 10), ("gamma", 5)]).await;
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);

    // gamma tries alpha first, which points it at beta
    let redirector = Arc::new(Redirector {
        leader: beta.address.clone(),
        requests: AtomicUsize::new(0),
    });
    network.register(&alpha.address, &alpha.certificate, redirector.clone()).await;

    gamma.collective.startup().await;
    assert!(wait_until(SETTLE, || async move { settled_on(beta, &[gamma]).await }).await);
    assert!(redirector.requests.load(Ordering::SeqCst) >= 1);
    assert!(gamma.store.get("seed/beta/0").await.is_some());

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requester_with_more_transactions_takes_over() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 3), ("beta", 10)]).await;
    let (alpha, beta) = (&members[0], &members[1]);

    // Only beta looks for a leader; idle alpha leads briefly, then hands over
    beta.collective.startup().await;
    assert!(wait_until(SETTLE, || async move { settled_on(beta, &[alpha]).await }).await);
    assert_eq!(leader_count(&[alpha, beta]).await, 1);
    assert!(alpha.store.get("seed/beta/0").await.is_some());
    assert!(alpha.store.get("seed/alpha/0").await.is_none());

    shutdown_all(&network, &members).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_defers_to_member_with_more_transactions() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 5), ("gamma", 5)]).await;
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);

    network.take_down(&alpha.address).await;
    beta.collective.startup().await;
    gamma.collective.startup().await;
    assert!(wait_until(SETTLE, || async move { settled_on(beta, &[gamma]).await }).await);
    assert!(beta.store.txcount().await < alpha.store.txcount().await);

    // alpha comes back without looking for a leader; beta's sweep finds it
    network.bring_up(&alpha.address).await;
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);
    assert_eq!(leader_count(&[alpha, beta, gamma]).await, 1);
    assert!(gamma.store.get("seed/alpha/0").await.is_some());

    shutdown_all(&network, &members).await;
}

async fn assimilate(
    network: &Arc<MemoryNetwork>,
    from: &str,
    certificate: &[u8],
    target: &str,
    name: &str,
    txcount: TxCount,
) -> Message {
    let mut conn = network.dialer(from, certificate).dial(target).await.unwrap();
    conn.request(Request::Assimilate {
        name: name.to_string(),
        txcount,
        followcount: Some(0),
    })
    .await
    .unwrap()
}

fn refusal(reply: Message) -> ErrorReply {
    match reply {
        Message::Error(reply) => reply,
        other => panic!("expected a refusal, got {}", other.type_name()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_assimilation_requests_are_judged() {
    let network = MemoryNetwork::new();
    let members = cluster(&network, &[("alpha", 10), ("beta", 7), ("gamma", 7)]).await;
    for member in &members {
        member.collective.startup().await;
    }
    let (alpha, beta, gamma) = (&members[0], &members[1], &members[2]);
    assert!(wait_until(SETTLE, || async move { settled_on(alpha, &[beta, gamma]).await }).await);
    let stranger = "10.0.0.9";

    // A follower sends other leaders to its own
    let reply = refusal(assimilate(&network, stranger, &gamma.certificate, &beta.address, "gamma", 1_000).await);
    assert_eq!(reply.error, "Already following, assimilate leader first");
    assert_eq!(reply.leader.as_deref(), Some(alpha.address.as_str()));

    // Its own leader is acknowledged
    let txcount = alpha.store.txcount().await;
    let reply = assimilate(&network, &alpha.address, &alpha.certificate, &beta.address, "alpha", txcount).await;
    assert!(matches!(reply, Message::Ack));

    // Fewer transactions lose
    let reply = refusal(assimilate(&network, stranger, &gamma.certificate, &alpha.address, "gamma", 1).await);
    assert_eq!(reply.txcount, Some(txcount));

    // Equal transactions against a leader with quorum lose too
    let reply = refusal(assimilate(&network, stranger, &gamma.certificate, &alpha.address, "gamma", txcount).await);
    assert!(reply.txcount.is_some());

    let reply = refusal(assimilate(&network, stranger, &gamma.certificate, &alpha.address, "delta", 1_000).await);
    assert_eq!(reply.error, "Unrecognized leader, redo invitation process");

    let reply = refusal(assimilate(&network, stranger, b"forged", &alpha.address, "gamma", 1_000).await);
    assert_eq!(reply.error, "Invalid certificate, redo invitation process");

    // None of it disturbed the collective
    assert!(settled_on(alpha, &[beta, gamma]).await);

    shutdown_all(&network, &members).await;
}
