//! Shared helpers for multi-member scenarios over the in-process network

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use wolfcollective::collective::Collective;
use wolfcollective::config::ProtocolConfig;
use wolfcollective::identity::{LocalIdentity, NameCache};
use wolfcollective::network::MemoryNetwork;
use wolfcollective::rebalance::StoreInventory;
use wolfcollective::state::Role;
use wolfcollective::store::{ConfigStore, Member, MemoryStore};
use wolfcollective::trust::Fingerprint;

pub struct TestMember {
    pub name: String,
    pub address: String,
    pub certificate: Vec<u8>,
    pub store: Arc<MemoryStore>,
    pub collective: Arc<Collective>,
}

/// Timings short enough for tests
pub fn fast_config() -> ProtocolConfig {
    ProtocolConfig {
        connect_timeout_ms: 500,
        request_timeout_secs: 2,
        stream_idle_timeout_secs: 10,
        keepalive_interval_secs: 1,
        max_concurrent_dials: 8,
        reassimilate_interval_secs: 1,
        rebalance_delay_secs: 1,
        max_redirects: 8,
        retry_base_delay_ms: 100,
        retry_jitter_ms: 200,
        ..ProtocolConfig::default()
    }
}

pub fn address_of(index: usize) -> String {
    format!("10.0.0.{}", index + 1)
}

pub fn certificate_of(name: &str) -> Vec<u8> {
    format!("{}-certificate", name).into_bytes()
}

/// Build a member on `network` around an existing store
pub async fn member(
    network: &Arc<MemoryNetwork>,
    name: &str,
    address: &str,
    store: Arc<MemoryStore>,
) -> TestMember {
    let certificate = certificate_of(name);
    let collective = Collective::new(
        NameCache::fixed(name),
        LocalIdentity::new(certificate.clone()),
        store.clone(),
        Arc::new(network.dialer(address, &certificate)),
        Arc::new(StoreInventory::new(store.clone())),
        fast_config(),
    );
    network.register(address, &certificate, collective.clone()).await;

    TestMember {
        name: name.to_string(),
        address: address.to_string(),
        certificate,
        store,
        collective,
    }
}

/// Members that already know each other, each store advanced to the given
/// transaction count
pub async fn cluster(network: &Arc<MemoryNetwork>, specs: &[(&str, u64)]) -> Vec<TestMember> {
    let mut members = Vec::new();
    for (index, (name, txcount)) in specs.iter().enumerate() {
        let store = Arc::new(MemoryStore::new());
        for (other, (other_name, _)) in specs.iter().enumerate() {
            store
                .add_member(Member::new(
                    other_name,
                    &address_of(other),
                    Fingerprint::of_certificate(&certificate_of(other_name)),
                ))
                .await
                .unwrap();
        }
        let mut seq = 0;
        while store.txcount().await < *txcount {
            store.set(&format!("seed/{}/{}", name, seq), "x").await.unwrap();
            seq += 1;
        }

        members.push(member(network, name, &address_of(index), store).await);
    }
    members
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// `leader` leads with every other listed member following it
pub async fn settled_on(leader: &TestMember, followers: &[&TestMember]) -> bool {
    if leader.collective.role().await != Role::Leader {
        return false;
    }
    for follower in followers {
        if !follower.collective.is_following().await
            || follower.collective.leader().await.as_deref() != Some(leader.address.as_str())
        {
            return false;
        }
    }
    leader.collective.check_quorum().await.is_ok()
}

/// Number of members that believe they lead
pub async fn leader_count(members: &[&TestMember]) -> usize {
    let mut leaders = 0;
    for member in members {
        if member.collective.role().await == Role::Leader {
            leaders += 1;
        }
    }
    leaders
}

pub async fn shutdown_all(network: &Arc<MemoryNetwork>, members: &[TestMember]) {
    for member in members {
        network.take_down(&member.address).await;
        member.collective.shutdown().await;
    }
}
