//! Manager Rebalancing
//!
//! Every managed node names the collective member that manages it and,
//! optionally, an expression of members allowed to take over. When a manager
//! drops out of the collective, its nodes are handed to the least loaded
//! live candidate.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::replication::protocol::CollectiveInfo;
use crate::state::arbitration::{natural_cmp, natural_key};
use crate::store::ConfigStore;

const NODE_PREFIX: &str = "node/";
const MANAGER_ATTRIBUTE: &str = "collective.manager";
const CANDIDATES_ATTRIBUTE: &str = "collective.managercandidates";

/// Source of managed-node attributes
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Nodes currently managed by `manager`
    async fn nodes_managed_by(&self, manager: &str) -> Result<Vec<String>>;

    /// Candidate expression for a node, if any
    async fn manager_candidates(&self, node: &str) -> Result<Option<String>>;

    /// Expand a member expression into member names
    async fn expand(&self, expression: &str) -> Result<Vec<String>>;

    /// Hand `node` to `manager`
    async fn assign_manager(&self, node: &str, manager: &str) -> Result<()>;
}

/// One reassignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub node: String,
    pub from: String,
    pub to: String,
}

/// Work out reassignments for nodes managed by offline members
pub async fn plan_rebalance(
    inventory: &dyn NodeInventory,
    info: &CollectiveInfo,
) -> Result<Vec<Assignment>> {
    let offline: BTreeSet<&str> = info.offline.iter().map(String::as_str).collect();
    let mut load: Option<BTreeMap<String, usize>> = None;
    let mut expansions: HashMap<String, Vec<String>> = HashMap::new();
    let mut plan = Vec::new();

    for manager in &info.offline {
        for node in inventory.nodes_managed_by(manager).await? {
            let Some(expression) = inventory.manager_candidates(&node).await? else {
                continue;
            };
            if expression.trim().is_empty() {
                continue;
            }

            // Load is only counted once there is something to move
            if load.is_none() {
                let mut counts = BTreeMap::new();
                for live in info.active.iter().chain(std::iter::once(&info.leader)) {
                    counts.insert(live.clone(), inventory.nodes_managed_by(live).await?.len());
                }
                load = Some(counts);
            }
            let Some(load) = load.as_mut() else { continue };

            if !expansions.contains_key(&expression) {
                let candidates = inventory.expand(&expression).await?;
                expansions.insert(expression.clone(), candidates);
            }
            let candidates = expansions.get(&expression).map(Vec::as_slice).unwrap_or_default();

            let best = candidates
                .iter()
                .filter(|c| !offline.contains(c.as_str()) && load.contains_key(c.as_str()))
                .min_by(|a, b| {
                    load[a.as_str()]
                        .cmp(&load[b.as_str()])
                        .then_with(|| natural_cmp(a, b))
                })
                .cloned();

            let Some(target) = best else {
                tracing::warn!(
                    "No live manager among '{}' for {} (was {})",
                    expression,
                    node,
                    manager
                );
                continue;
            };

            if let Some(count) = load.get_mut(&target) {
                *count += 1;
            }
            plan.push(Assignment {
                node,
                from: manager.clone(),
                to: target,
            });
        }
    }

    Ok(plan)
}

/// Node inventory kept in the configuration store under `node/<name>/<attribute>`
pub struct StoreInventory {
    store: Arc<dyn ConfigStore>,
}

impl StoreInventory {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    fn key(node: &str, attribute: &str) -> String {
        format!("{}{}/{}", NODE_PREFIX, node, attribute)
    }

    /// Record a managed node
    pub async fn define_node(&self, node: &str, manager: &str, candidates: Option<&str>) -> Result<()> {
        self.store.set(&Self::key(node, MANAGER_ATTRIBUTE), manager).await?;
        if let Some(candidates) = candidates {
            self.store.set(&Self::key(node, CANDIDATES_ATTRIBUTE), candidates).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeInventory for StoreInventory {
    async fn nodes_managed_by(&self, manager: &str) -> Result<Vec<String>> {
        let suffix = format!("/{}", MANAGER_ATTRIBUTE);
        let mut nodes: Vec<String> = self
            .store
            .scan_prefix(NODE_PREFIX)
            .await
            .into_iter()
            .filter(|(_, value)| value == manager)
            .filter_map(|(key, _)| {
                key.strip_prefix(NODE_PREFIX)
                    .and_then(|rest| rest.strip_suffix(&suffix))
                    .map(str::to_string)
            })
            .collect();
        nodes.sort_by_key(|n| natural_key(n));
        Ok(nodes)
    }

    async fn manager_candidates(&self, node: &str) -> Result<Option<String>> {
        Ok(self.store.get(&Self::key(node, CANDIDATES_ATTRIBUTE)).await)
    }

    async fn expand(&self, expression: &str) -> Result<Vec<String>> {
        expand_names(expression)
    }

    async fn assign_manager(&self, node: &str, manager: &str) -> Result<()> {
        self.store.set(&Self::key(node, MANAGER_ATTRIBUTE), manager).await?;
        Ok(())
    }
}

/// Expand `mgt1,mgt3-mgt5` style expressions
pub fn expand_names(expression: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for item in expression.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('-').and_then(|(a, b)| expand_range(a, b)) {
            Some(range) => names.extend(range?),
            None => names.push(item.to_string()),
        }
    }
    names.dedup();
    Ok(names)
}

/// `None` when the item is not a numbered range (a hyphenated name)
fn expand_range(start: &str, end: &str) -> Option<Result<Vec<String>>> {
    let (prefix_a, first) = split_number(start)?;
    let (prefix_b, last) = split_number(end)?;
    if prefix_a != prefix_b {
        return None;
    }
    if first > last {
        return Some(Err(Error::Config(format!("descending range {}-{}", start, end))));
    }
    Some(Ok((first..=last).map(|n| format!("{}{}", prefix_a, n)).collect()))
}

fn split_number(name: &str) -> Option<(&str, u64)> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let (prefix, number) = name.split_at(name.len() - digits);
    number.parse().ok().map(|n| (prefix, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn info(leader: &str, active: &[&str], offline: &[&str]) -> CollectiveInfo {
        CollectiveInfo {
            leader: leader.to_string(),
            active: active.iter().map(|s| s.to_string()).collect(),
            offline: offline.iter().map(|s| s.to_string()).collect(),
            quorum: Some(true),
        }
    }

    #[test]
    fn test_expand_names() {
        assert_eq!(expand_names("mgt1-mgt3").unwrap(), vec!["mgt1", "mgt2", "mgt3"]);
        assert_eq!(expand_names("mgt1, mgt4").unwrap(), vec!["mgt1", "mgt4"]);
        assert_eq!(expand_names("rack-a").unwrap(), vec!["rack-a"]);
        assert!(expand_names("mgt5-mgt2").is_err());
        assert!(expand_names("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_manager_nodes_move_to_least_loaded() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        let inventory = StoreInventory::new(Arc::clone(&store));

        inventory.define_node("n1", "mgt3", Some("mgt1-mgt3")).await.unwrap();
        inventory.define_node("n2", "mgt3", Some("mgt1-mgt3")).await.unwrap();
        inventory.define_node("n3", "mgt3", None).await.unwrap();
        inventory.define_node("n4", "mgt1", Some("mgt1-mgt3")).await.unwrap();

        let plan = plan_rebalance(&inventory, &info("mgt1", &["mgt2"], &["mgt3"]))
            .await
            .unwrap();

        assert_eq!(
            plan,
            vec![
                Assignment { node: "n1".into(), from: "mgt3".into(), to: "mgt2".into() },
                Assignment { node: "n2".into(), from: "mgt3".into(), to: "mgt1".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_no_live_candidate_leaves_node_alone() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        let inventory = StoreInventory::new(Arc::clone(&store));
        inventory.define_node("n1", "mgt3", Some("mgt3,mgt4")).await.unwrap();

        let plan = plan_rebalance(&inventory, &info("mgt1", &["mgt2"], &["mgt3", "mgt4"]))
            .await
            .unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_assign_manager_updates_store() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        let inventory = StoreInventory::new(Arc::clone(&store));
        inventory.define_node("n1", "mgt3", None).await.unwrap();

        inventory.assign_manager("n1", "mgt1").await.unwrap();
        assert_eq!(store.get("node/n1/collective.manager").await.as_deref(), Some("mgt1"));
        assert_eq!(inventory.nodes_managed_by("mgt1").await.unwrap(), vec!["n1"]);
        assert!(inventory.nodes_managed_by("mgt3").await.unwrap().is_empty());
    }
}
