//! State Management Module
//!
//! Collective role and leader tracking, arbitration rules and quorum.

pub mod arbitration;
mod cluster;
pub mod quorum;

pub use arbitration::{judge_assimilation, natural_cmp, AssimilationView, Verdict};
pub use cluster::{ClusterState, Gate, GateGuard, RelayStop, Role};
pub use quorum::{check_quorum, QuorumView};
