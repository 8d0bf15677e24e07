//! Cluster topology and the partitioning arithmetic that splits a test's
//! thread budget and operation budget across participating nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{config::ThreadConfig, error::ConfigError};


/// Identity of one participant in a distributed benchmark run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The ordered list of nodes executing the current test, plus this node's
/// own identity. Participation order is significant: it decides which nodes
/// receive the remainder threads and operations.
#[derive(Debug, Clone)]
pub struct ClusterView {
    executing: Vec<NodeId>,
    self_node: NodeId,
}

impl ClusterView {
    pub fn new(executing: Vec<NodeId>, self_node: NodeId) -> Result<Self, ConfigError> {
        if executing.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }
        Ok(Self {
            executing,
            self_node,
        })
    }

    pub fn executing_nodes(&self) -> &[NodeId] {
        &self.executing
    }

    pub fn node_count(&self) -> usize {
        self.executing.len()
    }

    pub fn self_node(&self) -> NodeId {
        self.self_node
    }

    /// 0-based position of `node` in the participation order.
    pub fn participation_index(&self, node: NodeId) -> Option<usize> {
        self.executing.iter().position(|n| *n == node)
    }
}

/// Total number of stressor threads across the whole cluster.
pub fn total_threads(config: &ThreadConfig, view: &ClusterView) -> Result<usize, ConfigError> {
    config.validate()?;
    if config.total_threads > 0 {
        Ok(config.total_threads)
    } else {
        Ok(config.threads_per_node * view.node_count())
    }
}

/// Number of stressor threads `node` runs. Zero when the node does not
/// participate.
pub fn threads_on(
    config: &ThreadConfig,
    view: &ClusterView,
    node: NodeId,
) -> Result<usize, ConfigError> {
    config.validate()?;
    let Some(index) = view.participation_index(node) else {
        return Ok(0);
    };
    if config.threads_per_node > 0 {
        Ok(config.threads_per_node)
    } else {
        let n = view.node_count();
        let total = config.total_threads;
        Ok((index + 1) * total / n - index * total / n)
    }
}

/// Global index of the first thread on `node`. Thread index ranges are
/// contiguous and non-overlapping across the participation order.
pub fn first_thread_on(
    config: &ThreadConfig,
    view: &ClusterView,
    node: NodeId,
) -> Result<usize, ConfigError> {
    config.validate()?;
    let index = view
        .participation_index(node)
        .ok_or(ConfigError::NodeNotParticipating(node))?;
    if config.threads_per_node > 0 {
        Ok(index * config.threads_per_node)
    } else {
        Ok(index * config.total_threads / view.node_count())
    }
}

/// This node's share of a cluster-wide operation count.
///
/// base = N / nodes; the remainder is handed out one-each to the first
/// `N mod nodes` nodes in participation order, so the shares always sum to
/// exactly N and differ pairwise by at most one.
pub fn operations_on(
    num_operations: u64,
    view: &ClusterView,
    node: NodeId,
) -> Result<u64, ConfigError> {
    let index = view
        .participation_index(node)
        .ok_or(ConfigError::NodeNotParticipating(node))?;
    let nodes = view.node_count() as u64;
    let mut share = num_operations / nodes;
    if (index as u64) < num_operations % nodes {
        share += 1;
    }
    Ok(share)
}
