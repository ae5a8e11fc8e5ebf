//! In-memory causality chain for a single execute call.
//!
//! Nodes are appended when a cognition starts evaluating and completed in
//! place when it finishes, so the chain is a topologically sorted record of
//! every evaluated node, successes and failures alike.

use ail_types::{CausalityNode, Cognition};
use chrono::Utc;

#[derive(Default)]
pub struct CausalityChain {
    nodes: Vec<CausalityNode>,
}

impl CausalityChain {
    pub fn new() -> Self {
        CausalityChain { nodes: Vec::new() }
    }

    /// Append a node for a cognition that is starting evaluation. Returns
    /// the index used to complete it later.
    pub fn begin(&mut self, cognition: &Cognition) -> usize {
        self.nodes.push(CausalityNode {
            cognition_id: cognition.cognition_id,
            parent_id: cognition.parent_id,
            operation: cognition.operation,
            started_at: Utc::now(),
            finished_at: None,
            success: None,
            drive_influences: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Mark the node at `index` finished.
    pub fn finish(&mut self, index: usize, success: bool) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.finished_at = Some(Utc::now());
            node.success = Some(success);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CausalityNode] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<CausalityNode> {
        self.nodes
    }
}
