use crate::{error::PoolError, op::OpFamily};

use super::{KernelGraph, NodeId};

/// Parameter-only access to a built graph, handed to dynamic updates.
///
/// Only declared node parameters can be reached. Topology, views and hooks
/// stay as they were built.
pub struct GraphParams<'a> {
    operation: &'static str,
    graph: &'a mut KernelGraph,
    touched: Vec<NodeId>,
}

impl<'a> GraphParams<'a> {
    pub(crate) fn new(operation: &'static str, graph: &'a mut KernelGraph) -> Self {
        Self {
            operation,
            graph,
            touched: Vec::new(),
        }
    }

    /// The declared parameter of `node`, typed as the family `P`.
    pub fn get_mut<P: OpFamily>(&mut self, node: &str) -> Result<&mut P, PoolError> {
        let Some(id) = self.graph.node_by_name(node) else {
            return Err(self.error(node, "no node with this name".to_string()));
        };
        let found = self
            .graph
            .node(id)
            .map(|node| node.base_param().name())
            .unwrap_or_default();
        if !self.touched.contains(&id) {
            self.touched.push(id);
        }
        let operation = self.operation;
        self.graph
            .node_mut(id)
            .and_then(|node| node.base_param_mut().get_mut::<P>())
            .ok_or_else(|| PoolError::Update {
                name: operation,
                node: node.to_string(),
                reason: format!("expected operator parameter `{}`, found `{found}`", P::NAME),
            })
    }

    pub fn graph(&self) -> &KernelGraph {
        self.graph
    }

    /// Nodes whose parameters were handed out.
    pub fn touched(&self) -> &[NodeId] {
        &self.touched
    }

    fn error(&self, node: &str, reason: String) -> PoolError {
        PoolError::Update {
            name: self.operation,
            node: node.to_string(),
            reason,
        }
    }
}
