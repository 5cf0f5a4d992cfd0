//! The declarative kernel graph: three tensor tables and an ordered node list.

use std::{collections::HashSet, fmt::Display};

use crate::{
    error::{Error, Result},
    tensor::Tensor,
};

pub mod hooks;
mod node;
mod params;
mod visualize;

pub use node::{InferContext, InferHook, KernelGraphNode};
pub use params::GraphParams;

/// A reference from a node into one of its graph's tensor tables.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TensorId {
    Input(usize),
    Output(usize),
    Internal(usize),
}

impl TensorId {
    pub fn kind(&self) -> &'static str {
        match self {
            TensorId::Input(_) => "input",
            TensorId::Output(_) => "output",
            TensorId::Internal(_) => "internal",
        }
    }

    pub fn index(&self) -> usize {
        match *self {
            TensorId::Input(i) | TensorId::Output(i) | TensorId::Internal(i) => i,
        }
    }
}

impl Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind(), self.index())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub usize);

/// A named tensor table entry. `tensor` is `None` until setup binds or
/// resolves it.
#[derive(Clone, Debug)]
pub struct TensorSlot {
    pub name: String,
    pub tensor: Option<Tensor>,
}

impl TensorSlot {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tensor: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KernelGraph {
    name: String,
    inputs: Vec<TensorSlot>,
    outputs: Vec<TensorSlot>,
    internals: Vec<TensorSlot>,
    nodes: Vec<KernelGraphNode>,
}

impl KernelGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            internals: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_input(&mut self, name: impl Into<String>) -> TensorId {
        self.inputs.push(TensorSlot::new(name));
        TensorId::Input(self.inputs.len() - 1)
    }

    pub fn create_output(&mut self, name: impl Into<String>) -> TensorId {
        self.outputs.push(TensorSlot::new(name));
        TensorId::Output(self.outputs.len() - 1)
    }

    /// An intermediate whose descriptor is inferred and whose memory is carved
    /// out of the runner's workspace.
    pub fn create_internal(&mut self, name: impl Into<String>) -> TensorId {
        self.internals.push(TensorSlot::new(name));
        TensorId::Internal(self.internals.len() - 1)
    }

    /// Appends a node. Nodes run in the order they are added.
    pub fn add_node(&mut self, node: KernelGraphNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn inputs(&self) -> &[TensorSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSlot] {
        &self.outputs
    }

    pub fn internals(&self) -> &[TensorSlot] {
        &self.internals
    }

    pub fn nodes(&self) -> &[KernelGraphNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&KernelGraphNode> {
        self.nodes.get(id.0)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut KernelGraphNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name() == name)
            .map(NodeId)
    }

    pub fn slot(&self, id: TensorId) -> Option<&TensorSlot> {
        match id {
            TensorId::Input(i) => self.inputs.get(i),
            TensorId::Output(i) => self.outputs.get(i),
            TensorId::Internal(i) => self.internals.get(i),
        }
    }

    pub(crate) fn slot_mut(&mut self, id: TensorId) -> Option<&mut TensorSlot> {
        match id {
            TensorId::Input(i) => self.inputs.get_mut(i),
            TensorId::Output(i) => self.outputs.get_mut(i),
            TensorId::Internal(i) => self.internals.get_mut(i),
        }
    }

    /// The bound or resolved tensor behind `id`, if any.
    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.slot(id)?.tensor.as_ref()
    }

    /// Drops everything bound or inferred by a previous setup.
    pub(crate) fn clear_bindings(&mut self) {
        for slot in self
            .inputs
            .iter_mut()
            .chain(&mut self.outputs)
            .chain(&mut self.internals)
        {
            slot.tensor = None;
        }
    }

    /// Checks the structural invariants that setup relies on.
    ///
    /// Node order must already be a valid execution order: an internal tensor
    /// is produced by exactly one node before any node consumes it, and every
    /// output and internal tensor is produced.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidGraph {
            graph: self.name.clone(),
            reason,
        };

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name()) {
                return Err(invalid(format!("duplicate node name `{}`", node.name())));
            }
        }

        let mut produced = HashSet::new();
        for node in &self.nodes {
            let param = node.base_param();
            if node.input_ids().len() != param.input_count() {
                return Err(invalid(format!(
                    "node `{}` ({}) has {} inputs, the operator takes {}",
                    node.name(),
                    param.name(),
                    node.input_ids().len(),
                    param.input_count()
                )));
            }
            if node.output_ids().len() != param.output_count() {
                return Err(invalid(format!(
                    "node `{}` ({}) has {} outputs, the operator produces {}",
                    node.name(),
                    param.name(),
                    node.output_ids().len(),
                    param.output_count()
                )));
            }
            if let Some(index) = node.view_indices().find(|i| *i >= node.input_ids().len()) {
                return Err(invalid(format!(
                    "node `{}` has a view on input {index} but only {} inputs",
                    node.name(),
                    node.input_ids().len()
                )));
            }

            for &id in node.input_ids() {
                if self.slot(id).is_none() {
                    return Err(invalid(format!(
                        "node `{}` reads {id}, which does not exist",
                        node.name()
                    )));
                }
                match id {
                    TensorId::Input(_) => {}
                    TensorId::Output(_) | TensorId::Internal(_) if produced.contains(&id) => {}
                    _ => {
                        return Err(invalid(format!(
                            "node `{}` reads {id} before any node produces it",
                            node.name()
                        )))
                    }
                }
            }
            for &id in node.output_ids() {
                if self.slot(id).is_none() {
                    return Err(invalid(format!(
                        "node `{}` writes {id}, which does not exist",
                        node.name()
                    )));
                }
                if let TensorId::Input(_) = id {
                    return Err(invalid(format!(
                        "node `{}` writes to graph input {id}",
                        node.name()
                    )));
                }
                if !produced.insert(id) {
                    return Err(invalid(format!(
                        "{id} is produced by more than one node, again by `{}`",
                        node.name()
                    )));
                }
            }
        }

        let unproduced = (0..self.outputs.len())
            .map(TensorId::Output)
            .chain((0..self.internals.len()).map(TensorId::Internal))
            .find(|id| !produced.contains(id));
        if let Some(id) = unproduced {
            return Err(invalid(format!("{id} is never produced")));
        }
        Ok(())
    }
}
