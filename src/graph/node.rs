use std::{fmt::Debug, sync::Arc};

use crate::{
    error::ShapeError,
    op::OpParam,
    tensor::{TensorDesc, TensorFormat},
    view::ViewFn,
};

use super::{KernelGraph, TensorId};

/// Rewrites a node's parameter right before its output shapes are inferred.
///
/// The parameter handed in is always a fresh copy of the node's declared
/// parameter, so a hook that only reads input shapes is deterministic.
pub type InferHook =
    Arc<dyn Fn(&mut InferContext<'_>, &mut OpParam) -> Result<(), ShapeError> + Send + Sync>;

/// What an [`InferHook`] may look at and change during setup.
pub struct InferContext<'a> {
    pub(crate) node: &'a str,
    pub(crate) inputs: &'a mut [TensorDesc],
    pub(crate) graph: &'a KernelGraph,
}

impl InferContext<'_> {
    pub fn node_name(&self) -> &str {
        self.node
    }

    /// The node's inputs after views were applied.
    pub fn inputs(&self) -> &[TensorDesc] {
        self.inputs
    }

    pub fn input(&self, index: usize) -> Result<&TensorDesc, ShapeError> {
        self.inputs.get(index).ok_or(ShapeError::InputCount {
            expected: index + 1,
            actual: self.inputs.len(),
        })
    }

    /// Retags how the node reads one of its inputs.
    pub fn set_input_format(
        &mut self,
        index: usize,
        format: TensorFormat,
    ) -> Result<(), ShapeError> {
        let actual = self.inputs.len();
        let input = self.inputs.get_mut(index).ok_or(ShapeError::InputCount {
            expected: index + 1,
            actual,
        })?;
        input.format = format;
        Ok(())
    }

    /// Any tensor of the graph that is already bound or resolved.
    pub fn tensor(&self, id: TensorId) -> Option<&TensorDesc> {
        self.graph.tensor(id).map(|tensor| &tensor.desc)
    }
}

#[derive(Clone)]
pub struct KernelGraphNode {
    name: String,
    base_param: OpParam,
    param: OpParam,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    views: Vec<Option<ViewFn>>,
    hook: Option<InferHook>,
    resolved_inputs: Vec<TensorDesc>,
}

impl KernelGraphNode {
    pub fn new(name: impl Into<String>, param: impl Into<OpParam>) -> Self {
        let param = param.into();
        Self {
            name: name.into(),
            base_param: param.clone(),
            param,
            inputs: Vec::new(),
            outputs: Vec::new(),
            views: Vec::new(),
            hook: None,
            resolved_inputs: Vec::new(),
        }
    }

    pub fn input(mut self, id: TensorId) -> Self {
        self.inputs.push(id);
        self
    }

    pub fn inputs(mut self, ids: impl IntoIterator<Item = TensorId>) -> Self {
        self.inputs.extend(ids);
        self
    }

    pub fn output(mut self, id: TensorId) -> Self {
        self.outputs.push(id);
        self
    }

    pub fn outputs(mut self, ids: impl IntoIterator<Item = TensorId>) -> Self {
        self.outputs.extend(ids);
        self
    }

    /// Reinterprets the shape of input `index` for this node only.
    pub fn view(mut self, index: usize, view: ViewFn) -> Self {
        if self.views.len() <= index {
            self.views.resize(index + 1, None);
        }
        self.views[index] = Some(view);
        self
    }

    pub fn hook(
        mut self,
        hook: impl Fn(&mut InferContext<'_>, &mut OpParam) -> Result<(), ShapeError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn with_hook(mut self, hook: InferHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameter as declared at construction or patched by a dynamic update.
    pub fn base_param(&self) -> &OpParam {
        &self.base_param
    }

    pub(crate) fn base_param_mut(&mut self) -> &mut OpParam {
        &mut self.base_param
    }

    /// The parameter after the last setup's hook ran. This is what gets
    /// dispatched.
    pub fn param(&self) -> &OpParam {
        &self.param
    }

    pub fn input_ids(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn output_ids(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn input_view(&self, index: usize) -> Option<&ViewFn> {
        self.views.get(index)?.as_ref()
    }

    pub(crate) fn view_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.views
            .iter()
            .enumerate()
            .filter_map(|(i, view)| view.as_ref().map(|_| i))
    }

    pub(crate) fn infer_hook(&self) -> Option<&InferHook> {
        self.hook.as_ref()
    }

    /// Input descriptors as the operator saw them in the last setup.
    pub fn resolved_inputs(&self) -> &[TensorDesc] {
        &self.resolved_inputs
    }

    pub(crate) fn set_resolved(&mut self, param: OpParam, inputs: Vec<TensorDesc>) {
        self.param = param;
        self.resolved_inputs = inputs;
    }
}

impl Debug for KernelGraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelGraphNode")
            .field("name", &self.name)
            .field("param", &self.param)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("views", &self.views)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
