//! Two phase execution of one kernel graph.
//!
//! `setup` resolves every shape and lays out the workspace, `execute` carves
//! the workspace and enqueues the nodes in order on the caller's stream.

use log::{debug, error, trace};

use crate::{
    config::EngineConfig,
    error::{Error, Result, ShapeError},
    graph::{GraphParams, InferContext, KernelGraph, NodeId, TensorId},
    registry::{KernelLaunch, KernelRegistry, TensorBinding},
    tensor::{DevicePtr, DeviceSpan, Memory, Tensor, TensorDesc},
    variant_pack::VariantPack,
    workspace::{lifetimes, WorkspacePlan},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunnerState {
    /// Nothing bound. Fresh runners and runners whose parameters were patched.
    Unbound,
    ShapesResolved,
    WorkspacePlanned,
    Executed,
}

#[derive(Debug)]
pub struct Runner {
    graph: KernelGraph,
    config: EngineConfig,
    state: RunnerState,
    plan: WorkspacePlan,
    node_scratch: Vec<u64>,
}

impl Runner {
    /// Validates `graph` and takes ownership of it.
    pub fn new(graph: KernelGraph, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        graph.validate()?;
        if config.dump_graphs {
            debug!("graph `{}`:\n{}", graph.name(), graph.graphvis());
        }
        Ok(Self {
            node_scratch: vec![0; graph.nodes().len()],
            graph,
            config: config.clone(),
            state: RunnerState::Unbound,
            plan: WorkspacePlan::default(),
        })
    }

    pub fn graph(&self) -> &KernelGraph {
        &self.graph
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Parameter access for a dynamic update. Anything resolved by the last
    /// setup is dropped, so the next call has to set up again.
    pub fn params(&mut self, operation: &'static str) -> GraphParams<'_> {
        self.reset();
        GraphParams::new(operation, &mut self.graph)
    }

    /// Binds `pack`, resolves every node's shapes and plans the workspace.
    ///
    /// Returns the number of workspace bytes `execute` will need.
    pub fn setup(&mut self, pack: &VariantPack) -> Result<u64> {
        self.reset();
        self.bind(pack)?;
        for index in 0..self.graph.nodes().len() {
            self.resolve_node(NodeId(index))?;
        }
        self.state = RunnerState::ShapesResolved;
        self.plan_workspace()?;
        self.state = RunnerState::WorkspacePlanned;
        Ok(self.plan.total_bytes)
    }

    pub fn workspace_size(&self) -> Result<u64> {
        match self.state {
            RunnerState::WorkspacePlanned | RunnerState::Executed => Ok(self.plan.total_bytes),
            state => Err(self.state_error(state, "workspace planned")),
        }
    }

    pub fn workspace_plan(&self) -> Option<&WorkspacePlan> {
        matches!(
            self.state,
            RunnerState::WorkspacePlanned | RunnerState::Executed
        )
        .then_some(&self.plan)
    }

    /// Enqueues every node on `stream` in graph order.
    ///
    /// `pack` must describe the same tensors `setup` saw; only device
    /// pointers may change. Stops at the first failing launch. Launches that
    /// were already enqueued stay enqueued.
    pub fn execute<R: KernelRegistry>(
        &mut self,
        registry: &R,
        stream: &mut R::Stream,
        pack: &VariantPack,
    ) -> Result<()> {
        if !matches!(
            self.state,
            RunnerState::WorkspacePlanned | RunnerState::Executed
        ) {
            return Err(self.state_error(self.state, "workspace planned"));
        }
        let inputs = self.check_execute_bindings("input", &pack.in_tensors, TensorId::Input)?;
        let outputs = self.check_execute_bindings("output", &pack.out_tensors, TensorId::Output)?;
        let workspace = self.check_workspace(pack.workspace)?;

        for (index, node) in self.graph.nodes().iter().enumerate() {
            let resolve = |id: TensorId, desc: &TensorDesc| -> TensorBinding {
                let ptr = match id {
                    TensorId::Input(i) => inputs[i],
                    TensorId::Output(i) => outputs[i],
                    TensorId::Internal(i) => workspace.ptr.offset(self.plan.offsets[i]),
                };
                TensorBinding {
                    desc: desc.clone(),
                    ptr,
                    byte_size: desc.byte_size().unwrap_or(0),
                }
            };
            let input_bindings = node
                .input_ids()
                .iter()
                .zip(node.resolved_inputs())
                .map(|(id, desc)| resolve(*id, desc))
                .collect();
            let mut output_bindings = Vec::with_capacity(node.output_ids().len());
            for id in node.output_ids() {
                let desc = self.resolved_desc(*id)?;
                output_bindings.push(resolve(*id, desc));
            }
            let scratch = match self.node_scratch[index] {
                0 => None,
                bytes => workspace.slice(self.plan.scratch_offset, bytes),
            };
            let launch = KernelLaunch {
                node: node.name(),
                op: node.param().name(),
                param: node.param(),
                inputs: input_bindings,
                outputs: output_bindings,
                scratch,
            };
            trace!("launching `{}` ({})", launch.node, launch.op);
            registry.launch(&launch, stream).map_err(|source| {
                error!(
                    "graph `{}`: node `{}` ({}) failed: {source}",
                    self.graph.name(),
                    launch.node,
                    launch.op
                );
                Error::Dispatch {
                    node: launch.node.to_string(),
                    op: launch.op,
                    source,
                }
            })?;
        }
        self.state = RunnerState::Executed;
        Ok(())
    }

    fn reset(&mut self) {
        self.graph.clear_bindings();
        self.plan = WorkspacePlan::default();
        self.node_scratch.iter_mut().for_each(|bytes| *bytes = 0);
        self.state = RunnerState::Unbound;
    }

    fn bind(&mut self, pack: &VariantPack) -> Result<()> {
        let graph = self.graph.name().to_string();
        let tables: [(&'static str, &[Tensor], usize, fn(usize) -> TensorId); 2] = [
            (
                "input",
                &pack.in_tensors,
                self.graph.inputs().len(),
                TensorId::Input,
            ),
            (
                "output",
                &pack.out_tensors,
                self.graph.outputs().len(),
                TensorId::Output,
            ),
        ];
        for (kind, tensors, expected, id) in tables {
            if tensors.len() != expected {
                return Err(Error::BindingCount {
                    graph,
                    kind,
                    expected,
                    actual: tensors.len(),
                });
            }
            for (index, tensor) in tensors.iter().enumerate() {
                if tensor.desc.overflows() {
                    return Err(Error::Binding {
                        graph,
                        kind,
                        index,
                        reason: format!("{} does not fit a 64 bit byte size", tensor.desc),
                    });
                }
                if let Some(slot) = self.graph.slot_mut(id(index)) {
                    slot.tensor = Some(tensor.clone());
                }
            }
        }
        Ok(())
    }

    fn resolve_node(&mut self, id: NodeId) -> Result<()> {
        let Some(node) = self.graph.node(id) else {
            return Ok(());
        };
        let name = node.name().to_string();

        let mut inputs = Vec::with_capacity(node.input_ids().len());
        for (index, input) in node.input_ids().iter().enumerate() {
            let mut desc = self.resolved_desc(*input)?.clone();
            if let Some(view) = node.input_view(index) {
                let viewed = view.apply(&desc.shape);
                if self.config.check_views && viewed.element_count() != desc.shape.element_count()
                {
                    return Err(Error::View {
                        node: name,
                        op: node.base_param().name(),
                        input: index,
                        from: desc.shape,
                        to: viewed,
                    });
                }
                desc.shape = viewed;
            }
            inputs.push(desc);
        }

        let mut param = node.base_param().clone();
        if let Some(hook) = node.infer_hook() {
            let mut ctx = InferContext {
                node: &name,
                inputs: &mut inputs,
                graph: &self.graph,
            };
            hook(&mut ctx, &mut param).map_err(|source| Error::Hook {
                node: name.clone(),
                op: param.name(),
                source,
            })?;
        }

        let op = param.name();
        let setup_error = |source: ShapeError| Error::Setup {
            node: name.clone(),
            op,
            source,
        };
        let outputs = param.infer_shape(&inputs).map_err(setup_error)?;
        let output_ids = node.output_ids().to_vec();
        if outputs.len() != output_ids.len() {
            return Err(setup_error(ShapeError::invalid(format!(
                "operator produced {} outputs but the node declares {}",
                outputs.len(),
                output_ids.len()
            ))));
        }

        if let Some((index, desc)) = outputs.iter().enumerate().find(|(_, d)| d.overflows()) {
            return Err(setup_error(ShapeError::invalid(format!(
                "output {index} {desc} does not fit a 64 bit byte size"
            ))));
        }

        for (index, (output, desc)) in output_ids.iter().zip(outputs).enumerate() {
            let Some(slot) = self.graph.slot_mut(*output) else {
                continue;
            };
            let bound = match output {
                TensorId::Output(_) => slot.tensor.as_ref().map(|tensor| tensor.desc.clone()),
                _ => None,
            };
            match bound {
                Some(bound) if !compatible(&bound, &desc) => {
                    return Err(Error::OutputMismatch {
                        node: name,
                        op,
                        index,
                        inferred: desc.to_string(),
                        bound: bound.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    slot.tensor = Some(Tensor {
                        desc,
                        memory: Memory::Unbound,
                    });
                }
            }
        }

        trace!(
            "node `{name}` ({op}): {:?} -> {:?}",
            inputs.iter().map(|d| &d.shape).collect::<Vec<_>>(),
            output_ids
                .iter()
                .filter_map(|id| self.graph.tensor(*id).map(|t| &t.desc.shape))
                .collect::<Vec<_>>()
        );
        self.node_scratch[id.0] = param.scratch_bytes(&inputs);
        if let Some(node) = self.graph.node_mut(id) {
            node.set_resolved(param, inputs);
        }
        Ok(())
    }

    fn plan_workspace(&mut self) -> Result<()> {
        let mut sizes = Vec::with_capacity(self.graph.internals().len());
        for slot in self.graph.internals() {
            let desc = slot.tensor.as_ref().map(|tensor| &tensor.desc);
            match desc.and_then(TensorDesc::byte_size) {
                Some(bytes) => sizes.push(bytes),
                None => {
                    return Err(Error::Unresolved {
                        name: slot.name.clone(),
                        shape: desc.map(|desc| desc.shape.clone()).unwrap_or_default(),
                    })
                }
            }
        }
        let scratch = self.node_scratch.iter().copied().max().unwrap_or(0);
        self.plan = WorkspacePlan::build(
            &lifetimes(&self.graph, &sizes),
            scratch,
            self.config.workspace_alignment,
            self.config.workspace_strategy,
        );
        for (index, offset) in self.plan.offsets.iter().enumerate() {
            if let Some(tensor) = self
                .graph
                .slot_mut(TensorId::Internal(index))
                .and_then(|slot| slot.tensor.as_mut())
            {
                tensor.memory = Memory::Workspace { offset: *offset };
            }
        }
        debug!(
            "graph `{}`: {} internal tensors at {:?}, {} scratch bytes, {} bytes total",
            self.graph.name(),
            sizes.len(),
            self.plan.offsets,
            self.plan.scratch_bytes,
            self.plan.total_bytes
        );
        Ok(())
    }

    fn resolved_desc(&self, id: TensorId) -> Result<&TensorDesc> {
        self.graph
            .tensor(id)
            .map(|tensor| &tensor.desc)
            .ok_or_else(|| Error::InvalidGraph {
                graph: self.graph.name().to_string(),
                reason: format!("{id} is read before it is bound or produced"),
            })
    }

    fn check_execute_bindings(
        &self,
        kind: &'static str,
        tensors: &[Tensor],
        id: fn(usize) -> TensorId,
    ) -> Result<Vec<DevicePtr>> {
        let slots = match kind {
            "input" => self.graph.inputs(),
            _ => self.graph.outputs(),
        };
        if tensors.len() != slots.len() {
            return Err(Error::BindingCount {
                graph: self.graph.name().to_string(),
                kind,
                expected: slots.len(),
                actual: tensors.len(),
            });
        }
        let binding_error = |index: usize, reason: String| Error::Binding {
            graph: self.graph.name().to_string(),
            kind,
            index,
            reason,
        };
        let mut pointers = Vec::with_capacity(tensors.len());
        for (index, tensor) in tensors.iter().enumerate() {
            let resolved = self.resolved_desc(id(index))?;
            if &tensor.desc != resolved {
                return Err(binding_error(
                    index,
                    format!(
                        "descriptor {} differs from {} used in setup",
                        tensor.desc, resolved
                    ),
                ));
            }
            match tensor.memory {
                Memory::External(ptr) => pointers.push(ptr),
                memory => {
                    return Err(binding_error(
                        index,
                        format!("expected caller-owned device memory, got {memory:?}"),
                    ))
                }
            }
        }
        Ok(pointers)
    }

    fn check_workspace(&self, workspace: Option<DeviceSpan>) -> Result<DeviceSpan> {
        let required = self.plan.total_bytes;
        if required == 0 {
            return Ok(workspace.unwrap_or(DeviceSpan::new(DevicePtr(0), 0)));
        }
        match workspace {
            Some(span) if span.len >= required => Ok(span),
            span => Err(Error::Workspace {
                required,
                provided: span.map_or(0, |span| span.len),
            }),
        }
    }

    fn state_error(&self, state: RunnerState, expected: &'static str) -> Error {
        Error::State {
            graph: self.graph.name().to_string(),
            state,
            expected,
        }
    }
}

/// A caller-bound output may be a logical reshape of what the operator infers.
fn compatible(bound: &TensorDesc, inferred: &TensorDesc) -> bool {
    bound.dtype == inferred.dtype
        && bound.format == inferred.format
        && bound.shape.element_count() == inferred.shape.element_count()
}
