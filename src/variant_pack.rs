use crate::tensor::{DeviceSpan, Tensor};

/// The concrete tensors and workspace for one call, matched positionally
/// against a graph's input and output slots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariantPack {
    pub in_tensors: Vec<Tensor>,
    pub out_tensors: Vec<Tensor>,
    pub workspace: Option<DeviceSpan>,
}

impl VariantPack {
    pub fn new(in_tensors: Vec<Tensor>, out_tensors: Vec<Tensor>) -> Self {
        Self {
            in_tensors,
            out_tensors,
            workspace: None,
        }
    }

    pub fn with_workspace(mut self, workspace: DeviceSpan) -> Self {
        self.workspace = Some(workspace);
        self
    }
}
