//! Workspace layout for internal tensors and node scratch.
//!
//! Every internal tensor gets a fixed byte offset into one caller-provided
//! workspace. Node scratch shares a single region placed after the tensors,
//! sized for the hungriest node, since nodes on one stream never overlap.

use serde::{Deserialize, Serialize};

use crate::graph::{KernelGraph, TensorId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategy {
    /// Bump allocation in slot order. No two internal tensors ever share bytes.
    #[default]
    Linear,
    /// Tensors whose live ranges do not intersect may share bytes.
    Reuse,
}

impl std::str::FromStr for WorkspaceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(WorkspaceStrategy::Linear),
            "reuse" => Ok(WorkspaceStrategy::Reuse),
            other => Err(format!("unknown workspace strategy `{other}`")),
        }
    }
}

/// Size and live range of one internal tensor, in node indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorLifetime {
    pub bytes: u64,
    pub produced: usize,
    pub last_used: usize,
}

impl TensorLifetime {
    fn overlaps(&self, other: &TensorLifetime) -> bool {
        self.produced <= other.last_used && other.produced <= self.last_used
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkspacePlan {
    /// Byte offset of each internal tensor, in slot order.
    pub offsets: Vec<u64>,
    pub scratch_offset: u64,
    pub scratch_bytes: u64,
    pub total_bytes: u64,
}

impl WorkspacePlan {
    pub fn build(
        tensors: &[TensorLifetime],
        scratch_bytes: u64,
        alignment: u64,
        strategy: WorkspaceStrategy,
    ) -> Self {
        let offsets = match strategy {
            WorkspaceStrategy::Linear => linear_offsets(tensors, alignment),
            WorkspaceStrategy::Reuse => reuse_offsets(tensors, alignment),
        };
        let tensor_end = offsets
            .iter()
            .zip(tensors)
            .map(|(offset, tensor)| offset + tensor.bytes)
            .max()
            .unwrap_or(0);
        let scratch_offset = align_up(tensor_end, alignment);
        let total_bytes = if scratch_bytes > 0 {
            align_up(scratch_offset + scratch_bytes, alignment)
        } else {
            align_up(tensor_end, alignment)
        };
        Self {
            offsets,
            scratch_offset,
            scratch_bytes,
            total_bytes,
        }
    }
}

fn linear_offsets(tensors: &[TensorLifetime], alignment: u64) -> Vec<u64> {
    let mut offset = 0;
    tensors
        .iter()
        .map(|tensor| {
            let start = align_up(offset, alignment);
            offset = start + tensor.bytes;
            start
        })
        .collect()
}

/// Greedy first fit in order of production: each tensor takes the lowest
/// aligned offset that does not collide with an already placed tensor whose
/// live range intersects its own.
fn reuse_offsets(tensors: &[TensorLifetime], alignment: u64) -> Vec<u64> {
    let mut order: Vec<usize> = (0..tensors.len()).collect();
    order.sort_by_key(|i| (tensors[*i].produced, std::cmp::Reverse(tensors[*i].bytes)));

    let mut offsets = vec![0; tensors.len()];
    let mut placed: Vec<usize> = Vec::with_capacity(tensors.len());
    for index in order {
        let tensor = &tensors[index];
        let mut conflicts: Vec<(u64, u64)> = placed
            .iter()
            .filter(|other| tensors[**other].overlaps(tensor))
            .map(|other| (offsets[*other], offsets[*other] + tensors[*other].bytes))
            .collect();
        conflicts.sort_unstable();

        let mut candidate = 0;
        for (start, end) in conflicts {
            if candidate + tensor.bytes <= start {
                break;
            }
            candidate = candidate.max(align_up(end, alignment));
        }
        offsets[index] = candidate;
        placed.push(index);
    }
    offsets
}

/// Live ranges of the graph's internal tensors, in slot order. A tensor that
/// nobody reads stays live only for the node producing it.
pub fn lifetimes(graph: &KernelGraph, bytes: &[u64]) -> Vec<TensorLifetime> {
    let mut lifetimes: Vec<TensorLifetime> = bytes
        .iter()
        .map(|bytes| TensorLifetime {
            bytes: *bytes,
            produced: 0,
            last_used: 0,
        })
        .collect();
    for (position, node) in graph.nodes().iter().enumerate() {
        for id in node.output_ids() {
            if let TensorId::Internal(i) = *id {
                if let Some(lifetime) = lifetimes.get_mut(i) {
                    lifetime.produced = position;
                    lifetime.last_used = lifetime.last_used.max(position);
                }
            }
        }
        for id in node.input_ids() {
            if let TensorId::Internal(i) = *id {
                if let Some(lifetime) = lifetimes.get_mut(i) {
                    lifetime.last_used = lifetime.last_used.max(position);
                }
            }
        }
    }
    lifetimes
}

pub const fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}
