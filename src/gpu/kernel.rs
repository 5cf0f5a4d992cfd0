use std::fmt::{Display, Write};

use crate::{error::KernelError, tensor::DataType};

use super::Device;

/// Threads per workgroup for every generated kernel.
pub(crate) const BLOCKSIZE: u32 = 256;
/// Workgroups per dispatch dimension guaranteed by the default limits.
const MAX_WORKGROUPS: u32 = 65535;

/// Builds the WGSL source of a one dimensional compute kernel.
///
/// Binding 0 is always a read-only `array<u32>` of launch parameters (`info`)
/// whose first word is the thread count. Tensor bindings follow in the order
/// they were added and are all declared `read_write`, so any two of them may
/// alias the same buffer.
pub(crate) struct GenericKernel {
    max_binding: u32,
    max_function_id: u32,
    inputs: Vec<TensorInput>,
    functions: Vec<Function>,
    body: String,
}

impl GenericKernel {
    pub(crate) fn new() -> Self {
        Self {
            max_binding: 1,
            max_function_id: 0,
            inputs: Vec::new(),
            functions: Vec::new(),
            body: String::new(),
        }
    }

    pub(crate) fn set_body(&mut self, body: impl ToString) {
        self.body = body.to_string();
    }

    pub(crate) fn add_function(
        &mut self,
        ty: impl ToString,
        function_body: impl ToString,
        inputs: impl IntoIterator<Item = (String, String)>,
    ) -> Function {
        let id = self.max_function_id;
        self.max_function_id += 1;
        let function = Function {
            id,
            ty: ty.to_string(),
            body: function_body.to_string(),
            inputs: inputs.into_iter().collect(),
        };
        self.functions.push(function.clone());
        function
    }

    pub(crate) fn add_tensor_input(&mut self, datatype: DataType) -> Result<TensorInput, KernelError> {
        // f16 storage needs a device feature the backend does not request
        let wgsl_type = match datatype.wgsl_type() {
            Some(ty) if datatype != DataType::F16 => ty,
            _ => {
                return Err(KernelError::Rejected(format!(
                    "{datatype} tensors cannot be bound on this device"
                )))
            }
        };
        let input = TensorInput {
            index: self.max_binding,
            wgsl_type,
        };
        self.max_binding += 1;
        self.inputs.push(input.clone());
        Ok(input)
    }

    pub(crate) fn tensor_count(&self) -> usize {
        self.inputs.len()
    }

    pub(crate) fn source(&self) -> String {
        let mut source = String::new();
        // writing into a String cannot fail
        _ = self.kernel(&mut source);
        source
    }

    fn kernel(&self, f: &mut String) -> std::fmt::Result {
        writeln!(f, "@group(0) @binding(0) var<storage, read> info: array<u32>;")?;
        for input in &self.inputs {
            writeln!(
                f,
                "@group(0) @binding({}) var<storage, read_write> {input}: array<{}>;",
                input.index, input.wgsl_type
            )?;
        }
        for function in &self.functions {
            writeln!(f, "{}", function.function_definition())?;
        }

        writeln!(f, "const BLOCKSIZE: u32 = {BLOCKSIZE}u;")?;
        writeln!(f, "@compute @workgroup_size({BLOCKSIZE}, 1, 1)")?;
        writeln!(
            f,
            "fn main(@builtin(global_invocation_id) global_id: vec3<u32>, \
             @builtin(num_workgroups) num_workgroups: vec3<u32>) {{"
        )?;
        writeln!(
            f,
            "let index = global_id.x + global_id.y * num_workgroups.x * BLOCKSIZE;"
        )?;
        writeln!(f, "if (index >= info[0]) {{ return; }}")?;
        writeln!(f, "{}", self.body)?;
        writeln!(f, "}}")?;
        Ok(())
    }

    pub(crate) fn compile(&self, device: &Device) -> CompiledKernel {
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let mut entries = vec![storage(0, true)];
        entries.extend(self.inputs.iter().map(|input| storage(input.index, false)));

        let wgpu_device = device.wgpu_device();
        let bind_group_layout =
            wgpu_device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &entries,
            });
        let pipeline_layout = wgpu_device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let module = device.create_shader_module(&self.source());
        let pipeline = wgpu_device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: None,
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        CompiledKernel {
            bind_group_layout,
            pipeline,
        }
    }
}

pub(crate) struct CompiledKernel {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl CompiledKernel {
    /// Records one dispatch of `threads` invocations.
    pub(crate) fn run(
        &self,
        device: &Device,
        encoder: &mut wgpu::CommandEncoder,
        info: &[u32],
        tensors: &[wgpu::BufferBinding<'_>],
    ) {
        use wgpu::util::DeviceExt;

        let info_buffer = device
            .wgpu_device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::cast_slice(info),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: info_buffer.as_entire_binding(),
        }];
        for (i, tensor) in tensors.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: wgpu::BindingResource::Buffer(tensor.clone()),
            });
        }
        let bind_group = device
            .wgpu_device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &self.bind_group_layout,
                entries: &entries,
            });

        let [x, y] = workgroups(info[0]);
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        cpass.set_pipeline(&self.pipeline);
        cpass.set_bind_group(0, &bind_group, &[]);
        cpass.dispatch_workgroups(x, y, 1);
    }
}

/// Spreads `threads` over a 2d grid of workgroups.
fn workgroups(threads: u32) -> [u32; 2] {
    let groups = threads.div_ceil(BLOCKSIZE);
    if groups <= MAX_WORKGROUPS {
        [groups, 1]
    } else {
        [MAX_WORKGROUPS, groups.div_ceil(MAX_WORKGROUPS)]
    }
}

#[derive(Clone)]
pub(crate) struct Function {
    id: u32,
    ty: String,
    body: String,
    inputs: Vec<(String, String)>,
}

impl Function {
    fn function_definition(&self) -> String {
        let name = self.function_name();
        let inputs = self
            .inputs
            .iter()
            .map(|(name, ty)| format!("{name}: {ty}"))
            .collect::<Vec<_>>()
            .join(", ");
        let body = &self.body;
        let ty = &self.ty;
        format!("fn {name}({inputs}) -> {ty} {{ {body} return output; }}")
    }

    fn function_name(&self) -> String {
        format!("f_{}", self.id)
    }

    pub(crate) fn call(&self, inputs: &[&str]) -> String {
        format!("{}({})", self.function_name(), inputs.join(", "))
    }
}

#[derive(Clone)]
pub(crate) struct TensorInput {
    index: u32,
    wgsl_type: &'static str,
}

impl TensorInput {
    pub(crate) fn wgsl_type(&self) -> &'static str {
        self.wgsl_type
    }
}

impl Display for TensorInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t_{}", self.index)
    }
}
