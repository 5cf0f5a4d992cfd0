//! A wgpu backend: device memory behind [`DevicePtr`](crate::tensor::DevicePtr)s,
//! command streams and a kernel registry that turns operator launches into
//! generated WGSL compute shaders.

mod device;
mod kernel;
mod kernels;
mod memory;
mod registry;
mod stream;

pub use device::Device;
pub use memory::DeviceMemory;
pub use registry::WgpuRegistry;
pub use stream::WgpuStream;
