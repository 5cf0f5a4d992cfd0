use std::{fmt::Debug, sync::Arc};

use log::info;

use crate::error::DeviceError;

/// A shared handle to one wgpu device and its queue.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl Device {
    pub async fn new() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .ok_or(DeviceError::NoAdapter)?;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("kernel graph device"),
                    required_limits: adapter.limits(),
                    ..Default::default()
                },
                None,
            )
            .await?;
        let adapter_info = adapter.get_info();
        info!(
            "using {} ({:?}) for kernel dispatch",
            adapter_info.name, adapter_info.backend
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                adapter,
                device,
                queue,
            }),
        })
    }

    pub fn wgpu_adapter(&self) -> &wgpu::Adapter {
        &self.inner.adapter
    }

    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.inner.device
    }

    pub fn wgpu_queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }

    /// Required alignment of a storage binding's offset into its buffer.
    pub fn storage_alignment(&self) -> u64 {
        self.inner.device.limits().min_storage_buffer_offset_alignment as u64
    }

    /// Blocks until all submitted work has finished.
    pub fn wait(&self) {
        self.inner.device.poll(wgpu::Maintain::Wait);
    }

    pub(crate) fn create_shader_module(&self, source: &str) -> wgpu::ShaderModule {
        self.inner
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: None,
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("adapter", &self.inner.adapter.get_info().name)
            .finish_non_exhaustive()
    }
}
