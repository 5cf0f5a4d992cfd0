use log::trace;

use super::Device;

/// An ordered queue of kernel dispatches.
///
/// Launches are recorded into a command encoder and only reach the device on
/// [`WgpuStream::flush`]. Everything recorded before a flush runs before
/// anything recorded after it.
pub struct WgpuStream {
    device: Device,
    encoder: Option<wgpu::CommandEncoder>,
    recorded: usize,
}

impl WgpuStream {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            encoder: None,
            recorded: 0,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Dispatches recorded since the last flush.
    pub fn pending(&self) -> usize {
        self.recorded
    }

    pub(crate) fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.recorded += 1;
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device
                .wgpu_device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None })
        })
    }

    /// Submits the recorded dispatches without waiting for them.
    pub fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            trace!("submitting {} dispatches", self.recorded);
            self.device.wgpu_queue().submit(Some(encoder.finish()));
        }
        self.recorded = 0;
    }

    /// Submits the recorded dispatches and blocks until the device is idle.
    pub fn synchronize(&mut self) {
        self.flush();
        self.device.wait();
    }
}

impl Drop for WgpuStream {
    fn drop(&mut self) {
        self.flush();
    }
}
