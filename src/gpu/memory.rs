use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use bytemuck::{AnyBitPattern, NoUninit};
use log::trace;
use wgpu::util::DownloadBuffer;

use crate::{
    error::DeviceError,
    tensor::{DevicePtr, DeviceSpan},
    workspace::align_up,
};

use super::Device;

/// First address handed out, so a zero pointer never names an allocation.
const BASE_ADDRESS: u64 = 0x1_0000;
/// Spacing between allocations in the address space.
const ADDRESS_ALIGNMENT: u64 = 256;

#[derive(Clone)]
struct Allocation {
    buffer: Arc<wgpu::Buffer>,
    size: u64,
}

/// Device memory addressed by [`DevicePtr`].
///
/// Every allocation is its own `wgpu::Buffer` mapped into a flat, made up
/// address space. Kernels turn a pointer back into a buffer and an offset
/// with [`DeviceMemory::resolve`].
#[derive(Clone)]
pub struct DeviceMemory {
    device: Device,
    table: Arc<ArcSwap<BTreeMap<u64, Allocation>>>,
    next: Arc<AtomicU64>,
}

impl DeviceMemory {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            table: Default::default(),
            next: Arc::new(AtomicU64::new(BASE_ADDRESS)),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Allocates at least `len` zeroed bytes.
    pub fn alloc(&self, len: u64) -> DeviceSpan {
        let size = align_up(len.max(1), wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self
            .device
            .wgpu_device()
            .create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
        let addr = self
            .next
            .fetch_add(align_up(size, ADDRESS_ALIGNMENT), Ordering::Relaxed);
        let allocation = Allocation {
            buffer: Arc::new(buffer),
            size,
        };
        self.table.rcu(|table| {
            let mut table = BTreeMap::clone(table);
            table.insert(addr, allocation.clone());
            table
        });
        trace!("allocated {size} bytes at {:#x}", addr);
        DeviceSpan::new(DevicePtr(addr), len)
    }

    /// Allocates a buffer holding `data`.
    pub fn alloc_from<T: NoUninit>(&self, data: &[T]) -> Result<DeviceSpan, DeviceError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let span = self.alloc(bytes.len() as u64);
        if bytes.is_empty() {
            return Ok(span);
        }
        // the allocation is rounded up, so the zero tail stays inside it
        let mut padded = bytes.to_vec();
        padded.resize(align_up(bytes.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
        let (buffer, offset) = self.resolve(DeviceSpan::new(span.ptr, padded.len() as u64))?;
        self.device.wgpu_queue().write_buffer(&buffer, offset, &padded);
        Ok(span)
    }

    /// Releases the allocation starting at `ptr`. Work already submitted
    /// against it still completes.
    pub fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        if !self.table.load().contains_key(&ptr.addr()) {
            return Err(DeviceError::UnknownAddress(ptr));
        }
        self.table.rcu(|table| {
            let mut table = BTreeMap::clone(table);
            table.remove(&ptr.addr());
            table
        });
        Ok(())
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        self.table.load().len()
    }

    /// The buffer containing `span` and the offset of `span` inside it.
    pub fn resolve(&self, span: DeviceSpan) -> Result<(Arc<wgpu::Buffer>, u64), DeviceError> {
        let table = self.table.load();
        let Some((base, allocation)) = table.range(..=span.ptr.addr()).next_back() else {
            return Err(DeviceError::UnknownAddress(span.ptr));
        };
        let offset = span.ptr.addr() - base;
        if offset >= allocation.size && span.len > 0 {
            return Err(DeviceError::UnknownAddress(span.ptr));
        }
        if offset + span.len > allocation.size {
            return Err(DeviceError::OutOfBounds {
                ptr: span.ptr,
                len: span.len,
            });
        }
        Ok((allocation.buffer.clone(), offset))
    }

    /// Writes `data` starting at `ptr`. The write lands before any work
    /// submitted afterwards.
    ///
    /// Both the offset of `ptr` inside its buffer and the byte length of
    /// `data` must be multiples of [`wgpu::COPY_BUFFER_ALIGNMENT`].
    pub fn upload<T: NoUninit>(&self, ptr: DevicePtr, data: &[T]) -> Result<(), DeviceError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len() as u64;
        let (buffer, offset) = self.resolve(DeviceSpan::new(ptr, len))?;
        let alignment = wgpu::COPY_BUFFER_ALIGNMENT;
        if offset % alignment != 0 {
            return Err(DeviceError::Misaligned {
                ptr,
                offset,
                alignment,
            });
        }
        if len % alignment != 0 {
            return Err(DeviceError::UnalignedLength {
                ptr,
                len,
                alignment,
            });
        }
        self.device.wgpu_queue().write_buffer(&buffer, offset, bytes);
        Ok(())
    }

    /// Reads `span` back. Flush any stream that writes to it first.
    pub async fn download<T: AnyBitPattern>(&self, span: DeviceSpan) -> Result<Vec<T>, DeviceError> {
        let (buffer, offset) = self.resolve(span)?;
        if span.len == 0 {
            return Ok(Vec::new());
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(DeviceError::Misaligned {
                ptr: span.ptr,
                offset,
                alignment: wgpu::COPY_BUFFER_ALIGNMENT,
            });
        }
        let end = offset + align_up(span.len, wgpu::COPY_BUFFER_ALIGNMENT);
        let (sender, receiver) = futures_channel::oneshot::channel();
        DownloadBuffer::read_buffer(
            self.device.wgpu_device(),
            self.device.wgpu_queue(),
            &buffer.slice(offset..end),
            move |result| {
                _ = sender.send(result);
            },
        );
        self.device.wait();
        let downloaded = receiver.await.map_err(|_| DeviceError::Canceled)??;
        Ok(downloaded[..span.len as usize]
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}
