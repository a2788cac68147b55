// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! shm: Buffers in CPU-mapped anonymous shared memory, for clients without a usable GPU.

use log::debug;

use crate::checked_arithmetic;
use crate::hwbuf_alloc::allocator::BufferAllocator;
use crate::hwbuf_alloc::allocator::BufferRegistry;
use crate::hwbuf_alloc::allocator::RegistryLink;
use crate::hwbuf_alloc::buffer::BufferBackend;
use crate::hwbuf_alloc::buffer::BufferId;
use crate::hwbuf_alloc::formats::*;
use crate::hwbuf_os::AsRawDescriptor;
use crate::hwbuf_os::MemoryMapping;
use crate::hwbuf_os::RawDescriptor;
use crate::hwbuf_os::SafeDescriptor;
use crate::hwbuf_os::SharedMemory;
use crate::hwbuf_utils::*;

/// Description of a shared memory buffer, as sent to a compositor through `wl_shm`. The fd is
/// owned by the buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShmAttributes {
    pub fd: RawDescriptor,
    pub format: DrmFormat,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
}

/// Shared memory backing of one buffer.
pub(crate) struct ShmBuffer {
    // Unmapped before the fd is closed.
    mapping: MemoryMapping,
    _fd: SafeDescriptor,
    attributes: ShmAttributes,
}

impl ShmBuffer {
    pub fn mapping(&self) -> &MemoryMapping {
        &self.mapping
    }

    pub fn attributes(&self) -> ShmAttributes {
        self.attributes
    }

    pub fn size(&self) -> u64 {
        self.attributes.stride as u64 * self.attributes.height as u64
    }
}

/// Allocates shared memory buffers. Holds no native state.
pub(crate) struct ShmAllocator {
    registry: BufferRegistry<()>,
}

impl ShmAllocator {
    pub fn new() -> ShmAllocator {
        ShmAllocator {
            registry: BufferRegistry::new(),
        }
    }
}

impl BufferAllocator for ShmAllocator {
    fn allocate(
        &self,
        id: BufferId,
        width: u32,
        height: u32,
        format: DrmFormat,
        _modifier: u64,
    ) -> HwbufResult<(BufferBackend, RegistryLink)> {
        if format.planar_layout()?.num_planes != 1 {
            return Err(HwbufError::UnsupportedFormat(format));
        }

        let stride = min_stride(format, width)?;
        let size = checked_arithmetic!(stride * height)?;

        let shm = SharedMemory::new("hwbuf-shm", size as u64)?;
        let fd = SafeDescriptor::from(shm);
        let mapping = MemoryMapping::from_safe_descriptor(
            &fd,
            size as usize,
            HWBUF_MAP_ACCESS_RW,
        )?;

        let attributes = ShmAttributes {
            fd: fd.as_raw_descriptor(),
            format,
            width,
            height,
            stride,
            offset: 0,
        };
        let buffer = ShmBuffer {
            mapping,
            _fd: fd,
            attributes,
        };
        debug!("shm {} stride {} size {}", id, stride, buffer.size());

        let link = self.registry.register(id, ());
        Ok((BufferBackend::Shm(buffer), link))
    }

    fn live_buffers(&self) -> usize {
        self.registry.len()
    }
}
