// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! buffer: The backend-agnostic handle renderers draw into.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use ash::vk;
use log::debug;

use crate::hwbuf_alloc::allocator::BackendKind;
use crate::hwbuf_alloc::allocator::RegistryLink;
use crate::hwbuf_alloc::dmabuf::DmabufAttributes;
use crate::hwbuf_alloc::formats::DrmFormat;
use crate::hwbuf_alloc::gbm::GbmBuffer;
use crate::hwbuf_alloc::shm::ShmAttributes;
use crate::hwbuf_alloc::shm::ShmBuffer;
use crate::hwbuf_alloc::vulkan::VulkanBuffer;
use crate::hwbuf_alloc::vulkan::VulkanImage;
use crate::hwbuf_os::MappedRegion;
use crate::hwbuf_utils::*;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) fn next() -> BufferId {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// CPU access to a buffer's pixels, valid until the matching `end_data_ptr_access`.
#[derive(Copy, Clone, Debug)]
pub struct DataPtrAccess {
    pub ptr: *mut u8,
    pub format: DrmFormat,
    pub stride: u32,
}

pub type DestroyListener = Box<dyn FnOnce(BufferId) + Send>;

pub(crate) enum BufferBackend {
    Gbm(GbmBuffer),
    Vulkan(VulkanBuffer),
    Shm(ShmBuffer),
}

/// A pixel buffer created by an `Allocator`.
///
/// Dropping the buffer (or calling `destroy`) notifies the destroy listeners, then releases the
/// backend's native handles and closes every owned fd exactly once.
pub struct Buffer {
    id: BufferId,
    width: u32,
    height: u32,
    format: DrmFormat,
    locks: u32,
    accessing: bool,
    destroy_listeners: Vec<DestroyListener>,
    // Dropped in declaration order: native resources go before the registry entry.
    backend: BufferBackend,
    _link: RegistryLink,
}

impl Buffer {
    pub(crate) fn new(
        id: BufferId,
        width: u32,
        height: u32,
        format: DrmFormat,
        backend: BufferBackend,
        link: RegistryLink,
    ) -> Buffer {
        Buffer {
            id,
            width,
            height,
            format,
            locks: 0,
            accessing: false,
            destroy_listeners: Vec::new(),
            backend,
            _link: link,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> DrmFormat {
        self.format
    }

    /// Which backend owns the native memory.
    pub fn kind(&self) -> BackendKind {
        match self.backend {
            BufferBackend::Gbm(_) => BackendKind::Gbm,
            BufferBackend::Vulkan(_) => BackendKind::Vulkan,
            BufferBackend::Shm(_) => BackendKind::Shm,
        }
    }

    /// Destroys the buffer. Outstanding locks do not prevent this.
    pub fn destroy(self) {}

    /// Increments the advisory lock count and returns the new value.
    pub fn lock(&mut self) -> u32 {
        self.locks = self.locks.saturating_add(1);
        self.locks
    }

    /// Decrements the advisory lock count and returns the new value.
    pub fn unlock(&mut self) -> HwbufResult<u32> {
        if self.locks == 0 {
            return Err(HwbufError::NotLocked);
        }

        self.locks -= 1;
        Ok(self.locks)
    }

    pub fn locks(&self) -> u32 {
        self.locks
    }

    /// Starts CPU access to the pixels. Only shared-memory buffers are CPU mapped.
    pub fn begin_data_ptr_access(&mut self, flags: u32) -> HwbufResult<DataPtrAccess> {
        if flags == 0 || flags & !DATA_PTR_ACCESS_MASK != 0 {
            return Err(HwbufError::SpecViolation("invalid data pointer access flags"));
        }

        let shm = match &self.backend {
            BufferBackend::Shm(shm) => shm,
            _ => return Err(HwbufError::Unsupported),
        };

        if self.accessing {
            return Err(HwbufError::AlreadyAccessing);
        }

        self.accessing = true;
        Ok(DataPtrAccess {
            ptr: shm.mapping().as_ptr(),
            format: self.format,
            stride: shm.attributes().stride,
        })
    }

    /// Ends CPU access started with `begin_data_ptr_access`.
    pub fn end_data_ptr_access(&mut self) -> HwbufResult<()> {
        if !self.accessing {
            return Err(HwbufError::NotAccessing);
        }

        self.accessing = false;
        Ok(())
    }

    /// The region known to be fully opaque, if any.
    pub fn opaque_region(&self) -> Option<Rect> {
        match self.backend {
            BufferBackend::Shm(_) | BufferBackend::Gbm(_) if !self.format.has_alpha() => {
                Some(Rect::new(0, 0, self.width, self.height))
            }
            _ => None,
        }
    }

    /// DMA-BUF description of GBM and exported Vulkan buffers. The fds remain owned by the
    /// buffer; see `DmabufAttributes::dup_fds`.
    pub fn dmabuf(&self) -> Option<DmabufAttributes> {
        match &self.backend {
            BufferBackend::Gbm(gbm) => gbm.dmabuf(),
            BufferBackend::Vulkan(vulkan) => vulkan.dmabuf(),
            BufferBackend::Shm(_) => None,
        }
    }

    /// Shared-memory description of SHM buffers.
    pub fn shm(&self) -> Option<ShmAttributes> {
        match &self.backend {
            BufferBackend::Shm(shm) => Some(shm.attributes()),
            _ => None,
        }
    }

    /// The Vulkan image behind a Vulkan buffer.
    pub fn vulkan_image(&self) -> Option<&VulkanImage> {
        match &self.backend {
            BufferBackend::Vulkan(vulkan) => Some(vulkan.image()),
            _ => None,
        }
    }

    /// Records a layout transition of the buffer's image into `cmd` and tracks `new_layout` as
    /// the current layout.
    pub fn transition_layout(
        &mut self,
        cmd: vk::CommandBuffer,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> HwbufResult<()> {
        match &mut self.backend {
            BufferBackend::Vulkan(vulkan) => {
                vulkan
                    .image_mut()
                    .transition_layout(cmd, old_layout, new_layout, src_stage, dst_stage);
                Ok(())
            }
            _ => Err(HwbufError::Unsupported),
        }
    }

    #[cfg(test)]
    pub(crate) fn backend_for_test(&self) -> &BufferBackend {
        &self.backend
    }

    /// Registers a closure run once, when the buffer is destroyed.
    pub fn add_destroy_listener<F>(&mut self, listener: F)
    where
        F: FnOnce(BufferId) + Send + 'static,
    {
        self.destroy_listeners.push(Box::new(listener));
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.locks > 0 {
            debug!("{} destroyed with {} outstanding locks", self.id, self.locks);
        }

        for listener in self.destroy_listeners.drain(..) {
            listener(self.id);
        }

        debug!(
            "destroying {} ({:?} {}x{} {:?})",
            self.id,
            self.kind(),
            self.width,
            self.height,
            self.format
        );
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("locks", &self.locks)
            .finish()
    }
}
