// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! allocator: One entry point over the GBM, Vulkan and shared memory backends.

use std::collections::BTreeMap as Map;
#[cfg(feature = "gbm")]
use std::fs::File;
use std::sync::Arc;
use std::sync::Mutex;

use ash::vk;
use log::debug;
use log::error;

use crate::hwbuf_alloc::buffer::Buffer;
use crate::hwbuf_alloc::buffer::BufferBackend;
use crate::hwbuf_alloc::buffer::BufferId;
use crate::hwbuf_alloc::dmabuf::DmabufAttributes;
use crate::hwbuf_alloc::formats::*;
use crate::hwbuf_alloc::gbm::GbmAllocator;
use crate::hwbuf_alloc::gbm::GbmDriver;
#[cfg(feature = "gbm")]
use crate::hwbuf_alloc::gbm::LibGbmDriver;
use crate::hwbuf_alloc::shm::ShmAllocator;
use crate::hwbuf_alloc::vulkan::AshDriver;
use crate::hwbuf_alloc::vulkan::VulkanAllocator;
use crate::hwbuf_alloc::vulkan::VulkanDriver;
use crate::hwbuf_utils::*;

/// Default upper bound on either buffer dimension.
pub const DEFAULT_MAX_DIMENSION: u32 = 16384;

/// Enumeration of possible allocation backends.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    Gbm,
    Vulkan,
    Shm,
}

/// Removes a buffer's registry entry when dropped.
pub(crate) struct RegistryLink {
    unlink: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for RegistryLink {
    fn drop(&mut self) {
        if let Some(unlink) = self.unlink.take() {
            unlink();
        }
    }
}

/// Live buffers of one allocator, keyed by id. Buffers hold a weak link back, so they may
/// outlive the allocator.
pub(crate) struct BufferRegistry<T> {
    entries: Arc<Mutex<Map<BufferId, T>>>,
}

impl<T: Send + 'static> BufferRegistry<T> {
    pub fn new() -> BufferRegistry<T> {
        BufferRegistry {
            entries: Arc::new(Mutex::new(Map::new())),
        }
    }

    pub fn register(&self, id: BufferId, value: T) -> RegistryLink {
        self.entries.lock().unwrap().insert(id, value);

        let entries = Arc::downgrade(&self.entries);
        RegistryLink {
            unlink: Some(Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    let removed = entries.lock().unwrap().remove(&id);
                    drop(removed);
                }
            })),
        }
    }

    /// Removes and returns every entry, in id order.
    pub fn drain(&self) -> Vec<T> {
        let drained = std::mem::take(&mut *self.entries.lock().unwrap());
        drained.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Operations every backend provides to `Allocator`.
pub(crate) trait BufferAllocator: Send {
    fn allocate(
        &self,
        id: BufferId,
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
    ) -> HwbufResult<(BufferBackend, RegistryLink)>;

    /// Implementations that can wrap foreign DMA-BUFs override this.
    fn import_dmabuf(
        &self,
        _id: BufferId,
        _attrs: &DmabufAttributes,
    ) -> HwbufResult<(BufferBackend, RegistryLink)> {
        Err(HwbufError::Unsupported)
    }

    fn live_buffers(&self) -> usize;
}

pub(crate) enum AllocatorBackend {
    Gbm(GbmAllocator),
    Vulkan(VulkanAllocator),
    Shm(ShmAllocator),
}

/// Settings shared by every backend.
#[derive(Copy, Clone, Debug)]
pub struct AllocatorConfig {
    pub default_format: DrmFormat,
    pub default_modifier: u64,
    pub max_dimension: u32,
}

/// Builder for `Allocator`.
#[derive(Copy, Clone, Debug)]
pub struct AllocatorBuilder {
    config: AllocatorConfig,
}

impl Default for AllocatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorBuilder {
    /// Create new AllocatorBuilder with XRGB8888, an implicit modifier and a 16384 pixel limit.
    pub fn new() -> AllocatorBuilder {
        AllocatorBuilder {
            config: AllocatorConfig {
                default_format: DrmFormat::from_bytes(DRM_FORMAT_XRGB8888),
                default_modifier: DRM_FORMAT_MOD_INVALID,
                max_dimension: DEFAULT_MAX_DIMENSION,
            },
        }
    }

    /// Set the format `create_buffer` allocates.
    pub fn set_default_format(mut self, format: DrmFormat) -> AllocatorBuilder {
        self.config.default_format = format;
        self
    }

    /// Set the modifier `create_buffer` requests.
    pub fn set_default_modifier(mut self, modifier: u64) -> AllocatorBuilder {
        self.config.default_modifier = modifier;
        self
    }

    /// Set the largest width or height accepted.
    pub fn set_max_dimension(mut self, max_dimension: u32) -> AllocatorBuilder {
        self.config.max_dimension = max_dimension;
        self
    }

    fn build(self, backend: AllocatorBackend) -> HwbufResult<Allocator> {
        if self.config.max_dimension == 0 {
            return Err(HwbufError::SpecViolation("max dimension must be positive"));
        }

        Ok(Allocator {
            config: self.config,
            destroy_listeners: Vec::new(),
            backend,
        })
    }

    /// Builds an allocator of CPU-mapped shared memory buffers.
    pub fn build_shm(self) -> HwbufResult<Allocator> {
        self.build(AllocatorBackend::Shm(ShmAllocator::new()))
    }

    /// Builds a GBM allocator over `drm_fd` using the system libgbm.
    #[cfg(feature = "gbm")]
    pub fn build_gbm(self, drm_fd: File) -> HwbufResult<Allocator> {
        let driver = LibGbmDriver::new(drm_fd)?;
        self.build_gbm_with_driver(Arc::new(driver))
    }

    /// Builds a GBM allocator over the first usable DRM render node.
    #[cfg(feature = "gbm")]
    pub fn build_gbm_from_rendernode(self) -> HwbufResult<Allocator> {
        let undesired: &[&str] = &["vgem"];
        let drm_fd = crate::hwbuf_alloc::rendernode::open_device(undesired)?;
        self.build_gbm(drm_fd)
    }

    /// Builds a GBM allocator over an arbitrary driver.
    pub fn build_gbm_with_driver(self, driver: Arc<dyn GbmDriver>) -> HwbufResult<Allocator> {
        let gbm = GbmAllocator::new(driver)?;
        self.build(AllocatorBackend::Gbm(gbm))
    }

    /// Builds a Vulkan allocator on a caller-owned device. The device must have
    /// VK_KHR_external_memory_fd, VK_EXT_external_memory_dma_buf and
    /// VK_EXT_image_drm_format_modifier enabled, and must outlive the allocator and its buffers.
    pub fn build_vulkan(
        self,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> HwbufResult<Allocator> {
        let driver = AshDriver::new(instance, physical_device, device);
        self.build_vulkan_with_driver(Arc::new(driver))
    }

    /// Builds a Vulkan allocator over an arbitrary driver.
    pub fn build_vulkan_with_driver(
        self,
        driver: Arc<dyn VulkanDriver>,
    ) -> HwbufResult<Allocator> {
        self.build(AllocatorBackend::Vulkan(VulkanAllocator::new(driver)))
    }
}

pub type AllocatorDestroyListener = Box<dyn FnOnce(BackendKind) + Send>;

/// A factory of `Buffer`s backed by one kind of memory.
pub struct Allocator {
    config: AllocatorConfig,
    destroy_listeners: Vec<AllocatorDestroyListener>,
    // Dropped after the destroy listeners ran.
    backend: AllocatorBackend,
}

impl Allocator {
    fn ops(&self) -> &dyn BufferAllocator {
        match &self.backend {
            AllocatorBackend::Gbm(gbm) => gbm,
            AllocatorBackend::Vulkan(vulkan) => vulkan,
            AllocatorBackend::Shm(shm) => shm,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self.backend {
            AllocatorBackend::Gbm(_) => BackendKind::Gbm,
            AllocatorBackend::Vulkan(_) => BackendKind::Vulkan,
            AllocatorBackend::Shm(_) => BackendKind::Shm,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn check_dimensions(&self, width: u32, height: u32) -> HwbufResult<()> {
        let max = self.config.max_dimension;
        if width == 0 || height == 0 || width > max || height > max {
            error!("rejecting {}x{} buffer (limit {})", width, height, max);
            return Err(HwbufError::InvalidDimensions(width, height));
        }

        Ok(())
    }

    /// Creates a buffer in the configured default format and modifier.
    pub fn create_buffer(&self, width: u32, height: u32) -> HwbufResult<Buffer> {
        self.create_buffer_with_format(
            width,
            height,
            self.config.default_format,
            self.config.default_modifier,
        )
    }

    /// Creates a buffer of `format`. `modifier` is a layout hint; `DRM_FORMAT_MOD_INVALID` lets
    /// the driver choose.
    pub fn create_buffer_with_format(
        &self,
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
    ) -> HwbufResult<Buffer> {
        self.check_dimensions(width, height)?;

        let id = BufferId::next();
        let (backend, link) = self
            .ops()
            .allocate(id, width, height, format, modifier)?;
        debug!(
            "created {} {:?} {}x{} {:?} modifier {:#x}",
            id,
            self.kind(),
            width,
            height,
            format,
            modifier
        );

        Ok(Buffer::new(id, width, height, format, backend, link))
    }

    /// Wraps a foreign DMA-BUF. The plane fds are duplicated; the caller keeps its own.
    pub fn import_dmabuf(&self, attrs: &DmabufAttributes) -> HwbufResult<Buffer> {
        self.check_dimensions(attrs.width, attrs.height)?;

        let id = BufferId::next();
        let (backend, link) = self.ops().import_dmabuf(id, attrs)?;
        debug!(
            "imported {} {}x{} {:?} with {} planes",
            id, attrs.width, attrs.height, attrs.format, attrs.n_planes
        );

        Ok(Buffer::new(
            id,
            attrs.width,
            attrs.height,
            attrs.format,
            backend,
            link,
        ))
    }

    /// Number of buffers created by this allocator that are still alive.
    pub fn live_buffers(&self) -> usize {
        self.ops().live_buffers()
    }

    /// Registers a closure run once, before the allocator releases its native resources.
    pub fn add_destroy_listener<F>(&mut self, listener: F)
    where
        F: FnOnce(BackendKind) + Send + 'static,
    {
        self.destroy_listeners.push(Box::new(listener));
    }

    /// Destroys the allocator. GBM buffers still alive lose their native memory.
    pub fn destroy(self) {}
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let kind = self.kind();
        for listener in self.destroy_listeners.drain(..) {
            listener(kind);
        }

        debug!(
            "destroying {:?} allocator with {} live buffers",
            kind,
            self.live_buffers()
        );
    }
}
