// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vulkan: Exports device-local Vulkan images as DMA-BUFs and imports DMA-BUFs as Vulkan images.
//!
//! Native calls go through `VulkanDriver`. `AshDriver` implements it over a caller-owned
//! `ash::Device` with VK_KHR_external_memory_fd, VK_EXT_external_memory_dma_buf and
//! VK_EXT_image_drm_format_modifier enabled.

use std::convert::TryInto;
use std::sync::Arc;

use ash::ext;
use ash::khr;
use ash::vk;
use log::debug;
use log::error;
use log::info;

use crate::hwbuf_alloc::allocator::BufferAllocator;
use crate::hwbuf_alloc::allocator::BufferRegistry;
use crate::hwbuf_alloc::allocator::RegistryLink;
use crate::hwbuf_alloc::buffer::BufferBackend;
use crate::hwbuf_alloc::buffer::BufferId;
use crate::hwbuf_alloc::dmabuf::DmabufAttributes;
use crate::hwbuf_alloc::dmabuf::OwnedDmabuf;
use crate::hwbuf_alloc::dmabuf::OwnedPlane;
use crate::hwbuf_alloc::formats::*;
use crate::hwbuf_os::AsRawDescriptor;
use crate::hwbuf_os::FromRawDescriptor;
use crate::hwbuf_os::IntoRawDescriptor;
use crate::hwbuf_os::SafeDescriptor;
use crate::hwbuf_utils::*;

const DMA_BUF_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT;

/// How the image's texels are laid out in memory.
#[derive(Clone, Debug)]
pub enum ImageTiling {
    Optimal,
    Linear,
    /// Let the driver pick one of these DRM format modifiers.
    Modifiers(Vec<u64>),
    /// Match an existing DMA-BUF layout exactly.
    Explicit {
        modifier: u64,
        plane_layouts: Vec<vk::SubresourceLayout>,
    },
}

/// A 2D, single-mip, DMA-BUF compatible image to create.
#[derive(Clone, Debug)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub tiling: ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

/// The Vulkan entry points the allocator needs.
pub trait VulkanDriver: Send + Sync {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// Creates an image whose memory is exportable to and importable from DMA-BUFs.
    fn create_image(&self, desc: &ImageDesc) -> HwbufResult<vk::Image>;

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    fn image_subresource_layout(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
    ) -> vk::SubresourceLayout;

    /// The modifier chosen for an image created with `ImageTiling::Modifiers`.
    fn image_drm_format_modifier(&self, image: vk::Image) -> HwbufResult<u64>;

    /// Allocates memory dedicated to `image` that can be exported as a DMA-BUF.
    fn allocate_exportable_memory(
        &self,
        image: vk::Image,
        size: u64,
        memory_type_index: u32,
    ) -> HwbufResult<vk::DeviceMemory>;

    /// Memory types a DMA-BUF can be imported into.
    fn memory_fd_type_bits(&self, fd: &SafeDescriptor) -> HwbufResult<u32>;

    /// Imports `fd` as memory dedicated to `image`. Ownership of `fd` moves to the driver on
    /// success; on failure it is closed.
    fn import_memory(
        &self,
        image: vk::Image,
        fd: SafeDescriptor,
        size: u64,
        memory_type_index: u32,
    ) -> HwbufResult<vk::DeviceMemory>;

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> HwbufResult<()>;

    /// Exports `memory` as a new DMA-BUF fd.
    fn get_memory_fd(&self, memory: vk::DeviceMemory) -> HwbufResult<SafeDescriptor>;

    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    );

    fn destroy_image(&self, image: vk::Image);

    fn free_memory(&self, memory: vk::DeviceMemory);
}

/// `VulkanDriver` over ash. The device is borrowed: it is never destroyed here.
pub struct AshDriver {
    device: ash::Device,
    external_memory_fd: khr::external_memory_fd::Device,
    drm_format_modifier: ext::image_drm_format_modifier::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl AshDriver {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> AshDriver {
        // Safe because the physical device belongs to the instance.
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        AshDriver {
            device: device.clone(),
            external_memory_fd: khr::external_memory_fd::Device::new(instance, device),
            drm_format_modifier: ext::image_drm_format_modifier::Device::new(instance, device),
            memory_properties,
        }
    }
}

impl VulkanDriver for AshDriver {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn create_image(&self, desc: &ImageDesc) -> HwbufResult<vk::Image> {
        let mut external =
            vk::ExternalMemoryImageCreateInfo::default().handle_types(DMA_BUF_HANDLE_TYPE);
        let mut modifier_list = vk::ImageDrmFormatModifierListCreateInfoEXT::default();
        let mut explicit = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default();

        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external);

        let info = match &desc.tiling {
            ImageTiling::Optimal => info.tiling(vk::ImageTiling::OPTIMAL),
            ImageTiling::Linear => info.tiling(vk::ImageTiling::LINEAR),
            ImageTiling::Modifiers(modifiers) => {
                modifier_list = modifier_list.drm_format_modifiers(modifiers);
                info.tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                    .push_next(&mut modifier_list)
            }
            ImageTiling::Explicit {
                modifier,
                plane_layouts,
            } => {
                explicit = explicit
                    .drm_format_modifier(*modifier)
                    .plane_layouts(plane_layouts);
                info.tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                    .push_next(&mut explicit)
            }
        };

        // Safe because the create info and its chain outlive the call.
        let image = unsafe { self.device.create_image(&info, None) }?;
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // Safe because the image was created on this device.
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn image_subresource_layout(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
    ) -> vk::SubresourceLayout {
        let subresource = vk::ImageSubresource::default()
            .aspect_mask(aspect)
            .mip_level(0)
            .array_layer(0);

        // Safe because the image is linear or modifier-tiled and the aspect matches its tiling.
        unsafe { self.device.get_image_subresource_layout(image, subresource) }
    }

    fn image_drm_format_modifier(&self, image: vk::Image) -> HwbufResult<u64> {
        let mut props = vk::ImageDrmFormatModifierPropertiesEXT::default();

        // Safe because the image was created with DRM format modifier tiling.
        unsafe {
            self.drm_format_modifier
                .get_image_drm_format_modifier_properties(image, &mut props)
        }?;
        Ok(props.drm_format_modifier)
    }

    fn allocate_exportable_memory(
        &self,
        image: vk::Image,
        size: u64,
        memory_type_index: u32,
    ) -> HwbufResult<vk::DeviceMemory> {
        let mut export =
            vk::ExportMemoryAllocateInfo::default().handle_types(DMA_BUF_HANDLE_TYPE);
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index)
            .push_next(&mut dedicated)
            .push_next(&mut export);

        // Safe because the allocate info and its chain outlive the call.
        let memory = unsafe { self.device.allocate_memory(&info, None) }?;
        Ok(memory)
    }

    fn memory_fd_type_bits(&self, fd: &SafeDescriptor) -> HwbufResult<u32> {
        let mut props = vk::MemoryFdPropertiesKHR::default();

        // Safe because the fd stays open for the duration of the call.
        unsafe {
            self.external_memory_fd.get_memory_fd_properties(
                DMA_BUF_HANDLE_TYPE,
                fd.as_raw_descriptor(),
                &mut props,
            )
        }?;
        Ok(props.memory_type_bits)
    }

    fn import_memory(
        &self,
        image: vk::Image,
        fd: SafeDescriptor,
        size: u64,
        memory_type_index: u32,
    ) -> HwbufResult<vk::DeviceMemory> {
        let mut import = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(DMA_BUF_HANDLE_TYPE)
            .fd(fd.as_raw_descriptor());
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import)
            .push_next(&mut dedicated);

        // Safe because the allocate info and its chain outlive the call. On failure `fd` is
        // still ours and is closed on return.
        let memory = unsafe { self.device.allocate_memory(&info, None) }?;

        // The implementation owns the fd now.
        let _ = fd.into_raw_descriptor();
        Ok(memory)
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> HwbufResult<()> {
        // Safe because both handles belong to this device and the memory was sized for the
        // image.
        unsafe { self.device.bind_image_memory(image, memory, 0) }?;
        Ok(())
    }

    fn get_memory_fd(&self, memory: vk::DeviceMemory) -> HwbufResult<SafeDescriptor> {
        let info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(DMA_BUF_HANDLE_TYPE);

        // Safe because vkGetMemoryFdKHR hands us a new fd we own.
        let fd = unsafe { self.external_memory_fd.get_memory_fd(&info) }?;
        Ok(unsafe { SafeDescriptor::from_raw_descriptor(fd) })
    }

    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        // Safe as long as `cmd` is in the recording state, which is the caller's contract.
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            )
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        // Safe because the image is no longer referenced.
        unsafe { self.device.destroy_image(image, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        // Safe because nothing bound to the memory is used anymore.
        unsafe { self.device.free_memory(memory, None) }
    }
}

/// Destroys the image unless committed.
struct ImageGuard {
    driver: Arc<dyn VulkanDriver>,
    image: vk::Image,
    committed: bool,
}

impl ImageGuard {
    fn new(driver: Arc<dyn VulkanDriver>, image: vk::Image) -> ImageGuard {
        ImageGuard {
            driver,
            image,
            committed: false,
        }
    }

    fn commit(mut self) -> vk::Image {
        self.committed = true;
        self.image
    }
}

impl Drop for ImageGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.driver.destroy_image(self.image);
        }
    }
}

/// Frees the memory unless committed.
struct MemoryGuard {
    driver: Arc<dyn VulkanDriver>,
    memory: vk::DeviceMemory,
    committed: bool,
}

impl MemoryGuard {
    fn new(driver: Arc<dyn VulkanDriver>, memory: vk::DeviceMemory) -> MemoryGuard {
        MemoryGuard {
            driver,
            memory,
            committed: false,
        }
    }

    fn commit(mut self) -> vk::DeviceMemory {
        self.committed = true;
        self.memory
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.driver.free_memory(self.memory);
        }
    }
}

/// Access mask implied by an image layout on either side of a barrier.
pub fn access_mask_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// Layout transition barrier over the whole color image.
pub fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(access_mask_for_layout(old_layout))
        .dst_access_mask(access_mask_for_layout(new_layout))
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
}

/// Index of the first memory type allowed by `type_bits` that has all of `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    props
        .memory_types
        .iter()
        .take(props.memory_type_count as usize)
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
}

/// An image and the device memory bound to it, released together.
pub struct VulkanImage {
    driver: Arc<dyn VulkanDriver>,
    image: vk::Image,
    memories: Vec<vk::DeviceMemory>,
    format: vk::Format,
    layout: vk::ImageLayout,
}

impl VulkanImage {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// The layout recorded by the last `transition_layout`.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    /// Records a barrier moving the image from `old_layout` to `new_layout`. The new layout is
    /// tracked as soon as the barrier is recorded, whether or not `cmd` is ever submitted.
    pub fn transition_layout(
        &mut self,
        cmd: vk::CommandBuffer,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = image_barrier(self.image, old_layout, new_layout);
        self.driver.cmd_image_barrier(cmd, src_stage, dst_stage, &barrier);
        self.layout = new_layout;
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        self.driver.destroy_image(self.image);
        for memory in self.memories.drain(..) {
            self.driver.free_memory(memory);
        }
    }
}

/// Vulkan backing of one buffer. Exported buffers also own their DMA-BUF fd.
pub(crate) struct VulkanBuffer {
    dmabuf: Option<OwnedDmabuf>,
    image: VulkanImage,
}

impl VulkanBuffer {
    pub fn dmabuf(&self) -> Option<DmabufAttributes> {
        self.dmabuf.as_ref().map(OwnedDmabuf::attributes)
    }

    pub fn image(&self) -> &VulkanImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut VulkanImage {
        &mut self.image
    }
}

pub(crate) struct VulkanAllocator {
    driver: Arc<dyn VulkanDriver>,
    registry: BufferRegistry<()>,
}

impl VulkanAllocator {
    pub fn new(driver: Arc<dyn VulkanDriver>) -> VulkanAllocator {
        info!(
            "vulkan allocator with {} memory types",
            driver.memory_properties().memory_type_count
        );

        VulkanAllocator {
            driver,
            registry: BufferRegistry::new(),
        }
    }
}

impl BufferAllocator for VulkanAllocator {
    fn allocate(
        &self,
        id: BufferId,
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
    ) -> HwbufResult<(BufferBackend, RegistryLink)> {
        let vk_format = format.vulkan_format()?;
        if format.planar_layout()?.num_planes != 1 {
            error!("cannot export multi-planar {:?}", format);
            return Err(HwbufError::UnsupportedFormat(format));
        }

        let tiling = match modifier {
            DRM_FORMAT_MOD_INVALID => ImageTiling::Optimal,
            DRM_FORMAT_MOD_LINEAR => ImageTiling::Linear,
            explicit => ImageTiling::Modifiers(vec![explicit]),
        };
        let desc = ImageDesc {
            format: vk_format,
            width,
            height,
            tiling,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        };

        let image = ImageGuard::new(self.driver.clone(), self.driver.create_image(&desc)?);
        let reqs = self.driver.image_memory_requirements(image.image);
        let memory_type_index = find_memory_type(
            &self.driver.memory_properties(),
            reqs.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or_else(|| {
            error!(
                "no device-local memory type in {:#x}",
                reqs.memory_type_bits
            );
            HwbufError::AllocationFailed {
                reason: "no device-local memory type",
                code: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.as_raw(),
            }
        })?;

        let memory = MemoryGuard::new(
            self.driver.clone(),
            self.driver
                .allocate_exportable_memory(image.image, reqs.size, memory_type_index)?,
        );
        self.driver.bind_image_memory(image.image, memory.memory)?;
        let fd = self.driver.get_memory_fd(memory.memory)?;

        let (modifier, layout) = match desc.tiling {
            ImageTiling::Linear => (
                DRM_FORMAT_MOD_LINEAR,
                self.driver
                    .image_subresource_layout(image.image, format.vulkan_image_aspect(0)?),
            ),
            ImageTiling::Modifiers(_) | ImageTiling::Explicit { .. } => (
                self.driver.image_drm_format_modifier(image.image)?,
                self.driver.image_subresource_layout(
                    image.image,
                    vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
                ),
            ),
            // The implicit layout cannot be queried; advertise the tightly packed one.
            ImageTiling::Optimal => (
                DRM_FORMAT_MOD_INVALID,
                vk::SubresourceLayout {
                    row_pitch: min_stride(format, width)? as u64,
                    ..Default::default()
                },
            ),
        };

        let plane = OwnedPlane {
            fd,
            offset: layout.offset.try_into()?,
            stride: layout.row_pitch.try_into()?,
        };
        let dmabuf = OwnedDmabuf::new(width, height, format, modifier, vec![plane])?;
        debug!(
            "vulkan {} exported with modifier {:#x}, memory type {}",
            id, modifier, memory_type_index
        );

        let image = VulkanImage {
            driver: self.driver.clone(),
            memories: vec![memory.commit()],
            image: image.commit(),
            format: vk_format,
            layout: vk::ImageLayout::UNDEFINED,
        };
        let link = self.registry.register(id, ());
        let buffer = VulkanBuffer {
            dmabuf: Some(dmabuf),
            image,
        };
        Ok((BufferBackend::Vulkan(buffer), link))
    }

    fn import_dmabuf(
        &self,
        id: BufferId,
        attrs: &DmabufAttributes,
    ) -> HwbufResult<(BufferBackend, RegistryLink)> {
        let vk_format = attrs.format.vulkan_format()?;
        let num_planes = attrs.format.planar_layout()?.num_planes;
        if attrs.n_planes == 0 || attrs.n_planes < num_planes || attrs.n_planes > 4 {
            return Err(HwbufError::InvalidNumberOfPlanes(attrs.n_planes));
        }

        let tiling = if attrs.modifier != DRM_FORMAT_MOD_INVALID {
            ImageTiling::Explicit {
                modifier: attrs.modifier,
                plane_layouts: attrs
                    .planes()
                    .iter()
                    .map(|plane| vk::SubresourceLayout {
                        offset: plane.offset as u64,
                        row_pitch: plane.stride as u64,
                        ..Default::default()
                    })
                    .collect(),
            }
        } else {
            ImageTiling::Optimal
        };
        let desc = ImageDesc {
            format: vk_format,
            width: attrs.width,
            height: attrs.height,
            tiling,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
        };

        let image = ImageGuard::new(self.driver.clone(), self.driver.create_image(&desc)?);
        let reqs = self.driver.image_memory_requirements(image.image);

        // Ownership of each fd moves to the driver, so import duplicates.
        let mut memories: Vec<MemoryGuard> = Vec::with_capacity(attrs.n_planes);
        for (plane, fd) in attrs.dup_fds()?.into_iter().enumerate() {
            let candidates = reqs.memory_type_bits & self.driver.memory_fd_type_bits(&fd)?;
            if candidates == 0 {
                error!(
                    "plane {} of {:?}: no memory type shared with image bits {:#x}",
                    plane, attrs.format, reqs.memory_type_bits
                );
                return Err(HwbufError::ImportFailed("no compatible memory type"));
            }

            let memory_type_index = candidates.trailing_zeros();
            let memory =
                self.driver
                    .import_memory(image.image, fd, reqs.size, memory_type_index)?;
            memories.push(MemoryGuard::new(self.driver.clone(), memory));
        }

        self.driver.bind_image_memory(image.image, memories[0].memory)?;
        debug!(
            "vulkan {} imported {} planes as {:?}",
            id,
            memories.len(),
            vk_format
        );

        let image = VulkanImage {
            driver: self.driver.clone(),
            memories: memories.into_iter().map(MemoryGuard::commit).collect(),
            image: image.commit(),
            format: vk_format,
            layout: vk::ImageLayout::UNDEFINED,
        };
        let link = self.registry.register(id, ());
        let buffer = VulkanBuffer {
            dmabuf: None,
            image,
        };
        Ok((BufferBackend::Vulkan(buffer), link))
    }

    fn live_buffers(&self) -> usize {
        self.registry.len()
    }
}
