// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fakes of the native drivers and fd helpers shared by the unit tests.

#![cfg(test)]

use std::collections::BTreeMap as Map;
use std::mem::MaybeUninit;
use std::sync::Mutex;

use ash::vk;
use ash::vk::Handle;

use crate::hwbuf_alloc::formats::*;
use crate::hwbuf_alloc::gbm::*;
use crate::hwbuf_alloc::vulkan::ImageDesc;
use crate::hwbuf_alloc::vulkan::ImageTiling;
use crate::hwbuf_alloc::vulkan::VulkanDriver;
use crate::hwbuf_os::AsRawDescriptor;
use crate::hwbuf_os::RawDescriptor;
use crate::hwbuf_os::SafeDescriptor;
use crate::hwbuf_os::SharedMemory;
use crate::hwbuf_utils::*;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Identifies the open file behind an fd, so a closed and reused fd number can be told apart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FdIdentity {
    dev: u64,
    ino: u64,
}

pub fn fd_identity(fd: RawDescriptor) -> Option<FdIdentity> {
    let mut stat = MaybeUninit::<libc::stat>::zeroed();
    // Safe because fstat only writes into `stat` and fails cleanly on a closed fd.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return None;
    }

    // Safe because fstat succeeded.
    let stat = unsafe { stat.assume_init() };
    Some(FdIdentity {
        dev: stat.st_dev as u64,
        ino: stat.st_ino as u64,
    })
}

/// True while `fd` is still open on the file it referred to when `identity` was taken.
pub fn is_same_file(fd: RawDescriptor, identity: FdIdentity) -> bool {
    fd_identity(fd) == Some(identity)
}

fn memfd(name: &str, size: u64) -> (SafeDescriptor, (RawDescriptor, FdIdentity)) {
    let shm = SharedMemory::new(name, size.max(1)).unwrap();
    let fd = SafeDescriptor::from(shm);
    let raw = fd.as_raw_descriptor();
    let identity = fd_identity(raw).unwrap();
    (fd, (raw, identity))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GbmCall {
    CreateWithModifiers(u64),
    Create(u32),
    FdForPlane(usize),
    BoDestroy(GbmBoHandle),
    DeviceDestroy,
}

struct MockBo {
    modifier: u64,
    reqs: ImageMemoryRequirements,
}

#[derive(Default)]
struct MockGbmState {
    next_handle: usize,
    calls: Vec<GbmCall>,
    bos: Map<GbmBoHandle, MockBo>,
    bos_created: usize,
    destroys: Map<GbmBoHandle, usize>,
    exported: Vec<(RawDescriptor, FdIdentity)>,
}

/// A GBM device laying planes out canonically, with plane fds backed by memfds.
pub struct MockGbmDriver {
    pub prime_caps: u64,
    pub accept_modifiers: bool,
    pub fail_create: bool,
    pub fail_plane: Option<usize>,
    state: Mutex<MockGbmState>,
}

impl MockGbmDriver {
    pub fn new() -> MockGbmDriver {
        MockGbmDriver {
            prime_caps: DRM_PRIME_CAP_IMPORT | DRM_PRIME_CAP_EXPORT,
            accept_modifiers: false,
            fail_create: false,
            fail_plane: None,
            state: Mutex::new(MockGbmState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    pub fn calls(&self) -> Vec<GbmCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn live_bos(&self) -> usize {
        self.state.lock().unwrap().bos.len()
    }

    pub fn bos_created(&self) -> usize {
        self.state.lock().unwrap().bos_created
    }

    pub fn exported_fds(&self) -> Vec<(RawDescriptor, FdIdentity)> {
        self.state.lock().unwrap().exported.clone()
    }

    pub fn destroy_count(&self, handle: GbmBoHandle) -> usize {
        self.state
            .lock()
            .unwrap()
            .destroys
            .get(&handle)
            .copied()
            .unwrap_or(0)
    }

    fn new_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifier: u64,
    ) -> HwbufResult<GbmBoHandle> {
        let reqs = canonical_image_requirements(width, height, DrmFormat(format))?;
        let mut state = self.state.lock().unwrap();
        let handle = GbmBoHandle(state.next_handle);
        state.next_handle += 1;
        state.bos_created += 1;
        state.bos.insert(handle, MockBo { modifier, reqs });
        Ok(handle)
    }

    fn bo_reqs(&self, bo: GbmBoHandle) -> ImageMemoryRequirements {
        self.state.lock().unwrap().bos[&bo].reqs
    }
}

impl GbmDriver for MockGbmDriver {
    fn prime_capabilities(&self) -> HwbufResult<u64> {
        Ok(self.prime_caps)
    }

    fn backend_name(&self) -> String {
        String::from("mock")
    }

    fn bo_create_with_modifiers(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[u64],
    ) -> HwbufResult<GbmBoHandle> {
        let modifier = modifiers[0];
        self.state
            .lock()
            .unwrap()
            .calls
            .push(GbmCall::CreateWithModifiers(modifier));
        if self.fail_create || !self.accept_modifiers {
            return Err(HwbufError::AllocationFailed {
                reason: "gbm_bo_create_with_modifiers",
                code: libc::ENOSYS,
            });
        }

        self.new_bo(width, height, format, modifier)
    }

    fn bo_create(
        &self,
        width: u32,
        height: u32,
        format: u32,
        usage: u32,
    ) -> HwbufResult<GbmBoHandle> {
        self.state.lock().unwrap().calls.push(GbmCall::Create(usage));
        if self.fail_create {
            return Err(HwbufError::AllocationFailed {
                reason: "gbm_bo_create",
                code: libc::ENOMEM,
            });
        }

        let modifier = if usage & GBM_BO_USE_LINEAR != 0 {
            DRM_FORMAT_MOD_LINEAR
        } else {
            DRM_FORMAT_MOD_INVALID
        };
        self.new_bo(width, height, format, modifier)
    }

    fn bo_modifier(&self, bo: GbmBoHandle) -> u64 {
        self.state.lock().unwrap().bos[&bo].modifier
    }

    fn bo_plane_count(&self, bo: GbmBoHandle) -> usize {
        self.bo_reqs(bo).num_planes
    }

    fn bo_offset(&self, bo: GbmBoHandle, plane: usize) -> u32 {
        self.bo_reqs(bo).offsets[plane]
    }

    fn bo_stride_for_plane(&self, bo: GbmBoHandle, plane: usize) -> u32 {
        self.bo_reqs(bo).strides[plane]
    }

    fn bo_fd_for_plane(&self, bo: GbmBoHandle, plane: usize) -> HwbufResult<SafeDescriptor> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(GbmCall::FdForPlane(plane));
        if self.fail_plane == Some(plane) {
            return Err(HwbufError::ExportFailed {
                plane,
                code: libc::EIO,
            });
        }

        let (fd, exported) = memfd("mock-gbm-plane", self.bo_reqs(bo).size);
        self.state.lock().unwrap().exported.push(exported);
        Ok(fd)
    }

    fn bo_destroy(&self, bo: GbmBoHandle) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GbmCall::BoDestroy(bo));
        state.bos.remove(&bo);
        *state.destroys.entry(bo).or_insert(0) += 1;
    }

    fn device_destroy(&self) {
        self.state.lock().unwrap().calls.push(GbmCall::DeviceDestroy);
    }
}

/// A barrier as recorded by `MockVulkanDriver::cmd_image_barrier`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordedBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

#[derive(Default)]
struct MockVulkanState {
    next_handle: u64,
    images: Map<u64, ImageDesc>,
    created_images: Vec<ImageDesc>,
    // Imported memory keeps its fd until freed, the way a driver does.
    memories: Map<u64, Option<SafeDescriptor>>,
    bindings: Vec<(vk::Image, vk::DeviceMemory)>,
    imports: usize,
    image_destroys: usize,
    memory_frees: usize,
    exported: Vec<(RawDescriptor, FdIdentity)>,
    imported: Vec<(RawDescriptor, FdIdentity)>,
    barriers: Vec<RecordedBarrier>,
}

/// A Vulkan device with configurable memory types and failure points.
pub struct MockVulkanDriver {
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    pub image_type_bits: u32,
    pub fd_type_bits: u32,
    pub row_pitch_alignment: u64,
    pub fail_bind: bool,
    pub fail_get_fd: bool,
    pub fail_import: Option<usize>,
    state: Mutex<MockVulkanState>,
}

impl MockVulkanDriver {
    /// Type 0 is host visible, type 1 device local.
    pub fn new() -> MockVulkanDriver {
        MockVulkanDriver {
            memory_types: vec![
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ],
            image_type_bits: 0b11,
            fd_type_bits: 0b11,
            row_pitch_alignment: 256,
            fail_bind: false,
            fail_get_fd: false,
            fail_import: None,
            state: Mutex::new(MockVulkanState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn live_memories(&self) -> usize {
        self.state.lock().unwrap().memories.len()
    }

    pub fn image_destroys(&self) -> usize {
        self.state.lock().unwrap().image_destroys
    }

    pub fn memory_frees(&self) -> usize {
        self.state.lock().unwrap().memory_frees
    }

    pub fn created_images(&self) -> Vec<ImageDesc> {
        self.state.lock().unwrap().created_images.clone()
    }

    pub fn bindings(&self) -> Vec<(vk::Image, vk::DeviceMemory)> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn exported_fds(&self) -> Vec<(RawDescriptor, FdIdentity)> {
        self.state.lock().unwrap().exported.clone()
    }

    pub fn imported_fds(&self) -> Vec<(RawDescriptor, FdIdentity)> {
        self.state.lock().unwrap().imported.clone()
    }

    pub fn barriers(&self) -> Vec<RecordedBarrier> {
        self.state.lock().unwrap().barriers.clone()
    }

    fn next_handle(state: &mut MockVulkanState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    fn aligned_pitch(&self, width: u32) -> u64 {
        let pitch = width as u64 * 4;
        let align = self.row_pitch_alignment.max(1);
        (pitch + align - 1) / align * align
    }
}

impl VulkanDriver for MockVulkanDriver {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        for (i, flags) in self.memory_types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props.memory_type_count = self.memory_types.len() as u32;
        props
    }

    fn create_image(&self, desc: &ImageDesc) -> HwbufResult<vk::Image> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::next_handle(&mut state);
        state.images.insert(handle, desc.clone());
        state.created_images.push(desc.clone());
        Ok(vk::Image::from_raw(handle))
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock().unwrap();
        let desc = &state.images[&image.as_raw()];
        vk::MemoryRequirements {
            size: self.aligned_pitch(desc.width) * desc.height as u64 * 2,
            alignment: 4096,
            memory_type_bits: self.image_type_bits,
        }
    }

    fn image_subresource_layout(
        &self,
        image: vk::Image,
        _aspect: vk::ImageAspectFlags,
    ) -> vk::SubresourceLayout {
        let state = self.state.lock().unwrap();
        let desc = &state.images[&image.as_raw()];
        let row_pitch = self.aligned_pitch(desc.width);
        vk::SubresourceLayout {
            offset: 0,
            size: row_pitch * desc.height as u64,
            row_pitch,
            ..Default::default()
        }
    }

    fn image_drm_format_modifier(&self, image: vk::Image) -> HwbufResult<u64> {
        let state = self.state.lock().unwrap();
        match &state.images[&image.as_raw()].tiling {
            ImageTiling::Modifiers(modifiers) => Ok(modifiers[0]),
            ImageTiling::Explicit { modifier, .. } => Ok(*modifier),
            _ => Err(HwbufError::VkError(vk::Result::ERROR_UNKNOWN)),
        }
    }

    fn allocate_exportable_memory(
        &self,
        _image: vk::Image,
        _size: u64,
        _memory_type_index: u32,
    ) -> HwbufResult<vk::DeviceMemory> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::next_handle(&mut state);
        state.memories.insert(handle, None);
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn memory_fd_type_bits(&self, _fd: &SafeDescriptor) -> HwbufResult<u32> {
        Ok(self.fd_type_bits)
    }

    fn import_memory(
        &self,
        _image: vk::Image,
        fd: SafeDescriptor,
        _size: u64,
        _memory_type_index: u32,
    ) -> HwbufResult<vk::DeviceMemory> {
        let mut state = self.state.lock().unwrap();
        let import = state.imports;
        state.imports += 1;

        let raw = fd.as_raw_descriptor();
        if let Some(identity) = fd_identity(raw) {
            state.imported.push((raw, identity));
        }
        if self.fail_import == Some(import) {
            return Err(HwbufError::VkError(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE));
        }

        let handle = Self::next_handle(&mut state);
        state.memories.insert(handle, Some(fd));
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> HwbufResult<()> {
        if self.fail_bind {
            return Err(HwbufError::VkError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }

        self.state.lock().unwrap().bindings.push((image, memory));
        Ok(())
    }

    fn get_memory_fd(&self, memory: vk::DeviceMemory) -> HwbufResult<SafeDescriptor> {
        if self.fail_get_fd {
            return Err(HwbufError::VkError(vk::Result::ERROR_TOO_MANY_OBJECTS));
        }

        assert!(self
            .state
            .lock()
            .unwrap()
            .memories
            .contains_key(&memory.as_raw()));
        let (fd, exported) = memfd("mock-vk-memory", 4096);
        self.state.lock().unwrap().exported.push(exported);
        Ok(fd)
    }

    fn cmd_image_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        self.state.lock().unwrap().barriers.push(RecordedBarrier {
            image: barrier.image,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
            src_access: barrier.src_access_mask,
            dst_access: barrier.dst_access_mask,
            src_stage,
            dst_stage,
        });
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock().unwrap();
        assert!(state.images.remove(&image.as_raw()).is_some());
        state.image_destroys += 1;
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock().unwrap();
        assert!(state.memories.remove(&memory.as_raw()).is_some());
        state.memory_frees += 1;
    }
}
