// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module allocates the pixel buffers a Wayland client hands to the compositor. Buffers
//! come from one of three backends:
//!
//! - GBM buffer objects, exported as DMA-BUFs for zero-copy sharing.
//! - Vulkan device memory, exported as or imported from DMA-BUFs.
//! - Anonymous shared memory, mapped for CPU drawing (`wl_shm`).
//!
//! <https://docs.kernel.org/driver-api/dma-buf.html>

mod allocator;
mod buffer;
mod dmabuf;
mod formats;
mod gbm;
mod gbm_bindings;
mod rendernode;
mod shm;
#[cfg(test)]
mod test_utils;
mod vulkan;

pub use allocator::Allocator;
pub use allocator::AllocatorBuilder;
pub use allocator::AllocatorConfig;
pub use allocator::AllocatorDestroyListener;
pub use allocator::BackendKind;
pub use allocator::DEFAULT_MAX_DIMENSION;
pub use buffer::Buffer;
pub use buffer::BufferId;
pub use buffer::DataPtrAccess;
pub use buffer::DestroyListener;
pub use dmabuf::DmabufAttributes;
pub use dmabuf::DmabufPlane;
pub use dmabuf::OwnedDmabuf;
pub use dmabuf::OwnedPlane;
pub use dmabuf::DMABUF_MAX_PLANES;
pub use formats::*;
pub use gbm::GbmBoHandle;
pub use gbm::GbmDriver;
pub use gbm::DRM_PRIME_CAP_EXPORT;
pub use gbm::DRM_PRIME_CAP_IMPORT;
pub use gbm::GBM_BO_USE_LINEAR;
pub use gbm::GBM_BO_USE_RENDERING;
pub use gbm::GBM_BO_USE_SCANOUT;
pub use shm::ShmAttributes;
pub use vulkan::access_mask_for_layout;
pub use vulkan::find_memory_type;
pub use vulkan::image_barrier;
pub use vulkan::AshDriver;
pub use vulkan::ImageDesc;
pub use vulkan::ImageTiling;
pub use vulkan::VulkanDriver;
pub use vulkan::VulkanImage;

cfg_if::cfg_if! {
    if #[cfg(feature = "gbm")] {
        pub use gbm::LibGbmDriver;
        pub use rendernode::open_device as open_render_node;
    }
}
