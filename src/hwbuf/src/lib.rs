// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A crate for allocating hardware pixel buffers for a Wayland client: GBM buffer objects,
//! Vulkan device memory and CPU-mapped shared memory, with DMA-BUF export and import.

#[macro_use]
mod macros;
mod hwbuf_alloc;
mod hwbuf_os;
mod hwbuf_utils;

pub use crate::hwbuf_alloc::*;
pub use crate::hwbuf_os::AsRawDescriptor;
pub use crate::hwbuf_os::FromRawDescriptor as HwbufFromRawDescriptor;
pub use crate::hwbuf_os::IntoRawDescriptor as HwbufIntoRawDescriptor;
pub use crate::hwbuf_os::MappedRegion as HwbufMappedRegion;
pub use crate::hwbuf_os::RawDescriptor;
pub use crate::hwbuf_os::SafeDescriptor as HwbufDescriptor;
pub use crate::hwbuf_utils::*;
