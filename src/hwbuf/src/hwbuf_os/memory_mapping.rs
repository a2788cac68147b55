// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use libc::c_void;
use log::error;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::hwbuf_os::descriptor::SafeDescriptor;
use crate::hwbuf_os::MappedRegion;
use crate::hwbuf_utils::HwbufError;
use crate::hwbuf_utils::HwbufResult;
use crate::hwbuf_utils::HWBUF_MAP_ACCESS_MASK;
use crate::hwbuf_utils::HWBUF_MAP_ACCESS_READ;
use crate::hwbuf_utils::HWBUF_MAP_ACCESS_RW;
use crate::hwbuf_utils::HWBUF_MAP_ACCESS_WRITE;

/// Wraps a shared memory mapping in the current process. Provides RAII semantics including munmap
/// when no longer needed.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: NonNull<c_void>,
    size: usize,
}

// Safe because the mapping is process-wide and only unmapped on drop.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // This is safe because we mmap the area at addr ourselves, and nobody
        // else is holding a reference to it.
        if let Err(e) = unsafe { munmap(self.addr, self.size) } {
            error!("munmap of {} bytes failed: {}", self.size, e);
        }
    }
}

impl MemoryMapping {
    /// Maps `size` bytes of `descriptor` from offset zero. The descriptor may be closed afterwards;
    /// the mapping keeps the underlying object alive.
    pub fn from_safe_descriptor(
        descriptor: &SafeDescriptor,
        size: usize,
        map_info: u32,
    ) -> HwbufResult<MemoryMapping> {
        let prot = match map_info & HWBUF_MAP_ACCESS_MASK {
            HWBUF_MAP_ACCESS_READ => ProtFlags::PROT_READ,
            HWBUF_MAP_ACCESS_WRITE => ProtFlags::PROT_WRITE,
            HWBUF_MAP_ACCESS_RW => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            _ => return Err(HwbufError::SpecViolation("incorrect access flags")),
        };

        let non_zero_size =
            NonZeroUsize::new(size).ok_or(HwbufError::SpecViolation("zero size mapping"))?;

        // Safe because we let the kernel choose the address and check the result.
        let addr = unsafe {
            mmap(
                None,
                non_zero_size,
                prot,
                MapFlags::MAP_SHARED,
                descriptor,
                0,
            )?
        };

        Ok(MemoryMapping { addr, size })
    }
}

unsafe impl MappedRegion for MemoryMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr() as *mut u8
    }

    fn size(&self) -> usize {
        self.size
    }
}
