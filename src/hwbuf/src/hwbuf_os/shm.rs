// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::convert::TryInto;
use std::ffi::CString;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use libc::off_t;
use log::warn;
use nix::fcntl::OFlag;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MFdFlags;
use nix::sys::mman::shm_open;
use nix::sys::mman::shm_unlink;
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::hwbuf_os::descriptor::AsRawDescriptor;
use crate::hwbuf_os::descriptor::IntoRawDescriptor;
use crate::hwbuf_os::FromRawDescriptor;
use crate::hwbuf_os::RawDescriptor;
use crate::hwbuf_os::SafeDescriptor;
use crate::hwbuf_utils::HwbufResult;

static SHM_NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// An anonymous, sized shared memory file.
pub struct SharedMemory {
    fd: OwnedFd,
    size: u64,
}

impl SharedMemory {
    /// Creates a new shared memory file descriptor of `size` bytes.
    ///
    /// `debug_name` appears in `/proc/self/fd/<shm fd>` for the purposes of debugging and does not
    /// need to be unique. A sealable memfd is preferred; when the kernel refuses one, a POSIX shm
    /// object with a randomized name is created and unlinked right away, so no name outlives this
    /// call either way.
    pub fn new<T: Into<Vec<u8>>>(debug_name: T, size: u64) -> HwbufResult<SharedMemory> {
        let debug_name = CString::new(debug_name)?;
        let fd = match memfd_create(
            debug_name.as_c_str(),
            MFdFlags::MFD_CLOEXEC | MFdFlags::MFD_ALLOW_SEALING,
        ) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("memfd_create failed ({}), falling back to shm_open", e);
                open_unlinked_shm()?
            }
        };

        let size_off_t: off_t = size.try_into()?;
        ftruncate(&fd, size_off_t)?;

        Ok(SharedMemory { fd, size })
    }

    /// Gets the size in bytes of the shared memory.
    ///
    /// The size returned here does not reflect changes by other interfaces or users of the shared
    /// memory file descriptor.
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn random_shm_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let seed = nanos
        ^ std::process::id().rotate_left(16)
        ^ SHM_NAME_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37_79b9);
    format!("/hwbuf-{:06x}", seed & 0x00ff_ffff)
}

fn open_unlinked_shm() -> HwbufResult<OwnedFd> {
    let mut retries = 100;
    loop {
        let name = random_shm_name();
        match shm_open(
            name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => {
                shm_unlink(name.as_str())?;
                return Ok(fd);
            }
            Err(nix::errno::Errno::EEXIST) if retries > 0 => retries -= 1,
            Err(e) => return Err(e.into()),
        }
    }
}

impl AsRawDescriptor for SharedMemory {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.fd.as_raw_descriptor()
    }
}

impl IntoRawDescriptor for SharedMemory {
    fn into_raw_descriptor(self) -> RawDescriptor {
        self.fd.into_raw_descriptor()
    }
}

impl From<SharedMemory> for SafeDescriptor {
    fn from(sm: SharedMemory) -> SafeDescriptor {
        // Safe because we own the SharedMemory at this point.
        unsafe { SafeDescriptor::from_raw_descriptor(sm.into_raw_descriptor()) }
    }
}
