// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! gbm: Buffer objects from the Generic Buffer Manager, exported as DMA-BUFs.
//!
//! All native calls go through `GbmDriver`; `LibGbmDriver` is the implementation over the
//! system libgbm, built with the `gbm` feature.

use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::hwbuf_alloc::allocator::BufferAllocator;
use crate::hwbuf_alloc::allocator::BufferRegistry;
use crate::hwbuf_alloc::allocator::RegistryLink;
use crate::hwbuf_alloc::buffer::BufferBackend;
use crate::hwbuf_alloc::buffer::BufferId;
use crate::hwbuf_alloc::dmabuf::DmabufAttributes;
use crate::hwbuf_alloc::dmabuf::OwnedDmabuf;
use crate::hwbuf_alloc::dmabuf::OwnedPlane;
use crate::hwbuf_alloc::dmabuf::DMABUF_MAX_PLANES;
use crate::hwbuf_alloc::formats::*;
use crate::hwbuf_os::SafeDescriptor;
use crate::hwbuf_utils::*;

/*
 * Usage flags are copied from gbm.h. Only the ones used for client buffers are kept.
 */
pub const GBM_BO_USE_SCANOUT: u32 = 1 << 0;
pub const GBM_BO_USE_RENDERING: u32 = 1 << 2;
pub const GBM_BO_USE_LINEAR: u32 = 1 << 4;

/// `DRM_CAP_PRIME` bits.
pub const DRM_PRIME_CAP_IMPORT: u64 = 0x1;
pub const DRM_PRIME_CAP_EXPORT: u64 = 0x2;

/// Opaque reference to a driver-side buffer object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GbmBoHandle(pub usize);

/// The native GBM entry points the allocator needs.
///
/// Handles passed in were returned by the same driver and have not been destroyed.
pub trait GbmDriver: Send + Sync {
    /// `DRM_CAP_PRIME` bits of the underlying DRM device.
    fn prime_capabilities(&self) -> HwbufResult<u64>;

    fn backend_name(&self) -> String;

    fn bo_create_with_modifiers(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[u64],
    ) -> HwbufResult<GbmBoHandle>;

    fn bo_create(&self, width: u32, height: u32, format: u32, usage: u32)
        -> HwbufResult<GbmBoHandle>;

    fn bo_modifier(&self, bo: GbmBoHandle) -> u64;

    fn bo_plane_count(&self, bo: GbmBoHandle) -> usize;

    fn bo_offset(&self, bo: GbmBoHandle, plane: usize) -> u32;

    fn bo_stride_for_plane(&self, bo: GbmBoHandle, plane: usize) -> u32;

    /// Exports one plane as a new DMA-BUF fd. Fails with `ExportFailed`.
    fn bo_fd_for_plane(&self, bo: GbmBoHandle, plane: usize) -> HwbufResult<SafeDescriptor>;

    fn bo_destroy(&self, bo: GbmBoHandle);

    /// Destroys the device. Must be idempotent; no buffer object may be used afterwards.
    fn device_destroy(&self);
}

fn check_prime_export(caps: u64) -> HwbufResult<()> {
    if caps & DRM_PRIME_CAP_EXPORT == 0 {
        error!("DRM device lacks PRIME export (caps {:#x})", caps);
        return Err(HwbufError::AllocationFailed {
            reason: "DRM device cannot export PRIME buffers",
            code: 0,
        });
    }

    Ok(())
}

/// Destroys the buffer object when dropped.
struct BoGuard {
    driver: Arc<dyn GbmDriver>,
    handle: GbmBoHandle,
}

impl Drop for BoGuard {
    fn drop(&mut self) {
        self.driver.bo_destroy(self.handle);
    }
}

/// A live buffer object and its exported planes.
struct GbmBo {
    // Plane fds are closed before the buffer object is destroyed.
    dmabuf: OwnedDmabuf,
    _bo: BoGuard,
}

type GbmSlot = Arc<Mutex<Option<GbmBo>>>;

/// GBM backing of one buffer. The allocator empties the slot when it is destroyed first.
pub(crate) struct GbmBuffer {
    slot: GbmSlot,
}

impl GbmBuffer {
    pub fn dmabuf(&self) -> Option<DmabufAttributes> {
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .map(|bo| bo.dmabuf.attributes())
    }
}

impl Drop for GbmBuffer {
    fn drop(&mut self) {
        let bo = self.slot.lock().unwrap().take();
        drop(bo);
    }
}

pub(crate) struct GbmAllocator {
    driver: Arc<dyn GbmDriver>,
    registry: BufferRegistry<GbmSlot>,
}

impl GbmAllocator {
    /// Checks the device can export PRIME buffers before anything is allocated.
    pub fn new(driver: Arc<dyn GbmDriver>) -> HwbufResult<GbmAllocator> {
        check_prime_export(driver.prime_capabilities()?)?;
        info!("using gbm backend {}", driver.backend_name());

        Ok(GbmAllocator {
            driver,
            registry: BufferRegistry::new(),
        })
    }

    /// Returns the buffer object and the modifier to advertise for it.
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
    ) -> HwbufResult<(BoGuard, u64)> {
        if modifier != DRM_FORMAT_MOD_INVALID && modifier != DRM_FORMAT_MOD_LINEAR {
            match self
                .driver
                .bo_create_with_modifiers(width, height, format.0, &[modifier])
            {
                Ok(handle) => {
                    let bo = BoGuard {
                        driver: self.driver.clone(),
                        handle,
                    };
                    let actual = self.driver.bo_modifier(handle);
                    return Ok((bo, actual));
                }
                Err(e) => warn!(
                    "{:?} with modifier {:#x} failed ({}), retrying without",
                    format, modifier, e
                ),
            }
        }

        let linear = modifier == DRM_FORMAT_MOD_LINEAR;
        let mut usage = GBM_BO_USE_SCANOUT | GBM_BO_USE_RENDERING;
        if linear {
            usage |= GBM_BO_USE_LINEAR;
        }

        let handle = self
            .driver
            .bo_create(width, height, format.0, usage)
            .map_err(|e| {
                error!("gbm_bo_create {}x{} {:?} failed: {}", width, height, format, e);
                e
            })?;

        let recorded = if linear {
            DRM_FORMAT_MOD_LINEAR
        } else {
            DRM_FORMAT_MOD_INVALID
        };

        let bo = BoGuard {
            driver: self.driver.clone(),
            handle,
        };
        Ok((bo, recorded))
    }

    /// Exports every plane. On failure the planes already exported are closed when `planes`
    /// goes out of scope, and the caller's `BoGuard` destroys the buffer object after that.
    fn export(
        &self,
        bo: &BoGuard,
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
    ) -> HwbufResult<OwnedDmabuf> {
        let plane_count = self.driver.bo_plane_count(bo.handle);
        if plane_count == 0 {
            return Err(HwbufError::InvalidNumberOfPlanes(0));
        }
        if plane_count > DMABUF_MAX_PLANES {
            warn!(
                "{:?} reports {} planes, exporting {}",
                format, plane_count, DMABUF_MAX_PLANES
            );
        }

        let mut planes = Vec::with_capacity(DMABUF_MAX_PLANES);
        for plane in 0..plane_count.min(DMABUF_MAX_PLANES) {
            let fd = self
                .driver
                .bo_fd_for_plane(bo.handle, plane)
                .map_err(|e| {
                    error!("export of plane {} failed: {}", plane, e);
                    e
                })?;

            planes.push(OwnedPlane {
                fd,
                offset: self.driver.bo_offset(bo.handle, plane),
                stride: self.driver.bo_stride_for_plane(bo.handle, plane),
            });
        }

        OwnedDmabuf::new(width, height, format, modifier, planes)
    }
}

impl BufferAllocator for GbmAllocator {
    fn allocate(
        &self,
        id: BufferId,
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
    ) -> HwbufResult<(BufferBackend, RegistryLink)> {
        format.planar_layout()?;

        let (bo, recorded_modifier) = self.create_bo(width, height, format, modifier)?;
        let dmabuf = self.export(&bo, width, height, format, recorded_modifier)?;
        debug!(
            "gbm {} exported {} planes, modifier {:#x}",
            id,
            dmabuf.num_planes(),
            recorded_modifier
        );

        let slot = Arc::new(Mutex::new(Some(GbmBo { dmabuf, _bo: bo })));
        let link = self.registry.register(id, slot.clone());
        Ok((BufferBackend::Gbm(GbmBuffer { slot }), link))
    }

    fn live_buffers(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for GbmAllocator {
    fn drop(&mut self) {
        // Buffer objects must go before the device they were allocated from.
        for slot in self.registry.drain() {
            let bo = slot.lock().unwrap().take();
            drop(bo);
        }

        self.driver.device_destroy();
    }
}

#[cfg(feature = "gbm")]
pub use self::libgbm::LibGbmDriver;

#[cfg(feature = "gbm")]
mod libgbm {
    use std::ffi::CStr;
    use std::fs::File;
    use std::io::Error;
    use std::os::raw::c_int;
    use std::os::raw::c_uint;
    use std::os::unix::io::AsRawFd;
    use std::ptr::null_mut;
    use std::sync::atomic::AtomicPtr;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::hwbuf_alloc::gbm_bindings::*;
    use crate::hwbuf_alloc::rendernode;
    use crate::hwbuf_os::FromRawDescriptor;

    fn last_errno() -> i32 {
        Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    /// `GbmDriver` over the system libgbm.
    pub struct LibGbmDriver {
        drm_fd: File,
        gbm: AtomicPtr<gbm_device>,
    }

    impl LibGbmDriver {
        /// Creates a GBM device over `drm_fd`, which must support PRIME export.
        pub fn new(drm_fd: File) -> HwbufResult<LibGbmDriver> {
            check_prime_export(rendernode::prime_capabilities(&drm_fd)?)?;

            // gbm_create_device is safe to call with a valid fd, and we check that a valid one is
            // returned.  If the fd does not refer to a DRM device, gbm_create_device will reject
            // it.
            let gbm = unsafe { gbm_create_device(drm_fd.as_raw_fd()) };
            if gbm.is_null() {
                return Err(HwbufError::AllocationFailed {
                    reason: "gbm_create_device",
                    code: last_errno(),
                });
            }

            Ok(LibGbmDriver {
                drm_fd,
                gbm: AtomicPtr::new(gbm),
            })
        }

        fn bo(handle: GbmBoHandle) -> *mut gbm_bo {
            handle.0 as *mut gbm_bo
        }
    }

    impl GbmDriver for LibGbmDriver {
        fn prime_capabilities(&self) -> HwbufResult<u64> {
            rendernode::prime_capabilities(&self.drm_fd)
        }

        fn backend_name(&self) -> String {
            let gbm = self.gbm.load(Ordering::Acquire);
            if gbm.is_null() {
                return String::from("(destroyed)");
            }

            // Safe because a valid gbm device has a statically allocated string associated with
            // it, which is valid for the lifetime of the process.
            let c_str: &CStr = unsafe { CStr::from_ptr(gbm_device_get_backend_name(gbm)) };
            c_str.to_string_lossy().into_owned()
        }

        fn bo_create_with_modifiers(
            &self,
            width: u32,
            height: u32,
            format: u32,
            modifiers: &[u64],
        ) -> HwbufResult<GbmBoHandle> {
            // Safe because the device is valid and modifiers outlives the call.
            let bo = unsafe {
                gbm_bo_create_with_modifiers(
                    self.gbm.load(Ordering::Acquire),
                    width,
                    height,
                    format,
                    modifiers.as_ptr(),
                    modifiers.len() as c_uint,
                )
            };
            if bo.is_null() {
                return Err(HwbufError::AllocationFailed {
                    reason: "gbm_bo_create_with_modifiers",
                    code: last_errno(),
                });
            }

            Ok(GbmBoHandle(bo as usize))
        }

        fn bo_create(
            &self,
            width: u32,
            height: u32,
            format: u32,
            usage: u32,
        ) -> HwbufResult<GbmBoHandle> {
            // Safe because the device is valid and we check the result.
            let bo = unsafe {
                gbm_bo_create(self.gbm.load(Ordering::Acquire), width, height, format, usage)
            };
            if bo.is_null() {
                return Err(HwbufError::AllocationFailed {
                    reason: "gbm_bo_create",
                    code: last_errno(),
                });
            }

            Ok(GbmBoHandle(bo as usize))
        }

        fn bo_modifier(&self, bo: GbmBoHandle) -> u64 {
            // This is always safe to call with a valid gbm_bo pointer.
            unsafe { gbm_bo_get_modifier(Self::bo(bo)) }
        }

        fn bo_plane_count(&self, bo: GbmBoHandle) -> usize {
            // This is always safe to call with a valid gbm_bo pointer.
            let count = unsafe { gbm_bo_get_plane_count(Self::bo(bo)) };
            count.max(0) as usize
        }

        fn bo_offset(&self, bo: GbmBoHandle, plane: usize) -> u32 {
            // This is always safe to call with a valid gbm_bo pointer.
            unsafe { gbm_bo_get_offset(Self::bo(bo), plane as c_int) }
        }

        fn bo_stride_for_plane(&self, bo: GbmBoHandle, plane: usize) -> u32 {
            // This is always safe to call with a valid gbm_bo pointer.
            unsafe { gbm_bo_get_stride_for_plane(Self::bo(bo), plane as c_int) }
        }

        fn bo_fd_for_plane(&self, bo: GbmBoHandle, plane: usize) -> HwbufResult<SafeDescriptor> {
            // This is always safe to call with a valid gbm_bo pointer.
            match unsafe { gbm_bo_get_fd_for_plane(Self::bo(bo), plane as c_int) } {
                fd if fd >= 0 => Ok(unsafe { SafeDescriptor::from_raw_descriptor(fd) }),
                _ => Err(HwbufError::ExportFailed {
                    plane,
                    code: last_errno(),
                }),
            }
        }

        fn bo_destroy(&self, bo: GbmBoHandle) {
            // This is always safe to call with a valid gbm_bo pointer.
            unsafe { gbm_bo_destroy(Self::bo(bo)) }
        }

        fn device_destroy(&self) {
            let gbm = self.gbm.swap(null_mut(), Ordering::AcqRel);
            if !gbm.is_null() {
                // Safe because the pointer came from gbm_create_device and is only destroyed
                // once.
                unsafe { gbm_device_destroy(gbm) }
            }
        }
    }

    impl Drop for LibGbmDriver {
        fn drop(&mut self) {
            self.device_destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwbuf_alloc::allocator::AllocatorBuilder;
    use crate::hwbuf_alloc::allocator::BackendKind;
    use crate::hwbuf_alloc::test_utils::*;

    fn xrgb() -> DrmFormat {
        DrmFormat::from_bytes(DRM_FORMAT_XRGB8888)
    }

    #[test]
    fn implicit_allocation() {
        init_logging();
        let driver = Arc::new(MockGbmDriver::new());
        let allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();
        assert_eq!(allocator.kind(), BackendKind::Gbm);

        let buffer = allocator.create_buffer(640, 480).unwrap();
        assert_eq!(buffer.kind(), BackendKind::Gbm);
        assert_eq!(buffer.width(), 640);
        assert_eq!(buffer.height(), 480);
        assert!(buffer.shm().is_none());
        assert_eq!(buffer.opaque_region(), Some(Rect::new(0, 0, 640, 480)));

        let attrs = buffer.dmabuf().unwrap();
        assert_eq!(attrs.format, xrgb());
        assert_eq!(attrs.modifier, DRM_FORMAT_MOD_INVALID);
        assert_eq!(attrs.n_planes, 1);
        assert_eq!(attrs.planes[0].stride, 640 * 4);

        assert_eq!(
            driver.calls()[0],
            GbmCall::Create(GBM_BO_USE_SCANOUT | GBM_BO_USE_RENDERING)
        );
    }

    #[test]
    fn explicit_modifier_used() {
        let mut mock = MockGbmDriver::new();
        mock.accept_modifiers = true;
        let driver = Arc::new(mock);
        let allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        let modifier = 0x0100_0000_0000_0002;
        let buffer = allocator
            .create_buffer_with_format(256, 256, xrgb(), modifier)
            .unwrap();
        assert_eq!(buffer.dmabuf().unwrap().modifier, modifier);
        assert_eq!(driver.calls()[0], GbmCall::CreateWithModifiers(modifier));
        assert!(!driver
            .calls()
            .iter()
            .any(|call| matches!(call, GbmCall::Create(_))));
    }

    #[test]
    fn explicit_modifier_falls_back() {
        let driver = Arc::new(MockGbmDriver::new());
        let allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        let modifier = 0x0100_0000_0000_0002;
        let buffer = allocator
            .create_buffer_with_format(256, 256, xrgb(), modifier)
            .unwrap();
        assert_eq!(buffer.dmabuf().unwrap().modifier, DRM_FORMAT_MOD_INVALID);
        assert_eq!(
            driver.calls()[..2],
            [
                GbmCall::CreateWithModifiers(modifier),
                GbmCall::Create(GBM_BO_USE_SCANOUT | GBM_BO_USE_RENDERING)
            ]
        );
        assert_eq!(driver.live_bos(), 1);
    }

    #[test]
    fn linear_requested() {
        let driver = Arc::new(MockGbmDriver::new());
        let allocator = AllocatorBuilder::new()
            .set_default_modifier(DRM_FORMAT_MOD_LINEAR)
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        let buffer = allocator.create_buffer(64, 64).unwrap();
        assert_eq!(buffer.dmabuf().unwrap().modifier, DRM_FORMAT_MOD_LINEAR);
        assert_eq!(
            driver.calls()[0],
            GbmCall::Create(GBM_BO_USE_SCANOUT | GBM_BO_USE_RENDERING | GBM_BO_USE_LINEAR)
        );
    }

    #[test]
    fn total_failure_surfaces_errno() {
        let mut mock = MockGbmDriver::new();
        mock.fail_create = true;
        let driver = Arc::new(mock);
        let allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        assert!(matches!(
            allocator.create_buffer(64, 64),
            Err(HwbufError::AllocationFailed { code, .. }) if code == libc::ENOMEM
        ));
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn unsupported_format_allocates_nothing() {
        let driver = Arc::new(MockGbmDriver::new());
        let allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        let bogus = DrmFormat::new(b'Q', b'Q', b'Q', b'Q');
        assert!(matches!(
            allocator.create_buffer_with_format(64, 64, bogus, DRM_FORMAT_MOD_INVALID),
            Err(HwbufError::UnsupportedFormat(_))
        ));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn export_rollback_closes_earlier_planes() {
        init_logging();
        let mut mock = MockGbmDriver::new();
        mock.fail_plane = Some(1);
        let driver = Arc::new(mock);
        let allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        let result = allocator.create_buffer_with_format(
            64,
            64,
            DrmFormat::from_bytes(DRM_FORMAT_NV12),
            DRM_FORMAT_MOD_INVALID,
        );
        assert!(matches!(
            result,
            Err(HwbufError::ExportFailed { plane: 1, .. })
        ));

        let exported = driver.exported_fds();
        assert_eq!(exported.len(), 1);
        for (fd, identity) in exported {
            assert!(!is_same_file(fd, identity));
        }
        assert_eq!(driver.bos_created(), 1);
        assert_eq!(driver.live_bos(), 0);
        assert_eq!(allocator.live_buffers(), 0);

        // The plane fds were closed before the buffer object went away.
        let calls = driver.calls();
        assert_eq!(calls.last(), Some(&GbmCall::BoDestroy(GbmBoHandle(1))));
    }

    #[test]
    fn destroy_releases_everything_once() {
        let driver = Arc::new(MockGbmDriver::new());
        let allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        let buffer = allocator
            .create_buffer_with_format(
                128,
                32,
                DrmFormat::from_bytes(DRM_FORMAT_YVU420),
                DRM_FORMAT_MOD_INVALID,
            )
            .unwrap();
        let attrs = buffer.dmabuf().unwrap();
        assert_eq!(attrs.n_planes, 3);
        assert_eq!(attrs.planes()[1].offset, 128 * 32);
        assert_eq!(allocator.live_buffers(), 1);

        buffer.destroy();
        for (fd, identity) in driver.exported_fds() {
            assert!(!is_same_file(fd, identity));
        }
        assert_eq!(driver.live_bos(), 0);
        assert_eq!(driver.destroy_count(GbmBoHandle(1)), 1);
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn bos_destroyed_before_device() {
        let driver = Arc::new(MockGbmDriver::new());
        let mut allocator = AllocatorBuilder::new()
            .build_gbm_with_driver(driver.clone())
            .unwrap();

        let notified = Arc::new(Mutex::new(Vec::new()));
        let observer = notified.clone();
        let observed_driver = driver.clone();
        allocator.add_destroy_listener(move |kind| {
            // Nothing is released yet when listeners run.
            assert_eq!(observed_driver.live_bos(), 3);
            observer.lock().unwrap().push(kind);
        });

        let buffers: Vec<_> = (0..3)
            .map(|_| allocator.create_buffer(32, 32).unwrap())
            .collect();
        allocator.destroy();
        assert_eq!(*notified.lock().unwrap(), vec![BackendKind::Gbm]);

        let calls = driver.calls();
        let device = calls
            .iter()
            .position(|call| *call == GbmCall::DeviceDestroy)
            .unwrap();
        let destroys: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, call)| matches!(call, GbmCall::BoDestroy(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(destroys.len(), 3);
        assert!(destroys.iter().all(|i| *i < device));

        // Buffers that outlived the allocator lost their native memory.
        for buffer in &buffers {
            assert!(buffer.dmabuf().is_none());
        }
        drop(buffers);
        assert_eq!(driver.calls().len(), calls.len());
    }

    #[test]
    fn missing_prime_export_rejected() {
        let mut mock = MockGbmDriver::new();
        mock.prime_caps = DRM_PRIME_CAP_IMPORT;
        let driver = Arc::new(mock);
        assert!(matches!(
            AllocatorBuilder::new().build_gbm_with_driver(driver.clone()),
            Err(HwbufError::AllocationFailed { .. })
        ));
        assert_eq!(driver.bos_created(), 0);
        assert!(driver.calls().is_empty());
    }
}
