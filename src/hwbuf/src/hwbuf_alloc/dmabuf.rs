// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! dmabuf: DMA-BUF attribute descriptions handed across domains.

use crate::hwbuf_alloc::formats::DrmFormat;
use crate::hwbuf_os::clone_descriptor;
use crate::hwbuf_os::AsRawDescriptor;
use crate::hwbuf_os::RawDescriptor;
use crate::hwbuf_os::SafeDescriptor;
use crate::hwbuf_utils::*;

/// Maximum number of planes a DMA-BUF may carry.
pub const DMABUF_MAX_PLANES: usize = 4;

/// One plane of a DMA-BUF.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DmabufPlane {
    pub fd: RawDescriptor,
    pub offset: u32,
    pub stride: u32,
}

/// A borrowed view of a DMA-BUF. The fds stay owned by whoever produced the view and are only
/// valid while that owner is alive. Use `dup_fds` to take copies that outlive it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmabufAttributes {
    pub width: u32,
    pub height: u32,
    pub format: DrmFormat,
    pub modifier: u64,
    pub n_planes: usize,
    pub planes: [DmabufPlane; DMABUF_MAX_PLANES],
}

impl DmabufAttributes {
    /// Builds a view from raw plane descriptions; rejects plane counts outside 1..=4.
    pub fn new(
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
        planes: &[DmabufPlane],
    ) -> HwbufResult<DmabufAttributes> {
        if planes.is_empty() || planes.len() > DMABUF_MAX_PLANES {
            return Err(HwbufError::InvalidNumberOfPlanes(planes.len()));
        }

        let mut attrs = DmabufAttributes {
            width,
            height,
            format,
            modifier,
            n_planes: planes.len(),
            planes: [DmabufPlane::default(); DMABUF_MAX_PLANES],
        };
        attrs.planes[..planes.len()].copy_from_slice(planes);
        Ok(attrs)
    }

    /// The populated planes.
    pub fn planes(&self) -> &[DmabufPlane] {
        &self.planes[..self.n_planes]
    }

    /// Duplicates every plane fd with close-on-exec set. The caller owns the result.
    pub fn dup_fds(&self) -> HwbufResult<Vec<SafeDescriptor>> {
        self.planes()
            .iter()
            .map(|plane| clone_descriptor(plane.fd).map_err(HwbufError::from))
            .collect()
    }
}

/// A plane whose fd is owned.
#[derive(Debug)]
pub struct OwnedPlane {
    pub fd: SafeDescriptor,
    pub offset: u32,
    pub stride: u32,
}

/// A DMA-BUF whose plane fds are closed exactly once, when this is dropped.
#[derive(Debug)]
pub struct OwnedDmabuf {
    width: u32,
    height: u32,
    format: DrmFormat,
    modifier: u64,
    planes: Vec<OwnedPlane>,
}

impl OwnedDmabuf {
    pub fn new(
        width: u32,
        height: u32,
        format: DrmFormat,
        modifier: u64,
        planes: Vec<OwnedPlane>,
    ) -> HwbufResult<OwnedDmabuf> {
        if planes.is_empty() || planes.len() > DMABUF_MAX_PLANES {
            return Err(HwbufError::InvalidNumberOfPlanes(planes.len()));
        }

        Ok(OwnedDmabuf {
            width,
            height,
            format,
            modifier,
            planes,
        })
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn attributes(&self) -> DmabufAttributes {
        let mut planes = [DmabufPlane::default(); DMABUF_MAX_PLANES];
        for (dst, src) in planes.iter_mut().zip(&self.planes) {
            *dst = DmabufPlane {
                fd: src.fd.as_raw_descriptor(),
                offset: src.offset,
                stride: src.stride,
            };
        }

        DmabufAttributes {
            width: self.width,
            height: self.height,
            format: self.format,
            modifier: self.modifier,
            n_planes: self.planes.len(),
            planes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwbuf_alloc::formats::DRM_FORMAT_NV12;
    use crate::hwbuf_alloc::formats::DRM_FORMAT_MOD_LINEAR;
    use crate::hwbuf_os::SharedMemory;

    fn memfd_plane(offset: u32, stride: u32) -> OwnedPlane {
        let shm = SharedMemory::new("dmabuf-test", 4096).unwrap();
        OwnedPlane {
            fd: SafeDescriptor::from(shm),
            offset,
            stride,
        }
    }

    #[test]
    fn plane_count_bounds() {
        let format = DrmFormat::from_bytes(DRM_FORMAT_NV12);
        assert!(matches!(
            OwnedDmabuf::new(16, 16, format, DRM_FORMAT_MOD_LINEAR, Vec::new()),
            Err(HwbufError::InvalidNumberOfPlanes(0))
        ));

        let five: Vec<OwnedPlane> = (0..5).map(|_| memfd_plane(0, 16)).collect();
        assert!(matches!(
            OwnedDmabuf::new(16, 16, format, DRM_FORMAT_MOD_LINEAR, five),
            Err(HwbufError::InvalidNumberOfPlanes(5))
        ));

        let plane = DmabufPlane::default();
        assert!(DmabufAttributes::new(16, 16, format, 0, &[plane; 4]).is_ok());
        assert!(DmabufAttributes::new(16, 16, format, 0, &[plane; 5]).is_err());
    }

    #[test]
    fn view_and_dup() {
        let format = DrmFormat::from_bytes(DRM_FORMAT_NV12);
        let owned = OwnedDmabuf::new(
            16,
            16,
            format,
            DRM_FORMAT_MOD_LINEAR,
            vec![memfd_plane(0, 16), memfd_plane(256, 16)],
        )
        .unwrap();

        let attrs = owned.attributes();
        assert_eq!(attrs.planes().len(), 2);
        assert_eq!(attrs.planes()[1].offset, 256);

        let dups = attrs.dup_fds().unwrap();
        assert_eq!(dups.len(), 2);
        for (dup, plane) in dups.iter().zip(attrs.planes()) {
            assert_ne!(dup.as_raw_descriptor(), plane.fd);
        }

        // The copies stay usable after the owner is gone.
        drop(owned);
        let ret = unsafe { libc::fcntl(dups[0].as_raw_descriptor(), libc::F_GETFD) };
        assert!(ret >= 0);
    }
}
