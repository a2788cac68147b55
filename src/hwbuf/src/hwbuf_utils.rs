// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! hwbuf_utils: Utility enums, structs, and implementations needed by the rest of the crate.

use std::ffi::NulError;
use std::io::Error as IoError;
use std::num::TryFromIntError;

use ash::vk;
#[cfg(unix)]
use nix::Error as NixError;
use remain::sorted;
use thiserror::Error;

use crate::hwbuf_alloc::DrmFormat;

/// Mapped memory access flags.
pub const HWBUF_MAP_ACCESS_MASK: u32 = 0xf0;
pub const HWBUF_MAP_ACCESS_READ: u32 = 0x10;
pub const HWBUF_MAP_ACCESS_WRITE: u32 = 0x20;
pub const HWBUF_MAP_ACCESS_RW: u32 = 0x30;

/// Flags for `Buffer::begin_data_ptr_access`.
pub const DATA_PTR_ACCESS_READ: u32 = 1 << 0;
pub const DATA_PTR_ACCESS_WRITE: u32 = 1 << 1;
pub const DATA_PTR_ACCESS_MASK: u32 = DATA_PTR_ACCESS_READ | DATA_PTR_ACCESS_WRITE;

/// An axis-aligned rectangle in buffer coordinates.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Rect {
        Rect {
            x,
            y,
            width,
            height,
        }
    }
}

/// An error generated while using this crate.
#[sorted]
#[derive(Error, Debug)]
pub enum HwbufError {
    /// The driver or the OS refused to allocate.
    #[error("allocation failed: {reason} (code {code})")]
    AllocationFailed { reason: &'static str, code: i32 },
    /// `begin_data_ptr_access` was called twice without a matching end.
    #[error("buffer data pointer access already in progress")]
    AlreadyAccessing,
    /// Checked Arithmetic error
    #[error("arithmetic failed: {}({}) {op} {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedArithmetic {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
        op: &'static str,
    },
    /// A plane's DMA-BUF fd could not be retrieved.
    #[error("failed to export plane {plane} (code {code})")]
    ExportFailed { plane: usize, code: i32 },
    /// The driver rejected a DMA-BUF import.
    #[error("dma-buf import failed: {0}")]
    ImportFailed(&'static str),
    /// Width or height are zero or above the configured maximum.
    #[error("invalid buffer dimensions {0}x{1}")]
    InvalidDimensions(u32, u32),
    /// Plane count outside of 1..=4 or not matching the format.
    #[error("invalid number of planes: {0}")]
    InvalidNumberOfPlanes(usize),
    /// An input/output error occured.
    #[error("an input/output error occur: {0}")]
    IoError(IoError),
    /// Nix crate error.
    #[cfg(unix)]
    #[error("The errno is {0}")]
    NixError(NixError),
    /// `end_data_ptr_access` without a matching begin.
    #[error("no buffer data pointer access in progress")]
    NotAccessing,
    /// `unlock` on a buffer with no outstanding locks.
    #[error("buffer is not locked")]
    NotLocked,
    #[error("Nul Error occured {0}")]
    NulError(NulError),
    /// Violation of an API contract occured.
    #[error("contract violation: {0}")]
    SpecViolation(&'static str),
    /// An attempted integer conversion failed.
    #[error("int conversion failed: {0}")]
    TryFromIntError(TryFromIntError),
    /// The operation is not implemented by this backend.
    #[error("the requested function is not implemented")]
    Unsupported,
    /// The FourCC has no mapping for this backend.
    #[error("unsupported format {0:?}")]
    UnsupportedFormat(DrmFormat),
    /// General Vulkan error
    #[error("vulkan failure {0}")]
    VkError(vk::Result),
}

#[cfg(unix)]
impl From<NixError> for HwbufError {
    fn from(e: NixError) -> HwbufError {
        HwbufError::NixError(e)
    }
}

impl From<NulError> for HwbufError {
    fn from(e: NulError) -> HwbufError {
        HwbufError::NulError(e)
    }
}

impl From<IoError> for HwbufError {
    fn from(e: IoError) -> HwbufError {
        HwbufError::IoError(e)
    }
}

impl From<TryFromIntError> for HwbufError {
    fn from(e: TryFromIntError) -> HwbufError {
        HwbufError::TryFromIntError(e)
    }
}

impl From<vk::Result> for HwbufError {
    fn from(e: vk::Result) -> HwbufError {
        HwbufError::VkError(e)
    }
}

/// The result of an operation in this crate.
pub type HwbufResult<T> = std::result::Result<T, HwbufError>;
