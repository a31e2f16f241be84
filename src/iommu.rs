// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Provide an interface to the DMA address space of a passthrough device.
//!
//! An [`AddressSpace`] binds process memory ([`HostAddress`]) to device-visible I/O virtual
//! addresses ([`Iova`]) and releases those bindings again. Its only real implementation talks to a
//! VFIO container ([`crate::vfio::VfioContainer`]); [`crate::sim::SimulatedIommu`] models the same
//! contract in memory so that the verification logic can be exercised without privileges.

use std::fmt::{self, Debug};
use std::io;

use bitflags::bitflags;

use crate::address::{HostAddress, Iova};
use crate::mmap;

bitflags! {
    /// Access a device is granted to a DMA mapping.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct DmaPermissions: u32 {
        /// Readable from the device.
        const READ = 1 << 0;
        /// Writable from the device.
        const WRITE = 1 << 1;
    }
}

/// The two operations issued against an address space.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    /// Bind process memory to an IOVA range.
    Map,
    /// Release the binding of an IOVA range.
    Unmap,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Map => write!(f, "map"),
            Operation::Unmap => write!(f, "unmap"),
        }
    }
}

/// Errors returned by the device control interface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A map or unmap control call failed.
    #[error("{op} of I/O virtual address range {:#x}+{length:#x} failed: {source}", iova.0)]
    Control {
        /// Operation that failed
        op: Operation,
        /// Base of the requested range
        iova: Iova,
        /// Length of the requested range
        length: u64,
        /// Error code reported by the driver
        source: io::Error,
    },
    /// A device or IOMMU query failed.
    #[error("{query} failed: {source}")]
    Query {
        /// Human-readable name of the query
        query: &'static str,
        /// Error code reported by the driver
        source: io::Error,
    },
    /// The queried capability is not supported by this device or IOMMU.
    #[error("capability not supported: {0}")]
    Unsupported(&'static str),
    /// The requested region does not exist.
    #[error("no such region: {0}")]
    InvalidRegion(u32),
    /// Mapping a device window into the process failed.
    #[error("cannot map device window: {0}")]
    Mmap(#[from] mmap::Error),
}

impl Error {
    /// Build a [`Error::Control`] from an errno value.
    pub fn control(op: Operation, iova: Iova, length: u64, errno: i32) -> Self {
        Error::Control {
            op,
            iova,
            length,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// The OS error code carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Control { source, .. } | Error::Query { source, .. } => source.raw_os_error(),
            Error::Mmap(mmap::Error::Mmap(source)) => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether the driver refused a mapping because the range is already (partially) mapped.
    pub fn is_overlap(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// Whether the error means "capability not supported" rather than a failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
            || matches!(self.errno(), Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP))
    }
}

/// The privileged context through which DMA mappings of one device (group) are issued.
///
/// All methods take `&self`: the underlying transport is a file descriptor, and implementations
/// must be callable from whichever probe currently owns the handle.
pub trait AddressSpace: Debug + Send + Sync {
    /// Bind `length` bytes of process memory at `source` to the device at `iova`.
    fn map(
        &self,
        iova: Iova,
        length: u64,
        source: HostAddress,
        access: DmaPermissions,
    ) -> Result<(), Error>;

    /// Release the binding of `[iova, iova + length)`.
    ///
    /// Returns the number of bytes actually released, which is authoritative: it may be smaller
    /// (nothing mapped there) or larger (a huge page covering the request was torn down) than
    /// `length`.
    fn unmap(&self, iova: Iova, length: u64) -> Result<u64, Error>;

    /// Bitmap of the IOVA page sizes supported by the IOMMU.
    fn page_sizes(&self) -> Result<u64, Error> {
        Err(Error::Unsupported("IOVA page size query"))
    }
}

impl<A: AddressSpace + ?Sized> AddressSpace for &A {
    fn map(
        &self,
        iova: Iova,
        length: u64,
        source: HostAddress,
        access: DmaPermissions,
    ) -> Result<(), Error> {
        (**self).map(iova, length, source, access)
    }

    fn unmap(&self, iova: Iova, length: u64) -> Result<u64, Error> {
        (**self).unmap(iova, length)
    }

    fn page_sizes(&self) -> Result<u64, Error> {
        (**self).page_sizes()
    }
}

/// Render a page size bitmap as a short human readable list (e.g. `4K 2M 1G`).
pub fn format_page_sizes(bitmap: u64) -> String {
    (0..64)
        .filter(|bit| bitmap & (1u64 << bit) != 0)
        .map(|bit| match bit {
            0..=9 => format!("{}", 1u64 << bit),
            10..=19 => format!("{}K", 1u64 << (bit - 10)),
            20..=29 => format!("{}M", 1u64 << (bit - 20)),
            _ => format!("{}G", 1u64 << (bit - 30)),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let e = Error::control(Operation::Map, Iova(0x1000), 0x1000, libc::EEXIST);
        assert!(e.is_overlap());
        assert!(!e.is_unsupported());
        assert_eq!(e.errno(), Some(libc::EEXIST));
        assert_eq!(
            e.to_string(),
            format!(
                "map of I/O virtual address range 0x1000+0x1000 failed: {}",
                io::Error::from_raw_os_error(libc::EEXIST)
            )
        );

        let e = Error::control(Operation::Unmap, Iova(0), 0x1000, libc::EINVAL);
        assert!(!e.is_overlap());

        assert!(Error::Unsupported("x").is_unsupported());
        let e = Error::Query {
            query: "VFIO_IOMMU_GET_INFO",
            source: io::Error::from_raw_os_error(libc::ENOTTY),
        };
        assert!(e.is_unsupported());
        assert_eq!(Error::InvalidRegion(9).errno(), None);
    }

    #[test]
    fn test_format_page_sizes() {
        assert_eq!(format_page_sizes(0x1000 | 0x20_0000 | 0x4000_0000), "4K 2M 1G");
        assert_eq!(format_page_sizes(0), "");
    }

    #[test]
    fn test_permissions() {
        let rw = DmaPermissions::READ | DmaPermissions::WRITE;
        assert_eq!(rw.bits(), 3);
        assert!(rw.contains(DmaPermissions::WRITE));
        assert_eq!(DmaPermissions::default(), DmaPermissions::empty());
    }
}
