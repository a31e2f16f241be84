// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Errors reported by the verification probes.
//!
//! Two classes are kept strictly apart:
//! - [`Violation`]: the driver behaved inconsistently with what the shadow state predicts. These
//!   are the findings the probes exist to produce.
//! - every other [`Error`] variant: the environment did not let the probe run (a control call
//!   failed for a reason unrelated to the property under test, a region is missing, memory could
//!   not be allocated).

use std::result;

use crate::address::{HostAddress, Iova};
use crate::align::AlignmentClass;
use crate::iommu::{self, Operation};
use crate::{mmap, pattern, vfio};

/// An invariant violation: the driver disagreed with the shadow state.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// The driver accepted a mapping over an already mapped range.
    #[error("allowed to remap {:#x}+{length:#x}", iova.0)]
    RemapAllowed {
        /// Base of the offending range
        iova: Iova,
        /// Length of the offending range
        length: u64,
    },
    /// The driver refused a mapping the shadow state says does not overlap anything.
    #[error("mapping {:#x}+{length:#x} rejected as overlapping, but nothing is mapped there", iova.0)]
    UnexpectedReject {
        /// Base of the offending range
        iova: Iova,
        /// Length of the offending range
        length: u64,
    },
    /// An unmap released a different number of bytes than required.
    #[error("unmap of {:#x}+{length:#x} released {released:#x}, expected {expected:#x}", iova.0)]
    ReleaseMismatch {
        /// Base of the offending range
        iova: Iova,
        /// Length of the offending range
        length: u64,
        /// Bytes the shadow state required to be released
        expected: u64,
        /// Bytes the driver reported as released
        released: u64,
    },
    /// An unmap released bytes where nothing is mapped.
    #[error("unmap of unmapped range {:#x}+{length:#x} released {released:#x}", iova.0)]
    PhantomRelease {
        /// Base of the offending range
        iova: Iova,
        /// Length of the offending range
        length: u64,
        /// Bytes the driver reported as released
        released: u64,
    },
    /// An unmap released more bytes than are still mapped around the request.
    #[error(
        "unmap of {:#x}+{length:#x} released {released:#x}, only {outstanding:#x} still mapped",
        iova.0
    )]
    OverRelease {
        /// Base of the offending range
        iova: Iova,
        /// Length of the offending range
        length: u64,
        /// Bytes the driver reported as released
        released: u64,
        /// Bytes the shadow state still considers mapped in the touched records
        outstanding: u64,
    },
    /// The extent was not released in full.
    #[error("only unmapped {released:#x} of {mapped:#x}")]
    ReleaseShortfall {
        /// Bytes mapped over the run
        mapped: u64,
        /// Bytes released over the run
        released: u64,
    },
    /// A record inserted into the shadow table intersects an existing one.
    #[error(
        "record {:#x}+{length:#x} overlaps active record {:#x}+{existing_length:#x}",
        iova.0,
        existing_iova.0
    )]
    Overlap {
        /// Base of the new record
        iova: Iova,
        /// Length of the new record
        length: u64,
        /// Base of the record already present
        existing_iova: Iova,
        /// Length of the record already present
        existing_length: u64,
    },
    /// A device window was placed at an insufficiently aligned address.
    #[error(
        "window offset {offset:#x} size {size:#x} mapped at {:#x}: got order {actual_bits}, want {required} ({} bits)",
        address.0,
        required.bits()
    )]
    Misaligned {
        /// Device offset of the window
        offset: u64,
        /// Size of the window
        size: u64,
        /// Returned base address
        address: HostAddress,
        /// Required alignment class
        required: AlignmentClass,
        /// Trailing zero bits of `address`
        actual_bits: u32,
    },
}

/// Errors associated with running a probe.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invariant violation.
    #[error("invariant violation: {0}")]
    Violation(#[from] Violation),
    /// A map/unmap call failed unexpectedly, aborting the current sub-test.
    #[error("driver error on {op} {:#x}+{length:#x}: {source}", iova.0)]
    Driver {
        /// Operation that failed
        op: Operation,
        /// Base of the requested range
        iova: Iova,
        /// Length of the requested range
        length: u64,
        /// Underlying error
        source: iommu::Error,
    },
    /// A device or IOMMU query failed.
    #[error("{0}")]
    Control(#[from] iommu::Error),
    /// Host backing memory could not be set up.
    #[error("backing memory: {0}")]
    Mapping(#[from] mmap::Error),
    /// The traversal parameters are unusable.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] pattern::Error),
    /// A zero-length mapping was requested.
    #[error("zero length request at {:#x}", iova.0)]
    EmptyRequest {
        /// Base of the request
        iova: Iova,
    },
    /// A remap test was aimed at a range with nothing mapped.
    #[error("remap test over unmapped range {:#x}+{length:#x}", iova.0)]
    NotMapped {
        /// Base of the request
        iova: Iova,
        /// Length of the request
        length: u64,
    },
    /// No mmap-capable region is large enough for the requested page size.
    #[error("no mappable region of at least {page_size:#x} bytes")]
    NoSuitableRegion {
        /// Page size that was requested
        page_size: u64,
    },
    /// The device could not be attached.
    #[error("cannot attach device: {0}")]
    Attach(#[from] vfio::Error),
}

impl Error {
    /// Whether this error is an invariant violation rather than an environment failure.
    pub fn is_violation(&self) -> bool {
        matches!(self, Error::Violation(_))
    }

    /// Whether the device or IOMMU lacks a capability the probe needs.
    ///
    /// This is a valid outcome for a feature probe, not a failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Control(e) if e.is_unsupported())
    }
}

/// Result of probe operations.
pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display() {
        let v = Violation::ReleaseShortfall {
            mapped: 0x20_0000,
            released: 0x1f_f000,
        };
        assert_eq!(v.to_string(), "only unmapped 0x1ff000 of 0x200000");

        let v = Violation::Misaligned {
            offset: 0,
            size: 0x20_0000,
            address: HostAddress(0x7f00_0010_0000),
            required: AlignmentClass::Huge2M,
            actual_bits: 20,
        };
        assert_eq!(
            v.to_string(),
            "window offset 0x0 size 0x200000 mapped at 0x7f0000100000: got order 20, want 2M (21 bits)"
        );
    }

    #[test]
    fn test_classification() {
        let e: Error = Violation::RemapAllowed {
            iova: Iova(0),
            length: 0x1000,
        }
        .into();
        assert!(e.is_violation());

        assert!(!e.is_unsupported());

        let e: Error = iommu::Error::Unsupported("x").into();
        assert!(!e.is_violation());
        assert!(e.is_unsupported());
        let e: Error = iommu::Error::Query {
            query: "iommu info",
            source: std::io::Error::from_raw_os_error(libc::ENOTTY),
        }
        .into();
        assert!(e.is_unsupported());

        let e = Error::NoSuitableRegion { page_size: 1 << 21 };
        assert!(!e.is_violation());
        assert!(!e.is_unsupported());
    }
}
