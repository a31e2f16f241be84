// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Alignment classes for device region mappings.
//!
//! A huge-fault capable device mapping can only be backed by PMD (2 MiB) or PUD (1 GiB) entries
//! if the process virtual address handed out for it is at least as aligned as the device offset
//! and length allow. [`AlignmentClass`] captures the three page orders that matter and how the
//! required one is derived from a requested window.

use std::fmt;

use crate::address::Address;

/// 4 KiB.
pub const SIZE_4K: u64 = 1 << 12;
/// 2 MiB.
pub const SIZE_2M: u64 = 1 << 21;
/// 1 GiB.
pub const SIZE_1G: u64 = 1 << 30;

/// Errors related to alignment arithmetic.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AlignmentError {
    /// The alignment is zero or not a power of two.
    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
    /// An overflow occurred while computing address values.
    #[error("overflow aligning {0:#x}")]
    Overflow(u64),
}

/// Page order a mapping is expected to be aligned to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum AlignmentClass {
    /// Base page alignment (12 bits).
    Base4K,
    /// PMD alignment (21 bits).
    Huge2M,
    /// PUD alignment (30 bits).
    Huge1G,
}

impl AlignmentClass {
    /// Number of low address bits that must be zero.
    pub const fn bits(self) -> u32 {
        match self {
            AlignmentClass::Base4K => 12,
            AlignmentClass::Huge2M => 21,
            AlignmentClass::Huge1G => 30,
        }
    }

    /// Size in bytes of the page order.
    pub const fn size(self) -> u64 {
        1 << self.bits()
    }

    /// Class derived from the lowest set bit of `offset | size`.
    ///
    /// A window starting at `offset` and spanning `size` bytes can only be backed by pages whose
    /// size divides both, so the lowest set bit of their union bounds the page order.
    pub fn for_window(offset: u64, size: u64) -> Self {
        Self::for_order((offset | size).trailing_zeros())
    }

    /// Class derived from the magnitude of a window mapped at device offset zero.
    pub fn for_size(size: u64) -> Self {
        if size < SIZE_2M {
            AlignmentClass::Base4K
        } else if size < SIZE_1G {
            AlignmentClass::Huge2M
        } else {
            AlignmentClass::Huge1G
        }
    }

    fn for_order(order: u32) -> Self {
        if order >= AlignmentClass::Huge1G.bits() {
            AlignmentClass::Huge1G
        } else if order >= AlignmentClass::Huge2M.bits() {
            AlignmentClass::Huge2M
        } else {
            AlignmentClass::Base4K
        }
    }

    /// Whether `addr` has at least `self.bits()` trailing zero bits.
    pub fn is_satisfied_by<A: Address>(self, addr: A) -> bool {
        addr.trailing_zero_bits() >= self.bits()
    }
}

impl fmt::Display for AlignmentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentClass::Base4K => write!(f, "4K"),
            AlignmentClass::Huge2M => write!(f, "2M"),
            AlignmentClass::Huge1G => write!(f, "1G"),
        }
    }
}

fn check_power_of_two(align: u64) -> Result<(), AlignmentError> {
    if align.is_power_of_two() {
        Ok(())
    } else {
        Err(AlignmentError::InvalidAlignment(align))
    }
}

/// Round `value` up to a multiple of `align`.
pub fn align_up(value: u64, align: u64) -> Result<u64, AlignmentError> {
    check_power_of_two(align)?;
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or(AlignmentError::Overflow(value))
}

/// Round `value` down to a multiple of `align`.
pub fn align_down(value: u64, align: u64) -> Result<u64, AlignmentError> {
    check_power_of_two(align)?;
    Ok(value & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HostAddress;

    #[test]
    fn test_for_window() {
        assert_eq!(AlignmentClass::for_window(0, SIZE_2M), AlignmentClass::Huge2M);
        assert_eq!(AlignmentClass::for_window(0x1000, SIZE_2M), AlignmentClass::Base4K);
        assert_eq!(
            AlignmentClass::for_window(SIZE_2M, 3 * SIZE_2M),
            AlignmentClass::Huge2M
        );
        assert_eq!(AlignmentClass::for_window(0, 4 * SIZE_1G), AlignmentClass::Huge1G);
        assert_eq!(
            AlignmentClass::for_window(SIZE_1G, SIZE_1G + SIZE_2M),
            AlignmentClass::Huge2M
        );
        // Bit 21 exactly is already PMD alignment.
        assert_eq!(AlignmentClass::for_window(0, 1 << 21), AlignmentClass::Huge2M);
    }

    #[test]
    fn test_for_size() {
        assert_eq!(AlignmentClass::for_size(SIZE_2M - SIZE_4K), AlignmentClass::Base4K);
        assert_eq!(AlignmentClass::for_size(SIZE_2M), AlignmentClass::Huge2M);
        assert_eq!(AlignmentClass::for_size(3 * SIZE_2M), AlignmentClass::Huge2M);
        assert_eq!(AlignmentClass::for_size(SIZE_1G), AlignmentClass::Huge1G);
        assert_eq!(AlignmentClass::Huge2M.size(), SIZE_2M);
    }

    #[test]
    fn test_is_satisfied_by() {
        assert!(AlignmentClass::Huge2M.is_satisfied_by(HostAddress(0x7f00_0020_0000)));
        assert!(!AlignmentClass::Huge2M.is_satisfied_by(HostAddress(0x7f00_0010_0000)));
        assert!(AlignmentClass::Base4K.is_satisfied_by(HostAddress(0x7f00_0010_1000)));
        assert!(AlignmentClass::Huge1G.is_satisfied_by(HostAddress(0)));
    }

    #[test]
    fn test_align_up_down() {
        assert_eq!(align_up(0x1001, 0x1000), Ok(0x2000));
        assert_eq!(align_up(0x2000, 0x1000), Ok(0x2000));
        assert_eq!(align_down(0x2fff, 0x1000), Ok(0x2000));
        assert_eq!(
            align_up(u64::MAX, 0x1000),
            Err(AlignmentError::Overflow(u64::MAX))
        );
        assert_eq!(
            align_down(0x1000, 0x3000),
            Err(AlignmentError::InvalidAlignment(0x3000))
        );
    }
}
