// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Address newtypes for the two address spaces a DMA mapping binds together.
//!
//! - [`Iova`]: an I/O virtual address, i.e. what the device sees.
//! - [`HostAddress`]: a process virtual address backing a mapping, i.e. what the CPU sees.

use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Common operations on the raw `u64` value of an address.
pub trait Address:
    Sized
    + Copy
    + Default
    + Eq
    + Ord
    + BitAnd<u64, Output = Self>
    + BitOr<u64, Output = Self>
{
    /// Create an address from the raw value.
    fn new(value: u64) -> Self;

    /// Get the raw value of an address.
    fn raw_value(&self) -> u64;

    /// Returns the offset from this address to the given base address and None if there is
    /// underflow.
    fn checked_offset_from(&self, base: Self) -> Option<u64> {
        self.raw_value().checked_sub(base.raw_value())
    }

    /// Returns the result of the add or None if there is overflow.
    fn checked_add(&self, other: u64) -> Option<Self> {
        self.raw_value().checked_add(other).map(Self::new)
    }

    /// Returns the result of the base address + the size.
    /// Only use this when `offset` is guaranteed not to overflow.
    fn unchecked_add(&self, offset: u64) -> Self {
        Self::new(self.raw_value() + offset)
    }

    /// Returns the result of the subtraction or None if there is underflow.
    fn checked_sub(&self, other: u64) -> Option<Self> {
        self.raw_value().checked_sub(other).map(Self::new)
    }

    /// Number of trailing zero bits, i.e. the natural alignment order of the address.
    ///
    /// The zero address is aligned to everything and reports 64.
    fn trailing_zero_bits(&self) -> u32 {
        self.raw_value().trailing_zeros()
    }
}

macro_rules! impl_address_ops {
    ($T:ident) => {
        impl Address for $T {
            fn new(value: u64) -> $T {
                $T(value)
            }

            fn raw_value(&self) -> u64 {
                self.0
            }
        }

        impl BitAnd<u64> for $T {
            type Output = $T;

            fn bitand(self, other: u64) -> $T {
                $T(self.0 & other)
            }
        }

        impl BitOr<u64> for $T {
            type Output = $T;

            fn bitor(self, other: u64) -> $T {
                $T(self.0 | other)
            }
        }

        impl fmt::LowerHex for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<u64> for $T {
            fn from(value: u64) -> $T {
                $T(value)
            }
        }
    };
}

/// An I/O virtual address: the device-visible side of a DMA mapping.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Iova(pub u64);
impl_address_ops!(Iova);

/// A process virtual address: the memory a DMA mapping is sourced from.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct HostAddress(pub u64);
impl_address_ops!(HostAddress);

impl HostAddress {
    /// Build a host address from a raw pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        HostAddress(ptr as u64)
    }

    /// Turn the host address back into a raw pointer.
    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_from() {
        let base = Iova(0x100);
        let addr = Iova(0x150);
        assert_eq!(addr.checked_offset_from(base), Some(0x50u64));
        assert_eq!(base.checked_offset_from(addr), None);
    }

    #[test]
    fn test_mask() {
        let a = HostAddress(0x5050);
        assert_eq!(HostAddress(0x5000), a & 0xff00u64);
        assert_eq!(HostAddress(0x5055), a | 0x0005u64);
    }

    #[test]
    fn test_checked_add_with_overflow() {
        let a = Iova(0xffff_ffff_ffff_ff55);
        assert_eq!(Some(Iova(0xffff_ffff_ffff_ff57)), a.checked_add(2));
        assert!(a.checked_add(0xf0).is_none());
        assert_eq!(Iova(0x50).unchecked_add(0x10), Iova(0x60));
    }

    #[test]
    fn test_checked_sub_with_underflow() {
        let a = Iova(0xff);
        assert_eq!(Some(Iova(0x0f)), a.checked_sub(0xf0));
        assert!(a.checked_sub(0xffff).is_none());
    }

    #[test]
    fn test_trailing_zero_bits() {
        assert_eq!(HostAddress(0x20_0000).trailing_zero_bits(), 21);
        assert_eq!(HostAddress(0x7f12_3400_1000).trailing_zero_bits(), 12);
        assert_eq!(HostAddress(0).trailing_zero_bits(), 64);
    }

    #[test]
    fn test_ptr_round_trip() {
        let value = 7u64;
        let addr = HostAddress::from_ptr(&value as *const u64);
        assert_eq!(addr.as_ptr::<u64>(), &value as *const u64);
        assert_eq!(format!("{:x}", Iova(0xabc)), "abc");
    }
}
