// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Module containing abstractions for the mappable regions (BARs) of a device.

use std::fmt::Debug;

use bitflags::bitflags;

use crate::iommu::Error;
use crate::mmap::HostMapping;

/// Index of the first PCI BAR region.
pub const BAR0_REGION_INDEX: u32 = 0;
/// Index of the expansion ROM region; BAR indices are strictly below it.
pub const ROM_REGION_INDEX: u32 = 6;

bitflags! {
    /// Region capabilities as reported by the device.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct RegionFlags: u32 {
        /// Region supports read.
        const READ = 1 << 0;
        /// Region supports write.
        const WRITE = 1 << 1;
        /// Region supports mmap.
        const MMAP = 1 << 2;
        /// Region info carries a capability chain.
        const CAPS = 1 << 3;
    }
}

bitflags! {
    /// Device level flags.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct DeviceFlags: u32 {
        /// Device supports reset.
        const RESET = 1 << 0;
        /// Device is a vfio-pci device.
        const PCI = 1 << 1;
    }
}

/// Summary of a device's regions and interrupts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    /// Device flags
    pub flags: DeviceFlags,
    /// Max region index + 1
    pub num_regions: u32,
    /// Max IRQ index + 1
    pub num_irqs: u32,
}

/// Description of one device region.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RegionInfo {
    /// Region index
    pub index: u32,
    /// Region size in bytes; zero for unimplemented regions
    pub size: u64,
    /// Offset of the region within the device file
    pub offset: u64,
    /// Region capabilities
    pub flags: RegionFlags,
    /// Offset of the first capability in the extended region info, if any
    pub cap_offset: Option<u32>,
}

impl RegionInfo {
    /// Whether the region can be mapped into the process.
    pub fn is_mappable(&self) -> bool {
        self.size > 0 && self.flags.contains(RegionFlags::MMAP)
    }

    /// Number of base pages spanned by the region.
    pub fn pages(&self) -> u64 {
        self.size >> 12
    }
}

/// A device handle exposing region introspection and region mapping.
pub trait DeviceRegion: Debug + Send + Sync {
    /// Query device level information.
    fn device_info(&self) -> Result<DeviceInfo, Error>;

    /// Query the region at `index`.
    fn region_info(&self, index: u32) -> Result<RegionInfo, Error>;

    /// Map `length` bytes of the device file at `offset` into the process, read/write shared,
    /// at an address of the kernel's choosing.
    fn mmap_region(&self, offset: u64, length: u64) -> Result<HostMapping, Error>;

    /// Map `length` bytes of the device file at `offset` read-only, placed at a process address
    /// aligned to `align`, with a huge page hint.
    fn mmap_region_aligned(
        &self,
        offset: u64,
        length: u64,
        align: u64,
    ) -> Result<HostMapping, Error>;

    /// Iterate over the BAR regions (indices below the ROM) that can be mapped.
    ///
    /// Regions whose query fails are skipped with a warning, matching how a missing BAR is
    /// reported by vfio-pci.
    fn mappable_bars(&self) -> Vec<RegionInfo> {
        (BAR0_REGION_INDEX..ROM_REGION_INDEX)
            .filter_map(|index| match self.region_info(index) {
                Ok(info) => Some(info),
                Err(e) => {
                    log::warn!("region info failed for BAR{}: {}", index, e);
                    None
                }
            })
            .filter(RegionInfo::is_mappable)
            .collect()
    }
}

impl<D: DeviceRegion + ?Sized> DeviceRegion for &D {
    fn device_info(&self) -> Result<DeviceInfo, Error> {
        (**self).device_info()
    }

    fn region_info(&self, index: u32) -> Result<RegionInfo, Error> {
        (**self).region_info(index)
    }

    fn mmap_region(&self, offset: u64, length: u64) -> Result<HostMapping, Error> {
        (**self).mmap_region(offset, length)
    }

    fn mmap_region_aligned(
        &self,
        offset: u64,
        length: u64,
        align: u64,
    ) -> Result<HostMapping, Error> {
        (**self).mmap_region_aligned(offset, length, align)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_info() {
        let info = RegionInfo {
            index: 2,
            size: 0x20_0000,
            offset: 0x2_0000_0000_0000,
            flags: RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MMAP,
            cap_offset: None,
        };
        assert!(info.is_mappable());
        assert_eq!(info.pages(), 512);

        let no_mmap = RegionInfo {
            flags: RegionFlags::READ,
            ..info
        };
        assert!(!no_mmap.is_mappable());

        let empty = RegionInfo { size: 0, ..info };
        assert!(!empty.is_mappable());
    }
}
