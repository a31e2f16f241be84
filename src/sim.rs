// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! In-memory models of a Type1 IOMMU and a passthrough device.
//!
//! [`SimulatedIommu`] follows the kernel's Type1 contract closely enough for the verification
//! logic to be exercised without privileges:
//! - zero, unaligned or wrapping requests fail with `EINVAL`;
//! - a map overlapping any existing mapping fails with `EEXIST`;
//! - an unmap returns the number of bytes it tore down, zero if nothing was mapped there.
//!
//! With superpage coalescing enabled, unmapping any part of a superpage-aligned frame that lies
//! inside one mapping tears down the whole frame, the way an IOMMU backed by PMD sized entries
//! does. [`SimulatedDevice`] exposes BARs backed by anonymous memory and places windows the way
//! a huge-fault capable vfio-pci does.

use std::collections::HashMap;
use std::num::Wrapping;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use log::trace;
use rangemap::RangeMap;

use crate::address::{HostAddress, Iova};
use crate::align::{AlignmentClass, SIZE_1G, SIZE_2M, SIZE_4K};
use crate::iommu::{AddressSpace, DmaPermissions, Error, Operation};
use crate::mmap::{self, HostMapping, HostMappingBuilder};
use crate::region::{DeviceFlags, DeviceInfo, DeviceRegion, RegionFlags, RegionInfo};

/// Deliberate misbehaviour, used to check that the verifier notices it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Accept overlapping maps, replacing what was there.
    AllowRemap,
    /// Report one extra base page for every unmap that released something.
    OverReport,
    /// Report half of what every unmap released.
    UnderReport,
}

// Stored per range. The id keeps rangemap from merging adjacent but distinct mappings, and
// records which original map call a fragment belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct SimMapping {
    id: u64,
    target_source_diff: Wrapping<u64>,
    permissions: DmaPermissions,
}

#[derive(Debug)]
struct Extent {
    range: Range<u64>,
    remaining: u64,
}

#[derive(Debug, Default)]
struct State {
    tlb: RangeMap<u64, SimMapping>,
    extents: HashMap<u64, Extent>,
    next_id: u64,
}

impl State {
    // Bytes of `window` held by mapping `id`, or by any mapping when `id` is None.
    fn remove(&mut self, window: Range<u64>, id: Option<u64>) -> u64 {
        let pieces: Vec<(Range<u64>, u64)> = self
            .tlb
            .overlapping(&window)
            .filter(|(_, m)| id.map_or(true, |id| m.id == id))
            .map(|(r, m)| (r.start.max(window.start)..r.end.min(window.end), m.id))
            .collect();

        let mut released = 0;
        for (piece, owner) in pieces {
            let len = piece.end - piece.start;
            self.tlb.remove(piece);
            released += len;
            if let Some(extent) = self.extents.get_mut(&owner) {
                extent.remaining -= len;
                if extent.remaining == 0 {
                    self.extents.remove(&owner);
                }
            }
        }
        released
    }
}

/// In-memory Type1 IOMMU.
#[derive(Debug)]
pub struct SimulatedIommu {
    state: Mutex<State>,
    page_sizes: u64,
    superpage: Option<u64>,
    fault: Option<Fault>,
    map_calls: AtomicU64,
    unmap_calls: AtomicU64,
}

impl Default for SimulatedIommu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedIommu {
    /// Create an IOMMU supporting 4K, 2M and 1G pages, without coalescing.
    pub fn new() -> Self {
        SimulatedIommu {
            state: Mutex::new(State::default()),
            page_sizes: SIZE_4K | SIZE_2M | SIZE_1G,
            superpage: None,
            fault: None,
            map_calls: AtomicU64::new(0),
            unmap_calls: AtomicU64::new(0),
        }
    }

    /// Set the supported page size bitmap; its lowest bit is the mapping granularity.
    pub fn with_page_sizes(mut self, bitmap: u64) -> Self {
        self.page_sizes = bitmap;
        self
    }

    /// Tear down whole `size` frames on unmap where a single mapping covers the frame.
    pub fn with_superpage_coalescing(mut self, size: u64) -> Self {
        self.superpage = Some(size);
        self
    }

    /// Misbehave in the given way.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Number of map calls issued so far.
    pub fn map_calls(&self) -> u64 {
        self.map_calls.load(Ordering::Relaxed)
    }

    /// Number of unmap calls issued so far.
    pub fn unmap_calls(&self) -> u64 {
        self.unmap_calls.load(Ordering::Relaxed)
    }

    /// Bytes currently mapped.
    pub fn mapped_bytes(&self) -> u64 {
        self.state()
            .tlb
            .iter()
            .map(|(r, _)| r.end - r.start)
            .sum()
    }

    /// Access rights `iova` was mapped with, if mapped.
    pub fn permissions(&self, iova: Iova) -> Option<DmaPermissions> {
        self.state().tlb.get(&iova.0).map(|m| m.permissions)
    }

    /// Process address `iova` translates to, if mapped.
    pub fn translate(&self, iova: Iova) -> Option<HostAddress> {
        self.state()
            .tlb
            .get(&iova.0)
            .map(|m| HostAddress((Wrapping(iova.0) - m.target_source_diff).0))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn granule(&self) -> u64 {
        // Lowest set bit.
        self.page_sizes & self.page_sizes.wrapping_neg()
    }

    fn check_request(&self, op: Operation, iova: Iova, length: u64) -> Result<Range<u64>, Error> {
        let mask = self.granule().wrapping_sub(1);
        let end = iova.0.checked_add(length);
        match end {
            Some(end) if length > 0 && iova.0 & mask == 0 && length & mask == 0 => {
                Ok(iova.0..end)
            }
            _ => Err(Error::control(op, iova, length, libc::EINVAL)),
        }
    }

    // Windows to tear down for an unmap of `window`, each optionally restricted to one mapping.
    fn unmap_windows(&self, state: &State, window: &Range<u64>) -> Vec<(Range<u64>, Option<u64>)> {
        let Some(sp) = self.superpage else {
            return vec![(window.clone(), None)];
        };

        let mut windows = Vec::new();
        let mut frame = window.start & !(sp - 1);
        while frame < window.end {
            let frame_end = frame.saturating_add(sp);
            let sub = frame.max(window.start)..frame_end.min(window.end);
            for (_, m) in state.tlb.overlapping(&sub) {
                let whole_frame = state.extents.get(&m.id).map_or(false, |e| {
                    e.range.start <= frame
                        && frame_end <= e.range.end
                        && m.target_source_diff.0 & (sp - 1) == 0
                });
                if whole_frame {
                    windows.push((frame..frame_end, Some(m.id)));
                } else {
                    windows.push((sub.clone(), Some(m.id)));
                }
            }
            if frame_end == u64::MAX {
                break;
            }
            frame = frame_end;
        }
        windows
    }
}

impl AddressSpace for SimulatedIommu {
    fn map(
        &self,
        iova: Iova,
        length: u64,
        source: HostAddress,
        access: DmaPermissions,
    ) -> Result<(), Error> {
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        let range = self.check_request(Operation::Map, iova, length)?;
        if source.0 & self.granule().wrapping_sub(1) != 0 {
            return Err(Error::control(Operation::Map, iova, length, libc::EINVAL));
        }

        let mut state = self.state();
        if state.tlb.overlaps(&range) {
            if self.fault != Some(Fault::AllowRemap) {
                return Err(Error::control(Operation::Map, iova, length, libc::EEXIST));
            }
            state.remove(range.clone(), None);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.extents.insert(
            id,
            Extent {
                range: range.clone(),
                remaining: length,
            },
        );
        state.tlb.insert(
            range,
            SimMapping {
                id,
                target_source_diff: Wrapping(iova.0) - Wrapping(source.0),
                permissions: access,
            },
        );
        trace!("sim map {:#x}+{:#x} -> {:#x}", iova.0, length, source.0);
        Ok(())
    }

    fn unmap(&self, iova: Iova, length: u64) -> Result<u64, Error> {
        self.unmap_calls.fetch_add(1, Ordering::Relaxed);
        let window = self.check_request(Operation::Unmap, iova, length)?;

        let mut state = self.state();
        let windows = self.unmap_windows(&state, &window);
        let mut released = 0;
        for (w, id) in windows {
            released += state.remove(w, id);
        }

        let reported = match self.fault {
            Some(Fault::OverReport) if released > 0 => released + self.granule(),
            Some(Fault::UnderReport) => released / 2,
            _ => released,
        };
        trace!("sim unmap {:#x}+{:#x} released {:#x}", iova.0, length, reported);
        Ok(reported)
    }

    fn page_sizes(&self) -> Result<u64, Error> {
        Ok(self.page_sizes)
    }
}

/// Which windows a [`SimulatedDevice`] places one base page past their natural boundary.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Misplacement {
    /// Every window is placed correctly.
    #[default]
    None,
    /// Every window is misplaced.
    All,
    /// Windows whose length is not a power of two.
    NonPowerOfTwo,
    /// Windows not starting at the beginning of their region.
    Offset,
}

impl Misplacement {
    fn applies(self, within: u64, length: u64) -> bool {
        match self {
            Misplacement::None => false,
            Misplacement::All => true,
            Misplacement::NonPowerOfTwo => !length.is_power_of_two(),
            Misplacement::Offset => within != 0,
        }
    }
}

#[derive(Debug)]
struct SimRegion {
    info: RegionInfo,
}

/// A device with anonymous-memory BARs.
///
/// BAR `n` lives at device file offset `n << 40`, mirroring vfio-pci's region layout.
#[derive(Debug)]
pub struct SimulatedDevice {
    regions: Vec<SimRegion>,
    misplacement: Misplacement,
}

/// Shift converting a region index to its device file offset.
pub const REGION_OFFSET_SHIFT: u32 = 40;

const NUM_REGIONS: u32 = 9;

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Create a device with no implemented BARs.
    pub fn new() -> Self {
        SimulatedDevice {
            regions: Vec::new(),
            misplacement: Misplacement::None,
        }
    }

    /// Add a mmap-capable read/write BAR of `size` bytes at `index`.
    pub fn with_bar(self, index: u32, size: u64) -> Self {
        self.with_region(
            index,
            size,
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::MMAP,
        )
    }

    /// Add a region with explicit flags.
    pub fn with_region(mut self, index: u32, size: u64, flags: RegionFlags) -> Self {
        self.regions.retain(|r| r.info.index != index);
        self.regions.push(SimRegion {
            info: RegionInfo {
                index,
                size,
                offset: u64::from(index) << REGION_OFFSET_SHIFT,
                flags,
                cap_offset: None,
            },
        });
        self
    }

    /// Place the selected windows one base page past the boundary they should be aligned to.
    pub fn with_misplacement(mut self, misplacement: Misplacement) -> Self {
        self.misplacement = misplacement;
        self
    }

    // Region holding `[offset, offset + length)` and the offset within it.
    fn locate(&self, offset: u64, length: u64) -> Result<(&RegionInfo, u64), Error> {
        let index = (offset >> REGION_OFFSET_SHIFT) as u32;
        let region = self
            .regions
            .iter()
            .map(|r| &r.info)
            .find(|r| r.index == index)
            .ok_or(Error::InvalidRegion(index))?;
        let within = offset - region.offset;
        let fits = within
            .checked_add(length)
            .map_or(false, |end| end <= region.size);
        if !region.flags.contains(RegionFlags::MMAP) || length == 0 || !fits {
            return Err(Error::Mmap(mmap::Error::InvalidOffsetLength));
        }
        Ok((region, within))
    }

    fn place(
        &self,
        builder: HostMappingBuilder,
        align: u64,
        within: u64,
        length: u64,
    ) -> Result<HostMapping, Error> {
        let builder = builder.with_alignment(align);
        let builder = if self.misplacement.applies(within, length) {
            builder.with_skew(SIZE_4K)
        } else {
            builder
        };
        builder.build().map_err(Error::Mmap)
    }
}

impl DeviceRegion for SimulatedDevice {
    fn device_info(&self) -> Result<DeviceInfo, Error> {
        Ok(DeviceInfo {
            flags: DeviceFlags::RESET | DeviceFlags::PCI,
            num_regions: NUM_REGIONS,
            num_irqs: 5,
        })
    }

    fn region_info(&self, index: u32) -> Result<RegionInfo, Error> {
        if index >= NUM_REGIONS {
            return Err(Error::InvalidRegion(index));
        }
        Ok(self
            .regions
            .iter()
            .map(|r| r.info)
            .find(|r| r.index == index)
            .unwrap_or(RegionInfo {
                index,
                offset: u64::from(index) << REGION_OFFSET_SHIFT,
                ..Default::default()
            }))
    }

    fn mmap_region(&self, offset: u64, length: u64) -> Result<HostMapping, Error> {
        let (_, within) = self.locate(offset, length)?;
        let mut class = AlignmentClass::for_window(within, length);
        // A window starting at the region base may use the largest page its size fits.
        if within == 0 {
            class = class.max(AlignmentClass::for_size(length));
        }
        let builder = HostMappingBuilder::new(length as usize)
            .with_mmap_flags(libc::MAP_SHARED | libc::MAP_ANONYMOUS);
        self.place(builder, class.size(), within, length)
    }

    fn mmap_region_aligned(
        &self,
        offset: u64,
        length: u64,
        align: u64,
    ) -> Result<HostMapping, Error> {
        let (_, within) = self.locate(offset, length)?;
        let builder = HostMappingBuilder::new(length as usize)
            .with_mmap_prot(libc::PROT_READ)
            .with_mmap_flags(libc::MAP_SHARED | libc::MAP_ANONYMOUS)
            .with_hugepage_advice(true);
        self.place(builder, align, within, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use matches::assert_matches;

    const RW: DmaPermissions = DmaPermissions::READ.union(DmaPermissions::WRITE);

    #[test]
    fn test_map_unmap() {
        let iommu = SimulatedIommu::new();
        iommu.map(Iova(0), 0x1000, HostAddress(0x10_0000), RW).unwrap();
        assert!(iommu
            .map(Iova(0), 0x1000, HostAddress(0x10_0000), RW)
            .unwrap_err()
            .is_overlap());
        assert_eq!(iommu.translate(Iova(0x800)), Some(HostAddress(0x10_0800)));
        assert_eq!(iommu.permissions(Iova(0x800)), Some(RW));
        assert_eq!(iommu.mapped_bytes(), 0x1000);

        assert_eq!(iommu.unmap(Iova(0), 0x1000).unwrap(), 0x1000);
        assert_eq!(iommu.unmap(Iova(0), 0x1000).unwrap(), 0);
        assert_eq!(iommu.translate(Iova(0)), None);
        assert_eq!(iommu.permissions(Iova(0)), None);
        assert_eq!(iommu.map_calls(), 2);
        assert_eq!(iommu.unmap_calls(), 2);
    }

    #[test]
    fn test_invalid_requests() {
        let iommu = SimulatedIommu::new();
        for (iova, len) in [(0, 0), (0x800, 0x1000), (0, 0x1800), (u64::MAX - 0xfff, 0x2000)] {
            let e = iommu
                .map(Iova(iova), len, HostAddress(0x1000), RW)
                .unwrap_err();
            assert_eq!(e.errno(), Some(libc::EINVAL));
        }
        assert_eq!(
            iommu.unmap(Iova(0), 0).unwrap_err().errno(),
            Some(libc::EINVAL)
        );
        assert_eq!(
            iommu
                .map(Iova(0), 0x1000, HostAddress(0x1800), RW)
                .unwrap_err()
                .errno(),
            Some(libc::EINVAL)
        );
    }

    #[test]
    fn test_adjacent_mappings_stay_distinct() {
        let iommu = SimulatedIommu::new();
        iommu.map(Iova(0), 0x1000, HostAddress(0x10_0000), RW).unwrap();
        iommu.map(Iova(0x1000), 0x1000, HostAddress(0x10_1000), RW).unwrap();
        assert_eq!(iommu.unmap(Iova(0), 0x2000).unwrap(), 0x2000);
        assert_eq!(iommu.mapped_bytes(), 0);
    }

    #[test]
    fn test_superpage_coalescing() {
        let iommu = SimulatedIommu::new().with_superpage_coalescing(SIZE_2M);
        let size = 2 * SIZE_2M;
        iommu.map(Iova(0), size, HostAddress(0x4000_0000), RW).unwrap();

        let mut released = Vec::new();
        let mut iova = size;
        while iova > 0 {
            iova -= SIZE_4K;
            released.push(iommu.unmap(Iova(iova), SIZE_4K).unwrap());
        }
        let nonzero: Vec<u64> = released.iter().copied().filter(|r| *r != 0).collect();
        assert_eq!(nonzero, vec![SIZE_2M, SIZE_2M]);
        assert_eq!(released.iter().sum::<u64>(), size);
        assert_eq!(iommu.mapped_bytes(), 0);
    }

    #[test]
    fn test_coalescing_respects_mapping_bounds() {
        let iommu = SimulatedIommu::new().with_superpage_coalescing(SIZE_2M);
        // Two mappings sharing one frame: neither may be torn down by the other's unmap.
        iommu.map(Iova(0), 0x10_0000, HostAddress(0x4000_0000), RW).unwrap();
        iommu
            .map(Iova(0x10_0000), 0x10_0000, HostAddress(0x4010_0000), RW)
            .unwrap();
        assert_eq!(iommu.unmap(Iova(0), SIZE_4K).unwrap(), SIZE_4K);
        assert_eq!(iommu.mapped_bytes(), SIZE_2M - SIZE_4K);

        // Source not superpage aligned: no coalescing.
        let iommu = SimulatedIommu::new().with_superpage_coalescing(SIZE_2M);
        iommu.map(Iova(0), SIZE_2M, HostAddress(0x4000_1000), RW).unwrap();
        assert_eq!(iommu.unmap(Iova(0), SIZE_4K).unwrap(), SIZE_4K);
    }

    #[test]
    fn test_faults() {
        let iommu = SimulatedIommu::new().with_fault(Fault::AllowRemap);
        iommu.map(Iova(0), 0x1000, HostAddress(0x1000), RW).unwrap();
        iommu.map(Iova(0), 0x1000, HostAddress(0x2000), RW).unwrap();
        assert_eq!(iommu.translate(Iova(0)), Some(HostAddress(0x2000)));

        let iommu = SimulatedIommu::new().with_fault(Fault::OverReport);
        iommu.map(Iova(0), 0x1000, HostAddress(0x1000), RW).unwrap();
        assert_eq!(iommu.unmap(Iova(0), 0x1000).unwrap(), 0x2000);
        assert_eq!(iommu.unmap(Iova(0), 0x1000).unwrap(), 0);
    }

    #[test]
    fn test_device_regions() {
        let dev = SimulatedDevice::new()
            .with_bar(0, SIZE_2M)
            .with_region(2, 0x1000, RegionFlags::READ);
        let bars = dev.mappable_bars();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].offset, 0);
        assert_eq!(dev.region_info(1).unwrap().size, 0);
        assert_matches!(dev.region_info(9), Err(Error::InvalidRegion(9)));
        assert_eq!(dev.device_info().unwrap().num_regions, 9);

        let m = dev.mmap_region(0, SIZE_2M).unwrap();
        assert!(AlignmentClass::Huge2M.is_satisfied_by(m.host_address()));
        let m = dev.mmap_region(0x1000, 0x1000).unwrap();
        assert_eq!(m.size(), 0x1000);

        assert_matches!(dev.mmap_region(0, 2 * SIZE_2M), Err(Error::Mmap(_)));
        assert_matches!(
            dev.mmap_region(2 << REGION_OFFSET_SHIFT, 0x1000),
            Err(Error::Mmap(_))
        );
        assert_matches!(
            dev.mmap_region(3 << REGION_OFFSET_SHIFT, 0x1000),
            Err(Error::InvalidRegion(3))
        );
    }

    #[test]
    fn test_device_misplacement() {
        let dev = SimulatedDevice::new()
            .with_bar(0, SIZE_2M)
            .with_misplacement(Misplacement::All);
        let m = dev.mmap_region(0, SIZE_2M).unwrap();
        assert_eq!(m.host_address().trailing_zero_bits(), 12);

        let m = dev.mmap_region_aligned(0, SIZE_2M, SIZE_2M).unwrap();
        assert_eq!(m.prot(), libc::PROT_READ);
    }

    #[test]
    fn test_selective_misplacement() {
        let dev = SimulatedDevice::new()
            .with_bar(0, 4 * SIZE_2M)
            .with_misplacement(Misplacement::NonPowerOfTwo);
        let m = dev.mmap_region(0, SIZE_2M).unwrap();
        assert!(m.host_address().trailing_zero_bits() >= 21);
        let m = dev.mmap_region(0, 3 * SIZE_2M).unwrap();
        assert_eq!(m.host_address().trailing_zero_bits(), 12);

        let dev = SimulatedDevice::new()
            .with_bar(0, 4 * SIZE_2M)
            .with_misplacement(Misplacement::Offset);
        let m = dev.mmap_region(0, 3 * SIZE_2M).unwrap();
        assert!(m.host_address().trailing_zero_bits() >= 21);
        let m = dev.mmap_region(SIZE_2M, SIZE_2M).unwrap();
        assert_eq!(m.host_address().trailing_zero_bits(), 12);
    }

    #[test]
    fn test_full_region_sized_placement() {
        // Not a power of two, but large enough for 1G pages from the region base.
        let size = SIZE_1G + SIZE_2M;
        let dev = SimulatedDevice::new().with_bar(0, size);
        let m = dev.mmap_region(0, size).unwrap();
        assert!(AlignmentClass::Huge1G.is_satisfied_by(m.host_address()));
        assert_eq!(AlignmentClass::for_window(0, size), AlignmentClass::Huge2M);

        let m = dev.mmap_region(SIZE_2M, SIZE_1G).unwrap();
        assert!(AlignmentClass::Huge2M.is_satisfied_by(m.host_address()));
    }
}
