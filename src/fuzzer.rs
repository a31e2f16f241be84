// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Check that device windows are mapped at addresses aligned for huge page faults.
//!
//! For every mappable BAR three independent loops run:
//! - the full region, repeatedly, which must come back aligned to the class its size allows;
//! - a random page offset with the rest of the region, aligned to the class of `offset | size`;
//! - a random size from offset zero, aligned to the class its size allows. Misses here are only
//!   logged, since the kernel is free to fall back for sizes that are not a power of two.

use std::fmt;

use log::{info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::address::{Address, HostAddress};
use crate::align::{AlignmentClass, SIZE_4K};
use crate::context::RunContext;
use crate::error::{Error, Result, Violation};
use crate::region::{DeviceRegion, RegionInfo};

/// The three loops run per region.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SubFuzzer {
    /// Whole region at offset zero.
    FullRegion,
    /// Random page offset up to the end of the region.
    RandomOffset,
    /// Random size from offset zero.
    RandomSize,
}

impl fmt::Display for SubFuzzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubFuzzer::FullRegion => write!(f, "minimum alignment"),
            SubFuzzer::RandomOffset => write!(f, "random offset"),
            SubFuzzer::RandomSize => write!(f, "random size"),
        }
    }
}

/// Outcome of one loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubReport {
    /// Which loop
    pub kind: SubFuzzer,
    /// Windows mapped
    pub iterations: u64,
    /// Windows placed below their required alignment (logged-only loops)
    pub failures: u64,
    /// Bitwise OR of every returned address
    pub mask: u64,
}

impl SubReport {
    fn new(kind: SubFuzzer) -> Self {
        SubReport {
            kind,
            iterations: 0,
            failures: 0,
            mask: 0,
        }
    }

    /// Weakest alignment order observed, in bits.
    pub fn min_alignment(&self) -> u32 {
        self.mask.trailing_zeros()
    }
}

/// Outcome of fuzzing one region.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FuzzReport {
    /// The region fuzzed
    pub region: RegionInfo,
    /// One report per loop run, in run order
    pub loops: Vec<SubReport>,
}

/// Maps pseudo-random windows of a device's BARs and checks their placement.
#[derive(Debug)]
pub struct AlignmentFuzzer<D: DeviceRegion> {
    device: D,
    ctx: RunContext,
    rng: ChaCha8Rng,
}

impl<D: DeviceRegion> AlignmentFuzzer<D> {
    /// Create a fuzzer seeded from the context's configuration.
    pub fn new(device: D, ctx: RunContext) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(ctx.config().seed);
        AlignmentFuzzer { device, ctx, rng }
    }

    /// Fuzz every mappable BAR of the device.
    pub fn run(&mut self) -> Result<Vec<FuzzReport>> {
        let info = self.device.device_info()?;
        info!(
            "Device supports {} regions, {} irqs",
            info.num_regions, info.num_irqs
        );

        let mut reports = Vec::new();
        for region in self.device.mappable_bars() {
            info!(
                "[BAR{}]: size {:#x}, order {}, offset {:#x}, flags {:#x}",
                region.index,
                region.size,
                region.size.trailing_zeros(),
                region.offset,
                region.flags.bits()
            );
            if region.size < SIZE_4K {
                info!("Skipped");
                continue;
            }
            reports.push(self.run_region(&region)?);
            if self.ctx.should_stop() {
                break;
            }
        }
        Ok(reports)
    }

    /// Run the three loops against one region.
    pub fn run_region(&mut self, region: &RegionInfo) -> Result<FuzzReport> {
        let required = AlignmentClass::for_size(region.size);
        info!(
            "Testing BAR{}, require at least {} bit alignment",
            region.index,
            required.bits()
        );

        let mut loops = Vec::with_capacity(3);
        let full = self.full_region(region, required)?;
        info!("[PASS] Minimum alignment {}", full.min_alignment());
        loops.push(full);

        if region.pages() > 1 {
            loops.push(self.random_offset(region)?);
            info!("[PASS] Random offset");
            let sizes = self.random_size(region)?;
            info!("[PASS] Random size ({} misplaced)", sizes.failures);
            loops.push(sizes);
        }

        Ok(FuzzReport {
            region: *region,
            loops,
        })
    }

    fn iterations(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.ctx.config().alignment_iterations).take_while(|_| !self.ctx.should_stop())
    }

    // Map `[offset, offset + size)` of the region and return the trailing zero bits of its base.
    fn probe(&self, region: &RegionInfo, offset: u64, size: u64) -> Result<(u64, u32)> {
        let mapping = self.device.mmap_region(region.offset + offset, size)?;
        let address = mapping.host_address();
        Ok((address.0, address.trailing_zero_bits()))
    }

    fn full_region(&self, region: &RegionInfo, required: AlignmentClass) -> Result<SubReport> {
        let mut report = SubReport::new(SubFuzzer::FullRegion);
        for _ in self.iterations() {
            let (address, bits) = self.probe(region, 0, region.size)?;
            if bits < required.bits() {
                return Err(misaligned(0, region.size, address, required, bits));
            }
            report.mask |= address;
            report.iterations += 1;
        }
        Ok(report)
    }

    fn random_offset(&mut self, region: &RegionInfo) -> Result<SubReport> {
        let mut report = SubReport::new(SubFuzzer::RandomOffset);
        let pages = region.pages();
        let total = self.ctx.config().alignment_iterations;
        for _ in 0..total {
            if self.ctx.should_stop() {
                break;
            }
            let offset = self.rng.random_range(0..pages) * SIZE_4K;
            let size = region.size - offset;
            let required = AlignmentClass::for_window(offset, size);

            let (address, bits) = self.probe(region, offset, size)?;
            if bits < required.bits() {
                return Err(misaligned(offset, size, address, required, bits));
            }
            report.mask |= address;
            report.iterations += 1;
        }
        Ok(report)
    }

    fn random_size(&mut self, region: &RegionInfo) -> Result<SubReport> {
        let mut report = SubReport::new(SubFuzzer::RandomSize);
        let pages = region.pages();
        let total = self.ctx.config().alignment_iterations;
        for _ in 0..total {
            if self.ctx.should_stop() {
                break;
            }
            let size = region.size - self.rng.random_range(0..pages) * SIZE_4K;
            let required = AlignmentClass::for_size(size);

            let (address, bits) = self.probe(region, 0, size)?;
            if bits < required.bits() {
                warn!(
                    "Failed random size, got order {} want {} size {:#x} ({:#x})",
                    bits,
                    required.bits(),
                    size,
                    address
                );
                report.failures += 1;
            }
            report.mask |= address;
            report.iterations += 1;
        }
        Ok(report)
    }
}

fn misaligned(
    offset: u64,
    size: u64,
    address: u64,
    required: AlignmentClass,
    actual_bits: u32,
) -> Error {
    Violation::Misaligned {
        offset,
        size,
        address: HostAddress(address),
        required,
        actual_bits,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::SIZE_2M;
    use crate::context::ProbeConfig;
    use crate::sim::{Misplacement, SimulatedDevice};
    use matches::assert_matches;

    fn ctx(iterations: u64) -> RunContext {
        RunContext::new(ProbeConfig::default().with_alignment_iterations(iterations))
    }

    #[test]
    fn test_full_region_aligned() {
        let dev = SimulatedDevice::new().with_bar(0, SIZE_2M);
        let mut fuzzer = AlignmentFuzzer::new(&dev, ctx(200));
        let reports = fuzzer.run().unwrap();

        assert_eq!(reports.len(), 1);
        let loops = &reports[0].loops;
        assert_eq!(loops.len(), 3);
        assert_eq!(loops[0].kind, SubFuzzer::FullRegion);
        assert_eq!(loops[0].iterations, 200);
        assert!(loops[0].min_alignment() >= 21);
        assert_eq!(loops[2].failures, 0);
    }

    #[test]
    fn test_misalignment_detected() {
        let dev = SimulatedDevice::new()
            .with_bar(2, SIZE_2M)
            .with_misplacement(Misplacement::All);
        let mut fuzzer = AlignmentFuzzer::new(&dev, ctx(10));
        let e = fuzzer.run().unwrap_err();
        assert!(e.is_violation());
        assert_matches!(
            e,
            Error::Violation(Violation::Misaligned {
                offset: 0,
                size: 0x20_0000,
                required: AlignmentClass::Huge2M,
                actual_bits: 12,
                ..
            })
        );
    }

    #[test]
    fn test_random_size_misses_only_logged() {
        let dev = SimulatedDevice::new()
            .with_bar(0, 2 * SIZE_2M)
            .with_misplacement(Misplacement::NonPowerOfTwo);
        let mut fuzzer = AlignmentFuzzer::new(&dev, ctx(100));
        let reports = fuzzer.run().unwrap();

        let loops = &reports[0].loops;
        assert_eq!(loops.len(), 3);
        assert_eq!(loops[0].failures, 0);
        assert_eq!(loops[1].kind, SubFuzzer::RandomOffset);
        assert_eq!(loops[1].iterations, 100);
        // Sizes from 2M up that are not a power of two need 2M alignment and are misplaced.
        let sizes = loops[2];
        assert_eq!(sizes.kind, SubFuzzer::RandomSize);
        assert_eq!(sizes.iterations, 100);
        assert!(sizes.failures > 0);
        assert!(sizes.failures < sizes.iterations);
        assert_eq!(sizes.min_alignment(), 12);
    }

    #[test]
    fn test_random_offset_misplacement_aborts() {
        // Only offset 2M with size 2M requires more than base page alignment.
        let dev = SimulatedDevice::new()
            .with_bar(0, 2 * SIZE_2M)
            .with_misplacement(Misplacement::Offset);
        let region = dev.region_info(0).unwrap();
        let mut fuzzer = AlignmentFuzzer::new(&dev, ctx(100_000));
        assert_matches!(
            fuzzer.random_offset(&region),
            Err(Error::Violation(Violation::Misaligned {
                offset: 0x20_0000,
                size: 0x20_0000,
                required: AlignmentClass::Huge2M,
                actual_bits: 12,
                ..
            }))
        );
    }

    #[test]
    fn test_small_region() {
        // A single page only gets the full region loop.
        let dev = SimulatedDevice::new().with_bar(1, SIZE_4K);
        let mut fuzzer = AlignmentFuzzer::new(&dev, ctx(5));
        let reports = fuzzer.run().unwrap();
        assert_eq!(reports[0].loops.len(), 1);
        assert_eq!(reports[0].region.index, 1);
    }

    #[test]
    fn test_stop_flag() {
        let dev = SimulatedDevice::new().with_bar(0, SIZE_2M);
        let ctx = ctx(1_000_000);
        ctx.request_stop();
        let mut fuzzer = AlignmentFuzzer::new(&dev, ctx);
        let reports = fuzzer.run().unwrap();
        assert!(reports[0].loops.iter().all(|l| l.iterations == 0));
    }

    #[test]
    fn test_deterministic_seed() {
        let dev = SimulatedDevice::new().with_bar(0, 4 * SIZE_2M);
        let a = AlignmentFuzzer::new(&dev, ctx(50)).run().unwrap();
        let b = AlignmentFuzzer::new(&dev, ctx(50)).run().unwrap();
        assert_eq!(a[0].loops.len(), b[0].loops.len());
        assert_eq!(a[0].loops[2].failures, b[0].loops[2].failures);
    }
}
