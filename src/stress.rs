// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Fragment a large IOVA space with interleaved maps and unmaps.
//!
//! The same block of process memory is mapped into many windows, each window split into chunks
//! mapped out of order, so that the IOMMU page tables end up densely populated and then
//! punctured. Every third window is left empty. Tearing down goes through a different order than
//! setting up, and finishes with one unmap per window covering whatever is still mapped there.

use log::{debug, info};

use crate::address::{HostAddress, Iova};
use crate::align::{SIZE_1G, SIZE_2M};
use crate::context::RunContext;
use crate::error::Result;
use crate::iommu::AddressSpace;
use crate::pattern::{self, PatternGenerator, PatternSpec, Strategy};
use crate::shadow::ShadowTable;
use crate::verifier::{MappingVerifier, ReleaseCheck};

/// Number of windows laid out by default.
pub const DEFAULT_WINDOWS: u64 = 1024;

/// Order in which chunk residues (mod 4) of a window are mapped.
const MAP_RESIDUES: [u64; 4] = [0, 1, 3, 2];

/// What a stress run did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StressReport {
    /// Windows that received mappings
    pub windows: u64,
    /// Chunks mapped
    pub chunks: u64,
    /// Bytes released by the per-chunk unmaps
    pub punched: u64,
    /// Bytes released by the per-window remainder unmaps
    pub swept: u64,
}

/// Interleaved map/unmap stress over many IOVA windows.
#[derive(Debug)]
pub struct InterleavedStress<A: AddressSpace> {
    verifier: MappingVerifier<A>,
    ctx: RunContext,
    windows: u64,
    window_size: u64,
    chunk: u64,
}

impl<A: AddressSpace> InterleavedStress<A> {
    /// Create a stress run of 1024 windows of 1 GiB in 2 MiB chunks.
    pub fn new(space: A, ctx: RunContext) -> Self {
        InterleavedStress {
            verifier: MappingVerifier::new(space),
            ctx,
            windows: DEFAULT_WINDOWS,
            window_size: SIZE_1G,
            chunk: SIZE_2M,
        }
    }

    /// Use `windows` windows of `window_size` bytes, mapped in `chunk` sized pieces.
    pub fn with_geometry(mut self, windows: u64, window_size: u64, chunk: u64) -> Self {
        self.windows = windows;
        self.window_size = window_size;
        self.chunk = chunk;
        self
    }

    /// Size of the process memory every window is sourced from.
    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Shadow state after the last run.
    pub fn shadow(&self) -> &ShadowTable {
        self.verifier.shadow()
    }

    /// Run over `window_size` bytes of process memory at `source`.
    pub fn run(&mut self, source: HostAddress) -> Result<StressReport> {
        let spec = PatternSpec::new(Strategy::Forward, self.chunk, self.window_size)?;
        // The first half must hold a whole number of chunks.
        PatternSpec::new(Strategy::Forward, self.chunk, self.window_size / 2)?;
        let half = spec.chunk_count() / 2;

        let mut report = StressReport::default();
        info!(
            "Mapping {} windows of {:#x} in {:#x} chunks",
            self.windows, self.window_size, self.chunk
        );
        for i in self.used_windows() {
            if self.ctx.should_stop() {
                return Ok(report);
            }
            let base = self.window_base(i)?;
            for phase in MAP_RESIDUES {
                let walk = PatternGenerator::new(
                    spec.with_strategy(Strategy::Strided { stride: 4, phase })?,
                    source,
                )
                .with_iova_base(base)?;
                report.chunks += self.verifier.map_pattern(walk)?;
            }
            report.windows += 1;
            self.progress("map", i);
        }

        info!("Unmapping");
        for i in self.used_windows() {
            if self.ctx.should_stop() {
                return Ok(report);
            }
            let base = self.window_base(i)?;
            let even = spec.with_strategy(Strategy::CheckerboardEven)?;
            let first = PatternGenerator::new(even, source)
                .with_iova_base(base)?
                .take_while(|c| c.index < half);
            report.punched += self.verifier.unmap_pattern(first, ReleaseCheck::Exact)?;

            let odd = spec.with_strategy(Strategy::CheckerboardOdd)?;
            let second = PatternGenerator::new(odd, source)
                .with_iova_base(base)?
                .rev()
                .take_while(|c| c.index > half);
            report.punched += self.verifier.unmap_pattern(second, ReleaseCheck::Exact)?;
            self.progress("unmap", i);
        }

        for i in self.used_windows() {
            let base = self.window_base(i)?;
            let remaining = self.verifier.shadow().intersection(base, self.window_size);
            let released = self
                .verifier
                .unmap(base, self.window_size, ReleaseCheck::Exact)?;
            debug!("window {} released {:#x} of {:#x}", i, released, remaining);
            report.swept += released;
        }
        self.verifier.finish()?;

        info!(
            "[PASS] {} chunks in {} windows, {:#x} punched, {:#x} swept",
            report.chunks, report.windows, report.punched, report.swept
        );
        Ok(report)
    }

    fn used_windows(&self) -> impl Iterator<Item = u64> {
        (0..self.windows).filter(|i| i % 3 != 0)
    }

    fn window_base(&self, window: u64) -> std::result::Result<Iova, pattern::Error> {
        window
            .checked_mul(self.window_size)
            .map(Iova)
            .ok_or(pattern::Error::Overflow {
                base: Iova(window),
                total: self.window_size,
            })
    }

    fn progress(&self, what: &str, window: u64) {
        let before = window * 100 / self.windows;
        let after = (window + 1) * 100 / self.windows;
        if after / 10 != before / 10 {
            info!("{} {}%", what, after);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::SIZE_4K;
    use crate::error::{Error, Violation};
    use crate::sim::{Fault, SimulatedIommu};
    use matches::assert_matches;

    const SOURCE: HostAddress = HostAddress(0x7f00_0000_0000);

    #[test]
    fn test_interleaved_round_trip() {
        let iommu = SimulatedIommu::new();
        let mut stress = InterleavedStress::new(&iommu, RunContext::default())
            .with_geometry(7, 16 * SIZE_4K, SIZE_4K);
        let report = stress.run(SOURCE).unwrap();

        // Windows 1, 2, 4 and 5 are used.
        assert_eq!(report.windows, 4);
        assert_eq!(report.chunks, 4 * 16);
        // Even chunks 0..8 and odd chunks 15..9 in each window.
        assert_eq!(report.punched, 4 * 8 * SIZE_4K);
        assert_eq!(report.punched + report.swept, 4 * 16 * SIZE_4K);
        assert!(stress.shadow().is_empty());
        assert_eq!(iommu.mapped_bytes(), 0);
        assert_eq!(iommu.map_calls(), 64);
    }

    #[test]
    fn test_window_left_empty() {
        let iommu = SimulatedIommu::new();
        let mut stress = InterleavedStress::new(&iommu, RunContext::default())
            .with_geometry(1, 8 * SIZE_4K, SIZE_4K);
        let report = stress.run(SOURCE).unwrap();
        assert_eq!(report, StressReport::default());
        assert_eq!(iommu.map_calls(), 0);
    }

    #[test]
    fn test_odd_chunk_count_rejected() {
        let mut stress = InterleavedStress::new(SimulatedIommu::new(), RunContext::default())
            .with_geometry(3, 3 * SIZE_4K, SIZE_4K);
        assert_matches!(stress.run(SOURCE), Err(Error::InvalidPattern(_)));
    }

    #[test]
    fn test_over_report_detected() {
        // The release is checked against the shadow before its length.
        let iommu = SimulatedIommu::new().with_fault(Fault::OverReport);
        let mut stress = InterleavedStress::new(&iommu, RunContext::default())
            .with_geometry(2, 4 * SIZE_4K, SIZE_4K);
        assert_matches!(
            stress.run(SOURCE),
            Err(Error::Violation(Violation::OverRelease { .. }))
        );
    }

    #[test]
    fn test_stop_flag() {
        let ctx = RunContext::default();
        ctx.request_stop();
        let mut stress =
            InterleavedStress::new(SimulatedIommu::new(), ctx).with_geometry(4, SIZE_2M, SIZE_4K);
        assert_eq!(stress.run(SOURCE).unwrap().chunks, 0);
    }
}
