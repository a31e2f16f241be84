// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Drive map/unmap traffic through an [`AddressSpace`] and check it against a [`ShadowTable`].
//!
//! The verifier never short-circuits a call because of what the shadow table predicts: every
//! request reaches the driver, and the driver's decision is then compared with the prediction.
//! This is what makes a remap attempt a test of the driver's overlap check rather than of the
//! table's.

use log::{debug, info};

use crate::address::{HostAddress, Iova};
use crate::error::{Error, Result, Violation};
use crate::iommu::{self, AddressSpace, DmaPermissions, Operation};
use crate::pattern::{Chunk, PatternGenerator, PatternSpec, Strategy};
use crate::shadow::{MappingRecord, ShadowTable};

/// Result of one map request.
#[derive(Debug)]
pub enum MapOutcome {
    /// The driver installed the mapping.
    Accepted,
    /// The driver refused the mapping as overlapping, as the shadow table predicted.
    RejectedOverlap,
    /// The driver failed for another reason.
    DriverError(iommu::Error),
}

/// Result of one unmap request.
#[derive(Debug)]
pub enum UnmapOutcome {
    /// The driver released this many bytes.
    Released(u64),
    /// The driver failed.
    DriverError(iommu::Error),
}

/// How the lengths reported by a sequence of unmaps are checked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReleaseCheck {
    /// Each call must release exactly the mapped part of its request.
    Exact,
    /// Calls may release more or less; only the running total is checked.
    Credited,
}

/// Checks one address space against its shadow state.
#[derive(Debug)]
pub struct MappingVerifier<A: AddressSpace> {
    space: A,
    shadow: ShadowTable,
    access: DmaPermissions,
}

impl<A: AddressSpace> MappingVerifier<A> {
    /// Create a verifier with an empty shadow table, mapping read/write.
    pub fn new(space: A) -> Self {
        MappingVerifier {
            space,
            shadow: ShadowTable::new(),
            access: DmaPermissions::READ | DmaPermissions::WRITE,
        }
    }

    /// Use `access` for the mappings issued by the pattern helpers.
    pub fn with_permissions(mut self, access: DmaPermissions) -> Self {
        self.access = access;
        self
    }

    /// The address space under test.
    pub fn space(&self) -> &A {
        &self.space
    }

    /// The current shadow state.
    pub fn shadow(&self) -> &ShadowTable {
        &self.shadow
    }

    /// Issue a map and compare the driver's decision with the shadow table's prediction.
    pub fn apply_map(&mut self, record: MappingRecord) -> Result<MapOutcome> {
        if record.length == 0 {
            return Err(Error::EmptyRequest {
                iova: record.iova_start,
            });
        }
        let predicted_overlap = self
            .shadow
            .would_overlap(record.iova_start, record.length);

        match self.space.map(
            record.iova_start,
            record.length,
            record.source_address,
            record.flags,
        ) {
            Ok(()) if predicted_overlap => Err(Violation::RemapAllowed {
                iova: record.iova_start,
                length: record.length,
            }
            .into()),
            Ok(()) => {
                self.shadow.insert(record)?;
                Ok(MapOutcome::Accepted)
            }
            Err(e) if e.is_overlap() && predicted_overlap => Ok(MapOutcome::RejectedOverlap),
            Err(e) if e.is_overlap() => Err(Violation::UnexpectedReject {
                iova: record.iova_start,
                length: record.length,
            }
            .into()),
            Err(e) => Ok(MapOutcome::DriverError(e)),
        }
    }

    /// Issue an unmap and account the reported length in the shadow table.
    pub fn apply_unmap(&mut self, iova: Iova, length: u64) -> Result<UnmapOutcome> {
        match self.space.unmap(iova, length) {
            Ok(released) => {
                self.shadow.release(iova, length, released)?;
                Ok(UnmapOutcome::Released(released))
            }
            Err(e) => Ok(UnmapOutcome::DriverError(e)),
        }
    }

    fn record(&self, chunk: &Chunk) -> MappingRecord {
        MappingRecord::new(chunk.iova, chunk.length, chunk.source_address, self.access)
    }

    /// Map `chunk`, which must not overlap anything.
    pub fn map(&mut self, chunk: &Chunk) -> Result<()> {
        let record = self.record(chunk);
        match self.apply_map(record)? {
            MapOutcome::Accepted => Ok(()),
            MapOutcome::RejectedOverlap => Err(driver_error(
                Operation::Map,
                chunk.iova,
                chunk.length,
                iommu::Error::control(Operation::Map, chunk.iova, chunk.length, libc::EEXIST),
            )),
            MapOutcome::DriverError(e) => {
                Err(driver_error(Operation::Map, chunk.iova, chunk.length, e))
            }
        }
    }

    /// Unmap `[iova, iova + length)` and return the reported length.
    ///
    /// With [`ReleaseCheck::Exact`] the report must equal the mapped part of the request.
    pub fn unmap(&mut self, iova: Iova, length: u64, check: ReleaseCheck) -> Result<u64> {
        let expected = self.shadow.intersection(iova, length);
        match self.apply_unmap(iova, length)? {
            UnmapOutcome::Released(released) => {
                if check == ReleaseCheck::Exact && released != expected {
                    return Err(Violation::ReleaseMismatch {
                        iova,
                        length,
                        expected,
                        released,
                    }
                    .into());
                }
                Ok(released)
            }
            UnmapOutcome::DriverError(e) => Err(driver_error(Operation::Unmap, iova, length, e)),
        }
    }

    /// Map every chunk of a traversal. Returns the number of chunks mapped.
    pub fn map_pattern<I: IntoIterator<Item = Chunk>>(&mut self, chunks: I) -> Result<u64> {
        let mut count = 0;
        for chunk in chunks {
            self.map(&chunk)?;
            count += 1;
        }
        Ok(count)
    }

    /// Unmap every chunk of a traversal. Returns the total reported length.
    pub fn unmap_pattern<I: IntoIterator<Item = Chunk>>(
        &mut self,
        chunks: I,
        check: ReleaseCheck,
    ) -> Result<u64> {
        let mut total = 0;
        for chunk in chunks {
            total += self.unmap(chunk.iova, chunk.length, check)?;
        }
        Ok(total)
    }

    /// Try to map over an active range and require the driver to refuse.
    pub fn expect_remap_rejected(
        &mut self,
        iova: Iova,
        length: u64,
        source: HostAddress,
    ) -> Result<()> {
        let record = MappingRecord::new(iova, length, source, self.access);
        match self.apply_map(record)? {
            MapOutcome::RejectedOverlap => Ok(()),
            // Nothing was mapped there and the driver rightly accepted.
            MapOutcome::Accepted => Err(Error::NotMapped { iova, length }),
            MapOutcome::DriverError(e) => Err(driver_error(Operation::Map, iova, length, e)),
        }
    }

    /// Unmap a range that should already be empty and require a zero-length release.
    pub fn expect_unmap_noop(&mut self, iova: Iova, length: u64) -> Result<()> {
        match self.apply_unmap(iova, length)? {
            UnmapOutcome::Released(0) => Ok(()),
            UnmapOutcome::Released(released) => Err(Violation::ReleaseMismatch {
                iova,
                length,
                expected: 0,
                released,
            }
            .into()),
            UnmapOutcome::DriverError(e) => Err(driver_error(Operation::Unmap, iova, length, e)),
        }
    }

    /// Check that the shadow table is consistent and that everything mapped so far has been
    /// released exactly once.
    pub fn finish(&self) -> Result<()> {
        self.shadow.check_invariants()?;
        self.shadow.check_round_trip()?;
        Ok(())
    }

    /// Run the full page size sequence over `extent` bytes sourced from `source`, in `chunk`
    /// steps:
    /// forward map, remap rejection, forward unmap, re-unmap, backward map and unmap,
    /// checkerboard even and odd map and unmap, and backward checkerboards.
    pub fn run_pagesize_suite(
        &mut self,
        source: HostAddress,
        chunk: u64,
        extent: u64,
    ) -> Result<()> {
        let spec = PatternSpec::new(Strategy::Forward, chunk, extent)?;
        let walk = |strategy: Strategy| -> Result<PatternGenerator> {
            Ok(PatternGenerator::new(spec.with_strategy(strategy)?, source))
        };
        info!("Testing {:#x} pagesize over {:#x} bytes", chunk, extent);

        self.map_pattern(walk(Strategy::Forward)?)?;
        debug!("forward map done");
        for c in walk(Strategy::Forward)? {
            self.expect_remap_rejected(c.iova, c.length, c.source_address)?;
        }
        debug!("remap rejected");
        self.unmap_pattern(walk(Strategy::Forward)?, ReleaseCheck::Exact)?;
        for c in walk(Strategy::Forward)? {
            self.expect_unmap_noop(c.iova, c.length)?;
        }
        self.finish()?;
        info!("  forward map/unmap PASS");

        self.map_pattern(walk(Strategy::Backward)?)?;
        self.unmap_pattern(walk(Strategy::Backward)?, ReleaseCheck::Exact)?;
        self.finish()?;
        info!("  backward map/unmap PASS");

        self.map_pattern(walk(Strategy::CheckerboardEven)?)?;
        self.map_pattern(walk(Strategy::CheckerboardOdd)?)?;
        self.unmap_pattern(walk(Strategy::CheckerboardEven)?, ReleaseCheck::Exact)?;
        self.unmap_pattern(walk(Strategy::CheckerboardOdd)?, ReleaseCheck::Exact)?;
        self.finish()?;
        info!("  checkerboard map/unmap PASS");

        // Last chunk first, every other one, then the ones in between.
        let n = spec.chunk_count();
        let passes: Vec<Strategy> = (1..=2)
            .filter(|back| n >= *back)
            .map(|back| Strategy::Strided {
                stride: 2,
                phase: (n - back) % 2,
            })
            .collect();
        for strategy in &passes {
            self.map_pattern(walk(*strategy)?.rev())?;
        }
        for strategy in &passes {
            self.unmap_pattern(walk(*strategy)?.rev(), ReleaseCheck::Exact)?;
        }
        self.finish()?;
        info!("  backward checkerboard map/unmap PASS");

        Ok(())
    }
}

fn driver_error(op: Operation, iova: Iova, length: u64, source: iommu::Error) -> Error {
    Error::Driver {
        op,
        iova,
        length,
        source,
    }
}
