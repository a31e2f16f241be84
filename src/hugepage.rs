// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Observe how a driver reports small unmaps inside one large mapping.
//!
//! A huge page aware driver may tear down a whole superpage when asked to unmap one base page of
//! it, and then report zero for the remaining base pages of that superpage. The probe only holds
//! the driver to the total: every byte mapped is released exactly once. The distribution of the
//! individual reports is recorded for the operator.

use log::{debug, info};

use crate::address::{HostAddress, Iova};
use crate::align::SIZE_4K;
use crate::error::{Result, Violation};
use crate::iommu::AddressSpace;
use crate::pattern::{Chunk, PatternGenerator, PatternSpec, Strategy};
use crate::shadow::ShadowTable;
use crate::verifier::{MappingVerifier, ReleaseCheck};

/// What the stepped unmap observed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoalescingReport {
    /// Size of the mapped extent
    pub total: u64,
    /// Size of each unmap request
    pub step: u64,
    /// Reported length of every unmap call, in call order
    pub releases: Vec<u64>,
}

impl CoalescingReport {
    /// Number of unmap calls issued.
    pub fn calls(&self) -> usize {
        self.releases.len()
    }

    /// Number of calls that released something.
    pub fn nonzero(&self) -> usize {
        self.releases.iter().filter(|r| **r != 0).count()
    }

    /// Largest single release.
    pub fn largest(&self) -> u64 {
        self.releases.iter().copied().max().unwrap_or(0)
    }

    /// Sum of all releases.
    pub fn released(&self) -> u64 {
        self.releases.iter().sum()
    }

    /// Whether any call released more than it asked for.
    pub fn coalesced(&self) -> bool {
        self.largest() > self.step
    }
}

/// Maps an extent in one call and unmaps it in small steps.
#[derive(Debug)]
pub struct HugePageCoalescingProbe<A: AddressSpace> {
    verifier: MappingVerifier<A>,
    step: u64,
    traversal: Strategy,
}

impl<A: AddressSpace> HugePageCoalescingProbe<A> {
    /// Create a probe unmapping backward in 4 KiB steps.
    pub fn new(space: A) -> Self {
        HugePageCoalescingProbe {
            verifier: MappingVerifier::new(space),
            step: SIZE_4K,
            traversal: Strategy::Backward,
        }
    }

    /// Unmap in `step` sized requests.
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Unmap in the given order; only [`Strategy::Forward`] and [`Strategy::Backward`] cover the
    /// whole extent.
    pub fn with_traversal(mut self, traversal: Strategy) -> Self {
        self.traversal = traversal;
        self
    }

    /// Shadow state after the last run.
    pub fn shadow(&self) -> &ShadowTable {
        self.verifier.shadow()
    }

    /// Run the probe over `size` bytes of process memory at `source`, mapped at IOVA 0.
    pub fn run(&mut self, source: HostAddress, size: u64) -> Result<CoalescingReport> {
        let spec = PatternSpec::new(self.traversal, self.step, size)?;
        let whole = Chunk {
            index: 0,
            iova: Iova(0),
            length: size,
            source_address: source,
        };

        info!("Testing {:#x} mapping, {} unmap in {:#x} steps", size, self.traversal, self.step);
        self.verifier.map(&whole)?;
        self.verifier.expect_remap_rejected(whole.iova, size, source)?;
        // A single unmap of the whole extent must release it in full.
        self.verifier.unmap(whole.iova, size, ReleaseCheck::Exact)?;
        self.verifier.map(&whole)?;

        let mut report = CoalescingReport {
            total: size,
            step: self.step,
            releases: Vec::with_capacity(spec.visited() as usize),
        };
        for chunk in PatternGenerator::new(spec, source) {
            let released = self
                .verifier
                .unmap(chunk.iova, chunk.length, ReleaseCheck::Credited)?;
            if released != 0 {
                debug!("unmap {:#x}+{:#x} released {:#x}", chunk.iova.0, chunk.length, released);
            }
            report.releases.push(released);
        }

        if report.released() != size {
            return Err(Violation::ReleaseShortfall {
                mapped: size,
                released: report.released(),
            }
            .into());
        }
        self.verifier.finish()?;

        info!(
            "unmapped {:#x} in {} of {} calls, biggest {:#x}",
            report.released(),
            report.nonzero(),
            report.calls(),
            report.largest()
        );
        Ok(report)
    }
}
