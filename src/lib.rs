// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Probes for checking the DMA map/unmap interface of a passthrough device.
//!
//! A device attached through VFIO exposes two things a driver bug can break silently: the IOMMU
//! address space its DMA goes through, and the device windows (BARs) mapped into the process.
//! This crate drives both through deterministic traversals and checks every result against an
//! in-process model of what the driver should have done. The probes are:
//! - [`MappingVerifier`]: forward, backward and checkerboard map/unmap sequences;
//! - [`HugePageCoalescingProbe`]: one large map followed by many small unmaps;
//! - [`InterleavedStress`]: interleaved maps and unmaps spread over a large IOVA space;
//! - [`AlignmentFuzzer`]: placement of device windows for huge page faults;
//! - [`RaceHarness`]: concurrent faults on freshly mapped device windows;
//! - [`ThroughputProbe`]: map/unmap timing over differently backed memory.
//!
//! Every probe works against the [`AddressSpace`] and [`DeviceRegion`] traits, implemented by
//! [`vfio`] for real devices and by [`sim`] in memory.

#![deny(clippy::doc_markdown)]
#![deny(missing_docs)]

pub mod address;
pub use address::{Address, HostAddress, Iova};

pub mod align;
pub use align::{AlignmentClass, SIZE_1G, SIZE_2M, SIZE_4K};

pub mod context;
pub use context::{ProbeConfig, RunContext};

pub mod error;
pub use error::{Error, Result, Violation};

pub mod fuzzer;
pub use fuzzer::{AlignmentFuzzer, FuzzReport, SubFuzzer, SubReport};

pub mod hugepage;
pub use hugepage::{CoalescingReport, HugePageCoalescingProbe};

pub mod iommu;
pub use iommu::{AddressSpace, DmaPermissions, Operation};

pub mod mmap;
pub use mmap::{FileOffset, HostMapping, HostMappingBuilder, HugeTlbFile};

pub mod pattern;
pub use pattern::{Chunk, PatternGenerator, PatternSpec, Strategy};

pub mod race;
pub use race::{RaceHarness, RaceReport, RaceTrial, ReleaseMode, TrialState};

pub mod region;
pub use region::{DeviceFlags, DeviceInfo, DeviceRegion, RegionFlags, RegionInfo};

pub mod shadow;
pub use shadow::{MappingRecord, Release, ShadowTable};

pub mod sim;
pub use sim::{Fault, Misplacement, SimulatedDevice, SimulatedIommu};

pub mod stress;
pub use stress::{InterleavedStress, StressReport};

pub mod throughput;
pub use throughput::{BackingKind, Phase, PhaseStats, ThroughputProbe, ThroughputReport};

pub mod verifier;
pub use verifier::{MapOutcome, MappingVerifier, ReleaseCheck, UnmapOutcome};

pub mod vfio;
pub use vfio::{attach, PciAddress, VfioContainer, VfioDevice};
