// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Time large map/unmap operations over different kinds of backing memory.
//!
//! Every repetition allocates the backing memory, faults it in, maps it, unmaps it and releases
//! it, timing each phase with a monotonic clock. Only averages survive the run.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info, warn};

use crate::address::Iova;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::iommu::{AddressSpace, DmaPermissions, Operation};
use crate::mmap::{HostMapping, HostMappingBuilder, HugeTlbFile};

const NSEC_PER_SEC: f64 = 1_000_000_000.0;

/// Kind of process memory backing the timed mappings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackingKind {
    /// Anonymous private memory, no hints.
    Anonymous,
    /// Anonymous private memory advised for transparent huge pages.
    TransparentHuge,
    /// A file on the hugetlbfs mount at the given directory.
    HugeTlbFs(PathBuf),
    /// Anonymous shared memory faulted in by `mmap` itself.
    Populated,
}

impl fmt::Display for BackingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingKind::Anonymous => write!(f, "ANONYMOUS"),
            BackingKind::TransparentHuge => write!(f, "MADV_HUGEPAGE"),
            BackingKind::HugeTlbFs(_) => write!(f, "HUGETLBFS"),
            BackingKind::Populated => write!(f, "MAP_POPULATE"),
        }
    }
}

/// Timed phases of one repetition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    /// `mmap` of the backing memory.
    Allocate,
    /// Writing every page of the backing memory.
    Populate,
    /// The DMA map call.
    Map,
    /// The DMA unmap call.
    Unmap,
    /// `munmap` of the backing memory.
    Release,
}

impl Phase {
    const ALL: [Phase; 5] = [
        Phase::Allocate,
        Phase::Populate,
        Phase::Map,
        Phase::Unmap,
        Phase::Release,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Allocate => write!(f, "mmap"),
            Phase::Populate => write!(f, "mmap populated"),
            Phase::Map => write!(f, "VFIO MAP DMA"),
            Phase::Unmap => write!(f, "VFIO UNMAP DMA"),
            Phase::Release => write!(f, "munmap"),
        }
    }
}

/// One timed operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Measurement {
    /// Phase timed
    pub operation: Phase,
    /// Bytes the operation covered
    pub byte_count: u64,
    /// Wall time taken
    pub elapsed_ns: u64,
}

/// Accumulated timings of one phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhaseStats {
    /// Phase summarised
    pub phase: Phase,
    /// Number of measurements
    pub samples: u32,
    /// Sum of the measured times
    pub total_ns: u64,
    /// Sum of the bytes covered
    pub total_bytes: u64,
}

impl PhaseStats {
    fn new(phase: Phase) -> Self {
        PhaseStats {
            phase,
            samples: 0,
            total_ns: 0,
            total_bytes: 0,
        }
    }

    fn record(&mut self, m: &Measurement) {
        self.samples += 1;
        self.total_ns = self.total_ns.saturating_add(m.elapsed_ns);
        self.total_bytes = self.total_bytes.saturating_add(m.byte_count);
    }

    /// Mean time per measurement.
    pub fn mean_ns(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.total_ns / u64::from(self.samples)
        }
    }

    /// Throughput over all measurements, or `None` if nothing was timed.
    pub fn bytes_per_sec(&self) -> Option<f64> {
        if self.total_ns == 0 {
            None
        } else {
            Some(self.total_bytes as f64 * NSEC_PER_SEC / self.total_ns as f64)
        }
    }
}

/// Summary of one backing kind.
#[derive(Clone, Debug, PartialEq)]
pub struct ThroughputReport {
    /// Memory measured
    pub kind: BackingKind,
    /// Size of each mapping
    pub size: u64,
    /// Per phase summaries, for the phases that ran
    pub phases: Vec<PhaseStats>,
}

impl ThroughputReport {
    /// Summary of `phase`, if it ran.
    pub fn phase(&self, phase: Phase) -> Option<&PhaseStats> {
        self.phases.iter().find(|s| s.phase == phase && s.samples > 0)
    }
}

/// Times map/unmap of large extents.
#[derive(Debug)]
pub struct ThroughputProbe<A: AddressSpace> {
    space: A,
    ctx: RunContext,
}

fn timed<T, F: FnOnce() -> T>(phase: Phase, byte_count: u64, f: F) -> (T, Measurement) {
    let start = Instant::now();
    let value = f();
    let elapsed_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
    (
        value,
        Measurement {
            operation: phase,
            byte_count,
            elapsed_ns,
        },
    )
}

impl<A: AddressSpace> ThroughputProbe<A> {
    /// Create a probe issuing its mappings through `space`.
    pub fn new(space: A, ctx: RunContext) -> Self {
        ThroughputProbe { space, ctx }
    }

    /// The kinds measured by default: the hugetlbfs mount if one is given, otherwise transparent
    /// huge pages followed by pre-populated shared memory.
    pub fn default_kinds(mem_path: Option<PathBuf>) -> Vec<BackingKind> {
        match mem_path {
            Some(path) => vec![BackingKind::HugeTlbFs(path)],
            None => vec![BackingKind::TransparentHuge, BackingKind::Populated],
        }
    }

    /// Measure every kind in turn.
    pub fn run_all(&self, kinds: &[BackingKind], size: u64) -> Result<Vec<ThroughputReport>> {
        kinds.iter().map(|kind| self.run(kind, size)).collect()
    }

    /// Measure `kind` with mappings of `size` bytes.
    pub fn run(&self, kind: &BackingKind, size: u64) -> Result<ThroughputReport> {
        let config = self.ctx.config();
        let iova = Iova(config.throughput_iova);
        let len = size as usize;
        let hugetlb = match kind {
            BackingKind::HugeTlbFs(dir) => {
                let file = HugeTlbFile::new_in(dir, size)?;
                info!(
                    "Using {}MB huge page size on {}",
                    file.page_size() >> 20,
                    dir.display()
                );
                Some(file)
            }
            _ => None,
        };

        let mut stats = Phase::ALL.map(PhaseStats::new);
        let mut record = |i: u32, m: Measurement| {
            debug!(
                "{}: {} in {:.3}s",
                i,
                m.operation,
                m.elapsed_ns as f64 / NSEC_PER_SEC
            );
            if let Some(s) = stats.iter_mut().find(|s| s.phase == m.operation) {
                s.record(&m);
            }
        };

        for i in 0..config.throughput_loops {
            if self.ctx.should_stop() {
                break;
            }

            let (mapping, m) = timed(Phase::Allocate, size, || {
                allocate(kind, hugetlb.as_ref(), len)
            });
            let mut mapping = mapping?;
            record(i, m);

            if *kind != BackingKind::Populated {
                let ((), m) = timed(Phase::Populate, size, || mapping.populate(0));
                record(i, m);
            }

            let access = DmaPermissions::READ | DmaPermissions::WRITE;
            let (r, m) = timed(Phase::Map, size, || {
                self.space.map(iova, size, mapping.host_address(), access)
            });
            r.map_err(|source| Error::Driver {
                op: Operation::Map,
                iova,
                length: size,
                source,
            })?;
            record(i, m);

            let (r, m) = timed(Phase::Unmap, size, || self.space.unmap(iova, size));
            let released = r.map_err(|source| Error::Driver {
                op: Operation::Unmap,
                iova,
                length: size,
                source,
            })?;
            if released != size {
                warn!("unmap released {:#x} of {:#x}", released, size);
            }
            record(i, m);

            let ((), m) = timed(Phase::Release, size, || drop(mapping));
            record(i, m);
        }

        let report = ThroughputReport {
            kind: kind.clone(),
            size,
            phases: stats.to_vec(),
        };
        info!("------- AVERAGE ({}) --------", kind);
        for phase in [Phase::Map, Phase::Unmap] {
            if let Some(s) = report.phase(phase) {
                info!(
                    "{} in {:.3} s ({:.1} GB/s)",
                    phase,
                    s.mean_ns() as f64 / NSEC_PER_SEC,
                    s.bytes_per_sec().unwrap_or(0.0) / f64::from(1u32 << 30)
                );
            }
        }
        Ok(report)
    }
}

fn allocate(
    kind: &BackingKind,
    hugetlb: Option<&HugeTlbFile>,
    len: usize,
) -> Result<HostMapping> {
    let mapping = match (kind, hugetlb) {
        (BackingKind::HugeTlbFs(_), Some(file)) => file.map(len, false)?,
        (BackingKind::TransparentHuge, _) => HostMappingBuilder::new(len)
            .with_hugepage_advice(true)
            .build()?,
        (BackingKind::Populated, _) => HostMappingBuilder::new(len)
            .with_mmap_flags(libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_POPULATE)
            .build()?,
        _ => HostMapping::new(len)?,
    };
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::SIZE_2M;
    use crate::context::ProbeConfig;
    use crate::sim::SimulatedIommu;
    use matches::assert_matches;

    fn ctx(loops: u32) -> RunContext {
        RunContext::new(ProbeConfig::default().with_throughput_loops(loops))
    }

    #[test]
    fn test_phase_stats() {
        let mut s = PhaseStats::new(Phase::Map);
        assert_eq!(s.mean_ns(), 0);
        assert_eq!(s.bytes_per_sec(), None);
        for elapsed_ns in [1_000_000_000, 3_000_000_000] {
            s.record(&Measurement {
                operation: Phase::Map,
                byte_count: 1 << 30,
                elapsed_ns,
            });
        }
        assert_eq!(s.mean_ns(), 2_000_000_000);
        assert_eq!(s.bytes_per_sec(), Some((1u64 << 29) as f64));
    }

    #[test]
    fn test_anonymous_kinds() {
        let iommu = SimulatedIommu::new();
        let probe = ThroughputProbe::new(&iommu, ctx(3));
        let kinds = [
            BackingKind::Anonymous,
            BackingKind::TransparentHuge,
            BackingKind::Populated,
        ];
        let reports = probe.run_all(&kinds, 2 * SIZE_2M).unwrap();
        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert_eq!(report.phase(Phase::Map).unwrap().samples, 3);
            assert_eq!(report.phase(Phase::Unmap).unwrap().total_bytes, 6 * SIZE_2M);
            assert_eq!(report.phase(Phase::Release).unwrap().samples, 3);
        }
        assert!(reports[2].phase(Phase::Populate).is_none());
        assert_eq!(iommu.map_calls(), 9);
        assert_eq!(iommu.mapped_bytes(), 0);
    }

    #[test]
    fn test_file_backed() {
        let probe = ThroughputProbe::new(SimulatedIommu::new(), ctx(2));
        let kinds = ThroughputProbe::<SimulatedIommu>::default_kinds(Some(std::env::temp_dir()));
        let reports = probe.run_all(&kinds, SIZE_2M).unwrap();
        assert_eq!(reports[0].kind, BackingKind::HugeTlbFs(std::env::temp_dir()));
        assert_eq!(reports[0].phase(Phase::Populate).unwrap().samples, 2);
    }

    #[test]
    fn test_map_failure_surfaces() {
        let iommu = SimulatedIommu::new();
        // Unaligned lengths are refused with EINVAL.
        let probe = ThroughputProbe::new(&iommu, ctx(1));
        assert_matches!(
            probe.run(&BackingKind::Anonymous, 0x1800),
            Err(Error::Driver {
                op: Operation::Map,
                ..
            })
        );
    }
}
