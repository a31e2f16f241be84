// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Command line front end for the DMA mapping probes.
//!
//! Usage:
//!   dma-map-verify verify 0000:01:00.0 [/dev/hugepages]
//!   dma-map-verify hugepage 0000:01:00.0 [/dev/hugepages]
//!   dma-map-verify alignment 0000:01:00.0
//!   dma-map-verify race 0000:01:00.0
//!   dma-map-verify throughput 0000:01:00.0 4 [/dev/hugepages]
//!   dma-map-verify stress 0000:01:00.0
//!
//! Exit status is 0 when every check passed, 1 on an invariant violation and 2 when the probe
//! could not run. A device or IOMMU lacking a capability the probe needs exits with 77, the
//! status test harnesses treat as a skip.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use dma_map_verify::iommu::format_page_sizes;
use dma_map_verify::mmap::{page_size, statfs_page_size};
use dma_map_verify::stress::DEFAULT_WINDOWS;
use dma_map_verify::{
    attach, AddressSpace, AlignmentFuzzer, Error, HostMapping, HugePageCoalescingProbe,
    HugeTlbFile, InterleavedStress, MappingVerifier, ProbeConfig, RaceHarness, ReleaseMode,
    RunContext, Strategy, ThroughputProbe, VfioContainer, SIZE_1G, SIZE_2M,
};

#[derive(Parser, Debug)]
#[command(name = "dma-map-verify")]
#[command(about = "Check the VFIO DMA map/unmap interface of a passthrough device")]
#[command(version)]
struct Args {
    /// Log every map/unmap call
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forward, backward and checkerboard map/unmap sequences
    Verify {
        /// PCI device, ssss:bb:dd.f
        device: String,
        /// Directory on a hugetlbfs mount to source memory from
        mem_path: Option<PathBuf>,
    },
    /// Map one extent, then unmap it in base page steps
    Hugepage {
        /// PCI device, ssss:bb:dd.f
        device: String,
        /// Directory on a hugetlbfs mount to source memory from
        mem_path: Option<PathBuf>,
        /// Unmap lowest address first instead of highest
        #[arg(long)]
        forward: bool,
    },
    /// Check placement of mapped BAR windows
    Alignment {
        /// PCI device, ssss:bb:dd.f
        device: String,
        /// Iterations per sub-fuzzer
        #[arg(long)]
        iterations: Option<u64>,
        /// Seed for the random offsets and sizes
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Race huge page faults on freshly mapped BAR windows
    Race {
        /// PCI device, ssss:bb:dd.f
        device: String,
        /// Trials per page size
        #[arg(long)]
        trials: Option<u64>,
        /// Release workers through a spinning flag instead of a barrier
        #[arg(long)]
        spin: bool,
    },
    /// Time map/unmap of large extents
    Throughput {
        /// PCI device, ssss:bb:dd.f
        device: String,
        /// Extent size in GiB
        size_gb: u64,
        /// Directory on a hugetlbfs mount to source memory from
        hugetlb_path: Option<PathBuf>,
        /// Timed iterations per backing kind
        #[arg(long)]
        loops: Option<u32>,
    },
    /// Interleaved map/unmap over many 1 GiB windows
    Stress {
        /// PCI device, ssss:bb:dd.f
        device: String,
        /// Number of windows
        #[arg(long, default_value_t = DEFAULT_WINDOWS)]
        windows: u64,
    },
}

// Process memory the correctness probes map from, with the file keeping it alive if any.
struct Backing {
    mapping: HostMapping,
    size: u64,
    _file: Option<HugeTlbFile>,
}

fn backing(mem_path: Option<&Path>, default_size: u64) -> Result<Backing> {
    let Some(dir) = mem_path else {
        let mapping = HostMapping::new(default_size as usize)
            .context("failed to allocate memory")?;
        return Ok(Backing {
            mapping,
            size: default_size,
            _file: None,
        });
    };

    let pagesize = page_size();
    let (hugepagesize, _) = statfs_page_size(dir)?;
    info!(
        "Using {}K page size, {}K huge page size",
        pagesize >> 10,
        hugepagesize >> 10
    );
    let size = if hugepagesize == pagesize {
        default_size
    } else {
        hugepagesize
    };
    let file = HugeTlbFile::new_in(dir, size)
        .with_context(|| format!("failed to create backing file in {}", dir.display()))?;
    let mapping = file.map(size as usize, true)?;
    Ok(Backing {
        mapping,
        size,
        _file: Some(file),
    })
}

fn log_page_sizes(container: &VfioContainer) {
    match container.page_sizes() {
        Ok(bitmap) => info!("IOMMU page sizes: {}", format_page_sizes(bitmap)),
        Err(e) => info!("IOMMU page sizes unknown: {}", e),
    }
}

fn run(command: Command) -> Result<()> {
    let mut config = ProbeConfig::default();
    match command {
        Command::Verify { device, mem_path } => {
            let (container, _device) = attach(&device)?;
            log_page_sizes(&container);
            let memory = backing(mem_path.as_deref(), config.verify_extent)?;
            let source = memory.mapping.host_address();

            let mut verifier = MappingVerifier::new(&container);
            verifier
                .run_pagesize_suite(source, page_size(), memory.size)
                .context("pagesize test")?;
            verifier
                .run_pagesize_suite(source, memory.size, memory.size)
                .context("mapsize test")?;
            info!("[PASS]");
        }
        Command::Hugepage {
            device,
            mem_path,
            forward,
        } => {
            let (container, _device) = attach(&device)?;
            let memory = backing(mem_path.as_deref(), config.verify_extent)?;
            let traversal = if forward {
                Strategy::Forward
            } else {
                Strategy::Backward
            };
            HugePageCoalescingProbe::new(&container)
                .with_step(config.hugepage_step)
                .with_traversal(traversal)
                .run(memory.mapping.host_address(), memory.size)
                .context("hugepage test")?;
        }
        Command::Alignment {
            device,
            iterations,
            seed,
        } => {
            if let Some(iterations) = iterations {
                config = config.with_alignment_iterations(iterations);
            }
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            let (_container, device) = attach(&device)?;
            AlignmentFuzzer::new(&device, RunContext::new(config)).run()?;
        }
        Command::Race {
            device,
            trials,
            spin,
        } => {
            if let Some(trials) = trials {
                config = config.with_race_trials(trials);
            }
            let mode = if spin {
                ReleaseMode::Spin
            } else {
                ReleaseMode::Barrier
            };
            let (_container, device) = attach(&device)?;
            RaceHarness::new(&device, RunContext::new(config))
                .with_release_mode(mode)
                .run()?;
        }
        Command::Throughput {
            device,
            size_gb,
            hugetlb_path,
            loops,
        } => {
            if let Some(loops) = loops {
                config = config.with_throughput_loops(loops);
            }
            let size = size_gb
                .checked_mul(SIZE_1G)
                .context("extent size overflows")?;
            let (container, _device) = attach(&device)?;
            let kinds = ThroughputProbe::<&VfioContainer>::default_kinds(hugetlb_path);
            ThroughputProbe::new(&container, RunContext::new(config)).run_all(&kinds, size)?;
        }
        Command::Stress { device, windows } => {
            let (container, _device) = attach(&device)?;
            let memory = HostMapping::new(SIZE_1G as usize).context("failed to allocate memory")?;
            info!("Source memory at {:#x}", memory.host_address().0);
            InterleavedStress::new(&container, RunContext::new(config))
                .with_geometry(windows, SIZE_1G, SIZE_2M)
                .run(memory.host_address())?;
        }
    }
    Ok(())
}

const EXIT_VIOLATION: u8 = 1;
const EXIT_ENVIRONMENT: u8 = 2;
const EXIT_UNSUPPORTED: u8 = 77;

fn exit_code(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<Error>() {
        Some(e) if e.is_violation() => EXIT_VIOLATION,
        Some(e) if e.is_unsupported() => EXIT_UNSUPPORTED,
        _ => EXIT_ENVIRONMENT,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stdout)
        .init();

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            if code == EXIT_UNSUPPORTED {
                warn!("[SKIP] {:#}", e);
            } else {
                error!("{:#}", e);
            }
            ExitCode::from(code)
        }
    }
}
