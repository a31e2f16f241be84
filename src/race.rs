// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Provoke concurrent huge page faults on a freshly mapped device window.
//!
//! Each trial maps one huge page worth of a BAR, then releases two threads at once; one reads the
//! first base page of the window and the other the last. On a driver whose fault path does not
//! serialise huge page insertion, the two faults race. Nothing is asserted here: a broken driver
//! shows up as a crash, a hang or kernel log noise, all of which must be observed from outside.

use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

use log::{error, info};

use crate::address::{Address, HostAddress};
use crate::align::SIZE_4K;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::iommu;
use crate::mmap::HostMapping;
use crate::region::{DeviceFlags, DeviceRegion, RegionInfo, ROM_REGION_INDEX};

/// Lowest region count a vfio-pci device reports (BAR0 to BAR5).
const MIN_PCI_REGIONS: u32 = 5;

/// How the two workers of a trial are released.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReleaseMode {
    /// Both workers busy-poll a shared flag.
    Spin,
    /// Both workers block on a barrier shared with the releasing thread.
    #[default]
    Barrier,
}

/// Lifecycle of a trial.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrialState {
    /// Created, no worker running.
    Idle,
    /// Both workers reached their wait point and are waiting for release.
    ArmedWaiting,
    /// Workers released.
    Released,
    /// Both workers finished.
    Joined,
}

/// One release of two readers against one mapping.
///
/// The trial borrows the mapping it reads from, so the mapping cannot go away first:
///
/// ```compile_fail
/// # use dma_map_verify::{HostMapping, RaceTrial, ReleaseMode};
/// let mapping = HostMapping::new(0x20_0000).unwrap();
/// let mut trial = RaceTrial::new(&mapping);
/// drop(mapping);
/// trial.run(ReleaseMode::Barrier);
/// ```
#[derive(Debug)]
pub struct RaceTrial<'a> {
    shared_mapping_base: HostAddress,
    probe_offset_a: u64,
    probe_offset_b: u64,
    release_flag: AtomicBool,
    barrier: Barrier,
    armed: AtomicUsize,
    state: TrialState,
    _mapping: PhantomData<&'a HostMapping>,
}

impl<'a> RaceTrial<'a> {
    /// Create a trial reading the last and the first base page of `mapping`.
    pub fn new(mapping: &'a HostMapping) -> Self {
        let last = (mapping.size() as u64).saturating_sub(SIZE_4K);
        RaceTrial {
            shared_mapping_base: mapping.host_address(),
            probe_offset_a: last,
            probe_offset_b: 0,
            release_flag: AtomicBool::new(false),
            // Two workers plus the releasing thread.
            barrier: Barrier::new(3),
            armed: AtomicUsize::new(0),
            state: TrialState::Idle,
            _mapping: PhantomData,
        }
    }

    /// Current state.
    pub fn state(&self) -> TrialState {
        self.state
    }

    /// Offsets read by the two workers.
    pub fn probe_offsets(&self) -> (u64, u64) {
        (self.probe_offset_a, self.probe_offset_b)
    }

    /// Workers that reached their wait point in the last run.
    pub fn armed_workers(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }

    /// Run the trial to completion.
    pub fn run(&mut self, mode: ReleaseMode) {
        self.armed.store(0, Ordering::Release);
        self.release_flag.store(false, Ordering::Release);
        let gate = Gate {
            flag: &self.release_flag,
            barrier: &self.barrier,
            armed: &self.armed,
        };
        let a = self.shared_mapping_base.unchecked_add(self.probe_offset_a).0;
        let b = self.shared_mapping_base.unchecked_add(self.probe_offset_b).0;
        let state = &mut self.state;

        thread::scope(|s| {
            let first = s.spawn(move || touch(a, mode, gate));
            let second = s.spawn(move || touch(b, mode, gate));
            while gate.armed.load(Ordering::Acquire) < 2 {
                hint::spin_loop();
            }
            *state = TrialState::ArmedWaiting;

            match mode {
                ReleaseMode::Spin => gate.flag.store(true, Ordering::Release),
                ReleaseMode::Barrier => {
                    gate.barrier.wait();
                }
            }
            *state = TrialState::Released;

            for worker in [first, second] {
                if worker.join().is_err() {
                    error!("race worker panicked");
                }
            }
        });
        self.state = TrialState::Joined;
    }
}

// Release primitives shared by the workers of one trial.
#[derive(Clone, Copy)]
struct Gate<'t> {
    flag: &'t AtomicBool,
    barrier: &'t Barrier,
    armed: &'t AtomicUsize,
}

fn touch(address: u64, mode: ReleaseMode, gate: Gate<'_>) {
    gate.armed.fetch_add(1, Ordering::AcqRel);
    match mode {
        ReleaseMode::Spin => {
            while !gate.flag.load(Ordering::Acquire) {
                hint::spin_loop();
            }
        }
        ReleaseMode::Barrier => {
            gate.barrier.wait();
        }
    }
    // SAFETY: The trial borrows its mapping for its whole lifetime and the workers finish inside
    // `run`, so the mapping is still readable here. `address` is an aligned word inside it.
    unsafe { std::ptr::read_volatile(address as *const u64) };
}

/// Trials run for one page size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaceReport {
    /// Size of each trial mapping
    pub page_size: u64,
    /// BAR the trials mapped
    pub region: u32,
    /// Trials completed
    pub trials: u64,
}

/// Runs race trials against a device's BARs, one batch per configured page size.
#[derive(Debug)]
pub struct RaceHarness<D: DeviceRegion> {
    device: D,
    ctx: RunContext,
    mode: ReleaseMode,
}

impl<D: DeviceRegion> RaceHarness<D> {
    /// Create a harness using barrier release.
    pub fn new(device: D, ctx: RunContext) -> Self {
        RaceHarness {
            device,
            ctx,
            mode: ReleaseMode::default(),
        }
    }

    /// Release workers the given way.
    pub fn with_release_mode(mut self, mode: ReleaseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run every configured page size.
    pub fn run(&self) -> Result<Vec<RaceReport>> {
        let info = self.device.device_info()?;
        if !info.flags.contains(DeviceFlags::PCI) || info.num_regions < MIN_PCI_REGIONS {
            return Err(iommu::Error::Unsupported("vfio-pci device with BARs").into());
        }

        info!("Running tests, if progress stops or the system logs errors, the test has failed");
        let mut reports = Vec::new();
        for &page_size in &self.ctx.config().race_page_sizes {
            let region = self.find_region(page_size)?;
            info!(
                "Using BAR{} (size {}MB) for {}MB page size test",
                region.index,
                region.size >> 20,
                page_size >> 20
            );
            reports.push(self.run_trials(&region, page_size)?);
        }
        info!("Check dmesg, if there are any VM_FAULT_OOM messages, the test has failed");
        Ok(reports)
    }

    fn find_region(&self, page_size: u64) -> Result<RegionInfo> {
        for index in 0..ROM_REGION_INDEX {
            let region = self.device.region_info(index)?;
            if region.is_mappable() && region.size >= page_size {
                return Ok(region);
            }
        }
        Err(Error::NoSuitableRegion { page_size })
    }

    /// Run the configured number of trials against `page_size` bytes at the start of `region`.
    pub fn run_trials(&self, region: &RegionInfo, page_size: u64) -> Result<RaceReport> {
        let config = self.ctx.config();
        let mut trials = 0;
        while trials < config.race_trials && !self.ctx.should_stop() {
            let mapping = self
                .device
                .mmap_region_aligned(region.offset, page_size, page_size)?;
            let mut trial = RaceTrial::new(&mapping);
            trial.run(self.mode);
            drop(mapping);

            trials += 1;
            if config.race_progress != 0 && trials % config.race_progress == 0 {
                info!("{} of {} trials", trials, config.race_trials);
            }
        }
        info!("[DONE] {} trials", trials);
        Ok(RaceReport {
            page_size,
            region: region.index,
            trials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::SIZE_2M;
    use crate::context::ProbeConfig;
    use crate::region::RegionFlags;
    use crate::sim::SimulatedDevice;
    use matches::assert_matches;

    fn ctx(trials: u64, sizes: Vec<u64>) -> RunContext {
        RunContext::new(
            ProbeConfig::default()
                .with_race_trials(trials)
                .with_race_page_sizes(sizes),
        )
    }

    #[test]
    fn test_trial_lifecycle() {
        let mapping = HostMapping::new(SIZE_2M as usize).unwrap();
        for mode in [ReleaseMode::Spin, ReleaseMode::Barrier] {
            let mut trial = RaceTrial::new(&mapping);
            assert_eq!(trial.state(), TrialState::Idle);
            assert_eq!(trial.probe_offsets(), (SIZE_2M - SIZE_4K, 0));
            trial.run(mode);
            assert_eq!(trial.state(), TrialState::Joined);
            assert_eq!(trial.armed_workers(), 2);

            // A trial can be rerun against the same mapping.
            trial.run(mode);
            assert_eq!(trial.state(), TrialState::Joined);
            assert_eq!(trial.armed_workers(), 2);
        }
    }

    #[test]
    fn test_harness_runs_trials() {
        let dev = SimulatedDevice::new()
            .with_region(0, SIZE_4K, RegionFlags::READ | RegionFlags::MMAP)
            .with_bar(2, 2 * SIZE_2M);
        for mode in [ReleaseMode::Spin, ReleaseMode::Barrier] {
            let harness = RaceHarness::new(&dev, ctx(50, vec![SIZE_2M])).with_release_mode(mode);
            let reports = harness.run().unwrap();
            assert_eq!(
                reports,
                vec![RaceReport {
                    page_size: SIZE_2M,
                    region: 2,
                    trials: 50
                }]
            );
        }
    }

    #[test]
    fn test_no_suitable_region() {
        let dev = SimulatedDevice::new().with_bar(0, SIZE_2M);
        let harness = RaceHarness::new(&dev, ctx(1, vec![SIZE_2M, 1 << 30]));
        assert_matches!(
            harness.run(),
            Err(Error::NoSuitableRegion { page_size: 0x4000_0000 })
        );
    }

    #[test]
    fn test_stop_flag() {
        let dev = SimulatedDevice::new().with_bar(0, SIZE_2M);
        let ctx = ctx(1_000_000, vec![SIZE_2M]);
        ctx.request_stop();
        let reports = RaceHarness::new(&dev, ctx).run().unwrap();
        assert_eq!(reports[0].trials, 0);
    }
}
