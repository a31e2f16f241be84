// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! In-process model of what a device's I/O virtual address space should contain.
//!
//! The [`ShadowTable`] holds non-overlapping [`MappingRecord`]s keyed by their base IOVA. It does
//! no I/O: the verifier feeds it every mapping the driver accepted and every release length the
//! driver reported, and the table answers whether those reports are consistent.
//!
//! Releases are accounted in one of two ways:
//! - exact: the driver released precisely the intersection of the request with untouched
//!   records. The covered part is carved out and the records are shrunk or split.
//! - credited: the driver released more (a huge page torn down around the request) or less (an
//!   earlier coalesced release already covered the request). The reported bytes are credited to
//!   the touched records in ascending order. A record disappears once it has been credited in
//!   full.

use std::cmp::{max, min};
use std::collections::BTreeMap;

use crate::address::{Address, HostAddress, Iova};
use crate::error::Violation;
use crate::iommu::DmaPermissions;

/// One binding the driver is believed to hold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MappingRecord {
    /// Base of the device visible range
    pub iova_start: Iova,
    /// Length of the range in bytes
    pub length: u64,
    /// Process memory backing the range
    pub source_address: HostAddress,
    /// Access granted to the device
    pub flags: DmaPermissions,
}

impl MappingRecord {
    /// Create a new record.
    pub fn new(
        iova_start: Iova,
        length: u64,
        source_address: HostAddress,
        flags: DmaPermissions,
    ) -> Self {
        MappingRecord {
            iova_start,
            length,
            source_address,
            flags,
        }
    }

    /// First IOVA past the record.
    pub fn end(&self) -> u64 {
        self.iova_start.0.saturating_add(self.length)
    }

    /// Whether the record intersects `[iova, iova + length)`.
    pub fn intersects(&self, iova: Iova, length: u64) -> bool {
        length > 0 && self.iova_start.0 < iova.0.saturating_add(length) && iova.0 < self.end()
    }

    // Sub-record covering `[start, end)`, which must lie inside this record.
    fn slice(&self, start: u64, end: u64) -> MappingRecord {
        let delta = start - self.iova_start.0;
        MappingRecord {
            iova_start: Iova(start),
            length: end - start,
            source_address: self.source_address.unchecked_add(delta),
            flags: self.flags,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Entry {
    record: MappingRecord,
    // Bytes already credited by coalesced releases; zero for untouched records.
    released: u64,
}

impl Entry {
    fn outstanding(&self) -> u64 {
        self.record.length - self.released
    }
}

/// How a release was accounted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Release {
    /// Nothing was mapped and nothing was released.
    Noop,
    /// The released bytes matched the request's intersection and were carved out.
    Exact,
    /// The released bytes were credited against the touched records.
    Credited,
}

/// Ordered collection of the bindings a device should currently hold.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShadowTable {
    entries: BTreeMap<u64, Entry>,
    mapped_total: u64,
    released_total: u64,
}

impl ShadowTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no record is active.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes inserted over the lifetime of the table.
    pub fn mapped_total(&self) -> u64 {
        self.mapped_total
    }

    /// Bytes released over the lifetime of the table.
    pub fn released_total(&self) -> u64 {
        self.released_total
    }

    /// Bytes still believed mapped.
    pub fn outstanding(&self) -> u64 {
        self.entries.values().map(Entry::outstanding).sum()
    }

    /// Iterate over the active records in ascending IOVA order.
    pub fn records(&self) -> impl Iterator<Item = &MappingRecord> {
        self.entries.values().map(|e| &e.record)
    }

    fn overlapping_keys(&self, iova: Iova, length: u64) -> Vec<u64> {
        if length == 0 {
            return Vec::new();
        }
        let end = iova.0.saturating_add(length);
        let mut keys: Vec<u64> = self
            .entries
            .range(..end)
            .rev()
            .take_while(|(_, e)| e.record.end() > iova.0)
            .map(|(k, _)| *k)
            .collect();
        keys.reverse();
        keys
    }

    /// Records intersecting `[iova, iova + length)`, in ascending order.
    pub fn overlapping(&self, iova: Iova, length: u64) -> Vec<&MappingRecord> {
        self.overlapping_keys(iova, length)
            .iter()
            .filter_map(|k| self.entries.get(k))
            .map(|e| &e.record)
            .collect()
    }

    /// Whether a mapping of `[iova, iova + length)` would intersect an active record.
    pub fn would_overlap(&self, iova: Iova, length: u64) -> bool {
        !self.overlapping_keys(iova, length).is_empty()
    }

    /// Bytes of `[iova, iova + length)` covered by active records.
    pub fn intersection(&self, iova: Iova, length: u64) -> u64 {
        let end = iova.0.saturating_add(length);
        self.overlapping(iova, length)
            .iter()
            .map(|r| min(r.end(), end) - max(r.iova_start.0, iova.0))
            .sum()
    }

    /// Insert a record for a mapping the driver accepted.
    pub fn insert(&mut self, record: MappingRecord) -> Result<(), Violation> {
        if record.length == 0 {
            return Ok(());
        }
        if let Some(existing) = self.overlapping(record.iova_start, record.length).first() {
            return Err(Violation::Overlap {
                iova: record.iova_start,
                length: record.length,
                existing_iova: existing.iova_start,
                existing_length: existing.length,
            });
        }
        self.mapped_total += record.length;
        self.entries.insert(
            record.iova_start.0,
            Entry {
                record,
                released: 0,
            },
        );
        Ok(())
    }

    /// Account for an unmap of `[iova, iova + length)` for which the driver reported `released`
    /// bytes.
    pub fn release(
        &mut self,
        iova: Iova,
        length: u64,
        released: u64,
    ) -> Result<Release, Violation> {
        let keys = self.overlapping_keys(iova, length);

        if keys.is_empty() {
            return if released == 0 {
                Ok(Release::Noop)
            } else {
                Err(Violation::PhantomRelease {
                    iova,
                    length,
                    released,
                })
            };
        }

        let touched: Vec<Entry> = keys
            .iter()
            .filter_map(|k| self.entries.get(k))
            .copied()
            .collect();
        let pristine = touched.iter().all(|e| e.released == 0);
        if pristine && released == self.intersection(iova, length) {
            self.carve(&keys, iova, length);
            self.released_total += released;
            return Ok(Release::Exact);
        }

        let outstanding: u64 = touched.iter().map(Entry::outstanding).sum();
        if released > outstanding {
            return Err(Violation::OverRelease {
                iova,
                length,
                released,
                outstanding,
            });
        }

        let mut credit = released;
        for key in keys {
            if credit == 0 {
                break;
            }
            if let Some(entry) = self.entries.get_mut(&key) {
                let take = min(credit, entry.outstanding());
                entry.released += take;
                credit -= take;
                if entry.outstanding() == 0 {
                    self.entries.remove(&key);
                }
            }
        }
        self.released_total += released;
        Ok(Release::Credited)
    }

    fn carve(&mut self, keys: &[u64], iova: Iova, length: u64) {
        let end = iova.0.saturating_add(length);
        for key in keys {
            let Some(entry) = self.entries.remove(key) else {
                continue;
            };
            let record = entry.record;
            if record.iova_start.0 < iova.0 {
                let head = record.slice(record.iova_start.0, iova.0);
                self.entries.insert(head.iova_start.0, Entry { record: head, released: 0 });
            }
            if record.end() > end {
                let tail = record.slice(end, record.end());
                self.entries.insert(tail.iova_start.0, Entry { record: tail, released: 0 });
            }
        }
    }

    /// Check that no two active records intersect.
    pub fn check_invariants(&self) -> Result<(), Violation> {
        let mut prev: Option<&MappingRecord> = None;
        for record in self.records() {
            if let Some(p) = prev {
                if p.end() > record.iova_start.0 {
                    return Err(Violation::Overlap {
                        iova: record.iova_start,
                        length: record.length,
                        existing_iova: p.iova_start,
                        existing_length: p.length,
                    });
                }
            }
            prev = Some(record);
        }
        Ok(())
    }

    /// Check that everything mapped has been released exactly once.
    pub fn check_round_trip(&self) -> Result<(), Violation> {
        if self.is_empty() && self.mapped_total == self.released_total {
            Ok(())
        } else {
            Err(Violation::ReleaseShortfall {
                mapped: self.mapped_total,
                released: self.released_total,
            })
        }
    }
}
