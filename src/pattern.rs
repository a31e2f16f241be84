// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Deterministic traversal orders over a mapped extent.
//!
//! A [`PatternSpec`] splits `[0, total_size)` into `chunk_size` chunks; a [`PatternGenerator`]
//! yields the chunks selected by its [`Strategy`] as (IOVA, length, source address)
//! triples. The generator is double ended, so the backward variant of any strategy is simply
//! `generator.rev()`.

use std::fmt;

use crate::address::{Address, HostAddress, Iova};

/// Errors in traversal parameters.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The chunk size is zero.
    #[error("chunk size is zero")]
    ZeroChunk,
    /// The total size is not a multiple of the chunk size.
    #[error("total size {total:#x} is not a multiple of chunk size {chunk:#x}")]
    PartialChunk {
        /// Requested total size
        total: u64,
        /// Requested chunk size
        chunk: u64,
    },
    /// A strided strategy has a zero stride or a phase outside the stride.
    #[error("invalid stride {stride} with phase {phase}")]
    InvalidStride {
        /// Stride in chunks
        stride: u64,
        /// Phase in chunks
        phase: u64,
    },
    /// The extent does not fit in the 64 bit IOVA space.
    #[error("extent of {total:#x} bytes at {:#x} overflows", base.0)]
    Overflow {
        /// Base IOVA of the extent
        base: Iova,
        /// Size of the extent
        total: u64,
    },
}

/// Order in which the chunks of an extent are visited.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Strategy {
    /// Ascending IOVA order.
    Forward,
    /// Descending IOVA order, last chunk first.
    Backward,
    /// Chunks 0, 2, 4, ...
    CheckerboardEven,
    /// Chunks 1, 3, 5, ...
    CheckerboardOdd,
    /// Chunks `phase`, `phase + stride`, ... (both counted in chunks).
    Strided {
        /// Distance between visited chunks
        stride: u64,
        /// Index of the first visited chunk
        phase: u64,
    },
}

impl Strategy {
    // (stride, phase, descending)
    fn walk(self) -> (u64, u64, bool) {
        match self {
            Strategy::Forward => (1, 0, false),
            Strategy::Backward => (1, 0, true),
            Strategy::CheckerboardEven => (2, 0, false),
            Strategy::CheckerboardOdd => (2, 1, false),
            Strategy::Strided { stride, phase } => (stride, phase, false),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Forward => write!(f, "forward"),
            Strategy::Backward => write!(f, "backward"),
            Strategy::CheckerboardEven => write!(f, "checkerboard even"),
            Strategy::CheckerboardOdd => write!(f, "checkerboard odd"),
            Strategy::Strided { stride, phase } => write!(f, "stride {} phase {}", stride, phase),
        }
    }
}

/// Immutable description of one traversal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PatternSpec {
    strategy: Strategy,
    chunk_size: u64,
    total_size: u64,
}

impl PatternSpec {
    /// Create a traversal of `total_size` bytes in `chunk_size` steps.
    pub fn new(strategy: Strategy, chunk_size: u64, total_size: u64) -> Result<Self, Error> {
        if chunk_size == 0 {
            return Err(Error::ZeroChunk);
        }
        if total_size % chunk_size != 0 {
            return Err(Error::PartialChunk {
                total: total_size,
                chunk: chunk_size,
            });
        }
        if let Strategy::Strided { stride, phase } = strategy {
            if stride == 0 || phase >= stride {
                return Err(Error::InvalidStride { stride, phase });
            }
        }
        Ok(PatternSpec {
            strategy,
            chunk_size,
            total_size,
        })
    }

    /// Traversal order.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Size of each step.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Size of the whole extent.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of chunks the extent splits into.
    pub fn chunk_count(&self) -> u64 {
        self.total_size / self.chunk_size
    }

    /// Number of chunks the strategy visits.
    pub fn visited(&self) -> u64 {
        let (stride, phase, _) = self.strategy.walk();
        let n = self.chunk_count();
        if phase >= n {
            0
        } else {
            (n - phase).div_ceil(stride)
        }
    }

    /// Same extent with a different order.
    pub fn with_strategy(&self, strategy: Strategy) -> Result<Self, Error> {
        Self::new(strategy, self.chunk_size, self.total_size)
    }
}

/// One step of a traversal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// Position of the chunk within the extent
    pub index: u64,
    /// Device visible base of the chunk
    pub iova: Iova,
    /// Length of the chunk
    pub length: u64,
    /// Process memory backing the chunk
    pub source_address: HostAddress,
}

/// Restartable iterator over the chunks selected by a [`PatternSpec`].
#[derive(Clone, Debug)]
pub struct PatternGenerator {
    spec: PatternSpec,
    iova_base: Iova,
    source_base: HostAddress,
    front: u64,
    back: u64,
}

impl PatternGenerator {
    /// Traverse the extent starting at IOVA 0, sourced from process memory at `source_base`.
    pub fn new(spec: PatternSpec, source_base: HostAddress) -> Self {
        PatternGenerator {
            spec,
            iova_base: Iova(0),
            source_base,
            front: 0,
            back: spec.visited(),
        }
    }

    /// Place the extent at `iova_base` instead of 0.
    pub fn with_iova_base(mut self, iova_base: Iova) -> Result<Self, Error> {
        iova_base
            .checked_add(self.spec.total_size)
            .ok_or(Error::Overflow {
                base: iova_base,
                total: self.spec.total_size,
            })?;
        self.iova_base = iova_base;
        Ok(self)
    }

    /// The traversal being generated.
    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    /// Rewind to the first chunk.
    pub fn restart(&mut self) {
        self.front = 0;
        self.back = self.spec.visited();
    }

    fn chunk_at(&self, position: u64) -> Chunk {
        let (stride, phase, descending) = self.spec.strategy.walk();
        let index = if descending {
            self.spec.chunk_count() - 1 - position
        } else {
            phase + position * stride
        };
        let offset = index * self.spec.chunk_size;
        Chunk {
            index,
            iova: self.iova_base.unchecked_add(offset),
            length: self.spec.chunk_size,
            source_address: self.source_base.unchecked_add(offset),
        }
    }
}

impl Iterator for PatternGenerator {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.front >= self.back {
            return None;
        }
        let chunk = self.chunk_at(self.front);
        self.front += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.back - self.front) as usize;
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for PatternGenerator {
    fn next_back(&mut self) -> Option<Chunk> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.chunk_at(self.back))
    }
}

impl ExactSizeIterator for PatternGenerator {}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(spec: PatternSpec) -> Vec<u64> {
        PatternGenerator::new(spec, HostAddress(0)).map(|c| c.index).collect()
    }

    #[test]
    fn test_spec_validation() {
        assert_eq!(
            PatternSpec::new(Strategy::Forward, 0, 0x1000),
            Err(Error::ZeroChunk)
        );
        assert_eq!(
            PatternSpec::new(Strategy::Forward, 0x1000, 0x1800),
            Err(Error::PartialChunk {
                total: 0x1800,
                chunk: 0x1000
            })
        );
        assert_eq!(
            PatternSpec::new(Strategy::Strided { stride: 2, phase: 2 }, 0x1000, 0x4000),
            Err(Error::InvalidStride {
                stride: 2,
                phase: 2
            })
        );
        let spec = PatternSpec::new(Strategy::Forward, 0x1000, 0).unwrap();
        assert_eq!(indices(spec), Vec::<u64>::new());
    }

    #[test]
    fn test_strategies() {
        let spec = PatternSpec::new(Strategy::Forward, 0x1000, 0x5000).unwrap();
        assert_eq!(indices(spec), vec![0, 1, 2, 3, 4]);
        assert_eq!(
            indices(spec.with_strategy(Strategy::Backward).unwrap()),
            vec![4, 3, 2, 1, 0]
        );
        assert_eq!(
            indices(spec.with_strategy(Strategy::CheckerboardEven).unwrap()),
            vec![0, 2, 4]
        );
        assert_eq!(
            indices(spec.with_strategy(Strategy::CheckerboardOdd).unwrap()),
            vec![1, 3]
        );
        assert_eq!(
            indices(spec.with_strategy(Strategy::Strided { stride: 3, phase: 1 }).unwrap()),
            vec![1, 4]
        );
    }

    #[test]
    fn test_checkerboards_cover_extent() {
        let spec = PatternSpec::new(Strategy::CheckerboardEven, 0x1000, 0x7000).unwrap();
        let odd = spec.with_strategy(Strategy::CheckerboardOdd).unwrap();
        let mut all: Vec<u64> = indices(spec).into_iter().chain(indices(odd)).collect();
        all.sort_unstable();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_double_ended() {
        let spec = PatternSpec::new(Strategy::CheckerboardEven, 0x1000, 0x6000).unwrap();
        let gen = PatternGenerator::new(spec, HostAddress(0x10_0000));
        assert_eq!(gen.len(), 3);
        let rev: Vec<u64> = gen.clone().rev().map(|c| c.index).collect();
        assert_eq!(rev, vec![4, 2, 0]);

        let mut gen = gen;
        assert_eq!(gen.next().map(|c| c.index), Some(0));
        assert_eq!(gen.next_back().map(|c| c.index), Some(4));
        assert_eq!(gen.len(), 1);
        assert_eq!(gen.next().map(|c| c.index), Some(2));
        assert_eq!(gen.next_back(), None);
    }

    #[test]
    fn test_addresses_and_restart() {
        let spec = PatternSpec::new(Strategy::Backward, 0x1000, 0x3000).unwrap();
        let mut gen = PatternGenerator::new(spec, HostAddress(0x7f00_0000_0000))
            .with_iova_base(Iova(0x1_0000_0000))
            .unwrap();
        let first = gen.next().unwrap();
        assert_eq!(
            first,
            Chunk {
                index: 2,
                iova: Iova(0x1_0000_2000),
                length: 0x1000,
                source_address: HostAddress(0x7f00_0000_2000),
            }
        );
        let rest: Vec<_> = gen.by_ref().collect();
        assert_eq!(rest.len(), 2);
        gen.restart();
        assert_eq!(gen.next(), Some(first));

        assert_eq!(
            PatternGenerator::new(spec, HostAddress(0))
                .with_iova_base(Iova(u64::MAX - 0x1000))
                .map(|_| ()),
            Err(Error::Overflow {
                base: Iova(u64::MAX - 0x1000),
                total: 0x3000
            })
        );
    }

    #[test]
    fn test_deterministic() {
        let spec = PatternSpec::new(Strategy::CheckerboardOdd, 0x20_0000, 0x4000_0000).unwrap();
        let a: Vec<_> = PatternGenerator::new(spec, HostAddress(0x1000)).collect();
        let b: Vec<_> = PatternGenerator::new(spec, HostAddress(0x1000)).collect();
        assert_eq!(a, b);
        assert_eq!(a.len() as u64, spec.visited());
    }
}
