// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Helper structures for the process memory that backs DMA mappings and device windows.
//!
//! [`HostMapping`] owns an `mmap`ed range and releases it on drop. It is built through
//! [`HostMappingBuilder`], which covers every backing flavour the probes need: anonymous private
//! memory, anonymous memory with a transparent huge page hint, pre-populated shared memory,
//! hugetlbfs file backed memory, and device file windows placed at a chosen alignment.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::null_mut;
use std::result;
use std::sync::Arc;

use log::debug;
use vmm_sys_util::tempfile::TempFile;

use crate::address::HostAddress;
use crate::align::{align_up, AlignmentError};

const HUGETLBFS_MAGIC: u64 = 0x9584_58f6;

/// Error conditions that may arise when creating a new `HostMapping` object.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The specified file offset and length cause overflow when added.
    #[error("The specified file offset and length cause overflow when added")]
    InvalidOffsetLength,
    /// The forbidden `MAP_FIXED` flag was specified.
    #[error("The forbidden `MAP_FIXED` flag was specified")]
    MapFixed,
    /// The requested placement alignment is unusable.
    #[error("Invalid mapping alignment: {0}")]
    Alignment(#[from] AlignmentError),
    /// The `mmap` call returned an error.
    #[error("{0}")]
    Mmap(io::Error),
    /// The `madvise` call returned an error.
    #[error("madvise failed: {0}")]
    Madvise(io::Error),
    /// Querying the filesystem backing a memory path failed.
    #[error("Can't statfs on {path}: {source}")]
    Statfs {
        /// Path that was queried
        path: String,
        /// Underlying error
        source: io::Error,
    },
    /// Creating or sizing the backing file failed.
    #[error("Backing file error: {0}")]
    BackingFile(io::Error),
}

/// Result of host mapping operations.
pub type Result<T> = result::Result<T, Error>;

/// Returns the base page size of the running system.
pub fn page_size() -> u64 {
    // SAFETY: Safe because this call just returns the page size and doesn't have any side
    // effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Represents the start point within a `File` that backs a `HostMapping`.
#[derive(Clone, Debug)]
pub struct FileOffset {
    file: Arc<File>,
    start: u64,
}

impl FileOffset {
    /// Creates a new `FileOffset` object.
    pub fn new(file: File, start: u64) -> Self {
        FileOffset::from_arc(Arc::new(file), start)
    }

    /// Creates a new `FileOffset` object based on an exiting `Arc<File>`.
    pub fn from_arc(file: Arc<File>, start: u64) -> Self {
        FileOffset { file, start }
    }

    /// Returns a reference to the inner `File` object.
    pub fn file(&self) -> &File {
        self.file.as_ref()
    }

    /// Return the start offset within the file.
    pub fn start(&self) -> u64 {
        self.start
    }
}

/// A factory struct to build `HostMapping` objects.
#[derive(Debug)]
pub struct HostMappingBuilder {
    size: usize,
    prot: i32,
    flags: i32,
    file_offset: Option<FileOffset>,
    alignment: Option<u64>,
    skew: u64,
    hugepage_advice: bool,
    hugetlbfs: Option<bool>,
}

impl HostMappingBuilder {
    /// Create a new builder for an anonymous private read/write mapping of `size` bytes.
    pub fn new(size: usize) -> Self {
        HostMappingBuilder {
            size,
            prot: libc::PROT_READ | libc::PROT_WRITE,
            flags: libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            file_offset: None,
            alignment: None,
            skew: 0,
            hugepage_advice: false,
            hugetlbfs: None,
        }
    }

    /// Create the `HostMapping` object with the specified mmap memory protection flag `prot`.
    pub fn with_mmap_prot(mut self, prot: i32) -> Self {
        self.prot = prot;
        self
    }

    /// Create the `HostMapping` object with the specified mmap `flags`.
    pub fn with_mmap_flags(mut self, flags: i32) -> Self {
        self.flags = flags;
        self
    }

    /// Create the `HostMapping` object with the specified `file_offset`.
    pub fn with_file_offset(mut self, file_offset: FileOffset) -> Self {
        self.file_offset = Some(file_offset);
        self
    }

    /// Place the mapping at a process virtual address aligned to `align` bytes.
    pub fn with_alignment(mut self, align: u64) -> Self {
        self.alignment = Some(align);
        self
    }

    /// Place the mapping `skew` bytes past the boundary chosen by [`Self::with_alignment`].
    pub fn with_skew(mut self, skew: u64) -> Self {
        self.skew = skew;
        self
    }

    /// Hint the kernel to back the mapping with transparent huge pages.
    pub fn with_hugepage_advice(mut self, advise: bool) -> Self {
        self.hugepage_advice = advise;
        self
    }

    /// Create the `HostMapping` object with the specified `hugetlbfs` flag.
    pub fn with_hugetlbfs(mut self, hugetlbfs: bool) -> Self {
        self.hugetlbfs = Some(hugetlbfs);
        self
    }

    /// Build the `HostMapping` object.
    pub fn build(self) -> Result<HostMapping> {
        // Forbid MAP_FIXED from callers; fixed placement is only ever done internally inside a
        // reservation this builder owns.
        if self.flags & libc::MAP_FIXED != 0 {
            return Err(Error::MapFixed);
        }

        let (fd, offset) = if let Some(ref f_off) = self.file_offset {
            f_off
                .start()
                .checked_add(self.size as u64)
                .ok_or(Error::InvalidOffsetLength)?;
            (f_off.file().as_raw_fd(), f_off.start())
        } else {
            (-1, 0)
        };

        let addr = match self.alignment {
            Some(align) => self.mmap_aligned(fd, offset, align)?,
            None => {
                // SAFETY: This is safe because we're not allowing MAP_FIXED, and invalid
                // parameters cannot break Rust safety guarantees.
                let addr = unsafe {
                    libc::mmap(
                        null_mut(),
                        self.size,
                        self.prot,
                        self.flags,
                        fd,
                        offset as libc::off_t,
                    )
                };
                if addr == libc::MAP_FAILED {
                    return Err(Error::Mmap(io::Error::last_os_error()));
                }
                addr as *mut u8
            }
        };

        let mapping = HostMapping {
            addr,
            size: self.size,
            file_offset: self.file_offset,
            prot: self.prot,
            flags: self.flags,
            hugetlbfs: self.hugetlbfs,
        };

        if self.hugepage_advice {
            // A missing THP configuration only costs performance, never correctness.
            if let Err(e) = mapping.advise_hugepage() {
                debug!("MADV_HUGEPAGE refused for {:#x}: {}", mapping.host_address().0, e);
            }
        }

        Ok(mapping)
    }

    // Reserve `size + align + skew` bytes of inaccessible address space, trim it down to the
    // target window and map the real object over that window.
    fn mmap_aligned(&self, fd: i32, offset: u64, align: u64) -> Result<*mut u8> {
        let reserve_len = self
            .size
            .checked_add(align as usize)
            .and_then(|len| len.checked_add(self.skew as usize))
            .ok_or(Error::InvalidOffsetLength)?;

        // SAFETY: Anonymous PROT_NONE reservation at a kernel chosen address.
        let base = unsafe {
            libc::mmap(
                null_mut(),
                reserve_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }

        let base = base as u64;
        let aligned = match align_up(base, align) {
            Ok(aligned) => aligned + self.skew,
            Err(e) => {
                // SAFETY: Releasing the reservation made above.
                unsafe { libc::munmap(base as *mut libc::c_void, reserve_len) };
                return Err(e.into());
            }
        };
        let head = (aligned - base) as usize;
        let tail = reserve_len - head - self.size;

        // SAFETY: Both ranges lie inside the reservation made above and nothing else refers to
        // them.
        unsafe {
            if head > 0 {
                libc::munmap(base as *mut libc::c_void, head);
            }
            if tail > 0 {
                libc::munmap((aligned as usize + self.size) as *mut libc::c_void, tail);
            }
        }

        // SAFETY: MAP_FIXED only replaces the aligned part of our own reservation.
        let addr = unsafe {
            libc::mmap(
                aligned as *mut libc::c_void,
                self.size,
                self.prot,
                self.flags | libc::MAP_FIXED,
                fd,
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: Releasing what is left of the reservation.
            unsafe { libc::munmap(aligned as *mut libc::c_void, self.size) };
            return Err(Error::Mmap(err));
        }

        Ok(addr as *mut u8)
    }
}

/// Helper structure for working with mmaped process memory.
///
/// The mapping is released with `munmap` when the object is dropped, which makes the drop point
/// the "release" phase timed by the throughput probe.
#[derive(Debug)]
pub struct HostMapping {
    addr: *mut u8,
    size: usize,
    file_offset: Option<FileOffset>,
    prot: i32,
    flags: i32,
    hugetlbfs: Option<bool>,
}

// SAFETY: Send and Sync aren't automatically inherited for the raw address pointer.
// The pointer is only handed out as a plain address; any access through it is the caller's
// responsibility.
unsafe impl Send for HostMapping {}
// SAFETY: See comment above.
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// Creates an anonymous private read/write mapping of `size` bytes.
    pub fn new(size: usize) -> Result<Self> {
        HostMappingBuilder::new(size).build()
    }

    /// Creates a shared file mapping of `size` bytes.
    pub fn from_file(file_offset: FileOffset, size: usize) -> Result<Self> {
        HostMappingBuilder::new(size)
            .with_file_offset(file_offset)
            .with_mmap_flags(libc::MAP_SHARED)
            .build()
    }

    /// Returns a pointer to the beginning of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Returns the process virtual address of the mapping.
    pub fn host_address(&self) -> HostAddress {
        HostAddress::from_ptr(self.addr)
    }

    /// Returns the size of this mapping.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns information regarding the offset into the file backing this mapping (if any).
    pub fn file_offset(&self) -> Option<&FileOffset> {
        self.file_offset.as_ref()
    }

    /// Returns the value of the `prot` parameter passed to `mmap`.
    pub fn prot(&self) -> i32 {
        self.prot
    }

    /// Returns the value of the `flags` parameter passed to `mmap`.
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Returns `Some(true)` if the mapping is backed by hugetlbfs.
    pub fn is_hugetlbfs(&self) -> Option<bool> {
        self.hugetlbfs
    }

    /// Advise the kernel to use transparent huge pages for the whole mapping.
    pub fn advise_hugepage(&self) -> Result<()> {
        // SAFETY: The range is exactly the mapping we own.
        let ret = unsafe {
            libc::madvise(
                self.addr as *mut libc::c_void,
                self.size,
                libc::MADV_HUGEPAGE,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::Madvise(io::Error::last_os_error()))
        }
    }

    /// Fault in every page of a writable mapping by filling it with `value`.
    pub fn populate(&mut self, value: u8) {
        if self.prot & libc::PROT_WRITE == 0 {
            return;
        }
        // SAFETY: The mapping is writable and `size` bytes long, and `&mut self` guarantees no
        // other reference into it exists in safe code.
        unsafe { std::ptr::write_bytes(self.addr, value, self.size) };
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: This is safe because we mmap the area at addr ourselves, and nobody
        // else is holding a reference to it.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// A temporary file on a hugetlbfs (or any other) mount, used as huge page backing memory.
///
/// The file is unlinked when the object is dropped.
#[derive(Debug)]
pub struct HugeTlbFile {
    file: TempFile,
    page_size: u64,
    hugetlbfs: bool,
}

impl HugeTlbFile {
    /// Create a temporary file in `dir`, sized to `size` bytes.
    pub fn new_in(dir: &Path, size: u64) -> Result<Self> {
        let (page_size, hugetlbfs) = statfs_page_size(dir)?;
        let file = TempFile::new_in(dir)
            .map_err(|e| Error::BackingFile(io::Error::from_raw_os_error(e.errno())))?;
        file.as_file().set_len(size).map_err(Error::BackingFile)?;

        Ok(HugeTlbFile {
            file,
            page_size,
            hugetlbfs,
        })
    }

    /// Page size reported by the filesystem holding the file.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Whether the filesystem holding the file is hugetlbfs.
    pub fn is_hugetlbfs(&self) -> bool {
        self.hugetlbfs
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.file.as_path()
    }

    /// Map `size` bytes of the file shared, optionally pre-faulted with `MAP_POPULATE`.
    pub fn map(&self, size: usize, populate: bool) -> Result<HostMapping> {
        let file = self.file.as_file().try_clone().map_err(Error::BackingFile)?;
        let mut flags = libc::MAP_SHARED;
        if populate {
            flags |= libc::MAP_POPULATE;
        }
        HostMappingBuilder::new(size)
            .with_file_offset(FileOffset::new(file, 0))
            .with_mmap_flags(flags)
            .with_hugetlbfs(self.hugetlbfs)
            .build()
    }
}

/// Block size of the filesystem holding `path`, and whether it is hugetlbfs.
pub fn statfs_page_size(path: &Path) -> Result<(u64, bool)> {
    let statfs_err = |source| Error::Statfs {
        path: path.display().to_string(),
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| statfs_err(io::Error::from_raw_os_error(libc::EINVAL)))?;

    loop {
        let mut fs = MaybeUninit::<libc::statfs>::zeroed();
        // SAFETY: `c_path` is a valid NUL terminated string and `fs` is large enough for the
        // kernel to fill in.
        let ret = unsafe { libc::statfs(c_path.as_ptr(), fs.as_mut_ptr()) };
        if ret == 0 {
            // SAFETY: statfs succeeded, so the structure is initialized.
            let fs = unsafe { fs.assume_init() };
            return Ok((fs.f_bsize as u64, fs.f_type as u64 == HUGETLBFS_MAGIC));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(statfs_err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use matches::assert_matches;
    use std::io::Write;
    use std::slice;

    #[test]
    fn test_host_mapping_new() {
        assert_matches!(HostMapping::new(0).unwrap_err(), Error::Mmap(_));

        let m = HostMapping::new(0x4000).unwrap();
        assert_eq!(m.size(), 0x4000);
        assert!(m.file_offset().is_none());
        assert_eq!(m.prot(), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(m.flags(), libc::MAP_ANONYMOUS | libc::MAP_PRIVATE);
        assert_eq!(m.is_hugetlbfs(), None);
        assert_eq!(m.host_address().0 % page_size(), 0);
    }

    #[test]
    fn test_map_fixed_rejected() {
        let r = HostMappingBuilder::new(0x1000)
            .with_mmap_flags(libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED)
            .build();
        assert_matches!(r.unwrap_err(), Error::MapFixed);
    }

    #[test]
    fn test_aligned_mapping() {
        let align = 1 << 21;
        for _ in 0..8 {
            let m = HostMappingBuilder::new(0x3000)
                .with_alignment(align)
                .with_hugepage_advice(true)
                .build()
                .unwrap();
            assert_eq!(m.host_address().0 % align, 0);
        }

        let m = HostMappingBuilder::new(0x1000)
            .with_alignment(align)
            .with_skew(0x1000)
            .build()
            .unwrap();
        assert_eq!(m.host_address().0 % align, 0x1000);

        let r = HostMappingBuilder::new(0x1000).with_alignment(0x3000).build();
        assert_matches!(
            r.unwrap_err(),
            Error::Alignment(AlignmentError::InvalidAlignment(0x3000))
        );
    }

    #[test]
    fn test_populate() {
        let mut m = HostMapping::new(0x2000).unwrap();
        m.populate(0xa5);
        // SAFETY: The mapping is live, readable and 0x2000 bytes long.
        let bytes = unsafe { slice::from_raw_parts(m.as_ptr(), m.size()) };
        assert!(bytes.iter().all(|b| *b == 0xa5));
    }

    #[test]
    fn test_from_file() {
        let mut f = TempFile::new().unwrap().into_file();
        let buf = [1u8, 2, 3, 4, 5];
        f.write_all(&buf).unwrap();

        let m = HostMapping::from_file(FileOffset::new(f, 0), buf.len()).unwrap();
        assert_eq!(m.file_offset().unwrap().start(), 0);
        assert_eq!(m.flags(), libc::MAP_SHARED);
        // SAFETY: The mapping is live and at least `buf.len()` bytes long.
        let mapped = unsafe { slice::from_raw_parts(m.as_ptr(), buf.len()) };
        assert_eq!(mapped, &buf);

        let f = TempFile::new().unwrap().into_file();
        let r = HostMapping::from_file(FileOffset::new(f, u64::MAX), 0x1000);
        assert_matches!(r.unwrap_err(), Error::InvalidOffsetLength);
    }

    #[test]
    fn test_hugetlb_file_on_regular_fs() {
        let dir = std::env::temp_dir();
        let backing = HugeTlbFile::new_in(&dir, 0x4000).unwrap();
        assert!(backing.page_size() > 0);
        assert!(backing.path().starts_with(&dir));

        let path = backing.path().to_path_buf();
        let m = backing.map(0x4000, true).unwrap();
        assert_eq!(m.size(), 0x4000);
        drop(m);
        drop(backing);
        assert!(!path.exists());
    }

    #[test]
    fn test_statfs_missing_path() {
        let r = statfs_page_size(Path::new("/definitely/not/a/mount/point"));
        assert_matches!(r.unwrap_err(), Error::Statfs { .. });
    }
}
