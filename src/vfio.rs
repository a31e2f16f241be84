// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Attach a PCI device through the legacy VFIO group/container interface.
//!
//! [`attach`] resolves the device's IOMMU group, binds the group to a fresh container with the
//! Type1 IOMMU backend and opens the device. The container is the [`AddressSpace`] every probe
//! maps through; the device is the [`DeviceRegion`] the BAR probes map from.

use std::ffi::CString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::raw::{c_int, c_ulong};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info};
use vmm_sys_util::ioctl::{
    ioctl, ioctl_expr, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref, ioctl_with_val,
    _IOC_NONE,
};

use crate::address::{HostAddress, Iova};
use crate::iommu::{self, AddressSpace, DmaPermissions, Operation};
use crate::mmap::{self, FileOffset, HostMapping, HostMappingBuilder};
use crate::region::{DeviceFlags, DeviceInfo, DeviceRegion, RegionFlags, RegionInfo};

const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";
const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

const VFIO_API_VERSION: c_int = 0;
const VFIO_TYPE1_IOMMU: c_ulong = 1;
const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
const VFIO_IOMMU_INFO_PGSIZES: u32 = 1 << 0;

const VFIO_TYPE: u32 = ';' as u32;
const VFIO_BASE: u32 = 100;

// All VFIO ioctls are encoded as _IO(VFIO_TYPE, VFIO_BASE + n); the argument size is carried in
// `argsz` instead.
fn vfio_ioctl(nr: u32) -> c_ulong {
    ioctl_expr(_IOC_NONE, VFIO_TYPE, VFIO_BASE + nr, 0)
}

fn vfio_get_api_version() -> c_ulong {
    vfio_ioctl(0)
}

fn vfio_check_extension() -> c_ulong {
    vfio_ioctl(1)
}

fn vfio_set_iommu() -> c_ulong {
    vfio_ioctl(2)
}

fn vfio_group_get_status() -> c_ulong {
    vfio_ioctl(3)
}

fn vfio_group_set_container() -> c_ulong {
    vfio_ioctl(4)
}

fn vfio_group_get_device_fd() -> c_ulong {
    vfio_ioctl(6)
}

fn vfio_device_get_info() -> c_ulong {
    vfio_ioctl(7)
}

fn vfio_device_get_region_info() -> c_ulong {
    vfio_ioctl(8)
}

fn vfio_iommu_get_info() -> c_ulong {
    vfio_ioctl(12)
}

fn vfio_iommu_map_dma() -> c_ulong {
    vfio_ioctl(13)
}

fn vfio_iommu_unmap_dma() -> c_ulong {
    vfio_ioctl(14)
}

/// include/uapi/linux/vfio.h: `struct vfio_group_status`
#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

/// include/uapi/linux/vfio.h: `struct vfio_device_info`
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

/// include/uapi/linux/vfio.h: `struct vfio_region_info`
#[repr(C)]
#[derive(Debug, Default)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

/// include/uapi/linux/vfio.h: `struct vfio_iommu_type1_info`
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuType1Info {
    argsz: u32,
    flags: u32,
    iova_pgsizes: u64,
}

/// include/uapi/linux/vfio.h: `struct vfio_iommu_type1_dma_map`
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuType1DmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

/// include/uapi/linux/vfio.h: `struct vfio_iommu_type1_dma_unmap`
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuType1DmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// Errors raised while attaching a device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device identifier is not of the form `ssss:bb:dd.f`.
    #[error("invalid PCI device identifier \"{0}\"")]
    InvalidDeviceId(String),
    /// The device has no IOMMU group.
    #[error("{device}: no iommu_group found: {source}")]
    NoGroup {
        /// The device looked up
        device: PciAddress,
        /// Error reading the group link
        source: io::Error,
    },
    /// A VFIO character device could not be opened.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        /// Path of the device node
        path: PathBuf,
        /// Error returned by open
        source: io::Error,
    },
    /// Not every device in the group is bound to vfio.
    #[error("group {0} is not viable, are all devices attached to vfio?")]
    GroupNotViable(u32),
    /// The container speaks an unknown API version.
    #[error("unknown VFIO API version {0}")]
    ApiVersion(c_int),
    /// Binding the group or selecting the IOMMU backend failed.
    #[error("{op} failed: {source}")]
    Setup {
        /// Step that failed
        op: &'static str,
        /// Error returned by the ioctl
        source: io::Error,
    },
}

/// Result of attaching a device.
pub type Result<T> = std::result::Result<T, Error>;

type IommuResult<T> = std::result::Result<T, iommu::Error>;

/// A PCI function address, `segment:bus:device.function`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PciAddress {
    /// PCI segment
    pub segment: u16,
    /// Bus number
    pub bus: u8,
    /// Device number, below 32
    pub device: u8,
    /// Function number, below 8
    pub function: u8,
}

impl PciAddress {
    /// Sysfs directory of the device.
    pub fn sysfs_path(&self) -> PathBuf {
        Path::new(SYSFS_PCI_DEVICES).join(self.to_string())
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidDeviceId(s.to_string());
        let (segment, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (device, function) = rest.split_once('.').ok_or_else(invalid)?;

        let address = PciAddress {
            segment: u16::from_str_radix(segment, 16).map_err(|_| invalid())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| invalid())?,
            device: u8::from_str_radix(device, 16).map_err(|_| invalid())?,
            function: function.parse().map_err(|_| invalid())?,
        };
        if address.device >= 32 || address.function >= 8 {
            return Err(invalid());
        }
        Ok(address)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// Look up the IOMMU group number of `address` in sysfs.
pub fn iommu_group(address: &PciAddress) -> Result<u32> {
    let no_group = |source| Error::NoGroup {
        device: *address,
        source,
    };
    let link = fs::read_link(address.sysfs_path().join("iommu_group")).map_err(no_group)?;
    link.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.parse().ok())
        .ok_or_else(|| {
            no_group(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected group link {}", link.display()),
            ))
        })
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn setup_error(op: &'static str) -> Error {
    Error::Setup {
        op,
        source: io::Error::last_os_error(),
    }
}

/// A VFIO container with one group attached and the Type1 backend selected.
#[derive(Debug)]
pub struct VfioContainer {
    container: File,
    // Held open so the group stays attached to the container.
    _group: File,
}

impl VfioContainer {
    fn check_extension(&self, extension: c_ulong) -> bool {
        // SAFETY: CHECK_EXTENSION takes its argument by value and touches no memory.
        unsafe { ioctl_with_val(&self.container, vfio_check_extension(), extension) > 0 }
    }
}

impl AddressSpace for VfioContainer {
    fn map(
        &self,
        iova: Iova,
        length: u64,
        source: HostAddress,
        access: DmaPermissions,
    ) -> IommuResult<()> {
        let map = VfioIommuType1DmaMap {
            argsz: size_of::<VfioIommuType1DmaMap>() as u32,
            flags: access.bits(),
            vaddr: source.0,
            iova: iova.0,
            size: length,
        };
        // SAFETY: The kernel only reads `map`, which lives across the call. The process memory
        // it points to is pinned or rejected by the kernel, never dereferenced here.
        let ret = unsafe { ioctl_with_ref(&self.container, vfio_iommu_map_dma(), &map) };
        if ret != 0 {
            return Err(iommu::Error::Control {
                op: Operation::Map,
                iova,
                length,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn unmap(&self, iova: Iova, length: u64) -> IommuResult<u64> {
        let mut unmap = VfioIommuType1DmaUnmap {
            argsz: size_of::<VfioIommuType1DmaUnmap>() as u32,
            flags: 0,
            iova: iova.0,
            size: length,
        };
        // SAFETY: The kernel reads and updates `unmap` only, which lives across the call.
        let ret =
            unsafe { ioctl_with_mut_ref(&self.container, vfio_iommu_unmap_dma(), &mut unmap) };
        if ret != 0 {
            return Err(iommu::Error::Control {
                op: Operation::Unmap,
                iova,
                length,
                source: io::Error::last_os_error(),
            });
        }
        Ok(unmap.size)
    }

    fn page_sizes(&self) -> IommuResult<u64> {
        let mut info = VfioIommuType1Info {
            argsz: size_of::<VfioIommuType1Info>() as u32,
            ..Default::default()
        };
        // SAFETY: The kernel writes at most `argsz` bytes into `info`.
        let ret = unsafe { ioctl_with_mut_ref(&self.container, vfio_iommu_get_info(), &mut info) };
        if ret != 0 {
            return Err(iommu::Error::Query {
                query: "VFIO_IOMMU_GET_INFO",
                source: io::Error::last_os_error(),
            });
        }
        if info.flags & VFIO_IOMMU_INFO_PGSIZES == 0 {
            return Err(iommu::Error::Unsupported("IOVA page size query"));
        }
        Ok(info.iova_pgsizes)
    }
}

/// An open vfio-pci device.
#[derive(Debug)]
pub struct VfioDevice {
    file: Arc<File>,
    address: PciAddress,
}

impl VfioDevice {
    /// Address of the device.
    pub fn address(&self) -> PciAddress {
        self.address
    }

    fn builder(&self, offset: u64, length: u64) -> IommuResult<HostMappingBuilder> {
        let size = usize::try_from(length).map_err(|_| mmap::Error::InvalidOffsetLength)?;
        Ok(HostMappingBuilder::new(size)
            .with_mmap_flags(libc::MAP_SHARED)
            .with_file_offset(FileOffset::from_arc(self.file.clone(), offset)))
    }
}

impl DeviceRegion for VfioDevice {
    fn device_info(&self) -> IommuResult<DeviceInfo> {
        let mut info = VfioDeviceInfo {
            argsz: size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };
        // SAFETY: The kernel writes at most `argsz` bytes into `info`.
        let ret = unsafe { ioctl_with_mut_ref(&*self.file, vfio_device_get_info(), &mut info) };
        if ret != 0 {
            return Err(iommu::Error::Query {
                query: "VFIO_DEVICE_GET_INFO",
                source: io::Error::last_os_error(),
            });
        }
        Ok(DeviceInfo {
            flags: DeviceFlags::from_bits_truncate(info.flags),
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
        })
    }

    fn region_info(&self, index: u32) -> IommuResult<RegionInfo> {
        let mut info = VfioRegionInfo {
            argsz: size_of::<VfioRegionInfo>() as u32,
            index,
            ..Default::default()
        };
        // SAFETY: The kernel writes at most `argsz` bytes into `info`.
        let ret =
            unsafe { ioctl_with_mut_ref(&*self.file, vfio_device_get_region_info(), &mut info) };
        if ret != 0 {
            let source = io::Error::last_os_error();
            if source.raw_os_error() == Some(libc::EINVAL) {
                return Err(iommu::Error::InvalidRegion(index));
            }
            return Err(iommu::Error::Query {
                query: "VFIO_DEVICE_GET_REGION_INFO",
                source,
            });
        }
        let flags = RegionFlags::from_bits_truncate(info.flags);
        Ok(RegionInfo {
            index: info.index,
            size: info.size,
            offset: info.offset,
            flags,
            cap_offset: flags.contains(RegionFlags::CAPS).then_some(info.cap_offset),
        })
    }

    fn mmap_region(&self, offset: u64, length: u64) -> IommuResult<HostMapping> {
        Ok(self.builder(offset, length)?.build()?)
    }

    fn mmap_region_aligned(
        &self,
        offset: u64,
        length: u64,
        align: u64,
    ) -> IommuResult<HostMapping> {
        Ok(self
            .builder(offset, length)?
            .with_mmap_prot(libc::PROT_READ)
            .with_alignment(align)
            .with_hugepage_advice(true)
            .build()?)
    }
}

/// Attach `device` (`ssss:bb:dd.f`) to a new Type1 container.
pub fn attach(device: &str) -> Result<(VfioContainer, VfioDevice)> {
    let address: PciAddress = device.parse()?;
    let group_id = iommu_group(&address)?;
    info!("Using device {} in IOMMU group {}", address, group_id);

    let group = open_rw(&Path::new("/dev/vfio").join(group_id.to_string()))?;
    let mut status = VfioGroupStatus {
        argsz: size_of::<VfioGroupStatus>() as u32,
        flags: 0,
    };
    // SAFETY: The kernel writes at most `argsz` bytes into `status`.
    if unsafe { ioctl_with_mut_ref(&group, vfio_group_get_status(), &mut status) } != 0 {
        return Err(setup_error("VFIO_GROUP_GET_STATUS"));
    }
    if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
        return Err(Error::GroupNotViable(group_id));
    }

    let container = open_rw(Path::new(VFIO_CONTAINER_PATH))?;
    // SAFETY: GET_API_VERSION takes no argument.
    let version = unsafe { ioctl(&container, vfio_get_api_version()) };
    if version != VFIO_API_VERSION {
        return Err(Error::ApiVersion(version));
    }

    let fd: c_int = container.as_raw_fd();
    // SAFETY: The kernel only reads the container fd from `fd`.
    if unsafe { ioctl_with_ref(&group, vfio_group_set_container(), &fd) } != 0 {
        return Err(setup_error("VFIO_GROUP_SET_CONTAINER"));
    }
    let container = VfioContainer {
        container,
        _group: group,
    };
    if !container.check_extension(VFIO_TYPE1_IOMMU) {
        debug!("VFIO_CHECK_EXTENSION VFIO_TYPE1_IOMMU: not present");
    }
    // SAFETY: SET_IOMMU takes its argument by value and touches no memory.
    if unsafe { ioctl_with_val(&container.container, vfio_set_iommu(), VFIO_TYPE1_IOMMU) } != 0 {
        return Err(setup_error("VFIO_SET_IOMMU"));
    }

    let name = CString::new(address.to_string())
        .map_err(|_| Error::InvalidDeviceId(device.to_string()))?;
    // SAFETY: `name` is a NUL terminated string that outlives the call.
    let ret =
        unsafe { ioctl_with_ptr(&container._group, vfio_group_get_device_fd(), name.as_ptr()) };
    if ret < 0 {
        return Err(setup_error("VFIO_GROUP_GET_DEVICE_FD"));
    }
    // SAFETY: On success the ioctl returns a new file descriptor owned by nobody else.
    let file = unsafe { File::from_raw_fd(ret) };

    Ok((
        container,
        VfioDevice {
            file: Arc::new(file),
            address,
        },
    ))
}
