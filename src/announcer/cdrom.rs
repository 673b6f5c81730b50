//! CD-ROM media probing.
//!
//! Drive and disc state come from the standard CD-ROM ioctls; the volume
//! label comes from scanning the ISO-9660 volume descriptor area. Probing is
//! behind a trait so the announcer's media state machine can be driven by a
//! scripted double in tests, where there is no drive to poll.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::{debug, warn};

// <linux/cdrom.h>
const CDROM_DRIVE_STATUS: libc::c_ulong = 0x5326;
const CDROM_DISC_STATUS: libc::c_ulong = 0x5327;
const CDS_NO_INFO: libc::c_int = 0;
const CDS_NO_DISC: libc::c_int = 1;
const CDS_TRAY_OPEN: libc::c_int = 2;
const CDS_DRIVE_NOT_READY: libc::c_int = 3;
const CDS_DISC_OK: libc::c_int = 4;
const CDS_AUDIO: libc::c_int = 100;
const CDS_DATA_1: libc::c_int = 101;
const CDS_DATA_2: libc::c_int = 102;
const CDS_XA_2_1: libc::c_int = 103;
const CDS_XA_2_2: libc::c_int = 104;
const CDS_MIXED: libc::c_int = 105;

// <linux/iso_fs.h>
const ISOFS_BLOCK_SIZE: u64 = 2048;
const ISO_STANDARD_ID: &[u8] = b"CD001";
/// Byte offset of the magic inside a volume descriptor.
const ISO_ID_OFFSET: usize = 1;
/// Byte offset and width of the volume id inside the primary descriptor.
const ISO_VOLUME_ID_OFFSET: usize = 40;
const ISO_VOLUME_ID_LEN: usize = 32;

/// Fallback label when the disc cannot be read.
pub const GENERIC_CDROM_LABEL: &str = "CDrom";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    NoInfo,
    NoDisc,
    TrayOpen,
    NotReady,
    DiscOk,
    /// The drive could not be opened or the ioctl failed.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscKind {
    Unknown,
    Audio,
    Data1,
    Data2,
    Xa21,
    Xa22,
    Mixed,
}

impl DiscKind {
    /// Only data discs carry a mountable filesystem worth announcing.
    pub fn is_data(self) -> bool {
        matches!(self, DiscKind::Data1 | DiscKind::Data2)
    }
}

/// How the announcer asks a drive about its media.
pub trait MediaProbe {
    fn drive_status(&self, blockdev: &str) -> DriveStatus;
    fn disc_kind(&self, blockdev: &str) -> DiscKind;
    /// Read the volume id off the disc; `None` on any I/O problem, which the
    /// caller turns into [`GENERIC_CDROM_LABEL`].
    fn volume_id(&self, blockdev: &str) -> Option<String>;
}

/// The real thing: CD-ROM ioctls plus a descriptor scan.
#[derive(Debug, Default)]
pub struct CdromIoctl;

fn cdrom_ioctl(blockdev: &str, request: libc::c_ulong) -> io::Result<libc::c_int> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(blockdev)?;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

impl MediaProbe for CdromIoctl {
    fn drive_status(&self, blockdev: &str) -> DriveStatus {
        match cdrom_ioctl(blockdev, CDROM_DRIVE_STATUS) {
            Ok(CDS_NO_INFO) => DriveStatus::NoInfo,
            Ok(CDS_NO_DISC) => DriveStatus::NoDisc,
            Ok(CDS_TRAY_OPEN) => DriveStatus::TrayOpen,
            Ok(CDS_DRIVE_NOT_READY) => DriveStatus::NotReady,
            Ok(CDS_DISC_OK) => DriveStatus::DiscOk,
            Ok(other) => {
                debug!("{blockdev}: unknown drive status {other}");
                DriveStatus::NoInfo
            }
            Err(e) => {
                debug!("{blockdev}: drive status probe failed: {e}");
                DriveStatus::Unavailable
            }
        }
    }

    fn disc_kind(&self, blockdev: &str) -> DiscKind {
        match cdrom_ioctl(blockdev, CDROM_DISC_STATUS) {
            Ok(CDS_AUDIO) => DiscKind::Audio,
            Ok(CDS_DATA_1) => DiscKind::Data1,
            Ok(CDS_DATA_2) => DiscKind::Data2,
            Ok(CDS_XA_2_1) => DiscKind::Xa21,
            Ok(CDS_XA_2_2) => DiscKind::Xa22,
            Ok(CDS_MIXED) => DiscKind::Mixed,
            Ok(_) => DiscKind::Unknown,
            Err(e) => {
                debug!("{blockdev}: disc status probe failed: {e}");
                DiscKind::Unknown
            }
        }
    }

    fn volume_id(&self, blockdev: &str) -> Option<String> {
        match read_iso_volume_id(Path::new(blockdev)) {
            Ok(volume_id) => volume_id,
            Err(e) => {
                warn!("{blockdev}: volume id read failed: {e}");
                None
            }
        }
    }
}

/// Scan the descriptor area for the primary descriptor and pull out its
/// volume id. The descriptor usually sits at sector 16, but not always, so
/// sectors 16..100 are probed in order.
pub fn read_iso_volume_id(blockdev: &Path) -> io::Result<Option<String>> {
    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(blockdev)?;

    let mut sector = [0u8; ISOFS_BLOCK_SIZE as usize];
    for number in 16..100u64 {
        file.seek(SeekFrom::Start(number * ISOFS_BLOCK_SIZE))?;
        file.read_exact(&mut sector)?;
        if &sector[ISO_ID_OFFSET..ISO_ID_OFFSET + ISO_STANDARD_ID.len()] == ISO_STANDARD_ID {
            let raw = &sector[ISO_VOLUME_ID_OFFSET..ISO_VOLUME_ID_OFFSET + ISO_VOLUME_ID_LEN];
            let volume_id = String::from_utf8_lossy(raw).trim_end_matches(' ').to_string();
            return Ok(Some(volume_id));
        }
    }
    Ok(None)
}
