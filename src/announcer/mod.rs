//! Workstation device announcer.
//!
//! Hotplug scripts report attached storage over a named pipe; login-server
//! sessions subscribe over TCP and are told about every device that comes and
//! goes, so they can offer the user a mount. One poll loop multiplexes the
//! listener, the pipe, and every subscriber, and its one-second tick doubles
//! as the CD-ROM media-change clock.

pub mod cdrom;
pub mod devices;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::announcer::cdrom::{DriveStatus, MediaProbe, GENERIC_CDROM_LABEL};
use crate::announcer::devices::{Device, DeviceKind, DeviceTable};
use crate::net;

/// Default location of the hotplug event pipe.
pub const FIFO_PATH: &str = "/tmp/lbus.fifo";

/// Tick driving the CD-ROM poll; also bounds how stale the fd set can get.
const POLL_TICK: Duration = Duration::from_secs(1);

/// A subscriber that stalls longer than this on a write is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Subscriber {
    stream: TcpStream,
    buf: Vec<u8>,
    registered: bool,
    userid: u32,
    username: String,
    dead: bool,
}

impl Subscriber {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            registered: false,
            userid: 0,
            username: String::new(),
            dead: false,
        }
    }

    fn label(&self) -> String {
        match self.stream.peer_addr() {
            Ok(addr) => format!("{addr} ({})", self.username),
            Err(_) => format!("(gone) ({})", self.username),
        }
    }
}

/// The announcer proper: device table, subscriber table, and the message-id
/// counter shared by every outbound announcement.
#[derive(Debug)]
pub struct Announcer<P: MediaProbe> {
    probe: P,
    devices: DeviceTable,
    subscribers: Vec<Subscriber>,
    message_id: u32,
}

impl<P: MediaProbe> Announcer<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            devices: DeviceTable::new(),
            subscribers: Vec::new(),
            message_id: 0,
        }
    }

    fn next_msgid(&mut self) -> u32 {
        let id = self.message_id;
        self.message_id += 1;
        id
    }

    /// Serve forever: accept subscribers, consume hotplug records, poll
    /// drives. Only a listener or poll failure gets out of here.
    pub fn run(mut self, listener: TcpListener, fifo_path: &Path) -> io::Result<()> {
        let mut fifo = FifoReader::create(fifo_path)?;
        info!(
            "lbuscd serving on {} and {}",
            listener.local_addr()?,
            fifo_path.display()
        );

        loop {
            let mut listener_ready = false;
            let mut fifo_ready = false;
            let mut subscriber_ready = vec![false; self.subscribers.len()];
            {
                let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                let mut fds = Vec::with_capacity(2 + self.subscribers.len());
                fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
                fds.push(PollFd::new(fifo.file.as_fd(), PollFlags::POLLIN));
                for sub in &self.subscribers {
                    fds.push(PollFd::new(sub.stream.as_fd(), PollFlags::POLLIN));
                }

                let timeout = PollTimeout::try_from(POLL_TICK).unwrap_or(PollTimeout::MAX);
                match poll(&mut fds, timeout) {
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                    Ok(0) => {
                        // Quiet second: time to ask the drives about media.
                        drop(fds);
                        self.poll_cdroms();
                        continue;
                    }
                    Ok(_) => {
                        let ready =
                            |fd: &PollFd<'_>| fd.revents().is_some_and(|r| r.intersects(readable));
                        listener_ready = ready(&fds[0]);
                        fifo_ready = ready(&fds[1]);
                        for (flag, fd) in subscriber_ready.iter_mut().zip(&fds[2..]) {
                            *flag = ready(fd);
                        }
                    }
                }
            }

            if listener_ready {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("subscriber connection from {peer}");
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!("could not set up subscriber {peer}: {e}");
                        } else {
                            self.subscribers.push(Subscriber::new(stream));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => warn!("accept failed: {e}"),
                }
            }

            if fifo_ready {
                let eof = match read_available(&mut fifo.file, &mut fifo.buf) {
                    Ok(eof) => eof,
                    Err(e) => {
                        warn!("pipe read failed: {e}");
                        true
                    }
                };
                for line in drain_batch(&mut fifo.buf) {
                    self.handle_fifo_line(&line);
                }
                if eof {
                    // The hotplug script closed its end; reopen for the next one.
                    fifo.reopen()?;
                }
            }

            for idx in 0..subscriber_ready.len() {
                if subscriber_ready[idx] && !self.subscribers[idx].dead {
                    self.service_subscriber(idx);
                }
            }

            self.sweep_dead();
        }
    }

    fn service_subscriber(&mut self, idx: usize) {
        let lines = {
            let sub = &mut self.subscribers[idx];
            match read_available(&mut sub.stream, &mut sub.buf) {
                Ok(false) => {}
                Ok(true) => sub.dead = true,
                Err(e) => {
                    debug!("lost subscriber {}: {e}", sub.label());
                    sub.dead = true;
                }
            }
            drain_batch(&mut sub.buf)
        };
        for line in lines {
            self.handle_subscriber_line(idx, &line);
        }
    }

    fn sweep_dead(&mut self) {
        self.subscribers.retain(|sub| {
            if sub.dead {
                debug!("forgetting subscriber {}", sub.label());
            }
            !sub.dead
        });
    }

    /// Records from the hotplug scripts.
    pub fn handle_fifo_line(&mut self, line: &str) {
        let fields: Vec<&str> = line.split('|').filter(|s| !s.is_empty()).collect();
        let Some((command, args)) = fields.split_first() else {
            return;
        };
        debug!("pipe request: {command}");

        if command.eq_ignore_ascii_case("AddBlockDevice") {
            self.add_block_device(args, line);
        } else if command.eq_ignore_ascii_case("AddCDRomDrive") {
            self.add_cdrom_drive(args, line);
        } else if command.eq_ignore_ascii_case("RemoveDevice") {
            self.remove_device(args, line);
        } else if command.eq_ignore_ascii_case("DumpDevices") {
            self.dump_devices();
        } else {
            warn!("unknown pipe record: {line:?}");
        }
    }

    /// Commands from a login-server session.
    pub fn handle_subscriber_line(&mut self, idx: usize, line: &str) {
        let fields: Vec<&str> = line.split('|').filter(|s| !s.is_empty()).collect();
        let Some((command, args)) = fields.split_first() else {
            return;
        };
        debug!("subscriber request: {command}");

        if command.eq_ignore_ascii_case("Register") {
            self.register_subscriber(idx, args, line);
        } else if command.eq_ignore_ascii_case("EnumerateDevices") {
            self.enumerate_devices(idx);
        } else {
            // Deliberately no reply; unknown commands are dropped.
            debug!("unrecognized subscriber command: {line:?}");
        }
    }

    fn add_block_device(&mut self, args: &[&str], line: &str) {
        let [sharename, blockdev, removable, size, description] = args else {
            warn!(
                "expecting 'AddBlockDevice|sharename|blockdev|removable|size|desc', \
                 received {line:?}"
            );
            return;
        };
        let device = Device {
            id: 0,
            sharename: (*sharename).to_string(),
            blockdev: (*blockdev).to_string(),
            description: (*description).to_string(),
            removable: removable.parse::<i32>().unwrap_or(0) != 0,
            size: size.parse().unwrap_or(0),
            kind: DeviceKind::Block,
            media_present: true,
            disc_kind: None,
            volume_id: None,
        };
        match self.devices.add(device) {
            None => warn!("device table full, dropping {sharename}"),
            Some(added) => {
                info!("block device {} ({})", added.sharename, added.blockdev);
                let snapshot = added.clone();
                self.broadcast_add(&snapshot);
            }
        }
    }

    fn add_cdrom_drive(&mut self, args: &[&str], line: &str) {
        let [sharename, blockdev, description] = args else {
            warn!("expecting 'AddCDRomDrive|sharename|blockdev|desc', received {line:?}");
            return;
        };
        let device = Device {
            id: 0,
            sharename: (*sharename).to_string(),
            blockdev: (*blockdev).to_string(),
            description: (*description).to_string(),
            removable: true,
            size: 0,
            kind: DeviceKind::Cdrom,
            // Assume an empty drive; the poll tick discovers media.
            media_present: false,
            disc_kind: None,
            volume_id: None,
        };
        match self.devices.add(device) {
            None => warn!("device table full, dropping {sharename}"),
            Some(added) => info!("cdrom drive {} ({})", added.sharename, added.blockdev),
        }
    }

    fn remove_device(&mut self, args: &[&str], line: &str) {
        let [sharename] = args else {
            warn!("expecting 'RemoveDevice|sharename', received {line:?}");
            return;
        };
        if let Some(device) = self.devices.remove(sharename) {
            info!("removed device {}", device.sharename);
            self.broadcast_remove(device.id);
        }
    }

    fn dump_devices(&self) {
        debug!("device table ({} entries):", self.devices.len());
        for device in self.devices.iter() {
            debug!(
                "  [{}] [{}] [{}] removable={} size={} kind={:?} media={}",
                device.id,
                device.sharename,
                device.description,
                device.removable,
                device.size,
                device.kind,
                device.media_present,
            );
        }
    }

    fn register_subscriber(&mut self, idx: usize, args: &[&str], line: &str) {
        let [_msgid, userid, username] = args else {
            warn!("expecting 'Register|msgid|userid|username', received {line:?}");
            return;
        };
        let sub = &mut self.subscribers[idx];
        sub.registered = true;
        sub.userid = userid.parse().unwrap_or(0);
        sub.username = (*username).to_string();
        info!("registered subscriber {} (uid {})", sub.label(), sub.userid);
    }

    /// Replay the present devices to one subscriber, all under a single
    /// message id. Empty CD-ROM drives are not devices yet and stay silent.
    fn enumerate_devices(&mut self, idx: usize) {
        let groupid = self.next_msgid();
        let lines: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.kind != DeviceKind::Cdrom || d.media_present)
            .map(|d| format_add(d, groupid))
            .collect();
        for line in lines {
            self.send_to(idx, &line);
        }
    }

    fn broadcast_add(&mut self, device: &Device) {
        for idx in 0..self.subscribers.len() {
            if !self.subscribers[idx].registered || self.subscribers[idx].dead {
                continue;
            }
            let msgid = self.next_msgid();
            let line = format_add(device, msgid);
            self.send_to(idx, &line);
        }
    }

    fn broadcast_remove(&mut self, devnum: u32) {
        for idx in 0..self.subscribers.len() {
            if !self.subscribers[idx].registered || self.subscribers[idx].dead {
                continue;
            }
            let msgid = self.next_msgid();
            let line = format!("RemoveDevice|{msgid}|{devnum}\r\n");
            self.send_to(idx, &line);
        }
    }

    fn send_to(&mut self, idx: usize, line: &str) {
        let sub = &mut self.subscribers[idx];
        if sub.dead {
            return;
        }
        debug!("sending {:?} to {}", line.trim_end(), sub.label());
        if let Err(e) = net::write_all_timeout(&mut sub.stream, line.as_bytes(), SEND_TIMEOUT) {
            warn!("dropping subscriber {}: {e}", sub.label());
            sub.dead = true;
        }
    }

    /// Ask every CD-ROM drive for its state and announce the transitions.
    pub fn poll_cdroms(&mut self) {
        for idx in 0..self.devices.len() {
            let probe_target = match self.devices.get_mut(idx) {
                Some(d) if d.kind == DeviceKind::Cdrom => (d.blockdev.clone(), d.media_present),
                _ => continue,
            };
            let (blockdev, media_present) = probe_target;
            match self.probe.drive_status(&blockdev) {
                DriveStatus::DiscOk if !media_present => self.cdrom_inserted(idx),
                DriveStatus::TrayOpen | DriveStatus::NoInfo if media_present => {
                    self.cdrom_removed(idx)
                }
                _ => {}
            }
        }
    }

    fn cdrom_inserted(&mut self, idx: usize) {
        let blockdev = match self.devices.get_mut(idx) {
            Some(d) => d.blockdev.clone(),
            None => return,
        };
        let kind = self.probe.disc_kind(&blockdev);
        let volume_id = if kind.is_data() {
            let raw = self
                .probe
                .volume_id(&blockdev)
                .unwrap_or_else(|| GENERIC_CDROM_LABEL.to_string());
            Some(raw.trim_end_matches(' ').to_string())
        } else {
            None
        };

        let snapshot = {
            let Some(device) = self.devices.get_mut(idx) else {
                return;
            };
            device.media_present = true;
            device.disc_kind = Some(kind);
            device.volume_id = volume_id;
            device.clone()
        };

        info!(
            "cdrom inserted in {} (volume {:?})",
            snapshot.blockdev, snapshot.volume_id
        );
        if kind.is_data() {
            self.broadcast_add(&snapshot);
        }
    }

    fn cdrom_removed(&mut self, idx: usize) {
        let (devnum, blockdev, was_data) = {
            let Some(device) = self.devices.get_mut(idx) else {
                return;
            };
            device.media_present = false;
            let was_data = device.disc_kind.is_some_and(|k| k.is_data());
            device.disc_kind = None;
            if was_data {
                device.volume_id = None;
            }
            (device.id, device.blockdev.clone(), was_data)
        };

        info!("cdrom removed from {blockdev}");
        if was_data {
            self.broadcast_remove(devnum);
        }
    }

    #[cfg(test)]
    pub(crate) fn push_subscriber(&mut self, stream: TcpStream) -> usize {
        stream.set_nonblocking(true).unwrap();
        self.subscribers.push(Subscriber::new(stream));
        self.subscribers.len() - 1
    }

    #[cfg(test)]
    pub(crate) fn devices(&self) -> &DeviceTable {
        &self.devices
    }
}

fn format_add(device: &Device, msgid: u32) -> String {
    format!(
        "AddBlockDevice|{}|{}|{}|{}|{}|{}\r\n",
        msgid,
        device.id,
        device.sharename,
        u8::from(device.removable),
        device.size,
        device.label(),
    )
}

/// Hotplug event pipe, owned for the life of the daemon and reopened
/// whenever the writing script hangs up.
#[derive(Debug)]
struct FifoReader {
    file: File,
    buf: Vec<u8>,
    path: PathBuf,
}

impl FifoReader {
    fn create(path: &Path) -> io::Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        mkfifo(path, Mode::from_bits_truncate(0o666))?;
        Ok(Self {
            file: Self::open(path)?,
            buf: Vec::new(),
            path: path.to_path_buf(),
        })
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.file = Self::open(&self.path)?;
        self.buf.clear();
        Ok(())
    }
}

/// Pull everything currently readable off a non-blocking descriptor.
/// `Ok(true)` means the peer is gone (EOF); buffered bytes are still valid.
fn read_available<R: Read>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; 256];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// A batch is complete once it ends in a newline. Carriage returns are
/// stripped, blank lines skipped; a partial trailing record stays buffered
/// for the next read.
fn drain_batch(buf: &mut Vec<u8>) -> Vec<String> {
    if buf.last() != Some(&b'\n') {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(buf).replace('\r', "");
    let lines = text
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    buf.clear();
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcer::cdrom::DiscKind;
    use std::cell::RefCell;
    use std::io::Read as _;
    use std::net::TcpListener;
    use std::time::Duration;

    /// Scripted probe: statuses pop off a queue, labels are canned.
    #[derive(Debug)]
    struct FakeProbe {
        statuses: RefCell<Vec<DriveStatus>>,
        kind: DiscKind,
        volume_id: Option<String>,
    }

    impl Default for FakeProbe {
        fn default() -> Self {
            Self::scripted(Vec::new(), DiscKind::Unknown, None)
        }
    }

    impl FakeProbe {
        fn scripted(statuses: Vec<DriveStatus>, kind: DiscKind, volume_id: Option<&str>) -> Self {
            Self {
                statuses: RefCell::new(statuses),
                kind,
                volume_id: volume_id.map(str::to_string),
            }
        }
    }

    impl MediaProbe for FakeProbe {
        fn drive_status(&self, _blockdev: &str) -> DriveStatus {
            let mut statuses = self.statuses.borrow_mut();
            if statuses.is_empty() {
                DriveStatus::NoInfo
            } else {
                statuses.remove(0)
            }
        }

        fn disc_kind(&self, _blockdev: &str) -> DiscKind {
            self.kind
        }

        fn volume_id(&self, _blockdev: &str) -> Option<String> {
            self.volume_id.clone()
        }
    }

    fn registered_pair<P: MediaProbe>(annc: &mut Announcer<P>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let idx = annc.push_subscriber(server_side);
        annc.handle_subscriber_line(idx, "Register|0|1000|jdoe");
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        peer
    }

    fn read_lines(peer: &mut TcpStream) -> Vec<String> {
        let mut text = String::new();
        let mut chunk = [0u8; 512];
        loop {
            match peer.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    text.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    if text.ends_with('\n') {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        text.split("\r\n").filter(|l| !l.is_empty()).map(str::to_string).collect()
    }

    #[test]
    fn hotplugged_block_device_is_announced() {
        let mut annc = Announcer::new(FakeProbe::default());
        let mut peer = registered_pair(&mut annc);

        annc.handle_fifo_line("AddBlockDevice|usb0|/dev/sda1|1|512000|USB stick");

        let lines = read_lines(&mut peer);
        assert_eq!(lines, ["AddBlockDevice|0|1|usb0|1|512000|USB stick"]);
    }

    #[test]
    fn remove_follows_add_with_the_same_devnum() {
        let mut annc = Announcer::new(FakeProbe::default());
        let mut peer = registered_pair(&mut annc);

        annc.handle_fifo_line("AddBlockDevice|usb0|/dev/sda1|1|512000|USB stick");
        annc.handle_fifo_line("RemoveDevice|usb0");

        let mut lines = Vec::new();
        while lines.len() < 2 {
            let more = read_lines(&mut peer);
            if more.is_empty() {
                break;
            }
            lines.extend(more);
        }
        assert_eq!(lines[0], "AddBlockDevice|0|1|usb0|1|512000|USB stick");
        assert_eq!(lines[1], "RemoveDevice|1|1");
    }

    #[test]
    fn enumerate_skips_empty_cdrom_drives() {
        let mut annc = Announcer::new(FakeProbe::default());
        annc.handle_fifo_line("AddBlockDevice|usb0|/dev/sda1|1|512000|USB stick");
        annc.handle_fifo_line("AddCDRomDrive|cd0|/dev/hdc|CD drive");

        let mut peer = registered_pair(&mut annc);
        let idx = 0;
        annc.handle_subscriber_line(idx, "EnumerateDevices|2|1000|jdoe");

        let lines = read_lines(&mut peer);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("AddBlockDevice|"));
        assert!(lines[0].contains("|usb0|"));
    }

    #[test]
    fn data_disc_insertion_announces_the_volume_id() {
        let probe = FakeProbe::scripted(
            vec![DriveStatus::DiscOk],
            DiscKind::Data1,
            Some("PHOTOS   "),
        );
        let mut annc = Announcer::new(probe);
        annc.handle_fifo_line("AddCDRomDrive|cd0|/dev/hdc|CD drive");
        let mut peer = registered_pair(&mut annc);

        annc.poll_cdroms();

        let lines = read_lines(&mut peer);
        assert_eq!(lines, ["AddBlockDevice|0|1|cd0|1|0|PHOTOS"]);
    }

    #[test]
    fn tray_open_after_data_disc_emits_remove() {
        let probe = FakeProbe::scripted(
            vec![DriveStatus::DiscOk, DriveStatus::TrayOpen],
            DiscKind::Data1,
            None, // unreadable disc falls back to the generic label
        );
        let mut annc = Announcer::new(probe);
        annc.handle_fifo_line("AddCDRomDrive|cd0|/dev/hdc|CD drive");
        let mut peer = registered_pair(&mut annc);

        annc.poll_cdroms();
        annc.poll_cdroms();

        let mut lines = Vec::new();
        while lines.len() < 2 {
            let more = read_lines(&mut peer);
            if more.is_empty() {
                break;
            }
            lines.extend(more);
        }
        assert_eq!(lines[0], "AddBlockDevice|0|1|cd0|1|0|CDrom");
        assert_eq!(lines[1], "RemoveDevice|1|1");
        assert!(!annc.devices().find("cd0").unwrap().media_present);
    }

    #[test]
    fn audio_disc_stays_silent() {
        let probe = FakeProbe::scripted(vec![DriveStatus::DiscOk], DiscKind::Audio, None);
        let mut annc = Announcer::new(probe);
        annc.handle_fifo_line("AddCDRomDrive|cd0|/dev/hdc|CD drive");
        let mut peer = registered_pair(&mut annc);

        annc.poll_cdroms();

        peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut chunk = [0u8; 16];
        assert!(peer.read(&mut chunk).is_err());
        assert!(annc.devices().find("cd0").unwrap().media_present);
    }

    #[test]
    fn malformed_records_are_dropped() {
        let mut annc = Announcer::new(FakeProbe::default());
        annc.handle_fifo_line("AddBlockDevice|usb0|/dev/sda1");
        annc.handle_fifo_line("NoSuchCommand|x|y");
        assert!(annc.devices().is_empty());
    }

    #[test]
    fn partial_batches_stay_buffered() {
        let mut buf = b"AddBlockDevice|usb0".to_vec();
        assert!(drain_batch(&mut buf).is_empty());
        assert!(!buf.is_empty());

        buf.extend_from_slice(b"|/dev/sda1|1|512000|stick\r\n");
        let lines = drain_batch(&mut buf);
        assert_eq!(lines, ["AddBlockDevice|usb0|/dev/sda1|1|512000|stick"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn batches_may_carry_several_records() {
        let mut buf = b"RemoveDevice|usb0\r\nRemoveDevice|usb1\r\n\r\n".to_vec();
        let lines = drain_batch(&mut buf);
        assert_eq!(lines, ["RemoveDevice|usb0", "RemoveDevice|usb1"]);
    }
}
