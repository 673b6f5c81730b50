//! End-to-end exercises over a real TCP connection: a server session thread
//! on one side, the client's wire layer on the other, and a scratch
//! directory standing in for the terminal's medium. No FUSE mount, no X
//! server, no hardware.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ltspfs::client::{RemoteFs, RpcError};
use ltspfs::server::{ServerConfig, Session};
use ltspfs::wire::PATH_MAX;

struct Harness {
    remote: RemoteFs,
    root: tempfile::TempDir,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl Harness {
    /// Spin up one session worker and connect a client to it.
    fn start(readonly: bool) -> Self {
        let root = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let cfg = ServerConfig {
            readonly,
            skip_auth: true,
            debug: true,
            ..ServerConfig::default()
        };
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            Session::new(stream, &cfg).run()
        });

        let stream = TcpStream::connect(addr).unwrap();
        let remote = RemoteFs::from_stream(stream);
        Self {
            remote,
            root,
            server: Some(server),
        }
    }

    /// Authenticated, mounted client ready for filesystem traffic.
    fn mounted(readonly: bool) -> Self {
        let harness = Self::start(readonly);
        harness.remote.send_xauth(b"DUMMY AUTH").unwrap();
        harness.remote.mount(harness.root.path()).unwrap();
        harness
    }

    fn local(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    fn finish(mut self) {
        self.remote.quit();
        self.server
            .take()
            .unwrap()
            .join()
            .unwrap()
            .expect("server session failed");
    }
}

fn errno_of(err: RpcError) -> i32 {
    match err {
        RpcError::Errno(errno) => errno,
        RpcError::Transport(e) => panic!("expected an errno, got transport error: {e}"),
    }
}

#[test]
fn write_then_read_round_trips() {
    let h = Harness::mounted(false);

    h.remote
        .mknod(Path::new("/f"), libc::S_IFREG | 0o644, 0)
        .unwrap();
    assert_eq!(h.remote.write(Path::new("/f"), 0, b"hello").unwrap(), 5);

    let data = h.remote.read(Path::new("/f"), 5, 0).unwrap();
    assert_eq!(data, b"hello");

    // Zero-sized read: OK with no payload bytes.
    assert!(h.remote.read(Path::new("/f"), 0, 0).unwrap().is_empty());

    // Reads past EOF are short.
    let tail = h.remote.read(Path::new("/f"), 64, 3).unwrap();
    assert_eq!(tail, b"lo");

    let st = h.remote.getattr(Path::new("/f")).unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFREG);

    h.finish();
}

#[test]
fn rename_moves_across_directories() {
    let h = Harness::mounted(false);

    h.remote.mkdir(Path::new("/a"), 0o755).unwrap();
    h.remote.mkdir(Path::new("/b"), 0o755).unwrap();
    h.remote
        .mknod(Path::new("/a/x"), libc::S_IFREG | 0o644, 0)
        .unwrap();
    let before = h.remote.getattr(Path::new("/a/x")).unwrap();

    h.remote.rename(Path::new("/a/x"), Path::new("/b/x")).unwrap();

    let err = h.remote.getattr(Path::new("/a/x")).unwrap_err();
    assert_eq!(errno_of(err), libc::ENOENT);
    let after = h.remote.getattr(Path::new("/b/x")).unwrap();
    assert_eq!(after.ino, before.ino);

    h.finish();
}

#[test]
fn readdir_matches_the_local_listing() {
    let h = Harness::mounted(false);

    for name in ["one", "two", "three"] {
        std::fs::write(h.local(name), b"x").unwrap();
    }
    std::fs::create_dir(h.local("sub")).unwrap();

    let mut names: Vec<String> = h
        .remote
        .readdir(Path::new("/"))
        .unwrap()
        .iter()
        .map(|d| String::from_utf8(d.name.clone()).unwrap())
        .collect();
    names.sort();

    let mut expected: Vec<String> = std::fs::read_dir(h.root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .chain([".".to_string(), "..".to_string()])
        .collect();
    expected.sort();

    assert_eq!(names, expected);

    let sub = h
        .remote
        .readdir(Path::new("/sub"))
        .unwrap();
    let sub_names: Vec<&[u8]> = sub.iter().map(|d| d.name.as_slice()).collect();
    assert_eq!(sub_names, [b".".as_slice(), b"..".as_slice()]);

    h.finish();
}

#[test]
fn symlinks_read_back_inside_the_share() {
    let h = Harness::mounted(false);

    std::fs::write(h.local("target"), b"x").unwrap();
    h.remote
        .symlink(Path::new("/target"), Path::new("/ln"))
        .unwrap();

    // The on-disk target carries the server-side prefix; the client sees it
    // relative to the share again.
    let target = h.remote.readlink(Path::new("/ln")).unwrap();
    assert_eq!(target, b"/target");

    let st = h.remote.getattr(Path::new("/ln")).unwrap();
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFLNK);

    h.finish();
}

#[test]
fn read_only_server_refuses_write_access() {
    let h = Harness::mounted(true);

    std::fs::write(h.local("f"), b"data").unwrap();

    // Write-intent open is refused before any file is touched.
    let err = h.remote.open(Path::new("/f"), libc::O_WRONLY).unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);
    let err = h.remote.open(Path::new("/f"), libc::O_RDWR).unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);
    h.remote.open(Path::new("/f"), libc::O_RDONLY).unwrap();

    // A WRITE is refused too, and its payload is drained: the connection
    // keeps working afterwards.
    let err = h.remote.write(Path::new("/f"), 0, b"nope").unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);
    assert_eq!(h.remote.read(Path::new("/f"), 4, 0).unwrap(), b"data");

    let err = h.remote.mkdir(Path::new("/d"), 0o755).unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);

    h.finish();
}

#[test]
fn operations_before_auth_close_the_session() {
    let h = Harness::start(false);

    let err = h.remote.getattr(Path::new("/")).unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);

    // The server hung up; the next exchange is a transport failure.
    assert!(matches!(
        h.remote.ping().unwrap_err(),
        RpcError::Transport(_)
    ));

    h.server.unwrap().join().unwrap().unwrap();
}

#[test]
fn operations_before_mount_fail_but_keep_the_session() {
    let h = Harness::start(false);
    h.remote.send_xauth(b"DUMMY AUTH").unwrap();

    let err = h.remote.getattr(Path::new("/")).unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);

    h.remote.mount(h.root.path()).unwrap();
    h.remote.ping().unwrap();
    h.remote.getattr(Path::new("/")).unwrap();

    h.finish();
}

#[test]
fn escaping_paths_are_refused() {
    let h = Harness::mounted(false);

    let err = h.remote.getattr(Path::new("/../etc/passwd")).unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);

    let err = h
        .remote
        .unlink(Path::new("/a/../../escape"))
        .unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);

    h.finish();
}

#[test]
fn overlong_paths_are_refused_at_the_boundary() {
    let h = Harness::mounted(false);

    let room = PATH_MAX - h.root.path().as_os_str().len();
    let fits = format!("/{}", "x".repeat(room - 1));
    let too_long = format!("/{}", "x".repeat(room));

    // Exactly at the limit: accepted by the protocol layer, so the errno
    // comes from the local lookup instead of the EACCES gate.
    let errno = errno_of(h.remote.getattr(Path::new(&fits)).unwrap_err());
    assert!(matches!(errno, libc::ENOENT | libc::ENAMETOOLONG));

    let err = h.remote.getattr(Path::new(&too_long)).unwrap_err();
    assert_eq!(errno_of(err), libc::EACCES);

    h.finish();
}

#[test]
fn statfs_reports_the_backing_filesystem() {
    let h = Harness::mounted(false);

    let st = h.remote.statfs(Path::new("/")).unwrap();
    assert!(st.bsize > 0);
    assert!(st.blocks > 0);
    assert!(st.namelen > 0);

    h.finish();
}

#[test]
fn chmod_truncate_and_utime_apply() {
    let h = Harness::mounted(false);

    std::fs::write(h.local("f"), b"0123456789").unwrap();

    h.remote.chmod(Path::new("/f"), 0o600).unwrap();
    h.remote.truncate(Path::new("/f"), 4).unwrap();
    h.remote.utime(Path::new("/f"), 1_000_000, 2_000_000).unwrap();

    let st = h.remote.getattr(Path::new("/f")).unwrap();
    assert_eq!(st.mode & 0o7777, 0o600);
    assert_eq!(st.size, 4);
    assert_eq!(st.atime, 1_000_000);
    assert_eq!(st.mtime, 2_000_000);

    h.finish();
}

#[test]
fn session_survives_idle_periods() {
    let h = Harness::mounted(false);

    // A filesystem operation marks the session mounted...
    std::fs::write(h.local("f"), b"still here").unwrap();
    assert_eq!(h.remote.read(Path::new("/f"), 32, 0).unwrap(), b"still here");

    // ...then an idle stretch longer than the server's tick drives the
    // unmount path, and the session keeps serving afterwards.
    thread::sleep(Duration::from_millis(5500));
    h.remote.ping().unwrap();
    assert_eq!(h.remote.read(Path::new("/f"), 32, 0).unwrap(), b"still here");

    h.finish();
}

#[test]
fn unknown_extension_opcodes_fail_cleanly() {
    use ltspfs::wire::{Opcode, PacketBuf};

    let h = Harness::mounted(false);

    // RELEASE is registered but unimplemented; the reply is FAIL+ENOSYS and
    // the session keeps serving.
    let mut pkt = PacketBuf::request(Opcode::Release);
    pkt.enc().put_bytes(b"/f");
    let err = h.remote.raw_call(pkt.finish()).unwrap_err();
    assert_eq!(errno_of(err), libc::ENOSYS);

    h.remote.ping().unwrap();
    h.finish();
}
