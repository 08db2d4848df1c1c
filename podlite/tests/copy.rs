//! Integration tests for stat and copy on stopped containers.

mod common;

use std::io::Read;

use common::TestRuntime;
use podlite::container::config::NamedVolume;
use podlite::volume::config::VolumeConfig;
use podlite::ContainerConfig;

fn archive_with(name: &str, content: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, content).unwrap();
    builder.into_inner().unwrap()
}

#[test]
fn stat_root_means_root_contents() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();

    let (root_info, root, host) = ctr.stat("/").expect("stat /");
    let (dot_info, dot_root, dot_host) = ctr.stat("/.").expect("stat /.");

    assert_eq!(root_info, dot_info);
    assert_eq!((root, host), (dot_root, dot_host));
    assert!(root_info.is_dir);
    assert_eq!(root_info.link_target, "/.");

    // The stopped container was mounted for each call and released again.
    assert!(!ctr.sync().unwrap().mounted);
    assert_eq!(ctx.unmounts(), 2);
}

#[test]
fn stat_file_in_rootfs() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();

    let (info, root, host) = ctr.stat("/etc/os-release").unwrap();
    assert_eq!(info.name, "os-release");
    assert_eq!(info.size, "ID=fake\n".len() as u64);
    assert!(!info.is_dir);
    assert_eq!(info.link_target, "/etc/os-release");
    assert_eq!(root, ctx.storage.rootfs(ctr.id()));
    assert_eq!(host, root.join("etc/os-release"));

    assert!(ctr.stat("/etc/missing").unwrap_err().is_not_found());
    assert!(ctr.stat("/etc/*").unwrap_err().is_not_found());
}

#[test]
fn stat_on_volume_hides_host_path() {
    let ctx = TestRuntime::new();
    let volume = ctx
        .runtime
        .create_volume(VolumeConfig::new("data"))
        .unwrap();
    std::fs::write(volume.config().mount_point.join("dump.sql"), b"select 1;").unwrap();

    let mut config = ContainerConfig::new("db");
    config.named_volumes.push(NamedVolume {
        name: "data".into(),
        dest: "/var/lib/db".into(),
        options: Vec::new(),
        sub_path: None,
    });
    let ctr = ctx.runtime.create_container(config).unwrap();

    let (info, root, _) = ctr.stat("/var/lib/db/dump.sql").unwrap();
    assert_eq!(root, volume.config().mount_point);
    assert_eq!(info.link_target, "/var/lib/db/dump.sql");
    assert_eq!(info.size, 9);
}

#[test]
fn copy_into_then_out_of_stopped_container() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();

    let archive = archive_with("motd", b"welcome\n");
    ctr.copy_to_container("/etc", &mut archive.as_slice())
        .expect("copy in");
    let on_host = ctx.storage.rootfs(ctr.id()).join("etc/motd");
    assert_eq!(std::fs::read(&on_host).unwrap(), b"welcome\n");

    let mut out: Vec<u8> = Vec::new();
    ctr.copy_from_container("/etc/motd", &mut out).expect("copy out");
    let mut archive = tar::Archive::new(out.as_slice());
    let mut entries = archive.entries().unwrap();
    let mut entry = entries.next().unwrap().unwrap();
    assert_eq!(entry.path().unwrap().to_string_lossy(), "motd");
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    assert_eq!(content, "welcome\n");
}

#[test]
fn copy_into_missing_directory_fails() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();

    let archive = archive_with("motd", b"x");
    assert!(ctr.copy_to_container("/srv/none", &mut archive.as_slice()).is_err());
}
