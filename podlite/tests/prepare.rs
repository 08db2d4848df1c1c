//! Integration tests for preparing containers: network, storage and volumes.

mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use common::{FAKE_DRIVER, TestRuntime};
use podlite::ContainerConfig;
use podlite::container::config::NamedVolume;
use podlite::events::{EventStatus, EventType};
use podlite::volume::config::VolumeConfig;

fn plugin_volume(name: &str) -> VolumeConfig {
    let mut config = VolumeConfig::new(name);
    config.driver = FAKE_DRIVER.to_string();
    config
}

fn with_volume(name: &str, volume: &str) -> ContainerConfig {
    let mut config = ContainerConfig::new(name);
    config.named_volumes.push(NamedVolume {
        name: volume.to_string(),
        dest: "/data".to_string(),
        options: Vec::new(),
        sub_path: None,
    });
    config
}

// ============================================================================
// SUCCESS
// ============================================================================

#[test]
fn prepare_mounts_storage_and_creates_netns() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .expect("create");

    ctr.prepare().expect("prepare");

    let state = ctr.sync().unwrap();
    assert!(state.mounted);
    assert_eq!(state.mountpoint, Some(ctx.storage.rootfs(ctr.id())));
    assert_eq!(
        state.net_ns,
        Some(PathBuf::from(format!("/run/netns/podlite-{}", ctr.id().short())))
    );

    // A fresh handle sees the persisted state.
    let again = ctx.runtime.container("web").unwrap();
    assert!(again.sync().unwrap().mounted);

    let prepared = ctx
        .runtime
        .events()
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::Container && e.status == EventStatus::Prepare)
        .count();
    assert_eq!(prepared, 1);
}

#[test]
fn prepare_twice_reuses_mount_and_netns() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();

    ctr.prepare().unwrap();
    ctr.prepare().unwrap();

    assert_eq!(ctx.storage.mounts.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.network.setups.load(Ordering::SeqCst), 1);
}

#[test]
fn host_network_skips_namespace_creation() {
    let ctx = TestRuntime::new();
    let mut config = ContainerConfig::new("host");
    config.network_mode = podlite::container::config::NetworkMode::Host;
    let ctr = ctx.runtime.create_container(config).unwrap();

    ctr.prepare().unwrap();

    assert_eq!(ctx.network.setups.load(Ordering::SeqCst), 0);
    let state = ctr.sync().unwrap();
    assert!(state.mounted);
    assert!(state.net_ns.is_none());
}

// ============================================================================
// ROLLBACK
// ============================================================================

#[test]
fn network_failure_unmounts_storage() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();
    ctx.network.fail_setup.store(true, Ordering::SeqCst);

    let err = ctr.prepare().unwrap_err();
    assert!(err.to_string().contains("bridge is down"), "{}", err);

    let state = ctr.sync().unwrap();
    assert!(!state.mounted);
    assert!(state.mountpoint.is_none());
    assert!(state.net_ns.is_none());
    assert_eq!(ctx.unmounts(), 1);
    assert_eq!(ctx.teardowns(), vec![None]);
}

#[test]
fn storage_failure_tears_down_new_netns() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();
    ctx.storage.fail_mount.store(true, Ordering::SeqCst);

    let err = ctr.prepare().unwrap_err();
    assert!(err.to_string().contains("layer store unavailable"), "{}", err);

    let state = ctr.sync().unwrap();
    assert!(!state.mounted);
    assert!(state.net_ns.is_none());
    assert_eq!(ctx.unmounts(), 0);
    assert_eq!(
        ctx.teardowns(),
        vec![Some(PathBuf::from(format!("/run/netns/podlite-{}", ctr.id().short())))]
    );
}

#[test]
fn storage_failure_tears_down_existing_netns() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();
    ctr.prepare().unwrap();
    ctr.cleanup_storage().unwrap();
    let netns = ctr.sync().unwrap().net_ns;
    assert!(netns.is_some());

    ctx.storage.fail_mount.store(true, Ordering::SeqCst);
    ctr.prepare().unwrap_err();

    // The namespace from the first prepare goes too, and no new one was made.
    assert_eq!(ctx.network.setups.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.teardowns(), vec![netns]);
    let state = ctr.sync().unwrap();
    assert!(state.net_ns.is_none());
    assert!(state.network_status.is_empty());
    assert!(!state.mounted);
    assert_eq!(ctx.unmounts(), 1);
}

#[test]
fn failed_state_save_releases_network_and_storage() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();
    *ctx.storage.drop_state_in.lock() = Some(ctx.db_path());

    let err = ctr.prepare().unwrap_err();
    assert!(err.to_string().contains("saving prepared state"), "{}", err);

    assert_eq!(ctx.unmounts(), 1);
    assert_eq!(
        ctx.teardowns(),
        vec![Some(PathBuf::from(format!("/run/netns/podlite-{}", ctr.id().short())))]
    );
    let prepared = ctx
        .runtime
        .events()
        .read_all()
        .unwrap()
        .iter()
        .any(|e| e.status == EventStatus::Prepare);
    assert!(!prepared);
}

// ============================================================================
// VOLUMES
// ============================================================================

#[test]
fn shared_volume_is_mounted_once() {
    let ctx = TestRuntime::new();
    let volume = ctx.runtime.create_volume(plugin_volume("shared")).unwrap();
    let a = ctx.runtime.create_container(with_volume("a", "shared")).unwrap();
    let b = ctx.runtime.create_container(with_volume("b", "shared")).unwrap();

    a.prepare().unwrap();
    b.prepare().unwrap();
    assert_eq!(ctx.driver.mounts.load(Ordering::SeqCst), 1);
    assert_eq!(volume.sync().unwrap().mount_count, 2);
    assert!(volume.mount_point().unwrap().is_some());

    a.cleanup_storage().unwrap();
    assert_eq!(ctx.driver.unmounts.load(Ordering::SeqCst), 0);
    assert_eq!(volume.sync().unwrap().mount_count, 1);

    b.cleanup_storage().unwrap();
    assert_eq!(ctx.driver.unmounts.load(Ordering::SeqCst), 1);
    assert_eq!(volume.sync().unwrap().mount_count, 0);
    assert!(volume.mount_point().unwrap().is_none());
}

#[test]
fn unmounting_an_unmounted_volume_fails() {
    let ctx = TestRuntime::new();
    let volume = ctx.runtime.create_volume(plugin_volume("idle")).unwrap();
    assert!(matches!(
        volume.unmount(false),
        Err(podlite::PodliteError::VolumeNotMounted(_))
    ));
}

#[test]
fn cleanup_network_is_idempotent() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();
    ctr.prepare().unwrap();

    ctr.cleanup_network().unwrap();
    ctr.cleanup_network().unwrap();

    assert_eq!(ctx.teardowns().len(), 1);
    assert!(ctr.sync().unwrap().net_ns.is_none());
}
