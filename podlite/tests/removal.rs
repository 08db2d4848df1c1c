//! Integration tests for removing containers, volumes and pods.

mod common;

use common::TestRuntime;
use podlite::container::config::NamedVolume;
use podlite::pod::PodConfig;
use podlite::volume::config::VolumeConfig;
use podlite::{ContainerConfig, ContainerStatus, PodliteError};

fn using_volume(name: &str, volume: &str) -> ContainerConfig {
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
// CONTAINERS
// ============================================================================

#[test]
fn removing_missing_container_succeeds() {
    let ctx = TestRuntime::new();
    ctx.runtime
        .remove_container("nonexistent", false, None)
        .expect("missing container counts as removed");
}

#[test]
fn remove_prepared_container_releases_everything() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();
    ctr.prepare().unwrap();
    ctr.generate_spec().unwrap();
    let state = ctr.sync().unwrap();
    let static_dir = ctr.config().static_dir.clone();
    assert!(static_dir.exists());
    assert!(state.run_dir.exists());

    ctx.runtime.remove_container("web", false, None).unwrap();

    assert!(ctx.runtime.container("web").unwrap_err().is_not_found());
    assert_eq!(ctx.unmounts(), 1);
    assert_eq!(ctx.teardowns(), vec![state.net_ns.clone()]);
    assert!(!static_dir.exists());
    assert!(!state.run_dir.exists());

    // The name is free again.
    ctx.runtime
        .create_container(ContainerConfig::new("web"))
        .expect("name reusable after removal");
}

#[test]
fn running_container_needs_force() {
    let ctx = TestRuntime::new();
    let ctr = ctx
        .runtime
        .create_container(ContainerConfig::new("web"))
        .unwrap();
    ctr.modify_state(|state| {
        state.status = ContainerStatus::Running;
        state.pid = Some(4242);
    })
    .unwrap();

    assert!(matches!(
        ctx.runtime.remove_container("web", false, None),
        Err(PodliteError::InvalidState(_))
    ));
    assert!(ctx.oci.stopped.lock().is_empty());

    ctx.runtime.remove_container("web", true, None).unwrap();
    assert_eq!(*ctx.oci.stopped.lock(), vec![ctr.id().clone()]);
    assert!(ctx.runtime.container("web").unwrap_err().is_not_found());
}

#[test]
fn dependents_block_removal_unless_forced() {
    let ctx = TestRuntime::new();
    let base = ctx
        .runtime
        .create_container(ContainerConfig::new("base"))
        .unwrap();
    let mut config = ContainerConfig::new("sidecar");
    config.dependencies.push(base.id().clone());
    ctx.runtime.create_container(config).unwrap();

    assert!(matches!(
        ctx.runtime.remove_container("base", false, None),
        Err(PodliteError::Busy(_))
    ));
    assert!(ctx.runtime.container("sidecar").is_ok());

    ctx.runtime.remove_container("base", true, None).unwrap();
    assert!(ctx.runtime.container("base").unwrap_err().is_not_found());
    assert!(ctx.runtime.container("sidecar").unwrap_err().is_not_found());
}

// ============================================================================
// VOLUMES
// ============================================================================

#[test]
fn remove_volume_twice_is_idempotent() {
    let ctx = TestRuntime::new();
    let volume = ctx.runtime.create_volume(VolumeConfig::new("data")).unwrap();
    let data_dir = volume.config().mount_point.clone();
    assert!(data_dir.is_dir());

    ctx.runtime.remove_volume("data", false, None).unwrap();
    ctx.runtime.remove_volume("data", false, None).unwrap();

    assert!(ctx.runtime.volume("data").unwrap_err().is_not_found());
    assert!(!data_dir.exists());
}

#[test]
fn volume_in_use_needs_force() {
    let ctx = TestRuntime::new();
    ctx.runtime.create_volume(VolumeConfig::new("data")).unwrap();
    ctx.runtime
        .create_container(using_volume("db", "data"))
        .unwrap();

    assert!(matches!(
        ctx.runtime.remove_volume("data", false, None),
        Err(PodliteError::Busy(_))
    ));

    ctx.runtime.remove_volume("data", true, None).unwrap();
    assert!(ctx.runtime.container("db").unwrap_err().is_not_found());
    assert!(ctx.runtime.volume("data").unwrap_err().is_not_found());
}

#[test]
fn plugin_volume_removal_reaches_driver() {
    let ctx = TestRuntime::new();
    let mut config = VolumeConfig::new("remote");
    config.driver = common::FAKE_DRIVER.to_string();
    ctx.runtime.create_volume(config).unwrap();

    ctx.runtime.remove_volume("remote", false, None).unwrap();
    assert_eq!(*ctx.driver.removed.lock(), vec!["remote".to_string()]);
}

#[test]
fn duplicate_volume_name_is_rejected() {
    let ctx = TestRuntime::new();
    ctx.runtime.create_volume(VolumeConfig::new("data")).unwrap();
    assert!(matches!(
        ctx.runtime.create_volume(VolumeConfig::new("data")),
        Err(PodliteError::NameExists(_))
    ));
}

// ============================================================================
// PODS
// ============================================================================

#[test]
fn pod_with_members_needs_force() {
    let ctx = TestRuntime::new();
    let pod_id = ctx.runtime.create_pod(PodConfig::new("stack")).unwrap();

    let mut infra = ContainerConfig::new("stack-infra");
    infra.pod = Some(pod_id.clone());
    let infra = ctx.runtime.create_container(infra).unwrap();

    let mut app = ContainerConfig::new("stack-app");
    app.pod = Some(pod_id.clone());
    app.namespaces.net = Some(infra.id().clone());
    ctx.runtime.create_container(app).unwrap();

    assert!(matches!(
        ctx.runtime.remove_pod("stack", false, None),
        Err(PodliteError::Busy(_))
    ));
    assert_eq!(ctx.runtime.containers().unwrap().len(), 2);

    ctx.runtime.remove_pod("stack", true, None).unwrap();
    assert!(ctx.runtime.pod("stack").unwrap_err().is_not_found());
    assert!(ctx.runtime.containers().unwrap().is_empty());

    ctx.runtime
        .remove_pod("stack", false, None)
        .expect("missing pod counts as removed");
}

#[test]
fn empty_pod_is_removed_without_force() {
    let ctx = TestRuntime::new();
    ctx.runtime.create_pod(PodConfig::new("empty")).unwrap();
    ctx.runtime.remove_pod("empty", false, None).unwrap();
    assert!(ctx.runtime.pod("empty").unwrap_err().is_not_found());
}
