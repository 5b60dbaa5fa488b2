//! Tests for the container value model: immutability, ID determinism,
//! configuration derivation rules, and mount bookkeeping.

use pipeforge::{CacheSharingMode, CacheVolume, Container, Directory, Error, NetworkProtocol, Platform};

fn scratch() -> Container {
    Container::scratch(Platform::new("linux", "amd64"))
}

// =============================================================================
// Immutability
// =============================================================================

#[test]
fn derivations_leave_the_receiver_unchanged() {
    let base = scratch()
        .with_env_variable("A", "1")
        .with_label("team", "infra");
    let before = base.clone();

    let _ = base.with_env_variable("A", "2");
    let _ = base.without_env_variable("A");
    let _ = base.with_user("builder");
    let _ = base.with_workdir("/src").unwrap();
    let _ = base.with_mounted_temp("/tmp/scratch").unwrap();
    let _ = base.with_new_file("/etc/motd", *b"hi", None).unwrap();
    let _ = base.with_exposed_port(80, NetworkProtocol::Tcp, None);
    let _ = base.pipeline("ci", None);

    assert_eq!(base, before);
    assert_eq!(base.id().unwrap(), before.id().unwrap());
}

// =============================================================================
// Identity
// =============================================================================

#[test]
fn structurally_equal_histories_yield_equal_ids() {
    let build = || {
        scratch()
            .with_env_variable("PATH", "/usr/bin")
            .with_workdir("/app")
            .unwrap()
            .with_new_file("main.rs", *b"fn main() {}", Some(0o600))
            .unwrap()
            .with_mounted_temp("/tmp/build")
            .unwrap()
    };
    assert_eq!(build().id().unwrap(), build().id().unwrap());

    let other = build().with_env_variable("PATH", "/bin");
    assert_ne!(build().id().unwrap(), other.id().unwrap());
}

#[test]
fn ids_roundtrip() {
    let container = scratch()
        .with_env_variable("A", "1")
        .with_label("tier", "web")
        .with_entrypoint(&["/bin/sh", "-c"])
        .with_default_args(&["status"])
        .with_exposed_port(8080, NetworkProtocol::Tcp, Some("http"))
        .with_new_file("/etc/conf", *b"x=1", None)
        .unwrap();

    let id = container.id().unwrap();
    let decoded = Container::from_id(&id).unwrap();
    assert_eq!(decoded, container);
    assert_eq!(decoded.id().unwrap(), id);
}

#[test]
fn malformed_ids_are_rejected() {
    assert!(pipeforge::ContainerId::parse("garbage").is_err());
}

// =============================================================================
// Env & Labels
// =============================================================================

#[test]
fn env_set_is_idempotent_and_remove_clears() {
    let once = scratch().with_env_variable("A", "1");
    let twice = once.with_env_variable("A", "1");
    assert_eq!(once, twice);

    let removed = twice.without_env_variable("A");
    assert_eq!(removed.env_variable("A"), None);
    assert!(removed.env_variables().is_empty());
}

#[test]
fn env_preserves_insertion_order_with_shadowing() {
    let container = scratch()
        .with_env_variable("A", "1")
        .with_env_variable("B", "2")
        .with_env_variable("A", "3");
    let names: Vec<&str> = container
        .env_variables()
        .iter()
        .map(|(n, _)| n.as_str())
        .collect();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(container.env_variable("A"), Some("3"));
}

#[test]
fn labels_follow_the_same_rules() {
    let container = scratch()
        .with_label("a", "1")
        .with_label("b", "2")
        .with_label("a", "3")
        .without_label("b");
    assert_eq!(container.label("a"), Some("3"));
    assert_eq!(container.label("b"), None);
}

// =============================================================================
// Mounts
// =============================================================================

#[test]
fn mount_at_same_path_replaces() {
    let cache = CacheVolume::new("build").unwrap();
    let container = scratch()
        .with_mounted_temp("/data")
        .unwrap()
        .with_mounted_cache("/data", &cache, None, CacheSharingMode::Shared)
        .unwrap();
    assert_eq!(container.mounts(), vec!["/data".to_string()]);
}

#[test]
fn mounts_listing_is_sorted() {
    let container = scratch()
        .with_mounted_temp("/zeta")
        .unwrap()
        .with_mounted_temp("/alpha")
        .unwrap()
        .with_mounted_temp("/m/nested")
        .unwrap();
    assert_eq!(
        container.mounts(),
        vec!["/alpha".to_string(), "/m/nested".to_string(), "/zeta".to_string()]
    );
}

#[test]
fn without_mount_removes_exact_path_only() {
    let container = scratch()
        .with_mounted_temp("/a")
        .unwrap()
        .with_mounted_temp("/a/b")
        .unwrap()
        .without_mount("/a")
        .unwrap();
    assert_eq!(container.mounts(), vec!["/a/b".to_string()]);
}

#[test]
fn mount_paths_must_be_absolute() {
    let err = scratch().with_mounted_temp("relative/path").unwrap_err();
    assert!(matches!(err, Error::InvalidPath { .. }));
}

// =============================================================================
// Rootfs Replacement
// =============================================================================

#[test]
fn with_rootfs_preserves_mounts_and_config() {
    let container = scratch()
        .with_env_variable("KEEP", "yes")
        .with_mounted_temp("/tmp/keep")
        .unwrap();
    let dir = Directory::scratch(Platform::new("linux", "amd64"))
        .with_new_file("etc/hosts", *b"localhost", None)
        .unwrap();

    let replaced = container.with_rootfs(&dir);
    assert_eq!(replaced.env_variable("KEEP"), Some("yes"));
    assert_eq!(replaced.mounts(), vec!["/tmp/keep".to_string()]);
    assert_eq!(replaced.exit_code(), None);
}

// =============================================================================
// Paths & Workdir
// =============================================================================

#[test]
fn workdir_resolves_relative_writes() {
    let container = scratch()
        .with_workdir("/src")
        .unwrap()
        .with_workdir("app")
        .unwrap();
    assert_eq!(container.workdir(), Some("/src/app"));

    let err = container.with_new_file("../../../escape", *b"x", None).unwrap_err();
    assert!(matches!(err, Error::InvalidPath { .. }));
}

// =============================================================================
// Ports, Endpoint, Pipeline
// =============================================================================

#[test]
fn exposed_ports_are_keyed_by_port_and_protocol() {
    let container = scratch()
        .with_exposed_port(53, NetworkProtocol::Udp, None)
        .with_exposed_port(53, NetworkProtocol::Tcp, None)
        .with_exposed_port(53, NetworkProtocol::Tcp, Some("dns"))
        .without_exposed_port(53, NetworkProtocol::Udp);

    let ports = container.exposed_ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, 53);
    assert_eq!(ports[0].description.as_deref(), Some("dns"));
}

#[test]
fn endpoint_uses_first_exposed_port() {
    let container = scratch()
        .with_exposed_port(6379, NetworkProtocol::Tcp, None)
        .with_exposed_port(9090, NetworkProtocol::Tcp, None);

    let hostname = container.hostname().unwrap();
    assert_eq!(
        container.endpoint(None, None).unwrap(),
        format!("{hostname}:6379")
    );
    assert_eq!(
        container.endpoint(Some(9090), Some("redis")).unwrap(),
        format!("redis://{hostname}:9090")
    );
}

#[test]
fn endpoint_without_ports_fails() {
    let err = scratch().endpoint(None, None).unwrap_err();
    assert!(matches!(err, Error::NoExposedPort));
}

#[test]
fn hostname_is_stable_per_id() {
    let a = scratch().with_env_variable("A", "1");
    let b = scratch().with_env_variable("A", "1");
    assert_eq!(a.hostname().unwrap(), b.hostname().unwrap());
    assert_ne!(
        a.hostname().unwrap(),
        a.with_env_variable("A", "2").hostname().unwrap()
    );
}

#[test]
fn pipeline_labels_nest() {
    let container = scratch()
        .pipeline("ci", Some("continuous integration"))
        .pipeline("test", None);
    assert_eq!(container.pipeline_label().unwrap().name, "ci/test");
}
