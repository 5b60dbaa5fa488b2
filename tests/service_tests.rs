//! Service lifecycle tests: lazy start, reference counting, transitive
//! bindings, and propagation onto returned artifacts.

use std::sync::Arc;

use pipeforge::{
    CommandOutput, Container, Engine, Error, ImageConfig, MemNode, MemoryBackend, NetworkProtocol,
    Platform,
};

fn linux_amd64() -> Platform {
    Platform::new("linux", "amd64")
}

fn setup() -> (Arc<MemoryBackend>, Engine) {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .register_image(
            "alpine:3.18",
            &linux_amd64(),
            ImageConfig::default(),
            MemNode::dir(),
        )
        .unwrap();

    // probe ALIAS PORT -> exit 0 when the alias resolves to a running
    // service exposing PORT
    backend.register_command("probe", |ctx| {
        let alias = ctx.args[1].clone();
        let port: u16 = ctx.args[2].parse().unwrap_or(0);
        if ctx.service_reachable(&alias, port) {
            CommandOutput::success(Vec::new())
        } else {
            CommandOutput::failure(1, format!("{alias}:{port} unreachable"))
        }
    });
    // probe-slow ALIAS PORT -> same, but holds the consumer open briefly
    backend.register_command("probe-slow", |ctx| {
        std::thread::sleep(std::time::Duration::from_millis(40));
        let alias = ctx.args[1].clone();
        let port: u16 = ctx.args[2].parse().unwrap_or(0);
        if ctx.service_reachable(&alias, port) {
            CommandOutput::success(Vec::new())
        } else {
            CommandOutput::failure(1, format!("{alias}:{port} unreachable"))
        }
    });

    (backend.clone(), Engine::new(backend))
}

fn redis(engine: &Engine) -> Container {
    engine
        .container(Some(linux_amd64()))
        .with_entrypoint(&["redis-server"])
        .with_exposed_port(6379, NetworkProtocol::Tcp, Some("redis"))
}

// =============================================================================
// Lazy Start & Teardown
// =============================================================================

#[tokio::test]
async fn binding_alone_starts_nothing() {
    let (backend, engine) = setup();
    let service = redis(&engine);
    let _client = engine
        .container(Some(linux_amd64()))
        .with_service_binding("db", &service)
        .unwrap();

    assert_eq!(backend.service_start_count(&service.hostname().unwrap()), 0);
    assert!(!engine.service_is_running(&service).await.unwrap());
}

#[tokio::test]
async fn consumer_exec_reaches_the_service() {
    let (backend, engine) = setup();
    let service = redis(&engine);
    let hostname = service.hostname().unwrap();

    let out = engine
        .container(Some(linux_amd64()))
        .from(&engine, "alpine:3.18")
        .await
        .unwrap()
        .with_service_binding("db", &service)
        .unwrap()
        .with_exec(&engine, ["probe", "db", "6379"])
        .await
        .unwrap();

    // The probe saw a running service on the declared port...
    assert_eq!(out.exit_code(), Some(0));
    assert_eq!(backend.service_start_count(&hostname), 1);
    // ...and the instance was torn down once the consumer finished.
    assert!(!backend.service_running(&hostname));
    assert!(!engine.service_is_running(&service).await.unwrap());
}

#[tokio::test]
async fn undeclared_ports_are_not_reachable() {
    let (_, engine) = setup();
    let service = redis(&engine);
    let out = engine
        .container(Some(linux_amd64()))
        .with_service_binding("db", &service)
        .unwrap()
        .with_exec(&engine, ["probe", "db", "5432"])
        .await
        .unwrap();
    assert_eq!(out.exit_code(), Some(1));
}

// =============================================================================
// Reference Counting
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_share_one_instance() {
    let (backend, engine) = setup();
    let service = redis(&engine);
    let hostname = service.hostname().unwrap();

    let consumer = |tag: &str| {
        engine
            .container(Some(linux_amd64()))
            .with_env_variable("TAG", tag)
            .with_service_binding("db", &service)
            .unwrap()
    };

    let container_a = consumer("a");
    let container_b = consumer("b");
    let (a, b) = tokio::join!(
        container_a.with_exec(&engine, ["probe-slow", "db", "6379"]),
        container_b.with_exec(&engine, ["probe-slow", "db", "6379"]),
    );
    assert_eq!(a.unwrap().exit_code(), Some(0));
    assert_eq!(b.unwrap().exit_code(), Some(0));

    assert_eq!(backend.service_start_count(&hostname), 1);
    assert!(!backend.service_running(&hostname));
}

#[tokio::test]
async fn sequential_consumers_restart_the_service() {
    let (backend, engine) = setup();
    let service = redis(&engine);
    let hostname = service.hostname().unwrap();

    for tag in ["first", "second"] {
        let out = engine
            .container(Some(linux_amd64()))
            .with_env_variable("TAG", tag)
            .with_service_binding("db", &service)
            .unwrap()
            .with_exec(&engine, ["probe", "db", "6379"])
            .await
            .unwrap();
        assert_eq!(out.exit_code(), Some(0));
    }

    // No consumer overlap, so each evaluation got its own instance.
    assert_eq!(backend.service_start_count(&hostname), 2);
    assert!(!backend.service_running(&hostname));
}

// =============================================================================
// Transitive Bindings
// =============================================================================

#[tokio::test]
async fn service_dependencies_start_and_stop_with_it() {
    let (backend, engine) = setup();
    let inner = engine
        .container(Some(linux_amd64()))
        .with_entrypoint(&["inner-daemon"])
        .with_exposed_port(5000, NetworkProtocol::Tcp, None);
    let outer = redis(&engine)
        .with_service_binding("upstream", &inner)
        .unwrap();

    let inner_host = inner.hostname().unwrap();
    let outer_host = outer.hostname().unwrap();

    let out = engine
        .container(Some(linux_amd64()))
        .with_service_binding("db", &outer)
        .unwrap()
        .with_exec(&engine, ["probe", "db", "6379"])
        .await
        .unwrap();
    assert_eq!(out.exit_code(), Some(0));

    assert_eq!(backend.service_start_count(&outer_host), 1);
    assert_eq!(backend.service_start_count(&inner_host), 1);
    assert!(!backend.service_running(&outer_host));
    assert!(!backend.service_running(&inner_host));
}

// =============================================================================
// Propagation to Artifacts
// =============================================================================

#[tokio::test]
async fn artifacts_keep_their_producers_services() {
    let (backend, engine) = setup();
    let service = redis(&engine);
    let hostname = service.hostname().unwrap();

    let client = engine
        .container(Some(linux_amd64()))
        .with_new_file("/report/out.txt", *b"done", None)
        .unwrap()
        .with_service_binding("db", &service)
        .unwrap();

    let report = client.directory(&engine, "/report").unwrap();
    let baseline = backend.service_start_count(&hostname);

    let entries = report.entries(&engine).await.unwrap();
    assert_eq!(entries, vec!["out.txt".to_string()]);

    // Reading the artifact re-acquired (and then released) the service.
    assert_eq!(backend.service_start_count(&hostname), baseline + 1);
    assert!(!backend.service_running(&hostname));
}

// =============================================================================
// Binding Bookkeeping
// =============================================================================

#[tokio::test]
async fn rebinding_an_alias_replaces_it() {
    let (_, engine) = setup();
    let first = redis(&engine);
    let second = redis(&engine).with_exposed_port(6380, NetworkProtocol::Tcp, None);

    let client = engine
        .container(Some(linux_amd64()))
        .with_service_binding("db", &first)
        .unwrap()
        .with_service_binding("db", &second)
        .unwrap();

    let out = client
        .with_exec(&engine, ["probe", "db", "6380"])
        .await
        .unwrap();
    assert_eq!(out.exit_code(), Some(0));
}

#[tokio::test]
async fn empty_alias_is_rejected() {
    let (_, engine) = setup();
    let service = redis(&engine);
    let err = engine
        .container(Some(linux_amd64()))
        .with_service_binding("", &service)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidId { .. }));
}
