//! End-to-end exec tests against the in-process backend: command output,
//! env and secret injection, mount isolation, cache sharing modes,
//! redirects, and the deprecated `exec` surface.

use std::sync::Arc;

use pipeforge::{
    CacheSharingMode, CommandOutput, Engine, Error, ImageConfig, MemNode, MemoryBackend, Platform,
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
            MemNode::dir().with_file("/etc/os-release", *b"alpine"),
        )
        .unwrap();

    // echo NAME -> value of $NAME
    backend.register_command("env-echo", |ctx| {
        let name = ctx.args[1].clone();
        CommandOutput::success(format!("{}\n", ctx.env_var(&name).unwrap_or_default()))
    });
    // write PATH DATA
    backend.register_command("write", |ctx| {
        let (path, data) = (ctx.args[1].clone(), ctx.args[2].clone());
        if ctx.write_file(&path, data.into_bytes()) {
            CommandOutput::success(Vec::new())
        } else {
            CommandOutput::failure(1, format!("cannot write {path}"))
        }
    });
    // cat PATH
    backend.register_command("cat", |ctx| {
        let path = ctx.args[1].clone();
        match ctx.read_file(&path) {
            Some(data) => CommandOutput::success(data),
            None => CommandOutput::failure(1, format!("cat: {path}: no such file")),
        }
    });
    // incr PATH: non-atomic read-modify-write with a pause in the middle
    backend.register_command("incr", |ctx| {
        let path = ctx.args[1].clone();
        let current: u64 = ctx
            .read_file(&path)
            .and_then(|d| String::from_utf8(d).ok())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        std::thread::sleep(std::time::Duration::from_millis(25));
        ctx.write_file(&path, (current + 1).to_string().into_bytes());
        CommandOutput::success(Vec::new())
    });
    // stdin-echo
    backend.register_command("stdin-echo", |ctx| {
        CommandOutput::success(ctx.stdin.clone().unwrap_or_default())
    });

    let engine = Engine::new(backend.clone());
    (backend, engine)
}

// =============================================================================
// Basic Scenarios
// =============================================================================

#[tokio::test]
async fn scratch_echo() {
    let (_, engine) = setup();
    let out = engine
        .container(Some(linux_amd64()))
        .from(&engine, "alpine:3.18")
        .await
        .unwrap()
        .with_exec(&engine, ["echo", "hi"])
        .await
        .unwrap();

    assert_eq!(out.exit_code(), Some(0));
    assert_eq!(out.stdout(&engine).await.unwrap().as_deref(), Some("hi\n"));
    assert_eq!(out.stderr(&engine).await.unwrap().as_deref(), Some(""));
}

#[tokio::test]
async fn env_propagates_into_exec() {
    let (_, engine) = setup();
    let out = engine
        .container(Some(linux_amd64()))
        .from(&engine, "alpine:3.18")
        .await
        .unwrap()
        .with_env_variable("A", "1")
        .with_exec(&engine, ["env-echo", "A"])
        .await
        .unwrap();
    assert_eq!(out.stdout(&engine).await.unwrap().as_deref(), Some("1\n"));
}

#[tokio::test]
async fn never_executed_accessors_are_null() {
    let (_, engine) = setup();
    let container = engine.container(Some(linux_amd64()));
    assert_eq!(container.exit_code(), None);
    assert_eq!(container.stdout(&engine).await.unwrap(), None);
    assert_eq!(container.stderr(&engine).await.unwrap(), None);
}

#[tokio::test]
async fn nonzero_exit_is_data_not_error() {
    let (_, engine) = setup();
    let out = engine
        .container(Some(linux_amd64()))
        .with_exec(&engine, ["cat", "/missing"])
        .await
        .unwrap();
    assert_eq!(out.exit_code(), Some(1));
    let stderr = out.stderr(&engine).await.unwrap().unwrap();
    assert!(stderr.contains("no such file"));
}

#[tokio::test]
async fn unknown_command_fails_to_start() {
    let (_, engine) = setup();
    let err = engine
        .container(Some(linux_amd64()))
        .with_exec(&engine, ["definitely-not-registered"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecStartFailed { .. }));
}

#[tokio::test]
async fn empty_command_is_rejected_eagerly() {
    let (_, engine) = setup();
    let err = engine
        .container(Some(linux_amd64()))
        .with_exec(&engine, Vec::<String>::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoCommand));
}

#[tokio::test]
async fn entrypoint_prefixes_args() {
    let (_, engine) = setup();
    let out = engine
        .container(Some(linux_amd64()))
        .with_entrypoint(&["echo"])
        .with_exec(&engine, ["from", "entrypoint"])
        .await
        .unwrap();
    assert_eq!(
        out.stdout(&engine).await.unwrap().as_deref(),
        Some("from entrypoint\n")
    );
}

// =============================================================================
// Deprecated exec Surface
// =============================================================================

#[tokio::test]
#[allow(deprecated)]
async fn exec_falls_back_to_default_args() {
    let (_, engine) = setup();
    let container = engine
        .container(Some(linux_amd64()))
        .with_default_args(&["echo", "default"]);

    let out = container.exec(&engine, None).await.unwrap();
    assert_eq!(
        out.stdout(&engine).await.unwrap().as_deref(),
        Some("default\n")
    );

    let err = engine
        .container(Some(linux_amd64()))
        .exec(&engine, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoCommand));
}

// =============================================================================
// Rootfs Writes & Reads Around Exec
// =============================================================================

#[tokio::test]
async fn exec_writes_commit_to_rootfs() {
    let (_, engine) = setup();
    let out = engine
        .container(Some(linux_amd64()))
        .with_exec(&engine, ["write", "/out/result.txt", "payload"])
        .await
        .unwrap();

    let contents = out
        .file(&engine, "/out/result.txt")
        .unwrap()
        .contents(&engine)
        .await
        .unwrap();
    assert_eq!(contents, b"payload");
}

#[tokio::test]
async fn with_new_file_is_visible_to_exec() {
    let (_, engine) = setup();
    let out = engine
        .container(Some(linux_amd64()))
        .with_new_file("/etc/conf", *b"v=1", None)
        .unwrap()
        .with_exec(&engine, ["cat", "/etc/conf"])
        .await
        .unwrap();
    assert_eq!(out.stdout(&engine).await.unwrap().as_deref(), Some("v=1"));
}

#[tokio::test]
async fn workdir_resolves_relative_reader_paths() {
    let (_, engine) = setup();
    let container = engine
        .container(Some(linux_amd64()))
        .with_workdir("/srv")
        .unwrap()
        .with_new_file("data.txt", *b"d", None)
        .unwrap();

    let contents = container
        .file(&engine, "data.txt")
        .unwrap()
        .contents(&engine)
        .await
        .unwrap();
    assert_eq!(contents, b"d");
}

#[tokio::test]
async fn redirects_land_in_the_produced_rootfs() {
    let (_, engine) = setup();
    let opts = pipeforge::ExecOptions {
        redirect_stdout: Some("/logs/out.txt".to_string()),
        ..Default::default()
    };
    let out = engine
        .container(Some(linux_amd64()))
        .with_exec_opts(&engine, ["echo", "logged"], opts)
        .await
        .unwrap();

    let contents = out
        .file(&engine, "/logs/out.txt")
        .unwrap()
        .contents(&engine)
        .await
        .unwrap();
    assert_eq!(contents, b"logged\n");
}

#[tokio::test]
async fn stdin_reaches_the_process() {
    let (_, engine) = setup();
    let opts = pipeforge::ExecOptions {
        stdin: Some(b"piped".to_vec()),
        ..Default::default()
    };
    let out = engine
        .container(Some(linux_amd64()))
        .with_exec_opts(&engine, ["stdin-echo"], opts)
        .await
        .unwrap();
    assert_eq!(out.stdout(&engine).await.unwrap().as_deref(), Some("piped"));
}

// =============================================================================
// Mount Isolation
// =============================================================================

#[tokio::test]
async fn temp_mount_writes_are_excised() {
    let (_, engine) = setup();
    let out = engine
        .container(Some(linux_amd64()))
        .with_mounted_temp("/t")
        .unwrap()
        .with_exec(&engine, ["write", "/t/f", "x"])
        .await
        .unwrap();
    assert_eq!(out.exit_code(), Some(0));

    // Reading through the temp mount is refused.
    let err = out.file(&engine, "/t/f").unwrap_err();
    assert!(matches!(err, Error::MountNotReadable { kind: "tempfs", .. }));

    // And the committed rootfs never saw the write.
    let rootfs = out.rootfs(&engine).unwrap();
    let read = rootfs.file("t/f").unwrap().contents(&engine).await;
    assert!(matches!(read, Err(Error::Io(_))));
}

#[tokio::test]
async fn directory_mounts_read_through() {
    let (_, engine) = setup();
    let data = engine
        .directory(Some(linux_amd64()))
        .with_new_file("inner/seed.txt", *b"seed", None)
        .unwrap();

    let container = engine
        .container(Some(linux_amd64()))
        .with_mounted_directory("/data", &data)
        .unwrap();

    // Exec sees the mount...
    let out = container
        .with_exec(&engine, ["cat", "/data/inner/seed.txt"])
        .await
        .unwrap();
    assert_eq!(out.stdout(&engine).await.unwrap().as_deref(), Some("seed"));

    // ...and the value-level reader resolves through it.
    let contents = container
        .file(&engine, "/data/inner/seed.txt")
        .unwrap()
        .contents(&engine)
        .await
        .unwrap();
    assert_eq!(contents, b"seed");
}

// =============================================================================
// Secrets
// =============================================================================

#[tokio::test]
async fn secret_env_is_injected_but_not_plain() {
    let (_, engine) = setup();
    let secret = engine.secret("api-token", b"hunter2").await.unwrap();

    let container = engine
        .container(Some(linux_amd64()))
        .with_env_variable("TOKEN", "plain")
        .with_secret_variable("TOKEN", &secret);
    assert_eq!(container.env_variable("TOKEN"), None);

    let out = container
        .with_exec(&engine, ["env-echo", "TOKEN"])
        .await
        .unwrap();
    assert_eq!(
        out.stdout(&engine).await.unwrap().as_deref(),
        Some("hunter2\n")
    );
}

#[tokio::test]
async fn secret_mounts_resolve_in_exec_but_not_in_readers() {
    let (_, engine) = setup();
    let secret = engine.secret("deploy-key", b"-----KEY-----").await.unwrap();

    let container = engine
        .container(Some(linux_amd64()))
        .with_mounted_secret("/run/secrets/key", &secret)
        .unwrap();

    let out = container
        .with_exec(&engine, ["cat", "/run/secrets/key"])
        .await
        .unwrap();
    assert_eq!(
        out.stdout(&engine).await.unwrap().as_deref(),
        Some("-----KEY-----")
    );

    let err = container.file(&engine, "/run/secrets/key").unwrap_err();
    assert!(matches!(err, Error::MountNotReadable { kind: "secret", .. }));
}

#[tokio::test]
async fn socket_mounts_forward_but_are_opaque() {
    let (_, engine) = setup();
    let socket = engine.socket("/var/run/docker.sock").await.unwrap();

    let container = engine
        .container(Some(linux_amd64()))
        .with_unix_socket("/sock/agent", &socket)
        .unwrap();

    // The exec starts fine with the socket forwarded.
    let out = container.with_exec(&engine, ["echo", "up"]).await.unwrap();
    assert_eq!(out.exit_code(), Some(0));

    // Sockets are not readable artifacts.
    let err = container.file(&engine, "/sock/agent").unwrap_err();
    assert!(matches!(err, Error::MountNotReadable { kind: "socket", .. }));

    // Removing the socket removes the mount.
    let removed = container.without_unix_socket("/sock/agent").unwrap();
    assert!(removed.mounts().is_empty());
}

// =============================================================================
// Cache Volumes
// =============================================================================

#[tokio::test]
async fn shared_cache_is_visible_across_consumers() {
    let (_, engine) = setup();
    let cache = engine.cache_volume("shared-data").unwrap();

    let first = engine
        .container(Some(linux_amd64()))
        .with_env_variable("WHO", "first")
        .with_mounted_cache("/c", &cache, None, CacheSharingMode::Shared)
        .unwrap();
    let second = engine
        .container(Some(linux_amd64()))
        .with_env_variable("WHO", "second")
        .with_mounted_cache("/c", &cache, None, CacheSharingMode::Shared)
        .unwrap();

    first
        .with_exec(&engine, ["write", "/c/from-first", "1"])
        .await
        .unwrap();
    let out = second
        .with_exec(&engine, ["cat", "/c/from-first"])
        .await
        .unwrap();
    assert_eq!(out.exit_code(), Some(0));
    assert_eq!(out.stdout(&engine).await.unwrap().as_deref(), Some("1"));
}

#[tokio::test]
async fn private_cache_is_isolated_per_consumer() {
    let (_, engine) = setup();
    let cache = engine.cache_volume("private-data").unwrap();

    let base = engine
        .container(Some(linux_amd64()))
        .with_mounted_cache("/c", &cache, None, CacheSharingMode::Private)
        .unwrap();

    base.with_exec(&engine, ["write", "/c/mark", "1"])
        .await
        .unwrap();
    let out = base
        .with_env_variable("RUN", "2")
        .with_exec(&engine, ["cat", "/c/mark"])
        .await
        .unwrap();
    assert_eq!(out.exit_code(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locked_cache_serializes_concurrent_writers() {
    let (_, engine) = setup();
    let cache = engine.cache_volume("locked-counter").unwrap();

    let consumer = |tag: &str| {
        engine
            .container(Some(linux_amd64()))
            .with_env_variable("TAG", tag)
            .with_mounted_cache("/c", &cache, None, CacheSharingMode::Locked)
            .unwrap()
    };

    let a = consumer("a");
    let b = consumer("b");
    let (ra, rb) = tokio::join!(
        a.with_exec(&engine, ["incr", "/c/n"]),
        b.with_exec(&engine, ["incr", "/c/n"]),
    );
    ra.unwrap();
    rb.unwrap();

    let out = consumer("check")
        .with_exec(&engine, ["cat", "/c/n"])
        .await
        .unwrap();
    assert_eq!(out.stdout(&engine).await.unwrap().as_deref(), Some("2"));
}

// =============================================================================
// Directory Copies & Builds
// =============================================================================

#[tokio::test]
async fn with_directory_applies_include_then_exclude() {
    let (_, engine) = setup();
    let src = engine
        .directory(Some(linux_amd64()))
        .with_new_file("keep.rs", *b"k", None)
        .unwrap()
        .with_new_file("drop.rs", *b"d", None)
        .unwrap()
        .with_new_file("notes.txt", *b"n", None)
        .unwrap();

    let out = engine
        .container(Some(linux_amd64()))
        .with_directory("/src", &src, &["*.rs"], &["drop.rs"])
        .unwrap();

    let entries = out
        .directory(&engine, "/src")
        .unwrap()
        .entries(&engine)
        .await
        .unwrap();
    assert_eq!(entries, vec!["keep.rs".to_string()]);
}

#[tokio::test]
async fn build_runs_through_the_registered_frontend() {
    let (backend, engine) = setup();
    backend.set_build_handler(|request| {
        let mut tree = MemNode::dir();
        tree.insert(
            "/built",
            MemNode::file(request.dockerfile.clone().into_bytes(), 0o644),
        )?;
        Ok(tree)
    });

    let context = engine
        .directory(Some(linux_amd64()))
        .with_new_file("Dockerfile", *b"FROM scratch", None)
        .unwrap();
    let built = engine
        .container(Some(linux_amd64()))
        .build(&context, None, &[], None);

    let contents = built
        .file(&engine, "/built")
        .unwrap()
        .contents(&engine)
        .await
        .unwrap();
    assert_eq!(contents, b"./Dockerfile");
}

#[tokio::test]
async fn build_without_frontend_fails_at_force_time() {
    let (_, engine) = setup();
    let context = engine.directory(Some(linux_amd64()));
    let built = engine
        .container(Some(linux_amd64()))
        .build(&context, None, &[], None);

    let err = built
        .rootfs(&engine)
        .unwrap()
        .entries(&engine)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BuildFailed(_)));
}

// =============================================================================
// from() Semantics
// =============================================================================

#[tokio::test]
async fn from_pins_and_clears_image_ref() {
    let (_, engine) = setup();
    let pulled = engine
        .container(Some(linux_amd64()))
        .from(&engine, "alpine:3.18")
        .await
        .unwrap();

    let pinned = pulled.image_ref().unwrap().to_string();
    assert!(pinned.starts_with("docker.io/library/alpine@sha256:"));
    assert!(pulled.with_env_variable("A", "1").image_ref().is_none());
}

#[tokio::test]
async fn from_imports_image_config_under_local_fields() {
    let (backend, engine) = setup();
    let mut config = ImageConfig::default();
    config.entrypoint = Some(vec!["echo".to_string()]);
    config.env = vec![
        ("PATH".to_string(), "/usr/bin".to_string()),
        ("LANG".to_string(), "C".to_string()),
    ];
    config.workdir = Some("/app".to_string());
    backend
        .register_image("tool:1", &linux_amd64(), config, MemNode::dir())
        .unwrap();

    let container = engine
        .container(Some(linux_amd64()))
        .with_env_variable("PATH", "/custom")
        .from(&engine, "tool:1")
        .await
        .unwrap();

    assert_eq!(container.env_variable("PATH"), Some("/custom"));
    assert_eq!(container.env_variable("LANG"), Some("C"));
    assert_eq!(container.workdir(), Some("/app"));
    assert_eq!(container.entrypoint(), Some(&["echo".to_string()][..]));

    // The imported entrypoint applies to execs.
    let out = container.with_exec(&engine, ["imported"]).await.unwrap();
    assert_eq!(
        out.stdout(&engine).await.unwrap().as_deref(),
        Some("imported\n")
    );
}

#[tokio::test]
async fn from_unknown_image_fails() {
    let (_, engine) = setup();
    let err = engine
        .container(Some(linux_amd64()))
        .from(&engine, "ghost:1.0")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PullFailed { .. }));
}

#[tokio::test]
async fn from_rejects_malformed_references() {
    let (_, engine) = setup();
    let err = engine
        .container(Some(linux_amd64()))
        .from(&engine, "bad reference!")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PullFailed { .. }));
}

// =============================================================================
// Engine Behavior
// =============================================================================

#[tokio::test]
async fn structurally_equal_solves_are_single_flighted() {
    let (backend, engine) = setup();
    let container = engine
        .container(Some(linux_amd64()))
        .with_new_file("/etc/conf", *b"x", None)
        .unwrap();

    let dir = container.rootfs(&engine).unwrap();
    dir.entries(&engine).await.unwrap();
    let calls_after_first = backend.solve_calls();

    // Re-reading the same rootfs, and reading a subdirectory of it, reuse
    // the cached solve: with no mounts both resolve to the identical DAG.
    dir.entries(&engine).await.unwrap();
    container
        .directory(&engine, "/etc")
        .unwrap()
        .entries(&engine)
        .await
        .unwrap();
    assert_eq!(backend.solve_calls(), calls_after_first);
}

#[tokio::test]
async fn cancelled_engine_refuses_terminal_operations() {
    let backend = Arc::new(MemoryBackend::new());
    let token = tokio_util::sync::CancellationToken::new();
    let engine = Engine::with_token(backend, token.clone());
    token.cancel();

    let container = engine.container(Some(linux_amd64()));
    let err = container.with_exec(&engine, ["echo", "hi"]).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}
