//! Process execution on container values.
//!
//! `with_exec` appends an exec node to the rootfs graph and runs it through
//! the engine, returning a container whose rootfs is the post-exec tree and
//! whose `last_exec` carries the exit code and output streams. A non-zero
//! exit is data, not an error.

use tracing::debug;

use crate::container::config::LastExec;
use crate::container::Container;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::opgraph::{ExecOp, OpNode, OpRef};
use crate::pathutil;

/// Optional inputs to [`Container::with_exec_opts`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Bytes delivered to the process as standard input.
    pub stdin: Option<Vec<u8>>,
    /// Rootfs path that additionally receives the stdout stream.
    pub redirect_stdout: Option<String>,
    /// Rootfs path that additionally receives the stderr stream.
    pub redirect_stderr: Option<String>,
    /// Grants the process privileged access to the build daemon. The
    /// security boundary is the backend's concern.
    pub experimental_privileged_nesting: bool,
}

impl Container {
    /// Runs a command in this container.
    ///
    /// The effective command is `entrypoint ++ args`; if both are empty the
    /// call fails eagerly with [`Error::NoCommand`]. See
    /// [`Container::with_exec_opts`] for the full contract.
    pub async fn with_exec<I, S>(&self, engine: &Engine, args: I) -> Result<Container>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_exec_opts(engine, args, ExecOptions::default())
            .await
    }

    /// Runs a command with explicit options.
    ///
    /// Mounts are overlaid for the duration of the run and excised from the
    /// committed rootfs; bound services are started first and kept alive
    /// until the run completes. Secrets are injected through the backend's
    /// secret channel and never logged. Only a failure to *start* the
    /// process errors (`ExecStartFailed`); the exit code, whatever it is,
    /// lands in `exit_code`/`stdout`/`stderr` on the returned container.
    pub async fn with_exec_opts<I, S>(
        &self,
        engine: &Engine,
        args: I,
        options: ExecOptions,
    ) -> Result<Container>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        let mut command = self.config.entrypoint.clone().unwrap_or_default();
        command.extend(args);
        if command.is_empty() {
            return Err(Error::NoCommand);
        }

        let workdir = self.config.workdir.as_deref();
        let redirect_stdout = options
            .redirect_stdout
            .as_deref()
            .map(|p| pathutil::resolve(workdir, p))
            .transpose()?;
        let redirect_stderr = options
            .redirect_stderr
            .as_deref()
            .map(|p| pathutil::resolve(workdir, p))
            .transpose()?;

        // Canonical order inside the node: mounts by path, services by
        // alias. Declaration order stays observable on the value itself.
        let mut mounts = self.mounts.clone();
        mounts.sort_by(|a, b| a.path.cmp(&b.path));
        let mut services = self.services.clone();
        services.sort_by(|a, b| a.alias.cmp(&b.alias));

        let exec = ExecOp {
            args: command.clone(),
            env: self.config.env.clone(),
            secret_env: self.secret_envs.clone(),
            mounts,
            workdir: self.config.workdir.clone(),
            user: self.config.user.clone(),
            stdin: options.stdin,
            redirect_stdout,
            redirect_stderr,
            privileged: options.experimental_privileged_nesting,
            services,
        };

        let node = OpRef::new(OpNode::Exec {
            base: self.rootfs.clone(),
            exec,
        });

        debug!(command = ?command, platform = %self.platform, "running exec");
        let outcome = engine.run_exec(self, &node).await?;

        let mut next = self.derive();
        next.rootfs = node;
        next.last_exec = Some(LastExec {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        });
        Ok(next)
    }

    /// Deprecated exec surface: identical to [`Container::with_exec`] when
    /// `args` is given; otherwise the configured default args are used, and
    /// with neither the call fails with [`Error::NoCommand`].
    #[deprecated(note = "use `with_exec` instead")]
    pub async fn exec(&self, engine: &Engine, args: Option<&[&str]>) -> Result<Container> {
        let args: Vec<String> = match args {
            Some(args) => args.iter().map(|s| s.to_string()).collect(),
            None => self.config.default_args.clone().ok_or(Error::NoCommand)?,
        };
        self.with_exec(engine, args).await
    }

    /// Exit code of the last exec, or `None` if this value chain has never
    /// executed.
    pub fn exit_code(&self) -> Option<i64> {
        self.last_exec.as_ref().map(|e| e.exit_code)
    }

    /// Captured stdout of the last exec, or `None` if never executed.
    pub async fn stdout(&self, engine: &Engine) -> Result<Option<String>> {
        match &self.last_exec {
            Some(last) => {
                let bytes = engine.read_stream(&last.stdout).await?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            None => Ok(None),
        }
    }

    /// Captured stderr of the last exec, or `None` if never executed.
    pub async fn stderr(&self, engine: &Engine) -> Result<Option<String>> {
        match &self.last_exec {
            Some(last) => {
                let bytes = engine.read_stream(&last.stderr).await?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            None => Ok(None),
        }
    }
}
