//! Docker-backed isolation provider.

use std::{borrow::Cow, path::Path};

use anyhow::Context;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
        WaitContainerOptions,
    },
    models::{HostConfig, Mount, MountTypeEnum},
    Docker,
};
use derive_builder::Builder;
use tokio_stream::StreamExt;

use crate::{config::SandboxConfig, util::names::transform_string_as_docker_tag};

use super::{
    model::{CommandRunOptions, ExitStatus, IsolationProvider, ProcessOutput, SandboxJob},
    util::{is_recoverable_error, SizeConstraintBytesMut},
};

#[derive(Debug, Builder)]
#[builder(setter(into, strip_option))]
pub struct CreateContainerConfig {
    /// Mounting local folders into containers
    #[builder(default)]
    mounts: Vec<Mount>,

    /// A tag for this container. Not used in any docker commands, purely for labelling & debugging use.
    #[builder(default)]
    tag_name: Option<String>,

    /// The user to be used when running docker commands
    #[builder(default)]
    docker_user: Option<String>,

    /// The memory limit of this container
    #[builder(default)]
    mem_limit: Option<i64>,

    /// The maximum number of processes inside this container
    #[builder(default)]
    pids_limit: Option<i64>,

    #[builder(default)]
    working_dir: Option<String>,

    /// `KEY=value` pairs
    #[builder(default)]
    env: Vec<String>,

    /// The command the container starts with
    #[builder(default)]
    cmd: Vec<String>,

    /// Whether network is allowed in this container
    #[builder(default = "false")]
    network_enabled: bool,
}

/// A single-use container. Always call [`Container::remove`]; if it's dropped
/// without being removed, removal is handed to a background task.
#[derive(Debug)]
pub struct Container {
    docker: Docker,
    id: String,
    tag: Option<String>,
    removed: bool,
}

impl Container {
    pub async fn create(
        docker: Docker,
        name: &str,
        image: String,
        cfg: CreateContainerConfig,
    ) -> Result<Self, bollard::errors::Error> {
        let network_mode = if cfg.network_enabled {
            None
        } else {
            Some(String::from("none"))
        };
        let res = docker
            .create_container(
                Some(CreateContainerOptions { name }),
                Config {
                    image: Some(image),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    // keep stdout and stderr apart
                    tty: Some(false),
                    user: cfg.docker_user,
                    working_dir: cfg.working_dir,
                    env: Some(cfg.env),
                    cmd: Some(cfg.cmd),
                    host_config: Some(HostConfig {
                        mounts: Some(cfg.mounts),
                        // set memory limits, no swap on top
                        memory: cfg.mem_limit,
                        memory_swap: cfg.mem_limit,
                        pids_limit: cfg.pids_limit,
                        network_mode,
                        ..Default::default()
                    }),
                    // Set network availability
                    network_disabled: Some(!cfg.network_enabled),
                    ..Default::default()
                },
            )
            .await?;
        Ok(Container {
            docker,
            id: res.id,
            tag: cfg.tag_name,
            removed: false,
        })
    }

    pub fn name(&self) -> Cow<'static, str> {
        if let Some(tag) = &self.tag {
            format!("Container {} ({})", tag, self.id).into()
        } else {
            format!("Container {}", self.id).into()
        }
    }

    pub async fn start(&self) -> Result<(), bollard::errors::Error> {
        self.docker
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await
    }

    /// Follow the container's output until it exits.
    pub async fn collect_output(
        &self,
        stdout: &mut SizeConstraintBytesMut,
        stderr: &mut SizeConstraintBytesMut,
    ) -> anyhow::Result<()> {
        let mut output = Box::pin(self.docker.logs(
            &self.id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "all".into(),
                ..Default::default()
            }),
        ));

        while let Some(v) = output.next().await {
            let out = match v {
                Ok(out) => out,
                Err(e) => {
                    if is_recoverable_error(&e) {
                        continue;
                    } else {
                        return Err(e.into());
                    }
                }
            };

            match out {
                LogOutput::StdErr { message } => stderr.append(&message),
                LogOutput::StdOut { message } => stdout.append(&message),
                LogOutput::StdIn { .. } => {}
                LogOutput::Console { .. } => {}
            }
        }
        Ok(())
    }

    /// Wait for the container to stop and read how it ended. The flag is set
    /// when the kernel killed it for exceeding its memory limit.
    pub async fn exit_status(&self) -> anyhow::Result<(ExitStatus, bool)> {
        let mut wait = Box::pin(self.docker.wait_container(
            &self.id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));
        while let Some(res) = wait.next().await {
            // Some daemon versions report nonzero exits as errors here; the
            // exit code is read from `inspect` below either way.
            if let Err(e) = res {
                tracing::debug!(container = %self.id, "wait_container: {}", e);
            }
        }

        let info = self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await?;
        let state = match info.state {
            Some(state) => state,
            None => return Ok((ExitStatus::Unknown, false)),
        };
        if state.oom_killed == Some(true) {
            return Ok((ExitStatus::Signal(9), true));
        }
        let status = state
            .exit_code
            .map_or(ExitStatus::Unknown, ExitStatus::ReturnCode);
        Ok((status, false))
    }

    /// Kill every process in the container.
    pub async fn kill(&self) -> Result<(), bollard::errors::Error> {
        self.docker
            .kill_container(&self.id, None::<KillContainerOptions<String>>)
            .await
    }

    pub async fn remove(&mut self) -> Result<(), bollard::errors::Error> {
        self.docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        self.removed = true;
        Ok(())
    }

    async fn run_to_end(&self, opt: &CommandRunOptions) -> anyhow::Result<ProcessOutput> {
        self.start().await.context("failed to start container")?;

        let mut stdout = SizeConstraintBytesMut::new(opt.stdout_size_limit);
        let mut stderr = SizeConstraintBytesMut::new(opt.stderr_size_limit);

        let collected =
            tokio::time::timeout(opt.timeout, self.collect_output(&mut stdout, &mut stderr)).await;

        let ret_code = match collected {
            Ok(res) => {
                res.context("failed to read container output")?;
                let (status, oom_killed) = self
                    .exit_status()
                    .await
                    .context("failed to inspect container")?;
                if oom_killed {
                    tracing::info!(container = %self.id, "container ran out of memory");
                    stderr.append(
                        format!("\nmemory limit of {} bytes exceeded\n", opt.mem_limit)
                            .as_bytes(),
                    );
                }
                status
            }
            Err(_) => {
                tracing::info!(container = %self.id, "time limit exceeded, killing container");
                // The container may have exited right at the deadline, in
                // which case there is nothing left to kill.
                if let Err(e) = self.kill().await {
                    tracing::warn!(container = %self.id, "failed to kill container: {}", e);
                }
                ExitStatus::Timeout
            }
        };

        let stdout_capped = stdout.is_oversized();
        if stdout_capped {
            tracing::info!(container = %self.id, limit = opt.stdout_size_limit, "stdout was capped");
        }

        Ok(ProcessOutput {
            ret_code,
            stdout: stdout.into_bytes(),
            stdout_capped,
            stderr: stderr.into_string(),
            runned_inside: self.name().into(),
        })
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let docker = self.docker.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let opt = RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    };
                    if let Err(e) = docker.remove_container(&id, Some(opt)).await {
                        tracing::error!(container = %id, "failed to remove leaked container: {}", e);
                    }
                });
            }
            Err(_) => tracing::error!(container = %id, "container leaked outside of a runtime"),
        }
    }
}

/// Bind the job folder into the container. Nothing the program does can
/// leave files behind in it.
fn job_mount(dir: &Path, mount_point: &str) -> Mount {
    Mount {
        target: Some(mount_point.to_owned()),
        source: Some(dir.display().to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Runs every job in a fresh container that is thrown away afterwards.
pub struct DockerProvider {
    docker: Docker,
    image: String,
    mount_point: String,
    docker_user: Option<String>,
}

impl DockerProvider {
    pub fn new(docker: Docker, cfg: &SandboxConfig) -> Self {
        DockerProvider {
            docker,
            image: cfg.image.clone(),
            mount_point: cfg.mount_point.clone(),
            docker_user: cfg.docker_user.clone(),
        }
    }

    pub fn connect(cfg: &SandboxConfig) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to docker")?;
        Ok(Self::new(docker, cfg))
    }

    /// Check that the daemon answers at all.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.docker.ping().await.context("docker daemon is unreachable")?;
        Ok(())
    }

    fn container_config(
        &self,
        job: &SandboxJob,
        opt: &CommandRunOptions,
    ) -> anyhow::Result<CreateContainerConfig> {
        let mut builder = CreateContainerConfigBuilder::default();
        builder
            .mounts(vec![job_mount(job.dir(), &self.mount_point)])
            .tag_name(job.label.clone())
            .mem_limit(opt.mem_limit)
            .pids_limit(opt.pids_limit)
            .working_dir(self.mount_point.clone())
            .env(
                job.entry
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>(),
            )
            .cmd(job.entry.command.clone())
            .network_enabled(false);
        if let Some(user) = &self.docker_user {
            builder.docker_user(user.clone());
        }
        builder
            .build()
            .map_err(|e| anyhow::anyhow!("invalid container config: {}", e))
    }
}

#[async_trait]
impl IsolationProvider for DockerProvider {
    fn name(&self) -> Cow<'static, str> {
        format!("docker ({})", self.image).into()
    }

    async fn run(&self, job: &SandboxJob, opt: &CommandRunOptions) -> anyhow::Result<ProcessOutput> {
        let name = format!(
            "riker-{}-{:08x}",
            transform_string_as_docker_tag(&job.label),
            rand::random::<u32>()
        );
        let cfg = self.container_config(job, opt)?;

        tracing::debug!(%name, image = %self.image, "creating container");
        let mut container = Container::create(self.docker.clone(), &name, self.image.clone(), cfg)
            .await
            .with_context(|| format!("failed to create container from image {}", self.image))?;

        let res = container.run_to_end(opt).await;

        if let Err(e) = container.remove().await {
            tracing::warn!(%name, "failed to remove container: {}", e);
        }
        res
    }
}
