//! Local container daemon driver
//! 本地容器守护进程驱动
//!
//! The synchronous build backend drives the container CLI as a child
//! process. The trait seam keeps the build engine testable without a
//! daemon on the host.
//! 同步构建后端以子进程方式驱动容器CLI。trait接缝使构建引擎在主机上
//! 没有守护进程时也可测试。

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::services::error::{ControlError, ControlResult};

/// Operations the build engine needs from a container runtime
/// 构建引擎需要容器运行时提供的操作
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from a context directory / 从上下文目录构建镜像
    async fn build(&self, context_dir: &Path, tag: &str) -> ControlResult<()>;

    /// Whether an image is present locally / 镜像是否存在于本地
    async fn image_exists(&self, tag: &str) -> ControlResult<bool>;

    /// Size in bytes of a local image, if known / 本地镜像的字节大小（如已知）
    async fn image_size(&self, tag: &str) -> ControlResult<Option<u64>>;

    /// Remove a local image / 删除本地镜像
    async fn remove_image(&self, tag: &str) -> ControlResult<()>;

    /// Apply an additional tag to an image / 为镜像添加额外标签
    async fn tag_image(&self, source: &str, target: &str) -> ControlResult<()>;

    /// Push a tag to its registry / 将标签推送到其仓库
    async fn push(&self, tag: &str) -> ControlResult<()>;

    /// Pull a tag from its registry / 从仓库拉取标签
    async fn pull(&self, tag: &str) -> ControlResult<()>;

    /// Log in to a registry / 登录仓库
    async fn login(&self, registry: &str, username: &str, password: &str) -> ControlResult<()>;
}

/// Container CLI implementation (docker-compatible) / 容器CLI实现（兼容docker）
pub struct ContainerCli {
    binary: String,
}

impl ContainerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str], envs: &[(&str, &str)]) -> ControlResult<String> {
        debug!(binary = %self.binary, ?args, "running container CLI");
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            command.env(key, value);
        }

        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::ImageBuild(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for ContainerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for ContainerCli {
    async fn build(&self, context_dir: &Path, tag: &str) -> ControlResult<()> {
        let context = context_dir.to_string_lossy();
        info!(tag = %tag, context = %context, "building image");
        // BuildKit enables the pip cache mount / BuildKit启用pip缓存挂载
        self.run(
            &["build", "--rm", "-t", tag, &context],
            &[("DOCKER_BUILDKIT", "1")],
        )
        .await?;
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> ControlResult<bool> {
        let mut command = Command::new(&self.binary);
        command
            .args(["image", "inspect", tag])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = command.status().await?;
        Ok(status.success())
    }

    async fn image_size(&self, tag: &str) -> ControlResult<Option<u64>> {
        match self
            .run(&["image", "inspect", "--format", "{{.Size}}", tag], &[])
            .await
        {
            Ok(output) => Ok(output.trim().parse::<u64>().ok()),
            Err(_) => Ok(None),
        }
    }

    async fn remove_image(&self, tag: &str) -> ControlResult<()> {
        self.run(&["rmi", tag], &[]).await?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> ControlResult<()> {
        self.run(&["tag", source, target], &[]).await?;
        Ok(())
    }

    async fn push(&self, tag: &str) -> ControlResult<()> {
        info!(tag = %tag, "pushing image");
        self.run(&["push", tag], &[])
            .await
            .map_err(|e| ControlError::RegistryPush(e.to_string()))?;
        Ok(())
    }

    async fn pull(&self, tag: &str) -> ControlResult<()> {
        info!(tag = %tag, "pulling image");
        self.run(&["pull", tag], &[]).await?;
        Ok(())
    }

    async fn login(&self, registry: &str, username: &str, password: &str) -> ControlResult<()> {
        // Password over stdin to keep it out of the process list
        // 密码通过stdin传递以避免出现在进程列表中
        let mut command = Command::new(&self.binary);
        command
            .args(["login", "--username", username, "--password-stdin", registry])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(password.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::RegistryPush(format!(
                "login to {registry} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}
