//! Run executor: orchestrates runs against the cluster
//! 运行执行器：针对集群编排运行
//!
//! Sits between the run state machine and the Kubernetes adapter: validates
//! credentials, submits jobs, reconciles cluster state back onto runs, and
//! cancels or cleans up finished jobs. The executor never retries; callers
//! re-submit by creating new runs.
//! 位于运行状态机和Kubernetes适配器之间：验证凭证、提交作业、将集群状态
//! 调和回运行、取消或清理已完成的作业。执行器从不重试；调用方通过创建新
//! 运行来重新提交。

use std::sync::Arc;
use tracing::{info, warn};

use crate::k8s::jobs::{run_job_name, RunJobApi, RunJobRequest};
use crate::k8s::JobStatus;
use crate::services::credentials::CredentialService;
use crate::services::environment::EnvironmentService;
use crate::services::error::{ControlError, ControlResult};
use crate::services::run::{Run, RunService, RunStatus};

/// Default entry point when the caller names none / 调用方未指定时的默认入口
pub const DEFAULT_ENTRYPOINT: &str = "main.py";

/// Where run output lands inside the pod / 运行输出在Pod内的位置
pub const OUTPUT_PATH: &str = "/output";

/// Orchestrates submit/sync/cancel/cleanup for runs
/// 编排运行的提交/同步/取消/清理
#[derive(Clone)]
pub struct RunExecutor {
    runs: RunService,
    environments: EnvironmentService,
    credentials: CredentialService,
    jobs: Arc<dyn RunJobApi>,
    runs_namespace: String,
}

impl RunExecutor {
    pub fn new(
        runs: RunService,
        environments: EnvironmentService,
        credentials: CredentialService,
        jobs: Arc<dyn RunJobApi>,
        runs_namespace: impl Into<String>,
    ) -> Self {
        Self {
            runs,
            environments,
            credentials,
            jobs,
            runs_namespace: runs_namespace.into(),
        }
    }

    /// Submit a QUEUED run to the cluster / 将QUEUED运行提交到集群
    ///
    /// Credential validation happens before any run mutation: a missing or
    /// expired credential leaves the run QUEUED.
    /// 凭证验证发生在任何运行修改之前：凭证缺失或过期时运行保持QUEUED。
    pub async fn submit_run(&self, run_id: &str, entrypoint: Option<&str>) -> ControlResult<Run> {
        let run = self.runs.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        if run.status != RunStatus::Queued {
            return Err(ControlError::InvalidStateTransition {
                entity: "run".to_string(),
                from: run.status.as_str().to_string(),
                to: RunStatus::Starting.as_str().to_string(),
            });
        }

        // Environment must exist and carry a built image
        // 环境必须存在且带有已构建的镜像
        let environment = match self.environments.get_environment(&run.environment_id).await {
            Some(environment) => environment,
            None => {
                let reason = "environment not found".to_string();
                self.runs.mark_failed(run_id, None, &reason).await?;
                return Err(ControlError::EnvironmentNotReady {
                    environment_id: run.environment_id.clone(),
                    reason,
                });
            }
        };
        if environment.image_tag.is_empty() {
            let reason = "environment has no image tag".to_string();
            self.runs.mark_failed(run_id, None, &reason).await?;
            return Err(ControlError::EnvironmentNotReady {
                environment_id: environment.id.clone(),
                reason,
            });
        }

        // Validate every credential before touching the run
        // 在触碰运行之前验证每个凭证
        let mut secret_names = Vec::with_capacity(run.credential_ids.len());
        for credential_id in &run.credential_ids {
            let credential = self.credentials.get_credential(credential_id).await;
            match credential {
                None => {
                    return Err(ControlError::CredentialValidation {
                        message: format!("credential {credential_id} not found"),
                    });
                }
                Some(credential) if credential.is_expired() => {
                    return Err(ControlError::CredentialValidation {
                        message: format!("credential {credential_id} is expired"),
                    });
                }
                Some(_) => {
                    if let Some(secret_name) =
                        self.credentials.k8s_secret_name(credential_id).await
                    {
                        secret_names.push(secret_name);
                    }
                }
            }
        }

        // Deterministic job name; a failed store write leaves the run QUEUED
        // 确定性作业名；存储写入失败时运行保持QUEUED
        let job_name = run_job_name(&environment.id);
        let run = self.runs.start_run(run_id, &job_name).await?;

        let request = RunJobRequest {
            environment_id: environment.id.clone(),
            image_tag: environment.image_tag.clone(),
            resource_limits: environment.resource_limits.clone(),
            entrypoint: entrypoint.unwrap_or(DEFAULT_ENTRYPOINT).to_string(),
            secret_names,
        };

        match self.jobs.create_run_job(&request).await {
            Ok(created_name) => {
                info!(run_id = %run_id, job_name = %created_name, "submitted run");
                Ok(run)
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "job creation failed");
                self.runs.mark_failed(run_id, None, &e.to_string()).await
            }
        }
    }

    /// Reconcile cluster job state onto the run / 将集群作业状态调和到运行上
    pub async fn sync_run_status(&self, run_id: &str) -> ControlResult<Run> {
        let run = self.runs.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let Some(job_name) = run.job_name.clone() else {
            return Ok(run);
        };

        let info = match self
            .jobs
            .get_job_status(&job_name, &self.runs_namespace)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                // Degenerate states must not linger / 退化状态不得滞留
                warn!(run_id = %run_id, error = %e, "cluster error during sync, failing run");
                return self.runs.mark_failed(run_id, None, &e.to_string()).await;
            }
        };

        match info.status {
            JobStatus::Pending => Ok(run),
            JobStatus::Running => {
                if run.status == RunStatus::Starting {
                    self.runs.mark_running(run_id).await
                } else {
                    Ok(run)
                }
            }
            JobStatus::Succeeded => {
                if run.status == RunStatus::Starting {
                    self.runs.mark_running(run_id).await?;
                }
                self.runs
                    .mark_succeeded(run_id, info.exit_code, Some(OUTPUT_PATH.to_string()))
                    .await
            }
            JobStatus::Failed => {
                let error = info
                    .error_message
                    .unwrap_or_else(|| "job failed".to_string());
                self.runs.mark_failed(run_id, info.exit_code, &error).await
            }
        }
    }

    /// Cancel a run. Local state wins: the run becomes CANCELLED even when
    /// the cluster delete fails (stale jobs are collected later).
    /// 取消运行。本地状态优先：即使集群删除失败，运行也会变为CANCELLED
    /// （过期作业稍后回收）。
    pub async fn cancel_run(&self, run_id: &str, force: bool) -> ControlResult<Run> {
        let run = self.runs.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let cancelled = self.runs.cancel_run(run_id).await?;

        if let Some(job_name) = run.job_name.as_deref() {
            if let Err(e) = self
                .jobs
                .cancel_job(job_name, &self.runs_namespace, force)
                .await
            {
                warn!(run_id = %run_id, job_name = %job_name, error = %e, "cluster cancel failed, run stays cancelled");
            }
        }

        info!(run_id = %run_id, force, "cancelled run");
        Ok(cancelled)
    }

    /// Delete the job of a terminal run; idempotent / 删除终态运行的作业；幂等
    pub async fn cleanup_completed_job(&self, run_id: &str) -> ControlResult<bool> {
        let run = self.runs.require_run(run_id).await?;
        if !run.status.is_terminal() {
            return Ok(false);
        }
        let Some(job_name) = run.job_name.as_deref() else {
            return Ok(false);
        };

        self.jobs
            .delete_job(
                job_name,
                &self.runs_namespace,
                kube::api::PropagationPolicy::Background,
                None,
            )
            .await?;
        Ok(true)
    }
}
