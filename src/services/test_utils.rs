//! Shared test doubles for services and controllers
//! 服务和控制器的共享测试替身

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use crate::build::daemon::ContainerRuntime;
use crate::build::BuildResult;
use crate::k8s::jobs::{RunJobApi, RunJobRequest};
use crate::k8s::kaniko::{BuildJob, BuildJobApi, BuildJobRequest};
use crate::k8s::{JobInfo, JobStatus};
use crate::services::error::{ControlError, ControlResult};

/// In-memory container runtime / 内存容器运行时
#[derive(Default)]
pub struct MockRuntime {
    built: Mutex<Vec<String>>,
    images: Mutex<HashSet<String>>,
    fail_next_build: Mutex<Option<String>>,
}

impl MockRuntime {
    /// Tags built so far, in order / 到目前为止构建的标签（按顺序）
    pub fn built_tags(&self) -> Vec<String> {
        self.built.lock().clone()
    }

    /// Drop all known images, simulating daemon loss / 丢弃所有已知镜像，模拟守护进程丢失
    pub fn forget_images(&self) {
        self.images.lock().clear();
    }

    /// Make the next build call fail / 使下一次构建调用失败
    pub fn fail_next_build(&self, message: &str) {
        *self.fail_next_build.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build(&self, _context_dir: &Path, tag: &str) -> ControlResult<()> {
        if let Some(message) = self.fail_next_build.lock().take() {
            return Err(ControlError::ImageBuild(message));
        }
        self.built.lock().push(tag.to_string());
        self.images.lock().insert(tag.to_string());
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> ControlResult<bool> {
        Ok(self.images.lock().contains(tag))
    }

    async fn image_size(&self, tag: &str) -> ControlResult<Option<u64>> {
        Ok(self.images.lock().contains(tag).then_some(1024))
    }

    async fn remove_image(&self, tag: &str) -> ControlResult<()> {
        self.images.lock().remove(tag);
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> ControlResult<()> {
        if !self.images.lock().contains(source) {
            return Err(ControlError::ImageBuild(format!("no such image: {source}")));
        }
        self.images.lock().insert(target.to_string());
        Ok(())
    }

    async fn push(&self, _tag: &str) -> ControlResult<()> {
        Ok(())
    }

    async fn pull(&self, tag: &str) -> ControlResult<()> {
        self.images.lock().insert(tag.to_string());
        Ok(())
    }

    async fn login(&self, _registry: &str, _username: &str, _password: &str) -> ControlResult<()> {
        Ok(())
    }
}

/// Scripted run-job adapter / 脚本化的运行作业适配器
#[derive(Default)]
pub struct MockJobApi {
    pub created: Mutex<Vec<RunJobRequest>>,
    pub cancelled: Mutex<Vec<(String, bool)>>,
    pub deleted: Mutex<Vec<String>>,
    create_failure: Mutex<Option<String>>,
    status_queue: Mutex<VecDeque<Result<JobInfo, String>>>,
}

impl MockJobApi {
    pub fn fail_next_create(&self, message: &str) {
        *self.create_failure.lock() = Some(message.to_string());
    }

    /// Queue a status response / 排队一个状态响应
    pub fn push_status(&self, status: JobStatus, exit_code: Option<i32>, error: Option<&str>) {
        self.status_queue.lock().push_back(Ok(JobInfo {
            name: "queued".to_string(),
            namespace: "mellea-runs".to_string(),
            status,
            start_time: None,
            completion_time: None,
            pod_name: None,
            exit_code,
            error_message: error.map(|e| e.to_string()),
        }));
    }

    /// Queue a cluster error response / 排队一个集群错误响应
    pub fn push_status_error(&self, message: &str) {
        self.status_queue
            .lock()
            .push_back(Err(message.to_string()));
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn status_calls_remaining(&self) -> usize {
        self.status_queue.lock().len()
    }
}

#[async_trait]
impl RunJobApi for MockJobApi {
    async fn create_run_job(&self, request: &RunJobRequest) -> ControlResult<String> {
        if let Some(message) = self.create_failure.lock().take() {
            return Err(ControlError::ClusterState(message));
        }
        self.created.lock().push(request.clone());
        Ok(crate::k8s::jobs::run_job_name(&request.environment_id))
    }

    async fn get_job_status(&self, job_name: &str, namespace: &str) -> ControlResult<JobInfo> {
        match self.status_queue.lock().pop_front() {
            Some(Ok(mut info)) => {
                info.name = job_name.to_string();
                info.namespace = namespace.to_string();
                Ok(info)
            }
            Some(Err(message)) => Err(ControlError::ClusterState(message)),
            None => Err(ControlError::not_found("job", job_name)),
        }
    }

    async fn get_pod_logs(
        &self,
        _job_name: &str,
        _namespace: &str,
        _tail_lines: Option<i64>,
    ) -> ControlResult<Option<String>> {
        Ok(None)
    }

    async fn delete_job(
        &self,
        job_name: &str,
        _namespace: &str,
        _propagation: kube::api::PropagationPolicy,
        _grace_period_seconds: Option<i64>,
    ) -> ControlResult<()> {
        self.deleted.lock().push(job_name.to_string());
        Ok(())
    }

    async fn cancel_job(&self, job_name: &str, _namespace: &str, force: bool) -> ControlResult<()> {
        self.cancelled.lock().push((job_name.to_string(), force));
        Ok(())
    }

    async fn list_jobs(
        &self,
        _namespace: &str,
        _environment_id: Option<&str>,
    ) -> ControlResult<Vec<JobInfo>> {
        Ok(Vec::new())
    }
}

/// Build-job adapter that records submissions / 记录提交的构建作业适配器
#[derive(Default)]
pub struct MockBuildApi {
    pub submitted: Mutex<Vec<BuildJobRequest>>,
}

#[async_trait]
impl BuildJobApi for MockBuildApi {
    async fn create_build_job(&self, request: &BuildJobRequest) -> BuildResult {
        self.submitted.lock().push(request.clone());
        BuildResult {
            success: true,
            image_tag: Some(request.image_tag.clone()),
            build_job_name: Some(crate::k8s::kaniko::build_job_name(&request.program_id)),
            ..BuildResult::empty(&request.program_id)
        }
    }

    async fn get_build_status(&self, job_name: &str) -> ControlResult<BuildJob> {
        Ok(BuildJob {
            job_name: job_name.to_string(),
            program_id: String::new(),
            image_tag: String::new(),
            status: JobStatus::Succeeded,
            started_at: None,
            completed_at: None,
            error_message: None,
        })
    }

    async fn get_build_logs(&self, _job_name: &str, _tail_lines: i64) -> ControlResult<String> {
        Ok(String::new())
    }

    async fn delete_build_job(&self, _job_name: &str) -> ControlResult<bool> {
        Ok(true)
    }

    async fn wait_for_build(
        &self,
        job_name: &str,
        _timeout: std::time::Duration,
        _poll_interval: std::time::Duration,
    ) -> ControlResult<BuildJob> {
        self.get_build_status(job_name).await
    }
}

/// Convenience constructor for an arc'd mock / 便捷构造arc包装的mock
pub fn arc_mock_job_api() -> Arc<MockJobApi> {
    Arc::new(MockJobApi::default())
}
