//! Shared helpers for integration tests
//! 集成测试的共享辅助工具

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use mellea_control::build::{ContainerRuntime, ImageBuilder, LayerCache};
use mellea_control::config::{BuildConfig, StorageConfig};
use mellea_control::k8s::jobs::{RunJobApi, RunJobRequest};
use mellea_control::k8s::{JobInfo, JobStatus};
use mellea_control::services::{ControlError, ControlResult};

/// In-memory container runtime / 内存容器运行时
#[derive(Default)]
pub struct FakeRuntime {
    images: Mutex<HashSet<String>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build(&self, _context_dir: &Path, tag: &str) -> ControlResult<()> {
        self.images.lock().insert(tag.to_string());
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> ControlResult<bool> {
        Ok(self.images.lock().contains(tag))
    }

    async fn image_size(&self, tag: &str) -> ControlResult<Option<u64>> {
        Ok(self.images.lock().contains(tag).then_some(2048))
    }

    async fn remove_image(&self, tag: &str) -> ControlResult<()> {
        self.images.lock().remove(tag);
        Ok(())
    }

    async fn tag_image(&self, _source: &str, target: &str) -> ControlResult<()> {
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

/// Scripted cluster adapter for runs / 脚本化的运行集群适配器
#[derive(Default)]
pub struct FakeCluster {
    pub created: Mutex<Vec<RunJobRequest>>,
    pub cancelled: Mutex<Vec<(String, bool)>>,
    pub deleted: Mutex<Vec<String>>,
    statuses: Mutex<VecDeque<JobInfo>>,
}

impl FakeCluster {
    pub fn push_status(&self, status: JobStatus, exit_code: Option<i32>) {
        self.statuses.lock().push_back(JobInfo {
            name: String::new(),
            namespace: String::new(),
            status,
            start_time: None,
            completion_time: None,
            pod_name: None,
            exit_code,
            error_message: None,
        });
    }
}

#[async_trait]
impl RunJobApi for FakeCluster {
    async fn create_run_job(&self, request: &RunJobRequest) -> ControlResult<String> {
        self.created.lock().push(request.clone());
        Ok(mellea_control::k8s::jobs::run_job_name(
            &request.environment_id,
        ))
    }

    async fn get_job_status(&self, job_name: &str, namespace: &str) -> ControlResult<JobInfo> {
        match self.statuses.lock().pop_front() {
            Some(mut info) => {
                info.name = job_name.to_string();
                info.namespace = namespace.to_string();
                Ok(info)
            }
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

/// Image builder over the fake runtime / 基于伪运行时的镜像构建器
pub async fn test_builder(storage: &StorageConfig) -> Arc<ImageBuilder> {
    let cache = LayerCache::new(storage, "3.12").await.unwrap();
    Arc::new(ImageBuilder::new(
        BuildConfig::default(),
        cache,
        Arc::new(FakeRuntime::default()),
        None,
    ))
}
