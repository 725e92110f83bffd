//! Mellea control plane: build, environment and run orchestration
//! Mellea控制平面：构建、环境和运行编排

// Shared modules / 共享模块
pub mod config;
pub mod storage;

// Cluster and build adapters / 集群和构建适配器
pub mod build;
pub mod k8s;

// Core services / 核心服务
pub mod services;

// Re-exports / 重新导出
pub use services::error::{ControlError, ControlResult};
