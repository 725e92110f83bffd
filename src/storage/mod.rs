//! Persistent storage for the control plane
//! 控制平面的持久存储

pub mod json_store;

pub use json_store::{Document, JsonStore};
