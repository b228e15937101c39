//! `RunPod` API integration module.
//!
//! This module implements [`crate::capacity::CapacityBackend`] on top of the
//! `RunPod` REST and GraphQL APIs.

mod client;
mod types;

pub use client::{RunPodClient, RUNPOD_GRAPHQL_URL, RUNPOD_REST_URL};
pub use types::{CreatePodRequest, GpuType, Pod, PodStatus, RuntimePort};
