//! Closure-backed node adapter.
//!
//! `FnNode` wraps a plain function or closure as a [`Node`], which keeps
//! registering small computations (and scripting node behavior in tests)
//! free of one-off trait impls.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::types::{Node, NodeOutput, UpstreamResults};

type SyncNodeFn = dyn Fn(&Value, &UpstreamResults) -> NodeOutput + Send + Sync;

/// A node implemented by a synchronous closure.
pub struct FnNode {
    func: Arc<SyncNodeFn>,
    timeout: Option<Duration>,
    timeout_is_transient: bool,
}

impl FnNode {
    /// Wrap a closure as a ready-to-register node instance.
    pub fn from_fn<F>(func: F) -> Arc<dyn Node>
    where
        F: Fn(&Value, &UpstreamResults) -> NodeOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            func: Arc::new(func),
            timeout: None,
            timeout_is_transient: true,
        })
    }

    /// Wrap a closure with a per-node deadline override.
    pub fn with_timeout<F>(func: F, timeout: Duration, transient: bool) -> Arc<dyn Node>
    where
        F: Fn(&Value, &UpstreamResults) -> NodeOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            func: Arc::new(func),
            timeout: Some(timeout),
            timeout_is_transient: transient,
        })
    }
}

#[async_trait]
impl Node for FnNode {
    async fn execute(&self, input: &Value, upstream: &UpstreamResults) -> NodeOutput {
        (self.func)(input, upstream)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn timeout_is_transient(&self) -> bool {
        self.timeout_is_transient
    }
}
