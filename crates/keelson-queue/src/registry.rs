// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflows known to a worker, by name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keelson_core::Workflow;

use crate::job::Job;

/// Called once when a job is discarded, after its final attempt or on a
/// permanent failure.
#[async_trait]
pub trait DiscardHook: Send + Sync {
    /// `job` is the job as leased for its last attempt; `error` the reason.
    async fn on_discard(&self, job: &Job, error: &str);
}

/// Name to workflow mapping used by [`Worker`](crate::worker::Worker).
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<Workflow>>,
    discard_hook: Option<Arc<dyn DiscardHook>>,
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.workflows.keys().collect();
        names.sort();
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &names)
            .field("discard_hook", &self.discard_hook.as_ref().map(|_| "..."))
            .finish()
    }
}

impl WorkflowRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `workflow` under its own name, replacing any previous one.
    pub fn register(mut self, workflow: Workflow) -> Self {
        self.workflows
            .insert(workflow.name().to_string(), Arc::new(workflow));
        self
    }

    /// Install the hook fired when a job is discarded.
    pub fn on_discard(mut self, hook: Arc<dyn DiscardHook>) -> Self {
        self.discard_hook = Some(hook);
        self
    }

    /// Look up a workflow.
    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn discard_hook(&self) -> Option<&Arc<dyn DiscardHook>> {
        self.discard_hook.as_ref()
    }
}
