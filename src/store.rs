use crate::engine::{ExecutionResult, RequestLookup};
use crate::schema::{CollectionFile, HttpRequest, VariableExtraction, Workflow, WorkflowStep, WorkflowVariable};
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Running,
    Finished,
}

/// One run as seen from outside: live log while running, full result after.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub state: ExecutionState,
    pub log: Vec<String>,
    pub result: Option<ExecutionResult>,
}

/// Finished runs kept in history unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Saved requests, workflows and run history. Cheap to clone; clones share
/// the same maps.
#[derive(Clone, Debug)]
pub struct WorkflowStore {
    requests: Arc<DashMap<String, HttpRequest>>,
    workflows: Arc<DashMap<String, Workflow>>,
    executions: Arc<DashMap<String, ExecutionRecord>>,
    /// Finished execution ids, oldest first.
    finished: Arc<Mutex<VecDeque<String>>>,
    history_limit: usize,
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` finished executions; running ones are never evicted.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            workflows: Arc::new(DashMap::new()),
            executions: Arc::new(DashMap::new()),
            finished: Arc::new(Mutex::new(VecDeque::new())),
            history_limit: limit,
        }
    }

    pub fn from_collection(collection: &CollectionFile) -> Self {
        let store = Self::new();
        for request in &collection.requests {
            store.upsert_request(request.clone());
        }
        for workflow in &collection.workflows {
            let mut workflow = workflow.clone();
            if workflow.collection_id.is_empty() {
                workflow.collection_id = collection.id.clone();
            }
            for step in workflow.steps.iter_mut().filter(|s| s.id.is_empty()) {
                step.id = Uuid::new_v4().to_string();
            }
            store.workflows.insert(workflow.id.clone(), workflow);
        }
        store
    }

    // ---- requests ----

    pub fn upsert_request(&self, request: HttpRequest) {
        self.requests.insert(request.id.clone(), request);
    }

    pub fn list_requests(&self) -> Vec<HttpRequest> {
        let mut requests: Vec<HttpRequest> = self.requests.iter().map(|e| e.value().clone()).collect();
        requests.sort_by(|a, b| a.id.cmp(&b.id));
        requests
    }

    // ---- workflows ----

    pub fn create_workflow(&self, collection_id: &str, name: &str) -> Workflow {
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            collection_id: collection_id.to_string(),
            steps: Vec::new(),
            variables: Vec::new(),
        };
        log::info!("Created workflow {} ({})", workflow.name, workflow.id);
        self.workflows.insert(workflow.id.clone(), workflow.clone());
        workflow
    }

    pub fn get_workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.get(id).map(|w| w.clone())
    }

    /// Lookup by id, falling back to an exact name match.
    pub fn find_workflow(&self, id_or_name: &str) -> Option<Workflow> {
        self.get_workflow(id_or_name).or_else(|| {
            self.workflows
                .iter()
                .find(|e| e.value().name == id_or_name)
                .map(|e| e.value().clone())
        })
    }

    pub fn list_workflows(&self, collection_id: Option<&str>) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|e| collection_id.map_or(true, |c| e.value().collection_id == c))
            .map(|e| e.value().clone())
            .collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        workflows
    }

    pub fn rename_workflow(&self, id: &str, name: &str) -> Result<Workflow> {
        self.update_workflow(id, |w| {
            w.name = name.to_string();
            Ok(())
        })
    }

    pub fn add_step(
        &self,
        id: &str,
        request_id: &str,
        name: &str,
        extract: Vec<VariableExtraction>,
    ) -> Result<WorkflowStep> {
        let step = WorkflowStep {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            name: name.to_string(),
            extract,
        };
        self.update_workflow(id, |w| {
            w.steps.push(step.clone());
            Ok(())
        })?;
        Ok(step)
    }

    pub fn update_step(&self, id: &str, step: WorkflowStep) -> Result<Workflow> {
        self.update_workflow(id, |w| {
            let slot = w
                .steps
                .iter_mut()
                .find(|s| s.id == step.id)
                .with_context(|| format!("Step '{}' not found", step.id))?;
            *slot = step.clone();
            Ok(())
        })
    }

    pub fn remove_step(&self, id: &str, step_id: &str) -> Result<Workflow> {
        self.update_workflow(id, |w| {
            let before = w.steps.len();
            w.steps.retain(|s| s.id != step_id);
            if w.steps.len() == before {
                anyhow::bail!("Step '{}' not found", step_id);
            }
            Ok(())
        })
    }

    /// Move a step to `to`, shifting the others.
    pub fn move_step(&self, id: &str, step_id: &str, to: usize) -> Result<Workflow> {
        self.update_workflow(id, |w| {
            let from = w
                .steps
                .iter()
                .position(|s| s.id == step_id)
                .with_context(|| format!("Step '{}' not found", step_id))?;
            if to >= w.steps.len() {
                anyhow::bail!("Position {} out of range for {} steps", to, w.steps.len());
            }
            let step = w.steps.remove(from);
            w.steps.insert(to, step);
            Ok(())
        })
    }

    pub fn set_variables(&self, id: &str, variables: Vec<WorkflowVariable>) -> Result<Workflow> {
        self.update_workflow(id, |w| {
            w.variables = variables.clone();
            Ok(())
        })
    }

    pub fn delete_workflow(&self, id: &str) -> Result<Workflow> {
        let (_, workflow) = self
            .workflows
            .remove(id)
            .with_context(|| format!("Workflow '{}' not found", id))?;
        log::info!("Deleted workflow {} ({})", workflow.name, workflow.id);
        Ok(workflow)
    }

    fn update_workflow(&self, id: &str, f: impl FnOnce(&mut Workflow) -> Result<()>) -> Result<Workflow> {
        let mut entry = self
            .workflows
            .get_mut(id)
            .with_context(|| format!("Workflow '{}' not found", id))?;
        // Work on a copy so a failed edit leaves the stored workflow untouched.
        let mut updated = entry.clone();
        f(&mut updated)?;
        *entry = updated.clone();
        Ok(updated)
    }

    // ---- execution history ----

    pub fn begin_execution(&self, workflow_id: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.executions.insert(
            id.clone(),
            ExecutionRecord {
                id: id.clone(),
                workflow_id: workflow_id.to_string(),
                state: ExecutionState::Running,
                log: Vec::new(),
                result: None,
            },
        );
        id
    }

    pub fn append_log(&self, execution_id: &str, line: &str) {
        if let Some(mut record) = self.executions.get_mut(execution_id) {
            record.log.push(line.to_string());
        }
    }

    /// Store the result and evict the oldest finished runs beyond the limit.
    pub fn finish_execution(&self, execution_id: &str, result: ExecutionResult) {
        match self.executions.get_mut(execution_id) {
            Some(mut record) => {
                record.state = ExecutionState::Finished;
                record.log = result.execution_log.clone();
                record.result = Some(result);
            }
            None => return,
        }

        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.push_back(execution_id.to_string());
        while finished.len() > self.history_limit {
            if let Some(oldest) = finished.pop_front() {
                log::debug!("Evicting execution {} from history", oldest);
                self.executions.remove(&oldest);
            }
        }
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions.get(execution_id).map(|r| r.clone())
    }
}

impl RequestLookup for WorkflowStore {
    fn get_request(&self, id: &str) -> Option<HttpRequest> {
        self.requests.get(id).map(|r| r.clone())
    }
}
