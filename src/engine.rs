use crate::extractor::extract_variables;
use crate::schema::{GlobalSettings, HttpRequest, HttpResponse, Workflow, WorkflowStep};
use crate::template::VariableResolver;
use crate::transport::RequestExecutor;
use crate::variables::{initial_variables, merge, Variables};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub step_name: String,
    pub request_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponse>,
    pub extracted_variables: Variables,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub steps: Vec<StepResult>,
    pub final_variables: Variables,
    pub execution_log: Vec<String>,
}

/// Resolves a step's `request_id` to the saved request.
pub trait RequestLookup: Send + Sync {
    fn get_request(&self, id: &str) -> Option<HttpRequest>;
}

impl RequestLookup for std::collections::HashMap<String, HttpRequest> {
    fn get_request(&self, id: &str) -> Option<HttpRequest> {
        self.get(id).cloned()
    }
}

/// Progress hooks. Called synchronously from the run; a panic inside a hook
/// is logged and swallowed.
pub trait ExecutionObserver: Send + Sync {
    fn on_step_start(&self, _index: usize, _step: &WorkflowStep) {}
    fn on_step_complete(&self, _index: usize, _result: &StepResult) {}
    fn on_log(&self, _line: &str) {}
}

/// Everything one run needs. The workflow is borrowed for the whole run, so
/// it cannot change underneath it.
pub struct RunInput<'a> {
    pub workflow: &'a Workflow,
    pub requests: &'a dyn RequestLookup,
    pub resolver: &'a dyn VariableResolver,
    pub env_vars: Variables,
    pub settings: GlobalSettings,
    pub observer: Option<&'a dyn ExecutionObserver>,
    pub cancel: Option<CancellationToken>,
}

impl<'a> RunInput<'a> {
    pub fn new(
        workflow: &'a Workflow,
        requests: &'a dyn RequestLookup,
        resolver: &'a dyn VariableResolver,
    ) -> Self {
        Self {
            workflow,
            requests,
            resolver,
            env_vars: Variables::new(),
            settings: GlobalSettings::default(),
            observer: None,
            cancel: None,
        }
    }

    pub fn env_vars(mut self, env_vars: Variables) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn settings(mut self, settings: GlobalSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn observer(mut self, observer: &'a dyn ExecutionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Runs workflows one step at a time against an injected transport.
#[derive(Clone)]
pub struct Engine {
    transport: Arc<dyn RequestExecutor>,
}

impl Engine {
    pub fn new(transport: Arc<dyn RequestExecutor>) -> Self {
        Self { transport }
    }

    /// Execute every step in order, stopping at the first failure or when
    /// `cancel` fires between steps. Request failures end up in the result,
    /// never as an `Err`.
    pub async fn execute(&self, input: RunInput<'_>) -> ExecutionResult {
        let mut run = Run {
            observer: input.observer,
            log: Vec::new(),
        };
        let workflow = input.workflow;
        let is_cancelled = || input.cancel.as_ref().is_some_and(|t| t.is_cancelled());

        let mut variables = initial_variables(&input.env_vars, &workflow.variables);
        let mut steps = Vec::with_capacity(workflow.steps.len());

        if is_cancelled() {
            run.log(format!("Execution of '{}' cancelled before start", workflow.name));
            return run.finish(ExecutionStatus::Stopped, steps, variables);
        }

        log::info!(
            "Starting workflow execution: {} ({} steps)",
            workflow.name,
            workflow.steps.len()
        );
        run.log(format!("Starting workflow '{}'", workflow.name));

        for (index, step) in workflow.steps.iter().enumerate() {
            if is_cancelled() {
                run.log(format!(
                    "Execution stopped before step {} ({})",
                    index + 1,
                    step_label(step)
                ));
                return run.finish(ExecutionStatus::Stopped, steps, variables);
            }

            run.step_start(index, step);
            let result = self.execute_step(step, &input, &variables).await;

            match result.status {
                StepStatus::Success => {
                    merge(&mut variables, &result.extracted_variables);
                    run.log(format!(
                        "Step {} ({}) succeeded: {}",
                        index + 1,
                        step_label(step),
                        describe_success(&result)
                    ));
                }
                StepStatus::Failed => {
                    let error = result.error.as_deref().unwrap_or("unknown error");
                    log::warn!("Step {} ({}) failed: {}", index + 1, step_label(step), error);
                    run.log(format!("Step {} ({}) failed: {}", index + 1, step_label(step), error));
                }
            }

            run.step_complete(index, &result);
            let failed = result.status == StepStatus::Failed;
            steps.push(result);

            if failed {
                return run.finish(ExecutionStatus::Failed, steps, variables);
            }
        }

        run.log(format!("Workflow '{}' completed", workflow.name));
        run.finish(ExecutionStatus::Success, steps, variables)
    }

    async fn execute_step(&self, step: &WorkflowStep, input: &RunInput<'_>, variables: &Variables) -> StepResult {
        let started = Instant::now();
        let mut result = StepResult {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            request_id: step.request_id.clone(),
            status: StepStatus::Failed,
            response: None,
            extracted_variables: Variables::new(),
            error: None,
            duration_ms: 0,
        };

        let outcome = self.send(step, input, variables).await;
        result.duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(e) => result.error = Some(format!("{:#}", e)),
            Ok(response) if response.status >= 400 => {
                result.error = Some(format!(
                    "Request failed with status {} {}",
                    response.status, response.status_text
                )
                .trim_end()
                .to_string());
                result.response = Some(response);
            }
            Ok(response) => {
                result.extracted_variables = extract_variables(&response, &step.extract);
                result.status = StepStatus::Success;
                result.response = Some(response);
            }
        }

        result
    }

    async fn send(&self, step: &WorkflowStep, input: &RunInput<'_>, variables: &Variables) -> Result<HttpResponse> {
        let request = input
            .requests
            .get_request(&step.request_id)
            .with_context(|| format!("Request not found: {}", step.request_id))?;

        let resolved = resolve_request(&request, input.resolver, variables)
            .context("Failed to resolve variables")?;

        let timeout_ms = resolved.timeout_ms.unwrap_or(input.settings.timeout_ms);
        log::info!("Executing step {} -> {} {}", step_label(step), resolved.method, resolved.url);

        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.transport.execute(&resolved, &input.settings),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => anyhow::bail!("Request timed out after {}ms", timeout_ms),
        }
    }
}

/// Substitute variables into every templated field of `request`.
pub fn resolve_request(
    request: &HttpRequest,
    resolver: &dyn VariableResolver,
    variables: &Variables,
) -> Result<HttpRequest> {
    let mut resolved = request.clone();
    resolved.url = resolver.resolve(&request.url, variables)?;

    for kv in resolved.headers.iter_mut().chain(resolved.params.iter_mut()) {
        if kv.enabled {
            kv.key = resolver.resolve(&kv.key, variables)?;
            kv.value = resolver.resolve(&kv.value, variables)?;
        }
    }

    if let Some(body) = &request.body {
        resolved.body = Some(resolver.resolve(body, variables)?);
    }

    Ok(resolved)
}

fn step_label(step: &WorkflowStep) -> &str {
    if step.name.is_empty() {
        &step.request_id
    } else {
        &step.name
    }
}

fn describe_success(result: &StepResult) -> String {
    let status = result.response.as_ref().map(|r| r.status).unwrap_or_default();
    if result.extracted_variables.is_empty() {
        format!("status {}", status)
    } else {
        let mut names: Vec<&str> = result.extracted_variables.keys().map(String::as_str).collect();
        names.sort_unstable();
        format!("status {}, extracted {}", status, names.join(", "))
    }
}

/// Per-run bookkeeping: the trace log and guarded observer calls.
struct Run<'a> {
    observer: Option<&'a dyn ExecutionObserver>,
    log: Vec<String>,
}

impl Run<'_> {
    fn log(&mut self, line: String) {
        log::info!("{}", line);
        self.notify(|o| o.on_log(&line));
        self.log.push(line);
    }

    fn step_start(&self, index: usize, step: &WorkflowStep) {
        self.notify(|o| o.on_step_start(index, step));
    }

    fn step_complete(&self, index: usize, result: &StepResult) {
        self.notify(|o| o.on_step_complete(index, result));
    }

    fn notify(&self, f: impl FnOnce(&dyn ExecutionObserver)) {
        if let Some(observer) = self.observer {
            if catch_unwind(AssertUnwindSafe(|| f(observer))).is_err() {
                log::warn!("Execution observer panicked; continuing");
            }
        }
    }

    fn finish(self, status: ExecutionStatus, steps: Vec<StepResult>, final_variables: Variables) -> ExecutionResult {
        log::info!("Workflow execution finished with status {:?}", status);
        ExecutionResult {
            status,
            steps,
            final_variables,
            execution_log: self.log,
        }
    }
}
