//! Step dispatch.
//!
//! `Worker` executes one step: it resolves the step's inputs against shared
//! memory, dispatches on the `ActionSpec` kind, writes outputs back to
//! memory and reports a [`StepExecutionResult`]. Every fault raised along
//! the way is classified before it is returned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use stepwise_types::config::ExecutorConfig;
use stepwise_types::execution::{ErrorKind, ExecutionError};
use stepwise_types::llm::{CompletionRequest, Message};
use stepwise_types::workflow::{ActionSpec, ExecutorType, Step};
use uuid::Uuid;

use super::classify::{ErrorClassifier, Fault};
use super::collaborators::{Sandbox, SubWorkflowExecutor, SubWorkflowRequest};
use super::extract::extract_structured;
use super::memory::{SharedMemory, render_template, value_to_string};
use crate::llm::BoxLlmProvider;
use crate::tool::{FunctionRegistry, FunctionReturn, ToolExecutor};

/// Output budget used when a model-call step sets none.
const DEFAULT_MAX_TOKENS: u32 = 1024;

// ---------------------------------------------------------------------------
// Result and context types
// ---------------------------------------------------------------------------

/// What one dispatch produced.
///
/// `success = false` with `Ok(..)` is a soft failure reported by the
/// collaborator itself (tool `is_error`, failed function envelope, failed
/// sub-workflow). Faults come back as `Err(ExecutionError)` instead.
#[derive(Debug, Clone)]
pub struct StepExecutionResult {
    pub success: bool,
    pub outputs: Map<String, Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub executor_type: ExecutorType,
}

/// Per-call handle on run state. The worker must not keep it past return.
#[derive(Debug)]
pub struct StepContext<'m> {
    pub run_id: Uuid,
    pub memory: &'m mut SharedMemory,
    /// Sub-workflow nesting depth of the current run.
    pub depth: u32,
    /// 1-based attempt number for this step.
    pub attempt: u32,
}

struct Dispatched {
    success: bool,
    outputs: Map<String, Value>,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
    tokens_used: u64,
}

impl Dispatched {
    fn ok(outputs: Map<String, Value>, tokens_used: u64) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
            error_kind: None,
            tokens_used,
        }
    }

    fn soft_failure(kind: ErrorKind, error: String, tokens_used: u64) -> Self {
        Self {
            success: false,
            outputs: Map::new(),
            error: Some(error),
            error_kind: Some(kind),
            tokens_used,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Dispatches steps to the collaborator that handles their action kind.
///
/// Collaborators are optional; dispatching to a missing one is an
/// `INVALID_CONFIGURATION` error.
pub struct Worker {
    config: ExecutorConfig,
    llm: Option<Arc<BoxLlmProvider>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    functions: Arc<FunctionRegistry>,
    sub_workflows: Option<Arc<dyn SubWorkflowExecutor>>,
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl Worker {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            llm: None,
            tools: None,
            functions: Arc::new(FunctionRegistry::new()),
            sub_workflows: None,
            sandbox: None,
        }
    }

    pub fn with_llm(mut self, provider: BoxLlmProvider) -> Self {
        self.llm = Some(Arc::new(provider));
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Arc::new(functions);
        self
    }

    pub fn with_sub_workflows(mut self, executor: Arc<dyn SubWorkflowExecutor>) -> Self {
        self.sub_workflows = Some(executor);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute one step against the run's shared memory.
    pub async fn execute(
        &self,
        step: &Step,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepExecutionResult, ExecutionError> {
        let started = Instant::now();
        let executor_type = step.action.executor_type();
        let step_ctx = |e: ExecutionError| {
            e.with_context("step_id", step.id.clone())
                .with_context("executor_type", executor_type.to_string())
        };

        tracing::debug!(
            run_id = %ctx.run_id,
            step_id = %step.id,
            %executor_type,
            attempt = ctx.attempt,
            "dispatching step"
        );

        let inputs = self.resolve_inputs(step, &*ctx.memory).map_err(step_ctx)?;

        let timeout_secs = step.timeout_secs.unwrap_or(self.config.step_timeout_secs);
        let dispatch = self.dispatch(step, inputs, &*ctx.memory, ctx.depth);
        let dispatched = match tokio::time::timeout(Duration::from_secs(timeout_secs), dispatch).await {
            Ok(Ok(dispatched)) => dispatched,
            Ok(Err(fault)) => return Err(step_ctx(ErrorClassifier::classify(&fault))),
            Err(elapsed) => {
                let fault = anyhow::Error::new(elapsed)
                    .context(format!("step '{}' exceeded {timeout_secs}s timeout", step.id));
                return Err(step_ctx(
                    ErrorClassifier::classify(&fault).with_context("timeout_secs", timeout_secs),
                ));
            }
        };

        if dispatched.success {
            write_outputs(step, &dispatched.outputs, &mut *ctx.memory).map_err(step_ctx)?;
        }

        Ok(StepExecutionResult {
            success: dispatched.success,
            outputs: dispatched.outputs,
            error: dispatched.error,
            error_kind: dispatched.error_kind,
            tokens_used: dispatched.tokens_used,
            latency_ms: started.elapsed().as_millis() as u64,
            executor_type,
        })
    }

    /// Gather declared input keys and extra inputs, resolving references.
    fn resolve_inputs(&self, step: &Step, memory: &SharedMemory) -> Result<Map<String, Value>, ExecutionError> {
        let mut inputs = Map::new();
        for key in &step.input_keys {
            let value = memory.get(key).cloned().ok_or_else(|| {
                ExecutionError::new(
                    ErrorKind::MissingDependency,
                    format!("step '{}' requires '{key}' which is not in shared memory", step.id),
                )
                .with_context("missing_key", key.clone())
            })?;
            inputs.insert(key.clone(), value);
        }
        for (key, value) in &step.inputs {
            inputs.insert(key.clone(), memory.resolve_value(value, &self.config.reference_marker)?);
        }
        Ok(inputs)
    }

    /// Declared arguments merged with resolved inputs (inputs win), then resolved.
    fn merge_arguments(
        &self,
        arguments: &Map<String, Value>,
        inputs: Map<String, Value>,
        memory: &SharedMemory,
    ) -> Result<Map<String, Value>, ExecutionError> {
        let mut merged = arguments.clone();
        merged.extend(inputs);
        match memory.resolve_value(&Value::Object(merged), &self.config.reference_marker)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    async fn dispatch(
        &self,
        step: &Step,
        inputs: Map<String, Value>,
        memory: &SharedMemory,
        depth: u32,
    ) -> anyhow::Result<Dispatched> {
        match &step.action {
            ActionSpec::ModelCall {
                prompt,
                system,
                model,
                max_tokens,
                temperature,
                tools,
            } => {
                let mut scope = memory.as_map().clone();
                scope.extend(inputs);
                let request = CompletionRequest {
                    model: model.clone().unwrap_or_default(),
                    messages: vec![Message::user(render_template(prompt, &scope))],
                    system: system.as_ref().map(|s| render_template(s, &scope)),
                    max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                    temperature: *temperature,
                    tools: match (&self.tools, tools.is_empty()) {
                        (Some(executor), false) => executor.definitions(tools),
                        _ => Vec::new(),
                    },
                };
                self.run_model_call(&request).await
            }
            ActionSpec::ToolUse { tool, arguments } => {
                let args = self.merge_arguments(arguments, inputs, memory)?;
                self.run_tool(tool, args).await
            }
            ActionSpec::Function { name, arguments } => {
                let args = self.merge_arguments(arguments, inputs, memory)?;
                match self.functions.call(name, args).await {
                    Some(result) => Ok(from_function_return(result?)),
                    None => Err(Fault::MissingKey(format!("function '{name}' is not registered")).into()),
                }
            }
            ActionSpec::SubWorkflow { workflow_id, inputs: declared } => {
                let args = self.merge_arguments(declared, inputs, memory)?;
                self.run_sub_workflow(workflow_id, args, memory, depth).await
            }
            ActionSpec::SandboxedCode { code, language } => {
                let mut scope = memory.as_map().clone();
                scope.extend(inputs);
                self.run_sandboxed(code, language.as_deref(), scope).await
            }
        }
    }

    async fn run_model_call(&self, request: &CompletionRequest) -> anyhow::Result<Dispatched> {
        let llm = self.llm.as_ref().ok_or_else(|| missing_collaborator("LLM provider"))?;
        let response = llm.complete(request).await?;

        let mut outputs = Map::new();
        let parsed = extract_structured(&response.content);
        if let Some(Value::Object(fields)) = &parsed {
            splice(&mut outputs, fields);
        }
        outputs.insert(
            "result".to_string(),
            parsed.clone().unwrap_or_else(|| Value::String(response.content.clone())),
        );
        outputs.insert("response".to_string(), Value::String(response.content.clone()));
        outputs.insert("parsed".to_string(), parsed.unwrap_or(Value::Null));
        outputs.insert("stop_reason".to_string(), Value::String(response.stop_reason.to_string()));

        tracing::debug!(
            provider = llm.name(),
            model = %response.model,
            stop_reason = %response.stop_reason,
            tokens = response.usage.total(),
            "model call completed"
        );
        Ok(Dispatched::ok(outputs, response.usage.total()))
    }

    /// Registered functions shadow formal tools of the same name.
    async fn run_tool(&self, tool: &str, args: Map<String, Value>) -> anyhow::Result<Dispatched> {
        if self.functions.contains(tool) {
            if let Some(result) = self.functions.call(tool, args).await {
                return Ok(from_function_return(result?));
            }
            return Err(Fault::MissingKey(format!("function '{tool}' is not registered")).into());
        }

        let executor = self.tools.as_ref().ok_or_else(|| missing_collaborator("tool executor"))?;
        let output = executor.execute(tool, Value::Object(args)).await?;
        if output.is_error {
            return Ok(Dispatched::soft_failure(
                ErrorKind::ToolError,
                format!("tool '{tool}' reported an error: {}", value_to_string(&output.content)),
                0,
            ));
        }

        let mut outputs = Map::new();
        if let Some(fields) = output.structured() {
            splice(&mut outputs, &fields);
        }
        outputs.insert("result".to_string(), output.content);
        Ok(Dispatched::ok(outputs, 0))
    }

    async fn run_sub_workflow(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
        memory: &SharedMemory,
        depth: u32,
    ) -> anyhow::Result<Dispatched> {
        let executor = self
            .sub_workflows
            .as_ref()
            .ok_or_else(|| missing_collaborator("sub-workflow executor"))?;

        let next_depth = depth + 1;
        if next_depth > self.config.max_sub_workflow_depth {
            return Err(ExecutionError::new(
                ErrorKind::SubWorkflowDepthExceeded,
                format!(
                    "sub-workflow '{workflow_id}' at depth {next_depth} exceeds maximum {}",
                    self.config.max_sub_workflow_depth
                ),
            )
            .with_context("depth", next_depth)
            .into());
        }

        let result = executor
            .execute(SubWorkflowRequest {
                workflow_id: workflow_id.to_string(),
                inputs,
                context: memory.to_json(),
                depth: next_depth,
            })
            .await?;

        if !result.success {
            let error = result
                .error
                .unwrap_or_else(|| format!("sub-workflow '{workflow_id}' failed"));
            return Ok(Dispatched::soft_failure(ErrorKind::ExecutionFailed, error, result.total_tokens));
        }

        let mut outputs = Map::new();
        if let Value::Object(fields) = &result.output {
            splice(&mut outputs, fields);
        }
        outputs.insert("result".to_string(), result.output);
        Ok(Dispatched::ok(outputs, result.total_tokens))
    }

    async fn run_sandboxed(
        &self,
        code: &str,
        language: Option<&str>,
        scope: Map<String, Value>,
    ) -> anyhow::Result<Dispatched> {
        let sandbox = self.sandbox.as_ref().ok_or_else(|| missing_collaborator("sandbox"))?;
        let result = sandbox.execute(code, language, scope).await?;

        if !result.success {
            let message = result.error.unwrap_or_else(|| "sandboxed code failed".to_string());
            if message.to_lowercase().contains("security violation") {
                return Err(ExecutionError::new(ErrorKind::SecurityError, message)
                    .with_context("security_violation", true)
                    .into());
            }
            return Err(anyhow::anyhow!(message));
        }

        let mut outputs = Map::new();
        splice(&mut outputs, &result.variables);
        outputs.insert("result".to_string(), result.result);
        outputs.insert("execution_time_ms".to_string(), Value::from(result.execution_time_ms));
        Ok(Dispatched::ok(outputs, 0))
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("llm", &self.llm)
            .field("tools", &self.tools.is_some())
            .field("functions", &self.functions)
            .field("sub_workflows", &self.sub_workflows.is_some())
            .field("sandbox", &self.sandbox.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn missing_collaborator(what: &str) -> ExecutionError {
    ExecutionError::new(ErrorKind::InvalidConfiguration, format!("no {what} configured"))
}

/// Copy named fields into the output map without clobbering existing keys.
fn splice(outputs: &mut Map<String, Value>, fields: &Map<String, Value>) {
    for (key, value) in fields {
        outputs.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

fn from_function_return(ret: FunctionReturn) -> Dispatched {
    match ret {
        FunctionReturn::Value(value) => {
            let mut outputs = Map::new();
            if let Value::Object(fields) = &value {
                splice(&mut outputs, fields);
            }
            outputs.insert("result".to_string(), value);
            Dispatched::ok(outputs, 0)
        }
        FunctionReturn::Envelope {
            success: true,
            outputs,
            ..
        } => Dispatched::ok(outputs, 0),
        FunctionReturn::Envelope { error, .. } => Dispatched::soft_failure(
            ErrorKind::ExecutionFailed,
            error.unwrap_or_else(|| "function reported failure".to_string()),
            0,
        ),
    }
}

/// Write step outputs into memory.
///
/// With no declared output keys every output is written. Otherwise only the
/// declared keys are; a single declared key missing from the outputs takes
/// the `result` value.
fn write_outputs(step: &Step, outputs: &Map<String, Value>, memory: &mut SharedMemory) -> Result<(), ExecutionError> {
    if step.output_keys.is_empty() {
        for (key, value) in outputs {
            memory.write_output(&step.id, key, value.clone())?;
        }
        return Ok(());
    }

    for key in &step.output_keys {
        let value = outputs
            .get(key)
            .or_else(|| (step.output_keys.len() == 1).then(|| outputs.get("result")).flatten());
        match value {
            Some(value) => memory.write_output(&step.id, key, value.clone())?,
            None => tracing::debug!(step_id = %step.id, key, "declared output not produced"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmProvider;
    use crate::tool::{ToolOutput, ToolRegistry};
    use crate::workflow::collaborators::{SandboxResult, SubWorkflowResult};
    use futures_util::future::BoxFuture;
    use serde_json::json;
    use std::sync::Mutex;
    use stepwise_types::execution::ErrorCategory;
    use stepwise_types::llm::{CompletionResponse, LlmError, StopReason, ToolDefinition, Usage};

    // -- Mocks --

    struct ScriptedLlm {
        reply: String,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl LlmProvider for Arc<ScriptedLlm> {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(CompletionResponse {
                content: self.reply.clone(),
                model: "mock-1".into(),
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 12,
                    output_tokens: 8,
                },
            })
        }
    }

    struct RateLimitedLlm;

    impl LlmProvider for RateLimitedLlm {
        fn name(&self) -> &str {
            "limited"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::RateLimited {
                retry_after_ms: Some(100),
            })
        }
    }

    struct StubSandbox {
        result: SandboxResult,
    }

    impl Sandbox for StubSandbox {
        fn execute<'a>(
            &'a self,
            _code: &'a str,
            _language: Option<&'a str>,
            _inputs: Map<String, Value>,
        ) -> BoxFuture<'a, anyhow::Result<SandboxResult>> {
            let result = self.result.clone();
            Box::pin(async move { Ok(result) })
        }
    }

    struct RecordingSubWorkflows {
        depths: Mutex<Vec<u32>>,
    }

    impl SubWorkflowExecutor for RecordingSubWorkflows {
        fn execute(&self, request: SubWorkflowRequest) -> BoxFuture<'_, anyhow::Result<SubWorkflowResult>> {
            self.depths.lock().unwrap().push(request.depth);
            Box::pin(async move {
                Ok(SubWorkflowResult {
                    success: true,
                    output: json!({ "summary": format!("ran {}", request.workflow_id) }),
                    error: None,
                    total_tokens: 40,
                })
            })
        }
    }

    fn tool_step(id: &str, tool: &str, arguments: Value) -> Step {
        let Value::Object(arguments) = arguments else {
            panic!("arguments must be an object");
        };
        Step::new(
            id,
            ActionSpec::ToolUse {
                tool: tool.into(),
                arguments,
            },
        )
    }

    fn model_step(id: &str, prompt: &str) -> Step {
        Step::new(
            id,
            ActionSpec::ModelCall {
                prompt: prompt.into(),
                system: None,
                model: None,
                max_tokens: Some(256),
                temperature: None,
                tools: vec![],
            },
        )
    }

    async fn run(worker: &Worker, step: &Step, memory: &mut SharedMemory) -> Result<StepExecutionResult, ExecutionError> {
        let mut ctx = StepContext {
            run_id: Uuid::now_v7(),
            memory,
            depth: 0,
            attempt: 1,
        };
        worker.execute(step, &mut ctx).await
    }

    // -- Model calls --

    #[tokio::test]
    async fn model_call_renders_prompt_and_parses_reply() {
        let llm = Arc::new(ScriptedLlm::new("Sure:\n```json\n{\"label\": \"positive\"}\n```"));
        let worker = Worker::new(ExecutorConfig::default()).with_llm(BoxLlmProvider::new(llm.clone()));
        let mut memory = SharedMemory::from_input(&json!({ "text": "I love it" }));
        let mut step = model_step("classify", "Classify: {{ text }}");
        step.output_keys = vec!["label".into()];

        let result = run(&worker, &step, &mut memory).await.unwrap();

        assert!(result.success);
        assert_eq!(result.tokens_used, 20);
        assert_eq!(result.executor_type, ExecutorType::ModelCall);
        assert_eq!(result.outputs["parsed"], json!({ "label": "positive" }));
        assert!(result.outputs["response"].as_str().unwrap().starts_with("Sure:"));
        assert_eq!(result.outputs["stop_reason"], json!("end_turn"));
        assert_eq!(memory.get("label"), Some(&json!("positive")));

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0].messages[0].content, "Classify: I love it");
        assert_eq!(seen[0].max_tokens, 256);
    }

    #[tokio::test]
    async fn model_call_falls_back_to_raw_text() {
        let llm = Arc::new(ScriptedLlm::new("Rust is memory safe."));
        let worker = Worker::new(ExecutorConfig::default()).with_llm(BoxLlmProvider::new(llm));
        let mut memory = SharedMemory::new();
        let mut step = model_step("answer", "Why Rust?");
        step.output_keys = vec!["answer".into()];

        let result = run(&worker, &step, &mut memory).await.unwrap();
        assert_eq!(result.outputs["parsed"], Value::Null);
        assert_eq!(memory.get("answer"), Some(&json!("Rust is memory safe.")));
    }

    #[tokio::test]
    async fn rate_limit_is_retriable() {
        let worker = Worker::new(ExecutorConfig::default()).with_llm(BoxLlmProvider::new(RateLimitedLlm));
        let err = run(&worker, &model_step("m", "hi"), &mut SharedMemory::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.is_retriable());
        assert_eq!(err.context["step_id"], json!("m"));
    }

    #[tokio::test]
    async fn missing_provider_is_configuration_error() {
        let worker = Worker::new(ExecutorConfig::default());
        let err = run(&worker, &model_step("m", "hi"), &mut SharedMemory::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfiguration);
        assert_eq!(err.category, ErrorCategory::Fatal);
    }

    // -- Inputs --

    #[tokio::test]
    async fn missing_input_key_is_dependency_error() {
        let worker = Worker::new(ExecutorConfig::default());
        let mut step = tool_step("t", "search", json!({}));
        step.input_keys = vec!["query".into()];

        let err = run(&worker, &step, &mut SharedMemory::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingDependency);
        assert_eq!(err.category, ErrorCategory::Dependency);
        assert_eq!(err.context["missing_key"], json!("query"));
    }

    // -- Tools and functions --

    #[tokio::test]
    async fn tool_fields_are_spliced_into_outputs() {
        let mut tools = ToolRegistry::new();
        tools.register(
            "search",
            ToolDefinition {
                name: "search".into(),
                description: "web search".into(),
                input_schema: json!({}),
            },
            |input| async move {
                Ok(ToolOutput::json(json!({ "title": "Rust", "query_seen": input["q"] })))
            },
        );
        let worker = Worker::new(ExecutorConfig::default()).with_tools(Arc::new(tools));
        let mut memory = SharedMemory::from_input(&json!({ "topic": "rust" }));
        let mut step = tool_step("search", "search", json!({ "q": "$topic", "limit": 3 }));
        step.inputs.insert("limit".into(), json!(5));

        let result = run(&worker, &step, &mut memory).await.unwrap();
        assert!(result.success);
        assert_eq!(result.outputs["title"], json!("Rust"));
        assert_eq!(result.outputs["query_seen"], json!("rust"));
        assert_eq!(memory.get("title"), Some(&json!("Rust")));
        assert!(memory.contains("result"));
    }

    #[tokio::test]
    async fn tool_error_is_soft_failure() {
        let mut tools = ToolRegistry::new();
        tools.register(
            "flaky",
            ToolDefinition {
                name: "flaky".into(),
                description: String::new(),
                input_schema: json!({}),
            },
            |_| async { Ok(ToolOutput::error("quota exceeded")) },
        );
        let worker = Worker::new(ExecutorConfig::default()).with_tools(Arc::new(tools));
        let mut memory = SharedMemory::new();

        let result = run(&worker, &tool_step("f", "flaky", json!({})), &mut memory).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ToolError));
        assert!(result.error.unwrap().contains("quota exceeded"));
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn functions_shadow_tools_and_merge_inputs() {
        let mut functions = FunctionRegistry::new();
        functions.register_sync("add", |args| {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        });
        let worker = Worker::new(ExecutorConfig::default()).with_functions(functions);
        let mut memory = SharedMemory::from_input(&json!({ "x": 40 }));
        let mut step = tool_step("sum", "add", json!({ "a": 1, "b": 1 }));
        step.inputs.insert("a".into(), json!("$x"));
        step.output_keys = vec!["total".into()];

        let result = run(&worker, &step, &mut memory).await.unwrap();
        assert_eq!(result.outputs["result"], json!(41));
        assert_eq!(memory.get("total"), Some(&json!(41)));
    }

    #[tokio::test]
    async fn function_envelope_failure_is_soft() {
        let mut functions = FunctionRegistry::new();
        functions.register_sync("check", |_| {
            Ok(json!({ "success": false, "outputs": null, "error": "not ready" }))
        });
        let worker = Worker::new(ExecutorConfig::default()).with_functions(functions);
        let step = Step::new(
            "check",
            ActionSpec::Function {
                name: "check".into(),
                arguments: Map::new(),
            },
        );

        let result = run(&worker, &step, &mut SharedMemory::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("not ready"));
    }

    #[tokio::test]
    async fn function_fault_is_classified() {
        let mut functions = FunctionRegistry::new();
        functions.register_sync("lookup", |_| Err(Fault::MissingKey("user_id".into()).into()));
        let worker = Worker::new(ExecutorConfig::default()).with_functions(functions);
        let step = Step::new(
            "lookup",
            ActionSpec::Function {
                name: "lookup".into(),
                arguments: Map::new(),
            },
        );

        let err = run(&worker, &step, &mut SharedMemory::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingDependency);
    }

    #[tokio::test]
    async fn slow_function_times_out() {
        let mut functions = FunctionRegistry::new();
        functions.register("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!(null))
        });
        let worker = Worker::new(ExecutorConfig::default()).with_functions(functions);
        let mut step = Step::new(
            "slow",
            ActionSpec::Function {
                name: "slow".into(),
                arguments: Map::new(),
            },
        );
        step.timeout_secs = Some(1);

        let err = run(&worker, &step, &mut SharedMemory::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.is_retriable());
    }

    // -- Sub-workflows and sandbox --

    #[tokio::test]
    async fn sub_workflow_depth_is_bounded() {
        let subs = Arc::new(RecordingSubWorkflows {
            depths: Mutex::new(Vec::new()),
        });
        let config = ExecutorConfig {
            max_sub_workflow_depth: 2,
            ..Default::default()
        };
        let worker = Worker::new(config).with_sub_workflows(subs.clone());
        let step = Step::new(
            "nested",
            ActionSpec::SubWorkflow {
                workflow_id: "child".into(),
                inputs: Map::new(),
            },
        );

        let mut memory = SharedMemory::new();
        let mut ctx = StepContext {
            run_id: Uuid::now_v7(),
            memory: &mut memory,
            depth: 1,
            attempt: 1,
        };
        let result = worker.execute(&step, &mut ctx).await.unwrap();
        assert_eq!(result.tokens_used, 40);
        assert_eq!(result.outputs["summary"], json!("ran child"));
        assert_eq!(*subs.depths.lock().unwrap(), vec![2]);

        ctx.depth = 2;
        let err = worker.execute(&step, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SubWorkflowDepthExceeded);
    }

    #[tokio::test]
    async fn sandbox_security_violation_is_flagged() {
        let sandbox = StubSandbox {
            result: SandboxResult {
                success: false,
                error: Some("Security violation: import of os".into()),
                ..Default::default()
            },
        };
        let worker = Worker::new(ExecutorConfig::default()).with_sandbox(Arc::new(sandbox));
        let step = Step::new(
            "code",
            ActionSpec::SandboxedCode {
                code: "import os".into(),
                language: Some("python".into()),
            },
        );

        let err = run(&worker, &step, &mut SharedMemory::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SecurityError);
        assert_eq!(err.context["security_violation"], json!(true));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn sandbox_variables_become_outputs() {
        let mut variables = Map::new();
        variables.insert("total".into(), json!(6));
        let sandbox = StubSandbox {
            result: SandboxResult {
                success: true,
                result: json!("done"),
                variables,
                error: None,
                execution_time_ms: 3,
            },
        };
        let worker = Worker::new(ExecutorConfig::default()).with_sandbox(Arc::new(sandbox));
        let step = Step::new(
            "code",
            ActionSpec::SandboxedCode {
                code: "total = 1 + 2 + 3".into(),
                language: None,
            },
        );

        let mut memory = SharedMemory::new();
        let result = run(&worker, &step, &mut memory).await.unwrap();
        assert_eq!(result.outputs["total"], json!(6));
        assert_eq!(memory.get("result"), Some(&json!("done")));
    }
}
