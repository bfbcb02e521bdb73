//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cosci::adapters::{
    CompletionOptions, InferenceClient, InferenceError, SandboxLimits, ScriptHost, ScriptOutput,
    ScriptRequest, ToolOutput, ToolRequest, ToolTransport,
};
use cosci::core::{
    AnalysisRunner, DispatchError, ExecutorOptions, PayloadStore, RetryPolicy, ToolDispatcher,
};
use cosci::Executor;
use tempfile::TempDir;

/// Scripted reply for one tool call attempt
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(DispatchError),
    /// Sleep, then answer
    Slow(Duration, String),
    /// Never answer
    Hang,
}

/// Tool transport answering from per-call scripts
#[derive(Default)]
pub struct FakeTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<ToolRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for a call id; the last one repeats
    pub fn script(self, call_id: &str, replies: Vec<Reply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(call_id.to_string(), replies.into_iter().collect());
        self
    }

    pub fn reply(self, call_id: &str, reply: Reply) -> Self {
        self.script(call_id, vec![reply])
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn attempts(&self, call_id: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.call_id == call_id)
            .count()
    }

    fn next_reply(&self, call_id: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(call_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::Text(String::new())),
            None => Reply::Text(format!("result of {}", call_id)),
        }
    }
}

#[async_trait]
impl ToolTransport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn execute(
        &self,
        request: &ToolRequest,
        _timeout: Duration,
    ) -> Result<ToolOutput, DispatchError> {
        self.requests.lock().unwrap().push(request.clone());

        match self.next_reply(&request.call_id) {
            Reply::Text(text) => Ok(ToolOutput::new(text)),
            Reply::Fail(err) => Err(err),
            Reply::Slow(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::new(text))
            }
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

type Responder = Box<dyn Fn(&ScriptRequest) -> ScriptOutput + Send + Sync>;

/// Script host that answers with a closure and keeps every request
pub struct FakeHost {
    respond: Responder,
    requests: Mutex<Vec<ScriptRequest>>,
}

impl FakeHost {
    pub fn new(respond: impl Fn(&ScriptRequest) -> ScriptOutput + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always print `stdout` and exit 0
    pub fn printing(stdout: &str) -> Self {
        let stdout = stdout.to_string();
        Self::new(move |_| ScriptOutput {
            stdout: stdout.clone(),
            exit_code: Some(0),
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<ScriptRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptHost for FakeHost {
    fn name(&self) -> &str {
        "fake"
    }

    async fn execute(&self, request: ScriptRequest) -> anyhow::Result<ScriptOutput> {
        let output = (self.respond)(&request);
        self.requests.lock().unwrap().push(request);
        Ok(output)
    }
}

/// Inference client with canned answers
#[derive(Default)]
pub struct FakeLlm {
    answers: Mutex<VecDeque<Result<String, InferenceError>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn answering(answers: Vec<Result<String, InferenceError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceClient for FakeLlm {
    fn name(&self) -> &str {
        "fake-llm"
    }

    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, InferenceError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("report".to_string()))
    }
}

/// Retry policy with delays short enough for tests
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
    }
}

/// Everything an executor test needs, rooted in a temp dir
pub struct Harness {
    pub temp: TempDir,
    pub transport: Arc<FakeTransport>,
    pub host: Arc<FakeHost>,
    pub store: Arc<PayloadStore>,
}

impl Harness {
    pub async fn new(transport: FakeTransport, host: FakeHost) -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(PayloadStore::open(temp.path().join("payloads")).await.unwrap());
        Self {
            temp,
            transport: Arc::new(transport),
            host: Arc::new(host),
            store,
        }
    }

    pub fn options(&self) -> ExecutorOptions {
        ExecutorOptions::new(self.temp.path().join("runs")).with_retry(fast_retry(3))
    }

    pub fn executor(&self, options: ExecutorOptions) -> Executor {
        let dispatcher = ToolDispatcher::new(self.transport.clone(), Duration::from_secs(5));
        let analysis = AnalysisRunner::new(
            self.host.clone(),
            Arc::clone(&self.store),
            SandboxLimits::default(),
        );
        Executor::new(dispatcher, Arc::clone(&self.store), analysis, options)
    }
}
