//! Executor Integration Tests
//!
//! End-to-end runs over fake transports, script hosts and models.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_retry, FakeHost, FakeLlm, FakeTransport, Harness, Reply};
use cosci::adapters::{CompletionOptions, InferenceClient, ScriptOutput};
use cosci::core::{
    AnalysisScriptSpec, DispatchError, EventStore, ExecutionMode, Plan, PlanStep, SafetyLimits,
    ToolArgs, ToolCallSpec,
};
use cosci::domain::{ErrorKind, EventType, RunState, StepInput, StepStatus, ToolCallResult};
use cosci::Executor;

const ANALYSIS_OUTPUT: &str =
    r#"{"summary": "12 papers, median year 2022", "metrics": {"papers": 12.0}}"#;

fn arxiv(id: &str) -> ToolCallSpec {
    ToolCallSpec::new(
        id,
        ToolArgs::ArxivSearch {
            query: "graphene quantum dots".to_string(),
            max_results: 20,
        },
    )
}

fn pubchem(id: &str) -> ToolCallSpec {
    ToolCallSpec::new(
        id,
        ToolArgs::PubchemQuery {
            keywords: vec!["graphene".to_string()],
            compound_type: None,
        },
    )
}

fn research_plan() -> Plan {
    Plan::new(
        "Survey graphene quantum dots for bioimaging",
        vec![
            PlanStep::tools("Gather sources", vec![arxiv("arxiv"), pubchem("pubchem")]),
            PlanStep::analysis(
                "Count papers per year",
                AnalysisScriptSpec::new("import json; print(json.dumps({'summary': 'ok'}))"),
            )
            .depends_on([1]),
            PlanStep::synthesis("Write report", "Summarize the findings").depends_on([1, 2]),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn test_large_results_travel_by_reference() {
    let big = "ARXIV-ENTRY ".repeat(50 * 1024 / 12 + 1);
    let small = "CID 12345: graphene oxide, MW 200.1 g/mol. ".repeat(4);
    assert!(big.len() > 50 * 1024 - 12);
    assert!(small.len() < 10 * 1024);

    let transport = FakeTransport::new()
        .reply("arxiv", Reply::Text(big.clone()))
        .reply("pubchem", Reply::Text(small.clone()));
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;

    let llm = Arc::new(FakeLlm::answering(vec![Ok("Final report".to_string())]));
    let executor = harness
        .executor(harness.options())
        .with_inference(llm.clone(), CompletionOptions::default());

    let result = executor.run(research_plan()).await.unwrap();
    assert_eq!(result.state, RunState::Completed);

    // Step 1: the big result is staged, the small one stays inline
    let gather = result.step(1).unwrap();
    assert_eq!(gather.status, StepStatus::Succeeded);
    let staged = match &gather.calls[0].result {
        ToolCallResult::Staged { payload } => payload.clone(),
        other => panic!("expected staged result, got {:?}", other),
    };
    assert_eq!(staged.size_bytes, big.len() as u64);
    assert!(matches!(
        &gather.calls[1].result,
        ToolCallResult::Inline { text } if *text == small
    ));
    assert!(harness.store.contains(&staged.key).await);
    assert_eq!(result.payloads.len(), 1);
    assert_eq!(result.payloads[0].step, 1);
    assert_eq!(result.payloads[0].call_id, "arxiv");

    // Step 2: the script saw the payload as a file and the small text inline
    let requests = harness.host.requests();
    assert_eq!(requests.len(), 1);
    let payload_file = requests[0]
        .inputs
        .iter()
        .find(|m| m.name == "payload_1.txt")
        .unwrap();
    assert_eq!(payload_file.bytes, big.as_bytes());
    assert!(requests[0].inputs.iter().any(|m| m.name == "inline_1.txt"));
    assert!(requests[0].inputs.iter().any(|m| m.name == "manifest.json"));

    let analysis = result.analyses.get(&2).unwrap();
    assert_eq!(analysis.summary, "12 papers, median year 2022");
    assert_eq!(analysis.inputs, vec![staged.key.clone()]);

    // Step 3: the prompt carries the key, never the 50KB body
    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains(&staged.key));
    assert!(!prompts[0].contains("ARXIV-ENTRY ARXIV-ENTRY"));
    assert!(prompts[0].contains("CID 12345"));
    assert!(prompts[0].contains("12 papers"));
    assert!(prompts[0].len() < 4 * 1024);

    let synthesis = result.step(3).unwrap();
    assert!(matches!(
        &synthesis.calls[0].result,
        ToolCallResult::Inline { text } if text == "Final report"
    ));
}

#[tokio::test]
async fn test_plan_recorded_before_first_step() {
    let harness = Harness::new(FakeTransport::new(), FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness
        .executor(harness.options())
        .with_inference(Arc::new(FakeLlm::default()), CompletionOptions::default());

    let plan = research_plan();
    let plan_id = plan.id;
    let result = executor.run(plan).await.unwrap();

    let log = EventStore::open(&harness.temp.path().join("runs"), result.run_id)
        .await
        .unwrap();
    let events = log.replay().await.unwrap();

    assert_eq!(events[0].event_type, EventType::RunStarted);
    assert_eq!(events[1].event_type, EventType::PlanRecorded);
    assert!(events[2..]
        .iter()
        .all(|e| e.event_type != EventType::PlanRecorded));

    let recorded = log.load_plan().await.unwrap().unwrap();
    assert_eq!(recorded.id, plan_id);
    assert_eq!(recorded.len(), 3);

    // Steps start in order and each finishes before the next starts
    let started: Vec<usize> = events
        .iter()
        .filter(|e| e.event_type == EventType::StepStarted)
        .filter_map(|e| e.step)
        .collect();
    assert_eq!(started, vec![1, 2, 3]);

    let finished_1 = events
        .iter()
        .position(|e| e.event_type == EventType::StepSucceeded && e.step == Some(1))
        .unwrap();
    let started_2 = events
        .iter()
        .position(|e| e.event_type == EventType::StepStarted && e.step == Some(2))
        .unwrap();
    assert!(finished_1 < started_2);

    assert_eq!(events.last().unwrap().event_type, EventType::RunCompleted);
}

fn failing_chain() -> Plan {
    Plan::new(
        "Chain with a broken source",
        vec![
            PlanStep::tools("Search", vec![arxiv("arxiv")]),
            PlanStep::synthesis("Summarize", "Summarize the search").depends_on([1]),
            PlanStep::synthesis("Polish", "Polish the summary").depends_on([2]),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn test_strict_mode_skips_dependents() {
    let transport = FakeTransport::new().reply(
        "arxiv",
        Reply::Fail(DispatchError::InvalidArgument("rejected by platform".to_string())),
    );
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let llm = Arc::new(FakeLlm::default());
    let executor = harness
        .executor(harness.options())
        .with_inference(llm.clone(), CompletionOptions::default());

    let result = executor.run(failing_chain()).await.unwrap();

    assert_eq!(result.step(1).unwrap().status, StepStatus::Failed);
    assert_eq!(
        result.step(1).unwrap().error.as_ref().unwrap().kind,
        ErrorKind::InvalidArgument
    );

    // Skips propagate transitively
    for ordinal in [2, 3] {
        let step = result.step(ordinal).unwrap();
        assert_eq!(step.status, StepStatus::Skipped);
        assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::UpstreamFailed);
    }

    assert_eq!(result.state, RunState::CompletedWithFailures { failed: 3 });
    assert!(llm.prompts().is_empty());
    // Not retryable, so exactly one attempt
    assert_eq!(harness.transport.attempts("arxiv"), 1);
}

#[tokio::test]
async fn test_lenient_mode_marks_missing_inputs() {
    let transport = FakeTransport::new().reply(
        "arxiv",
        Reply::Fail(DispatchError::InvalidArgument("rejected by platform".to_string())),
    );
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let llm = Arc::new(FakeLlm::default());
    let executor = harness
        .executor(harness.options().with_mode(ExecutionMode::Lenient))
        .with_inference(llm.clone(), CompletionOptions::default());

    let result = executor.run(failing_chain()).await.unwrap();

    let summarize = result.step(2).unwrap();
    assert_eq!(summarize.status, StepStatus::Succeeded);
    assert_eq!(summarize.inputs, vec![StepInput::MissingUpstream { step: 1 }]);
    assert_eq!(summarize.missing_upstream(), vec![1]);
    assert!(llm.prompts()[0].contains("[step 1] missing"));

    assert_eq!(result.step(3).unwrap().status, StepStatus::Succeeded);
    assert_eq!(result.state, RunState::CompletedWithFailures { failed: 1 });
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let transport = FakeTransport::new()
        .script(
            "arxiv",
            vec![
                Reply::Fail(DispatchError::Timeout { timeout_ms: 10 }),
                Reply::Fail(DispatchError::RemoteFailure("502".to_string())),
                Reply::Text("papers".to_string()),
            ],
        )
        .reply("pubchem", Reply::Text("compounds".to_string()));
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options());

    let plan = Plan::new(
        "Retry sources",
        vec![PlanStep::tools("Search", vec![arxiv("arxiv"), pubchem("pubchem")])],
    )
    .unwrap();
    let result = executor.run(plan).await.unwrap();

    assert_eq!(result.state, RunState::Completed);
    let step = result.step(1).unwrap();
    assert_eq!(step.calls[0].attempts, 3);
    assert_eq!(step.calls[1].attempts, 1);

    // Only the failed call was re-dispatched
    assert_eq!(harness.transport.attempts("arxiv"), 3);
    assert_eq!(harness.transport.attempts("pubchem"), 1);

    let events = EventStore::open(&harness.temp.path().join("runs"), result.run_id)
        .await
        .unwrap()
        .replay()
        .await
        .unwrap();
    let retries = events
        .iter()
        .filter(|e| e.event_type == EventType::CallRetrying)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_required_call() {
    let transport = FakeTransport::new()
        .reply("arxiv", Reply::Fail(DispatchError::RemoteFailure("503".to_string())));
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options().with_retry(fast_retry(2)));

    let plan = Plan::new("Give up", vec![PlanStep::tools("Search", vec![arxiv("arxiv")])]).unwrap();
    let result = executor.run(plan).await.unwrap();

    let step = result.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.calls[0].attempts, 2);
    assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::RemoteFailure);
    assert_eq!(harness.transport.attempts("arxiv"), 2);
}

#[tokio::test]
async fn test_optional_call_failure_keeps_step_alive() {
    let transport = FakeTransport::new()
        .reply("arxiv", Reply::Text("papers".to_string()))
        .reply(
            "pubchem",
            Reply::Fail(DispatchError::InvalidArgument("unknown compound".to_string())),
        );
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options());

    let plan = Plan::new(
        "Partial sources",
        vec![PlanStep::tools(
            "Search",
            vec![arxiv("arxiv"), pubchem("pubchem").optional()],
        )],
    )
    .unwrap();
    let result = executor.run(plan).await.unwrap();

    let step = result.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Succeeded);
    assert!(step.calls[1].result.payload().is_none());
    assert!(!step.calls[1].result.is_success());
    assert_eq!(result.state, RunState::Completed);
}

#[tokio::test]
async fn test_cancellation_stops_before_next_step() {
    let transport = FakeTransport::new()
        .reply("a", Reply::Text("first".to_string()))
        .reply("b", Reply::Hang)
        .reply("c", Reply::Text("never".to_string()));
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options());
    let token = executor.cancellation_token();

    let plan = Plan::new(
        "Cancel midway",
        vec![
            PlanStep::tools("A", vec![arxiv("a")]),
            PlanStep::tools("B", vec![arxiv("b")]),
            PlanStep::tools("C", vec![arxiv("c")]),
        ],
    )
    .unwrap();

    let (result, _) = tokio::join!(executor.run(plan), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });
    let result = result.unwrap();

    assert_eq!(result.state, RunState::Cancelled);
    assert_eq!(result.step(1).unwrap().status, StepStatus::Succeeded);
    assert_eq!(result.step(2).unwrap().status, StepStatus::Cancelled);
    assert_eq!(result.step(3).unwrap().status, StepStatus::Pending);
    assert_eq!(harness.transport.attempts("c"), 0);

    let run = Executor::get_run_status(&harness.temp.path().join("runs"), result.run_id)
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.step_status(3), StepStatus::Pending);
}

#[tokio::test]
async fn test_run_timeout_stops_new_steps() {
    let harness = Harness::new(FakeTransport::new(), FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options().with_limits(SafetyLimits {
        run_timeout_seconds: 0,
        ..Default::default()
    }));

    let plan = Plan::new("Too slow", vec![PlanStep::tools("Search", vec![arxiv("arxiv")])]).unwrap();
    let result = executor.run(plan).await.unwrap();

    assert!(matches!(result.state, RunState::SafetyLimitReached { .. }));
    assert!(harness.transport.requests().is_empty());
}

#[tokio::test]
async fn test_staging_budget_stops_new_steps() {
    let big = "x".repeat(20 * 1024);
    let transport = FakeTransport::new().reply("first", Reply::Text(big));
    let harness = Harness::new(transport, FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options().with_limits(SafetyLimits {
        max_staged_bytes: 16 * 1024,
        ..Default::default()
    }));

    let plan = Plan::new(
        "Budgeted",
        vec![
            PlanStep::tools("First", vec![arxiv("first")]),
            PlanStep::tools("Second", vec![arxiv("second")]),
        ],
    )
    .unwrap();
    let result = executor.run(plan).await.unwrap();

    match &result.state {
        RunState::SafetyLimitReached { limit } => assert!(limit.contains("Staging budget")),
        other => panic!("expected safety limit, got {:?}", other),
    }
    assert_eq!(result.step(1).unwrap().status, StepStatus::Succeeded);
    assert_eq!(result.step(2).unwrap().status, StepStatus::Pending);
    assert_eq!(harness.transport.attempts("second"), 0);
}

#[tokio::test]
async fn test_plan_over_step_limit_is_rejected() {
    let harness = Harness::new(FakeTransport::new(), FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options().with_limits(SafetyLimits {
        max_steps: 1,
        ..Default::default()
    }));

    let plan = Plan::new(
        "Too long",
        vec![
            PlanStep::tools("One", vec![arxiv("one")]),
            PlanStep::tools("Two", vec![arxiv("two")]),
        ],
    )
    .unwrap();

    assert!(executor.run(plan).await.is_err());
    assert!(harness.transport.requests().is_empty());
}

#[tokio::test]
async fn test_synthesis_without_model_fails_step() {
    let harness = Harness::new(FakeTransport::new(), FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let executor = harness.executor(harness.options());

    let plan = Plan::new("No model", vec![PlanStep::synthesis("Write", "Write it")]).unwrap();
    let result = executor.run(plan).await.unwrap();

    let step = result.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::Configuration);
}

#[tokio::test]
async fn test_failed_script_reports_diagnostics() {
    let host = FakeHost::new(|_| ScriptOutput {
        stderr: "Traceback: NameError: name 'pd' is not defined".to_string(),
        exit_code: Some(1),
        ..Default::default()
    });
    let harness = Harness::new(FakeTransport::new(), host).await;
    let executor = harness.executor(harness.options());

    let plan = Plan::new(
        "Broken analysis",
        vec![
            PlanStep::tools("Search", vec![arxiv("arxiv")]),
            PlanStep::analysis("Analyze", AnalysisScriptSpec::new("pd.read_csv('x')")).depends_on([1]),
        ],
    )
    .unwrap();
    let result = executor.run(plan).await.unwrap();

    let step = result.step(2).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    let error = step.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::AnalysisScriptError);
    assert!(error.message.contains("NameError"));
    assert!(result.analyses.is_empty());
}

#[tokio::test]
async fn test_oversized_synthesis_is_staged() {
    let harness = Harness::new(FakeTransport::new(), FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let report = "section ".repeat(4096);
    let llm: Arc<dyn InferenceClient> = Arc::new(FakeLlm::answering(vec![Ok(report.clone())]));
    let executor = harness
        .executor(harness.options().with_inline_threshold(1024))
        .with_inference(llm, CompletionOptions::default());

    let plan = Plan::new("Long report", vec![PlanStep::synthesis("Write", "Write it")]).unwrap();
    let result = executor.run(plan).await.unwrap();

    let call = &result.step(1).unwrap().calls[0];
    assert_eq!(call.call_id, "synthesis");
    let payload = call.result.payload().unwrap();
    let stored = harness.store.get(payload).await.unwrap();
    assert_eq!(stored, report.as_bytes());
}

const FINAL_REPORT: &str = r#"{
  "hypothesis": "Nitrogen-doped graphene dots exceed 60% quantum yield",
  "protocol_summary": "Hydrothermal synthesis, dialysis, PL spectroscopy",
  "analysis_findings": "12 papers, median year 2022",
  "prior_art_reference_links": ["https://arxiv.org/abs/2301.00001"],
  "next_steps": "In-vitro cytotoxicity screen"
}"#;

fn publish(id: &str) -> ToolCallSpec {
    ToolCallSpec::new(
        id,
        ToolArgs::PublishReport {
            title: "Graphene dots report".to_string(),
            body: None,
        },
    )
}

#[tokio::test]
async fn test_final_report_feeds_publish_body() {
    let harness = Harness::new(FakeTransport::new(), FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let llm = Arc::new(FakeLlm::answering(vec![Ok(FINAL_REPORT.to_string())]));
    let executor = harness
        .executor(harness.options())
        .with_inference(llm.clone(), CompletionOptions::default());

    let plan = Plan::new(
        "Graphene dots",
        vec![
            PlanStep::tools("Search", vec![arxiv("arxiv")]),
            PlanStep::final_report("Report", "Write the final report").depends_on([1]),
            PlanStep::tools("Publish", vec![publish("publish")]).depends_on([2]),
        ],
    )
    .unwrap();
    let result = executor.run(plan).await.unwrap();
    assert_eq!(result.state, RunState::Completed);

    let report = result.step(2).unwrap().synthesis.as_ref().unwrap();
    assert_eq!(report.next_steps, "In-vitro cytotoxicity screen");
    assert!(llm.prompts()[0].contains("prior_art_reference_links"));

    let sent = harness
        .transport
        .requests()
        .into_iter()
        .find(|r| r.call_id == "publish")
        .unwrap();
    let body = sent.arguments["body"].as_str().unwrap();
    assert!(body.contains("## Hypothesis\n\nNitrogen-doped"));
    assert!(body.contains("- https://arxiv.org/abs/2301.00001"));
}

#[tokio::test]
async fn test_invalid_final_report_fails_step() {
    let harness = Harness::new(FakeTransport::new(), FakeHost::printing(ANALYSIS_OUTPUT)).await;
    let llm = Arc::new(FakeLlm::answering(vec![Ok(
        r#"{"hypothesis": "Dots glow", "next_steps": "Test them"}"#.to_string(),
    )]));
    let executor = harness
        .executor(harness.options())
        .with_inference(llm, CompletionOptions::default());

    let plan = Plan::new(
        "Graphene dots",
        vec![
            PlanStep::final_report("Report", "Write the final report"),
            PlanStep::tools("Publish", vec![publish("publish")]).depends_on([1]),
        ],
    )
    .unwrap();
    let result = executor.run(plan).await.unwrap();

    let step = result.step(1).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.synthesis.is_none());
    let error = step.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Inference);
    assert!(error.message.contains("final report"));

    assert_eq!(result.step(2).unwrap().status, StepStatus::Skipped);
    assert_eq!(harness.transport.attempts("publish"), 0);
}
