//! Script Host Integration Tests
//!
//! Runs real `sh` scripts through the subprocess host and the analysis
//! runner: exit codes, malformed output, wall-clock kills, output caps,
//! signal handling and filesystem isolation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cosci::adapters::{
    Isolation, ProcessScriptHost, SandboxError, SandboxLimits, ScriptHost, ScriptRequest,
};
use cosci::core::{AnalysisError, AnalysisRunner, AnalysisScriptSpec, PayloadStore};
use cosci::domain::ErrorKind;
use tempfile::TempDir;

fn sh_host() -> ProcessScriptHost {
    ProcessScriptHost::new(vec!["sh".to_string()]).with_isolation(Isolation::Disabled)
}

async fn runner_with(
    host: ProcessScriptHost,
    limits: SandboxLimits,
) -> (AnalysisRunner, Arc<PayloadStore>, TempDir) {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(PayloadStore::open(temp.path().join("payloads")).await.unwrap());
    let runner = AnalysisRunner::new(Arc::new(host), Arc::clone(&store), limits);
    (runner, store, temp)
}

fn short_limits() -> SandboxLimits {
    SandboxLimits {
        wall_clock_seconds: 1,
        memory_limit_mb: 512,
        max_output_bytes: 1024,
    }
}

#[tokio::test]
async fn test_script_reads_mounted_payload() {
    let (runner, store, _temp) = runner_with(sh_host(), SandboxLimits::default()).await;
    let record = store.put(b"alpha\nbeta\ngamma\n").await.unwrap();

    let script = r#"
n=$(wc -l < "$COSCI_INPUTS_DIR/payload_1.txt" | tr -d ' ')
printf '{"summary": "counted lines", "metrics": {"lines": %d}}' "$n"
"#;
    let result = runner
        .analyze(&[record.reference.clone()], &AnalysisScriptSpec::new(script))
        .await
        .unwrap();

    assert_eq!(result.summary, "counted lines");
    assert_eq!(result.metrics.get("lines"), Some(&3.0));
    assert_eq!(result.inputs, vec![record.reference.key]);
}

#[tokio::test]
async fn test_nonzero_exit_is_a_script_error() {
    let (runner, _, _temp) = runner_with(sh_host(), SandboxLimits::default()).await;

    let err = runner
        .analyze(&[], &AnalysisScriptSpec::new("echo 'column missing' >&2\nexit 3\n"))
        .await
        .unwrap_err();

    match &err {
        AnalysisError::ScriptError { exit_code, .. } => assert_eq!(*exit_code, Some(3)),
        other => panic!("expected script error, got {:?}", other),
    }
    assert!(err.diagnostics().unwrap().contains("column missing"));
}

#[tokio::test]
async fn test_malformed_stdout_is_a_script_error() {
    let (runner, _, _temp) = runner_with(sh_host(), SandboxLimits::default()).await;

    let err = runner
        .analyze(&[], &AnalysisScriptSpec::new("echo 'not json at all'\n"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AnalysisScriptError);
    assert!(err.to_string().contains("malformed output"));
    assert!(err.diagnostics().unwrap().contains("not json at all"));
}

#[tokio::test]
async fn test_wall_clock_kill_keeps_partial_stderr() {
    let (runner, _, _temp) = runner_with(sh_host(), short_limits()).await;

    let started = Instant::now();
    let err = runner
        .analyze(&[], &AnalysisScriptSpec::new("echo 'LOADING STAGE 1' >&2\nsleep 30\n"))
        .await
        .unwrap_err();

    assert!(matches!(err, AnalysisError::Timeout { limit_seconds: 1, .. }));
    assert!(err.diagnostics().unwrap().contains("LOADING STAGE 1"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_runaway_output_is_stopped_at_the_cap() {
    let host = sh_host();
    let request = ScriptRequest {
        source: "while :; do echo 0123456789abcdef; done\n".to_string(),
        inputs: Vec::new(),
        limits: SandboxLimits {
            wall_clock_seconds: 30,
            ..short_limits()
        },
    };

    let started = Instant::now();
    let output = host.execute(request).await.unwrap();

    assert!(output.output_exceeded);
    assert!(!output.timed_out);
    assert!(output.stdout.len() <= 1025);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_runaway_output_is_a_resource_error() {
    let (runner, _, _temp) = runner_with(sh_host(), short_limits()).await;

    let err = runner
        .analyze(&[], &AnalysisScriptSpec::new("while :; do echo spam; done\n"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AnalysisResourceExceeded);
    assert!(err.to_string().contains("output exceeds 1024 bytes"));
}

#[tokio::test]
async fn test_termination_signal_is_not_a_memory_breach() {
    let (runner, _, _temp) = runner_with(sh_host(), SandboxLimits::default()).await;

    let err = runner
        .analyze(&[], &AnalysisScriptSpec::new("kill -TERM $$\nsleep 5\n"))
        .await
        .unwrap_err();

    match &err {
        AnalysisError::ScriptError { reason, exit_code, .. } => {
            assert_eq!(*exit_code, None);
            assert!(reason.contains("signal 15"));
        }
        other => panic!("expected script error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_wrapper_is_a_configuration_error() {
    let host = ProcessScriptHost::new(vec!["sh".to_string()])
        .with_isolation(Isolation::Wrapper(Vec::new()));
    let (runner, _, _temp) = runner_with(host, SandboxLimits::default()).await;

    let err = runner
        .analyze(&[], &AnalysisScriptSpec::new("echo '{\"summary\": \"ran\"}'\n"))
        .await
        .unwrap_err();

    assert!(matches!(err, AnalysisError::Configuration(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_missing_wrapper_is_reported_before_spawn() {
    let host = ProcessScriptHost::new(vec!["sh".to_string()])
        .with_isolation(Isolation::Wrapper(vec!["cosci-missing-bwrap".to_string()]));

    let err = host
        .execute(ScriptRequest {
            source: "true\n".to_string(),
            inputs: Vec::new(),
            limits: SandboxLimits::default(),
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<SandboxError>(),
        Some(SandboxError::IsolationUnavailable(_))
    ));
}

#[tokio::test]
async fn test_default_isolation_confines_writes_to_scratch() {
    let host = ProcessScriptHost::new(vec!["sh".to_string()]);

    // Hosts without bwrap or without user namespaces cannot run this
    let smoke = host
        .execute(ScriptRequest {
            source: "exit 0\n".to_string(),
            inputs: Vec::new(),
            limits: SandboxLimits::default(),
        })
        .await;
    match smoke {
        Ok(output) if output.exit_code == Some(0) => {}
        Ok(output) => {
            eprintln!("skipping: bwrap cannot create a sandbox here: {}", output.stderr);
            return;
        }
        Err(e) => {
            eprintln!("skipping: {:#}", e);
            return;
        }
    }

    let outside = TempDir::new().unwrap();
    let escape = outside.path().join("escaped.txt");
    let script = format!(
        r#"
if echo x > "{escape}" 2>/dev/null; then outside=1; else outside=0; fi
if cat /etc/hostname > /dev/null 2>&1; then host_etc=1; else host_etc=0; fi
if echo x > "$HOME/note.txt"; then scratch=1; else scratch=0; fi
printf '{{"summary": "fs", "metrics": {{"outside": %d, "host_etc": %d, "scratch": %d}}}}' $outside $host_etc $scratch
"#,
        escape = escape.display()
    );
    let (runner, _, _temp) = runner_with(host, SandboxLimits::default()).await;

    let result = runner.analyze(&[], &AnalysisScriptSpec::new(script)).await.unwrap();

    assert_eq!(result.metrics.get("outside"), Some(&0.0));
    assert_eq!(result.metrics.get("host_etc"), Some(&0.0));
    assert_eq!(result.metrics.get("scratch"), Some(&1.0));
    assert!(!escape.exists());
}
