//! End-to-end tests driving the mock server binary through full
//! launch-execute-interpret cycles

use std::time::Duration;

use serde_json::json;

use remotestep::{Error, Session, SessionBuilder};

fn mock_session(name: &str) -> SessionBuilder {
    remotestep::common::logging::init_harness();
    Session::builder(name)
        .executable(env!("CARGO_BIN_EXE_mock_server"))
        .startup_timeout(Duration::from_secs(30))
}

#[tokio::test]
async fn test_step_returns_value_from_child() {
    let mut session = mock_session("echo").build().unwrap();
    let value = session
        .run_step("echo", json!({"k": "v", "n": 3}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value["k"], "v");
    assert_eq!(value["n"], 3);
}

#[tokio::test]
async fn test_step_without_return_value_yields_none() {
    let mut session = mock_session("void").build().unwrap();
    let value = session.run_step("sleep", json!({"secs": 0})).await.unwrap();
    assert!(value.is_none());
}

#[tokio::test]
async fn test_child_sees_the_session_home_and_port() {
    let mut session = mock_session("identity").build().unwrap();
    let value = session
        .run_step("identity", json!({}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value["home"], session.home().display().to_string());
    assert_eq!(value["port"], session.port());
}

#[tokio::test]
async fn test_failure_is_reconstructed_with_step_and_site() {
    let mut session = mock_session("boom").build().unwrap();
    let err = session
        .run_step("boom", json!({"message": "records exploded"}))
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(matches!(err, Error::StepFailed { .. }), "got: {text}");
    assert!(text.contains("'boom'"), "got: {text}");
    assert!(text.contains("records exploded"), "got: {text}");
    // Attributed to the handler's registration site in the child binary
    assert!(text.contains("mock_server.rs"), "got: {text}");
}

#[tokio::test]
async fn test_failure_cause_chain_crosses_the_process_boundary() {
    let mut session = mock_session("chain").build().unwrap();
    let err = session
        .run_step("chained_failure", json!({}))
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(text.contains("records index unreadable"), "got: {text}");
    assert!(text.contains("caused by"), "got: {text}");
    assert!(text.contains("disk offline"), "got: {text}");
}

#[tokio::test]
async fn test_panic_is_reported_with_its_site() {
    let mut session = mock_session("panic").build().unwrap();
    let err = session
        .run_step("panic_with", json!({"message": "invariant violated"}))
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(matches!(err, Error::StepFailed { .. }), "got: {text}");
    assert!(text.contains("invariant violated"), "got: {text}");
    assert!(text.contains("mock_server.rs"), "got: {text}");
}

#[tokio::test]
async fn test_unmet_assumption_becomes_a_skip() {
    let mut session = mock_session("skip").build().unwrap();
    let err = session
        .run_step("skip_unless", json!({"present": false}))
        .await
        .unwrap_err();

    assert!(err.is_skip(), "got: {err}");
    assert!(err.to_string().contains("required fixture not present"));
}

#[tokio::test]
async fn test_met_assumption_runs_normally() {
    let mut session = mock_session("no-skip").build().unwrap();
    let value = session
        .run_step("skip_unless", json!({"present": true}))
        .await
        .unwrap();
    assert!(value.is_none());
}

#[tokio::test]
async fn test_state_survives_a_restart() {
    let mut session = mock_session("restart").build().unwrap();

    let written = session
        .run_step("write_records", json!({"count": 3}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written, json!(3));

    // Second step is a fresh process against the same home
    let counted = session
        .run_step("count_records", json!({}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counted, json!(3));
    assert_eq!(session.launches(), 2);
}

#[tokio::test]
async fn test_hard_shutdown_keeps_flushed_state() {
    let mut session = mock_session("hard").build().unwrap();
    session
        .run_step("write_records", json!({"count": 2}))
        .await
        .unwrap();

    session.hard_shutdown().unwrap();

    let counted = session
        .run_step("count_records", json!({}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counted, json!(2));
}

#[tokio::test]
async fn test_crash_is_not_a_step_failure() {
    let mut session = mock_session("crash").build().unwrap();
    let err = session
        .run_step("exit_with", json!({"code": 7}))
        .await
        .unwrap_err();

    match err {
        Error::ProcessCrashed { status, .. } => {
            assert!(status.contains('7'), "got: {status}");
        }
        other => panic!("expected ProcessCrashed, got: {other}"),
    }
}

#[tokio::test]
async fn test_unknown_step_is_a_protocol_error() {
    let mut session = mock_session("unknown").build().unwrap();
    let err = session
        .run_step("no_such_step", json!({}))
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(matches!(err, Error::Protocol(_)), "got: {text}");
    assert!(
        text.contains("'no_such_step' not found during remote step decoding"),
        "got: {text}"
    );
    assert!(text.contains("mock-app"), "got: {text}");
    assert!(text.contains("mock-test"), "got: {text}");
}

#[tokio::test]
async fn test_step_timeout_is_attributed_to_the_step() {
    let mut session = mock_session("timeout")
        .step_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let err = session
        .run_step("sleep", json!({"secs": 60}))
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(matches!(err, Error::StepFailed { .. }), "got: {text}");
    assert!(text.contains("did not complete within 1s"), "got: {text}");
}

#[tokio::test]
async fn test_busy_server_renders_its_page_in_the_startup_failure() {
    let mut session = mock_session("busy")
        .env("REMOTESTEP_MOCK_BUSY", "1")
        .startup_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let err = session.run_step("echo", json!({})).await.unwrap_err();

    match err {
        Error::Startup { rendered } => {
            assert!(rendered.contains("not ready within"), "got: {rendered}");
            assert!(rendered.contains("503"), "got: {rendered}");
            assert!(rendered.contains("server busy"), "got: {rendered}");
        }
        other => panic!("expected Startup, got: {other}"),
    }
}

#[tokio::test]
async fn test_boot_refusal_is_a_startup_failure() {
    let mut session = mock_session("refused")
        .env("REMOTESTEP_MOCK_FAIL_BOOT", "1")
        .build()
        .unwrap();
    let err = session.run_step("echo", json!({})).await.unwrap_err();

    match err {
        Error::Startup { rendered } => {
            assert!(rendered.contains("refused to boot"), "got: {rendered}");
        }
        other => panic!("expected Startup, got: {other}"),
    }
}

#[tokio::test]
async fn test_capability_query_reaches_the_handler() {
    let mut session = mock_session("capability").build().unwrap();

    let records = session
        .run_step("capability", json!({"name": "records"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(records["supported"], true);
    assert_eq!(records["value"], "v1");

    let metrics = session
        .run_step("capability", json!({"name": "metrics"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metrics["supported"], false);
    assert_eq!(metrics["value"], serde_json::Value::Null);
}
