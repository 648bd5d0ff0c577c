#![allow(clippy::unwrap_used, clippy::expect_used)]

use gantry_core::*;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let timeout = GantryError::Timeout("tools/list on 'files' after 15s".to_string());
    assert_eq!(timeout.to_string(), "Timeout: tools/list on 'files' after 15s");

    let crashed = GantryError::Crashed("'files' exited with code 1".to_string());
    assert!(crashed.to_string().starts_with("Server crashed:"));

    let unavailable = GantryError::Unavailable("no server named 'web'".to_string());
    assert_eq!(
        unavailable.to_string(),
        "Server unavailable: no server named 'web'"
    );

    let http = GantryError::Http("503 after 3 attempts".to_string());
    assert_eq!(http.to_string(), "HTTP error: 503 after 3 attempts");

    // serde_json::Error converts via #[from]
    let bad: Result<serde_json::Value, _> = serde_json::from_str("{nope");
    let err: GantryError = bad.unwrap_err().into();
    assert!(matches!(err, GantryError::Json(_)));

    // std::io::Error converts via #[from]
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
    let err: GantryError = io.into();
    assert!(matches!(err, GantryError::Io(_)));
    assert!(err.to_string().contains("pipe gone"));
}

// ---------------------------------------------------------------------------
// 2. ServerType serde and helpers
// ---------------------------------------------------------------------------

#[test]
fn server_type_serde_and_helpers() {
    assert_eq!(
        serde_json::to_string(&ServerType::Websocket).unwrap(),
        "\"websocket\""
    );
    assert_eq!(serde_json::to_string(&ServerType::Stdio).unwrap(), "\"stdio\"");

    let t: ServerType = serde_json::from_str("\"sse\"").unwrap();
    assert_eq!(t, ServerType::Sse);
    assert!(t.is_network());
    assert!(!ServerType::Stdio.is_network());

    assert_eq!(ServerType::Http.to_string(), "http");
}

// ---------------------------------------------------------------------------
// 3. ServerStatus state machine vocabulary
// ---------------------------------------------------------------------------

#[test]
fn server_status_serde_and_terminality() {
    assert_eq!(
        serde_json::to_string(&ServerStatus::Running).unwrap(),
        "\"RUNNING\""
    );

    let s: ServerStatus = serde_json::from_str("\"CRASHED\"").unwrap();
    assert_eq!(s, ServerStatus::Crashed);

    assert!(ServerStatus::Failed.is_terminal());
    assert!(ServerStatus::Crashed.is_terminal());
    assert!(ServerStatus::Stopped.is_terminal());
    assert!(!ServerStatus::Starting.is_terminal());
    assert!(!ServerStatus::Running.is_terminal());

    assert_eq!(ServerStatus::Failed.to_string(), "FAILED");
}
