use serde_json::json;
use starlight_protocol::{
    Envelope, GateError, HijackParams, Method, RegistrationParams, SecurityGate,
};

#[test]
fn rejected_frames_can_be_logged_without_leaking_pii() {
    let gate = SecurityGate::default();
    let frame = json!({
        "method": "starlight.intent",
        "params": {"cmd": "fill", "goal": "email", "value": "user@example.com"}
    });

    let err = gate.process_value(&frame).unwrap_err();
    assert!(matches!(err, GateError::Protocol(_)));

    let loggable = gate.redact(&frame).to_string();
    assert!(!loggable.contains("user@example.com"));
    assert!(loggable.contains("[REDACTED:EMAIL]"));
}

#[test]
fn sentinel_registration_round_trip() {
    let gate = SecurityGate::default();
    let outbound = Envelope::request(
        Method::Registration,
        "reg-1",
        json!({
            "layer": "JanitorSentinel",
            "priority": 5,
            "capabilities": ["detection", "healing"],
            "selectors": [".modal", "#cookie-banner"],
            "authToken": "s3cr3t"
        }),
    );

    let screened = gate.process(&outbound.to_text()).unwrap();
    assert_eq!(screened.method, Method::Registration);
    let params: RegistrationParams = screened.params().unwrap();
    assert_eq!(params.layer, "JanitorSentinel");
    assert_eq!(params.auth_token.as_deref(), Some("s3cr3t"));
    assert_eq!(screened.redacted_params()["authToken"], "[REDACTED:TOKEN]");
}

#[test]
fn bare_method_names_are_accepted() {
    let gate = SecurityGate::default();
    let screened = gate
        .process(r#"{"jsonrpc":"2.0","method":"hijack","params":{"reason":"popup"}}"#)
        .unwrap();
    let params: HijackParams = screened.params().unwrap();
    assert_eq!(params.reason, "popup");
    assert!(screened.id().is_none());
}
