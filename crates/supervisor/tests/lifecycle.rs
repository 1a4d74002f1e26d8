use starlight_supervisor::{Runtime, SentinelManifest, Supervisor, SupervisorError};

#[tokio::test]
async fn spawn_failure_is_reported_not_fatal() {
    let mut supervisor = Supervisor::new("ws://127.0.0.1:1");
    let report = supervisor.launch_all(&[
        SentinelManifest::new("ghost", Runtime::Binary, "/nonexistent/starlight-ghost"),
        SentinelManifest {
            enabled: false,
            ..SentinelManifest::new("dormant", Runtime::Binary, "/bin/true")
        },
    ]);

    assert!(report.started.is_empty());
    assert_eq!(report.skipped, vec!["dormant".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "ghost");
    assert!(supervisor.running().is_empty());
    supervisor.kill_all().await;
}

#[tokio::test]
async fn unknown_names_are_rejected() {
    let mut supervisor = Supervisor::new("ws://127.0.0.1:1");
    assert!(matches!(
        supervisor.start_by_name("nobody"),
        Err(SupervisorError::UnknownSentinel(_))
    ));
    assert!(matches!(
        supervisor.stop_by_name("nobody").await,
        Err(SupervisorError::NotRunning(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn start_then_stop_a_shell_sentinel() {
    let mut supervisor = Supervisor::new("ws://127.0.0.1:1");
    supervisor.register(
        SentinelManifest::new("sleeper", Runtime::Binary, "/bin/sh")
            .with_args(["-c", "echo \"watching $HUB_URL\"; sleep 30"]),
    );

    let pid = supervisor.start_by_name("sleeper").unwrap();
    assert!(pid.is_some());
    assert!(supervisor.is_running("sleeper"));
    assert!(matches!(
        supervisor.start_by_name("sleeper"),
        Err(SupervisorError::AlreadyRunning(_))
    ));

    supervisor.stop_by_name("sleeper").await.unwrap();
    assert!(!supervisor.is_running("sleeper"));
}

#[cfg(unix)]
#[tokio::test]
async fn kill_all_clears_every_child() {
    let mut supervisor = Supervisor::new("ws://127.0.0.1:1");
    let manifests: Vec<SentinelManifest> = ["a", "b"]
        .iter()
        .map(|name| {
            SentinelManifest::new(*name, Runtime::Binary, "/bin/sh").with_args(["-c", "sleep 30"])
        })
        .collect();
    let report = supervisor.launch_all(&manifests);
    assert_eq!(report.started.len(), 2);

    supervisor.kill_all().await;
    assert!(supervisor.running().is_empty());
}
