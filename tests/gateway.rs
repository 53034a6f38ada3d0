//! Gateway façade tests: end-to-end scenarios without the HTTP layer.

use std::collections::BTreeMap;
use std::time::Duration;

use sandgate::config::{CommandTemplate, Interpreter};
use sandgate::mux::{SessionFeed, StreamEvent};
use sandgate::protocol::{Command, Payload, Reply};
use sandgate::runner::{KillReason, ProcessStatus};
use sandgate::{Gateway, GatewayConfig, GatewayError, StreamId};
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_stream::StreamExt;

const GRACE: Duration = Duration::from_millis(500);
const LIMIT: Duration = Duration::from_secs(20);

fn config(dir: &TempDir) -> GatewayConfig {
    let interpreters = BTreeMap::from([
        ("python".to_string(), Interpreter::new("python3", "py")),
        ("sh".to_string(), Interpreter::new("sh", "sh")),
    ]);
    GatewayConfig::new(dir.path())
        .with_grace_period(GRACE)
        .with_shell("/bin/sh", Vec::new(), false)
        .with_install_template("echo installing {package}".parse::<CommandTemplate>().unwrap())
        .with_requirements_template("echo installing -r {file}".parse::<CommandTemplate>().unwrap())
        .with_interpreters(interpreters)
}

fn gateway() -> (TempDir, Gateway) {
    let dir = TempDir::new().expect("tempdir");
    let gateway = Gateway::new(config(&dir)).expect("gateway");
    (dir, gateway)
}

fn has_python() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn drain(feed: &mut SessionFeed, stream: StreamId) -> (String, ProcessStatus) {
    let mut data = Vec::new();
    loop {
        let event = timeout(LIMIT, feed.next())
            .await
            .expect("no event in time")
            .expect("feed closed");
        match event {
            StreamEvent::Output { stream: s, data: chunk } if s == stream => {
                data.extend_from_slice(&chunk)
            }
            StreamEvent::Ended { stream: s, status } if s == stream => {
                return (String::from_utf8_lossy(&data).into_owned(), status)
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_scenario() {
    let (dir, gateway) = gateway();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();

    let err = gateway.list_files(session, "..").await.unwrap_err();
    assert!(matches!(err, GatewayError::PathEscape(_)));

    gateway
        .write_file(session, "notes.txt", b"hi".to_vec())
        .await
        .unwrap();
    assert_eq!(gateway.read_file(session, "notes.txt").await.unwrap(), b"hi");

    let err = gateway
        .install_package(session, "requests; rm -rf /")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidPackageName(_)));
    assert!(dir.path().join("notes.txt").exists());

    if has_python() {
        let stream = gateway
            .run_snippet(session, "print(1+1)", "python", None)
            .await
            .unwrap();
        let (output, status) = drain(&mut feed, stream).await;
        assert_eq!(output, "2\n");
        assert_eq!(status, ProcessStatus::Exited { code: 0 });
    } else {
        eprintln!("python3 not found, skipping snippet step");
    }

    let shell = gateway.open_shell(session, None).await.unwrap();
    let process = gateway.runner().list(Some(session)).await;
    assert_eq!(process.len(), 1);
    let shell_process = process[0].id;

    assert!(gateway.disconnect(session).await >= 1);
    let (_, status) = drain(&mut feed, shell).await;
    assert_eq!(
        status,
        ProcessStatus::Killed {
            reason: KillReason::Disconnected
        }
    );
    assert!(!gateway.runner().is_live(shell_process).await);
}

#[tokio::test]
async fn test_shell_is_killed_within_grace_period_on_disconnect() {
    let (_dir, gateway) = gateway();
    let (session, _feed) = gateway.connect(Some("alice")).await.unwrap();
    gateway.open_shell(session, None).await.unwrap();
    let process = gateway.runner().list(Some(session)).await[0].id;

    let started = std::time::Instant::now();
    gateway.disconnect(session).await;
    timeout(GRACE + Duration::from_secs(2), async {
        while gateway.runner().is_live(process).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("shell outlived the grace period");
    assert!(started.elapsed() < GRACE + Duration::from_secs(2));
}

#[tokio::test]
async fn test_identity_is_required() {
    let (_dir, gateway) = gateway();
    assert!(matches!(
        gateway.connect(None).await,
        Err(GatewayError::Unauthorized(_))
    ));
    assert!(matches!(
        gateway.connect(Some("   ")).await,
        Err(GatewayError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_unknown_session_touches_nothing() {
    let (dir, gateway) = gateway();
    let (session, _feed) = gateway.connect(Some("alice")).await.unwrap();
    gateway.disconnect(session).await;

    let err = gateway
        .write_file(session, "x.txt", b"x".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthorized(_)));
    assert!(!dir.path().join("x.txt").exists());

    let err = gateway.open_shell(session, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unauthorized(_)));
    assert_eq!(gateway.runner().list(None).await.len(), 0);

    let err = gateway
        .execute(session, Command::ListFiles { path: "..".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthorized(_)));
}

#[tokio::test]
async fn test_execute_file_commands() {
    let (_dir, gateway) = gateway();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();

    let reply = gateway
        .execute(
            session,
            Command::WriteFile {
                path: "src/main.py".into(),
                content: Payload::text("print('x')\n"),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply, Reply::Done {});

    let changed = timeout(LIMIT, feed.next()).await.unwrap().unwrap();
    assert_eq!(
        changed,
        StreamEvent::FileChanged {
            path: "src/main.py".into()
        }
    );

    let Reply::Listing { entries } = gateway
        .execute(session, Command::ListFiles { path: "".into() })
        .await
        .unwrap()
    else {
        panic!("expected a listing");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "src");

    let Reply::File { content } = gateway
        .execute(session, Command::ReadFile { path: "src/main.py".into() })
        .await
        .unwrap()
    else {
        panic!("expected file content");
    };
    assert_eq!(content, Payload::text("print('x')\n"));

    gateway
        .execute(
            session,
            Command::RenamePath {
                from: "src".into(),
                to: "lib".into(),
            },
        )
        .await
        .unwrap();
    gateway
        .execute(session, Command::CreateDirectory { path: "out".into() })
        .await
        .unwrap();
    gateway
        .execute(session, Command::DeleteFile { path: "lib".into() })
        .await
        .unwrap();
    let err = gateway
        .execute(session, Command::DeleteFile { path: "lib".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));

    let err = gateway
        .execute(session, Command::DeleteFile { path: "".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::RootProtected));
}

#[tokio::test]
async fn test_snippet_runs_from_snippet_dir() {
    let (dir, gateway) = gateway();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();

    let stream = gateway
        .run_snippet(session, "pwd; echo hello", "SH", None)
        .await
        .unwrap();
    let (output, status) = drain(&mut feed, stream).await;
    assert_eq!(status, ProcessStatus::Exited { code: 0 });
    assert!(output.ends_with("paste_runs\nhello\n"), "{output:?}");

    let saved: Vec<_> = std::fs::read_dir(dir.path().join("paste_runs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].starts_with("paste_") && saved[0].ends_with(".sh"));
}

#[tokio::test]
async fn test_snippet_validation() {
    let (_dir, gateway) = gateway();
    let (session, _feed) = gateway.connect(Some("alice")).await.unwrap();

    let err = gateway
        .run_snippet(session, "puts 1", "ruby", None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnsupportedLanguage(_)));

    let err = gateway
        .run_snippet(session, "  \n", "sh", None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_snippet_timeout_is_clamped_to_exec_timeout() {
    let dir = TempDir::new().unwrap();
    let gateway = Gateway::new(config(&dir).with_exec_timeout(Duration::from_secs(1))).unwrap();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();

    let stream = gateway
        .run_snippet(session, "sleep 30", "sh", Some(Duration::from_secs(300)))
        .await
        .unwrap();
    let (output, status) = drain(&mut feed, stream).await;
    assert_eq!(status, ProcessStatus::TimedOut);
    assert!(output.contains("[timed out after 1s]"));
}

fn on_path(program: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {program}"))
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_default_interpreters_run_under_default_limits() {
    let dir = TempDir::new().unwrap();
    let config = GatewayConfig::new(dir.path()).with_grace_period(GRACE);
    let gateway = Gateway::new(config).unwrap();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();

    let snippets = [
        ("python", "print(1+1)"),
        ("javascript", "console.log(1+1)"),
        ("sh", "echo $((1+1))"),
    ];
    for (language, code) in snippets {
        let program = gateway.config().interpreters[language].program.clone();
        if !on_path(&program) {
            continue;
        }
        let stream = gateway
            .run_snippet(session, code, language, None)
            .await
            .unwrap();
        let (output, status) = drain(&mut feed, stream).await;
        assert_eq!(output, "2\n", "{language}");
        assert_eq!(status, ProcessStatus::Exited { code: 0 }, "{language}");
    }
}

#[tokio::test]
async fn test_install_package_streams_installer_output() {
    let (_dir, gateway) = gateway();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();

    let stream = gateway
        .install_package(session, "requests==2.31.0")
        .await
        .unwrap();
    let (output, status) = drain(&mut feed, stream).await;
    assert_eq!(output, "installing requests==2.31.0\n");
    assert_eq!(status, ProcessStatus::Exited { code: 0 });
}

#[tokio::test]
async fn test_install_requirements() {
    let (_dir, gateway) = gateway();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();

    let err = gateway.install_requirements(session).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));

    gateway
        .write_file(session, "requirements.txt", b"requests\n".to_vec())
        .await
        .unwrap();
    let stream = gateway.install_requirements(session).await.unwrap();
    let (output, status) = drain(&mut feed, stream).await;
    assert_eq!(output, "installing -r requirements.txt\n");
    assert_eq!(status, ProcessStatus::Exited { code: 0 });
}

#[tokio::test]
async fn test_piped_shell_round_trip() {
    let (_dir, gateway) = gateway();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();
    let shell = gateway.open_shell(session, None).await.unwrap();

    gateway
        .send_input(session, shell, "echo $((6*7))\nexit 0\n".into())
        .await
        .unwrap();
    let (output, status) = drain(&mut feed, shell).await;
    assert_eq!(output, "42\n");
    assert_eq!(status, ProcessStatus::Exited { code: 0 });
}

#[tokio::test]
async fn test_sessions_are_scoped_to_identity() {
    let (_dir, gateway) = gateway();
    let (alice, _a) = gateway.connect(Some("alice")).await.unwrap();
    let (_bob, _b) = gateway.connect(Some("bob")).await.unwrap();

    assert_eq!(gateway.sessions("alice").await.len(), 1);
    assert!(matches!(
        gateway.end_session("bob", alice).await,
        Err(GatewayError::NotFound(_))
    ));
    gateway.end_session("alice", alice).await.unwrap();
    assert!(gateway.sessions("alice").await.is_empty());
    assert_eq!(gateway.sessions("bob").await.len(), 1);
}

#[tokio::test]
async fn test_shutdown_kills_all_processes() {
    let (_dir, gateway) = gateway();
    let (session, mut feed) = gateway.connect(Some("alice")).await.unwrap();
    let shell = gateway.open_shell(session, None).await.unwrap();

    timeout(LIMIT, gateway.shutdown()).await.unwrap();
    let (_, status) = drain(&mut feed, shell).await;
    assert_eq!(
        status,
        ProcessStatus::Killed {
            reason: KillReason::Shutdown
        }
    );
    assert!(gateway.runner().list(None).await.is_empty());
}
