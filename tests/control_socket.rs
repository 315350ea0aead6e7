#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use warden::daemon::{ControlClient, ControlServer, Request, Response, WireState};
use warden::{Orchestrator, WardenConfig};

fn config(dir: &std::path::Path) -> WardenConfig {
    let mut config = WardenConfig::default();
    config.server.executable = PathBuf::from("sleep");
    config.server.args = vec!["30".to_string()];
    config.server.working_dir = Some(dir.to_path_buf());
    config.rcon.enabled = false;
    config.orchestrator.stop_timeout_secs = 2;
    config
}

async fn wait_until_listening(client: &ControlClient) {
    for _ in 0..100 {
        if client.is_running().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("control server never came up");
}

#[tokio::test]
async fn serves_the_orchestrator_api() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("warden.sock");
    let orch = Arc::new(Orchestrator::from_config(&config(dir.path())).unwrap());
    let server = ControlServer::new(Arc::clone(&orch), &socket);
    let task = tokio::spawn(server.run());

    let client = ControlClient::new(&socket).with_timeout(Duration::from_secs(10));
    wait_until_listening(&client).await;

    let (_, version) = client.ping().await.unwrap();
    assert_eq!(version, env!("CARGO_PKG_VERSION"));

    assert_eq!(client.request(&Request::StartAll).await.unwrap(), Response::Ok);

    match client.request(&Request::ListServices).await.unwrap() {
        Response::Services { list } => {
            let names: Vec<&str> = list.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["process", "logs"]);
            assert_eq!(list[0].state, WireState::Running);
            assert!(list[0].pid.is_some());
            assert_eq!(list[1].depends_on, vec!["process"]);
            assert!(list[1].pid.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }

    let state = client
        .request(&Request::ServiceState {
            name: "logs".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(
        state,
        Response::State {
            name: "logs".to_string(),
            state: WireState::Running
        }
    );

    match client
        .request(&Request::Rcon {
            command: "players".to_string(),
        })
        .await
        .unwrap()
    {
        Response::Error { kind, .. } => assert_eq!(kind, "rcon_not_connected"),
        other => panic!("unexpected {other:?}"),
    }

    match client
        .request(&Request::Logs {
            source: "nope".to_string(),
            lines: 10,
        })
        .await
        .unwrap()
    {
        Response::Error { kind, .. } => assert_eq!(kind, "unknown_log_source"),
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(client.request(&Request::StopAll).await.unwrap(), Response::Ok);
    assert_eq!(client.request(&Request::Shutdown).await.unwrap(), Response::Ok);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!socket.exists());

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn client_reports_missing_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let client = ControlClient::new(dir.path().join("absent.sock"));
    assert!(!client.is_running().await);
    assert!(client.request(&Request::Ping).await.is_err());
}
