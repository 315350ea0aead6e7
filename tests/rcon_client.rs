use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use warden::backoff::BackoffPolicy;
use warden::error::RconError;
use warden::events::{EventBus, EventKind, EventPayload};
use warden::rcon::protocol::{read_frame, write_frame};
use warden::rcon::{
    ConnectionState, Credentials, Frame, FrameType, RconClient, RconSettings, MAX_FRAME_LEN,
};
use warden::ServiceState;

const PASSWORD: &str = "hunter2";

/// Binds a fake console on an ephemeral port.
async fn fake_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Accepts one client and answers its auth frame.
async fn accept_and_auth(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let auth = read_frame(&mut stream).await.unwrap();
    assert_eq!(auth.kind, FrameType::Auth);
    let ok = auth.payload == PASSWORD;
    write_frame(&mut stream, &Frame::auth_response(auth.seq.unwrap_or(0), ok))
        .await
        .unwrap();
    stream
}

/// Reads frames until a command arrives, answering nothing.
async fn next_command(stream: &mut TcpStream) -> Frame {
    loop {
        let frame = read_frame(stream).await.unwrap();
        if frame.kind == FrameType::Command {
            return frame;
        }
    }
}

/// Answers one command with `reply`.
async fn answer(stream: &mut TcpStream, reply: &str) -> Frame {
    let cmd = next_command(stream).await;
    let frame = Frame::request(FrameType::CommandResponse, cmd.seq.unwrap(), reply);
    write_frame(stream, &frame).await.unwrap();
    cmd
}

fn fast_reconnect(max_reconnects: u32) -> RconSettings {
    RconSettings {
        reconnect: BackoffPolicy {
            base: Duration::from_millis(20),
            max: Duration::from_millis(100),
            factor: 2.0,
        },
        max_reconnects,
        ..settings()
    }
}

fn settings() -> RconSettings {
    RconSettings {
        command_timeout: Duration::from_secs(5),
        max_reconnects: 1,
        ..RconSettings::default()
    }
}

#[tokio::test]
async fn rejected_password_is_auth_error() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let _stream = accept_and_auth(&listener).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = RconClient::new(settings(), EventBus::new());
    let err = client
        .connect(addr, Credentials::new("wrong"))
        .await
        .unwrap_err();
    assert_eq!(err, RconError::Auth);
    assert_ne!(client.connection_state(), ConnectionState::Authenticated);
    server.await.unwrap();
}

#[tokio::test]
async fn responses_correlate_by_sequence_id() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_and_auth(&listener).await;
        let first = next_command(&mut stream).await;
        let second = next_command(&mut stream).await;

        // a stray id first, then answers in reverse order
        write_frame(&mut stream, &Frame::request(FrameType::CommandResponse, 9999, "stray"))
            .await
            .unwrap();
        for cmd in [&second, &first] {
            let reply = Frame::request(
                FrameType::CommandResponse,
                cmd.seq.unwrap(),
                format!("reply to {}", cmd.payload),
            );
            write_frame(&mut stream, &reply).await.unwrap();
        }
        // keep the connection open until the client is done
        let _ = read_frame(&mut stream).await;
    });

    let client = RconClient::new(settings(), EventBus::new());
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Authenticated);

    let (players, bans) = tokio::join!(client.send_command("players"), async {
        // give the first command a head start so the server sees it first
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.send_command("bans").await
    });
    assert_eq!(players.unwrap(), "reply to players");
    assert_eq!(bans.unwrap(), "reply to bans");
    assert_eq!(client.pending_requests(), 0);

    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    server.await.unwrap();
}

#[tokio::test]
async fn async_frames_reach_the_bus() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_and_auth(&listener).await;
        write_frame(&mut stream, &Frame::async_message("Player \"Survivor\" connected"))
            .await
            .unwrap();
        let _ = read_frame(&mut stream).await;
    });

    let bus = EventBus::new();
    let mut events = bus.subscribe(warden::EventFilter::kinds([
        EventKind::RconConnected,
        EventKind::RconMessage,
    ]));
    let client = RconClient::new(settings(), bus);
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    let mut saw_connected = false;
    let message = loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match &ev.payload {
            EventPayload::RconConnected { endpoint } => {
                assert_eq!(endpoint, &addr);
                saw_connected = true;
            }
            EventPayload::RconMessage { message } => break message.clone(),
            other => panic!("unexpected {other:?}"),
        }
    };
    assert!(saw_connected);
    assert_eq!(message, "Player \"Survivor\" connected");

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn lost_connection_fails_pending_requests() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_and_auth(&listener).await;
        next_command(&mut stream).await;
        drop(stream);
    });

    let bus = EventBus::new();
    let mut disconnected = bus.subscribe(EventKind::RconDisconnected);
    let client = RconClient::new(
        RconSettings {
            command_timeout: Duration::from_secs(30),
            ..settings()
        },
        bus,
    );
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(5), client.send_command("players"))
        .await
        .expect("pending request must fail on disconnect, not wait for its timeout");
    assert!(matches!(res, Err(RconError::Connection(_))), "got {res:?}");

    let ev = tokio::time::timeout(Duration::from_secs(5), disconnected.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.kind(), EventKind::RconDisconnected);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn timed_out_command_leaves_no_pending_entry() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_and_auth(&listener).await;
        next_command(&mut stream).await;
        // never answer; wait for the client to hang up
        let _ = read_frame(&mut stream).await;
    });

    let client = RconClient::new(
        RconSettings {
            command_timeout: Duration::from_millis(200),
            ..settings()
        },
        EventBus::new(),
    );
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    let err = client.send_command("players").await.unwrap_err();
    assert!(matches!(err, RconError::Timeout(_)));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Authenticated);

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn missed_heartbeats_close_the_session() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_and_auth(&listener).await;
        // swallow heartbeats without answering
        while read_frame(&mut stream).await.is_ok() {}
    });

    let bus = EventBus::new();
    let mut disconnected = bus.subscribe(EventKind::RconDisconnected);
    let mut session = settings();
    session.session.heartbeat_interval = Duration::from_millis(100);
    session.session.heartbeat_timeout = Duration::from_millis(100);
    session.session.max_missed_heartbeats = 2;
    let client = RconClient::new(session, bus);
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    let ev = tokio::time::timeout(Duration::from_secs(5), disconnected.recv())
        .await
        .unwrap()
        .unwrap();
    match &ev.payload {
        EventPayload::RconDisconnected { reason, .. } => {
            assert!(reason.contains("heartbeat"), "reason: {reason}")
        }
        other => panic!("unexpected {other:?}"),
    }

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn stalled_server_cannot_hold_commands_past_their_timeout() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let _stream = accept_and_auth(&listener).await;
        // stop reading; socket buffers fill up and writes stall
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let bus = EventBus::new();
    let mut disconnected = bus.subscribe(EventKind::RconDisconnected);
    let client = RconClient::new(
        RconSettings {
            command_timeout: Duration::from_millis(300),
            ..settings()
        },
        bus,
    );
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    let oversized = "x".repeat(MAX_FRAME_LEN);
    let err = client.send_command(&oversized).await.unwrap_err();
    assert!(matches!(err, RconError::Protocol(_)), "got {err:?}");
    assert_eq!(client.pending_requests(), 0);

    let big = "x".repeat(MAX_FRAME_LEN - 64);
    let results = tokio::time::timeout(
        Duration::from_secs(3),
        futures::future::join_all((0..64).map(|_| client.send_command(&big))),
    )
    .await
    .expect("commands outlived their timeout");
    for res in &results {
        assert!(
            matches!(res, Err(RconError::Timeout(_)) | Err(RconError::Connection(_))),
            "got {res:?}"
        );
    }

    // a frame abandoned half-written ends the session
    let ev = tokio::time::timeout(Duration::from_secs(5), disconnected.recv())
        .await
        .unwrap()
        .unwrap();
    match &ev.payload {
        EventPayload::RconDisconnected { reason, .. } => {
            assert!(reason.contains("write failed"), "reason: {reason}")
        }
        other => panic!("unexpected {other:?}"),
    }

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn lost_session_is_reestablished() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let first = accept_and_auth(&listener).await;
        drop(first);
        let mut second = accept_and_auth(&listener).await;
        answer(&mut second, "pong").await;
        let _ = read_frame(&mut second).await;
    });

    let bus = EventBus::new();
    let mut connected = bus.subscribe(EventKind::RconConnected);
    let client = RconClient::new(fast_reconnect(3), bus);
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(5), connected.recv())
            .await
            .expect("no reconnect")
            .unwrap();
    }
    assert_eq!(client.connection_state(), ConnectionState::Authenticated);
    assert_eq!(client.send_command("ping").await.unwrap(), "pong");

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn exhausted_reconnect_budget_fails_the_client() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let stream = accept_and_auth(&listener).await;
        // refuse every later connection
        drop(listener);
        drop(stream);
    });

    let bus = EventBus::new();
    let mut changes = bus.subscribe(EventKind::ServiceStateChanged);
    let client = RconClient::new(fast_reconnect(2), bus);
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();
    server.await.unwrap();

    let ev = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("client never gave up")
        .unwrap();
    match &ev.payload {
        EventPayload::ServiceStateChanged {
            service,
            to,
            reason,
            ..
        } => {
            assert_eq!(service, "rcon");
            assert_eq!(*to, ServiceState::Failed);
            assert!(reason.as_deref().unwrap_or("").contains("2 failed"), "reason: {reason:?}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.connection_state(), ConnectionState::Failed);
    assert_eq!(client.send_command("players").await, Err(RconError::NotConnected));

    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Failed);
}

#[tokio::test]
async fn malformed_frames_close_the_session_at_the_limit() {
    // valid length, unknown frame type
    const BAD: [u8; 5] = [1, 0, 0, 0, 0x7f];

    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_and_auth(&listener).await;
        stream.write_all(&BAD).await.unwrap();
        stream.write_all(&BAD).await.unwrap();
        answer(&mut stream, "still here").await;
        stream.write_all(&BAD).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let bus = EventBus::new();
    let mut disconnected = bus.subscribe(EventKind::RconDisconnected);
    let mut session = fast_reconnect(1);
    session.session.max_protocol_errors = 3;
    let client = RconClient::new(session, bus);
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    assert_eq!(client.send_command("status").await.unwrap(), "still here");

    let ev = tokio::time::timeout(Duration::from_secs(5), disconnected.recv())
        .await
        .unwrap()
        .unwrap();
    match &ev.payload {
        EventPayload::RconDisconnected { reason, .. } => {
            assert!(reason.contains("3 malformed frames"), "reason: {reason}")
        }
        other => panic!("unexpected {other:?}"),
    }

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn shutdown_cancels_in_flight_command() {
    let (listener, addr) = fake_server().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_and_auth(&listener).await;
        next_command(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let shutdown = CancellationToken::new();
    let client = RconClient::new(
        RconSettings {
            command_timeout: Duration::from_secs(30),
            ..settings()
        },
        EventBus::new(),
    )
    .with_shutdown(shutdown.clone());
    client.connect(&addr, Credentials::new(PASSWORD)).await.unwrap();

    let (res, _) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(5), client.send_command("players")),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        }
    );
    assert_eq!(res.expect("command ignored shutdown"), Err(RconError::Cancelled));

    client.disconnect().await;
    server.abort();
}
