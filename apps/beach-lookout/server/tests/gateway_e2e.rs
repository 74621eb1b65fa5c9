//! Drives a real listener over WebSocket with the debug client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beach_lookout_client::{ClientError, LookoutClient};
use beach_lookout_core::ServerEnvelope;
use beach_lookout_server::session::BUSY_NOTICE;
use beach_lookout_server::telemetry::detached_metrics_handle;
use beach_lookout_server::{
    router, AppState, CommandPolicy, ConcurrencyPolicy, ExecutionLimits, ExecutionSupervisor,
    HostTransports, SessionConfig, SessionRegistry, UnknownMessagePolicy,
};
use tokio::net::TcpListener;

const REPLY_LIMIT: Duration = Duration::from_secs(10);

struct Gateway {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl Gateway {
    async fn start(config: SessionConfig, extra_allowed: &[&str]) -> Self {
        let allowed = ["printf", "echo", "sleep", "ls"]
            .into_iter()
            .chain(extra_allowed.iter().copied());
        let policy = CommandPolicy::new(allowed, ["rm", "sudo", "&&"]);
        let supervisor = ExecutionSupervisor::new(
            Arc::new(policy),
            Arc::new(HostTransports::local_only("/bin/sh")),
            ExecutionLimits::default(),
        );
        let registry = SessionRegistry::new(config, supervisor);
        let state = AppState::new(registry, detached_metrics_handle().unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state), true);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    async fn connect(&self) -> LookoutClient {
        LookoutClient::connect(&format!("ws://{}/ws", self.addr))
            .await
            .unwrap()
    }

    async fn wait_for_sessions(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + REPLY_LIMIT;
        while self.state.registry.len() != count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} sessions, have {}",
                self.state.registry.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn expect_envelope(client: &mut LookoutClient) -> ServerEnvelope {
    tokio::time::timeout(REPLY_LIMIT, client.next_envelope())
        .await
        .expect("no envelope in time")
        .unwrap()
        .expect("connection closed")
}

/// True once the server has closed the socket; any pending output is skipped.
async fn closed_by_server(client: &mut LookoutClient) -> bool {
    loop {
        match tokio::time::timeout(REPLY_LIMIT, client.next_envelope()).await {
            Ok(Ok(Some(_))) => continue,
            Ok(Ok(None)) | Ok(Err(_)) => return true,
            Err(_) => return false,
        }
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn output_lines_arrive_in_order_before_finished() {
    let gateway = Gateway::start(SessionConfig::default(), &[]).await;
    let mut client = gateway.connect().await;

    client.send_command("printf 'alpha\\nbeta\\ngamma\\n'").await.unwrap();
    let transcript = client.collect_until_terminal(REPLY_LIMIT).await.unwrap();
    assert_eq!(transcript.output, vec!["alpha", "beta", "gamma"]);
    assert_eq!(
        transcript.terminal,
        ServerEnvelope::Finished("command finished successfully on localhost".into())
    );

    // The session accepts the next command as soon as the terminal arrives.
    client.send_command("echo again").await.unwrap();
    let transcript = client.collect_until_terminal(REPLY_LIMIT).await.unwrap();
    assert_eq!(transcript.output, vec!["again"]);
    assert!(transcript.succeeded());
}

#[test_timeout::tokio_timeout_test(30)]
async fn denied_command_reports_error_and_session_survives() {
    let gateway = Gateway::start(SessionConfig::default(), &[]).await;
    let mut client = gateway.connect().await;

    client.send_command("ls / && rm -rf /tmp/nothing").await.unwrap();
    let transcript = client.collect_until_terminal(REPLY_LIMIT).await.unwrap();
    assert!(transcript.output.is_empty());
    match transcript.terminal {
        ServerEnvelope::Error(message) => assert!(
            message.contains("blacklisted token"),
            "unexpected denial: {message}"
        ),
        other => panic!("expected an error, got {other:?}"),
    }

    client.send_command("cat /etc/hostname").await.unwrap();
    match client.collect_until_terminal(REPLY_LIMIT).await.unwrap().terminal {
        ServerEnvelope::Error(message) => assert!(message.contains("command not allowed: cat")),
        other => panic!("expected an error, got {other:?}"),
    }

    client.send_command("echo still-here").await.unwrap();
    let transcript = client.collect_until_terminal(REPLY_LIMIT).await.unwrap();
    assert_eq!(transcript.output, vec!["still-here"]);
}

#[test_timeout::tokio_timeout_test(30)]
async fn second_command_is_rejected_while_busy() {
    let gateway = Gateway::start(SessionConfig::default(), &[]).await;
    let mut client = gateway.connect().await;

    client.send_command("echo started; sleep 30").await.unwrap();
    assert_eq!(
        expect_envelope(&mut client).await,
        ServerEnvelope::Output("started".into())
    );
    client.send_command("echo late").await.unwrap();
    assert_eq!(
        expect_envelope(&mut client).await,
        ServerEnvelope::Error(BUSY_NOTICE.into())
    );
    assert!(gateway.state.registry.snapshot()[0].executing);

    client.close().await.unwrap();
    gateway.wait_for_sessions(0).await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn replace_policy_cancels_the_running_command() {
    let config = SessionConfig {
        concurrency: ConcurrencyPolicy::ReplaceRunning,
        ..SessionConfig::default()
    };
    let gateway = Gateway::start(config, &[]).await;
    let mut client = gateway.connect().await;

    client.send_command("echo first; sleep 30").await.unwrap();
    assert_eq!(
        expect_envelope(&mut client).await,
        ServerEnvelope::Output("first".into())
    );
    client.send_command("echo second").await.unwrap();

    match expect_envelope(&mut client).await {
        ServerEnvelope::Error(message) => {
            assert!(message.contains("cancelled"), "unexpected terminal: {message}")
        }
        other => panic!("expected the old command's terminal, got {other:?}"),
    }
    let transcript = client.collect_until_terminal(REPLY_LIMIT).await.unwrap();
    assert_eq!(transcript.output, vec!["second"]);
    assert!(transcript.succeeded());
}

#[test_timeout::tokio_timeout_test(30)]
async fn unknown_messages_warn_by_default() {
    let gateway = Gateway::start(SessionConfig::default(), &[]).await;
    let mut client = gateway.connect().await;

    client.send_text(r#"{"type":"hello"}"#).await.unwrap();
    assert_eq!(
        expect_envelope(&mut client).await,
        ServerEnvelope::Error("unsupported message type: hello".into())
    );
    client.send_text("not json").await.unwrap();
    match expect_envelope(&mut client).await {
        ServerEnvelope::Error(message) => assert!(message.starts_with("malformed message")),
        other => panic!("expected a notice, got {other:?}"),
    }

    client.send_command("echo ok").await.unwrap();
    assert!(client
        .collect_until_terminal(REPLY_LIMIT)
        .await
        .unwrap()
        .succeeded());
}

#[test_timeout::tokio_timeout_test(30)]
async fn unknown_messages_close_when_configured() {
    let config = SessionConfig {
        unknown_messages: UnknownMessagePolicy::Close,
        ..SessionConfig::default()
    };
    let gateway = Gateway::start(config, &[]).await;
    let mut client = gateway.connect().await;
    gateway.wait_for_sessions(1).await;

    client.send_text(r#"{"type":"hello"}"#).await.unwrap();
    assert!(closed_by_server(&mut client).await);
    gateway.wait_for_sessions(0).await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn oversized_frame_closes_the_session() {
    let gateway = Gateway::start(SessionConfig::default(), &[]).await;
    let mut client = gateway.connect().await;
    gateway.wait_for_sessions(1).await;

    let padding = "x".repeat(1024);
    let frame = format!(r#"{{"type":"command","command":"{padding}"}}"#);
    // The write may race the server's close.
    let _ = client.send_text(&frame).await;
    assert!(closed_by_server(&mut client).await);
    gateway.wait_for_sessions(0).await;
}

#[cfg(target_os = "linux")]
#[test_timeout::tokio_timeout_test(30)]
async fn disconnect_terminates_the_running_command() {
    let gateway = Gateway::start(SessionConfig::default(), &[]).await;
    let mut client = gateway.connect().await;

    client.send_command("echo $$; sleep 30").await.unwrap();
    let pid: u32 = match expect_envelope(&mut client).await {
        ServerEnvelope::Output(line) => line.trim().parse().unwrap(),
        other => panic!("expected the shell pid, got {other:?}"),
    };
    assert!(std::path::Path::new(&format!("/proc/{pid}")).exists());

    drop(client);
    gateway.wait_for_sessions(0).await;

    let gone = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(str::trim_start)
            .is_some_and(|rest| rest.starts_with(|c: char| c == 'Z' || c == 'X')),
    };
    assert!(gone, "command {pid} outlived its session");
}

#[test_timeout::tokio_timeout_test(60)]
async fn stalled_reader_is_disconnected() {
    let config = SessionConfig {
        queue_depth: 64,
        write_timeout: Duration::from_secs(1),
        ..SessionConfig::default()
    };
    let gateway = Gateway::start(config, &["yes"]).await;
    let mut client = gateway.connect().await;

    client.send_command("yes").await.unwrap();
    // Never read again; the kernel buffers fill and the server's write stalls.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(45);
    while gateway.state.registry.len() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "stalled session never closed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    drop(client);
}

fn short_keepalive() -> SessionConfig {
    SessionConfig {
        ping_interval: Duration::from_millis(300),
        read_deadline: Duration::from_millis(1500),
        ..SessionConfig::default()
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn unanswered_pings_close_the_session() {
    let gateway = Gateway::start(short_keepalive(), &[]).await;
    let mut client = gateway.connect().await;

    // The client only answers pings while it reads, and it never reads again.
    client.send_command("sleep 30").await.unwrap();
    gateway.wait_for_sessions(1).await;
    let started = tokio::time::Instant::now();
    gateway.wait_for_sessions(0).await;
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "session outlived its read deadline"
    );
    assert!(closed_by_server(&mut client).await);
}

#[test_timeout::tokio_timeout_test(30)]
async fn answered_pings_keep_the_session_open() {
    let gateway = Gateway::start(short_keepalive(), &[]).await;
    let mut client = gateway.connect().await;

    // Reading answers pings, so a command quieter than the deadline survives.
    client.send_command("sleep 3; echo awake").await.unwrap();
    let transcript = client.collect_until_terminal(REPLY_LIMIT).await.unwrap();
    assert_eq!(transcript.output, vec!["awake"]);
    assert!(transcript.succeeded());
    assert_eq!(gateway.state.registry.len(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn refused_gateway_surfaces_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    match LookoutClient::connect(&format!("ws://{addr}/ws")).await {
        Err(ClientError::Connect { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("nothing is listening"),
    }
}
