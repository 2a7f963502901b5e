// ABOUTME: Integration tests for maestro-bridge.
// ABOUTME: Drives supervisor, transports and manager end to end with /bin/sh stub agents.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use maestro_bridge::transport::{PipeTransport, StdioTransport, TcpTransport};
use maestro_bridge::{
    AgentConfig, BridgeConfig, BridgeManager, ExitOutcome, Supervisor, SupervisorSignal,
    SupervisorState, Timings, Transport, TransportError,
};
use maestro_protocol::{decode_command, Command, Event};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn timings() -> Timings {
    Timings {
        stop_grace_secs: 1,
        ..Timings::default()
    }
}

/// `/bin/sh -c <script> <arg0>`; the script sees `arg0` as `$0`.
fn sh_agent(script: &str, arg0: &Path) -> AgentConfig {
    AgentConfig {
        auto_restart: false,
        ..AgentConfig::command(
            "/bin/sh",
            &["-c", script, arg0.to_str().expect("utf-8 temp path")],
        )
    }
}

async fn next_signal(rx: &mut mpsc::UnboundedReceiver<SupervisorSignal>) -> SupervisorSignal {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for supervisor signal")
        .expect("supervisor sink closed")
}

async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(
    lines: &mut tokio::io::Lines<R>,
) -> Option<String> {
    tokio::time::timeout(WAIT, lines.next_line())
        .await
        .expect("timed out reading line")
        .expect("read failed")
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

// ============================================================================
// Supervisor Tests
// ============================================================================

#[tokio::test]
async fn test_restart_bound_stops_after_max_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let launches = dir.path().join("launches");
    let max_restarts = 3;
    let agent = AgentConfig {
        auto_restart: true,
        max_restarts,
        ..sh_agent(r#"echo launched >> "$0""#, &launches)
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(agent, timings(), tx);
    supervisor.start().await.unwrap();

    let mut outcomes = Vec::new();
    while outcomes.last() != Some(&ExitOutcome::Exhausted) {
        match next_signal(&mut rx).await {
            SupervisorSignal::ChildExited { generation } => {
                outcomes.push(supervisor.handle_child_exit(generation).await);
            }
            SupervisorSignal::Event(event) => panic!("unexpected event {event:?}"),
        }
    }

    assert_eq!(
        outcomes,
        vec![
            ExitOutcome::Restarted,
            ExitOutcome::Restarted,
            ExitOutcome::Restarted,
            ExitOutcome::Exhausted,
        ]
    );
    assert_eq!(supervisor.restart_count(), max_restarts);
    assert_eq!(supervisor.last_error(), "restart limit exceeded");
    assert_eq!(supervisor.state(), SupervisorState::Exhausted);

    match next_signal(&mut rx).await {
        SupervisorSignal::Event(Event::Error { message, id }) => {
            assert_eq!(id, 0);
            assert!(message.contains("restart limit exceeded"));
        }
        other => panic!("expected error event, got {other:?}"),
    }

    // one initial launch plus exactly max_restarts restarts
    let launched = std::fs::read_to_string(&launches).unwrap();
    assert_eq!(launched.lines().count(), max_restarts as usize + 1);
}

#[tokio::test]
async fn test_malformed_agent_line_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"printf '%s\n' 'not json' '{"type":"info","message":"ok","id":1}'; exec sleep 30"#;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(sh_agent(script, dir.path()), timings(), tx);
    supervisor.start().await.unwrap();

    assert_eq!(
        next_signal(&mut rx).await,
        SupervisorSignal::Event(Event::info("ok", 1))
    );
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra signal: {extra:?}");
    assert!(supervisor.is_running().await);
    assert_eq!(supervisor.restart_count(), 0);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_agent_env_and_working_dir_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"printf '{"type":"info","message":"%s %s","id":2}\n' "$MAESTRO_TEST_VALUE" "$(pwd)"; exec sleep 30"#;
    let mut agent = sh_agent(script, dir.path());
    agent
        .env
        .insert("MAESTRO_TEST_VALUE".to_string(), "marker".to_string());
    agent.working_dir = Some(dir.path().canonicalize().unwrap());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(agent, timings(), tx);
    supervisor.start().await.unwrap();

    let expected = format!("marker {}", dir.path().canonicalize().unwrap().display());
    assert_eq!(
        next_signal(&mut rx).await,
        SupervisorSignal::Event(Event::info(expected, 2))
    );
    supervisor.stop().await;
}

// ============================================================================
// Transport Tests
// ============================================================================

#[tokio::test]
async fn test_pipe_missing_fails_fast_with_remedy() {
    let dir = tempfile::tempdir().unwrap();
    let transport = PipeTransport::new(dir.path().join("bridge"), &timings());

    let started = std::time::Instant::now();
    let err = transport.start().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, TransportError::PathNotFound { .. }));
    assert!(err.to_string().contains("Create with: mkfifo"));
}

#[tokio::test]
async fn test_pipe_roundtrip() {
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use tokio::net::unix::pipe;

    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("bridge");
    let input = dir.path().join("bridge.in");
    let output = dir.path().join("bridge.out");
    mkfifo(&input, Mode::S_IRWXU).unwrap();
    mkfifo(&output, Mode::S_IRWXU).unwrap();

    let transport = PipeTransport::new(&base, &timings());
    transport.start().await.unwrap();

    let mut frontend_tx = pipe::OpenOptions::new().open_sender(&input).unwrap();
    frontend_tx
        .write_all(b"{\"type\":\"tool_approval\",\"tool_id\":\"t1\",\"approved\":true}\n")
        .await
        .unwrap();
    assert_eq!(
        transport.receive_command(Some(WAIT)).await,
        Some(Command::tool_approval("t1", true))
    );

    let frontend_rx = pipe::OpenOptions::new().open_receiver(&output).unwrap();
    transport.send_event(&Event::info("from bridge", 4)).await;
    let mut lines = BufReader::new(frontend_rx).lines();
    assert_eq!(
        read_line(&mut lines).await.as_deref(),
        Some(r#"{"type":"info","message":"from bridge","id":4}"#)
    );

    transport.stop().await;
}

#[tokio::test]
async fn test_tcp_new_client_replaces_old() {
    let transport = TcpTransport::new("127.0.0.1", 0, &timings());
    transport.start().await.unwrap();
    let addr = transport.local_addr().unwrap();

    let client_a = TcpStream::connect(addr).await.unwrap();
    wait_until(|| transport.has_client()).await;
    transport.send_event(&Event::info("for a", 1)).await;
    let mut lines_a = BufReader::new(client_a).lines();
    assert_eq!(
        read_line(&mut lines_a).await.as_deref(),
        Some(r#"{"type":"info","message":"for a","id":1}"#)
    );

    let client_b = TcpStream::connect(addr).await.unwrap();
    // A is closed before B is published
    assert_eq!(read_line(&mut lines_a).await, None);

    transport.send_event(&Event::info("for b", 2)).await;
    let mut lines_b = BufReader::new(client_b).lines();
    assert_eq!(
        read_line(&mut lines_b).await.as_deref(),
        Some(r#"{"type":"info","message":"for b","id":2}"#)
    );

    transport.stop().await;
}

#[tokio::test]
async fn test_batch_send_preserves_order() {
    let (_frontend, bridge_in) = tokio::io::duplex(64);
    let (bridge_out, frontend_in) = tokio::io::duplex(4096);
    let transport = StdioTransport::with_io(bridge_in, bridge_out, &timings());
    transport.start().await.unwrap();

    transport
        .send_events(&[Event::info("one", 1), Event::info("two", 2)])
        .await;
    let mut lines = BufReader::new(frontend_in).lines();
    assert!(read_line(&mut lines).await.unwrap().contains("\"one\""));
    assert!(read_line(&mut lines).await.unwrap().contains("\"two\""));

    transport.stop().await;
}

// ============================================================================
// Bridge Manager Tests
// ============================================================================

struct StdioHarness {
    manager: BridgeManager,
    frontend_out: tokio::io::DuplexStream,
    frontend_in: tokio::io::Lines<BufReader<tokio::io::DuplexStream>>,
}

async fn start_stdio_bridge(agent: AgentConfig) -> StdioHarness {
    let config = BridgeConfig {
        agent,
        timings: timings(),
        ..BridgeConfig::default()
    };
    let (frontend_out, bridge_in) = tokio::io::duplex(4096);
    let (bridge_out, frontend_in) = tokio::io::duplex(4096);
    let transport = Arc::new(StdioTransport::with_io(bridge_in, bridge_out, &config.timings));

    let manager = BridgeManager::new(config);
    manager.start_with_transport(transport).await.unwrap();
    StdioHarness {
        manager,
        frontend_out,
        frontend_in: BufReader::new(frontend_in).lines(),
    }
}

#[tokio::test]
async fn test_end_to_end_stdio_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"while IFS= read -r line; do
        case "$line" in
            *'"content":"hi"'*) printf '%s\n' '{"type":"conversation","role":"assistant","content":"hello","id":1}' ;;
        esac
    done"#;
    let mut harness = start_stdio_bridge(sh_agent(script, dir.path())).await;

    harness
        .frontend_out
        .write_all(b"{\"type\":\"user_input\",\"content\":\"hi\"}\n")
        .await
        .unwrap();

    assert_eq!(
        read_line(&mut harness.frontend_in).await.as_deref(),
        Some(r#"{"type":"conversation","role":"assistant","content":"hello","id":1}"#)
    );

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_commands_reach_agent_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let received = dir.path().join("received");
    let mut harness = start_stdio_bridge(sh_agent(r#"cat > "$0""#, &received)).await;

    harness
        .frontend_out
        .write_all(
            concat!(
                "{\"type\":\"user_input\",\"content\":\"c1\"}\n",
                "{\"type\":\"interrupt\"}\n",
                "{\"type\":\"model_switch\",\"model_id\":\"c3\"}\n",
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let path = received.clone();
    wait_until(move || {
        let path = path.clone();
        async move {
            std::fs::read_to_string(&path)
                .map(|s| s.lines().count() >= 3)
                .unwrap_or(false)
        }
    })
    .await;

    let commands: Vec<Command> = std::fs::read_to_string(&received)
        .unwrap()
        .lines()
        .map(|line| decode_command(line).unwrap())
        .collect();
    assert_eq!(
        commands,
        vec![
            Command::user_input("c1"),
            Command::Interrupt,
            Command::model_switch("c3"),
        ]
    );

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_interrupt_gets_through_event_flood() {
    let dir = tempfile::tempdir().unwrap();
    let received = dir.path().join("received");
    let script = r#"(while :; do printf '{"type":"status","state":"responding"}\n'; done) & cat > "$0""#;
    let StdioHarness {
        manager,
        mut frontend_out,
        mut frontend_in,
    } = start_stdio_bridge(sh_agent(script, &received)).await;

    // keep the frontend side drained so event writes never stall
    let drainer = tokio::spawn(async move {
        let mut seen = 0usize;
        while let Ok(Some(_)) = frontend_in.next_line().await {
            seen += 1;
        }
        seen
    });

    frontend_out
        .write_all(b"{\"type\":\"interrupt\"}\n")
        .await
        .unwrap();

    let path = received.clone();
    wait_until(move || {
        let path = path.clone();
        async move {
            std::fs::read_to_string(&path)
                .map(|s| s.contains(r#"{"type":"interrupt"}"#))
                .unwrap_or(false)
        }
    })
    .await;

    manager.stop().await;
    drop(frontend_out);
    let seen = tokio::time::timeout(WAIT, drainer).await.unwrap().unwrap();
    assert!(seen > 0, "agent flood never reached the frontend");
}

#[tokio::test]
async fn test_agent_exit_without_restart_reaches_frontend() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_stdio_bridge(sh_agent("exit 0", dir.path())).await;

    assert_eq!(
        read_line(&mut harness.frontend_in).await.as_deref(),
        Some(r#"{"type":"error","message":"agent process exited","id":0}"#)
    );
    let supervisor = harness.manager.supervisor().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(harness.manager.is_running());

    harness.manager.stop().await;
}

#[tokio::test]
async fn test_manager_restarts_agent_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let launches = dir.path().join("launches");
    let agent = AgentConfig {
        auto_restart: true,
        max_restarts: 1,
        ..sh_agent(r#"echo launched >> "$0""#, &launches)
    };
    let mut harness = start_stdio_bridge(agent).await;

    let line = read_line(&mut harness.frontend_in).await.unwrap();
    assert!(line.contains("restart limit exceeded"), "got {line}");

    let supervisor = harness.manager.supervisor().await.unwrap();
    assert_eq!(supervisor.restart_count(), 1);
    assert_eq!(supervisor.state(), SupervisorState::Exhausted);
    let launched = std::fs::read_to_string(&launches).unwrap();
    assert_eq!(launched.lines().count(), 2);

    harness.manager.stop().await;
}
