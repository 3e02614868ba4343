//! Coordinator flow tests over in-memory connections.
//!
//! Nodes and clients are duplex pipes speaking the framed protocol, so
//! these tests exercise the same dispatch paths as real TCP connections.

use std::sync::Arc;
use std::time::Duration;

use marathon_coordinator::{Coordinator, InMemoryNodeStore, InMemoryTaskStore, TaskStore};
use marathon_proto::{
    ClientId, Credentials, Message, NodeId, NodeStatus, TaskId, TaskSpec, TaskState, UsageMetrics,
    encode_frame,
};
use tokio::io::DuplexStream;

fn status(id: [u8; 16], total: u32, active: u32, cpu: f64, mem: f64) -> NodeStatus {
    NodeStatus {
        node_id: NodeId::from_bytes(id),
        hostname: format!("node-{}", id[0]),
        total_slots: total,
        active_vms: active,
        warm_vms: 1,
        cpu_usage: cpu,
        memory_usage: mem,
        disk_free_bytes: 1 << 30,
        healthy: true,
        draining: false,
        uptime_secs: 60,
        last_task_at: None,
    }
}

fn spec() -> TaskSpec {
    TaskSpec {
        task_id: TaskId::generate(),
        repo_url: "https://forge.test/o/r.git".into(),
        branch: "main".into(),
        prompt: "p".into(),
        credentials: Credentials {
            token: "t".into(),
            forge_host: "forge.test".into(),
        },
        create_artifact: false,
        artifact_title: None,
        artifact_body: None,
        completion_promise: Some("DONE".into()),
        max_iterations: 3,
        env: Vec::new(),
    }
}

fn hub_with_store() -> (Arc<Coordinator>, Arc<InMemoryTaskStore>) {
    let tasks = Arc::new(InMemoryTaskStore::default());
    let hub = Coordinator::new(
        Duration::from_secs(30),
        Arc::clone(&tasks) as Arc<dyn TaskStore>,
        Arc::new(InMemoryNodeStore::default()),
    );
    (hub, tasks)
}

/// Connects a fake peer; returns the peer end of the pipe.
fn connect(hub: &Arc<Coordinator>) -> DuplexStream {
    let (peer, server) = tokio::io::duplex(1 << 16);
    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        let _ = hub.handle_connection(server).await;
    });
    peer
}

#[tokio::test]
async fn scheduler_selects_higher_scoring_node() {
    let (hub, _tasks) = hub_with_store();

    // Node A: loaded. Node B: mostly idle. B scores higher.
    let mut node_a = connect(&hub);
    marathon_proto::send(
        &mut node_a,
        0,
        &Message::Heartbeat(status([1; 16], 10, 8, 0.5, 0.5)),
    )
    .await
    .unwrap();
    let mut node_b = connect(&hub);
    marathon_proto::send(
        &mut node_b,
        0,
        &Message::Heartbeat(status([2; 16], 10, 2, 0.2, 0.3)),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = connect(&hub);
    marathon_proto::send(
        &mut client,
        1,
        &Message::SubmitTask {
            client_id: ClientId::generate(),
            spec: spec(),
        },
    )
    .await
    .unwrap();
    let (correlation, accepted) = marathon_proto::recv(&mut client).await.unwrap();
    assert_eq!(correlation, 1);
    let task_id = match accepted {
        Message::TaskAccepted { task_id } => task_id,
        other => panic!("expected TASK_ACCEPTED, got {other:?}"),
    };

    hub.schedule_tick().await;

    // The assignment must land on node B.
    let (_, assigned) = marathon_proto::recv(&mut node_b).await.unwrap();
    match assigned {
        Message::AssignTask(assigned_spec) => assert_eq!(assigned_spec.task_id, task_id),
        other => panic!("expected ASSIGN_TASK, got {other:?}"),
    }
}

#[tokio::test]
async fn task_events_reach_the_client_in_order() {
    let (hub, _tasks) = hub_with_store();

    let mut node = connect(&hub);
    marathon_proto::send(
        &mut node,
        0,
        &Message::Heartbeat(status([3; 16], 4, 0, 0.1, 0.1)),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = connect(&hub);
    marathon_proto::send(
        &mut client,
        7,
        &Message::SubmitTask {
            client_id: ClientId::generate(),
            spec: spec(),
        },
    )
    .await
    .unwrap();
    let (_, accepted) = marathon_proto::recv(&mut client).await.unwrap();
    let task_id = match accepted {
        Message::TaskAccepted { task_id } => task_id,
        other => panic!("expected TASK_ACCEPTED, got {other:?}"),
    };
    hub.schedule_tick().await;
    let _ = marathon_proto::recv(&mut node).await.unwrap();

    // The node forwards progress, output, then completion.
    let inner_frames = [
        Message::Progress {
            iteration: 1,
            max_iterations: 3,
            status: "running".into(),
        },
        Message::Output {
            channel: marathon_proto::OutputChannel::Stdout,
            data: b"working".to_vec(),
        },
        Message::Complete {
            exit_code: 0,
            metrics: UsageMetrics {
                input_tokens: 12,
                output_tokens: 4,
                ..UsageMetrics::default()
            },
            iteration: 1,
            promise_found: true,
            artifact_url: None,
        },
    ];
    for inner in &inner_frames {
        marathon_proto::send(
            &mut node,
            0,
            &Message::TaskEvent {
                task_id,
                frame: encode_frame(0, inner),
            },
        )
        .await
        .unwrap();
    }

    // The client sees the same frames, in the same order.
    for expected in &inner_frames {
        let (_, event) = marathon_proto::recv(&mut client).await.unwrap();
        match event {
            Message::TaskEvent {
                task_id: event_task,
                frame,
            } => {
                assert_eq!(event_task, task_id);
                let (_, inner) = marathon_proto::decode_frame(&frame).unwrap();
                assert_eq!(inner.tag(), expected.tag());
            }
            other => panic!("expected TASK_EVENT, got {other:?}"),
        }
    }

    // Status now reports completion with the final usage.
    marathon_proto::send(&mut client, 9, &Message::TaskStatus { task_id })
        .await
        .unwrap();
    let (_, reply) = marathon_proto::recv(&mut client).await.unwrap();
    match reply {
        Message::TaskStatusReply { state, metrics, .. } => {
            assert_eq!(state, TaskState::Completed);
            assert_eq!(metrics.input_tokens, 12);
        }
        other => panic!("expected TASK_STATUS_REPLY, got {other:?}"),
    }
}

#[tokio::test]
async fn queued_cancel_is_terminal_without_downstream_traffic() {
    let (hub, tasks) = hub_with_store();

    // No nodes at all: the task stays queued.
    let mut client = connect(&hub);
    marathon_proto::send(
        &mut client,
        1,
        &Message::SubmitTask {
            client_id: ClientId::generate(),
            spec: spec(),
        },
    )
    .await
    .unwrap();
    let (_, accepted) = marathon_proto::recv(&mut client).await.unwrap();
    let task_id = match accepted {
        Message::TaskAccepted { task_id } => task_id,
        other => panic!("expected TASK_ACCEPTED, got {other:?}"),
    };

    marathon_proto::send(&mut client, 2, &Message::CancelTask { task_id })
        .await
        .unwrap();

    // The client is told, and the record is terminal.
    let (_, event) = marathon_proto::recv(&mut client).await.unwrap();
    match event {
        Message::TaskEvent { frame, .. } => {
            let (_, inner) = marathon_proto::decode_frame(&frame).unwrap();
            assert!(matches!(inner, Message::Error { code, .. } if code == "cancelled"));
        }
        other => panic!("expected TASK_EVENT, got {other:?}"),
    }
    assert_eq!(tasks.get(task_id).unwrap().state, TaskState::Cancelled);

    // A later tick must not resurrect it.
    hub.schedule_tick().await;
    assert_eq!(tasks.get(task_id).unwrap().state, TaskState::Cancelled);
}

#[tokio::test]
async fn pool_exhausted_returns_task_to_queue() {
    let (hub, tasks) = hub_with_store();

    let mut node = connect(&hub);
    marathon_proto::send(
        &mut node,
        0,
        &Message::Heartbeat(status([4; 16], 2, 0, 0.1, 0.1)),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task_id = hub.submit(ClientId::generate(), spec());
    hub.schedule_tick().await;
    let _ = marathon_proto::recv(&mut node).await.unwrap();
    assert_eq!(tasks.get(task_id).unwrap().state, TaskState::Starting);

    // The node had no warm VM after all.
    marathon_proto::send(
        &mut node,
        0,
        &Message::TaskEvent {
            task_id,
            frame: encode_frame(
                0,
                &Message::Error {
                    code: "pool_exhausted".into(),
                    message: "VM pool exhausted".into(),
                },
            ),
        },
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = tasks.get(task_id).unwrap();
    assert_eq!(task.state, TaskState::Queued);
    assert!(task.assigned_node.is_none());

    // The next tick assigns it again.
    hub.schedule_tick().await;
    let (_, reassigned) = marathon_proto::recv(&mut node).await.unwrap();
    assert!(matches!(reassigned, Message::AssignTask(_)));
}
