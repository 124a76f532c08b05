//! Broker-to-dispatcher pipeline without worker processes: router, payload
//! processor and dispatcher wired on one bus, driven through the in-memory
//! broker.

use std::sync::Arc;
use std::time::Duration;

use relayd_core::bus::{Bus, Event, Signal};
use relayd_core::dispatch::{Dispatcher, DispatcherConfig};
use relayd_core::model::WorkOutcome;
use relayd_core::payload::PayloadProcessor;
use relayd_core::router::{MemoryBroker, MessageRouter, RouterState, Topics};
use relayd_core::shutdown::ShutdownTrigger;
use relayd_core::token::TokenConfig;
use relayd_test_utils::{TEST_TIMEOUT, data_envelope, next_event};

struct Pipeline {
    bus: Bus,
    broker: MemoryBroker,
    router: MessageRouter,
    dispatcher: Dispatcher,
    trigger: ShutdownTrigger,
}

async fn pipeline() -> Pipeline {
    let bus = Bus::new();
    let broker = MemoryBroker::new();
    let router = MessageRouter::new(
        Arc::new(broker.clone()),
        bus.clone(),
        Topics::new("relayd", "host-1"),
        Duration::from_secs(1),
    );
    let dispatcher = Dispatcher::new(
        DispatcherConfig::default(),
        bus.clone(),
        TokenConfig::new(b"pipeline".to_vec()),
    );
    let processor = Arc::new(PayloadProcessor::new(bus.clone()));

    let recv = bus.connect(Signal::MessageRecv);
    let create = bus.connect(Signal::AssignmentCreate);
    let complete = bus.connect(Signal::WorkComplete);
    let ret = bus.connect(Signal::AssignmentReturn);

    let p = Arc::clone(&processor);
    tokio::spawn(async move { p.handle_message_recv_signal(recv).await });
    let d = dispatcher.clone();
    tokio::spawn(async move { d.handle_assignment_create_signal(create).await });
    let p = Arc::clone(&processor);
    tokio::spawn(async move { p.handle_work_complete_signal(complete).await });
    let r = router.clone();
    tokio::spawn(async move { r.handle_assignment_return_signal(ret).await });

    let trigger = ShutdownTrigger::new();
    router.connect_client().await.unwrap();
    router.subscribe(trigger.clone()).await.unwrap();
    assert_eq!(router.state(), RouterState::Subscribed);

    Pipeline {
        bus,
        broker,
        router,
        dispatcher,
        trigger,
    }
}

async fn poll(dispatcher: &Dispatcher, worker: &str) -> Arc<relayd_core::model::Assignment> {
    dispatcher
        .next_assignment(worker, Duration::from_secs(5))
        .await
        .expect("registered")
        .expect("assignment within timeout")
}

#[tokio::test]
async fn results_return_in_completion_order_with_correlation() {
    let p = pipeline().await;
    p.dispatcher.register("echo", None);
    let inbound = p.router.topics().inbound.clone();
    let outbound = p.router.topics().outbound.clone();

    let (first_id, first) = data_envelope("echo", serde_json::json!("a"));
    let (second_id, second) = data_envelope("echo", serde_json::json!("b"));
    p.broker.inject(&inbound, first);
    p.broker.inject(&inbound, second);

    let a = poll(&p.dispatcher, "echo").await;
    let b = poll(&p.dispatcher, "echo").await;
    assert_eq!(a.correlation_id, first_id);
    assert_eq!(b.correlation_id, second_id);

    // Finish the second one first.
    for assignment in [&b, &a] {
        p.dispatcher
            .submit_result(
                "echo",
                assignment.id,
                WorkOutcome::Succeeded {
                    result: assignment.payload.clone(),
                },
            )
            .await
            .unwrap();
    }

    let published = p
        .broker
        .wait_for_published(&outbound, 2, TEST_TIMEOUT)
        .await
        .expect("both results published");
    let response_to: Vec<String> = published
        .iter()
        .map(|m| {
            let json: serde_json::Value = serde_json::from_slice(&m.payload).unwrap();
            json["response_to"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(response_to, vec![second_id.to_string(), first_id.to_string()]);
    assert!(!p.trigger.is_triggered());
}

#[tokio::test]
async fn unsupported_envelopes_never_reach_the_dispatcher() {
    let p = pipeline().await;
    let mut created = p.bus.connect(Signal::AssignmentCreate);
    let inbound = p.router.topics().inbound.clone();

    p.broker.inject(&inbound, b"[1, 2, 3]".to_vec());
    p.broker.inject(
        &inbound,
        serde_json::json!({"type": "event", "message_id": uuid::Uuid::new_v4()})
            .to_string()
            .into_bytes(),
    );
    let (id, valid) = data_envelope("echo", serde_json::Value::Null);
    p.broker.inject(&inbound, valid);

    let Event::AssignmentCreate(assignment) = next_event(&mut created).await else {
        panic!("expected assignment-create");
    };
    assert_eq!(assignment.correlation_id, id);
    assert!(created.try_recv().is_none());
}

#[tokio::test]
async fn publish_after_disconnect_is_refused() {
    let p = pipeline().await;
    p.router.disconnect().await;
    assert_eq!(p.router.state(), RouterState::Disconnected);
    assert!(!p.trigger.is_triggered(), "deliberate disconnect is not a failure");

    let err = p.router.publish("relayd.host-1.data.out", b"{}".to_vec()).await;
    assert!(err.is_err());
}
