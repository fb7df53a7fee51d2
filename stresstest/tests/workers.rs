use std::sync::Arc;
use std::time::Duration;

use broker_test::server::TestBroker;
use bytes::Bytes;
use stresstest::metrics::{Metrics, Selector, Stat};
use stresstest::publisher::{PUBLISH_SUCCEEDED, Publisher};
use stresstest::remote::{Credentials, GrpcRemote};
use stresstest::subscriber::{Cursor, STREAM_WITHOUT_ERROR, Subscriber};
use stresstest::values::{Endpoint, FixedValues, Topic, ValueSource};
use stresstest::worker::{IterationContext, Worker};

fn values(node: &str, topic: &str) -> Arc<dyn ValueSource> {
    Arc::new(FixedValues::new(
        vec![node.parse().unwrap()],
        vec![Topic::from(topic)],
    ))
}

fn context(scenario: &str, metrics: &Arc<Metrics>) -> IterationContext {
    IterationContext {
        scenario: scenario.into(),
        iteration: 0,
        deadline: None,
        metrics: Arc::clone(metrics),
    }
}

fn aggregate(metrics: &Metrics, selector: &str, stat: Stat) -> Option<f64> {
    let selector: Selector = selector.parse().unwrap();
    metrics.aggregate(&selector).value(stat)
}

fn check(metrics: &Metrics, scenario: &str, name: &str) -> (u64, u64) {
    metrics
        .checks()
        .into_iter()
        .find(|check| check.scenario == scenario && check.name == name)
        .map(|check| (check.passes, check.fails))
        .unwrap_or_default()
}

#[tokio::test]
async fn subscriber_receives_published_messages_in_order() {
    broker_test::tracing::init();
    let broker = TestBroker::builder().end_streams_after(5).start().await;
    let remote = Arc::new(GrpcRemote::new());
    let metrics = Arc::new(Metrics::new());

    let subscriber = Subscriber::new(
        Arc::clone(&remote),
        values(&broker.node(), "Alerts"),
        Duration::from_secs(30),
    );
    let subscription = tokio::spawn({
        let ctx = context("subscriber", &metrics);
        async move { subscriber.iterate(&ctx).await }
    });
    broker.wait_for_subscribers(1).await;

    let publisher = Publisher::new(Arc::clone(&remote), values(&broker.node(), "Alerts"), 20);
    let ctx = context("publisher", &metrics);
    for _ in 0..5 {
        publisher.iterate(&ctx).await;
    }
    subscription.await.unwrap();

    assert_eq!(broker.published().len(), 5);
    assert_eq!(check(&metrics, "publisher", PUBLISH_SUCCEEDED), (5, 0));
    assert_eq!(
        aggregate(&metrics, "grpc_streams_msgs_received{topic:Alerts}", Stat::Count),
        Some(5.0)
    );
    assert_eq!(
        aggregate(&metrics, "grpc_streams{scenario:subscriber}", Stat::Count),
        Some(1.0)
    );
    assert_eq!(check(&metrics, "subscriber", "message has correct ordering"), (5, 0));
    assert_eq!(check(&metrics, "subscriber", "message has the right topic"), (5, 0));
    assert_eq!(check(&metrics, "subscriber", "message is not empty"), (5, 0));
    assert_eq!(check(&metrics, "subscriber", STREAM_WITHOUT_ERROR), (1, 0));
    assert_eq!(remote.open_connections(), 0);
}

#[tokio::test]
async fn concurrent_subscribers_verify_their_topics_independently() {
    broker_test::tracing::init();
    let broker = TestBroker::builder().end_streams_after(3).start().await;
    let remote = Arc::new(GrpcRemote::new());
    let metrics = Arc::new(Metrics::new());

    let subscriptions: Vec<_> = ["Alerts", "News"]
        .into_iter()
        .map(|topic| {
            let subscriber = Subscriber::new(
                Arc::clone(&remote),
                values(&broker.node(), topic),
                Duration::from_secs(30),
            );
            let ctx = context("subscriber", &metrics);
            tokio::spawn(async move { subscriber.iterate(&ctx).await })
        })
        .collect();
    broker.wait_for_subscribers(2).await;

    let alerts = Publisher::new(Arc::clone(&remote), values(&broker.node(), "Alerts"), 20);
    let news = Publisher::new(Arc::clone(&remote), values(&broker.node(), "News"), 20);
    let ctx = context("publisher", &metrics);
    for _ in 0..3 {
        alerts.iterate(&ctx).await;
        news.iterate(&ctx).await;
    }
    for subscription in subscriptions {
        subscription.await.unwrap();
    }

    for topic in ["Alerts", "News"] {
        let received = format!("grpc_streams_msgs_received{{topic:{topic}}}");
        assert_eq!(aggregate(&metrics, &received, Stat::Count), Some(3.0));

        for name in ["message has correct ordering", "message has the right topic"] {
            let checks = format!("checks{{topic:{topic},check:{name}}}");
            assert_eq!(aggregate(&metrics, &checks, Stat::Count), Some(3.0), "{checks}");
            assert_eq!(aggregate(&metrics, &checks, Stat::Rate), Some(1.0), "{checks}");
        }
    }
    assert_eq!(check(&metrics, "subscriber", STREAM_WITHOUT_ERROR), (2, 0));
    assert_eq!(remote.open_connections(), 0);
}

#[tokio::test]
async fn subscriber_from_beginning_sees_backlog() {
    broker_test::tracing::init();
    let broker = TestBroker::builder().end_streams_after(3).start().await;
    let remote = Arc::new(GrpcRemote::new());
    let metrics = Arc::new(Metrics::new());

    let publisher = Publisher::new(Arc::clone(&remote), values(&broker.node(), "Weather"), 8);
    let ctx = context("publisher", &metrics);
    for _ in 0..3 {
        publisher.iterate(&ctx).await;
    }

    let subscriber = Subscriber::new(
        Arc::clone(&remote),
        values(&broker.node(), "Weather"),
        Duration::from_secs(30),
    )
    .with_cursor(Cursor::Beginning);
    subscriber.iterate(&context("subscriber", &metrics)).await;

    assert_eq!(
        aggregate(&metrics, "grpc_streams_msgs_received", Stat::Count),
        Some(3.0)
    );
    assert_eq!(check(&metrics, "subscriber", "message has correct ordering"), (3, 0));
    assert_eq!(check(&metrics, "subscriber", STREAM_WITHOUT_ERROR), (1, 0));
}

#[tokio::test]
async fn publish_to_unreachable_node_fails_check() {
    broker_test::tracing::init();
    let remote = Arc::new(GrpcRemote::new().with_connect_timeout(Duration::from_millis(200)));
    let metrics = Arc::new(Metrics::new());

    let publisher = Publisher::new(Arc::clone(&remote), values("127.0.0.1:1", "Alerts"), 20);
    publisher.iterate(&context("publisher", &metrics)).await;

    assert_eq!(check(&metrics, "publisher", PUBLISH_SUCCEEDED), (0, 1));
    assert_eq!(remote.open_connections(), 0);
}

#[tokio::test]
async fn subscriber_to_unreachable_node_fails_check() {
    broker_test::tracing::init();
    let remote = Arc::new(GrpcRemote::new().with_connect_timeout(Duration::from_millis(200)));
    let metrics = Arc::new(Metrics::new());

    let subscriber = Subscriber::new(
        Arc::clone(&remote),
        values("127.0.0.1:1", "Alerts"),
        Duration::from_secs(1),
    );
    subscriber.iterate(&context("subscriber", &metrics)).await;

    assert_eq!(check(&metrics, "subscriber", STREAM_WITHOUT_ERROR), (0, 1));
    assert_eq!(remote.open_connections(), 0);
}

#[tokio::test]
async fn rejected_publish_fails_check() {
    broker_test::tracing::init();
    let broker = TestBroker::new().await;
    let remote = Arc::new(GrpcRemote::new());
    let metrics = Arc::new(Metrics::new());

    // the broker rejects publishes without a topic
    let publisher = Publisher::new(Arc::clone(&remote), values(&broker.node(), ""), 20);
    publisher.iterate(&context("publisher", &metrics)).await;

    assert_eq!(check(&metrics, "publisher", PUBLISH_SUCCEEDED), (0, 1));
    assert_eq!(
        aggregate(&metrics, "grpc_req_duration{scenario:publisher}", Stat::Count),
        Some(1.0)
    );
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn subscriber_deadline_is_not_an_error() {
    broker_test::tracing::init();
    let broker = TestBroker::new().await;
    let remote = Arc::new(GrpcRemote::new());
    let metrics = Arc::new(Metrics::new());

    let subscriber = Subscriber::new(
        Arc::clone(&remote),
        values(&broker.node(), "Alerts"),
        Duration::from_secs(1),
    );
    let start = tokio::time::Instant::now();
    subscriber.iterate(&context("subscriber", &metrics)).await;
    assert!(start.elapsed() >= Duration::from_secs(1));

    assert_eq!(check(&metrics, "subscriber", STREAM_WITHOUT_ERROR), (1, 0));
    assert_eq!(
        aggregate(&metrics, "grpc_stream_duration", Stat::Count),
        Some(1.0)
    );
    assert_eq!(
        aggregate(&metrics, "grpc_streams_msgs_received", Stat::Count),
        Some(0.0)
    );
    assert_eq!(remote.open_connections(), 0);

    // the broker observes the stream going away
    tokio::time::timeout(Duration::from_secs(5), broker.wait_for_subscribers(0))
        .await
        .unwrap();
}

#[tokio::test]
async fn scenario_deadline_caps_stream_budget() {
    broker_test::tracing::init();
    let broker = TestBroker::new().await;
    let remote = Arc::new(GrpcRemote::new());
    let metrics = Arc::new(Metrics::new());

    let subscriber = Subscriber::new(
        Arc::clone(&remote),
        values(&broker.node(), "Alerts"),
        Duration::from_secs(200),
    );
    let mut ctx = context("subscriber", &metrics);
    ctx.deadline = Some(tokio::time::Instant::now() + Duration::from_millis(500));

    tokio::time::timeout(Duration::from_secs(10), subscriber.iterate(&ctx))
        .await
        .unwrap();

    assert_eq!(check(&metrics, "subscriber", STREAM_WITHOUT_ERROR), (1, 0));
}

#[tokio::test]
async fn basic_auth() {
    broker_test::tracing::init();
    let broker = TestBroker::builder()
        .credentials("admin", "password")
        .start()
        .await;
    let metrics = Arc::new(Metrics::new());

    let authorized = GrpcRemote::new()
        .with_credentials(&Credentials {
            username: "admin".into(),
            password: "password".into(),
        })
        .unwrap();
    let publisher = Publisher::new(Arc::new(authorized), values(&broker.node(), "Alerts"), 20);
    publisher.iterate(&context("authorized", &metrics)).await;

    let wrong = GrpcRemote::new()
        .with_credentials(&Credentials {
            username: "admin".into(),
            password: "hunter2".into(),
        })
        .unwrap();
    let publisher = Publisher::new(Arc::new(wrong), values(&broker.node(), "Alerts"), 20);
    publisher.iterate(&context("wrong", &metrics)).await;

    let anonymous = GrpcRemote::new();
    let anonymous = Publisher::new(Arc::new(anonymous), values(&broker.node(), "Alerts"), 20);
    anonymous.iterate(&context("anonymous", &metrics)).await;

    assert_eq!(check(&metrics, "authorized", PUBLISH_SUCCEEDED), (1, 0));
    assert_eq!(check(&metrics, "wrong", PUBLISH_SUCCEEDED), (0, 1));
    assert_eq!(check(&metrics, "anonymous", PUBLISH_SUCCEEDED), (0, 1));
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn fixed_bodies_reach_subscribers() {
    broker_test::tracing::init();
    let broker = TestBroker::builder().end_streams_after(2).start().await;
    let remote = Arc::new(GrpcRemote::new());
    let metrics = Arc::new(Metrics::new());
    let node: Endpoint = broker.node().parse().unwrap();

    let subscriber = Subscriber::new(
        Arc::clone(&remote),
        Arc::new(FixedValues::new(vec![node.clone()], vec![Topic::from("Alerts")])),
        Duration::from_secs(30),
    );
    let subscription = tokio::spawn({
        let ctx = context("subscriber", &metrics);
        async move { subscriber.iterate(&ctx).await }
    });
    broker.wait_for_subscribers(1).await;

    let values = FixedValues::new(vec![node], vec![Topic::from("Alerts")])
        .with_bodies(vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
    let publisher = Publisher::new(Arc::clone(&remote), Arc::new(values), 20);
    let ctx = context("publisher", &metrics);
    publisher.iterate(&ctx).await;
    publisher.iterate(&ctx).await;
    subscription.await.unwrap();

    let bodies: Vec<_> = broker.published().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, [Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
    assert_eq!(check(&metrics, "subscriber", "message is not empty"), (2, 0));
}
