use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde_json::json;

use serial_test::serial;

use tracing::level_filters::LevelFilter;

use twinlink::location::Location;
use twinlink::notification::{DataNotification, Notification};
use twinlink::parameters::ParametersValues;
use twinlink::path::ResourcePath;
use twinlink::permission::PermissionLevel;
use twinlink::resource::{GetLevel, ResourceDeclaration};
use twinlink::update::{BulkUpdate, DataUpdate};
use twinlink::value::{DataType, TimedValue};

use crate::authorizer::{AllowAll, Policy, Scope};
use crate::bus::SubscriptionOptions;
use crate::config::GatewayConfig;
use crate::criterion::Criterion;
use crate::error::{Error, ErrorKind, Result};
use crate::filter::FilterParser;
use crate::gateway::{Gateway, NotificationStream};
use crate::registry::CapabilityDescriptor;
use crate::twin::ProviderBuilder;

const TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn init_tracing() {
    // Another test may have already installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

pub(crate) fn at(seconds: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
}

pub(crate) fn path(topic: &str) -> ResourcePath {
    topic.parse().unwrap()
}

fn start() -> Gateway {
    init_tracing();
    Gateway::start(GatewayConfig::new()).unwrap()
}

async fn next_data(stream: &mut NotificationStream) -> DataNotification {
    loop {
        let notification = tokio::time::timeout(TIMEOUT, stream.recv())
            .await
            .unwrap()
            .unwrap();
        if let Notification::Data(data) = notification {
            return data;
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn spy(name: &str, calls: &Arc<AtomicUsize>) -> CapabilityDescriptor {
    let calls = Arc::clone(calls);
    CapabilityDescriptor::new(
        ProviderBuilder::new(name),
        "sensor",
        ResourceDeclaration::property("temperature", DataType::Float),
    )
    .getter(move || {
        let _ = calls.fetch_add(1, Ordering::SeqCst);
        Ok(TimedValue::new(20.0, SystemTime::now()))
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn end_to_end() {
    let gateway = start();
    let session = gateway.session(AllowAll);
    let mut stream = session.subscribe(["p1/*"]);

    gateway
        .push_update(DataUpdate::new("p1", "s1", "r1").value(4).timestamp(at(1)))
        .await
        .unwrap();
    gateway
        .push_update(DataUpdate::new("p1", "s1", "r1").value(5).timestamp(at(2)))
        .await
        .unwrap();

    let first = next_data(&mut stream).await;
    assert_eq!(first.target.topic(), "p1/s1/r1");
    assert_eq!((first.old_value, first.new_value), (None, Some(json!(4))));

    let second = next_data(&mut stream).await;
    assert_eq!(
        (second.old_value, second.new_value),
        (Some(json!(4)), Some(json!(5)))
    );

    settle().await;
    assert!(stream.try_recv().is_none());

    let value = session
        .get_value(path("p1/s1/r1"), GetLevel::Cached)
        .await
        .unwrap();
    assert_eq!(value, TimedValue::new(5, at(2)));

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn linearizability() {
    let gateway = start();

    // Every serial order of the three operations, starting from 1.
    let orders: [[fn(i64) -> i64; 3]; 6] = [
        [|x| x * 2, |x| x + 3, |x| x - 1],
        [|x| x * 2, |x| x - 1, |x| x + 3],
        [|x| x + 3, |x| x * 2, |x| x - 1],
        [|x| x + 3, |x| x - 1, |x| x * 2],
        [|x| x - 1, |x| x * 2, |x| x + 3],
        [|x| x - 1, |x| x + 3, |x| x * 2],
    ];
    let expected = orders
        .iter()
        .map(|order| order.iter().fold(1, |x, operation| operation(x)))
        .collect::<Vec<_>>();

    let operations: [fn(i64) -> i64; 3] = [|x| x * 2, |x| x + 3, |x| x - 1];

    for round in 0..20 {
        let target = path(&format!("p{round}/s1/r1"));
        gateway
            .push_update(DataUpdate::for_path(&target).value(1).timestamp(at(1)))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for operation in operations {
            let gateway = gateway.clone();
            let target = target.clone();
            tasks.push(tokio::spawn(async move {
                gateway
                    .submit(move |ctx| {
                        let current = ctx.get_value(&target, GetLevel::Cached)?;
                        let x = current.value().and_then(serde_json::Value::as_i64).unwrap_or(0);
                        let timestamp = current.timestamp().unwrap_or(SystemTime::UNIX_EPOCH)
                            + Duration::from_secs(1);
                        ctx.apply_update(
                            &DataUpdate::for_path(&target)
                                .value(operation(x))
                                .timestamp(timestamp),
                        )
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let value = gateway
            .session(AllowAll)
            .get_value(target, GetLevel::Cached)
            .await
            .unwrap();
        let value = value.value().and_then(serde_json::Value::as_i64).unwrap();
        assert!(expected.contains(&value), "{value} is not a serial outcome");
    }

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn idempotent_set() {
    let gateway = start();
    let session = gateway.session(AllowAll);
    gateway
        .submit(|ctx| {
            ctx.create_resource(
                "p1",
                "switch",
                ResourceDeclaration::property("state", DataType::Boolean).modifiable(),
                crate::resource::Binding::new(),
            )
        })
        .await
        .unwrap();

    let mut stream = session.subscribe(["p1/switch/state"]);
    for _ in 0..3 {
        session
            .set_value(path("p1/switch/state"), true, Some(at(10)))
            .await
            .unwrap();
    }

    let data = next_data(&mut stream).await;
    assert_eq!(data.new_value, Some(json!(true)));
    settle().await;
    assert!(stream.try_recv().is_none());

    // Read after write.
    let value = session
        .get_value(path("p1/switch/state"), GetLevel::Cached)
        .await
        .unwrap();
    assert_eq!(value, TimedValue::new(true, at(10)));

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn stale_updates_are_dropped() {
    let gateway = start();
    let session = gateway.session(AllowAll);
    let mut stream = session.subscribe(["*"]);

    gateway
        .push_update(
            BulkUpdate::new()
                .update(DataUpdate::new("p1", "s1", "r1").value(2).timestamp(at(20)))
                .update(DataUpdate::new("p1", "s1", "r1").value(1).timestamp(at(10))),
        )
        .await
        .unwrap();

    let data = next_data(&mut stream).await;
    assert_eq!(data.new_value, Some(json!(2)));
    settle().await;
    assert!(
        std::iter::from_fn(|| stream.try_recv())
            .all(|notification| notification.as_data().is_none())
    );

    let value = session
        .get_value(path("p1/s1/r1"), GetLevel::Cached)
        .await
        .unwrap();
    assert_eq!(value, TimedValue::new(2, at(20)));

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn topic_matching() {
    let gateway = start();
    let session = gateway.session(AllowAll);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _ = session.add_listener(["p1/*"], move |notification: &Notification| -> Result<()> {
        if let Some(data) = notification.as_data() {
            sink.lock().unwrap().push(data.target.topic());
        }
        Ok(())
    });

    gateway
        .push_update(
            BulkUpdate::new()
                .update(DataUpdate::new("p1", "s1", "r1").value(1))
                .update(DataUpdate::new("p1", "s2", "r2").value(2))
                .update(DataUpdate::new("p2", "s1", "r1").value(3)),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(*received.lock().unwrap(), ["p1/s1/r1", "p1/s2/r2"]);

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn failing_subscribers_are_isolated() {
    let gateway = start();
    let session = gateway.session(AllowAll);

    let _ = session.add_listener(["*"], |_: &Notification| -> Result<()> {
        Err(Error::new(ErrorKind::Handler, "unreachable consumer"))
    });
    let _ = session.add_listener(["*"], |_: &Notification| -> Result<()> {
        panic!("broken consumer")
    });
    let mut stream = session.subscribe(["*"]);

    for value in 0..3 {
        gateway
            .push_update(DataUpdate::new("p1", "s1", "r1").value(value).timestamp(at(value as u64)))
            .await
            .unwrap();
    }

    for value in 0..3 {
        assert_eq!(next_data(&mut stream).await.new_value, Some(json!(value)));
    }

    // The gateway keeps working.
    let value = session
        .get_value(path("p1/s1/r1"), GetLevel::Cached)
        .await
        .unwrap();
    assert_eq!(value.value(), Some(&json!(2)));

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn authorization_gate() {
    let gateway = start();
    gateway
        .push_update(
            DataUpdate::new("p1", "admin", "friendlyName")
                .value("Kitchen")
                .timestamp(at(1)),
        )
        .await
        .unwrap();

    let reader = gateway.cached_session(
        Policy::new()
            .allow(Scope::Provider, &[PermissionLevel::Describe], "*")
            .allow(Scope::Resource, &[PermissionLevel::Read], "*"),
    );

    let error = reader
        .set_value(path("p1/admin/friendlyName"), "Garage", Some(at(2)))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Forbidden);

    let value = reader
        .get_value(path("p1/admin/friendlyName"), GetLevel::Cached)
        .await
        .unwrap();
    assert_eq!(value, TimedValue::new("Kitchen", at(1)));

    // Readable resources are notified, lifecycle events need the describe
    // level on services and resources.
    let mut stream = reader.subscribe(["*"]);
    gateway
        .push_update(
            DataUpdate::new("p1", "admin", "friendlyName")
                .value("Garage")
                .timestamp(at(3)),
        )
        .await
        .unwrap();
    gateway
        .push_update(DataUpdate::new("p1", "s1", "r1").value(1))
        .await
        .unwrap();

    assert_eq!(next_data(&mut stream).await.new_value, Some(json!("Garage")));
    assert_eq!(next_data(&mut stream).await.target.topic(), "p1/s1/r1");

    let denied = gateway.session(crate::authorizer::DenyAll);
    assert_eq!(
        denied
            .get_value(path("p1/s1/r1"), GetLevel::Cached)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::Forbidden
    );

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn filter_short_circuit() {
    let gateway = start();
    let x_calls = Arc::new(AtomicUsize::new(0));
    let y_calls = Arc::new(AtomicUsize::new(0));

    let _ = gateway.registry().register(spy("X", &x_calls)).await.unwrap();
    let _ = gateway.registry().register(spy("Y", &y_calls)).await.unwrap();

    let session = gateway.session(AllowAll);
    let snapshots = session
        .filtered_snapshot(
            Criterion::new().provider(|provider| provider.name != "X"),
            GetLevel::Strong,
        )
        .await
        .unwrap();

    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name, "Y");
    assert_eq!(x_calls.load(Ordering::SeqCst), 0);
    assert_eq!(y_calls.load(Ordering::SeqCst), 1);

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn two_phase_filter() {
    // `name=value` selects the providers holding a resource with that name
    // and value.
    struct Equality;

    impl FilterParser for Equality {
        fn languages(&self) -> &[&str] {
            &["equality"]
        }

        fn parse(&self, _language: &str, query: &str) -> Result<Criterion> {
            let (name, value) = query
                .split_once('=')
                .ok_or_else(|| Error::new(ErrorKind::FilterParse, "missing `=`"))?;
            let value = value
                .parse::<i64>()
                .map_err(|e| Error::new(ErrorKind::FilterParse, e.to_string()))?;
            let name = name.to_owned();

            Ok(Criterion::new()
                .resources([name.clone()])
                .value(move |snapshot| {
                    Ok(snapshot.resources().any(|(_, resource)| {
                        resource.name == name
                            && resource
                                .value
                                .as_ref()
                                .and_then(TimedValue::value)
                                .and_then(serde_json::Value::as_i64)
                                == Some(value)
                    }))
                }))
        }
    }

    let gateway = start();
    let _ = gateway.filters().register(Equality, 0);

    gateway
        .push_update(
            BulkUpdate::new()
                .update(DataUpdate::new("p1", "sensor", "level").value(3))
                .update(DataUpdate::new("p2", "sensor", "level").value(7))
                .update(DataUpdate::new("p3", "sensor", "other").value(7)),
        )
        .await
        .unwrap();

    let criterion = gateway.parse_filter("equality", "level=7").unwrap();
    let snapshots = gateway
        .session(AllowAll)
        .filtered_snapshot(criterion, GetLevel::Cached)
        .await
        .unwrap();
    assert_eq!(
        snapshots.iter().map(|snapshot| snapshot.name.as_str()).collect::<Vec<_>>(),
        ["p2"]
    );

    assert_eq!(
        gateway.parse_filter("equality", "level").unwrap_err().kind(),
        ErrorKind::FilterParse
    );
    assert_eq!(
        gateway.parse_filter("sql", "SELECT 1").unwrap_err().kind(),
        ErrorKind::UnsupportedLanguage
    );

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn location_listener() {
    let gateway = start();
    let session = gateway.session(AllowAll);
    let turin = Location::new(45.0703, 7.6869);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _ = session.add_criterion_listener(
        Criterion::new()
            .near(turin, 5_000.)
            .resources(["temperature"]),
        move |notification: &Notification| -> Result<()> {
            sink.lock().unwrap().push(notification.target().provider.clone());
            Ok(())
        },
    );

    gateway
        .submit(move |ctx| {
            ctx.create_provider(&ProviderBuilder::new("near").location(turin))?;
            ctx.create_provider(
                &ProviderBuilder::new("far").location(Location::new(41.9028, 12.4964)),
            )
        })
        .await
        .unwrap();
    gateway
        .push_update(
            BulkUpdate::new()
                .update(DataUpdate::new("near", "sensor", "temperature").value(21.0))
                .update(DataUpdate::new("far", "sensor", "temperature").value(25.0))
                .update(DataUpdate::new("near", "sensor", "humidity").value(40)),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(*received.lock().unwrap(), ["near"]);

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn actions() {
    let gateway = start();
    let _ = gateway
        .registry()
        .register(
            CapabilityDescriptor::new(
                ProviderBuilder::new("lamp"),
                "light",
                ResourceDeclaration::action("blink", DataType::Integer)
                    .parameter("times", DataType::Integer),
            )
            .action(|arguments| Ok(json!(arguments.get_i64("times").unwrap_or(0)))),
        )
        .await
        .unwrap();

    let session = gateway.session(AllowAll);
    let blink = path("lamp/light/blink");

    let result = session
        .act(blink.clone(), ParametersValues::new().integer("times", 3))
        .await
        .unwrap();
    assert_eq!(result, json!(3));

    for arguments in [
        ParametersValues::new(),
        ParametersValues::new().string("times", "three"),
        ParametersValues::new().integer("times", 3).bool("fast", true),
    ] {
        assert_eq!(
            session.act(blink.clone(), arguments).await.unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
    }

    assert_eq!(
        session
            .act(path("lamp/admin/friendlyName"), ParametersValues::new())
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidValue
    );

    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn listener_removal_and_shutdown() {
    let gateway = start();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let id = gateway.add_listener(
        SubscriptionOptions::topics(["*"]),
        move |_: &Notification| -> Result<()> {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );

    gateway
        .push_update(DataUpdate::new("p1", "s1", "r1").value(1))
        .await
        .unwrap();
    settle().await;
    let seen = calls.load(Ordering::SeqCst);
    assert!(seen > 0);

    assert!(gateway.remove_listener(id));
    gateway
        .push_update(DataUpdate::new("p1", "s1", "r1").value(2))
        .await
        .unwrap();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), seen);

    gateway.shutdown().await;
    assert!(gateway.is_closed());
    assert_eq!(
        gateway
            .push_update(DataUpdate::new("p1", "s1", "r1").value(3))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::Closed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn dropped_stream_unsubscribes() {
    let gateway = start();
    let session = gateway.session(AllowAll);

    let stream = session.subscribe(["p1/*"]);
    assert_eq!(gateway.listener_count(), 1);
    drop(stream);
    assert_eq!(gateway.listener_count(), 0);

    gateway
        .push_update(DataUpdate::new("p1", "s1", "r1").value(4))
        .await
        .unwrap();
    settle().await;
    assert_eq!(gateway.listener_count(), 0);

    gateway.shutdown().await;
}

// A single runtime thread: a blocking listener must not hold it.
#[tokio::test]
#[serial]
async fn slow_listener_does_not_stall_others() {
    let gateway = start();
    let session = gateway.session(AllowAll);
    let slow = session.add_listener(["p1/*"], |_: &Notification| -> Result<()> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(())
    });
    let mut stream = session.subscribe(["p1/*"]);

    let begin = Instant::now();
    gateway
        .push_update(DataUpdate::new("p1", "s1", "r1").value(4).timestamp(at(1)))
        .await
        .unwrap();
    let data = next_data(&mut stream).await;
    assert_eq!(data.new_value, Some(json!(4)));

    let value = session
        .get_value(path("p1/s1/r1"), GetLevel::Cached)
        .await
        .unwrap();
    assert_eq!(value, TimedValue::new(4, at(1)));
    assert!(begin.elapsed() < Duration::from_millis(400));

    assert!(session.remove_listener(slow));
    gateway.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn shutdown_delivers_queued_notifications() {
    let gateway = start();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _ = gateway.add_listener(
        SubscriptionOptions::topics(["p1/*"]),
        move |notification: &Notification| -> Result<()> {
            std::thread::sleep(Duration::from_millis(20));
            if let Notification::Data(data) = notification {
                sink.lock().unwrap().push(data.new_value.clone());
            }
            Ok(())
        },
    );

    for value in 1..=10_u64 {
        gateway
            .push_update(
                DataUpdate::new("p1", "s1", "r1")
                    .value(value)
                    .timestamp(at(value)),
            )
            .await
            .unwrap();
    }
    gateway.shutdown().await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 10);
    assert_eq!(received.last(), Some(&Some(json!(10))));
}

#[test]
fn start_outside_runtime() {
    assert_eq!(
        Gateway::start(GatewayConfig::new()).unwrap_err().kind(),
        ErrorKind::Closed
    );
}
