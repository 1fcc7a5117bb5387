//! End-to-end transport scenarios against the in-process engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use courier_bus::{
    headers, CourierError, Endpoint, LogicalMessage, MessageKind, QueueMessage, QueueTransport,
    TransportConfig, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS, SUBQUEUE_TIMEOUT,
};
use serial_test::serial;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll `predicate` until it holds or the deadline passes
async fn eventually(what: &str, deadline: Duration, predicate: impl Fn() -> bool) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn test_config(queue: &str) -> TransportConfig {
    let mut config = TransportConfig::new(format!("courier://localhost/{queue}"));
    config.scheduler_tick_ms = 100;
    config
}

fn counted<T>(log: &Arc<Mutex<Vec<T>>>) -> usize {
    log.lock().unwrap().len()
}

#[tokio::test(flavor = "multi_thread")]
async fn consumed_message_completes_without_subqueue_residue() {
    let transport = QueueTransport::new(test_config("scenario_one")).unwrap();
    let arrivals: Arc<Mutex<Vec<Vec<LogicalMessage>>>> = Arc::new(Mutex::new(Vec::new()));
    let completions: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let arrivals = Arc::clone(&arrivals);
        transport.events().on_message_arrived(move |info| {
            arrivals.lock().unwrap().push(info.all_messages.clone());
            Ok(true)
        });
    }
    {
        let completions = Arc::clone(&completions);
        transport
            .events()
            .on_message_processing_completed(move |_, error| {
                completions.lock().unwrap().push(error.map(|e| e.to_string()));
            });
    }

    transport.start().await.unwrap();
    let destination = transport.local_endpoint().clone();
    transport
        .send(&destination, vec![LogicalMessage::text("Hello")])
        .await
        .unwrap();

    eventually("the completion event", Duration::from_secs(5), || {
        counted(&completions) == 1
    })
    .await;

    assert_eq!(
        *arrivals.lock().unwrap(),
        vec![vec![LogicalMessage::text("Hello")]]
    );
    assert_eq!(*completions.lock().unwrap(), vec![None]);
    for sub in [SUBQUEUE_TIMEOUT, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS] {
        assert_eq!(transport.queue_len(Some(sub)).unwrap(), 0);
    }
    assert_eq!(transport.statistics().processed, 1);

    transport.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_subscriber_exhausts_retries_into_the_errors_subqueue() {
    let config = test_config("scenario_two").with_number_of_retries(3);
    let transport = QueueTransport::new(config).unwrap();
    let failures = Arc::new(AtomicU32::new(0));
    let pre_commits = Arc::new(AtomicU32::new(0));

    transport
        .events()
        .on_message_arrived(|_| Err(CourierError::handler("boom")));
    {
        let failures = Arc::clone(&failures);
        transport
            .events()
            .on_message_processing_failure(move |_, _| {
                failures.fetch_add(1, Ordering::SeqCst);
            });
    }
    {
        let pre_commits = Arc::clone(&pre_commits);
        transport
            .events()
            .on_before_message_transaction_commit(move |_| {
                pre_commits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
    }

    transport.start().await.unwrap();
    let destination = transport.local_endpoint().clone();
    transport
        .send(&destination, vec![LogicalMessage::text("Hello")])
        .await
        .unwrap();

    eventually("the quarantine", Duration::from_secs(5), || {
        transport.queue_len(Some(SUBQUEUE_ERRORS)).unwrap() == 1
    })
    .await;

    assert_eq!(failures.load(Ordering::SeqCst), 3);
    assert_eq!(pre_commits.load(Ordering::SeqCst), 0);
    assert_eq!(transport.queue_len(None).unwrap(), 0);

    // The quarantined copy carries the final retry count
    let errors_queue = transport
        .local_endpoint()
        .queue_name()
        .with_subqueue(SUBQUEUE_ERRORS)
        .unwrap();
    let quarantined = transport
        .engine()
        .peek(&errors_queue, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(quarantined.header(headers::RETRIES), Some("3"));
    assert_eq!(transport.statistics().poisoned, 1);

    transport.shutdown().await.unwrap();
}

// Timing-sensitive: scheduler jitter under a loaded test host
#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn deferred_message_waits_in_the_timeout_subqueue() {
    init_tracing();
    let transport = QueueTransport::new(test_config("scenario_three")).unwrap();
    let arrivals = Arc::new(AtomicU32::new(0));
    {
        let arrivals = Arc::clone(&arrivals);
        transport.events().on_message_arrived(move |_| {
            arrivals.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
    }

    transport.start().await.unwrap();
    let destination = transport.local_endpoint().clone();
    let due = Utc::now() + chrono::Duration::milliseconds(700);
    transport
        .send_at(&destination, due, vec![LogicalMessage::text("later")])
        .await
        .unwrap();

    eventually("the message to park", Duration::from_secs(2), || {
        transport.queue_len(Some(SUBQUEUE_TIMEOUT)).unwrap() == 1
    })
    .await;
    assert_eq!(arrivals.load(Ordering::SeqCst), 0);
    assert_eq!(transport.statistics().deferred, 1);

    eventually("the deferred arrival", Duration::from_secs(5), || {
        arrivals.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(Utc::now() >= due);
    assert_eq!(transport.queue_len(Some(SUBQUEUE_TIMEOUT)).unwrap(), 0);

    transport.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unconsumed_message_lands_in_discarded_with_a_clean_completion() {
    let transport = QueueTransport::new(test_config("scenario_four")).unwrap();
    let completions: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

    transport.events().on_message_arrived(|_| Ok(false));
    {
        let completions = Arc::clone(&completions);
        transport
            .events()
            .on_message_processing_completed(move |_, error| {
                completions.lock().unwrap().push(error.map(|e| e.to_string()));
            });
    }

    transport.start().await.unwrap();
    let destination = transport.local_endpoint().clone();
    transport
        .send(&destination, vec![LogicalMessage::text("unwanted")])
        .await
        .unwrap();

    eventually("the discard", Duration::from_secs(5), || {
        transport.queue_len(Some(SUBQUEUE_DISCARDED)).unwrap() == 1
    })
    .await;

    assert_eq!(*completions.lock().unwrap(), vec![None]);
    assert_eq!(transport.queue_len(None).unwrap(), 0);
    assert_eq!(transport.statistics().discarded, 1);

    transport.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_payload_is_retried_then_poisoned() {
    let config = test_config("scenario_five").with_number_of_retries(3);
    let transport = QueueTransport::new(config).unwrap();
    let faults = Arc::new(AtomicU32::new(0));
    {
        let faults = Arc::clone(&faults);
        transport
            .events()
            .on_message_serialization_error(move |_, _| {
                faults.fetch_add(1, Ordering::SeqCst);
            });
    }

    transport.start().await.unwrap();

    let mut corrupt_headers = HashMap::new();
    corrupt_headers.insert(headers::ID.to_string(), Uuid::new_v4().to_string());
    corrupt_headers.insert(
        headers::KIND.to_string(),
        MessageKind::Ordinary.as_str().to_string(),
    );
    transport
        .engine()
        .send_direct(
            &transport.local_endpoint().queue_name().as_main(),
            QueueMessage::new(corrupt_headers, b"!!definitely not json!!".to_vec()),
        )
        .unwrap();

    eventually("the quarantine", Duration::from_secs(5), || {
        transport.queue_len(Some(SUBQUEUE_ERRORS)).unwrap() == 1
    })
    .await;

    assert_eq!(faults.load(Ordering::SeqCst), 3);
    assert_eq!(transport.queue_len(None).unwrap(), 0);

    transport.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_producers_each_process_exactly_once() {
    let config = test_config("scenario_six").with_worker_count(2);
    let transport = Arc::new(QueueTransport::new(config).unwrap());
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = Arc::clone(&seen);
        transport.events().on_message_arrived(move |info| {
            let body = info
                .current_message
                .as_ref()
                .and_then(|m| m.body.as_str().map(String::from))
                .unwrap_or_default();
            seen.lock().unwrap().push(body);
            Ok(true)
        });
    }

    transport.start().await.unwrap();
    let destination = transport.local_endpoint().clone();

    let mut producers = Vec::new();
    for i in 0..3 {
        let transport = Arc::clone(&transport);
        let destination = destination.clone();
        producers.push(tokio::spawn(async move {
            transport
                .send(&destination, vec![LogicalMessage::text(format!("payload-{i}"))])
                .await
                .unwrap();
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    eventually("all three completions", Duration::from_secs(5), || {
        counted(&seen) == 3
    })
    .await;
    // Nothing is processed twice
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut bodies = seen.lock().unwrap().clone();
    bodies.sort();
    assert_eq!(bodies, vec!["payload-0", "payload-1", "payload-2"]);
    assert_eq!(transport.statistics().processed, 3);

    transport.shutdown().await.unwrap();
}

// Timing-sensitive: the close/backoff window must outlast the handler
#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn shutdown_lets_the_inflight_dispatch_finish() {
    init_tracing();
    let transport = QueueTransport::new(test_config("shutdown_drain")).unwrap();
    let started = Arc::new(AtomicBool::new(false));
    let completions = Arc::new(AtomicU32::new(0));

    {
        let started = Arc::clone(&started);
        transport.events().on_message_arrived(move |_| {
            started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            Ok(true)
        });
    }
    {
        let completions = Arc::clone(&completions);
        transport
            .events()
            .on_message_processing_completed(move |_, _| {
                completions.fetch_add(1, Ordering::SeqCst);
            });
    }

    transport.start().await.unwrap();
    let destination = transport.local_endpoint().clone();
    transport
        .send(&destination, vec![LogicalMessage::text("slow")])
        .await
        .unwrap();

    eventually("the dispatch to begin", Duration::from_secs(5), || {
        started.load(Ordering::SeqCst)
    })
    .await;
    transport.shutdown().await.unwrap();

    // The in-flight transaction resolved in full before the workers exited
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(transport.statistics().processed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reply_reaches_the_source_endpoint() {
    let engine = courier_bus::QueueEngine::in_memory();
    let serializer = courier_bus::MessageSerializer::json();

    let alice = Arc::new(
        QueueTransport::with_engine(test_config("alice"), engine.clone(), serializer.clone())
            .unwrap(),
    );
    let bob = Arc::new(
        QueueTransport::with_engine(test_config("bob"), engine, serializer).unwrap(),
    );

    let pongs: Arc<Mutex<Vec<LogicalMessage>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let pongs = Arc::clone(&pongs);
        alice.events().on_message_arrived(move |info| {
            if let Some(message) = &info.current_message {
                pongs.lock().unwrap().push(message.clone());
            }
            Ok(true)
        });
    }
    {
        let handler_bob = Arc::clone(&bob);
        bob.events().on_message_arrived(move |_| {
            handler_bob.reply(vec![LogicalMessage::text("pong")])?;
            Ok(true)
        });
    }

    alice.start().await.unwrap();
    bob.start().await.unwrap();

    let bob_endpoint: Endpoint = "courier://localhost/bob".parse().unwrap();
    alice
        .send(&bob_endpoint, vec![LogicalMessage::text("ping")])
        .await
        .unwrap();

    eventually("the pong", Duration::from_secs(5), || {
        !pongs.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(*pongs.lock().unwrap(), vec![LogicalMessage::text("pong")]);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_message_kind_is_consumed_silently() {
    let transport = QueueTransport::new(test_config("shutdown_kind")).unwrap();
    let arrivals = Arc::new(AtomicU32::new(0));
    {
        let arrivals = Arc::clone(&arrivals);
        transport.events().on_message_arrived(move |_| {
            arrivals.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
    }

    transport.start().await.unwrap();

    let mut shutdown_headers = HashMap::new();
    shutdown_headers.insert(headers::ID.to_string(), Uuid::new_v4().to_string());
    shutdown_headers.insert(
        headers::KIND.to_string(),
        MessageKind::Shutdown.as_str().to_string(),
    );
    transport
        .engine()
        .send_direct(
            &transport.local_endpoint().queue_name().as_main(),
            QueueMessage::new(shutdown_headers, b"[]".to_vec()),
        )
        .unwrap();

    eventually("the queue to drain", Duration::from_secs(5), || {
        transport.queue_len(None).unwrap() == 0
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(arrivals.load(Ordering::SeqCst), 0);
    for sub in [SUBQUEUE_TIMEOUT, SUBQUEUE_DISCARDED, SUBQUEUE_ERRORS] {
        assert_eq!(transport.queue_len(Some(sub)).unwrap(), 0);
    }

    transport.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn started_event_fires_once_on_start() {
    let transport = QueueTransport::new(test_config("started_event")).unwrap();
    let started = Arc::new(AtomicU32::new(0));
    {
        let started = Arc::clone(&started);
        transport.events().on_started(move || {
            started.fetch_add(1, Ordering::SeqCst);
        });
    }

    transport.start().await.unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 1);
    transport.shutdown().await.unwrap();
}
