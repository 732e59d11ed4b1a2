//! Engine integration tests
//!
//! Routes are built through `EngineContext` with the built-in components and
//! driven through `ProducerTemplate` or the queue broker. Set `RUST_LOG` to
//! see engine logs in test output.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sy_common::{
    headers, properties, EngineConfig, EngineError, ErrorKind, Exchange, Message, PoolConfig, RejectionPolicy, Result,
};
use sy_engine::component::QueueEndpoint;
use sy_engine::{
    expression, EngineContext, EnrichFailure, ErrorHandlerDefinition, RedeliveryPolicy, RouteBuilder, RouteState,
    StepBuilder, TransactionManager,
};
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context() -> Arc<EngineContext> {
    context_with_config(EngineConfig::default())
}

fn context_with_grace(grace: Duration) -> Arc<EngineContext> {
    context_with_config(EngineConfig {
        shutdown_grace_period: grace,
        ..Default::default()
    })
}

fn context_with_config(config: EngineConfig) -> Arc<EngineContext> {
    init_tracing();
    EngineContext::with_default_components(config)
}

mod registry_tests {
    use super::*;

    #[test]
    fn test_equivalent_uris_share_one_endpoint() {
        let ctx = context();
        let a = ctx
            .registry()
            .resolve("queue:orders?visibilityTimeout=5&maxMessagesPerPoll=2")
            .unwrap();
        let b = ctx
            .registry()
            .resolve("queue://orders?maxMessagesPerPoll=2&visibilityTimeout=5")
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // Different parameters give a different endpoint over the same queue
        let c = ctx.endpoint::<QueueEndpoint>("queue:orders?visibilityTimeout=9").unwrap();
        let a = ctx.endpoint::<QueueEndpoint>("queue:orders?visibilityTimeout=5&maxMessagesPerPoll=2").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(a.queue(), c.queue()));
    }

    #[test]
    fn test_unknown_parameters_reported_together() {
        let ctx = context();
        match ctx.registry().resolve("timer:t?period=10&foo=1&bar=2") {
            Err(EngineError::UnknownParameters { uri, keys }) => {
                assert_eq!(keys, vec!["bar".to_string(), "foo".to_string()]);
                assert!(uri.starts_with("timer://t"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected unknown parameters"),
        }
    }

    #[test]
    fn test_mandatory_parameters_fail_fast() {
        let ctx = context();
        assert!(ctx.registry().resolve("queue:").err().is_some_and(|e| e.is_configuration()));
        assert!(ctx
            .registry()
            .resolve("queue:q?extendMessageVisibility=true")
            .err()
            .is_some_and(|e| e.is_configuration()));
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_stage_skips_rest_of_route() {
        let ctx = context();
        ctx.add_route(
            RouteBuilder::from("direct:start")
                .to("mock:before")
                .process_fn(|_| Err(EngineError::processing("stage two failed")))
                .to("mock:after")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let exchange = ctx.producer_template().send("direct:start", Exchange::in_out("x")).await;
        assert!(matches!(exchange.failure(), Some(EngineError::Processing { .. })));
        assert_eq!(ctx.mock_endpoint("mock:before").unwrap().received_count(), 1);
        assert_eq!(ctx.mock_endpoint("mock:after").unwrap().received_count(), 0);

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_content_based_routing_and_request_reply() {
        let ctx = context();
        ctx.add_route(
            RouteBuilder::from("direct:echo")
                .set_body(expression(|ex| json!(format!("echo {}", ex.message().body_as_string()))))
                .choice(|c| {
                    c.when(sy_engine::body_equals("echo vip"), |s| s.to("mock:vip"))
                        .otherwise(|s| s.to("mock:regular"))
                })
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let template = ctx.producer_template();
        assert_eq!(template.request_body("direct:echo", "vip").await.unwrap(), json!("echo vip"));
        assert_eq!(template.request_body("direct:echo", "bob").await.unwrap(), json!("echo bob"));
        assert_eq!(ctx.mock_endpoint("mock:vip").unwrap().received_bodies(), vec![json!("echo vip")]);
        assert_eq!(ctx.mock_endpoint("mock:regular").unwrap().received_count(), 1);

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_parallel_multicast_with_failing_branch() {
        let ctx = context();
        ctx.add_route(
            RouteBuilder::from("direct:fanout")
                .multicast(|m| {
                    m.parallel()
                        .branch(|s| s.delay(Duration::from_millis(20)).to("mock:healthy"))
                        .branch(|s| s.process_fn(|_| Err(EngineError::processing("branch two failed"))))
                        .branch(|s| s.to("mock:also-healthy"))
                })
                .to("mock:after")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let exchange = ctx.producer_template().send("direct:fanout", Exchange::in_out("x")).await;
        match exchange.failure() {
            Some(EngineError::Processing { message }) => assert_eq!(message, "branch two failed"),
            other => panic!("unexpected failure: {:?}", other),
        }

        // Every branch ran, nothing after the multicast did
        assert_eq!(ctx.mock_endpoint("mock:healthy").unwrap().received_count(), 1);
        assert_eq!(ctx.mock_endpoint("mock:also-healthy").unwrap().received_count(), 1);
        assert_eq!(ctx.mock_endpoint("mock:after").unwrap().received_count(), 0);

        let err = assert_err!(ctx.producer_template().request_body("direct:fanout", "y").await);
        assert!(err.is_processing());

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_direct_without_consumer() {
        let ctx = context();
        ctx.start().await.unwrap();

        let exchange = ctx.producer_template().send("direct:nobody", Exchange::in_only("x")).await;
        assert!(matches!(exchange.failure(), Some(EngineError::NoConsumers { .. })));

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let ctx = context_with_grace(Duration::from_millis(100));
        ctx.add_route(RouteBuilder::from("direct:slow").delay(Duration::from_secs(5)).build())
            .await
            .unwrap();
        ctx.start().await.unwrap();

        let err = ctx
            .producer_template()
            .request_body_with_timeout("direct:slow", "x", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(ctx.in_flight_count(), 0);

        ctx.stop().await;
    }
}

mod redelivery_tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_redelivery_then_dead_letter() {
        let ctx = context();
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let recorder = attempts.clone();
        ctx.add_route(
            RouteBuilder::from("direct:in")
                .with_error_handler(
                    ErrorHandlerDefinition::dead_letter_channel("mock:dead")
                        .redelivery(RedeliveryPolicy::fixed(3, Duration::from_millis(100))),
                )
                .process_fn(move |_| {
                    recorder.lock().push(Instant::now());
                    Err(EngineError::processing("downstream unavailable"))
                })
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let exchange = ctx.producer_template().send("direct:in", Exchange::in_only("payload")).await;

        let attempts = attempts.lock().clone();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }

        assert!(!exchange.is_failed());
        assert_eq!(exchange.property(properties::FAILURE_HANDLED), Some(&json!(true)));

        let dead = ctx.mock_endpoint("mock:dead").unwrap();
        let received = dead.received_exchanges();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body(), &json!("payload"));
        assert_eq!(received[0].message().header(headers::REDELIVERY_COUNTER), Some(&json!(3)));
        assert!(received[0]
            .property(properties::EXCEPTION_CAUGHT)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains("downstream unavailable")));

        ctx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_capped_by_max_delay() {
        let ctx = context();
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let recorder = attempts.clone();
        ctx.add_route(
            RouteBuilder::from("direct:in")
                .with_error_handler(ErrorHandlerDefinition::default_handler().redelivery(
                    RedeliveryPolicy::exponential(4, Duration::from_millis(100), 3.0, Duration::from_millis(500)),
                ))
                .process_fn(move |_| {
                    recorder.lock().push(Instant::now());
                    Err(EngineError::processing("still down"))
                })
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let err = assert_err!(ctx.producer_template().request_body("direct:in", "x").await);
        assert!(err.is_processing());

        let attempts = attempts.lock().clone();
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<Duration> = attempts.windows(2).map(|pair| pair[1] - pair[0]).collect();
        // 100ms, 300ms, then 900ms and 2700ms both capped to 500ms
        let expected = [100, 300, 500, 500];
        for (gap, want) in gaps.iter().zip(expected) {
            let want = Duration::from_millis(want);
            assert!(*gap >= want && *gap < want + Duration::from_millis(50), "gaps = {:?}", gaps);
        }

        ctx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_rewinds_poll_enrich_and_properties() {
        let ctx = context();
        let source = "queue:resources?visibilityTimeout=30";
        let calls = Arc::new(AtomicU32::new(0));
        let seen: Arc<Mutex<Vec<(Option<serde_json::Value>, Option<serde_json::Value>)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let counter = calls.clone();
        let recorder = seen.clone();
        ctx.add_route(
            RouteBuilder::from("direct:in")
                .with_error_handler(
                    ErrorHandlerDefinition::default_handler()
                        .redelivery(RedeliveryPolicy::fixed(2, Duration::from_millis(10))),
                )
                .poll_enrich(source, Some(Duration::from_millis(100)), EnrichFailure::Propagate)
                .process_fn(move |ex| {
                    recorder.lock().push((
                        ex.property("attempt.marker").cloned(),
                        ex.message().header(headers::QUEUE_RECEIVE_COUNT).cloned(),
                    ));
                    ex.set_property("attempt.marker", true);
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(EngineError::processing("first attempt fails"))
                    } else {
                        Ok(())
                    }
                })
                .to("mock:enriched")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let queue = ctx.endpoint::<QueueEndpoint>(source).unwrap().queue().clone();
        queue.send(Message::new("resource"));

        let exchange = ctx.producer_template().send("direct:in", Exchange::in_only("request")).await;
        assert!(!exchange.is_failed(), "{:?}", exchange.failure());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The failed attempt released its message; the retry received it again
        // and started without the first attempt's property.
        let seen = seen.lock().clone();
        assert_eq!(seen[0], (None, Some(json!(1))));
        assert_eq!(seen[1], (None, Some(json!(2))));

        // The successful attempt's completion deleted the message
        assert!(queue.is_empty());
        assert_eq!(ctx.mock_endpoint("mock:enriched").unwrap().received_bodies(), vec![json!("resource")]);

        ctx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_default_handler_propagates_after_exhaustion() {
        let ctx = context();
        ctx.set_default_error_handler(
            ErrorHandlerDefinition::default_handler().redelivery(RedeliveryPolicy::fixed(2, Duration::from_millis(10))),
        );

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        ctx.add_route(
            RouteBuilder::from("direct:in")
                .process_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::processing("nope"))
                })
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let err = ctx.producer_template().request_body("direct:in", "x").await.unwrap_err();
        assert!(err.is_processing());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        ctx.stop().await;
    }
}

mod enrich_tests {
    use super::*;
    use proptest::prelude::*;
    use sy_engine::aggregation::ReplaceMessage;
    use sy_engine::processor::PollEnricher;
    use sy_engine::{Endpoint, Processor};

    #[tokio::test]
    async fn test_poll_enrich_merges_and_deletes_on_completion() {
        let ctx = context();
        ctx.add_route(
            RouteBuilder::from("direct:in")
                .poll_enrich("queue:resources", Some(Duration::from_millis(50)), EnrichFailure::Propagate)
                .to("mock:out")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let queue = ctx.endpoint::<QueueEndpoint>("queue:resources").unwrap().queue().clone();
        queue.send(Message::new("resource"));

        let exchange = ctx.producer_template().send("direct:in", Exchange::in_only("original")).await;
        assert!(!exchange.is_failed());
        assert_eq!(ctx.mock_endpoint("mock:out").unwrap().received_bodies(), vec![json!("resource")]);
        assert!(queue.is_empty());

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_poll_enrich_timeout_branches_through_routes() {
        let ctx = context();
        ctx.add_route(
            RouteBuilder::from("direct:lenient")
                .poll_enrich("queue:empty", Some(Duration::from_millis(20)), EnrichFailure::Ignore)
                .to("mock:lenient")
                .build(),
        )
        .await
        .unwrap();
        ctx.add_route(
            RouteBuilder::from("direct:strict")
                .poll_enrich("queue:empty", Some(Duration::from_millis(20)), EnrichFailure::Propagate)
                .to("mock:strict")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let template = ctx.producer_template();
        let lenient = template.send("direct:lenient", Exchange::in_only("keep me")).await;
        assert!(!lenient.is_failed());
        assert_eq!(ctx.mock_endpoint("mock:lenient").unwrap().received_bodies(), vec![json!("keep me")]);

        let strict = template.send("direct:strict", Exchange::in_only("x")).await;
        assert_eq!(strict.failure().map(|f| f.kind()), Some(ErrorKind::Timeout));
        assert_eq!(ctx.mock_endpoint("mock:strict").unwrap().received_count(), 0);

        ctx.stop().await;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_poll_enrich_with_nothing_to_poll(body in "[a-z]{0,16}", ignore in any::<bool>()) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let ctx = context();
            let endpoint = ctx.registry().resolve("queue:nothing").unwrap();
            let policy = if ignore { EnrichFailure::Ignore } else { EnrichFailure::Propagate };
            let enricher = PollEnricher::new(
                endpoint.uri(),
                endpoint.create_polling_consumer().unwrap(),
                Arc::new(ReplaceMessage),
                policy,
                Some(Duration::ZERO),
            );

            let mut exchange = Exchange::in_only(body.clone());
            runtime.block_on(enricher.process(&mut exchange)).unwrap();

            if ignore {
                prop_assert!(!exchange.is_failed());
                prop_assert_eq!(exchange.body(), &json!(body));
            } else {
                prop_assert_eq!(exchange.failure().map(|f| f.kind()), Some(ErrorKind::Timeout));
            }
        }
    }
}

mod shutdown_tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_in_flight_finishes_within_grace() {
        let ctx = context_with_grace(Duration::from_secs(2));
        ctx.add_route(
            RouteBuilder::from("direct:work")
                .route_id("work")
                .delay(Duration::from_millis(100))
                .to("mock:done")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let template = ctx.producer_template();
        let sender = tokio::spawn(async move { template.send("direct:work", Exchange::in_only("x")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.in_flight_count(), 1);
        ctx.stop_route("work").await.unwrap();
        assert_eq!(ctx.route_state("work"), Some(RouteState::Stopped));

        let exchange = sender.await.unwrap();
        assert!(!exchange.is_failed());
        assert_eq!(ctx.mock_endpoint("mock:done").unwrap().received_count(), 1);

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_context_stop_drains_chained_direct_routes() {
        let ctx = context_with_grace(Duration::from_secs(2));
        ctx.add_route(
            RouteBuilder::from("direct:front")
                .route_id("front")
                .delay(Duration::from_millis(200))
                .to("direct:back")
                .build(),
        )
        .await
        .unwrap();
        // Added last, so stopped first
        ctx.add_route(RouteBuilder::from("direct:back").route_id("back").to("mock:back").build())
            .await
            .unwrap();
        ctx.start().await.unwrap();
        let back = ctx.mock_endpoint("mock:back").unwrap();

        let template = ctx.producer_template();
        let in_flight = tokio::spawn(async move { template.send("direct:front", Exchange::in_only("x")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopping = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // New callers are turned away while the in-flight exchange drains
        let late = ctx.producer_template().send("direct:back", Exchange::in_only("late")).await;
        assert!(matches!(late.failure(), Some(EngineError::RejectedExecution { .. })));

        let exchange = assert_ok!(in_flight.await);
        assert!(!exchange.is_failed(), "{:?}", exchange.failure());
        assert_eq!(back.received_bodies(), vec![json!("x")]);

        assert_ok!(stopping.await);
        assert_eq!(ctx.route_state("front"), Some(RouteState::Stopped));
        assert_eq!(ctx.route_state("back"), Some(RouteState::Stopped));
    }

    #[tokio::test]
    async fn test_grace_expiry_interrupts_in_flight() {
        let ctx = context_with_grace(Duration::from_millis(200));
        ctx.add_route(
            RouteBuilder::from("direct:stuck")
                .route_id("stuck")
                .delay(Duration::from_secs(30))
                .to("mock:never")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let template = ctx.producer_template();
        let sender = tokio::spawn(async move { template.send("direct:stuck", Exchange::in_only("x")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        ctx.stop_route("stuck").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let exchange = sender.await.unwrap();
        assert!(matches!(exchange.failure(), Some(EngineError::ShutdownInterrupted { .. })));
        assert_eq!(ctx.mock_endpoint("mock:never").unwrap().received_count(), 0);

        // No consumer is bound any more
        let late = ctx.producer_template().send("direct:stuck", Exchange::in_only("late")).await;
        assert!(matches!(late.failure(), Some(EngineError::NoConsumers { .. })));

        ctx.stop().await;
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_route_does_not_block_another() {
        let ctx = context_with_grace(Duration::from_secs(2));
        ctx.add_route(
            RouteBuilder::from("queue:slow?pollDelay=20")
                .delay(Duration::from_millis(500))
                .to("mock:slow")
                .build(),
        )
        .await
        .unwrap();
        ctx.add_route(RouteBuilder::from("queue:fast?pollDelay=20").to("mock:fast").build())
            .await
            .unwrap();
        ctx.start().await.unwrap();

        let template = ctx.producer_template();
        template.send_body("queue:slow?pollDelay=20", "s").await.unwrap();
        template.send_body("queue:fast?pollDelay=20", "f").await.unwrap();

        let fast = ctx.mock_endpoint("mock:fast").unwrap();
        assert!(fast.wait_for_count(1, Duration::from_millis(300)).await);
        assert_eq!(ctx.mock_endpoint("mock:slow").unwrap().received_count(), 0);

        assert!(ctx.mock_endpoint("mock:slow").unwrap().wait_for_count(1, Duration::from_secs(2)).await);
        ctx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_route_fires_repeat_count_times() {
        let ctx = context();
        ctx.add_route(
            RouteBuilder::from("timer:tick?period=50&delay=0&repeatCount=3")
                .to("mock:ticks")
                .build(),
        )
        .await
        .unwrap();

        let ticks = ctx.mock_endpoint("mock:ticks").unwrap();
        ticks.expected_message_count(3);
        ctx.start().await.unwrap();

        ticks.assert_is_satisfied(Duration::from_secs(2)).await.unwrap();
        let counters: Vec<_> = ticks
            .received_exchanges()
            .iter()
            .map(|ex| ex.property(properties::TIMER_COUNTER).cloned())
            .collect();
        assert_eq!(counters, vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);

        ctx.stop().await;
    }
}

mod queue_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_visibility_extended_while_processing() {
        let ctx = context();
        let uri = "queue:jobs?visibilityTimeout=2&extendMessageVisibility=true";
        ctx.add_route(RouteBuilder::from(uri).delay(Duration::from_secs(3)).to("mock:done").build())
            .await
            .unwrap();
        ctx.start().await.unwrap();

        let queue = ctx.endpoint::<QueueEndpoint>(uri).unwrap().queue().clone();
        queue.send(Message::new("job"));

        let done = ctx.mock_endpoint("mock:done").unwrap();
        assert!(done.wait_for_count(1, Duration::from_secs(10)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let extensions = queue.visibility_change_count();
        assert!((1..=3).contains(&extensions), "extensions = {}", extensions);
        assert!(queue.is_empty());

        // Never redelivered while being processed
        let received = done.received_exchanges();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message().header(headers::QUEUE_RECEIVE_COUNT), Some(&json!(1)));

        ctx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_rejects_and_keeps_message() {
        let ctx = context_with_config(EngineConfig {
            pools: vec![PoolConfig::new("narrow", 1)
                .with_max_queue(0)
                .with_rejection(RejectionPolicy::Reject)],
            ..Default::default()
        });
        let uri = "queue:busy?pollDelay=100";
        ctx.add_route(RouteBuilder::from(uri).pool("narrow").to("mock:busy").build())
            .await
            .unwrap();

        // Occupy the only slot before the consumer polls
        let pool = ctx.scheduler().pool("narrow");
        let (release, blocked) = tokio::sync::oneshot::channel::<()>();
        assert_ok!(
            pool.submit(async move {
                let _ = blocked.await;
            })
            .await
        );
        let rejected = assert_err!(pool.submit(async {}).await);
        assert_eq!(rejected.kind(), ErrorKind::RejectedExecution);
        let baseline = pool.get_stats().rejected_total;

        ctx.start().await.unwrap();
        let queue = ctx.endpoint::<QueueEndpoint>(uri).unwrap().queue().clone();
        queue.send(Message::new("job"));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(pool.get_stats().rejected_total > baseline);
        assert_eq!(queue.len(), 1);
        let busy = ctx.mock_endpoint("mock:busy").unwrap();
        assert_eq!(busy.received_count(), 0);

        release.send(()).unwrap();
        assert!(busy.wait_for_count(1, Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_empty());

        ctx.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_message_reappears_after_visibility() {
        let ctx = context();
        let uri = "queue:flaky?visibilityTimeout=1";
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        ctx.add_route(
            RouteBuilder::from(uri)
                .process_fn(move |_| {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(EngineError::processing("first try fails"))
                    } else {
                        Ok(())
                    }
                })
                .to("mock:flaky")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let queue = ctx.endpoint::<QueueEndpoint>(uri).unwrap().queue().clone();
        queue.send(Message::new("m"));

        let flaky = ctx.mock_endpoint("mock:flaky").unwrap();
        assert!(flaky.wait_for_count(1, Duration::from_secs(5)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            flaky.received_exchanges()[0].message().header(headers::QUEUE_RECEIVE_COUNT),
            Some(&json!(2))
        );

        ctx.stop().await;
    }
}

mod transaction_tests {
    use super::*;

    #[derive(Default)]
    struct RecordingManager {
        committed: AtomicU32,
        rolled_back: AtomicU32,
    }

    #[async_trait]
    impl TransactionManager for RecordingManager {
        async fn begin(&self, exchange_id: &str) -> Result<String> {
            Ok(format!("tx-{}", exchange_id))
        }

        async fn commit(&self, _transaction: &str) -> Result<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _transaction: &str) -> Result<()> {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_and_rollback() {
        let ctx = context();
        let manager = Arc::new(RecordingManager::default());

        ctx.add_route(
            RouteBuilder::from("direct:tx")
                .transacted(manager.clone(), |s| {
                    s.to("mock:tx").process_fn(|ex| {
                        if ex.message().body_as_string() == "bad" {
                            Err(EngineError::processing("constraint violated"))
                        } else {
                            Ok(())
                        }
                    })
                })
                .build(),
        )
        .await
        .unwrap();
        ctx.add_route(
            RouteBuilder::from("direct:mark")
                .transacted(manager.clone(), |s| s.to("mock:mark").mark_rollback_only())
                .to("mock:after-mark")
                .build(),
        )
        .await
        .unwrap();
        ctx.start().await.unwrap();

        let template = ctx.producer_template();
        assert!(!template.send("direct:tx", Exchange::in_only("good")).await.is_failed());
        assert_eq!(manager.committed.load(Ordering::SeqCst), 1);

        assert!(template.send("direct:tx", Exchange::in_only("bad")).await.is_failed());
        assert_eq!(manager.rolled_back.load(Ordering::SeqCst), 1);

        let marked = template.send("direct:mark", Exchange::in_only("x")).await;
        assert!(!marked.is_failed());
        assert!(marked.is_rollback_only());
        assert_eq!(manager.rolled_back.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.mock_endpoint("mock:after-mark").unwrap().received_count(), 0);

        ctx.stop().await;
    }
}

mod context_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_start_stops_started_routes() {
        let ctx = context();
        ctx.add_route(RouteBuilder::from("direct:dup").route_id("first").to("mock:a").build())
            .await
            .unwrap();
        ctx.add_route(RouteBuilder::from("direct:dup").route_id("second").to("mock:b").build())
            .await
            .unwrap();

        let err = ctx.start().await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(ctx.route_state("first"), Some(RouteState::Stopped));
        assert_eq!(ctx.route_state("second"), Some(RouteState::Stopped));
        assert!(!ctx.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_add_route_with_same_id() {
        let ctx = context();
        let (first, second) = tokio::join!(
            ctx.add_route(RouteBuilder::from("direct:one").route_id("shared").to("mock:one").build()),
            ctx.add_route(RouteBuilder::from("direct:two").route_id("shared").to("mock:two").build()),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let err = outcomes.into_iter().find_map(|r| r.err()).unwrap();
        assert!(err.is_configuration());
        assert_eq!(ctx.route_ids(), vec!["shared".to_string()]);
    }

    #[tokio::test]
    async fn test_route_management() {
        let ctx = context();
        let generated = ctx.add_route(RouteBuilder::from("direct:a").to("mock:a").build()).await.unwrap();
        assert_eq!(generated, "route1");

        let duplicate = ctx
            .add_route(RouteBuilder::from("direct:b").route_id("route1").build())
            .await
            .err();
        assert!(duplicate.is_some_and(|e| e.is_configuration()));

        let bad_uri = ctx.add_route(RouteBuilder::from("direct:c").to("nosuch:x").build()).await.err();
        assert!(bad_uri.is_some_and(|e| e.is_configuration()));

        ctx.add_route(RouteBuilder::from("direct:manual").route_id("manual").auto_startup(false).build())
            .await
            .unwrap();
        ctx.start().await.unwrap();
        assert_eq!(ctx.route_ids(), vec!["route1".to_string(), "manual".to_string()]);
        assert_eq!(ctx.route_state("route1"), Some(RouteState::Started));
        assert_eq!(ctx.route_state("manual"), Some(RouteState::Stopped));

        ctx.start_route("manual").await.unwrap();
        assert_eq!(ctx.route_state("manual"), Some(RouteState::Started));

        // Added while running: started immediately
        ctx.add_route(RouteBuilder::from("direct:late").route_id("late").build())
            .await
            .unwrap();
        assert_eq!(ctx.route_state("late"), Some(RouteState::Started));

        ctx.remove_route("late").await.unwrap();
        assert_eq!(ctx.route_state("late"), None);

        ctx.stop().await;
        assert_eq!(ctx.route_state("route1"), Some(RouteState::Stopped));
        assert!(ctx.registry().endpoints().is_empty());
    }
}
