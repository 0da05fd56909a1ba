mod common;

use common::*;
use frank_core::config::ReceiverConfig;
use frank_core::state_machine::{ExitState, ProcessState, RunState};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_processes_queued_messages() {
    let fixture = TestReceiverBuilder::new(test_config("orders"))
        .configured()
        .await;
    for n in 1..=3 {
        fixture.listener.enqueue(&format!("m{n}"), &format!("hello-{n}"));
    }

    fixture.receiver.start().await.unwrap();
    let adapter = fixture.adapter.clone();
    assert!(wait_until(Duration::from_secs(10), || adapter.call_count() == 3).await);
    fixture.receiver.stop().await.unwrap();

    assert_eq!(fixture.listener.queue_len(), 0);
    assert!(fixture
        .listener
        .processed()
        .iter()
        .all(|(_, state)| *state == ExitState::Success));
    assert_eq!(
        fixture.listener.threads_opened.load(Ordering::SeqCst),
        fixture.listener.threads_closed.load(Ordering::SeqCst)
    );
    assert_eq!(fixture.receiver.run_state(), RunState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_rolled_back_message_is_redelivered_until_it_succeeds() {
    let config = ReceiverConfig {
        max_retries: Some(3),
        ..transacted_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    fixture.listener.enqueue("m1", "flaky");
    fixture.adapter.fail_next(2);

    fixture.receiver.start().await.unwrap();
    let listener = fixture.listener.clone();
    assert!(
        wait_until(Duration::from_secs(30), || {
            listener.processed().last() == Some(&(Some("m1".to_string()), ExitState::Success))
        })
        .await
    );
    fixture.receiver.stop().await.unwrap();

    assert_eq!(fixture.adapter.call_count(), 3);
    assert_eq!(fixture.listener.queue_len(), 0);
    let status = fixture.receiver.process_status("m1").unwrap();
    assert_eq!(status.receive_count, 3);
    assert_eq!(status.exit_state, Some(ExitState::Success));
    assert!(fixture.error_storage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_poison_message_ends_in_error_storage() {
    let config = ReceiverConfig {
        max_retries: Some(1),
        ..transacted_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    fixture.listener.enqueue("m1", "fail");

    fixture.receiver.start().await.unwrap();
    let errors = fixture.error_storage.clone();
    assert!(wait_until(Duration::from_secs(30), || errors.len() == 1).await);
    fixture.receiver.stop().await.unwrap();

    assert_eq!(fixture.adapter.call_count(), 2);
    assert_eq!(fixture.listener.queue_len(), 0);
    assert_eq!(fixture.receiver.statistics().rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retrieval_errors_raise_warning_until_a_message_arrives() {
    let config = ReceiverConfig {
        exception_warning_threshold: 2,
        ..test_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    fixture.listener.fail_retrievals(3);

    fixture.receiver.start().await.unwrap();
    let receiver = fixture.receiver.clone();
    assert!(wait_until(Duration::from_secs(60), || receiver.is_in_warning()).await);
    assert_eq!(receiver.run_state(), RunState::Started);

    fixture.listener.enqueue("m1", "hello");
    assert!(wait_until(Duration::from_secs(30), || !receiver.is_in_warning()).await);
    fixture.receiver.stop().await.unwrap();

    assert_eq!(fixture.adapter.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_peek_avoids_transactions_on_empty_source() {
    let fixture = TestReceiverBuilder::new(transacted_config("orders"))
        .listener_traits(ListenerTraits {
            peekable: true,
            ..ListenerTraits::default()
        })
        .configured()
        .await;

    fixture.receiver.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fixture.transaction_manager.backend().begun(), 0);

    fixture.listener.enqueue("m1", "hello");
    let adapter = fixture.adapter.clone();
    assert!(wait_until(Duration::from_secs(10), || adapter.call_count() == 1).await);
    fixture.receiver.stop().await.unwrap();

    assert_eq!(fixture.transaction_manager.backend().committed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_process_states_through_the_poll_loop() {
    let config = ReceiverConfig {
        max_retries: Some(0),
        ..transacted_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config)
        .listener_traits(ListenerTraits {
            process_states: true,
            ..ListenerTraits::default()
        })
        .configured()
        .await;
    fixture.listener.enqueue("good", "hello");
    fixture.listener.enqueue("bad", "fail");

    fixture.receiver.start().await.unwrap();
    let listener = fixture.listener.clone();
    assert!(
        wait_until(Duration::from_secs(30), || {
            listener.process_state("bad") == Some(ProcessState::Error)
        })
        .await
    );
    fixture.receiver.stop().await.unwrap();

    assert_eq!(fixture.listener.process_state("good"), Some(ProcessState::Done));
    assert_eq!(fixture.error_storage.len(), 1);
    // one failed attempt, then rejected on redelivery
    assert_eq!(fixture.adapter.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_thread_count_can_be_adjusted() {
    let config = ReceiverConfig {
        num_threads: 2,
        ..test_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    let receiver = &fixture.receiver;
    assert_eq!(receiver.thread_count().await, None);

    receiver.start().await.unwrap();
    assert_eq!(receiver.thread_count().await, Some(2));

    receiver.increase_thread_count().await;
    assert_eq!(receiver.thread_count().await, Some(3));

    for _ in 0..5 {
        receiver.decrease_thread_count().await.unwrap();
    }
    assert_eq!(receiver.thread_count().await, Some(1));

    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_message_in_flight() {
    let fixture = TestReceiverBuilder::new(test_config("orders"))
        .configured()
        .await;
    fixture.listener.enqueue("m1", "slow");

    fixture.receiver.start().await.unwrap();
    let adapter = fixture.adapter.clone();
    assert!(wait_until(Duration::from_secs(5), || adapter.call_count() == 1).await);

    fixture.receiver.stop().await.unwrap();

    assert_eq!(
        fixture.listener.processed(),
        vec![(Some("m1".to_string()), ExitState::Success)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_processing_with_poll_limit() {
    let config = ReceiverConfig {
        num_threads: 4,
        num_threads_polling: 1,
        ..test_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    for n in 0..8 {
        fixture.listener.enqueue(&format!("m{n}"), "slow");
    }

    let started = tokio::time::Instant::now();
    fixture.receiver.start().await.unwrap();
    let listener = fixture.listener.clone();
    assert!(wait_until(Duration::from_secs(60), || listener.processed().len() == 8).await);
    fixture.receiver.stop().await.unwrap();

    // eight ten-second messages on four threads take two rounds, not eight
    assert!(started.elapsed() < Duration::from_secs(40));
}

#[tokio::test(start_paused = true)]
async fn test_retrieval_failures_back_off_exponentially_up_to_the_cap() {
    let config = ReceiverConfig {
        max_retry_interval_secs: 8,
        ..test_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    let receiver = &fixture.receiver;
    assert_eq!(receiver.current_retry_interval().await, None);
    fixture.listener.fail_retrievals(5);

    receiver.start().await.unwrap();

    // five failures, then the first successful (empty) poll
    let listener = fixture.listener.clone();
    assert!(wait_until(Duration::from_secs(60), || listener.retrieval_gaps().len() >= 5).await);
    assert_eq!(
        fixture.listener.retrieval_gaps()[..5],
        [1, 2, 4, 8, 8].map(Duration::from_secs)
    );
    assert_eq!(
        receiver.current_retry_interval().await,
        Some(Duration::from_secs(1))
    );
    assert_eq!(receiver.is_idle().await, Some(true));

    receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_interval_doubles_while_retrievals_fail() {
    let fixture = TestReceiverBuilder::new(test_config("orders"))
        .configured()
        .await;
    fixture.listener.fail_retrievals(100);

    fixture.receiver.start().await.unwrap();
    let listener = fixture.listener.clone();
    assert!(wait_until(Duration::from_secs(60), || listener.retrieval_gaps().len() >= 3).await);
    // capped at max_retry_interval_secs
    assert_eq!(
        fixture.receiver.current_retry_interval().await,
        Some(Duration::from_secs(8))
    );
    assert_eq!(fixture.receiver.is_idle().await, Some(false));
    fixture.receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_source_is_polled_at_the_poll_interval() {
    let config = ReceiverConfig {
        poll_interval_secs: 3,
        ..test_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    assert_eq!(fixture.receiver.is_idle().await, None);

    fixture.receiver.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fixture.receiver.is_idle().await, Some(true));

    let gaps = fixture.listener.retrieval_gaps();
    assert_eq!(gaps.len(), 3);
    assert!(gaps.iter().all(|gap| *gap == Duration::from_secs(3)));

    // a message ends the idle wait on the next poll
    fixture.listener.enqueue("m1", "hello");
    let adapter = fixture.adapter.clone();
    assert!(wait_until(Duration::from_secs(4), || adapter.call_count() == 1).await);
    fixture.receiver.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_single_poller_feeds_concurrent_processing() {
    let config = ReceiverConfig {
        num_threads: 2,
        num_threads_polling: 1,
        ..test_config("orders")
    };
    let fixture = TestReceiverBuilder::new(config).configured().await;
    fixture.listener.enqueue("m1", "slow");
    fixture.listener.enqueue("m2", "slow");

    fixture.receiver.start().await.unwrap();
    let adapter = fixture.adapter.clone();
    // the second poll runs while the first message is still processing
    assert!(wait_until(Duration::from_secs(1), || adapter.call_count() == 2).await);
    let listener = fixture.listener.clone();
    assert!(wait_until(Duration::from_secs(11), || listener.processed().len() == 2).await);
    fixture.receiver.stop().await.unwrap();
}
