mod common;

use common::{frame, wait_for, TestPair, EVENT_TIMEOUT};
use handoff::{
    HandoffError, MediaBuffer, Plane, ProducerPhase, PublishOutcome, ReceivedBuffer, SessionEvent,
};
use protocol::{fourcc, PlaneInfo, UNUSED_TOKEN};
use rstest::rstest;
use shmem::SharedMemory;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn publish_and_pull(pair: &mut TestPair, buffer: Arc<MediaBuffer>) -> (PublishOutcome, ReceivedBuffer) {
    let producer = &pair.producer;
    let consumer = &mut pair.consumer;
    thread::scope(|s| {
        let publisher = s.spawn(move || producer.publish(buffer).unwrap());
        let received = consumer.pull().unwrap().expect("producer closed the session");
        (publisher.join().unwrap(), received)
    })
}

#[rstest]
fn test_publish_pull_release() {
    let mut pair = TestPair::with_configs(
        |p| {
            p.permissions = 0o640;
            p.ack_timeout_ms = 2000;
        },
        |_| {},
    );

    let mode = std::fs::metadata(&pair.socket_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);

    let buffer = frame(0x5A);
    let expected_len = buffer.planes()[0].info().size as usize;
    let (outcome, received) = publish_and_pull(&mut pair, buffer);

    assert_eq!(
        outcome,
        PublishOutcome::Delivered {
            generation: 1,
            acknowledged: true
        }
    );
    assert_eq!(received.generation(), 1);
    assert_eq!((received.width(), received.height()), (64, 64));
    assert_eq!(received.format(), fourcc(b"GREY"));
    assert_eq!(received.pts_ns(), None);
    assert_eq!(received.planes().len(), 1);

    let data = received.plane_data(0).unwrap();
    assert_eq!(data.len(), expected_len);
    assert!(data.iter().all(|&b| b == 0x5A));

    assert_eq!(pair.producer.outstanding(), 1);
    assert_eq!(pair.consumer.live_buffers(), 1);

    drop(received);
    assert!(wait_for(EVENT_TIMEOUT, || pair.producer.outstanding() == 0));
    assert_eq!(pair.consumer.live_buffers(), 0);

    let stats = pair.producer.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.force_released, 0);
}

#[rstest]
fn test_departed_consumer_is_drained_on_stop() {
    let mut pair = TestPair::with_configs(
        |p| p.drain_timeout_ms = 100,
        |c| c.drain_timeout_ms = 10,
    );
    let events = pair.producer.events();

    let (_, received) = publish_and_pull(&mut pair, frame(1));

    pair.consumer.stop().unwrap();
    assert!(matches!(
        events.recv_timeout(EVENT_TIMEOUT).unwrap(),
        SessionEvent::ClientDisconnected { .. }
    ));
    assert_eq!(pair.producer.phase(), ProducerPhase::Listening);
    assert_eq!(pair.producer.outstanding(), 1);

    // The session is gone, so this release never reaches the producer.
    drop(received);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(pair.producer.outstanding(), 1);

    pair.producer.stop().unwrap();
    assert_eq!(pair.producer.outstanding(), 0);
    assert_eq!(pair.producer.stats().force_released, 1);
    assert_eq!(pair.producer.stats().released, 0);
}

#[rstest]
fn test_zero_ack_timeout_publishes_are_independent() {
    let TestPair {
        producer,
        mut consumer,
        temp_dir: _temp_dir,
        ..
    } = TestPair::with_configs(|p| p.ack_timeout_ms = 0, |_| {});

    let (tx, rx) = crossbeam::channel::unbounded::<ReceivedBuffer>();
    let puller = thread::spawn(move || {
        for _ in 0..2 {
            let received = consumer.pull().unwrap().unwrap();
            tx.send(received).unwrap();
        }
        consumer
    });

    assert!(matches!(
        producer.publish(frame(1)).unwrap(),
        PublishOutcome::Delivered { generation: 1, .. }
    ));
    let first = rx.recv_timeout(EVENT_TIMEOUT).unwrap();

    assert!(matches!(
        producer.publish(frame(2)).unwrap(),
        PublishOutcome::Delivered { generation: 2, .. }
    ));
    let second = rx.recv_timeout(EVENT_TIMEOUT).unwrap();
    let consumer = puller.join().unwrap();

    assert_eq!(first.plane_data(0).unwrap()[0], 1);
    assert_eq!(second.plane_data(0).unwrap()[0], 2);
    assert_eq!(producer.outstanding(), 2);

    drop(second);
    assert!(wait_for(EVENT_TIMEOUT, || producer.outstanding() == 1));
    drop(first);
    assert!(wait_for(EVENT_TIMEOUT, || producer.outstanding() == 0));
    assert_eq!(producer.stats().released, 2);
    drop(consumer);
}

#[rstest]
fn test_multi_plane_layout_survives_handoff() {
    let mut pair = TestPair::with_configs(|p| p.ack_timeout_ms = 2000, |_| {});

    let mut luma = SharedMemory::new(8192).unwrap();
    luma.as_mut_slice().fill(0x10);
    let mut chroma = SharedMemory::new(8192).unwrap();
    chroma.as_mut_slice()[..512].fill(0xEE);
    chroma.as_mut_slice()[512..].fill(0x80);

    let nv12 = fourcc(b"NV12");
    let chroma_info = PlaneInfo {
        size: 2048,
        stride: 64,
        offset: 512,
        format: nv12,
    };
    let buffer = MediaBuffer::new(
        vec![
            Plane::new(luma, 64, nv12).unwrap(),
            Plane::with_layout(chroma, chroma_info).unwrap(),
        ],
        64,
        48,
        nv12,
    )
    .unwrap()
    .with_timing(Some(40_000_000), Some(33_333_333));

    let (_, received) = publish_and_pull(&mut pair, Arc::new(buffer));
    let descriptor = received.descriptor();

    assert_eq!(descriptor.plane_count, 2);
    assert_eq!(descriptor.planes[1], chroma_info);
    assert_eq!(&descriptor.tokens[2..], &[UNUSED_TOKEN, UNUSED_TOKEN]);
    assert_eq!(received.pts_ns(), Some(40_000_000));
    assert_eq!(received.duration_ns(), Some(33_333_333));

    assert!(received.plane_data(0).unwrap().iter().all(|&b| b == 0x10));
    let chroma = received.plane_data(1).unwrap();
    assert_eq!(chroma.len(), 2048);
    assert!(chroma.iter().all(|&b| b == 0x80));
    assert!(received.plane_data(2).is_none());
}

#[rstest]
fn test_release_happens_once_across_threads() {
    let mut pair = TestPair::with_configs(|p| p.ack_timeout_ms = 2000, |_| {});

    let (_, received) = publish_and_pull(&mut pair, frame(9));
    let shared = Arc::new(received);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || drop(shared))
        })
        .collect();
    drop(shared);
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_for(EVENT_TIMEOUT, || pair.producer.outstanding() == 0));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(pair.producer.stats().released, 1);
    assert_eq!(pair.consumer.live_buffers(), 0);
}

#[rstest]
fn test_producer_close_ends_stream() {
    let mut pair = TestPair::with_configs(|p| p.drain_timeout_ms = 10, |_| {});

    pair.producer.stop().unwrap();

    assert!(pair.consumer.pull().unwrap().is_none());
    assert!(pair.consumer.pull().unwrap().is_none());
}

#[rstest]
fn test_stale_descriptor_is_rejected() {
    let mut pair = TestPair::with_configs(
        |p| {
            p.ack_timeout_ms = 0;
            p.drain_timeout_ms = 50;
        },
        |_| {},
    );

    pair.producer.publish(frame(1)).unwrap();
    pair.producer.publish(frame(2)).unwrap();

    // Both notifications are queued but the mailbox only holds the second.
    assert!(matches!(
        pair.consumer.pull(),
        Err(HandoffError::StaleDescriptor {
            expected: 1,
            found: 2
        })
    ));
    let received = pair.consumer.pull().unwrap().unwrap();
    assert_eq!(received.generation(), 2);
    assert_eq!(received.plane_data(0).unwrap()[0], 2);

    drop(received);
    assert!(wait_for(EVENT_TIMEOUT, || pair.producer.outstanding() == 1));
}

#[rstest]
fn test_reused_tokens_after_release_on_another_thread() {
    let mut pair = TestPair::with_configs(
        |p| {
            p.ack_timeout_ms = 0;
            p.capacity = 4096;
        },
        |c| c.capacity = 4096,
    );

    let (tx, rx) = crossbeam::channel::unbounded::<ReceivedBuffer>();
    let dropper = thread::spawn(move || {
        for received in rx {
            drop(received);
        }
    });

    for cycle in 0..2000u32 {
        pair.producer.publish(frame(cycle as u8)).unwrap();
        let received = match pair.consumer.pull() {
            Ok(Some(received)) => received,
            other => panic!("cycle {}: {:?}", cycle, other.map(|r| r.map(|b| b.tokens()))),
        };
        tx.send(received).unwrap();
    }
    drop(tx);
    dropper.join().unwrap();

    assert!(wait_for(EVENT_TIMEOUT, || pair.producer.outstanding() == 0));
    assert_eq!(pair.consumer.live_buffers(), 0);
    assert_eq!(pair.producer.stats().released, 2000);
}
