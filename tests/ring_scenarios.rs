//! Cross-handle ring scenarios: several handles on one segment within
//! a single process, exercising the same protocol paths that separate
//! processes would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use conveyor::{BufferState, RingConfig, SharedRing};

/// Process-unique test keys so concurrent runs on one host do not
/// collide; the tag keeps tests within a run apart.
fn test_key(tag: u32) -> u32 {
    0x5200_0000 | ((std::process::id() & 0x3FFF) << 8) | tag
}

fn config(tag: u32, count: usize, size: usize, destructive: bool) -> RingConfig {
    RingConfig {
        destructive_read: destructive,
        ..RingConfig::new(test_key(tag), count, size)
    }
}

macro_rules! ring_or_skip {
    ($ring:expr) => {{
        let ring = $ring;
        if !ring.is_valid() {
            eprintln!("skipping: System V shared memory unavailable on this host");
            return;
        }
        ring
    }};
}

#[test]
fn destructive_round_trip_in_order() {
    let producer = ring_or_skip!(SharedRing::new(config(0x01, 4, 64, true)));
    let consumer = SharedRing::new(config(0x01, 4, 64, true));
    assert!(consumer.is_valid());
    assert!(!consumer.is_creator());

    for i in 1..=4u8 {
        let buffer = producer.get_buffer_for_writing(false).unwrap();
        producer.write(buffer, &[i; 16]).unwrap();
        producer.mark_full(buffer, -1).unwrap();
    }
    assert_eq!(consumer.read_ready_count(), 4);

    for expected in 1..=4u8 {
        let buffer = consumer.get_buffer_for_reading().unwrap();
        assert_eq!(consumer.data_size(buffer).unwrap(), 16);
        let mut out = [0u8; 16];
        assert!(consumer.read(buffer, &mut out).unwrap());
        assert_eq!(out, [expected; 16]);
        consumer.mark_empty(buffer, false).unwrap();
    }

    // All four buffers were consumed destructively, in sequence order.
    assert_eq!(consumer.lowest_seq_id_read(), 4);
    assert_eq!(consumer.get_buffer_for_reading(), None);
    assert_eq!(producer.write_ready_count(false), 4);
}

#[test]
fn broadcast_fan_out_reaches_each_consumer_once() {
    let producer = ring_or_skip!(SharedRing::new(config(0x02, 4, 64, false)));
    let consumer_a = SharedRing::new(config(0x02, 4, 64, false));
    let consumer_b = SharedRing::new(config(0x02, 4, 64, false));
    assert!(consumer_a.is_valid() && consumer_b.is_valid());

    let buffer = producer.get_buffer_for_writing(false).unwrap();
    producer.write(buffer, b"broadcast-payload").unwrap();
    producer.mark_full(buffer, -1).unwrap();

    let got_a = consumer_a.get_buffer_for_reading().unwrap();
    let mut out = [0u8; 17];
    assert!(consumer_a.read(got_a, &mut out).unwrap());
    assert_eq!(&out, b"broadcast-payload");
    consumer_a.mark_empty(got_a, false).unwrap();

    // A's release did not consume the buffer for B.
    let got_b = consumer_b.get_buffer_for_reading().unwrap();
    assert_eq!(got_b, got_a);
    let mut out = [0u8; 17];
    assert!(consumer_b.read(got_b, &mut out).unwrap());
    assert_eq!(&out, b"broadcast-payload");
    consumer_b.mark_empty(got_b, false).unwrap();

    // Each consumer sees the payload exactly once.
    assert_eq!(consumer_a.get_buffer_for_reading(), None);
    assert_eq!(consumer_b.get_buffer_for_reading(), None);
}

#[test]
fn stale_reader_is_reclaimed() {
    let mut cfg = config(0x03, 2, 64, true);
    cfg.stale_timeout_us = 50_000;
    let producer = ring_or_skip!(SharedRing::new(cfg.clone()));
    let vanished = SharedRing::new(cfg.clone());
    let rescuer = SharedRing::new(cfg);
    assert!(vanished.is_valid() && rescuer.is_valid());

    let buffer = producer.get_buffer_for_writing(false).unwrap();
    producer.write(buffer, &[0xAB; 8]).unwrap();
    producer.mark_full(buffer, -1).unwrap();

    // A consumer claims the buffer and then never completes the read.
    assert_eq!(vanished.get_buffer_for_reading(), Some(buffer));
    assert!(vanished.check_buffer(buffer, BufferState::Reading).unwrap());

    // Within the timeout nobody can steal it.
    assert_eq!(rescuer.get_buffer_for_reading(), None);

    thread::sleep(Duration::from_millis(80));

    // Past the timeout, any other handle's scan resets the buffer and
    // may claim it.
    let reclaimed = rescuer.get_buffer_for_reading();
    assert_eq!(reclaimed, Some(buffer));
    let mut out = [0u8; 8];
    assert!(rescuer.read(buffer, &mut out).unwrap());
    assert_eq!(out, [0xAB; 8]);
    rescuer.mark_empty(buffer, false).unwrap();
}

#[test]
fn overwrite_preempts_reader() {
    // Timeout 0 disables reclamation so only pre-emption is in play.
    let mut cfg = config(0x04, 2, 64, false);
    cfg.stale_timeout_us = 0;
    let producer = ring_or_skip!(SharedRing::new(cfg.clone()));
    let reader = SharedRing::new(cfg);
    assert!(reader.is_valid());

    for _ in 0..2 {
        let buffer = producer.get_buffer_for_writing(false).unwrap();
        producer.write(buffer, &[1; 4]).unwrap();
        producer.mark_full(buffer, -1).unwrap();
    }
    let first = reader.get_buffer_for_reading().unwrap();
    let second = reader.get_buffer_for_reading().unwrap();
    assert_eq!(reader.buffers_owned_by_self().len(), 2);

    // Nothing claimable without overwrite, the whole ring is Reading.
    assert_eq!(producer.get_buffer_for_writing(false), None);

    let stolen = producer.get_buffer_for_writing(true).unwrap();
    assert!(stolen == first || stolen == second);
    assert!(producer
        .check_buffer(stolen, BufferState::Writing)
        .unwrap());

    // The pre-empted reader notices the ownership change and yields
    // without side effects.
    assert!(!reader.advance_read_pos(stolen, 1).unwrap());
    assert!(!reader.reset_read_pos(stolen).unwrap());

    // Its other buffer is untouched.
    let kept = if stolen == first { second } else { first };
    assert!(reader.advance_read_pos(kept, 1).unwrap());
    assert!(reader.check_buffer(kept, BufferState::Reading).unwrap());
}

#[test]
fn creator_removal_is_end_of_data_for_peers() {
    let attacher;
    {
        let creator = ring_or_skip!(SharedRing::new(config(0x05, 2, 32, true)));
        attacher = SharedRing::new(config(0x05, 2, 32, true));
        assert!(attacher.is_valid());
        assert_eq!(creator.attached_count(), 2);
        assert!(!attacher.is_end_of_data());
        // Creator goes away and takes the segment with it.
    }
    assert!(attacher.is_end_of_data());
}

#[test]
fn threaded_producer_consumer_preserves_order() {
    const MESSAGES: u64 = 200;

    let producer = ring_or_skip!(SharedRing::new(config(0x06, 4, 64, true)));
    let consumer = SharedRing::new(config(0x06, 4, 64, true));
    assert!(consumer.is_valid());

    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            for value in 1..=MESSAGES {
                let buffer = loop {
                    if let Some(buffer) = producer.get_buffer_for_writing(false) {
                        break buffer;
                    }
                    thread::yield_now();
                };
                producer.write(buffer, &value.to_le_bytes()).unwrap();
                producer.mark_full(buffer, -1).unwrap();
            }
            done.store(true, Ordering::Release);
        });

        scope.spawn(|| {
            let mut received = 0u64;
            let mut previous = 0u64;
            loop {
                let Some(buffer) = consumer.get_buffer_for_reading() else {
                    if done.load(Ordering::Acquire) && received == MESSAGES {
                        break;
                    }
                    thread::yield_now();
                    continue;
                };
                let mut out = [0u8; 8];
                assert!(consumer.read(buffer, &mut out).unwrap());
                let value = u64::from_le_bytes(out);
                // A single destructive consumer observes strictly
                // increasing sequence values.
                assert!(value > previous, "{value} after {previous}");
                previous = value;
                received += 1;
                consumer.mark_empty(buffer, false).unwrap();
            }
            assert_eq!(received, MESSAGES);
        });
    });

    assert_eq!(producer.last_seen_id(), MESSAGES);
    assert_eq!(consumer.lowest_seq_id_read(), MESSAGES);
}
