use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;

use hazardwatch::feed::InMemoryHazardFeed;
use hazardwatch::time::ManualClock;
use hazardwatch::{
    alert_channel, Alert, AlertStream, Coordinate, FeedError, HazardFeed, LiveMatcher, MatcherState, NewHazard,
    SessionEvent, StartOutcome, WatchConfig,
};

const QUIET: Duration = Duration::from_millis(150);
const WAIT: Duration = Duration::from_secs(3);

fn at(lat: f64, lon: f64) -> Coordinate {
    Coordinate::new(lat, lon).unwrap()
}

fn config() -> WatchConfig {
    WatchConfig {
        resubscribe_attempts: 3,
        resubscribe_backoff_ms: 5,
        ..WatchConfig::default()
    }
}

fn next_alert(stream: &AlertStream) -> Alert {
    match stream.recv_timeout(WAIT) {
        Some(SessionEvent::Alert(alert)) => alert,
        other => panic!("expected alert, got {other:?}"),
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn live_scenarios_near_self_far_and_unlocated() {
    let feed = Arc::new(InMemoryHazardFeed::new());
    let matcher = LiveMatcher::new(feed.clone(), config());
    let (sink, stream) = alert_channel(16);
    matcher.start("me", Some(at(10.0, 10.0)), Some(5.0), Arc::new(sink)).unwrap();

    // B: own report, C: ~111 km away, D: no location
    feed.append(NewHazard::new("me", at(10.0, 10.0), "pothole")).unwrap();
    feed.append(NewHazard::new("u2", at(11.0, 10.0), "pothole")).unwrap();
    feed.append(NewHazard::unlocated("u3", "speedbump")).unwrap();
    // A: ~2.2 km north
    let near = feed.append(NewHazard::new("u1", at(10.02, 10.0), "speedbump")).unwrap();

    let alert = next_alert(&stream);
    assert_eq!(alert.event_id, near);
    assert_eq!(alert.label, "speedbump");
    assert!((alert.distance_km - 2.22).abs() < 0.05, "distance {}", alert.distance_km);
    assert!(alert.message().contains("2.2 km"));

    assert!(stream.recv_timeout(QUIET).is_none());
}

#[test]
fn restart_never_alerts_on_events_from_while_stopped() {
    let clock = Arc::new(ManualClock::from_millis(1_000));
    let feed = Arc::new(InMemoryHazardFeed::with_clock(clock.clone()));
    let matcher = LiveMatcher::new(feed.clone(), config());
    let (sink, stream) = alert_channel(16);
    let sink = Arc::new(sink);

    let first = matcher.start("me", Some(at(10.0, 10.0)), None, sink.clone()).unwrap();
    assert_eq!(first.watermark().timestamp_millis(), 1_000);
    assert!(matcher.stop());

    clock.advance(ChronoDuration::milliseconds(1_000));
    let missed = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();

    clock.advance(ChronoDuration::milliseconds(1_000));
    let second = matcher.start("me", Some(at(10.0, 10.0)), None, sink).unwrap();
    assert!(matches!(second, StartOutcome::Started { .. }));
    assert_eq!(second.watermark().timestamp_millis(), 3_000);

    // The feed redelivers the old event; it predates the new watermark.
    feed.redeliver(missed).unwrap();
    assert!(stream.recv_timeout(QUIET).is_none());

    let fresh = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    assert_eq!(next_alert(&stream).event_id, fresh);
}

#[test]
fn duplicate_notifications_alert_once() {
    let feed = Arc::new(InMemoryHazardFeed::new());
    let matcher = LiveMatcher::new(feed.clone(), config());
    let (sink, stream) = alert_channel(16);
    matcher.start("me", Some(at(10.0, 10.0)), None, Arc::new(sink)).unwrap();

    let id = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    feed.redeliver(id).unwrap();
    feed.redeliver(id).unwrap();

    assert_eq!(next_alert(&stream).event_id, id);
    assert!(stream.recv_timeout(QUIET).is_none());
}

#[test]
fn resubscribes_after_disconnect_and_keeps_watermark() {
    let feed = Arc::new(InMemoryHazardFeed::new());
    let matcher = LiveMatcher::new(feed.clone(), config());
    let (sink, stream) = alert_channel(16);
    let started = matcher.start("me", Some(at(10.0, 10.0)), None, Arc::new(sink)).unwrap();

    feed.disconnect_all().unwrap();
    assert!(wait_for(|| feed.subscription_count().unwrap() == 1));

    let id = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    assert_eq!(next_alert(&stream).event_id, id);
    assert_eq!(
        matcher.state(),
        MatcherState::Subscribed {
            watcher_id: "me".into(),
            watermark: started.watermark(),
        }
    );
}

#[test]
fn connectivity_loss_is_reported_and_session_can_restart() {
    let feed = Arc::new(InMemoryHazardFeed::new());
    let matcher = LiveMatcher::new(feed.clone(), config());
    let (sink, stream) = alert_channel(16);
    let sink = Arc::new(sink);
    matcher.start("me", Some(at(10.0, 10.0)), None, sink.clone()).unwrap();

    feed.set_accepting_subscriptions(false).unwrap();
    feed.disconnect_all().unwrap();

    match stream.recv_timeout(WAIT) {
        Some(SessionEvent::ConnectivityLost {
            error: FeedError::ConnectivityLost { attempts, .. },
        }) => assert_eq!(attempts, 3),
        other => panic!("expected connectivity loss, got {other:?}"),
    }
    assert!(wait_for(|| !matcher.is_subscribed()));

    feed.set_accepting_subscriptions(true).unwrap();
    let outcome = matcher.start("me", Some(at(10.0, 10.0)), None, sink).unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));

    let id = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    assert_eq!(next_alert(&stream).event_id, id);
}

#[test]
fn watchers_are_independent() {
    let feed = Arc::new(InMemoryHazardFeed::new());
    let alice = LiveMatcher::new(feed.clone(), config());
    let bob = LiveMatcher::new(feed.clone(), config());
    let (alice_sink, alice_alerts) = alert_channel(16);
    let (bob_sink, bob_alerts) = alert_channel(16);

    alice.start("alice", Some(at(10.0, 10.0)), None, Arc::new(alice_sink)).unwrap();
    bob.start("bob", Some(at(10.0, 10.0)), None, Arc::new(bob_sink)).unwrap();
    assert!(alice.stop());

    let id = feed.append(NewHazard::new("carol", at(10.0, 10.0), "pothole")).unwrap();
    assert_eq!(next_alert(&bob_alerts).event_id, id);
    assert!(alice_alerts.recv_timeout(QUIET).is_none());
    assert!(bob.is_subscribed());
}

#[test]
fn event_appended_in_the_same_millisecond_before_start_is_skipped() {
    // The clock never moves: append and start share one millisecond.
    let clock = Arc::new(ManualClock::from_millis(1_000));
    let feed = Arc::new(InMemoryHazardFeed::with_clock(clock));
    let matcher = LiveMatcher::new(feed.clone(), config());
    let (sink, stream) = matcher.alert_channel();

    let old = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    let started = matcher.start("me", Some(at(10.0, 10.0)), None, Arc::new(sink)).unwrap();
    let old_created_at = feed.get(old).unwrap().unwrap().created_at;
    assert!(old_created_at < started.watermark());

    feed.redeliver(old).unwrap();
    assert!(stream.recv_timeout(QUIET).is_none());

    let fresh = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    assert_eq!(next_alert(&stream).event_id, fresh);
    assert!(stream.recv_timeout(QUIET).is_none());
}

#[test]
fn clock_stepping_back_after_start_still_alerts() {
    let clock = Arc::new(ManualClock::from_millis(1_000));
    let feed = Arc::new(InMemoryHazardFeed::with_clock(clock.clone()));
    let matcher = LiveMatcher::new(feed.clone(), config());
    let (sink, stream) = matcher.alert_channel();

    let started = matcher.start("me", Some(at(10.0, 10.0)), None, Arc::new(sink)).unwrap();
    assert_eq!(started.watermark().timestamp_millis(), 1_000);

    clock.advance(ChronoDuration::milliseconds(-100));
    let id = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();

    let alert = next_alert(&stream);
    assert_eq!(alert.event_id, id);
    assert!(alert.reported_at >= started.watermark());
}

#[test]
fn stop_inside_sink_processes_no_further_notifications() {
    let feed = Arc::new(InMemoryHazardFeed::new());
    let matcher = Arc::new(LiveMatcher::new(feed.clone(), config()));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = {
        let weak = Arc::downgrade(&matcher);
        let seen = Arc::clone(&seen);
        move |alert: Alert| {
            seen.lock().unwrap().push(alert.event_id);
            // Give the later appends time to queue up behind this one.
            thread::sleep(Duration::from_millis(50));
            if let Some(m) = weak.upgrade() {
                m.stop();
            }
        }
    };
    matcher.start("me", Some(at(10.0, 10.0)), None, Arc::new(sink)).unwrap();

    let first = feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    for _ in 0..5 {
        feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    }

    assert!(wait_for(|| !matcher.is_subscribed()));
    thread::sleep(QUIET);
    feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    thread::sleep(QUIET);

    assert_eq!(*seen.lock().unwrap(), vec![first]);
    assert!(wait_for(|| feed.subscription_count().unwrap() == 0));
}

#[test]
fn alert_channel_uses_configured_buffer() {
    let feed = Arc::new(InMemoryHazardFeed::new());
    let matcher = LiveMatcher::new(
        feed.clone(),
        WatchConfig {
            alert_buffer: 2,
            ..config()
        },
    );
    let (sink, stream) = matcher.alert_channel();
    let sink = Arc::new(sink);
    matcher.start("me", Some(at(10.0, 10.0)), None, sink.clone()).unwrap();

    for _ in 0..4 {
        feed.append(NewHazard::new("u1", at(10.0, 10.0), "pothole")).unwrap();
    }

    assert!(wait_for(|| sink.dropped() == 2));
    assert!(matches!(stream.try_recv(), Some(SessionEvent::Alert(_))));
    assert!(matches!(stream.try_recv(), Some(SessionEvent::Alert(_))));
    assert!(stream.try_recv().is_none());
}
