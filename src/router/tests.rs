//! Tests for the session map

use super::*;
use crate::audio::{FinderTimings, VirtualMixer};
use crate::error::LinkError;
use crate::session::Direction;
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<DeviceMessage>>,
}

impl DeviceSink for RecordingSink {
    fn send(&self, message: &DeviceMessage) -> Result<(), LinkError> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

fn finder_timings() -> FinderTimings {
    FinderTimings {
        retry_attempts: 2,
        retry_delay: Duration::from_millis(1),
        health_interval: Duration::from_secs(5),
        change_debounce: Duration::from_millis(100),
    }
}

fn make_map(mixer: &VirtualMixer, yaml: &str, timings: RefreshTimings) -> (SessionMap, Arc<RecordingSink>) {
    let finder = Arc::new(SessionFinder::with_timings(mixer.backend(), finder_timings()));
    let sink = Arc::new(RecordingSink::default());
    let config = Arc::new(AppConfig::parse(yaml).unwrap());

    let mut map = SessionMap::with_timings(finder, sink.clone(), config, timings);
    map.initialize();
    (map, sink)
}

fn eager_refresh() -> RefreshTimings {
    RefreshTimings {
        lazy_min_interval: Duration::ZERO,
        forced_interval: Duration::from_secs(45),
    }
}

#[test]
fn test_ceiling_limits_volume() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");

    let (mut map, _) = make_map(
        &mixer,
        "slider_mapping:\n  1: chrome.exe\nslider_max_volume:\n  1: 50\n",
        RefreshTimings::default(),
    );

    map.handle_event(&SliderMoveEvent::set(1, 1.0));
    assert_eq!(mixer.process_volume(100), Some(0.5));
}

#[test]
fn test_small_differences_are_not_written() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");
    mixer.set_process_volume(100, 0.5);

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  0: chrome.exe\n", RefreshTimings::default());
    let writes = mixer.volume_writes();

    map.handle_event(&SliderMoveEvent::set(0, 0.505));
    assert_eq!(mixer.volume_writes(), writes);
    assert_eq!(mixer.process_volume(100), Some(0.5));

    map.handle_event(&SliderMoveEvent::set(0, 0.6));
    assert_eq!(mixer.volume_writes(), writes + 1);
    assert_eq!(mixer.process_volume(100), Some(0.6));
}

#[test]
fn test_target_names_are_case_insensitive() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "Chrome.EXE");

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  0: chrome.exe\n", RefreshTimings::default());

    map.handle_event(&SliderMoveEvent::set(0, 0.2));
    assert_eq!(mixer.process_volume(100), Some(0.2));
}

#[test]
fn test_unmapped_bucket_membership() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");
    mixer.spawn_process(200, "spotify.exe");
    mixer.spawn_process(300, "discord.exe");

    let (mut map, _) = make_map(
        &mixer,
        "slider_mapping:\n  0: chrome.exe\n  1: deej.unmapped\nignore_unmapped: [Discord.exe]\n",
        RefreshTimings::default(),
    );

    assert_eq!(map.unmapped_keys(), vec!["spotify.exe"]);

    map.handle_event(&SliderMoveEvent::set(1, 0.3));
    assert_eq!(mixer.process_volume(200), Some(0.3));
    assert_eq!(mixer.process_volume(100), Some(1.0));
    assert_eq!(mixer.process_volume(300), Some(1.0));

    // binding spotify explicitly takes it out of the bucket
    let config = AppConfig::parse(
        "slider_mapping:\n  0: chrome.exe\n  1: deej.unmapped\n  2: spotify.exe\nignore_unmapped: [discord.exe]\n",
    )
    .unwrap();
    map.set_config(Arc::new(config));
    assert!(map.unmapped_keys().is_empty());
}

#[test]
fn test_group_targets_every_member() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "game.exe");
    mixer.spawn_process(200, "launcher.exe");
    mixer.spawn_process(300, "chrome.exe");

    let (mut map, _) = make_map(
        &mixer,
        "slider_mapping:\n  2: games\ngroups:\n  Games: [game.exe, launcher.exe]\n",
        RefreshTimings::default(),
    );

    map.handle_event(&SliderMoveEvent::set(2, 0.4));
    assert_eq!(mixer.process_volume(100), Some(0.4));
    assert_eq!(mixer.process_volume(200), Some(0.4));
    assert_eq!(mixer.process_volume(300), Some(1.0));
}

#[test]
fn test_reserved_and_device_targets() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.add_endpoint("headphones", "Headphones", Direction::Output);

    let (mut map, _) = make_map(
        &mixer,
        "slider_mapping:\n  0: master\n  1: mic\n  2: system\n  3: headphones\n",
        RefreshTimings::default(),
    );

    map.handle_event(&SliderMoveEvent::set(0, 0.7));
    map.handle_event(&SliderMoveEvent::set(1, 0.6));
    map.handle_event(&SliderMoveEvent::set(2, 0.5));
    map.handle_event(&SliderMoveEvent::set(3, 0.4));

    assert_eq!(mixer.endpoint_volume("speakers"), Some(0.7));
    assert_eq!(mixer.endpoint_volume("microphone"), Some(0.6));
    assert_eq!(mixer.system_volume("speakers"), Some(0.5));
    assert_eq!(mixer.endpoint_volume("headphones"), Some(0.4));
}

#[test]
fn test_current_follows_foreground_window() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");
    mixer.spawn_process(200, "discord.exe");

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  4: deej.current\n", RefreshTimings::default());

    mixer.set_foreground(Some(100));
    map.handle_event(&SliderMoveEvent::set(4, 0.3));
    assert_eq!(mixer.process_volume(100), Some(0.3));
    assert_eq!(mixer.process_volume(200), Some(1.0));

    mixer.set_foreground(Some(200));
    map.handle_event(&SliderMoveEvent::set(4, 0.8));
    assert_eq!(mixer.process_volume(100), Some(0.3));
    assert_eq!(mixer.process_volume(200), Some(0.8));

    mixer.set_foreground(None);
    map.handle_event(&SliderMoveEvent::set(4, 0.1));
    assert_eq!(mixer.process_volume(200), Some(0.8));
}

#[test]
fn test_device_requests_resend_names() {
    let mixer = VirtualMixer::with_default_devices();
    let (mut map, sink) = make_map(&mixer, "slider_names: \"Master|Chrome\"\n", RefreshTimings::default());

    map.handle_event(&SliderMoveEvent::command(0, SliderCommand::RequestNames));
    map.handle_event(&SliderMoveEvent::command(1, SliderCommand::Increment));
    map.handle_event(&SliderMoveEvent::command(1, SliderCommand::Decrement));

    let expected = DeviceMessage::SliderNames(vec!["Master".into(), "Chrome".into()]);
    assert_eq!(*sink.sent.lock(), vec![expected.clone(), expected.clone(), expected]);
    assert_eq!(mixer.volume_writes(), 0);
}

#[test]
fn test_refresh_releases_previous_generation() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  0: chrome.exe\n", RefreshTimings::default());
    let handles = mixer.live_handles();
    assert_eq!(handles, map.sessions().len());

    map.refresh();
    map.refresh();
    assert_eq!(mixer.live_handles(), handles);

    map.release();
    assert_eq!(mixer.live_handles(), 0);
    assert!(map.sessions_for(0).is_empty());
}

#[test]
fn test_drop_releases_sessions() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");

    let (map, _) = make_map(&mixer, "slider_mapping:\n  0: chrome.exe\n", RefreshTimings::default());
    assert!(mixer.live_handles() > 0);

    drop(map);
    assert_eq!(mixer.live_handles(), 0);
}

#[test]
fn test_exited_process_triggers_refresh() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  0: chrome.exe\n", eager_refresh());
    assert_eq!(map.sessions_for(0).len(), 1);

    mixer.exit_process(100);
    mixer.spawn_process(101, "chrome.exe");
    map.handle_event(&SliderMoveEvent::set(0, 0.5));

    let bound: Vec<_> = map.sessions_for(0).iter().filter_map(|s| s.pid()).collect();
    assert_eq!(bound, vec![101]);

    map.handle_event(&SliderMoveEvent::set(0, 0.5));
    assert_eq!(mixer.process_volume(101), Some(0.5));
}

#[test]
fn test_lazy_refresh_is_rate_limited() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  0: chrome.exe\n", RefreshTimings::default());

    mixer.exit_process(100);
    map.handle_event(&SliderMoveEvent::set(0, 0.5));

    // still the old generation, refreshed less than 5s ago
    let bound: Vec<_> = map.sessions_for(0).iter().filter_map(|s| s.pid()).collect();
    assert_eq!(bound, vec![100]);
}

#[tokio::test(start_paused = true)]
async fn test_forced_refresh_picks_up_new_processes() {
    let mixer = VirtualMixer::with_default_devices();
    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  0: chrome.exe\n", RefreshTimings::default());

    mixer.spawn_process(100, "chrome.exe");
    map.handle_event(&SliderMoveEvent::set(0, 0.5));
    assert_eq!(mixer.process_volume(100), Some(1.0));

    tokio::time::advance(Duration::from_secs(46)).await;

    map.handle_event(&SliderMoveEvent::set(0, 0.5));
    assert_eq!(mixer.process_volume(100), Some(0.5));
}

#[test]
fn test_stale_master_is_replaced() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.add_endpoint("headphones", "Headphones", Direction::Output);

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  0: master\n", eager_refresh());

    mixer.set_default(Direction::Output, "headphones");
    assert!(map.sessions_for(0)[0].is_stale());

    // the stale handle refuses the write and forces a new generation
    map.handle_event(&SliderMoveEvent::set(0, 0.3));
    assert_eq!(mixer.endpoint_volume("speakers"), Some(1.0));
    assert!(!map.sessions_for(0)[0].is_stale());

    map.handle_event(&SliderMoveEvent::set(0, 0.3));
    assert_eq!(mixer.endpoint_volume("headphones"), Some(0.3));
    assert_eq!(mixer.endpoint_volume("speakers"), Some(1.0));
}

#[test]
fn test_failed_refresh_rebinds_kept_sessions() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");
    mixer.spawn_process(200, "spotify.exe");

    let (mut map, _) = make_map(&mixer, "slider_mapping:\n  1: chrome.exe\n", RefreshTimings::default());

    mixer.drop_connection();
    mixer.fail_next_connects(10);
    map.set_config(Arc::new(AppConfig::parse("slider_mapping:\n  1: spotify.exe\n").unwrap()));

    map.handle_event(&SliderMoveEvent::set(1, 0.2));
    assert_eq!(mixer.process_volume(100), Some(1.0));
    assert_eq!(mixer.process_volume(200), Some(0.2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refresh_from_runtime_worker() {
    let mixer = VirtualMixer::with_default_devices();
    mixer.spawn_process(100, "chrome.exe");

    let task_mixer = mixer.clone();
    tokio::spawn(async move {
        let (mut map, _) = make_map(&task_mixer, "slider_mapping:\n  0: chrome.exe\n", RefreshTimings::default());
        map.refresh();
        map.handle_event(&SliderMoveEvent::set(0, 0.4));
    })
    .await
    .unwrap();

    assert_eq!(mixer.process_volume(100), Some(0.4));
    assert_eq!(mixer.live_handles(), 0);
}
