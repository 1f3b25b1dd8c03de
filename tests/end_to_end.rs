use async_trait::async_trait;
use light_scheduler::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(Instant, DeviceRequest)>>,
}

#[async_trait]
impl DeviceInterface for Recorder {
    async fn send(&self, request: &DeviceRequest) -> Result<()> {
        self.sent.lock().push((Instant::now(), request.clone()));
        Ok(())
    }
}

const CONFIG: &str = r#"
dispatch_interval_ms: 100
groups:
  bedroom: ["bed-1"]
  hall: ["hall-1"]
schedules:
  base:
    elements:
      - name: Wake
        group: bedroom
        days: weekdays
        on: "06:30"
        off: "06:32"
        ramp_minutes: 1
        color_temperature: 370
      - name: Hall
        group: hall
        days: all
        on: "06:30"
  late:
    inherits: base
    elements:
      - name: Wake
        group: bedroom
        days: weekdays
        on: "07:30"
  broken:
    inherits: nowhere
"#;

/// Monday 06:29:50
fn monday_morning() -> WeekTime {
    WeekTime::new(100, SECONDS_PER_DAY + 6 * 3600 + 29 * 60 + 50)
}

#[tokio::test(start_paused = true)]
async fn scheduled_ramp_reaches_fixture_in_order() {
    let config = AppConfig::from_yaml_str(CONFIG).unwrap();
    let compilation = compile(&config.schedules, &config.groups);
    assert!(compilation.failures.contains_key("broken"));
    assert_eq!(compilation.queues.len(), 2);

    let device = Arc::new(Recorder::default());
    let (dispatcher, commands) = Dispatcher::new(device.clone(), config.dispatch_interval());
    commands.set_connected(true);
    tokio::spawn(dispatcher.run());

    let clock = Arc::new(TokioClock::starting_at(monday_morning()));
    let (triggers_tx, mut triggers) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(compilation.queues, clock, triggers_tx);
    scheduler.activate("base").unwrap();
    tokio::spawn(scheduler.run());

    let started = Instant::now();
    let mut fired = Vec::new();
    while fired.len() < 3 {
        let trigger = triggers.recv().await.unwrap();
        fired.push(trigger.label.clone());
        commands.enqueue(trigger.command).unwrap();
    }
    assert_eq!(fired, vec!["Wake on", "Hall on", "Wake off"]);
    commands.wait_idle(Duration::from_millis(100)).await;

    let sent = device.sent.lock().clone();
    let bedroom: Vec<&DeviceRequest> = sent
        .iter()
        .map(|(_, r)| r)
        .filter(|r| r.target_ids == ["bed-1"])
        .collect();

    // initial on at brightness 1, 253 single steps, then off
    assert_eq!(bedroom.len(), 1 + 253 + 1);
    assert_eq!(bedroom[0].on, Some(true));
    assert_eq!(bedroom[0].brightness, Some(1));
    assert_eq!(bedroom[0].color_temperature, Some(370));
    let steps: Vec<u8> = bedroom[1..254].iter().filter_map(|r| r.brightness).collect();
    assert_eq!(steps, (2..=254).collect::<Vec<u8>>());
    assert_eq!(bedroom[254].on, Some(false));

    // the hall command goes out right behind the ramp's initial command
    assert_eq!(sent[1].1.target_ids, vec!["hall-1"]);

    // nothing faster than the dispatch interval
    for pair in sent.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= config.dispatch_interval());
    }

    // the ramp started on the first dispatch tick at or after 06:30:00
    let ramp_start = sent[0].0 - started;
    assert!(ramp_start >= Duration::from_secs(10));
    assert!(ramp_start <= Duration::from_secs(10) + config.dispatch_interval());
    assert_eq!(commands.active_ramps(), 0);
}

#[tokio::test(start_paused = true)]
async fn inherited_schedule_overrides_wake_time() {
    let config = AppConfig::from_yaml_str(CONFIG).unwrap();
    let compilation = compile(&config.schedules, &config.groups);

    let clock = Arc::new(TokioClock::starting_at(monday_morning()));
    let (triggers_tx, mut triggers) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(compilation.queues, clock, triggers_tx);
    scheduler.activate("late").unwrap();
    tokio::spawn(scheduler.run());

    let mut fired = Vec::new();
    for _ in 0..3 {
        let trigger = triggers.recv().await.unwrap();
        fired.push((trigger.label, trigger.due.offset));
    }
    let monday = SECONDS_PER_DAY;
    assert_eq!(
        fired,
        vec![
            ("Hall on".to_string(), monday + 6 * 3600 + 30 * 60),
            ("Wake on".to_string(), monday + 7 * 3600 + 30 * 60),
            ("Hall on".to_string(), 2 * monday + 6 * 3600 + 30 * 60),
        ]
    );
}
