//! End-to-end tests: a registry with emulated drivers, driven through
//! real pin links.

use pin_hub::client::{Gesture, SwitchClient, ValueClient};
use pin_hub::config::ControllerConfig;
use pin_hub::driver::EmulatedBank;
use pin_hub::error::{DriverError, PinError};
use pin_hub::link::PinLink;
use pin_hub::message::{
    LinkEvent, PinFlavour, RegisterRequest, SwitchPhase, Value, WriteRequest, WriteValue,
};
use pin_hub::pin::registry::PinRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CAPS: &str = r#"
types: [din, dout, pwm]
pins:
  "4": { din: {} }
  "5": { din: {}, dout: {} }
  "17": { dout: {} }
  "18": { pwm: { steps: 100 }, dout: {} }
"#;

fn driver_hub() -> (Arc<EmulatedBank>, PinRegistry) {
    let config: ControllerConfig = serde_yaml::from_str(CAPS).unwrap();
    let bank = Arc::new(EmulatedBank::new(&["din", "dout", "pwm"]));
    let hub = PinRegistry::start("test", &config, bank.clone());
    (bank, hub)
}

fn dummy_hub() -> PinRegistry {
    let mut config: ControllerConfig = serde_yaml::from_str(CAPS).unwrap();
    config.dummy = true;
    let bank = Arc::new(EmulatedBank::new(&["din", "dout", "pwm"]));
    PinRegistry::start("test", &config, bank)
}

fn request(index: &str, pin_type: &str, flavour: PinFlavour) -> RegisterRequest {
    let mut req = RegisterRequest::new(index, pin_type);
    req.flavour = flavour;
    req
}

async fn next_event(link: &mut PinLink) -> LinkEvent {
    timeout(Duration::from_secs(1), link.recv())
        .await
        .expect("timed out waiting for a link event")
        .expect("link closed while waiting for an event")
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn plain_pin_write_roundtrip() {
    let (bank, hub) = driver_hub();
    let (mut link, info) = hub
        .register(request("5", "din", PinFlavour::Plain))
        .await
        .unwrap();
    assert_eq!(info.value, Value::Raw(0));
    assert!(!info.confirm);

    link.write(WriteRequest::bool(true)).await.unwrap();
    match next_event(&mut link).await {
        LinkEvent::Update { value, .. } => assert_eq!(value, Value::Raw(1)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(bank.pin("5").writes(), vec![1]);
    assert_eq!(hub.state().pins["5"].raw, Some(1));
}

#[tokio::test]
async fn open_publishes_the_registration() {
    let hub = dummy_hub();
    let mut req = request("18", "pwm", PinFlavour::Light);
    req.caption = Some("ceiling".into());
    req.entry = Some("lr-1".into());
    let (_link, info) = hub.register(req).await.unwrap();

    assert_eq!(info.value, Value::Level(0.0));
    assert_eq!(info.caps.steps, Some(100));

    let pin = hub.state().pins["18"].clone();
    assert_eq!(pin.pin_type.as_deref(), Some("pwm"));
    assert_eq!(pin.flavour, Some(PinFlavour::Light));
    assert_eq!(pin.caption.as_deref(), Some("ceiling"));
    assert_eq!(pin.entry.as_deref(), Some("lr-1"));
    assert_eq!(pin.dummy, Some(true));
    assert_eq!(pin.raw, Some(0));
    assert_eq!(pin.value, Some(Value::Level(0.0)));
    assert!(pin.at.is_some());
}

#[tokio::test]
async fn dout_requires_confirmed_write() {
    let (bank, hub) = driver_hub();
    let mut req = request("17", "dout", PinFlavour::Dout);
    req.confirm = true;
    let (link, info) = hub.register(req).await.unwrap();
    assert!(info.confirm);

    let err = link.write(WriteRequest::bool(true)).await;
    assert!(matches!(err, Err(PinError::InvalidArgs(_))));
    assert!(bank.pin("17").writes().is_empty());

    let mut confirmed = WriteRequest::bool(true);
    confirmed.confirmed = true;
    link.write(confirmed).await.unwrap();
    assert_eq!(bank.pin("17").writes(), vec![1]);
}

#[tokio::test]
async fn tri_drives_requested_value_before_open() {
    let (bank, hub) = driver_hub();
    let mut req = request("17", "dout", PinFlavour::Tri);
    req.write = Some(1);
    let (link, info) = hub.register(req).await.unwrap();

    // The initial drive happened before the link opened.
    assert_eq!(info.value, Value::Raw(1));
    assert_eq!(bank.pin("17").writes(), vec![1]);
    assert_eq!(hub.state().pins["17"].raw, Some(1));

    link.write(WriteRequest::num(-1.0)).await.unwrap();
    assert_eq!(bank.pin("17").writes(), vec![1, -1]);
    assert_eq!(hub.state().pins["17"].value, Some(Value::Raw(-1)));
}

#[tokio::test]
async fn tri_skips_matching_initial_value() {
    let (bank, hub) = driver_hub();
    let mut req = request("5", "dout", PinFlavour::Tri);
    req.write = Some(0);
    let (_link, info) = hub.register(req).await.unwrap();

    assert_eq!(info.value, Value::Raw(0));
    assert!(bank.pin("5").writes().is_empty());
}

#[tokio::test]
async fn switch_reports_taps() {
    let hub = dummy_hub();
    let mut req = request("4", "din", PinFlavour::Switch);
    req.debounce = Some(5);
    req.tap = Some(400);
    let (link, info) = hub.register(req).await.unwrap();
    let mut switch = SwitchClient::new(link, &info);
    assert_eq!(switch.phase(), SwitchPhase::Released);

    for expected in 1..=2u32 {
        hub.emulate("4", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.emulate("4", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(switch.gesture().await, Some(Gesture::Press { .. })));
        assert_eq!(switch.phase(), SwitchPhase::Pressed);
        assert!(matches!(
            switch.gesture().await,
            Some(Gesture::Release { .. })
        ));
        match switch.gesture().await {
            Some(Gesture::Tap { count, .. }) => assert_eq!(count, expected),
            other => panic!("expected a tap, got {:?}", other),
        }
        assert_eq!(switch.phase(), SwitchPhase::Released);
    }

    let pin = hub.state().pins["4"].clone();
    assert_eq!(pin.value, Some(Value::Phase(SwitchPhase::Released)));
    assert_eq!(pin.raw, Some(1));
}

#[tokio::test]
async fn switch_hold_suppresses_tap() {
    let hub = dummy_hub();
    let mut req = request("4", "din", PinFlavour::Switch);
    req.debounce = Some(0);
    req.hold = Some(40);
    let (link, info) = hub.register(req).await.unwrap();
    let mut switch = SwitchClient::new(link, &info);

    hub.emulate("4", 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    hub.emulate("4", 1).await.unwrap();

    assert!(matches!(switch.gesture().await, Some(Gesture::Press { .. })));
    assert!(matches!(switch.gesture().await, Some(Gesture::Hold { .. })));
    assert!(matches!(
        switch.gesture().await,
        Some(Gesture::Release { .. })
    ));

    // A quick cycle after the hold starts a fresh tap count.
    hub.emulate("4", 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    hub.emulate("4", 1).await.unwrap();

    assert!(matches!(switch.gesture().await, Some(Gesture::Press { .. })));
    assert!(matches!(
        switch.gesture().await,
        Some(Gesture::Release { .. })
    ));
    match switch.gesture().await {
        Some(Gesture::Tap { count, .. }) => assert_eq!(count, 1),
        other => panic!("expected a tap, got {:?}", other),
    }
}

#[tokio::test]
async fn light_dims_to_target() {
    let (bank, hub) = driver_hub();
    let (link, info) = hub
        .register(request("18", "pwm", PinFlavour::Light))
        .await
        .unwrap();
    let mut light = ValueClient::new(link, &info);

    light.write(WriteRequest::dim(0.5, 400)).await.unwrap();

    // Transition start: old level, the aim and the planned duration.
    assert_eq!(light.changed().await, Some(Value::Level(0.0)));
    assert_eq!(light.aim(), Some(0.5));
    assert_eq!(light.time(), Some(200));
    let mid = hub.state().pins["18"].clone();
    assert_eq!(mid.aim, Some(0.5));
    assert_eq!(mid.raim, Some(25));
    assert_eq!(mid.time, Some(200));

    // Convergence publishes the exact target.
    assert_eq!(light.changed().await, Some(Value::Level(0.5)));
    assert_eq!(light.aim(), None);

    wait_until("dim writes to finish", || {
        bank.pin("18").writes().last() == Some(&25)
    })
    .await;
    let writes = bank.pin("18").writes();
    assert!(writes.windows(2).all(|w| w[0] < w[1]));

    let pin = hub.state().pins["18"].clone();
    assert_eq!(pin.raw, Some(25));
    assert_eq!(pin.value, Some(Value::Level(0.5)));
    assert_eq!(pin.aim, None);

    // Nothing keeps writing after convergence.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(bank.pin("18").writes(), writes);
}

#[tokio::test]
async fn light_stop_freezes_transition() {
    let (bank, hub) = driver_hub();
    let (link, info) = hub
        .register(request("18", "pwm", PinFlavour::Light))
        .await
        .unwrap();
    let light = ValueClient::new(link, &info);

    light.write(WriteRequest::dim(1.0, 2000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stop = WriteRequest {
        value: WriteValue::Text("stop".into()),
        ..WriteRequest::default()
    };
    light.write(stop).await.unwrap();

    wait_until("stop to settle", || {
        let pin = hub.state().pins["18"].clone();
        pin.aim.is_none()
            && matches!(pin.value, Some(Value::Level(level)) if level > 0.0 && level < 0.5)
    })
    .await;

    // Let any step already queued at the driver land first.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let frozen = bank.pin("18").writes();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(bank.pin("18").writes(), frozen);
}

#[tokio::test]
async fn light_immediate_write_snaps() {
    let (bank, hub) = driver_hub();
    let (mut link, _info) = hub
        .register(request("18", "pwm", PinFlavour::Light))
        .await
        .unwrap();

    link.write(WriteRequest::num(1.0)).await.unwrap();
    match next_event(&mut link).await {
        LinkEvent::Update { value, aim, .. } => {
            assert_eq!(value, Value::Level(1.0));
            assert_eq!(aim, None);
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_until("full-scale write", || bank.pin("18").writes() == vec![100]).await;

    // Levels inside the bottom snap zone collapse to raw 0.
    link.write(WriteRequest::num(0.03)).await.unwrap();
    wait_until("snap to zero", || bank.pin("18").writes() == vec![100, 0]).await;
    let pin = hub.state().pins["18"].clone();
    assert_eq!(pin.raw, Some(0));
    assert_eq!(pin.value, Some(Value::Level(0.03)));
}

#[tokio::test]
async fn light_same_raw_write_updates_client() {
    let hub = dummy_hub();
    let (mut link, info) = hub
        .register(request("18", "pwm", PinFlavour::Light))
        .await
        .unwrap();
    assert_eq!(info.value, Value::Level(0.0));

    // 0.03 quantizes to raw 0, same as the current value.
    link.write(WriteRequest::num(0.03)).await.unwrap();
    match next_event(&mut link).await {
        LinkEvent::Update { value, aim, .. } => {
            assert_eq!(value, Value::Level(0.03));
            assert_eq!(aim, None);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let pin = hub.state().pins["18"].clone();
    assert_eq!(pin.raw, Some(0));
    assert_eq!(pin.value, Some(Value::Level(0.03)));
}

#[tokio::test]
async fn light_rejects_bad_levels() {
    let hub = dummy_hub();
    let (link, _info) = hub
        .register(request("18", "pwm", PinFlavour::Light))
        .await
        .unwrap();

    let err = link.write(WriteRequest::num(1.5)).await;
    assert!(matches!(err, Err(PinError::InvalidArgs(_))));
    let err = link
        .write(WriteRequest {
            value: WriteValue::Text("warm".into()),
            ..WriteRequest::default()
        })
        .await;
    assert!(matches!(err, Err(PinError::InvalidArgs(_))));

    assert_eq!(hub.state().pins["18"].value, Some(Value::Level(0.0)));
}

#[tokio::test]
async fn light_on_plain_output_switches_binary() {
    let (bank, hub) = driver_hub();
    let (mut link, info) = hub
        .register(request("18", "dout", PinFlavour::Light))
        .await
        .unwrap();
    assert_eq!(info.value, Value::Raw(0));

    link.write(WriteRequest::bool(true)).await.unwrap();
    match next_event(&mut link).await {
        LinkEvent::Update { value, .. } => assert_eq!(value, Value::Raw(1)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(bank.pin("18").writes(), vec![1]);
    // Still listed under the requested flavour.
    assert_eq!(hub.state().pins["18"].flavour, Some(PinFlavour::Light));
}

#[tokio::test]
async fn counter_throttles_updates() {
    let hub = dummy_hub();
    let mut req = request("4", "din", PinFlavour::Counter);
    req.throttle = Some(40);
    let (link, info) = hub.register(req).await.unwrap();
    assert_eq!(info.value, Value::Count(0));
    let mut counter = ValueClient::new(link, &info);

    // The first edge reports immediately.
    hub.emulate("4", 1).await.unwrap();
    assert_eq!(counter.changed().await, Some(Value::Count(1)));

    // Edges inside the throttle window ride the trailing flush.
    hub.emulate("4", 0).await.unwrap();
    hub.emulate("4", 1).await.unwrap();
    assert_eq!(counter.changed().await, Some(Value::Count(2)));

    let pin = hub.state().pins["4"].clone();
    assert_eq!(pin.value, Some(Value::Count(2)));
    assert_eq!(pin.raw, Some(1));
}

#[tokio::test]
async fn closing_link_retains_history() {
    let hub = dummy_hub();
    let (mut link, _info) = hub
        .register(request("4", "din", PinFlavour::Plain))
        .await
        .unwrap();

    hub.emulate("4", 7).await.unwrap();
    assert!(matches!(
        next_event(&mut link).await,
        LinkEvent::Update { .. }
    ));

    link.close().await;
    wait_until("registration to clear", || {
        hub.state().pins["4"].pin_type.is_none()
    })
    .await;

    let pin = hub.state().pins["4"].clone();
    assert_eq!(pin.raw, Some(7));
    assert_eq!(pin.value, Some(Value::Raw(7)));
    assert!(pin.at.is_some());

    // Emulated values for an unregistered pin are dropped.
    hub.emulate("4", 3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(hub.state().pins["4"].raw, Some(7));
}

#[tokio::test]
async fn dropping_link_releases_driver() {
    let (bank, hub) = driver_hub();
    let (link, _info) = hub
        .register(request("5", "din", PinFlavour::Plain))
        .await
        .unwrap();
    assert!(!bank.pin("5").released());

    drop(link);
    wait_until("driver release", || bank.pin("5").released()).await;
    assert!(hub.state().pins["5"].pin_type.is_none());
}

#[tokio::test]
async fn setup_failure_rejects_registration() {
    let (bank, hub) = driver_hub();
    bank.pin("4").fail_next(DriverError::Io("gone".into()));

    let err = hub.register(request("4", "din", PinFlavour::Plain)).await;
    assert!(matches!(err, Err(PinError::Driver(DriverError::Io(_)))));

    wait_until("driver release", || bank.pin("4").released()).await;
    // A registration that never opened leaves nothing behind.
    assert!(!hub.state().pins.contains_key("4"));
}

#[tokio::test]
async fn write_failure_keeps_registration() {
    let (bank, hub) = driver_hub();
    let (link, _info) = hub
        .register(request("17", "dout", PinFlavour::Plain))
        .await
        .unwrap();

    bank.pin("17").fail_next(DriverError::Io("flaky".into()));
    let err = link.write(WriteRequest::bool(true)).await;
    assert!(matches!(err, Err(PinError::Driver(DriverError::Io(_)))));
    assert_eq!(hub.state().pins["17"].pin_type.as_deref(), Some("dout"));

    link.write(WriteRequest::bool(false)).await.unwrap();
    assert_eq!(bank.pin("17").writes(), vec![0]);
}

#[tokio::test]
async fn read_all_polls_drivers() {
    let (bank, hub) = driver_hub();
    let (mut link, _info) = hub
        .register(request("5", "din", PinFlavour::Plain))
        .await
        .unwrap();

    // The hardware moved behind the registry's back.
    bank.pin("5").set_value(1);
    hub.read_all().await.unwrap();

    match next_event(&mut link).await {
        LinkEvent::Update { value, .. } => assert_eq!(value, Value::Raw(1)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(hub.state().pins["5"].raw, Some(1));
}

#[tokio::test]
async fn read_all_resets_dummy_pins() {
    let hub = dummy_hub();
    let (mut link, _info) = hub
        .register(request("5", "din", PinFlavour::Plain))
        .await
        .unwrap();

    hub.emulate("5", 4).await.unwrap();
    assert!(matches!(
        next_event(&mut link).await,
        LinkEvent::Update { .. }
    ));

    hub.read_all().await.unwrap();
    match next_event(&mut link).await {
        LinkEvent::Update { value, .. } => assert_eq!(value, Value::Raw(0)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(hub.state().pins["5"].raw, Some(0));
}

#[tokio::test]
async fn shutdown_closes_links() {
    let hub = dummy_hub();
    let (mut link, _info) = hub
        .register(request("4", "din", PinFlavour::Plain))
        .await
        .unwrap();

    hub.shutdown().await;
    assert_eq!(link.recv().await, Some(LinkEvent::Closed));

    let err = hub.register(request("5", "din", PinFlavour::Plain)).await;
    assert!(matches!(err, Err(PinError::RegistryClosed)));
}
