//! A session talking to a simulated device through 20-byte fragments in
//! both directions.

use std::sync::{Arc, Mutex};

use futures::channel::mpsc as fmpsc;
use serde_json::json;

use bitremote_ble::{LineSink, Session, SessionEvent, Settings, WriteError};
use bitremote_proto::device::{Action, Responder, update_line};
use bitremote_proto::{
    Config, ConfigSource, Encoding, Event, LineBuffer, Progress, TRANSPORT_CHUNK_SIZE, WidgetKind,
    fragment_line,
};

#[derive(Clone)]
struct Microbit {
    rx: Arc<Mutex<LineBuffer>>,
    responder: Arc<Mutex<Responder>>,
    to_host: fmpsc::UnboundedSender<Vec<u8>>,
    received: Arc<Mutex<Vec<Event>>>,
}

impl Microbit {
    fn new(source: ConfigSource) -> (Self, fmpsc::UnboundedReceiver<Vec<u8>>) {
        let (to_host, inbound) = fmpsc::unbounded();
        let device = Self {
            rx: Arc::new(Mutex::new(LineBuffer::new())),
            responder: Arc::new(Mutex::new(Responder::new(source))),
            to_host,
            received: Arc::new(Mutex::new(Vec::new())),
        };
        (device, inbound)
    }

    fn notify(&self, line: &str) {
        for chunk in fragment_line(line, TRANSPORT_CHUNK_SIZE) {
            self.to_host.unbounded_send(chunk).unwrap();
        }
    }

    fn received(&self) -> Vec<Event> {
        self.received.lock().unwrap().clone()
    }
}

impl LineSink for Microbit {
    async fn write_line(&self, line: &str) -> Result<(), WriteError> {
        let mut lines = Vec::new();
        {
            let mut rx = self.rx.lock().unwrap();
            for chunk in fragment_line(line, TRANSPORT_CHUNK_SIZE) {
                lines.extend(rx.feed(&chunk));
            }
        }
        for line in lines {
            let action = self.responder.lock().unwrap().handle_line(&line);
            match action {
                Action::Reply(reply) => reply.iter().for_each(|l| self.notify(l)),
                Action::Set(event) => {
                    // Firmware echoes the accepted value back.
                    self.notify(&update_line(&event.id, &event.value));
                    self.received.lock().unwrap().push(event);
                }
                Action::Ignore => {}
            }
        }
        Ok(())
    }
}

fn small_layout() -> String {
    json!({
        "v": 1,
        "title": "Robot",
        "grid": {"w": 12, "h": 8},
        "widgets": [
            {"id": "btn1", "t": "button", "x": 0, "y": 0, "w": 4, "h": 2, "label": "Go"},
            {"id": "sld1", "t": "slider", "x": 0, "y": 2, "w": 12, "h": 2, "max": 255}
        ]
    })
    .to_string()
}

fn large_layout() -> String {
    let widgets: Vec<_> = (0..12)
        .map(|i| json!({"id": format!("gauge{i}"), "t": "gauge", "x": i % 4, "y": i / 4, "w": 3, "h": 2, "label": "Temperatur °C"}))
        .collect();
    json!({"v": 1, "title": "Wetterstation 🌦", "widgets": widgets}).to_string()
}

async fn next_event(events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    loop {
        match events.recv().await.expect("session ended") {
            SessionEvent::Progress(_) => continue,
            other => return other,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn framed_config_round_trip() {
    let json = small_layout();
    let (device, inbound) = Microbit::new(ConfigSource::from_json(json.clone()));
    let (session, mut events) = Session::start(device.clone(), inbound, &Settings::default());

    assert!(session.request_config_after_delay().await);
    match next_event(&mut events).await {
        SessionEvent::Config(config) => {
            assert_eq!(config, Config::from_json(&json).unwrap());
            assert_eq!(config.widget("sld1").unwrap().kind, WidgetKind::Slider);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.config().map(|c| c.title), Some("Robot".to_string()));
}

#[tokio::test(start_paused = true)]
async fn base64_config_round_trip() {
    let json = large_layout();
    let source = ConfigSource::from_json(json.clone()).with_generated_base64();
    assert_eq!(source.encoding(), Encoding::ChunkedBase64);
    let parts = source.base64_parts().len();

    let (device, inbound) = Microbit::new(source);
    let (session, mut events) = Session::start(device, inbound, &Settings::default());
    session.request_config();

    let mut last_progress = None;
    let config = loop {
        match events.recv().await.expect("session ended") {
            SessionEvent::Progress(progress) => last_progress = Some(progress),
            SessionEvent::Config(config) => break config,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(config.title, "Wetterstation 🌦");
    assert_eq!(config.widgets.len(), 12);
    assert_eq!(last_progress, Some(Progress::Chunks { received: parts, expected: parts }));
}

#[tokio::test(start_paused = true)]
async fn set_reaches_device_and_echo_updates_values() {
    let (device, inbound) = Microbit::new(ConfigSource::from_json(small_layout()));
    let (session, mut events) = Session::start(device.clone(), inbound, &Settings::default());

    assert!(session.set("joy1", "180 50"));
    match next_event(&mut events).await {
        SessionEvent::Update(event) => assert_eq!(event, Event::new("joy1", "180 50")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.set("joy1", "0 0"));
    match next_event(&mut events).await {
        SessionEvent::Update(event) => assert_eq!(event, Event::new("joy1", "0 0")),
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(device.received(), vec![Event::new("joy1", "180 50"), Event::new("joy1", "0 0")]);
    assert_eq!(session.value("joy1").as_deref(), Some("0 0"));
}

#[tokio::test(start_paused = true)]
async fn unknown_and_stray_lines_are_ignored() {
    let (device, inbound) = Microbit::new(ConfigSource::from_json(small_layout()));
    let (session, mut events) = Session::start(device.clone(), inbound, &Settings::default());

    device.notify("HELLO from firmware");
    device.notify("CFGB64 3 eyJ0");
    device.notify("CFGEND");
    device.notify("UPD lbl1 still here");

    match next_event(&mut events).await {
        SessionEvent::Update(event) => assert_eq!(event, Event::new("lbl1", "still here")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn legacy_base64_framing() {
    let json = small_layout();
    let (device, inbound) = Microbit::new(ConfigSource::from_json(json.clone()));
    let (_session, mut events) = Session::start(device.clone(), inbound, &Settings::default());

    device.notify("CFGBEGIN");
    for part in bitremote_proto::chunk_base64(&json, 18) {
        device.notify(&format!("CFG {part}"));
    }
    device.notify("CFGEND");

    match next_event(&mut events).await {
        SessionEvent::Config(config) => assert_eq!(config, Config::from_json(&json).unwrap()),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn bad_config_keeps_session_alive() {
    let (device, inbound) = Microbit::new(ConfigSource::from_json(small_layout()));
    let (session, mut events) = Session::start(device.clone(), inbound, &Settings::default());

    device.notify("CFGB64BEGIN 1 4");
    device.notify("CFGB64 0 !!!!");
    device.notify("CFGB64END");
    assert!(matches!(next_event(&mut events).await, SessionEvent::ConfigError(_)));

    device.notify("UPD sld1 99");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Update(_)));

    // A fresh request still works after the failed transfer.
    session.request_config();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn device_going_away_is_reported_once() {
    let (device, inbound) = Microbit::new(ConfigSource::from_json(small_layout()));
    let (session, mut events) = Session::start(device.clone(), inbound, &Settings::default());

    device.to_host.close_channel();
    assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected { error: None })));
    assert!(!session.is_connected());
    assert!(!session.set("btn1", "1"));
}
