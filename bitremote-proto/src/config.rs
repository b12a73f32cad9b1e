//! Remote layout: the JSON document a device serves in answer to `GETCFG`

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ConfigDecodeError;

/// A decoded layout.
///
/// ```json
/// { "v": 1, "title": "Robot", "grid": {"w": 12, "h": 8},
///   "widgets": [ {"id": "sld1", "t": "slider", "x": 0, "y": 2, "w": 12, "h": 2, "max": 255} ] }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u32>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<Grid>,
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetSpec {
    pub id: String,
    #[serde(rename = "t")]
    pub kind: WidgetKind,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub w: i32,
    #[serde(default)]
    pub h: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Type-specific properties (`min`, `max`, `colorOn`, `series`, ...),
    /// kept as-is so unknown keys survive a round trip.
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

/// Widget type discriminant (the `t` field).
///
/// The short names emitted by hand-written firmware (`btn`, `sld`, ...) map
/// onto the same kinds; anything unrecognised is kept as [`WidgetKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WidgetKind {
    Button,
    Slider,
    Toggle,
    Led,
    Joystick,
    Label,
    Gauge,
    Graph,
    Dpad,
    XyPad,
    Battery,
    Timer,
    Image,
    Other(String),
}

impl WidgetKind {
    pub fn as_str(&self) -> &str {
        match self {
            WidgetKind::Button => "button",
            WidgetKind::Slider => "slider",
            WidgetKind::Toggle => "toggle",
            WidgetKind::Led => "led",
            WidgetKind::Joystick => "joystick",
            WidgetKind::Label => "label",
            WidgetKind::Gauge => "gauge",
            WidgetKind::Graph => "graph",
            WidgetKind::Dpad => "dpad",
            WidgetKind::XyPad => "xypad",
            WidgetKind::Battery => "battery",
            WidgetKind::Timer => "timer",
            WidgetKind::Image => "image",
            WidgetKind::Other(name) => name,
        }
    }
}

impl From<String> for WidgetKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "button" | "btn" => WidgetKind::Button,
            "slider" | "sld" => WidgetKind::Slider,
            "toggle" | "tgl" => WidgetKind::Toggle,
            "led" => WidgetKind::Led,
            "joystick" | "joy" => WidgetKind::Joystick,
            "label" | "txt" => WidgetKind::Label,
            "gauge" | "g" => WidgetKind::Gauge,
            "graph" => WidgetKind::Graph,
            "dpad" => WidgetKind::Dpad,
            "xypad" => WidgetKind::XyPad,
            "battery" => WidgetKind::Battery,
            "timer" => WidgetKind::Timer,
            "image" => WidgetKind::Image,
            _ => WidgetKind::Other(name),
        }
    }
}

impl From<WidgetKind> for String {
    fn from(kind: WidgetKind) -> Self {
        match kind {
            WidgetKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliderRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaugeScale {
    pub min: f64,
    pub max: f64,
    pub decimals: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphOptions {
    /// Number of comma-separated values per update, 1..=10
    pub series: u32,
    pub window_secs: f64,
    pub auto_scale: bool,
}

impl WidgetSpec {
    pub fn number(&self, key: &str) -> Option<f64> {
        self.props.get(key)?.as_f64()
    }

    /// Slider bounds, defaulting to 0..=100 in steps of 1.
    pub fn slider_range(&self) -> Option<SliderRange> {
        (self.kind == WidgetKind::Slider).then(|| SliderRange {
            min: self.number("min").unwrap_or(0.0),
            max: self.number("max").unwrap_or(100.0),
            step: self.number("step").unwrap_or(1.0),
        })
    }

    pub fn gauge_scale(&self) -> Option<GaugeScale> {
        (self.kind == WidgetKind::Gauge).then(|| GaugeScale {
            min: self.number("min").unwrap_or(0.0),
            max: self.number("max").unwrap_or(100.0),
            decimals: self.number("decimals").map_or(1, |d| d.max(0.0) as u32),
        })
    }

    pub fn graph_options(&self) -> Option<GraphOptions> {
        (self.kind == WidgetKind::Graph).then(|| GraphOptions {
            series: self.number("series").map_or(1, |s| s.clamp(1.0, 10.0) as u32),
            window_secs: self.number("windowSec").unwrap_or(30.0),
            auto_scale: self.props.get("autoScale").and_then(Value::as_bool).unwrap_or(true),
        })
    }
}

impl Config {
    /// Parse and validate a JSON layout.
    pub fn from_json(json: &str) -> Result<Self, ConfigDecodeError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Compact JSON, never containing a raw newline.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Widget ids key live values, so they must be unique.
    pub fn validate(&self) -> Result<(), ConfigDecodeError> {
        let mut seen = HashSet::new();
        for widget in &self.widgets {
            if !seen.insert(widget.id.as_str()) {
                return Err(ConfigDecodeError::DuplicateWidgetId(widget.id.clone()));
            }
        }
        Ok(())
    }

    pub fn widget(&self, id: &str) -> Option<&WidgetSpec> {
        self.widgets.iter().find(|w| w.id == id)
    }
}
