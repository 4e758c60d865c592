//! Runtime events consumed by the automation engine.
//!
//! Events arrive from external sources (lifecycle monitor, custom event
//! tracking, geofencing, screen tracking) and are matched against triggers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::automation::TriggerType;

/// Events the automation engine reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationEvent {
    /// A custom application event was tracked.
    Custom(CustomEvent),
    /// A region boundary was crossed.
    Region(RegionEvent),
    /// A screen was viewed.
    ScreenView {
        /// Screen name.
        screen: String,
    },
    /// The application moved to the foreground.
    Foreground,
    /// The application moved to the background.
    Background,
    /// The application finished initializing.
    AppInit,
}

impl AutomationEvent {
    /// Create a custom event with only a name.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(CustomEvent::new(name))
    }

    /// Create a region enter event.
    pub fn region_enter(region_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::Region(RegionEvent::new(region_id, source, BoundaryEvent::Enter))
    }

    /// Create a region exit event.
    pub fn region_exit(region_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::Region(RegionEvent::new(region_id, source, BoundaryEvent::Exit))
    }

    /// Create a screen view event.
    pub fn screen(screen: impl Into<String>) -> Self {
        Self::ScreenView {
            screen: screen.into(),
        }
    }

    /// Get the event type as a string for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Custom(_) => "custom_event",
            Self::Region(e) => match e.boundary_event {
                BoundaryEvent::Enter => "region_enter",
                BoundaryEvent::Exit => "region_exit",
            },
            Self::ScreenView { .. } => "screen_view",
            Self::Foreground => "foreground",
            Self::Background => "background",
            Self::AppInit => "app_init",
        }
    }

    /// Trigger types that can be advanced by this event.
    pub fn trigger_types(&self) -> &'static [TriggerType] {
        match self {
            Self::Custom(_) => &[TriggerType::CustomEventCount, TriggerType::CustomEventValue],
            Self::Region(e) => match e.boundary_event {
                BoundaryEvent::Enter => &[TriggerType::RegionEnter],
                BoundaryEvent::Exit => &[TriggerType::RegionExit],
            },
            Self::ScreenView { .. } => &[TriggerType::ScreenView],
            Self::Foreground => &[TriggerType::Foreground],
            Self::Background => &[TriggerType::Background],
            Self::AppInit => &[TriggerType::AppInit],
        }
    }

    /// Numeric value carried by the event, if any.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Custom(e) => e.value,
            _ => None,
        }
    }

    /// JSON view of the event used for predicate evaluation.
    pub fn payload(&self) -> Value {
        match self {
            Self::Custom(e) => e.payload(),
            Self::Region(e) => e.payload(),
            Self::ScreenView { screen } => json!({ "screen": screen }),
            Self::Foreground | Self::Background | Self::AppInit => Value::Object(Map::new()),
        }
    }
}

/// A custom application event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    /// Event name
    pub name: String,
    /// Optional numeric value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Interaction ID (e.g. a message or screen id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    /// Interaction type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_type: Option<String>,
    /// Arbitrary properties
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    /// When the event occurred
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CustomEvent {
    /// Create a new custom event.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            interaction_id: None,
            interaction_type: None,
            properties: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder method to set the event value
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Builder method to set the interaction
    pub fn with_interaction(
        mut self,
        interaction_type: impl Into<String>,
        interaction_id: impl Into<String>,
    ) -> Self {
        self.interaction_type = Some(interaction_type.into());
        self.interaction_id = Some(interaction_id.into());
        self
    }

    /// Builder method to add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn payload(&self) -> Value {
        let mut map = Map::new();
        map.insert("event_name".into(), Value::from(self.name.clone()));
        if let Some(value) = self.value {
            map.insert("event_value".into(), Value::from(value));
        }
        if let Some(id) = &self.interaction_id {
            map.insert("interaction_id".into(), Value::from(id.clone()));
        }
        if let Some(kind) = &self.interaction_type {
            map.insert("interaction_type".into(), Value::from(kind.clone()));
        }
        if !self.properties.is_empty() {
            let properties: Map<String, Value> = self
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.insert("properties".into(), Value::Object(properties));
        }
        Value::Object(map)
    }
}

impl From<CustomEvent> for AutomationEvent {
    fn from(event: CustomEvent) -> Self {
        Self::Custom(event)
    }
}

/// Direction of a region boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryEvent {
    Enter,
    Exit,
}

/// A region boundary crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionEvent {
    /// Region identifier
    pub region_id: String,
    /// Source that detected the crossing
    pub source: String,
    /// Enter or exit
    pub boundary_event: BoundaryEvent,
    /// Proximity (beacon) details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proximity: Option<ProximityRegion>,
    /// Circular region details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circular_region: Option<CircularRegion>,
}

impl RegionEvent {
    /// Create a new region event.
    pub fn new(
        region_id: impl Into<String>,
        source: impl Into<String>,
        boundary_event: BoundaryEvent,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            source: source.into(),
            boundary_event,
            proximity: None,
            circular_region: None,
        }
    }

    /// Builder method to attach proximity details
    pub fn with_proximity(mut self, proximity: ProximityRegion) -> Self {
        self.proximity = Some(proximity);
        self
    }

    /// Builder method to attach circular region details
    pub fn with_circular_region(mut self, region: CircularRegion) -> Self {
        self.circular_region = Some(region);
        self
    }

    fn payload(&self) -> Value {
        let mut map = Map::new();
        map.insert("region_id".into(), Value::from(self.region_id.clone()));
        map.insert("source".into(), Value::from(self.source.clone()));
        let boundary = match self.boundary_event {
            BoundaryEvent::Enter => "enter",
            BoundaryEvent::Exit => "exit",
        };
        map.insert("boundary_event".into(), Value::from(boundary));
        if let Some(proximity) = &self.proximity {
            map.insert("proximity".into(), proximity.payload());
        }
        if let Some(circular) = &self.circular_region {
            map.insert("circular_region".into(), circular.payload());
        }
        Value::Object(map)
    }
}

/// Beacon proximity region details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityRegion {
    pub proximity_id: String,
    pub major: i64,
    pub minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl ProximityRegion {
    /// Create proximity details without coordinates.
    pub fn new(proximity_id: impl Into<String>, major: i64, minor: i64) -> Self {
        Self {
            proximity_id: proximity_id.into(),
            major,
            minor,
            rssi: None,
            latitude: None,
            longitude: None,
        }
    }

    /// Builder method to set coordinates
    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    fn payload(&self) -> Value {
        let mut map = Map::new();
        map.insert("proximity_id".into(), Value::from(self.proximity_id.clone()));
        map.insert("major".into(), Value::from(self.major));
        map.insert("minor".into(), Value::from(self.minor));
        if let Some(rssi) = self.rssi {
            map.insert("rssi".into(), Value::from(rssi));
        }
        if let Some(lat) = self.latitude {
            map.insert("latitude".into(), Value::from(lat));
        }
        if let Some(lng) = self.longitude {
            map.insert("longitude".into(), Value::from(lng));
        }
        Value::Object(map)
    }
}

/// Circular geofence details.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircularRegion {
    pub radius: f64,
    pub latitude: f64,
    pub longitude: f64,
}

impl CircularRegion {
    fn payload(&self) -> Value {
        json!({
            "radius": self.radius,
            "latitude": self.latitude,
            "longitude": self.longitude,
        })
    }
}
