//! Event system feeding the automation engine
//!
//! This module provides:
//! - Event types (custom events, region crossings, screen views, lifecycle)
//! - Event bus for internal pub/sub

mod bus;
mod event;

pub use bus::{EventBus, EventSink, EventSubscriber, SinkId, DEFAULT_CAPACITY};
pub use event::{
    AutomationEvent, BoundaryEvent, CircularRegion, CustomEvent, ProximityRegion, RegionEvent,
};
