//! SMA Energy Meter to Victron Grid Meter Bridge
//!
//! Listens for the multicast telegrams an SMA energy meter broadcasts, decodes
//! them and publishes the readings on D-Bus as a Victron grid meter so the GX
//! device accepts them.

pub mod attribute_store;
pub mod bus_peer;
pub mod change_notifier;
pub mod config;
pub mod dbus_service;
pub mod frame_decoder;
pub mod grid_meter;
pub mod meter_listener;

// Re-export commonly used types for easier access
pub use attribute_store::{AttributeEntry, AttributeStore, AttributeValue, StoreError};
pub use bus_peer::BusPeer;
pub use change_notifier::{ChangeBatch, ChangeNotifier};
pub use config::Config;
pub use frame_decoder::{decode, DecodeError, MeasurementFrame, PhaseMeasurement};
pub use meter_listener::MeterListener;
