//! Tasmota device layer
//!
//! This crate keeps the in-memory device state for Tasmota devices seen
//! on the bus and exposes the command surface used by automations.

pub mod device;
pub mod ingest;
pub mod network;
pub mod persistence;
pub mod store;

pub use device::{ArmedTimer, Device, DeviceId};
pub use network::{NetworkError, TasmotaNetwork};
pub use store::{DeviceEvent, DeviceStore};
