//! meshlab: OpenThread mesh lab automation
//!
//! Drives OpenThread nodes over SSH, runs measurement sweeps across the
//! formed mesh and publishes link telemetry over MQTT.

#![allow(async_fn_in_trait)] // sessions are only used through generics within this crate

pub mod config;
pub mod experiment;
pub mod logging;
pub mod mqtt;
pub mod node;
pub mod ntp;
pub mod poll;
pub mod session;
pub mod ssh;
pub mod telemetry;
pub mod wpanctl;
