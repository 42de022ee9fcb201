// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # uapub - OPC UA PubSub runtime
//!
//! A pure Rust implementation of the OPC UA Part 14 PubSub protocol:
//! periodic publishing of structured industrial data as UADP or JSON
//! NetworkMessages over UDP multicast, Ethernet frames or MQTT, with
//! optional message signing and encryption.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uapub::eventloop::DefaultEventLoop;
//! use uapub::host::MemoryAddressSpace;
//! use uapub::pubsub::*;
//! use uapub::transport::udp::UdpConnectionManager;
//! use uapub::types::{NodeId, Variant};
//!
//! fn main() -> uapub::Result<()> {
//!     let el = Arc::new(DefaultEventLoop::new());
//!     let space = Arc::new(MemoryAddressSpace::new());
//!     space.put_variable(NodeId::numeric(2, 1), Variant::Double(21.5));
//!     el.register_connection_manager(Arc::new(UdpConnectionManager::new()?));
//!
//!     let manager = PubSubManager::builder()
//!         .event_loop(el.clone())
//!         .host(space)
//!         .transport(el.connection_manager("udp").unwrap())
//!         .build()?;
//!
//!     let conn = manager.add_connection(&PubSubConnectionConfig {
//!         name: "udp".into(),
//!         transport_profile_uri: uapub::protocol::PROFILE_UDP_UADP.into(),
//!         address: NetworkAddressUrl { url: "opc.udp://224.0.0.22:4840/".into(), ..Default::default() },
//!         ..Default::default()
//!     })?;
//!
//!     let pds = manager.add_published_dataset(&PublishedDataSetConfig {
//!         name: "plant-data".into(),
//!         ..Default::default()
//!     })?;
//!     // ... add fields, a WriterGroup and a DataSetWriter, then:
//!     manager.start();
//!     manager.enable_connection(&conn)?;
//!     let _ = pds;
//!     loop {
//!         el.run_iterate(std::time::Duration::from_millis(10));
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                         Application / Host                         |
//! |     HostServices (address-space Read/Write) | state-change hooks   |
//! +--------------------------------------------------------------------+
//! |                          PubSub Runtime                            |
//! |  PubSubManager -> Connection -> Writer/ReaderGroup -> DSW / DSR    |
//! |  lifecycle state machine | publish pipeline | receive demux | SKS  |
//! +--------------------------------------------------------------------+
//! |                          Protocol Layer                            |
//! |     UADP NetworkMessage codec (bit-exact) | JSON message mapping   |
//! +--------------------------------------------------------------------+
//! |                        Transport / EventLoop                       |
//! |    UDP multicast | Ethernet L2 | MQTT | loopback | timer queue     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`pubsub::PubSubManager`] | Entry point; owns the component tree |
//! | [`pubsub::PubSubConnectionConfig`] | Transport binding of a Connection |
//! | [`pubsub::WriterGroupConfig`] | Periodic publisher configuration |
//! | [`pubsub::DataSetReaderConfig`] | Inbound message filter + sink |
//! | [`protocol::uadp::NetworkMessage`] | One wire PDU |
//! | [`types::StatusCode`] | Error currency of the whole crate |
//!
//! ## Modules Overview
//!
//! - [`pubsub`] - The runtime core (start here)
//! - [`protocol`] - UADP / JSON codecs and transport profiles
//! - [`transport`] - ConnectionManager implementations
//! - [`eventloop`] - Timers and the single-threaded loop
//! - [`security`] - Message security policies and key storage
//! - [`host`] - Address-space seam towards the embedding server
//!
//! ## See Also
//!
//! - [OPC UA Part 14: PubSub](https://reference.opcfoundation.org/Core/Part14/)
//! - [OPC UA Part 6: Mappings](https://reference.opcfoundation.org/Core/Part6/)

/// Event loop abstraction: timers, delayed callbacks, clock access.
pub mod eventloop;
/// Host address-space seam (Read/Write/node management).
pub mod host;
/// Wire protocol: transport profiles, DataSet metadata, UADP/JSON codecs.
pub mod protocol;
/// The PubSub runtime core (manager, components, state machine).
pub mod pubsub;
/// Message security policies and key-rollover storage.
pub mod security;
/// Transport drivers (UDP, Ethernet, MQTT, loopback).
pub mod transport;
/// OPC UA built-in types and the binary codec.
pub mod types;

pub use pubsub::{PubSubManager, PubSubState};
pub use types::StatusCode;

/// Crate-wide result type: the error is a bad OPC UA status code.
pub type Result<T> = std::result::Result<T, StatusCode>;
