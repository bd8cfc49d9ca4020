//! IoT Monitor
//!
//! Backend for the IoT monitoring dashboard. The service keeps one MQTT
//! subscription open, stores every message it receives, and serves the most
//! recent messages and image detections to the dashboard over HTTP.
//!
//! ## Features
//!
//! - **Ingestion Bridge**: subscribes to a fixed topic and writes each message
//!   to the store; reconnects with jittered exponential backoff
//! - **Storage Gateway**: PostgreSQL-backed `messages` and `detections`
//!   collections with newest-first, capped queries
//! - **Publish Endpoint**: forwards dashboard requests to the broker
//! - **Image Upload**: multipart uploads stored as base64 detections with
//!   location, coordinates, and confidence
//!
//! ## Architecture
//!
//! ```text
//!  MQTT Broker                                      PostgreSQL
//! ┌──────────────┐  publish   ┌──────────────┐     ┌──────────────┐
//! │ test/topic   │───────────▶│ Ingestion    │────▶│ messages     │
//! │              │◀───────────│ Bridge       │     │ detections   │
//! └──────────────┘  forward   └──────────────┘     └──────────────┘
//!                                    ▲                    ▲
//!                                    │                    │
//!                             ┌──────────────┐            │
//!                             │ HTTP API     │────────────┘
//!                             │ (dashboard)  │  read / upload
//!                             └──────────────┘
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod document_store;
pub mod models;
pub mod mqtt_bridge;
pub mod upload;

pub use api::{create_router, AppState};
pub use broker::{BrokerClient, MqttClient};
pub use config::Config;
pub use document_store::{DocumentStore, PgDocumentStore, StoreError};
pub use models::{Collection, Coordinates, Detection, Message, NewDetection, Record, RECENT_LIMIT};
pub use mqtt_bridge::{BridgeError, BridgeState, IngestionBridge};
