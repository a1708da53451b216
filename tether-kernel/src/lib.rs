/**
 * TETHER KERNEL - Moteur de synchronisation commandes / télémétrie des devices
 *
 * Modules :
 * - store    : Record Store (mémoire + snapshot JSON, ou arbre REST distant)
 * - registry : identité et présence des devices
 * - queue    : file de commandes par device
 * - ingest   : cascade de décodage des uploads, enrich : champs dérivés
 * - console  : projections opérateur
 * - http     : routes axum
 */

pub mod clock;
pub mod codec;
pub mod config;
pub mod console;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod health;
pub mod http;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod push;
pub mod queue;
pub mod registry;
pub mod state;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use codec::{DecodeError, PayloadCodec};
pub use config::KernelConfig;
pub use engine::SyncEngine;
pub use error::{EngineError, EngineResult};
pub use ingest::{IngestOutcome, Upload, UploadHeaders};
pub use models::{Command, CommandResult, Device, DeviceStatus};
pub use push::{PushError, PushSender, SharedPush};
pub use store::{MemoryStore, RecordStore, RestStore, SharedStore};
