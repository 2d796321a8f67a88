//! AIS sentinel: replays recorded vessel position reports and raises
//! alerts when successive reports violate physical-plausibility or
//! data-integrity constraints.
//!
//! The pipeline: [`loader::PointSource`] decodes points from (optionally
//! zstd-compressed) delimited files; [`track::TrackStore`] keeps a short
//! per-vessel window; [`detection::RuleEngine`] runs the seven rules over
//! consecutive point pairs; [`database::Db`] persists latest state,
//! position history and cooldown-gated alerts atomically per point; and
//! [`replay::ReplayController`] orchestrates the whole thing at a
//! configurable wall-clock multiple, fanning events out on
//! [`bus::EventBus`].

pub mod bus;
pub mod config;
pub mod database;
pub mod detection;
pub mod errors;
pub mod features;
pub mod loader;
pub mod models;
pub mod replay;
pub mod track;

pub use bus::{BusEvent, EventBus};
pub use config::AppConfig;
pub use database::{Db, DbBuilder, DbDropGuard, IngestPolicy};
pub use errors::SentinelError;
pub use models::{AisPoint, AlertRecord, AlertStatus, Mmsi, RuleType};
pub use replay::{ReplayController, ReplayRequest, ReplayStatus};
