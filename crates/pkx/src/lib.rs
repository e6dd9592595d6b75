//! 🅿️ pkx: parking availability with no server in the middle.
//!
//! Listings, spots and status logs live as signed, tagged records on relays that
//! only understand exact-match filters. This crate turns that soup into one
//! consistent, incrementally updated snapshot you can read and subscribe to:
//!
//! - [`entities`] decodes records into listings, spots, status logs, notes and
//!   tombstones, and knows which version of a thing wins.
//! - [`geohash`] fakes "nearby" on an equality-only index with prefix fan-outs.
//! - [`orchestrator`] runs the phased, failure-tolerant refresh.
//! - [`live`] keeps the snapshot current from a scoped subscription.
//! - [`aggregation`] counts spots from the ground up, never from advertised totals.
//! - [`supervisors::Supervisor`] ties it all together from an [`app_config::AppConfig`].
//!
//! 🦆 No relay was harmed in the making of this crate. Several were ignored after timing out.

pub mod aggregation;
pub mod app_config;
pub mod entities;
pub mod geohash;
pub mod live;
pub mod local_state;
pub mod orchestrator;
pub mod publisher;
pub mod records;
pub mod relays;
pub mod snapshot;
pub mod supervisors;

pub use app_config::{AppConfig, load_config};
pub use entities::{Address, Entity, Listing, Spot, SpotStatus, StatusLog, VehicleType};
pub use geohash::Coordinate;
pub use orchestrator::{FetchPhase, RefreshOutcome, RefreshReport};
pub use publisher::{PublishError, Publisher};
pub use records::{Filter, Record, RecordSigner};
pub use snapshot::{Change, ListingView, Snapshot, SnapshotStore};
pub use supervisors::Supervisor;
