//! Core library for the nozzle inspection station.
//!
//! This library keeps track of the station's remote devices and drives the
//! measurement cycle against them. It contains the connection supervisors,
//! the remote operation gateway, the measurement orchestrator and the
//! notification deduplicator the presentation layer listens to. It is used by
//! the `nozzle_inspect` binary and by any front end embedding a [`Station`].

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod measurement;
pub mod notify;
pub mod orchestrator;
pub mod poller;
pub mod station;
pub mod supervisor;

pub use config::InspectConfig;
pub use device::{ConnectionState, DeviceId, DeviceKind, DeviceSnapshot};
pub use error::{AppResult, InspectError, RemoteError};
pub use gateway::{Gateway, Outcome, RemoteService};
pub use measurement::{MeasurementRecord, ResultSample};
pub use notify::{Deduplicator, Notification, ProblemCode};
pub use orchestrator::{CycleHandle, CyclePhase, CycleSnapshot};
pub use station::Station;
