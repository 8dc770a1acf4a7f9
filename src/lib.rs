//! Bridge between a CAM frontend and networked machine controllers.
//!
//! Discovery reports controller instances and the services they advertise.
//! The [`registry::Registry`] keeps one connection per advertised service,
//! mirrors the broadcast state, runs command sequences and keeps track of
//! which local job the machine has loaded.

pub mod command;
pub mod config;
pub mod discovery;
pub mod job;
pub mod machine;
pub mod motion;
pub mod mux;
pub mod notify;
pub mod registry;
pub mod sequencer;
pub mod service;
pub mod toolchange;
pub mod transport;
pub mod tree;
pub mod types;
pub mod wire;

pub use config::Config;
pub use registry::Registry;
