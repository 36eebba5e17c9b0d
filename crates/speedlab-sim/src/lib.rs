//! Virtual two-host test lab.
//!
//! Declares a topology of named endpoints joined by shaped links, brings it
//! up in Linux network namespaces, normalizes the interfaces, starts packet
//! captures and test programs, and tears everything down again.

pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod normalize;
pub mod prompt;
pub mod session;
pub mod shaping;
pub mod topology;
pub mod workflow;
pub mod workload;

pub mod test_util;

pub use error::{ConfigurationError, Error, Result};
pub use session::{DetachedProcess, Session, SessionOptions, SessionState};
pub use topology::{interface_name, LinkShaping, Topology, TopologyBuilder};
