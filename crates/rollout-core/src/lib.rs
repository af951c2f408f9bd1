pub mod artifact;
pub mod backoff;
pub mod backup;
pub mod certs;
pub mod config;
pub mod confirm;
pub mod database;
pub mod dns;
pub mod error;
pub mod health;
pub mod io;
pub mod journal;
pub mod lock;
pub mod migration;
pub mod orchestrator;
pub mod paths;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod release;
pub mod supervisor;
pub mod tls;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{ErrorKind, Result, RolloutError};
pub use orchestrator::{Collaborators, Orchestrator};
