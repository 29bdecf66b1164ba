pub mod actions;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod filters;
pub mod keypath;
pub mod ledger;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod modes;
pub mod policy;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod schema;
pub mod testing;

pub use error::{CustodianError, ErrorKind, Result};
pub use policy::{Policy, PolicyCollection, PolicyRunReport};
pub use runtime::{Core, CoreBuilder, CoreOptions};
