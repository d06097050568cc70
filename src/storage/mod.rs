mod connector;
pub mod db;
mod files;
mod links;
pub mod models;
mod tables;
mod variants;

pub use connector::{Connector, ConnectorCapabilities, ConnectorError};
pub use db::{Database, DatabaseError};
pub use tables::*;
