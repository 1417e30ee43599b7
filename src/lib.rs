pub mod agent_match;
pub mod background;
pub mod collision;
pub mod config;
pub mod db;
pub mod error;
pub mod event_bus;
pub mod external;
pub mod geo;
pub mod id;
pub mod location;
pub mod mission_queue;
pub mod models;
pub mod observer;
pub mod store;
pub mod telemetry;
