pub mod config;
pub mod db;
pub mod gbp;
pub mod handlers;
pub mod model;
pub mod reconcile;
pub mod sync;
