#![forbid(unsafe_code)]

pub mod aggregate_store;
pub mod aggregation;
pub mod auth;
pub mod broadcast;
pub mod connection;
pub mod db;
pub mod event_store;
pub mod gateway;
pub mod http;
pub mod maintenance;
pub mod rate_limit;
pub mod recovery;
pub mod room_hub;
pub mod state;


#[cfg(test)]
mod gateway_tests;
