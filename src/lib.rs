pub mod accounts;
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ratelimit;
pub mod routes;
pub mod storage;
