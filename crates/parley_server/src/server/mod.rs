#![forbid(unsafe_code)]

pub mod auth;
pub mod bridge;
pub mod connection;
pub mod http;
pub mod hub;
pub mod listener;
pub mod persist;
pub mod redis_store;
pub mod store;



#[cfg(test)]
mod session_tests;

#[cfg(test)]
mod store_tests;
