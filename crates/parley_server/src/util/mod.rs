#![forbid(unsafe_code)]

pub mod shutdown;
pub mod time;
