pub mod api;
pub mod bus;
pub mod cd;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod git;
pub mod logging;
pub mod logstream;
pub mod service;
pub mod shutdown;
pub mod storage;
pub mod store;
pub mod worker;
