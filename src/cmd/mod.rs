//! CLI command implementations.
//!
//! | Module        | Commands handled |
//! |---------------|------------------|
//! | `coordinator` | `Coordinator`    |
//! | `worker`      | `Worker`         |
//! | `migrate`     | `Migrate`        |

pub mod coordinator;
pub mod migrate;
pub mod worker;

pub use coordinator::cmd_coordinator;
pub use migrate::cmd_migrate;
pub use worker::cmd_worker;
