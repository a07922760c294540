//! Provisio CLI Library
//!
//! Producer and operator side of the provisioning queue: enqueue validated
//! requests, inspect task state, list terminal failures and requeue them.

pub mod output;
pub mod key_file;
pub mod task_cmd;
