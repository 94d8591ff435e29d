//! Building blocks for [`clap`]-driven configuration of the replication writer.

pub mod byte_size;
pub mod consumer;
