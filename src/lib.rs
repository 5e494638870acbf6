pub mod backoff;
pub mod cache;
pub mod cid;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ipfs;
pub mod pin;
pub mod signal;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;
