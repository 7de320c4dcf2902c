pub mod account;
pub mod app;
pub mod block;
pub mod cache;
pub mod config;
pub mod engine;
pub mod health;
pub mod msg;
pub mod node;
pub mod peer;
pub mod prune;
pub mod registration;
pub mod rejoin;
pub mod round;
pub mod shard;
pub mod sink;
pub mod store;
pub mod tiering;
pub mod txn;
pub mod verify;
