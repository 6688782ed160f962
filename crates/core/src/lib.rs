//! Domain types, fingerprinting, chunking, configuration, and storage
//! shared by every `folderd` component. No tokio dependency here: this
//! crate is synchronous and usable directly from tests.

pub mod chunk;
pub mod config;
pub mod error;
pub mod path;
pub mod storage;
pub mod types;
