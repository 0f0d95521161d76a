#![deny(
    clippy::all,
    clippy::missing_const_for_fn,
    future_incompatible,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    unsafe_code,
    unused
)]
#![doc = include_str!("../README.md")]

pub mod broker;
pub mod catalog;
pub mod client;
pub mod model;
pub mod shard;

pub use self::{
    broker::Broker, catalog::Catalog, client::Client, client::Session, shard::Shard,
};
