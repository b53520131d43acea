#[macro_use] extern crate derive_more;
#[macro_use] extern crate serde_derive;
#[macro_use] extern crate tracing;

pub mod config;
pub mod consolidate;
pub mod delegations;
pub mod fetch;
pub mod identity;
pub mod ip;
pub mod lookup;
pub mod normalize;
pub mod publish;
pub mod refresh;
pub mod report;
pub mod table;
