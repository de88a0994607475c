#![no_std]
#![warn(rust_2018_idioms)]

#[macro_use]
pub mod r#macro;
pub mod config;
pub mod granule;
pub mod realm;
pub mod rec;
pub mod rmi;

#[cfg(test)]
pub mod test_utils;

extern crate alloc;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

pub use crate::granule::{AllocationContext, HostMemory};
pub use crate::realm::Realm;
pub use crate::rec::Rec;
pub use crate::rmi::error::Error;
pub use crate::rmi::Monitor;
