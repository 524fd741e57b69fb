#![cfg_attr(not(feature = "std"), no_std)]

pub mod convert;
pub mod frame;
pub mod geometry;
pub mod throttle;
pub mod types;

#[cfg(feature = "std")]
pub mod attach;
#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod control;
#[cfg(feature = "std")]
pub mod delivery;
#[cfg(feature = "std")]
pub mod error;
#[cfg(feature = "std")]
pub mod payload;
#[cfg(feature = "std")]
pub mod pipeline;
#[cfg(feature = "std")]
pub mod pool;

// Re-exports
pub use convert::*;
pub use frame::*;
pub use geometry::*;
pub use throttle::*;
pub use types::*;

#[cfg(feature = "std")]
pub use attach::*;
#[cfg(feature = "std")]
pub use config::*;
#[cfg(feature = "std")]
pub use control::*;
#[cfg(feature = "std")]
pub use delivery::*;
#[cfg(feature = "std")]
pub use error::*;
#[cfg(feature = "std")]
pub use payload::*;
#[cfg(feature = "std")]
pub use pipeline::*;
#[cfg(feature = "std")]
pub use pool::*;
