//! A conservative mark-and-sweep garbage collector for raw allocations.
//!
//! ```
//! let anchor = 0usize;
//! let mut gc = cgc::Collector::start(&anchor as *const usize as *const u8);
//!
//! let block = gc.allocate(64).unwrap();
//! assert_eq!(gc.size(block.as_ptr()), 64);
//!
//! gc.stop();
//! ```

mod collector;
mod config;
mod error;
mod mark;
mod policy;
mod record;
mod registry;
mod stack;
mod stats;
mod sweep;

#[cfg(test)]
mod tests;

pub use cgc_malloc::{Malloc, RawAlloc};
pub use collector::Collector;
pub use config::GcConfig;
pub use error::GcError;
pub use record::{Destructor, Flags};
pub use stats::Stats;
