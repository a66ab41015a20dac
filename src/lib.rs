//! An in-process cache that prevents cache stampedes.
//!
//! Each entry is *fresh* for a while after it is written, then *stale* until
//! its time to live runs out, then *expired*. Fresh values are returned as is.
//! Stale values are returned right away by [`Cache::get`] while a refresh runs
//! in the background, and [`Cache::get_fresh`] treats them like expired ones.
//! However many callers ask for the same missing or outdated key at once, the
//! fetch function runs only once and its outcome is shared by all of them.

pub mod cache;
pub mod entry;
pub mod error;
pub mod flight;

pub use cache::{Cache, CacheConfig};
pub use entry::{Entry, Freshness};
pub use error::{BoxError, Error};
pub use flight::{Flight, Flights};
