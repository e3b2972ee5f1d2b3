#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Typed object pools addressed through packed, generation-checked handles.
//!
//! Values live in pools and are referred to by small integer handles instead of pointers. Every
//! handle embeds the ID of the pool that issued it, so a [`Registry`] can route operations on a
//! bare handle to the right pool without knowing the item type.
//!
//! # Key Features
//!
//! - **Reference-counted slots**: each value has a strong count and is dropped when it reaches zero
//! - **Compact handles**: a [`StrongHandle`] is 32 bits, a [`WeakHandle`] is 64 bits
//! - **Stale-handle detection**: weak handles never resolve to a value other than their own, even
//!   after the slot is reused
//! - **Named pools**: [`NamedPool`] deduplicates values by key
//! - **RAII handles**: [`Handle<T>`] for typed access and [`AnyHandle`] for type-erased access
//! - **Persistence**: pool contents can be saved and restored entirely or merged incrementally
//! - **Resource loading**: [`Loaders`] fetch bytes from prioritized sources and pools turn them
//!   into values
//!
//! # Handle Types
//!
//! ## [`Handle<T>`]
//!
//! Owns one strong reference and releases it when dropped. Cloning adds a reference. The handle
//! keeps its pool alive and accesses it directly.
//!
//! ## [`AnyHandle`]
//!
//! Like [`Handle<T>`] but without a type parameter. Every operation goes through the
//! [`Registry`]. Convert back with [`AnyHandle::downcast()`].
//!
//! ## [`StrongHandle`] and [`WeakHandle`]
//!
//! Plain `Copy` words. A strong handle stands for a reference that the holder must release
//! manually. A weak handle does not keep the value alive and must be locked to be used.
//!
//! # Strong-generation checks
//!
//! Strong handles carry a 4-bit generation tag that catches most uses of a released handle. The
//! tag is stamped and verified in debug builds and when the `checked` feature is enabled. In
//! other builds, using a released strong handle is still a contract violation but may go
//! undetected if the slot was reused.
//!
//! # Examples
//!
//! ```rust
//! use handle_pool::{NamedPool, Pool, Registry};
//!
//! let registry = Registry::new();
//!
//! let meshes = Pool::<Vec<f32>>::new(&registry);
//! let names = NamedPool::<String, u32>::new(&registry);
//!
//! let mesh = meshes.acquire(vec![0.0, 1.0, 0.5]);
//! let (id, _) = names.acquire("player".to_string(), 7);
//!
//! // Type-erased handles dispatch through the registry.
//! let erased = [mesh.clone().erase(), id.clone().erase()];
//! assert_eq!(erased[0].count(), 2);
//! assert_eq!(erased[1].with(|v: &u32| *v), Some(7));
//! ```
//!
//! ## Saving and restoring
//!
//! ```rust
//! use handle_pool::{ByteReader, ByteWriter, Pool, Registry, SaveMode};
//!
//! let registry = Registry::new();
//! let pool = Pool::<String>::new(&registry);
//!
//! let raw = pool.acquire_raw("kept".to_string());
//!
//! let mut writer = ByteWriter::new();
//! pool.save(&mut writer, SaveMode::Full);
//! let saved = writer.into_bytes();
//!
//! pool.clear();
//!
//! let mut reader = ByteReader::new(&saved);
//! pool.load(&mut reader, SaveMode::Full).unwrap();
//!
//! // Slot IDs and counts are restored, so the raw handle is valid again.
//! assert_eq!(*pool.get(raw), "kept");
//! ```

mod any_handle;
mod builder;
mod drop_policy;
mod error;
mod handle;
mod loader;
mod named_pool;
mod owned_handle;
mod persist;
mod pool;
mod pool_core;
mod registry;
mod shared;
mod slot_table;

pub use any_handle::AnyHandle;
pub use builder::*;
pub use drop_policy::*;
pub use error::{Error, Result};
pub use handle::{
    INDEX_BITS, MAX_SLOTS, POOL_ID_BITS, PoolId, STRONG_GENERATION_BITS, StrongHandle,
    WEAK_GENERATION_BITS, WeakHandle,
};
pub use loader::*;
pub use named_pool::NamedPool;
pub use owned_handle::Handle;
pub use persist::{ByteReader, ByteWriter, Decoder, Encoder, LoadSummary, Persist, SaveMode};
pub use pool::{KnowsOwnHandle, Pool};
pub use registry::Registry;
pub use slot_table::SlotTable;
