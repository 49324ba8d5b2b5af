//! Cross-process, named, in-memory key/value tables.
//!
//! The entire table state lives in named shared memory segments, so
//! unrelated processes on one host read and write a common table simply by
//! opening the same logical name:
//!
//! ```no_run
//! use ipc_kv::IpcKv;
//!
//! let mut kv = IpcKv::open("test")?;
//! kv.set("greeting", b"hi")?;
//! assert_eq!(kv.get("greeting")?.as_deref(), Some(&b"hi"[..]));
//! # Ok::<(), ipc_kv::Error>(())
//! ```
//!
//! The core is an open-addressing hash table with quadratic probing,
//! guarded by a named cross-process reader/writer lock. Every mutable
//! field is double buffered and published with a one-byte commit, so a
//! process dying mid-write leaves the table observably consistent. Growth
//! swaps in a new data segment under a monotonically increasing
//! generation; other handles notice the moved generation and re-map
//! lazily.

pub mod controller;
pub mod error;
pub mod hash;
pub mod layout;
pub mod lock;
pub mod shm;

mod kv;

pub use error::Error;
pub use kv::IpcKv;
pub use layout::{BucketState, DATA_SIZE, INITIAL_CAPACITY, KEY_SIZE, MAX_LOAD_FACTOR};
pub use lock::{IpcLock, LockMode, MAX_LOCKS};
