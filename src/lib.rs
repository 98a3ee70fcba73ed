#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(docsrs, loom)))]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod util;

pub(crate) mod loom;

pub mod blocking;
pub mod event;
pub mod fatal;
pub mod mutex;
pub mod once;
pub mod parking_lot;
pub mod raw_mutex;
pub mod semaphore;
pub mod time;
pub mod tstate;

#[doc(inline)]
pub use self::event::Event;
#[doc(inline)]
pub use self::mutex::{ByteMutex, LockFlags, LockStatus, NotLocked};
#[doc(inline)]
pub use self::once::Once;
#[doc(inline)]
pub use self::raw_mutex::RawMutex;
#[doc(inline)]
pub use self::tstate::ThreadState;
