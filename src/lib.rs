//! Fixed-region pool allocator and the collections built on it.
//!
//! [`Pool`] formats a caller-supplied buffer once and then carves it into
//! power-of-two blocks with a first-fit scan over an offset-threaded
//! chain — never touching the platform allocator again. [`List`],
//! [`Tree`] and [`Word`] keep all of their nodes inside such a pool.

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// consumers: pooled collections and string duplication
pub mod list;
pub mod tree;
pub mod word;


// allocator core
pub use pool::arena::{Pool, PoolError, PoolPtr, ReleaseFn};

// owned buffers / shared access
pub use pool::buffer::{PageBuffer, VmError};
pub use pool::shared::{DEFAULT_GLOBAL_CAPACITY, GlobalPool, SharedPool};

// diagnostics
pub use pool::stats::PoolStats;

// collections
pub use list::List;
pub use tree::{CompareFn, Tree, TreeIter};
pub use word::Word;
