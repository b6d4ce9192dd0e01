//! GC-safe handles for runtime code.
//!
//! Native code that holds heap references across a possible collection
//! stores them in handle slots. The collector finds every live slot through
//! the visitation protocol and may rewrite it when objects move.
//!
//! Handles come in two flavours:
//! - **zone** handles live until the owning [`HandleStore`] is reset or
//!   dropped,
//! - **scoped** handles live until the innermost open [`HandleScope`] drops.
//!
//! ```
//! use handles::{Value, VmHandles};
//!
//! let store = VmHandles::new();
//! let global = store.zone_handle(Value::from_i64(1));
//! store.with_scope(|scope| {
//!     let tmp = scope.handle(Value::from_i64(2));
//!     assert_eq!(store.count_scoped_handles(), 1);
//!     tmp.set(global.value());
//! });
//! assert_eq!(store.count_scoped_handles(), 0);
//! assert_eq!(store.count_zone_handles(), 1);
//! ```

mod arena;
mod block;
mod config;
mod pool;
mod scope;
mod store;
mod system;
mod value;
mod visitor;

pub use arena::{ArenaError, BlockArena, SystemArena, Zone, ZoneSettings};
pub use block::{HandleBlock, HandleKind};
pub use config::HandleConfig;
pub use pool::ContextPool;
pub use scope::{Handle, HandleScope};
pub use store::{HandleAccounting, HandleStore, VM_HANDLES_PER_BLOCK, VmHandles};
pub use system::OS_PAGE_SIZE;
pub use value::{SlotValue, Value};
pub use visitor::{HandleRef, HandleVisitor, ObjectPointerVisitor, RootProvider};
