mod heap;
mod shared;
mod system;

pub use heap::{
    AllocFlags, FatalFn, FinalizerFn, Heap, HeapInfo, HeapSettings,
};
pub use shared::LockedHeap;
pub use system::{OS_PAGE_SIZE, Region};
