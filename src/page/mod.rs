pub mod buffer;
pub mod descriptor;

pub use buffer::{PageReadGuard, PageSlab, PageWriteGuard};
pub use descriptor::{PageDescriptor, PageSpan, INVALID_TIME};
