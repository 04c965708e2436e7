//! UHCI host controller core: descriptor pools, the frame-list schedule,
//! per-endpoint TD chains and completion processing.

pub mod align;
pub mod chain;
pub mod context;
pub mod def;
pub mod descriptor;
pub mod dispatch;
pub mod dma;
pub mod errata;
pub mod frame;
pub(crate) mod host;
pub mod isoch;
pub mod pool;
pub mod queue_head;
pub mod reg;
pub mod scavenge;
pub mod schedule;
mod sync;
pub mod transfer;
pub mod work;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::Context;
pub use descriptor::{EndpointInfo, FrameResult, QhKind};
pub use dma::{DmaAllocator, DmaRegion, GlobalDma};
pub use errata::{Errata, PciIdentity};
pub use host::{Uhci, UhciConfig};
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use reg::PortIo;
pub use reg::{Mmio, RegIo};
pub use transfer::{Completion, Segment, TransferBuffer};
pub use work::WorkKind;
