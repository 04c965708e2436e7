use core::ptr::NonNull;

use dma_api::{DError, DVec, Direction};

use crate::PhysAddr;

pub const PAGE_SIZE: usize = 4096;

/// UHCI masters 32-bit bus addresses only.
pub const DMA_MASK: u64 = u32::MAX as u64;

/// A physically contiguous, zero-initialised region reachable by the controller.
///
/// The memory comes from `dma-api` and is returned to it on drop.
pub struct DmaRegion {
    buf: DVec<u8>,
    virt: NonNull<u8>,
    phys: PhysAddr,
}

unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// `size` zeroed bytes aligned to `align`, below 4 GiB on the bus.
    pub fn zeros(size: usize, align: usize) -> Result<Self, DError> {
        let buf = DVec::<u8>::zeros(DMA_MASK, size, align, Direction::Bidirectional)?;
        let bus = buf.bus_addr();
        if bus + size as u64 > DMA_MASK + 1 {
            error!("DMA block @{bus:#x} is out of reach of a 32-bit controller");
            return Err(DError::NoMemory);
        }
        let virt = NonNull::new(buf.as_ptr() as *mut u8).ok_or(DError::NoMemory)?;
        Ok(Self {
            buf,
            virt,
            phys: PhysAddr::new(bus as u32),
        })
    }

    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// CPU and bus address of the byte at `offset`.
    pub fn at(&self, offset: usize) -> (NonNull<u8>, PhysAddr) {
        debug_assert!(offset < self.size());
        let virt = unsafe { NonNull::new_unchecked(self.virt.as_ptr().add(offset)) };
        (virt, self.phys + offset as u32)
    }
}

/// Source of DMA-capable memory for descriptor and bounce-buffer blocks.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `size` zeroed bytes aligned to `align`, below 4 GiB on the bus.
    fn alloc(&self, size: usize, align: usize) -> Result<DmaRegion, DError>;
}

/// Allocates through the OS layer registered with `dma_api::init`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalDma;

impl DmaAllocator for GlobalDma {
    fn alloc(&self, size: usize, align: usize) -> Result<DmaRegion, DError> {
        DmaRegion::zeros(size, align)
    }
}
