use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::ptr::NonNull;

use id_arena::{Arena, Id};

use super::{
    dma::{DmaAllocator, DmaRegion, PAGE_SIZE},
    transfer::TransferBuffer,
};
use crate::PhysAddr;

/// Control/bulk/interrupt bounce buffers hold one full-speed packet.
pub const CBI_ALIGN_SIZE: usize = 64;
/// Isochronous bounce buffers hold one full-speed isochronous packet.
pub const ISOCH_ALIGN_SIZE: usize = 1024;
pub const ISOCH_ALIGN_QTY: usize = 16;

pub type AlignBufferId = Id<AlignBuffer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignKind {
    Cbi,
    Isoch,
}

pub struct AlignBuffer {
    virt: NonNull<u8>,
    phys: PhysAddr,
    kind: AlignKind,
    in_use: bool,
    /// Bytes the controller actually wrote, set before a deferred copy-out.
    pub(crate) act_count: usize,
}

unsafe impl Send for AlignBuffer {}

impl AlignBuffer {
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn kind(&self) -> AlignKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        match self.kind {
            AlignKind::Cbi => CBI_ALIGN_SIZE,
            AlignKind::Isoch => ISOCH_ALIGN_SIZE,
        }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.size()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.size()) }
    }
}

/// Bounce buffers substituted for caller memory the controller cannot use
/// directly, such as a packet straddling two non-contiguous pages.
pub struct AlignmentPools {
    dma: Arc<dyn DmaAllocator>,
    blocks: Vec<DmaRegion>,
    buffers: Arena<AlignBuffer>,
    cbi_free: VecDeque<AlignBufferId>,
    isoch_free: VecDeque<AlignBufferId>,
    isoch_in_use: usize,
    isoch_high_water: usize,
}

impl AlignmentPools {
    pub fn new(dma: Arc<dyn DmaAllocator>) -> Self {
        Self {
            dma,
            blocks: Vec::new(),
            buffers: Arena::new(),
            cbi_free: VecDeque::new(),
            isoch_free: VecDeque::new(),
            isoch_in_use: 0,
            isoch_high_water: 0,
        }
    }

    fn grow(&mut self, kind: AlignKind) -> bool {
        let (size, count) = match kind {
            AlignKind::Cbi => (PAGE_SIZE, PAGE_SIZE / CBI_ALIGN_SIZE),
            AlignKind::Isoch => (ISOCH_ALIGN_SIZE * ISOCH_ALIGN_QTY, ISOCH_ALIGN_QTY),
        };
        let block = match self.dma.alloc(size, PAGE_SIZE) {
            Ok(block) => block,
            Err(e) => {
                error!("could not grow {kind:?} alignment buffers: {e:?}");
                return false;
            }
        };
        let stride = size / count;
        for i in 0..count {
            let (virt, phys) = block.at(i * stride);
            let id = self.buffers.alloc(AlignBuffer {
                virt,
                phys,
                kind,
                in_use: false,
                act_count: 0,
            });
            match kind {
                AlignKind::Cbi => self.cbi_free.push_back(id),
                AlignKind::Isoch => self.isoch_free.push_back(id),
            }
        }
        self.blocks.push(block);
        true
    }

    /// Take a control/bulk/interrupt buffer, growing the pool if needed.
    pub fn get_cbi(&mut self) -> Option<AlignBufferId> {
        if self.cbi_free.is_empty() && !self.grow(AlignKind::Cbi) {
            return None;
        }
        let id = self.cbi_free.pop_front()?;
        self.take(id);
        Some(id)
    }

    pub fn get_isoch(&mut self) -> Option<AlignBufferId> {
        if self.isoch_free.is_empty() && !self.grow(AlignKind::Isoch) {
            return None;
        }
        let id = self.isoch_free.pop_front()?;
        self.take(id);
        self.isoch_in_use += 1;
        if self.isoch_in_use > self.isoch_high_water {
            self.isoch_high_water = self.isoch_in_use;
            debug!("isoch alignment buffers high water: {}", self.isoch_high_water);
        }
        Some(id)
    }

    fn take(&mut self, id: AlignBufferId) {
        let buf = &mut self.buffers[id];
        buf.in_use = true;
        buf.act_count = 0;
    }

    pub fn release(&mut self, id: AlignBufferId) {
        let buf = &mut self.buffers[id];
        if !buf.in_use {
            error!("alignment buffer @{:#x} released twice", buf.phys);
            return;
        }
        buf.in_use = false;
        match buf.kind {
            AlignKind::Cbi => self.cbi_free.push_back(id),
            AlignKind::Isoch => {
                self.isoch_in_use -= 1;
                self.isoch_free.push_back(id);
            }
        }
    }

    pub fn get(&self, id: AlignBufferId) -> &AlignBuffer {
        &self.buffers[id]
    }

    /// Record how many bytes the controller wrote into the buffer.
    pub fn set_act_count(&mut self, id: AlignBufferId, count: usize) {
        let buf = &mut self.buffers[id];
        buf.act_count = count.min(buf.size());
    }

    /// Stage outgoing bytes into the buffer.
    pub fn fill(&mut self, id: AlignBufferId, data: &[u8]) {
        let buf = &mut self.buffers[id];
        let len = data.len().min(buf.size());
        buf.bytes_mut()[..len].copy_from_slice(&data[..len]);
    }

    pub fn contents(&self, id: AlignBufferId, len: usize) -> &[u8] {
        let buf = &self.buffers[id];
        &buf.bytes()[..len.min(buf.size())]
    }

    pub fn isoch_in_use(&self) -> usize {
        self.isoch_in_use
    }

    pub fn isoch_high_water(&self) -> usize {
        self.isoch_high_water
    }

    pub fn cbi_free(&self) -> usize {
        self.cbi_free.len()
    }
}

/// Deferred copy-outs of one transfer: input data that landed in bounce
/// buffers and still has to reach the caller's memory.
#[derive(Default)]
pub struct DmaContext {
    pending: Vec<(AlignBufferId, usize)>,
}

impl DmaContext {
    /// Queue `id`, whose data belongs at `offset` in the transfer buffer.
    pub fn defer(&mut self, id: AlignBufferId, offset: usize) {
        self.pending.push((id, offset));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Copy every deferred buffer into `dest` and give the buffers back.
    pub fn complete(&mut self, pools: &mut AlignmentPools, dest: &TransferBuffer) {
        for (id, offset) in self.pending.drain(..) {
            let count = pools.get(id).act_count;
            dest.write_at(offset, pools.contents(id, count));
            pools.release(id);
        }
    }

    /// Give every deferred buffer back without copying.
    pub fn discard(&mut self, pools: &mut AlignmentPools) {
        for (id, _) in self.pending.drain(..) {
            pools.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::uhci::test_support::heap_dma;

    #[test]
    fn cbi_pool_grows_by_page() {
        let mut pools = AlignmentPools::new(heap_dma());
        let first = pools.get_cbi().unwrap();
        assert_eq!(pools.cbi_free(), PAGE_SIZE / CBI_ALIGN_SIZE - 1);
        let a = pools.get(first).phys();
        let second = pools.get_cbi().unwrap();
        assert_eq!(pools.get(second).phys(), a + CBI_ALIGN_SIZE as u32);
        pools.release(first);
        pools.release(second);
        assert_eq!(pools.cbi_free(), PAGE_SIZE / CBI_ALIGN_SIZE);
    }

    #[test]
    fn isoch_high_water_tracks_peak() {
        let mut pools = AlignmentPools::new(heap_dma());
        let held: Vec<_> = (0..ISOCH_ALIGN_QTY + 2).map(|_| pools.get_isoch().unwrap()).collect();
        assert_eq!(pools.isoch_in_use(), ISOCH_ALIGN_QTY + 2);
        for id in held {
            pools.release(id);
        }
        assert_eq!(pools.isoch_in_use(), 0);
        assert_eq!(pools.isoch_high_water(), ISOCH_ALIGN_QTY + 2);
    }

    #[test]
    fn deferred_copy_out_lands_in_caller_buffer() {
        let mut pools = AlignmentPools::new(heap_dma());
        let mut dest = [0u8; 16];
        let buffer = unsafe { TransferBuffer::from_slice(&mut dest, PhysAddr::new(0x4000)) };

        let id = pools.get_cbi().unwrap();
        pools.fill(id, &[1, 2, 3, 4, 5]);
        pools.buffers[id].act_count = 3;

        let mut ctx = DmaContext::default();
        ctx.defer(id, 8);
        ctx.complete(&mut pools, &buffer);
        assert!(ctx.is_empty());
        assert_eq!(&dest[8..12], &[1, 2, 3, 0]);
        assert_eq!(pools.cbi_free(), PAGE_SIZE / CBI_ALIGN_SIZE);
    }
}
