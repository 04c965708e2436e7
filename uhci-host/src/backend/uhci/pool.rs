use alloc::{collections::{BTreeMap, VecDeque}, sync::Arc, vec::Vec};
use core::ptr::NonNull;

use id_arena::{Arena, Id};

use super::{
    align::AlignBufferId,
    def::{QH_SIZE, QhRef, TD_SIZE, TdRef},
    descriptor::{Itd, ItdId, ItdState, ListElement, Qh, QhId, QhKind, Td, TdId},
    dma::{DmaAllocator, DmaRegion, PAGE_SIZE},
};
use crate::{
    PhysAddr,
    err::{HostError, Result},
};

/// Free lists of TDs, iTDs and QHs carved out of DMA blocks.
///
/// Free lists are FIFO: a released descriptor goes to the back, so it is the
/// last to be handed out again. Blocks are never returned while the pool is
/// alive, so growth never moves a descriptor that is in use.
pub struct DescriptorPool {
    dma: Arc<dyn DmaAllocator>,
    block_size: usize,
    blocks: Vec<DmaRegion>,
    tds: Arena<Td>,
    free_tds: VecDeque<TdId>,
    itds: Arena<Itd>,
    free_itds: VecDeque<ItdId>,
    qhs: Arena<Qh>,
    free_qhs: VecDeque<QhId>,
    by_phys: BTreeMap<u32, ListElement>,
}

impl DescriptorPool {
    pub fn new(dma: Arc<dyn DmaAllocator>) -> Self {
        Self::with_block_size(dma, PAGE_SIZE)
    }

    /// Pool that grows `block_size` bytes at a time.
    pub fn with_block_size(dma: Arc<dyn DmaAllocator>, block_size: usize) -> Self {
        Self {
            dma,
            block_size: block_size.max(TD_SIZE),
            blocks: Vec::new(),
            tds: Arena::new(),
            free_tds: VecDeque::new(),
            itds: Arena::new(),
            free_itds: VecDeque::new(),
            qhs: Arena::new(),
            free_qhs: VecDeque::new(),
            by_phys: BTreeMap::new(),
        }
    }

    pub fn tds_per_block(&self) -> usize {
        self.block_size / TD_SIZE
    }

    pub fn qhs_per_block(&self) -> usize {
        self.block_size / QH_SIZE
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_td_count(&self) -> usize {
        self.free_tds.len()
    }

    pub fn free_itd_count(&self) -> usize {
        self.free_itds.len()
    }

    pub fn free_qh_count(&self) -> usize {
        self.free_qhs.len()
    }

    fn grow<T>(
        &mut self,
        stride: usize,
        make: impl Fn(NonNull<u8>, PhysAddr) -> T,
        arena: impl Fn(&mut Self) -> &mut Arena<T>,
        free: impl Fn(&mut Self) -> &mut VecDeque<Id<T>>,
        tag: impl Fn(Id<T>) -> ListElement,
    ) -> Result {
        let block = self
            .dma
            .alloc(self.block_size, PAGE_SIZE.min(self.block_size))
            .map_err(HostError::from)?;
        let count = self.block_size / stride;
        debug!(
            "descriptor block @{:#x}: {} x {} bytes",
            block.phys(),
            count,
            stride
        );
        for i in 0..count {
            let (virt, phys) = block.at(i * stride);
            let id = arena(self).alloc(make(virt, phys));
            free(self).push_back(id);
            self.by_phys.insert(phys.raw(), tag(id));
        }
        self.blocks.push(block);
        Ok(())
    }

    pub fn alloc_td(&mut self, qh: Option<QhId>) -> Result<TdId> {
        if self.free_tds.is_empty() {
            self.grow(
                TD_SIZE,
                |virt, phys| Td::new(unsafe { TdRef::new(virt) }, phys),
                |s| &mut s.tds,
                |s| &mut s.free_tds,
                ListElement::Transfer,
            )?;
        }
        let id = self.free_tds.pop_front().ok_or(crate::USBError::NoMemory)?;
        let td = &mut self.tds[id];
        td.hw.clear();
        td.reset();
        td.allocated = true;
        td.qh = qh;
        Ok(id)
    }

    pub fn dealloc_td(&mut self, id: TdId) {
        let td = &mut self.tds[id];
        if !td.allocated {
            error!("TD @{:#x} released twice", td.phys);
            return;
        }
        if td.align_buffer.is_some() {
            error!("TD @{:#x} released with an alignment buffer attached", td.phys);
        }
        td.hw.set_status(super::def::TdStatus::empty());
        td.reset();
        td.allocated = false;
        self.free_tds.push_back(id);
    }

    pub fn alloc_itd(&mut self) -> Result<ItdId> {
        if self.free_itds.is_empty() {
            self.grow(
                TD_SIZE,
                |virt, phys| Itd::new(unsafe { TdRef::new(virt) }, phys),
                |s| &mut s.itds,
                |s| &mut s.free_itds,
                ListElement::Isoch,
            )?;
        }
        let id = self.free_itds.pop_front().ok_or(crate::USBError::NoMemory)?;
        let itd = &mut self.itds[id];
        itd.hw.clear();
        itd.reset();
        itd.state = ItdState::Pending;
        Ok(id)
    }

    /// Returns an alignment buffer the iTD unexpectedly still held, so the
    /// caller can give it back to its pool.
    #[must_use]
    pub fn dealloc_itd(&mut self, id: ItdId) -> Option<AlignBufferId> {
        let itd = &mut self.itds[id];
        if itd.state == ItdState::Free {
            error!("iTD @{:#x} released twice", itd.phys);
            return None;
        }
        let leftover = itd.align_buffer.take();
        if leftover.is_some() {
            error!("iTD @{:#x} released with an alignment buffer attached", itd.phys);
        }
        itd.hw.set_status(super::def::TdStatus::empty());
        itd.reset();
        itd.state = ItdState::Free;
        self.free_itds.push_back(id);
        leftover
    }

    pub fn alloc_qh(&mut self, kind: QhKind) -> Result<QhId> {
        if self.free_qhs.is_empty() {
            self.grow(
                QH_SIZE,
                |virt, phys| Qh::new(unsafe { QhRef::new(virt) }, phys),
                |s| &mut s.qhs,
                |s| &mut s.free_qhs,
                ListElement::QueueHead,
            )?;
        }
        let id = self.free_qhs.pop_front().ok_or(crate::USBError::NoMemory)?;
        let qh = &mut self.qhs[id];
        qh.hw.clear();
        qh.reset();
        qh.allocated = true;
        qh.kind = kind;
        Ok(id)
    }

    pub fn dealloc_qh(&mut self, id: QhId) {
        let qh = &mut self.qhs[id];
        if !qh.allocated {
            error!("QH @{:#x} released twice", qh.phys);
            return;
        }
        if qh.first.is_some() {
            error!("QH @{:#x} released with TDs still queued", qh.phys);
        }
        qh.hw.clear();
        qh.reset();
        qh.allocated = false;
        self.free_qhs.push_back(id);
    }

    pub fn td(&self, id: TdId) -> &Td {
        &self.tds[id]
    }

    pub fn td_mut(&mut self, id: TdId) -> &mut Td {
        &mut self.tds[id]
    }

    pub fn itd(&self, id: ItdId) -> &Itd {
        &self.itds[id]
    }

    pub fn itd_mut(&mut self, id: ItdId) -> &mut Itd {
        &mut self.itds[id]
    }

    pub fn qh(&self, id: QhId) -> &Qh {
        &self.qhs[id]
    }

    pub fn qh_mut(&mut self, id: QhId) -> &mut Qh {
        &mut self.qhs[id]
    }

    /// Translate a bus address read back from hardware into its descriptor.
    pub fn element_at(&self, phys: PhysAddr) -> Option<ListElement> {
        self.by_phys.get(&phys.raw()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::uhci::{
        def::{Link, Pid, TdStatus, Token},
        test_support::heap_dma,
    };

    fn pool() -> DescriptorPool {
        DescriptorPool::new(heap_dma())
    }

    #[test]
    fn grows_past_one_block_with_clean_descriptors() {
        let mut pool = pool();
        let per_block = pool.tds_per_block();
        assert_eq!(per_block, 128);

        let mut held = Vec::new();
        for _ in 0..per_block {
            let id = pool.alloc_td(None).unwrap();
            // Leave stale state behind in the first block.
            let hw = pool.td(id).hw();
            hw.set_status(TdStatus::ACTIVE | TdStatus::STALLED);
            hw.set_token(Token::new(Pid::In, 3, 1, true, 64));
            held.push(id);
        }
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.free_td_count(), 0);

        let extra = pool.alloc_td(None).unwrap();
        assert_eq!(pool.block_count(), 2);
        let hw = pool.td(extra).hw();
        assert_eq!(hw.status(), TdStatus::empty());
        assert_eq!(hw.token().raw(), 0);
        assert_eq!(hw.buffer().raw(), 0);
        assert_eq!(hw.link(), Link::TERMINATE);

        // Earlier descriptors are untouched by growth.
        assert!(pool.td(held[0]).hw().status().is_halted());
    }

    #[test]
    fn recycled_td_is_cleared_and_reused_last() {
        let mut pool = pool();
        let a = pool.alloc_td(None).unwrap();
        pool.td(a).hw().set_status(TdStatus::armed());
        pool.td(a).hw().set_buffer(PhysAddr::new(0xdead_0000));
        pool.td_mut(a).last_of_transaction = true;
        pool.dealloc_td(a);
        assert_eq!(pool.td(a).hw().status(), TdStatus::empty());

        // FIFO reuse: every other free TD comes first.
        let free = pool.free_td_count();
        let mut seen_a = false;
        for _ in 0..free {
            let id = pool.alloc_td(None).unwrap();
            if id == a {
                seen_a = true;
                assert_eq!(pool.td(id).hw().buffer().raw(), 0);
                assert!(!pool.td(id).is_last_of_transaction());
            }
        }
        assert!(seen_a);
    }

    #[test]
    fn physical_lookup_finds_descriptors() {
        let mut pool = pool();
        let qh = pool.alloc_qh(QhKind::Bulk).unwrap();
        let td = pool.alloc_td(Some(qh)).unwrap();
        let itd = pool.alloc_itd().unwrap();
        assert_eq!(pool.element_at(pool.qh(qh).phys()), Some(ListElement::QueueHead(qh)));
        assert_eq!(pool.element_at(pool.td(td).phys()), Some(ListElement::Transfer(td)));
        assert_eq!(pool.element_at(pool.itd(itd).phys()), Some(ListElement::Isoch(itd)));
        assert_eq!(pool.td(td).qh(), Some(qh));
        assert_eq!(pool.element_at(PhysAddr::new(4)), None);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut pool = pool();
        let td = pool.alloc_td(None).unwrap();
        pool.dealloc_td(td);
        let free = pool.free_td_count();
        pool.dealloc_td(td);
        assert_eq!(pool.free_td_count(), free);
    }
}
