//! Static UHCI schedule: 1024 frame-list slots fanning into a ladder of
//! interrupt QHs, then low-speed control, full-speed control and bulk, then a
//! tail QH whose hardware link loops back to full-speed control.
//!
//! ```text
//! slot j ─> intr[L] ─> .. ─> intr[0] ─> ls ─> fs ─> bulk ─> tail
//!                                              ^                │
//!                                              └──── (reclaim) ─┘
//! ```

use alloc::{sync::Arc, vec, vec::Vec};

use usb_if::host::DeviceSpeed;

use super::{
    def::{FRAME_LIST_BYTES, FRAME_LIST_LEN, FrameListRef, Link, LinkFlags},
    descriptor::{ListElement, QhId, QhKind},
    dma::{DmaAllocator, DmaRegion, PAGE_SIZE},
    pool::DescriptorPool,
};
use crate::{
    PhysAddr, USBError,
    err::{HostError, Result},
};

/// Upper bound on QH walks, against corrupted or cyclic chains.
pub const MAX_QH_WALK: usize = 150_000;

struct FrameList {
    region: DmaRegion,
    hw: FrameListRef,
}

impl FrameList {
    fn new(dma: &dyn DmaAllocator) -> Result<Self> {
        let region = dma
            .alloc(FRAME_LIST_BYTES, PAGE_SIZE)
            .map_err(HostError::from)?;
        let hw = unsafe { FrameListRef::new(region.virt()) };
        for slot in 0..FRAME_LIST_LEN {
            hw.set(slot, Link::TERMINATE);
        }
        Ok(Self { region, hw })
    }

    fn phys(&self) -> PhysAddr {
        self.region.phys()
    }
}

/// Start and end of one anchored list (low-speed control, full-speed
/// control, bulk). `end` is the anchor itself while the list is empty.
#[derive(Debug, Clone, Copy)]
pub struct ListAnchor {
    pub start: QhId,
    pub end: QhId,
}

/// Hardware link naming `element`.
pub fn element_link(pool: &DescriptorPool, element: ListElement) -> Link {
    match element {
        ListElement::QueueHead(id) => Link::qh(pool.qh(id).phys()),
        ListElement::Transfer(id) => Link::td(pool.td(id).phys()),
        ListElement::Isoch(id) => Link::td(pool.itd(id).phys()),
    }
}

fn link(pool: &mut DescriptorPool, qh: QhId, next: QhId) {
    let next_phys = pool.qh(next).phys();
    let entry = pool.qh_mut(qh);
    entry.next = Some(next);
    entry.hw.set_element(Link::TERMINATE);
    entry.hw.set_head(Link::qh(next_phys));
}

pub struct Schedule {
    frame_list: FrameList,
    /// Software view of each slot: iTDs scheduled for that frame, then the
    /// first interrupt QH.
    logical: Vec<ListElement>,
    interrupt: Vec<QhId>,
    ls_control: ListAnchor,
    fs_control: ListAnchor,
    bulk: ListAnchor,
    tail: QhId,
    reclamation: bool,
    virtual_frames: usize,
}

impl Schedule {
    /// Build the whole static schedule.
    ///
    /// Nothing here is visible to the controller until the caller programs
    /// [`Schedule::frame_list_phys`] into FLBASEADD. On failure every QH taken
    /// so far goes back to the pool and the frame list is released.
    pub fn build(
        pool: &mut DescriptorPool,
        dma: Arc<dyn DmaAllocator>,
        virtual_frames: usize,
    ) -> Result<Self> {
        if !virtual_frames.is_power_of_two() || virtual_frames > FRAME_LIST_LEN {
            return Err(USBError::InvalidParameter("virtual frame count"));
        }
        let levels = virtual_frames.trailing_zeros() as usize + 1;
        let frame_list = FrameList::new(&*dma)?;

        let mut qhs = Vec::with_capacity(levels + 4);
        for _ in 0..levels + 4 {
            match pool.alloc_qh(QhKind::Dummy) {
                Ok(qh) => qhs.push(qh),
                Err(e) => {
                    warn!("schedule build failed after {} QHs: {e}", qhs.len());
                    for qh in qhs {
                        pool.dealloc_qh(qh);
                    }
                    return Err(e);
                }
            }
        }

        let (tail, bulk, fs, ls) = (qhs[0], qhs[1], qhs[2], qhs[3]);
        let interrupt = qhs[4..].to_vec();

        pool.qh(tail).hw().set_head(Link::TERMINATE);
        pool.qh(tail).hw().set_element(Link::TERMINATE);

        link(pool, bulk, tail);
        link(pool, fs, bulk);
        link(pool, ls, fs);

        let mut logical = vec![ListElement::QueueHead(ls); FRAME_LIST_LEN];
        let mut last = ls;
        for (level, &qh) in interrupt.iter().enumerate() {
            link(pool, qh, last);
            // Finer levels go in first and coarser levels overwrite them.
            let period = 1 << level;
            let entry = Link::qh(pool.qh(qh).phys());
            let mut slot = period - 1;
            while slot < FRAME_LIST_LEN {
                frame_list.hw.set(slot, entry);
                logical[slot] = ListElement::QueueHead(qh);
                slot += period;
            }
            last = qh;
        }

        let schedule = Self {
            frame_list,
            logical,
            interrupt,
            ls_control: ListAnchor { start: ls, end: ls },
            fs_control: ListAnchor { start: fs, end: fs },
            bulk: ListAnchor { start: bulk, end: bulk },
            tail,
            reclamation: false,
            virtual_frames,
        };
        // Reclamation starts switched off; queued control/bulk work turns it on.
        schedule.set_reclamation_inner(pool, false);
        debug!(
            "schedule built: {} interrupt levels, frame list @{:#x}",
            levels,
            schedule.frame_list_phys()
        );
        Ok(schedule)
    }

    pub fn frame_list_phys(&self) -> PhysAddr {
        self.frame_list.phys()
    }

    pub fn frame_list(&self) -> FrameListRef {
        self.frame_list.hw
    }

    pub fn virtual_frames(&self) -> usize {
        self.virtual_frames
    }

    pub fn levels(&self) -> usize {
        self.interrupt.len()
    }

    pub fn interrupt_qh(&self, level: usize) -> QhId {
        self.interrupt[level]
    }

    pub fn tail(&self) -> QhId {
        self.tail
    }

    pub fn ls_control(&self) -> ListAnchor {
        self.ls_control
    }

    pub fn fs_control(&self) -> ListAnchor {
        self.fs_control
    }

    pub fn bulk(&self) -> ListAnchor {
        self.bulk
    }

    /// Where a full traversal of the QH chain starts: the least frequently
    /// polled interrupt level, which reaches every other QH.
    pub fn walk_start(&self) -> QhId {
        self.interrupt[self.interrupt.len() - 1]
    }

    pub fn logical_slot(&self, slot: usize) -> ListElement {
        self.logical[slot]
    }

    pub(crate) fn set_logical_slot(&mut self, slot: usize, element: ListElement) {
        self.logical[slot] = element;
    }

    /// Interrupt level serving a polling interval, in frames.
    pub fn level_for_interval(&self, interval: u16) -> usize {
        let interval = (interval.max(1) as usize).min(self.virtual_frames);
        (usize::BITS - 1 - interval.leading_zeros()) as usize
    }

    pub fn reclamation(&self) -> bool {
        self.reclamation
    }

    pub fn set_reclamation(&mut self, pool: &DescriptorPool, on: bool) {
        if self.reclamation != on {
            trace!("bandwidth reclamation {}", if on { "on" } else { "off" });
            self.set_reclamation_inner(pool, on);
            self.reclamation = on;
        }
    }

    fn set_reclamation_inner(&self, pool: &DescriptorPool, on: bool) {
        let link = Link::qh(pool.qh(self.fs_control.start).phys());
        let link = if on { link } else { link.with(LinkFlags::TERMINATE) };
        pool.qh(self.tail).hw().set_head(link);
    }

    /// Link an endpoint QH behind the anchor serving its transfer type.
    pub fn link_endpoint(&mut self, pool: &mut DescriptorPool, qh: QhId) -> Result {
        let (kind, speed, interval) = match pool.qh(qh).endpoint() {
            Some(ep) => (pool.qh(qh).kind(), ep.speed, ep.interval),
            None => return Err(USBError::InvalidParameter("queue head has no endpoint")),
        };
        let after = match kind {
            QhKind::Interrupt => self.interrupt[self.level_for_interval(interval)],
            QhKind::Control if speed == DeviceSpeed::Low => self.ls_control.end,
            QhKind::Control => self.fs_control.end,
            QhKind::Bulk => self.bulk.end,
            _ => return Err(USBError::InvalidParameter("queue head kind")),
        };

        // New QH first, then publish it through its predecessor.
        let (prev_next, prev_head) = {
            let prev = pool.qh(after);
            (prev.next, prev.hw.head())
        };
        {
            let entry = pool.qh_mut(qh);
            entry.next = prev_next;
            entry.hw.set_head(prev_head);
        }
        let phys = pool.qh(qh).phys();
        let prev = pool.qh_mut(after);
        prev.next = Some(qh);
        prev.hw.set_head(Link::qh(phys));

        match kind {
            QhKind::Control if speed == DeviceSpeed::Low => self.ls_control.end = qh,
            QhKind::Control => self.fs_control.end = qh,
            QhKind::Bulk => self.bulk.end = qh,
            _ => {}
        }
        Ok(())
    }

    /// Unlink an endpoint QH. The caller must let a frame pass before the QH
    /// is reused, since the controller may still be holding it.
    pub fn unlink_endpoint(&mut self, pool: &mut DescriptorPool, qh: QhId) -> Result {
        let mut prev = self.walk_start();
        let mut steps = 0;
        loop {
            let next = pool.qh(prev).next;
            match next {
                Some(n) if n == qh => break,
                Some(n) => prev = n,
                None => return Err(USBError::NotFound),
            }
            steps += 1;
            if steps > MAX_QH_WALK {
                error!("QH chain walk exceeded {MAX_QH_WALK} entries while unlinking");
                return Err(USBError::NotFound);
            }
        }

        let (next, head) = {
            let entry = pool.qh(qh);
            (entry.next, entry.hw.head())
        };
        let before = pool.qh_mut(prev);
        before.next = next;
        before.hw.set_head(head);

        for anchor in [&mut self.ls_control, &mut self.fs_control, &mut self.bulk] {
            if anchor.end == qh {
                anchor.end = prev;
            }
        }
        Ok(())
    }

    /// Hand every schedule QH back to the pool. Only valid once the
    /// controller no longer walks the frame list.
    pub fn release(self, pool: &mut DescriptorPool) {
        let mut qhs = self.interrupt.clone();
        qhs.extend([
            self.ls_control.start,
            self.fs_control.start,
            self.bulk.start,
            self.tail,
        ]);
        for qh in qhs {
            pool.dealloc_qh(qh);
        }
    }

    /// Log the chain a frame slot resolves to.
    pub fn dump_frame(&self, pool: &DescriptorPool, slot: usize) {
        let mut element = Some(self.logical[slot % FRAME_LIST_LEN]);
        let mut steps = 0;
        while let Some(current) = element {
            match current {
                ListElement::QueueHead(qh) => {
                    let entry = pool.qh(qh);
                    trace!("  QH @{:#x} {:?} {:?}", entry.phys(), entry.kind(), entry.hw());
                    element = entry.next.map(ListElement::QueueHead);
                }
                ListElement::Isoch(itd) => {
                    let entry = pool.itd(itd);
                    trace!(
                        "  iTD @{:#x} frame {} {:?}",
                        entry.phys(),
                        entry.frame_number(),
                        entry.hw()
                    );
                    element = entry.next;
                }
                ListElement::Transfer(td) => {
                    trace!("  TD @{:#x} {:?}", pool.td(td).phys(), pool.td(td).hw());
                    element = None;
                }
            }
            steps += 1;
            if steps > MAX_QH_WALK {
                break;
            }
        }
    }
}
