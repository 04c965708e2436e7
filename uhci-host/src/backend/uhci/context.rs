use alloc::{collections::BTreeMap, sync::Arc};

use usb_if::host::EndpointAddress;

use super::{
    align::{AlignBufferId, AlignmentPools},
    descriptor::{ItdId, QhId},
    dma::DmaAllocator,
    errata::Errata,
    isoch::IsochState,
    pool::DescriptorPool,
    schedule::Schedule,
    transfer::RequestTable,
    work::WorkQueue,
};
use crate::Kernel;

/// Everything the schedule, scavenger and dispatcher share.
///
/// Only the isochronous done queue is touched from interrupt context; it sits
/// behind its own lock inside [`IsochState`]. The rest is reached through
/// `&mut Context`.
pub struct Context {
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) pool: DescriptorPool,
    pub(crate) align: AlignmentPools,
    pub(crate) schedule: Option<Schedule>,
    pub(crate) requests: RequestTable,
    pub(crate) endpoints: BTreeMap<EndpointAddress, QhId>,
    pub(crate) isoch: IsochState,
    pub(crate) work: WorkQueue,
    pub(crate) errata: Errata,
    /// Control and bulk requests queued but not yet completed.
    pub(crate) control_bulk_out: u32,
}

impl Context {
    pub fn new(
        dma: Arc<dyn DmaAllocator>,
        kernel: Arc<dyn Kernel>,
        errata: Errata,
        isoch_schedule_ahead: u64,
    ) -> Self {
        Self {
            pool: DescriptorPool::new(dma.clone()),
            align: AlignmentPools::new(dma.clone()),
            dma,
            kernel,
            schedule: None,
            requests: RequestTable::default(),
            endpoints: BTreeMap::new(),
            isoch: IsochState::new(isoch_schedule_ahead),
            work: WorkQueue::new(),
            errata,
            control_bulk_out: 0,
        }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn align(&self) -> &AlignmentPools {
        &self.align
    }

    pub fn isoch(&self) -> &IsochState {
        &self.isoch
    }

    pub fn work(&self) -> &WorkQueue {
        &self.work
    }

    pub fn endpoint_qh(&self, address: &EndpointAddress) -> Option<QhId> {
        self.endpoints.get(address).copied()
    }

    pub fn control_bulk_outstanding(&self) -> u32 {
        self.control_bulk_out
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    /// Return an iTD to the pool along with any bounce buffer it still holds.
    pub(crate) fn free_itd(&mut self, id: ItdId) {
        if let Some(buf) = self.pool.dealloc_itd(id) {
            self.align.release(buf);
        }
    }

    pub(crate) fn release_align(&mut self, id: Option<AlignBufferId>) {
        if let Some(id) = id {
            self.align.release(id);
        }
    }

    /// One control/bulk request more in flight; reclamation must be on.
    pub(crate) fn control_bulk_started(&mut self) {
        self.control_bulk_out += 1;
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.set_reclamation(&self.pool, true);
        }
    }

    pub(crate) fn control_bulk_finished(&mut self) {
        if self.control_bulk_out == 0 {
            error!("outstanding control/bulk count underrun");
            return;
        }
        self.control_bulk_out -= 1;
        if self.control_bulk_out == 0 {
            trace!("no control/bulk work left, terminating reclamation loop");
            if let Some(schedule) = self.schedule.as_mut() {
                schedule.set_reclamation(&self.pool, false);
            }
        }
    }
}
