//! Per-endpoint TD chains hanging off a QH's element link.
//!
//! The software chain runs from `first` to `last` through each TD's `next`.
//! The hardware follows the same TDs through their link words, with T after
//! the last one. An empty chain has no TDs at all.

use core::time::Duration;

use mbarrier::mb;
use usb_if::{err::TransferError, transfer::EndpointType};

use super::{
    context::Context,
    def::{Link, LinkFlags},
    descriptor::{QhId, QhKind, TdId},
    dispatch::process_done_chain,
    pool::DescriptorPool,
};
use crate::RequestId;

/// A fully initialized run of TDs for one request, not yet visible to the
/// controller.
#[must_use = "a built chain must be queued or discarded"]
#[derive(Debug)]
pub struct TdChain {
    pub(crate) first: TdId,
    pub(crate) last: TdId,
    pub(crate) qh: QhId,
    pub(crate) request: RequestId,
    pub(crate) len: usize,
    pub(crate) kind: EndpointType,
}

impl TdChain {
    pub fn first(&self) -> TdId {
        self.first
    }

    pub fn last(&self) -> TdId {
        self.last
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Link a TD's hardware word to its successor, depth first so the controller
/// keeps working the same queue.
pub(crate) fn td_link(pool: &DescriptorPool, next: Option<TdId>) -> Link {
    match next {
        Some(id) => Link::td(pool.td(id).phys()).with(LinkFlags::DEPTH_FIRST),
        None => Link::TERMINATE,
    }
}

/// Splice `chain` onto the tail of the QH.
pub fn append_transaction(pool: &mut DescriptorPool, qh: QhId, chain: TdChain) {
    let element = Link::td(pool.td(chain.first).phys());
    match pool.qh(qh).last {
        None => {
            let entry = pool.qh_mut(qh);
            entry.first = Some(chain.first);
            entry.last = Some(chain.last);
            if !entry.stalled {
                entry.hw.set_element(element);
            }
        }
        Some(tail) => {
            let link = td_link(pool, Some(chain.first));
            pool.td_mut(tail).next = Some(chain.first);
            pool.td(tail).hw().set_link(link);
            mb();
            let entry = pool.qh_mut(qh);
            entry.last = Some(chain.last);
            // The controller may have run off the old tail before the new link
            // landed; it then parked the element link on T.
            if !entry.stalled && entry.hw.element().is_terminate() {
                trace!("QH @{:#x} ran dry during append, re-arming", entry.phys);
                entry.hw.set_element(element);
            }
        }
    }
}

/// Detach every TD from the QH and complete them all with `Aborted`.
pub fn abort_transaction(ctx: &mut Context, qh: QhId) {
    let entry = ctx.pool.qh(qh);
    entry.hw().set_element(Link::TERMINATE);
    if entry.is_empty() {
        return;
    }
    // Let the controller finish the frame it may be spending on this QH.
    ctx.kernel.delay(Duration::from_millis(1));

    let first = ctx.pool.qh(qh).first;
    let next_toggle = resume_toggle(&ctx.pool, first);
    let entry = ctx.pool.qh_mut(qh);
    entry.first = None;
    entry.last = None;
    if let Some(toggle) = next_toggle {
        entry.next_toggle = toggle;
    }
    debug!("aborting transfers on QH @{:#x}", entry.phys);
    process_done_chain(ctx, first, Some(TransferError::Aborted), None);
}

/// The toggle the device expects next, judged from the first TD the
/// controller has not executed.
fn resume_toggle(pool: &DescriptorPool, first: Option<TdId>) -> Option<bool> {
    let mut td = first;
    let mut last_done = None;
    while let Some(id) = td {
        let entry = pool.td(id);
        let token = entry.hw().token();
        if entry.hw().status().is_active() {
            return Some(token.toggle());
        }
        last_done = Some(!token.toggle());
        td = entry.next();
    }
    last_done
}

/// Restart a halted QH once the device side has been cleared.
pub fn clear_halt(ctx: &mut Context, qh: QhId) {
    ctx.pool.qh_mut(qh).stalled = false;

    // Leftover phases of requests that already failed never run.
    let mut td = ctx.pool.qh(qh).first;
    let mut retired_tail = None;
    while let Some(id) = td {
        let finished = ctx
            .pool
            .td(id)
            .request()
            .and_then(|r| ctx.requests.get(r))
            .is_none_or(|r| r.is_finished());
        if !finished {
            break;
        }
        retired_tail = Some(id);
        td = ctx.pool.td(id).next();
    }
    if let Some(tail) = retired_tail {
        let head = ctx.pool.qh(qh).first;
        ctx.pool.td_mut(tail).next = None;
        let entry = ctx.pool.qh_mut(qh);
        entry.first = td;
        if td.is_none() {
            entry.last = None;
        }
        process_done_chain(ctx, head, None, None);
    }

    if ctx.pool.qh(qh).kind() != QhKind::Control {
        rewrite_toggles(&mut ctx.pool, td, false);
        let next = toggle_after(&ctx.pool, td, false);
        ctx.pool.qh_mut(qh).next_toggle = next;
    }
    let link = td_link(&ctx.pool, td).without(LinkFlags::DEPTH_FIRST);
    ctx.pool.qh(qh).hw().set_element(link);
    debug!("QH @{:#x} halt cleared", ctx.pool.qh(qh).phys());
}

/// Give the TDs from `from` onwards alternating toggles starting at `start`.
/// Returns how many TDs were rewritten.
pub(crate) fn rewrite_toggles(pool: &mut DescriptorPool, from: Option<TdId>, start: bool) -> usize {
    let mut toggle = start;
    let mut td = from;
    let mut count = 0;
    while let Some(id) = td {
        let hw = pool.td(id).hw();
        hw.set_token(hw.token().with_toggle(toggle));
        toggle = !toggle;
        count += 1;
        td = pool.td(id).next();
    }
    count
}

fn toggle_after(pool: &DescriptorPool, from: Option<TdId>, start: bool) -> bool {
    let mut toggle = start;
    let mut td = from;
    while let Some(id) = td {
        toggle = !toggle;
        td = pool.td(id).next();
    }
    toggle
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use usb_if::{
        host::{DeviceSpeed, EndpointAddress},
        transfer::Direction,
    };

    use super::*;
    use crate::backend::uhci::{
        chain::build_transfer,
        def::TdStatus,
        descriptor::EndpointInfo,
        test_support::{TestBed, recorder},
        transfer::Completion,
    };
    use crate::Kernel;

    fn bulk_in(bed: &mut TestBed) -> QhId {
        bed.endpoint(EndpointInfo::new(
            EndpointAddress::new(1, 1, Direction::In),
            EndpointType::Bulk,
            DeviceSpeed::Full,
            8,
        ))
    }

    fn build(bed: &mut TestBed, qh: QhId, len: usize, completion: Completion) -> TdChain {
        let (buffer, mem) = bed.dma_buffer(len);
        // The buffer only has to outlive the test's simulated transfers.
        core::mem::forget(mem);
        bed.ctx.control_bulk_started();
        build_transfer(&mut bed.ctx, qh, None, buffer, completion).unwrap()
    }

    #[test]
    fn append_links_behind_the_tail() {
        let mut bed = TestBed::with_schedule();
        let qh = bulk_in(&mut bed);
        let (_log, completion) = recorder();

        let first = build(&mut bed, qh, 16, completion());
        let (head, tail) = (first.first(), first.last());
        append_transaction(&mut bed.ctx.pool, qh, first);
        let element = bed.ctx.pool.qh(qh).hw().element();
        assert_eq!(element, Link::td(bed.ctx.pool.td(head).phys()));
        assert!(!element.flags().contains(LinkFlags::DEPTH_FIRST));

        let second = build(&mut bed, qh, 8, completion());
        let second_first = second.first();
        append_transaction(&mut bed.ctx.pool, qh, second);
        assert_eq!(bed.ctx.pool.td(tail).next(), Some(second_first));
        assert_eq!(
            bed.ctx.pool.td(tail).hw().link(),
            Link::td(bed.ctx.pool.td(second_first).phys()).with(LinkFlags::DEPTH_FIRST)
        );
        assert_eq!(bed.ctx.pool.qh(qh).first(), Some(head));
        assert_eq!(bed.ctx.pool.qh(qh).last(), Some(second_first));
        // Untouched while the controller still has work.
        assert_eq!(bed.ctx.pool.qh(qh).hw().element(), element);
    }

    #[test]
    fn append_rearms_a_parked_queue_head() {
        let mut bed = TestBed::with_schedule();
        let qh = bulk_in(&mut bed);
        let (_log, completion) = recorder();
        let first = build(&mut bed, qh, 8, completion());
        append_transaction(&mut bed.ctx.pool, qh, first);

        // The controller retired the TD and parked on T before we noticed.
        bed.ctx.pool.qh(qh).hw().set_element(Link::TERMINATE);
        let second = build(&mut bed, qh, 8, completion());
        let second_first = second.first();
        append_transaction(&mut bed.ctx.pool, qh, second);
        assert_eq!(
            bed.ctx.pool.qh(qh).hw().element(),
            Link::td(bed.ctx.pool.td(second_first).phys())
        );

        // A stalled QH stays parked.
        bed.ctx.pool.qh_mut(qh).stalled = true;
        bed.ctx.pool.qh(qh).hw().set_element(Link::TERMINATE);
        let third = build(&mut bed, qh, 8, completion());
        append_transaction(&mut bed.ctx.pool, qh, third);
        assert!(bed.ctx.pool.qh(qh).hw().element().is_terminate());
    }

    #[test]
    fn abort_reports_once_and_keeps_the_toggle() {
        let mut bed = TestBed::with_schedule();
        let qh = bulk_in(&mut bed);
        let (log, completion) = recorder();
        let first = build(&mut bed, qh, 24, completion());
        let tds = bed.chain_tds(first.first());
        append_transaction(&mut bed.ctx.pool, qh, first);
        let second = build(&mut bed, qh, 8, completion());
        append_transaction(&mut bed.ctx.pool, qh, second);
        let free_before = bed.ctx.pool.free_td_count();

        // The controller got through one packet.
        let hw = bed.ctx.pool.td(tds[0]).hw();
        hw.set_status((hw.status() - TdStatus::ACTIVE).with_actual_len(8));

        abort_transaction(&mut bed.ctx, qh);
        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|(status, _)| *status == Err(TransferError::Aborted)));
        drop(log);

        let entry = bed.ctx.pool.qh(qh);
        assert!(entry.is_empty());
        assert!(entry.hw().element().is_terminate());
        // Resumes with the toggle of the first packet that never went out.
        assert!(entry.next_toggle());
        assert_eq!(bed.ctx.pool.free_td_count(), free_before + 4);
        assert_eq!(bed.ctx.outstanding_requests(), 0);
        assert_eq!(bed.kernel.now(), Duration::from_millis(1));

        // Nothing left to abort.
        abort_transaction(&mut bed.ctx, qh);
        assert_eq!(bed.kernel.now(), Duration::from_millis(1));
    }

    #[test]
    fn clear_halt_restarts_from_data0() {
        let mut bed = TestBed::with_schedule();
        let qh = bulk_in(&mut bed);
        let (_log, completion) = recorder();
        let first = build(&mut bed, qh, 8, completion());
        append_transaction(&mut bed.ctx.pool, qh, first);
        let second = build(&mut bed, qh, 24, completion());
        let tds = bed.chain_tds(second.first());
        append_transaction(&mut bed.ctx.pool, qh, second);
        // Pretend the first transfer completed and the device then stalled
        // with DATA1 expected next.
        let head = bed.ctx.pool.qh(qh).first();
        bed.ctx.pool.qh_mut(qh).first = Some(tds[0]);
        if let Some(head) = head {
            bed.ctx.pool.dealloc_td(head);
        }
        bed.ctx.pool.qh_mut(qh).stalled = true;
        bed.ctx.pool.qh(qh).hw().set_element(Link::TERMINATE);

        clear_halt(&mut bed.ctx, qh);
        let toggles: Vec<bool> = tds
            .iter()
            .map(|&t| bed.ctx.pool.td(t).hw().token().toggle())
            .collect();
        assert_eq!(toggles, [false, true, false]);
        let entry = bed.ctx.pool.qh(qh);
        assert!(!entry.is_stalled());
        assert!(entry.next_toggle());
        assert_eq!(entry.hw().element(), Link::td(bed.ctx.pool.td(tds[0]).phys()));
    }

    #[test]
    fn toggle_rewrite_counts_tds() {
        let mut bed = TestBed::with_schedule();
        let qh = bulk_in(&mut bed);
        let chain = build(&mut bed, qh, 40, Completion::new(|_, _| {}));
        let first = chain.first();
        append_transaction(&mut bed.ctx.pool, qh, chain);
        assert_eq!(rewrite_toggles(&mut bed.ctx.pool, Some(first), true), 5);
        assert!(!toggle_after(&bed.ctx.pool, Some(first), true));
        assert_eq!(resume_toggle(&bed.ctx.pool, Some(first)), Some(true));
        assert_eq!(rewrite_toggles(&mut bed.ctx.pool, None, true), 0);
    }
}
