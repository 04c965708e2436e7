//! Finds completed work in hardware-owned lists.
//!
//! Two independent passes: the isochronous done queue, which is reversed from
//! its LIFO production order, and the QH tree, where each endpoint's TD chain
//! is walked from its first TD until an active one.

use alloc::vec::Vec;
use core::time::Duration;

use usb_if::err::TransferError;

use super::{
    context::Context,
    def::{Link, TdStatus},
    descriptor::{FrameResult, ItdId, ItdState, QhId, QhKind, TdId},
    dispatch::{
        complete_isoch_frame, defer_or_release, detach_align_buffer, process_done_chain,
        return_isoch_done_queue,
    },
    isoch::add_frames_to_schedule,
    queue_head::rewrite_toggles,
    reg::RegIo,
    schedule::MAX_QH_WALK,
};
use crate::err::ConvertUhciError;

/// Done lists longer than this hint at a corrupted chain.
const DONE_LIST_WARN: usize = 1000;

/// Completed TDs in discovery order, linked through their `next` fields.
#[derive(Default)]
struct DoneList {
    head: Option<TdId>,
    tail: Option<TdId>,
    len: usize,
}

impl DoneList {
    fn push_range(&mut self, ctx: &mut Context, first: TdId, last: TdId, count: usize) {
        ctx.pool.td_mut(last).next = None;
        match self.tail {
            Some(tail) => ctx.pool.td_mut(tail).next = Some(first),
            None => self.head = Some(first),
        }
        self.tail = Some(last);
        self.len += count;
    }
}

/// Drain the isochronous done queue and report finished frames. Returns the
/// number of iTDs taken off the queue.
pub fn scavenge_isoch(ctx: &mut Context, io: &dyn RegIo, current: u64) -> usize {
    let (head, producer) = {
        let queue = ctx.isoch.done.lock(io);
        (queue.head, queue.producer)
    };
    let mut consumer = ctx.isoch.consumer;
    let start = consumer;
    let now = ctx.kernel.now();

    if head.is_some() && consumer != producer {
        // Reverse into frame order.
        let mut prev: Option<ItdId> = None;
        let mut cur = head;
        while let Some(id) = cur {
            let itd = ctx.pool.itd_mut(id);
            let older = itd.done_next;
            itd.done_next = prev;
            itd.state = ItdState::Reversed;
            let endpoint = itd.endpoint;
            if let Some(ep) = endpoint.and_then(|a| ctx.isoch.endpoints.get_mut(&a)) {
                ep.on_producer_q = ep.on_producer_q.saturating_sub(1);
                ep.on_reversed_list += 1;
            }
            prev = Some(id);
            consumer = consumer.wrapping_add(1);
            if consumer == producer {
                break;
            }
            cur = older;
            if cur.is_none() {
                error!("isoch done queue ended {} entries early", producer.wrapping_sub(consumer));
            }
        }
        ctx.isoch.consumer = consumer;
        trace!("isoch done queue reversed, consumer now {consumer}");

        let mut cur = prev;
        while let Some(id) = cur {
            let itd = ctx.pool.itd_mut(id);
            cur = itd.done_next.take();
            let endpoint = itd.endpoint;
            if let Some(ep) = endpoint.and_then(|a| ctx.isoch.endpoints.get_mut(&a)) {
                ep.on_reversed_list = ep.on_reversed_list.saturating_sub(1);
            }
            finalize_itd(ctx, id, now);
        }
    }

    let addresses: Vec<_> = ctx.isoch.endpoints.keys().copied().collect();
    for address in addresses {
        if let Some(ep) = ctx.isoch.endpoints.get(&address)
            && ep.on_reversed_list != 0
        {
            warn!(
                "isoch endpoint {address:?} still has {} iTDs on the reversed list",
                ep.on_reversed_list
            );
        }
        return_isoch_done_queue(ctx, address);
        add_frames_to_schedule(ctx, address, current, now);
    }
    consumer.wrapping_sub(start) as usize
}

fn finalize_itd(ctx: &mut Context, id: ItdId, now: Duration) {
    let itd = ctx.pool.itd_mut(id);
    let status = itd.hw.status();
    let token = itd.hw.token();
    let actual = if status.is_active() { 0 } else { status.actual_len() };
    let frame_status = if status.is_active() {
        Err(TransferError::NotSent)
    } else {
        match status.to_result() {
            Ok(()) if token.is_in() && actual < token.max_len() => Err(TransferError::Underrun),
            other => other,
        }
    };
    if let Err(e) = &frame_status
        && *e != TransferError::Underrun
    {
        debug!("isoch frame {} failed: {e}", itd.frame_number);
    }
    let result = FrameResult {
        status: frame_status,
        actual: actual as u16,
        timestamp: now,
    };
    let endpoint = itd.endpoint;
    let request = itd.request;
    let index = itd.request_frame;
    let offset = itd.buffer_offset;
    let buf = itd.align_buffer.take();

    if let Some(buf) = buf {
        defer_or_release(ctx, buf, token.is_in(), actual, request, offset);
    }

    if let Some(ep) = endpoint.and_then(|a| ctx.isoch.endpoints.get_mut(&a)) {
        let itd = ctx.pool.itd_mut(id);
        itd.result = Some(result);
        itd.state = ItdState::Done;
        ep.done.push_back(id);
        return;
    }
    error!("iTD @{:#x} belongs to no isochronous endpoint", ctx.pool.itd(id).phys());
    ctx.free_itd(id);
    complete_isoch_frame(ctx, request, index, result);
}

/// Walk the QH tree and complete every finished transaction. Returns the
/// number of TDs retired.
pub fn scavenge_queue_heads(ctx: &mut Context) -> usize {
    let Some(start) = ctx.schedule.as_ref().map(|s| s.walk_start()) else {
        return 0;
    };
    let mut done = DoneList::default();
    let mut qh = Some(start);
    let mut visited = 0;
    while let Some(id) = qh {
        visited += 1;
        if visited > MAX_QH_WALK {
            error!("QH walk exceeded {MAX_QH_WALK} entries, schedule looks corrupted");
            break;
        }
        let entry = ctx.pool.qh(id);
        if entry.kind() != QhKind::Dummy && !entry.is_stalled() {
            scavenge_queue_head(ctx, id, &mut done);
        }
        qh = ctx.pool.qh(id).next();
    }

    if done.len > DONE_LIST_WARN {
        warn!("{} TDs completed in one pass", done.len);
    }
    if done.head.is_some() {
        process_done_chain(ctx, done.head, None, None);
    }
    done.len
}

fn scavenge_queue_head(ctx: &mut Context, qh: QhId, done: &mut DoneList) {
    let kind = ctx.pool.qh(qh).kind();
    let mut td = ctx.pool.qh(qh).first();
    let mut head = td;
    let mut run = 0;
    let mut halted = false;
    let mut short = false;
    let mut short_toggle = false;
    let mut steps = 0;

    while let Some(id) = td {
        steps += 1;
        if steps > MAX_QH_WALK {
            error!("TD walk on QH @{:#x} exceeded {MAX_QH_WALK} entries", ctx.pool.qh(qh).phys());
            break;
        }
        let hw = ctx.pool.td(id).hw();
        let status = hw.status();
        let token = hw.token();

        if !halted && !short {
            if status.is_active() {
                let entry = ctx.pool.qh(qh);
                if run == 0 && !entry.is_stalled() && entry.hw().element().is_terminate() {
                    debug!("QH @{:#x} parked on T with work queued, re-arming", entry.phys());
                    entry.hw().set_element(Link::td(ctx.pool.td(id).phys()));
                }
                break;
            }
            if status.contains(TdStatus::STALLED) {
                debug!("TD @{:#x} stalled", ctx.pool.td(id).phys());
                halted = true;
                ctx.pool.qh_mut(qh).stalled = true;
            } else if status.contains(TdStatus::SPD) && status.actual_len() < token.max_len() {
                trace!(
                    "TD @{:#x} short: {} of {}",
                    ctx.pool.td(id).phys(),
                    status.actual_len(),
                    token.max_len()
                );
                short = true;
                short_toggle = token.toggle();
            }
        }

        detach_align_buffer(ctx, id);
        run += 1;
        let entry = ctx.pool.td(id);
        let next = entry.next();
        if !entry.is_last_of_transaction() {
            if next.is_none() {
                error!("TD chain on QH @{:#x} ends inside a transaction", ctx.pool.qh(qh).phys());
            }
            td = next;
            continue;
        }

        if let Some(first) = head {
            done.push_range(ctx, first, id, run);
        }
        let entry = ctx.pool.qh_mut(qh);
        entry.first = next;
        if next.is_none() {
            entry.last = None;
        }

        if halted {
            // Whatever follows waits for a clear-halt or an abort.
            ctx.pool.qh(qh).hw().set_element(Link::TERMINATE);
            break;
        }
        if short {
            if kind != QhKind::Control {
                fix_toggles_after_short(ctx, qh, next, short_toggle);
            }
            // The controller did not advance past the short packet.
            let link = match next {
                Some(n) => Link::td(ctx.pool.td(n).phys()),
                None => Link::TERMINATE,
            };
            ctx.pool.qh(qh).hw().set_element(link);
        }

        halted = false;
        short = false;
        run = 0;
        head = next;
        td = next;
    }
}

/// The device consumed fewer packets than queued, so the toggles the
/// remaining TDs were built with may be off by one.
fn fix_toggles_after_short(ctx: &mut Context, qh: QhId, next: Option<TdId>, short_toggle: bool) {
    let Some(n) = next else {
        ctx.pool.qh_mut(qh).next_toggle = !short_toggle;
        return;
    };
    if ctx.pool.td(n).hw().token().toggle() != short_toggle {
        return;
    }
    let count = rewrite_toggles(&mut ctx.pool, Some(n), !short_toggle);
    trace!("rewrote {count} toggles on QH @{:#x}", ctx.pool.qh(qh).phys());
    // Toggle after the last rewritten TD.
    ctx.pool.qh_mut(qh).next_toggle = if count % 2 == 1 { short_toggle } else { !short_toggle };
}
