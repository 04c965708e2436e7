//! Completion delivery: turns done TDs and iTDs into exactly one callback per
//! request and recycles the descriptors.

use alloc::vec::Vec;

use usb_if::err::TransferError;

use super::{
    context::Context,
    def::TdStatus,
    descriptor::{FrameResult, TdId},
    errata::Errata,
    schedule::MAX_QH_WALK,
    transfer::Completion,
    work::WorkKind,
};
use crate::{RequestId, err::ConvertUhciError};
use usb_if::host::EndpointAddress;

/// Hand a TD's bounce buffer to its request for copy-out, or release it when
/// nothing came back through it.
pub(crate) fn detach_align_buffer(ctx: &mut Context, id: TdId) {
    let td = ctx.pool.td_mut(id);
    let Some(buf) = td.align_buffer.take() else {
        return;
    };
    let is_in = td.hw.token().is_in();
    let actual = td.hw.status().actual_len();
    let request = td.request;
    let offset = td.buffer_offset;
    defer_or_release(ctx, buf, is_in, actual, request, offset);
}

pub(crate) fn defer_or_release(
    ctx: &mut Context,
    buf: super::align::AlignBufferId,
    is_in: bool,
    actual: usize,
    request: Option<RequestId>,
    offset: usize,
) {
    if !is_in || actual == 0 {
        ctx.align.release(buf);
        return;
    }
    match request.and_then(|r| ctx.requests.get_mut(r)) {
        Some(req) => {
            ctx.align.set_act_count(buf, actual);
            req.dma.defer(buf, offset);
        }
        None => {
            error!(
                "IN bounce buffer @{:#x} has no request to copy into",
                ctx.align.get(buf).phys()
            );
            ctx.align.release(buf);
        }
    }
}

fn note_babble(ctx: &Context) {
    ctx.work.submit(WorkKind::RootHubStatusChange);
    if ctx.errata.contains(Errata::RESET_AFTER_BABBLE) {
        warn!("babble on a controller that needs a reset afterwards");
        ctx.work.submit(WorkKind::ResetAfterBabble);
    }
}

/// Walk a done list once, completing each transaction at its last TD.
///
/// `forced` overrides every TD's own status, as for an abort. Walking stops
/// before `stop_before`. Returns the number of callbacks fired.
pub fn process_done_chain(
    ctx: &mut Context,
    head: Option<TdId>,
    forced: Option<TransferError>,
    stop_before: Option<TdId>,
) -> usize {
    let mut accum: Result<(), TransferError> = Ok(());
    let mut residual: u32 = 0;
    let mut visited: Vec<TdId> = Vec::new();
    let mut fired = 0;
    let mut steps = 0;
    let mut td = head;

    while let Some(id) = td {
        if Some(id) == stop_before {
            trace!("done processing stops before TD @{:#x}", ctx.pool.td(id).phys());
            break;
        }
        steps += 1;
        if steps > MAX_QH_WALK {
            error!("done list walk exceeded {MAX_QH_WALK} TDs");
            break;
        }

        let entry = ctx.pool.td(id);
        let next = entry.next();
        let status = entry.hw().status();
        let token = entry.hw().token();

        let result = if let Some(forced) = &forced {
            Err(forced.clone())
        } else if accum.is_err() {
            accum.clone()
        } else {
            let result = status.to_result();
            if let Err(e) = &result {
                debug!("TD @{:#x} failed: {e} ({:#010x})", entry.phys(), status.bits());
                if status.contains(TdStatus::BABBLE) {
                    note_babble(ctx);
                }
            }
            accum = result.clone();
            result
        };

        residual += token.max_len().saturating_sub(status.actual_len()) as u32;
        detach_align_buffer(ctx, id);
        visited.push(id);

        let entry = ctx.pool.td(id);
        if entry.is_last_of_transaction() {
            let request = entry.request();
            if complete_transaction(ctx, request, result, residual) {
                fired += 1;
            }
            for done in visited.drain(..) {
                ctx.pool.dealloc_td(done);
            }
            residual = 0;
            accum = Ok(());
        }
        td = next;
    }

    if !visited.is_empty() {
        warn!("{} done TDs without a closing TD", visited.len());
        for done in visited {
            ctx.pool.dealloc_td(done);
        }
    }
    fired
}

/// Apply one transaction's outcome to its request. Returns true if the
/// request's callback fired.
fn complete_transaction(
    ctx: &mut Context,
    request: Option<RequestId>,
    result: Result<(), TransferError>,
    residual: u32,
) -> bool {
    let Some(id) = request else {
        error!("completed transaction has no request");
        return false;
    };
    let Some(req) = ctx.requests.get_mut(id) else {
        error!("request {:#x} vanished before completion", id);
        return false;
    };
    req.phases_left = req.phases_left.saturating_sub(1);
    if req.finished {
        // Already reported; this phase only needs retiring.
        if req.phases_left == 0 {
            if let Some(mut req) = ctx.requests.remove(id) {
                req.dma.discard(&mut ctx.align);
            }
        }
        return false;
    }

    req.remaining += residual;
    if let Err(e) = result {
        req.status = Err(e);
    }
    if req.status.is_ok() && req.phases_left > 0 {
        return false;
    }

    req.finished = true;
    req.dma.complete(&mut ctx.align, &req.buffer);
    let completion = req.completion.take();
    let status = req.status.clone();
    let remaining = req.remaining;
    let control_bulk = req.control_bulk;
    if req.phases_left == 0 {
        ctx.requests.remove(id);
    }

    invoke(completion, status, remaining, &[]);
    if control_bulk {
        ctx.control_bulk_finished();
    }
    true
}

fn invoke(
    completion: Option<Completion>,
    status: Result<(), TransferError>,
    remaining: u32,
    frames: &[FrameResult],
) {
    match completion {
        Some(Completion::Transfer(f)) => f(status, remaining),
        Some(Completion::Isoch(f)) => f(status, frames),
        None => error!("request completed twice"),
    }
}

/// Report every finished frame of an isochronous endpoint and free its iTDs.
pub fn return_isoch_done_queue(ctx: &mut Context, address: EndpointAddress) -> usize {
    let mut fired = 0;
    loop {
        let Some(id) = ctx
            .isoch
            .endpoints
            .get_mut(&address)
            .and_then(|ep| ep.done.pop_front())
        else {
            break;
        };
        let itd = ctx.pool.itd_mut(id);
        let result = itd.result.take().unwrap_or(FrameResult {
            status: Err(TransferError::NotSent),
            actual: 0,
            timestamp: Default::default(),
        });
        let request = itd.request;
        let index = itd.request_frame;
        ctx.free_itd(id);
        if complete_isoch_frame(ctx, request, index, result) {
            fired += 1;
        }
    }
    fired
}

/// Record one frame's result; the request completes with its last frame.
pub(crate) fn complete_isoch_frame(
    ctx: &mut Context,
    request: Option<RequestId>,
    index: usize,
    result: FrameResult,
) -> bool {
    let Some(id) = request else {
        error!("isochronous frame has no request");
        return false;
    };
    let Some(req) = ctx.requests.get_mut(id) else {
        error!("isochronous request {:#x} vanished before completion", id);
        return false;
    };
    match req.frames.get_mut(index) {
        Some(slot) => *slot = Some(result),
        None => error!("isochronous frame {index} outside its request"),
    }
    req.phases_left = req.phases_left.saturating_sub(1);
    if req.phases_left > 0 {
        return false;
    }

    let Some(mut req) = ctx.requests.remove(id) else {
        return false;
    };
    req.dma.complete(&mut ctx.align, &req.buffer);
    let frames: Vec<FrameResult> = req
        .frames
        .drain(..)
        .map(|f| {
            f.unwrap_or(FrameResult {
                status: Err(TransferError::NotSent),
                actual: 0,
                timestamp: Default::default(),
            })
        })
        .collect();
    let status = frames
        .iter()
        .find_map(|f| match &f.status {
            Err(e) if !e.is_soft() => Some(Err(e.clone())),
            _ => None,
        })
        .unwrap_or(Ok(()));
    let moved: usize = frames.iter().map(|f| f.actual as usize).sum();
    let remaining = req.buffer.len().saturating_sub(moved) as u32;
    invoke(req.completion.take(), status, remaining, &frames);
    true
}
