//! Isochronous endpoints. iTDs are linked straight into frame-list slots a
//! bounded number of frames ahead of the controller, retired onto a LIFO done
//! queue once their frame has elapsed, and handed back in frame order by the
//! scavenger.

use alloc::{collections::{BTreeMap, VecDeque}, vec, vec::Vec};
use core::time::Duration;

use usb_if::{err::TransferError, host::EndpointAddress, transfer::Direction};

use super::{
    context::Context,
    def::{FRAME_LIST_LEN, Pid, TdStatus, Token},
    descriptor::{FrameResult, ItdId, ItdState, ListElement},
    reg::RegIo,
    schedule::element_link,
    sync::IrqLock,
    transfer::{Completion, TransferBuffer, TransferRequest},
};
use crate::{PhysAddr, RequestId, USBError, err::Result};

/// Full-speed frame budget in bytes available to isochronous traffic.
pub const ISOCH_BANDWIDTH: u32 = 1023;
/// Largest full-speed isochronous packet.
pub const MAX_ISOCH_PACKET: u16 = 1023;

pub struct IsochEndpoint {
    pub(crate) address: EndpointAddress,
    pub(crate) max_packet: u16,
    /// Built frames not yet linked into the frame list, oldest first.
    pub(crate) to_do: VecDeque<ItdId>,
    /// Finished frames waiting to be reported, oldest first.
    pub(crate) done: VecDeque<ItdId>,
    pub(crate) scheduled: usize,
    pub(crate) on_producer_q: usize,
    pub(crate) on_reversed_list: usize,
}

impl IsochEndpoint {
    fn new(address: EndpointAddress, max_packet: u16) -> Self {
        Self {
            address,
            max_packet,
            to_do: VecDeque::new(),
            done: VecDeque::new(),
            scheduled: 0,
            on_producer_q: 0,
            on_reversed_list: 0,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn max_packet(&self) -> u16 {
        self.max_packet
    }

    pub fn pending(&self) -> usize {
        self.to_do.len()
    }

    pub fn scheduled(&self) -> usize {
        self.scheduled
    }

    pub fn on_producer_q(&self) -> usize {
        self.on_producer_q
    }

    pub fn on_reversed_list(&self) -> usize {
        self.on_reversed_list
    }
}

/// Head of the LIFO done queue and the number of iTDs ever pushed on it.
pub(crate) struct DoneQueue {
    pub(crate) head: Option<ItdId>,
    pub(crate) producer: u32,
}

pub struct IsochState {
    pub(crate) endpoints: BTreeMap<EndpointAddress, IsochEndpoint>,
    pub(crate) done: IrqLock<DoneQueue>,
    /// Number of iTDs ever taken off the done queue. Scavenger only.
    pub(crate) consumer: u32,
    pub(crate) bandwidth: u32,
    pub(crate) ahead: u64,
    /// Frames below this one have had their slots retired.
    pub(crate) retired_through: u64,
}

impl IsochState {
    pub fn new(ahead: u64) -> Self {
        Self {
            endpoints: BTreeMap::new(),
            done: IrqLock::new(DoneQueue {
                head: None,
                producer: 1,
            }),
            consumer: 1,
            bandwidth: ISOCH_BANDWIDTH,
            ahead,
            retired_through: 0,
        }
    }

    pub fn available_bandwidth(&self) -> u32 {
        self.bandwidth
    }

    pub fn endpoint(&self, address: &EndpointAddress) -> Option<&IsochEndpoint> {
        self.endpoints.get(address)
    }

    pub fn consumer(&self) -> u32 {
        self.consumer
    }

    pub fn create_endpoint(&mut self, address: EndpointAddress, max_packet: u16) -> Result {
        if self.endpoints.contains_key(&address) {
            return Err(USBError::InvalidParameter("isochronous endpoint exists"));
        }
        if max_packet == 0 || max_packet > MAX_ISOCH_PACKET {
            return Err(USBError::InvalidParameter("isochronous max packet"));
        }
        if max_packet as u32 > self.bandwidth {
            warn!(
                "isoch endpoint {address:?} wants {max_packet} bytes/frame, {} left",
                self.bandwidth
            );
            return Err(USBError::Busy);
        }
        self.bandwidth -= max_packet as u32;
        debug!("isoch endpoint {address:?} created, {} bytes/frame left", self.bandwidth);
        self.endpoints.insert(address, IsochEndpoint::new(address, max_packet));
        Ok(())
    }
}

/// Build one iTD per frame starting at `start_frame` and queue them on the
/// endpoint. Frames are linked into the schedule as they come within reach.
pub fn queue_frames(
    ctx: &mut Context,
    address: EndpointAddress,
    start_frame: u64,
    lengths: &[u16],
    buffer: TransferBuffer,
    completion: Completion,
) -> Result<RequestId> {
    let max_packet = ctx
        .isoch
        .endpoints
        .get(&address)
        .ok_or(USBError::NotFound)?
        .max_packet;
    if lengths.is_empty() {
        return Err(USBError::InvalidParameter("no isochronous frames"));
    }
    if lengths.iter().any(|&len| len > max_packet) {
        return Err(USBError::InvalidParameter("frame larger than max packet"));
    }
    let total: usize = lengths.iter().map(|&len| len as usize).sum();
    if total > buffer.len() {
        return Err(USBError::InvalidParameter("buffer shorter than frames"));
    }

    let mut request = TransferRequest::new(completion, buffer, lengths.len());
    request.frames = vec![None; lengths.len()];
    let request = ctx.requests.insert(request);

    let mut built = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for (i, &len) in lengths.iter().enumerate() {
        let frame = start_frame + i as u64;
        let last = i + 1 == lengths.len();
        match build_itd(ctx, address, request, i, frame, offset, len as usize, last) {
            Ok(itd) => built.push(itd),
            Err(e) => {
                warn!("isoch request for {address:?} failed at frame {frame}: {e}");
                for itd in built {
                    let buf = ctx.pool.itd_mut(itd).align_buffer.take();
                    ctx.release_align(buf);
                    ctx.free_itd(itd);
                }
                ctx.requests.remove(request);
                return Err(e);
            }
        }
        offset += len as usize;
    }

    if let Some(ep) = ctx.isoch.endpoints.get_mut(&address) {
        ep.to_do.extend(built);
    }
    Ok(request)
}

#[allow(clippy::too_many_arguments)]
fn build_itd(
    ctx: &mut Context,
    address: EndpointAddress,
    request: RequestId,
    index: usize,
    frame: u64,
    offset: usize,
    len: usize,
    last: bool,
) -> Result<ItdId> {
    let buffer = &ctx.requests.get(request).ok_or(USBError::NotFound)?.buffer;
    let id = ctx.pool.alloc_itd()?;

    let data = if len == 0 {
        PhysAddr::new(0)
    } else if let Some(phys) = buffer.contiguous_phys(offset, len) {
        phys
    } else {
        let Some(buf) = ctx.align.get_isoch() else {
            warn!("no isoch bounce buffer for frame {frame} of {address:?}");
            ctx.free_itd(id);
            return Err(USBError::NoMemory);
        };
        if address.direction == Direction::Out {
            let mut staged = vec![0u8; len];
            buffer.read_at(offset, &mut staged);
            ctx.align.fill(buf, &staged);
        }
        ctx.pool.itd_mut(id).align_buffer = Some(buf);
        ctx.align.get(buf).phys()
    };

    let pid = match address.direction {
        Direction::In => Pid::In,
        Direction::Out => Pid::Out,
    };
    let mut status = TdStatus::armed() | TdStatus::ISO;
    if last {
        status |= TdStatus::IOC;
    }

    let itd = ctx.pool.itd_mut(id);
    itd.endpoint = Some(address);
    itd.frame_number = frame;
    itd.request = Some(request);
    itd.request_frame = index;
    itd.buffer_offset = offset;
    itd.hw.set_token(Token::new(pid, address.function, address.number, false, len));
    itd.hw.set_buffer(data);
    itd.hw.set_status(status);
    Ok(id)
}

/// Link the endpoint's pending frames that fall inside the scheduling window.
/// Frames that are already due are reported as not sent.
pub fn add_frames_to_schedule(
    ctx: &mut Context,
    address: EndpointAddress,
    current: u64,
    now: Duration,
) {
    let Some(schedule) = ctx.schedule.as_mut() else {
        return;
    };
    let Some(ep) = ctx.isoch.endpoints.get_mut(&address) else {
        return;
    };
    let ahead = ctx.isoch.ahead;

    while let Some(&id) = ep.to_do.front() {
        let frame = ctx.pool.itd(id).frame_number;
        if frame >= current + ahead {
            break;
        }
        ep.to_do.pop_front();

        if frame <= current {
            debug!("isoch frame {frame} for {address:?} missed (now {current})");
            let itd = ctx.pool.itd_mut(id);
            itd.result = Some(FrameResult {
                status: Err(TransferError::NotSent),
                actual: 0,
                timestamp: now,
            });
            itd.state = ItdState::Done;
            if let Some(buf) = itd.align_buffer.take() {
                ctx.align.release(buf);
            }
            ep.done.push_back(id);
            continue;
        }

        let slot = (frame % FRAME_LIST_LEN as u64) as usize;
        let next = schedule.logical_slot(slot);
        let next_link = element_link(&ctx.pool, next);
        let itd = ctx.pool.itd_mut(id);
        itd.next = Some(next);
        itd.frame_index = slot;
        itd.state = ItdState::Scheduled;
        itd.hw.set_link(next_link);
        let link = element_link(&ctx.pool, ListElement::Isoch(id));
        schedule.frame_list().set(slot, link);
        schedule.set_logical_slot(slot, ListElement::Isoch(id));
        ep.scheduled += 1;
    }
}

/// Remove the iTDs `take` selects from the head of a slot and relink the rest.
fn unlink_slot(
    ctx: &mut Context,
    slot: usize,
    take: impl Fn(&super::descriptor::Itd) -> bool,
) -> Vec<ItdId> {
    let Some(schedule) = ctx.schedule.as_mut() else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    let mut taken = Vec::new();
    let mut element = schedule.logical_slot(slot);
    while let ListElement::Isoch(id) = element {
        let itd = ctx.pool.itd(id);
        if take(itd) {
            taken.push(id);
        } else {
            kept.push(id);
        }
        match itd.next {
            Some(next) => element = next,
            None => {
                error!("iTD @{:#x} in slot {slot} has no successor", itd.phys());
                break;
            }
        }
    }
    if taken.is_empty() {
        return taken;
    }

    let mut tail = element;
    for &id in kept.iter().rev() {
        let link = element_link(&ctx.pool, tail);
        let itd = ctx.pool.itd_mut(id);
        itd.next = Some(tail);
        itd.hw.set_link(link);
        tail = ListElement::Isoch(id);
    }
    schedule.frame_list().set(slot, element_link(&ctx.pool, tail));
    schedule.set_logical_slot(slot, tail);
    for &id in &taken {
        ctx.pool.itd_mut(id).next = None;
    }
    taken
}

/// Interrupt-time work: move every iTD whose frame has passed from the frame
/// list onto the done queue. Returns how many were retired.
pub fn retire_elapsed_frames(ctx: &mut Context, io: &dyn RegIo, current: u64) -> usize {
    if ctx.schedule.is_none() {
        return 0;
    }
    let start = ctx
        .isoch
        .retired_through
        .max(current.saturating_sub(FRAME_LIST_LEN as u64));
    let mut retired = Vec::new();
    for frame in start..current {
        let slot = (frame % FRAME_LIST_LEN as u64) as usize;
        retired.extend(unlink_slot(ctx, slot, |itd| itd.frame_number < current));
    }
    ctx.isoch.retired_through = ctx.isoch.retired_through.max(current);
    if retired.is_empty() {
        return 0;
    }

    for &id in &retired {
        let endpoint = ctx.pool.itd(id).endpoint;
        if let Some(ep) = endpoint.and_then(|a| ctx.isoch.endpoints.get_mut(&a)) {
            ep.scheduled = ep.scheduled.saturating_sub(1);
            ep.on_producer_q += 1;
        }
    }

    let mut queue = ctx.isoch.done.lock(io);
    for &id in &retired {
        let itd = ctx.pool.itd_mut(id);
        itd.done_next = queue.head;
        itd.state = ItdState::OnDoneQueue;
        queue.head = Some(id);
        queue.producer = queue.producer.wrapping_add(1);
    }
    trace!("retired {} isoch frames, producer {}", retired.len(), queue.producer);
    retired.len()
}

/// Pull every frame of `address` out of the schedule and its pending queue,
/// marking them aborted. They are reported by the next done-queue return.
pub fn abort_endpoint_frames(ctx: &mut Context, address: EndpointAddress, now: Duration) {
    let mut aborted = Vec::new();
    for slot in 0..FRAME_LIST_LEN {
        aborted.extend(unlink_slot(ctx, slot, |itd| itd.endpoint == Some(address)));
    }
    let Some(ep) = ctx.isoch.endpoints.get_mut(&address) else {
        return;
    };
    ep.scheduled = ep.scheduled.saturating_sub(aborted.len());
    aborted.extend(ep.to_do.drain(..));
    for id in aborted {
        let itd = ctx.pool.itd_mut(id);
        itd.result = Some(FrameResult {
            status: Err(TransferError::Aborted),
            actual: 0,
            timestamp: now,
        });
        itd.state = ItdState::Done;
        if let Some(buf) = itd.align_buffer.take() {
            ctx.align.release(buf);
        }
        ep.done.push_back(id);
    }
}
