//! Turns a transfer request into a ready-to-queue TD chain.

use alloc::{vec, vec::Vec};

use usb_if::{
    host::DeviceSpeed,
    transfer::{ControlSetup, Direction, EndpointType},
};

use super::{
    align::CBI_ALIGN_SIZE,
    context::Context,
    def::{Link, Pid, TdStatus, Token},
    descriptor::{EndpointInfo, QhId, TdId},
    queue_head::{TdChain, td_link},
    transfer::{Completion, TransferBuffer, TransferRequest},
};
use crate::{PhysAddr, RequestId, USBError, err::Result};

const SETUP_LEN: usize = 8;

fn data_pid(direction: Direction) -> Pid {
    match direction {
        Direction::In => Pid::In,
        Direction::Out => Pid::Out,
    }
}

struct Builder<'a> {
    ctx: &'a mut Context,
    qh: QhId,
    info: EndpointInfo,
    request: RequestId,
    tds: Vec<TdId>,
}

impl Builder<'_> {
    fn packet(
        &mut self,
        pid: Pid,
        toggle: bool,
        offset: usize,
        len: usize,
        setup: Option<&[u8]>,
    ) -> Result<TdId> {
        let ctx = &mut *self.ctx;
        let id = ctx.pool.alloc_td(Some(self.qh))?;
        if let Some(&prev) = self.tds.last() {
            let link = td_link(&ctx.pool, Some(id));
            ctx.pool.td_mut(prev).next = Some(id);
            ctx.pool.td(prev).hw().set_link(link);
        }
        self.tds.push(id);

        let buffer = &ctx.requests.get(self.request).ok_or(USBError::NotFound)?.buffer;
        let contiguous = if setup.is_none() && len > 0 {
            buffer.contiguous_phys(offset, len)
        } else {
            None
        };
        let data = match (setup, contiguous) {
            (None, _) if len == 0 => PhysAddr::new(0),
            (None, Some(phys)) => phys,
            _ => {
                if len > CBI_ALIGN_SIZE {
                    return Err(USBError::InvalidParameter("packet too large to bounce"));
                }
                let buf = ctx.align.get_cbi().ok_or(USBError::NoMemory)?;
                ctx.pool.td_mut(id).align_buffer = Some(buf);
                match setup {
                    Some(bytes) => ctx.align.fill(buf, bytes),
                    None if pid == Pid::Out => {
                        let mut staged = vec![0u8; len];
                        buffer.read_at(offset, &mut staged);
                        ctx.align.fill(buf, &staged);
                    }
                    None => {}
                }
                trace!(
                    "packet at offset {offset} ({len} bytes) bounced through {:#x}",
                    ctx.align.get(buf).phys()
                );
                ctx.align.get(buf).phys()
            }
        };

        let mut status = TdStatus::armed();
        if pid == Pid::In {
            status |= TdStatus::SPD;
        }
        if self.info.speed == DeviceSpeed::Low {
            status |= TdStatus::LOW_SPEED;
        }
        let address = self.info.address;
        let td = ctx.pool.td_mut(id);
        td.request = Some(self.request);
        td.buffer_offset = offset;
        td.hw.set_link(Link::TERMINATE);
        td.hw.set_token(Token::new(pid, address.function, address.number, toggle, len));
        td.hw.set_buffer(data);
        td.hw.set_status(status);
        Ok(id)
    }

    /// Packetize `total` bytes at max packet size. Returns the toggle the
    /// next packet would carry.
    fn data_stage(&mut self, pid: Pid, mut toggle: bool, total: usize) -> Result<bool> {
        let max_packet = self.info.max_packet as usize;
        let mut offset = 0;
        loop {
            let len = max_packet.min(total - offset);
            self.packet(pid, toggle, offset, len, None)?;
            toggle = !toggle;
            offset += len;
            if offset >= total {
                break;
            }
        }
        self.end_transaction();
        Ok(toggle)
    }

    fn end_transaction(&mut self) {
        if let Some(&last) = self.tds.last() {
            self.ctx.pool.td_mut(last).last_of_transaction = true;
        }
    }

    fn finish(self, kind: EndpointType) -> Result<TdChain> {
        let (Some(&first), Some(&last)) = (self.tds.first(), self.tds.last()) else {
            return Err(USBError::InvalidParameter("empty transfer"));
        };
        let hw = self.ctx.pool.td(last).hw();
        hw.set_status(hw.status() | TdStatus::IOC);
        Ok(TdChain {
            first,
            last,
            qh: self.qh,
            request: self.request,
            len: self.tds.len(),
            kind,
        })
    }

    fn unwind(self) {
        for id in self.tds {
            let buf = self.ctx.pool.td_mut(id).align_buffer.take();
            self.ctx.release_align(buf);
            self.ctx.pool.dealloc_td(id);
        }
        if let Some(mut request) = self.ctx.requests.remove(self.request) {
            request.dma.discard(&mut self.ctx.align);
        }
    }
}

/// Build the TD chain for one request on the endpoint behind `qh`.
///
/// Control endpoints need `setup`; the data stage then moves
/// `setup.length` bytes. Other endpoints move the whole buffer. On failure
/// every TD and bounce buffer taken so far is returned.
pub fn build_transfer(
    ctx: &mut Context,
    qh: QhId,
    setup: Option<ControlSetup>,
    buffer: TransferBuffer,
    completion: Completion,
) -> Result<TdChain> {
    let info = *ctx
        .pool
        .qh(qh)
        .endpoint()
        .ok_or(USBError::InvalidParameter("queue head has no endpoint"))?;
    if info.max_packet == 0 {
        return Err(USBError::InvalidParameter("zero max packet"));
    }
    let kind = info.kind;
    let data_len = match (kind, setup.as_ref()) {
        (EndpointType::Control, Some(setup)) => setup.length as usize,
        (EndpointType::Control, None) => {
            return Err(USBError::InvalidParameter("control transfer without setup"));
        }
        (EndpointType::Bulk | EndpointType::Interrupt, None) => buffer.len(),
        (EndpointType::Bulk | EndpointType::Interrupt, Some(_)) => {
            return Err(USBError::InvalidParameter("setup packet on a non-control endpoint"));
        }
        (EndpointType::Isochronous, _) => {
            return Err(USBError::InvalidParameter("isochronous endpoints take frame lists"));
        }
    };
    if data_len > buffer.len() {
        return Err(USBError::InvalidParameter("buffer shorter than transfer"));
    }

    let phases = match setup {
        Some(_) if data_len > 0 => 3,
        Some(_) => 2,
        None => 1,
    };
    let mut request = TransferRequest::new(completion, buffer, phases);
    request.control_bulk = matches!(kind, EndpointType::Control | EndpointType::Bulk);
    let request = ctx.requests.insert(request);

    let mut builder = Builder {
        ctx,
        qh,
        info,
        request,
        tds: Vec::new(),
    };
    let built = match setup {
        Some(setup) => build_control(&mut builder, &setup, data_len),
        None => build_data(&mut builder, data_len),
    };
    match built {
        Ok(()) => builder.finish(kind),
        Err(e) => {
            warn!("building transfer for {:?} failed: {e}", info.address);
            builder.unwind();
            Err(e)
        }
    }
}

fn build_control(builder: &mut Builder<'_>, setup: &ControlSetup, data_len: usize) -> Result {
    let bytes = setup.to_bytes();
    builder.packet(Pid::Setup, false, 0, SETUP_LEN, Some(&bytes))?;
    builder.end_transaction();

    let status_pid = if data_len > 0 {
        builder.data_stage(data_pid(setup.direction), true, data_len)?;
        data_pid(setup.direction.reverse())
    } else {
        Pid::In
    };
    builder.packet(status_pid, true, 0, 0, None)?;
    builder.end_transaction();
    Ok(())
}

fn build_data(builder: &mut Builder<'_>, data_len: usize) -> Result {
    let toggle = builder.ctx.pool.qh(builder.qh).next_toggle;
    let pid = data_pid(builder.info.address.direction);
    let next = builder.data_stage(pid, toggle, data_len)?;
    builder.ctx.pool.qh_mut(builder.qh).next_toggle = next;
    Ok(())
}

/// Give back a chain that was built but never queued.
pub fn discard_chain(ctx: &mut Context, chain: TdChain) {
    let first_toggle = ctx.pool.td(chain.first).hw().token().toggle();
    let mut td = Some(chain.first);
    while let Some(id) = td {
        td = ctx.pool.td(id).next();
        let buf = ctx.pool.td_mut(id).align_buffer.take();
        ctx.release_align(buf);
        ctx.pool.dealloc_td(id);
        if id == chain.last {
            break;
        }
    }
    if let Some(mut request) = ctx.requests.remove(chain.request) {
        request.dma.discard(&mut ctx.align);
    }
    // The toggles the chain claimed were never put on the wire.
    if chain.kind != EndpointType::Control {
        ctx.pool.qh_mut(chain.qh).next_toggle = first_toggle;
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use usb_if::{
        host::EndpointAddress,
        transfer::{Recipient, RequestType},
    };

    use super::*;
    use crate::backend::uhci::{
        schedule::Schedule,
        test_support::{LimitedDma, TestBed, recorder},
        transfer::Completion,
    };

    fn info(
        kind: EndpointType,
        direction: Direction,
        speed: DeviceSpeed,
        max_packet: u16,
    ) -> EndpointInfo {
        EndpointInfo::new(EndpointAddress::new(5, 2, direction), kind, speed, max_packet)
    }

    fn noop() -> Completion {
        Completion::new(|_, _| {})
    }

    #[test]
    fn bulk_out_is_split_at_max_packet() {
        let mut bed = TestBed::with_schedule();
        let qh = bed.endpoint(info(EndpointType::Bulk, Direction::Out, DeviceSpeed::Full, 64));
        let (buffer, mem) = bed.dma_buffer(150);
        let base = buffer.contiguous_phys(0, 150).unwrap();
        let chain = build_transfer(&mut bed.ctx, qh, None, buffer, noop()).unwrap();
        let tds = bed.chain_tds(chain.first());
        assert_eq!(tds.len(), 3);
        assert_eq!(chain.len(), 3);

        let lens: Vec<usize> = tds
            .iter()
            .map(|&t| bed.ctx.pool.td(t).hw().token().max_len())
            .collect();
        assert_eq!(lens, [64, 64, 22]);
        for (i, &td) in tds.iter().enumerate() {
            let entry = bed.ctx.pool.td(td);
            let hw = entry.hw();
            let token = hw.token();
            assert_eq!(token.pid(), Some(Pid::Out));
            assert_eq!(token.address(), 5);
            assert_eq!(token.endpoint(), 2);
            assert_eq!(token.toggle(), i % 2 == 1);
            assert_eq!(hw.buffer(), base + (i * 64) as u32);
            let status = hw.status();
            assert!(status.is_active());
            assert_eq!(status.error_count(), 3);
            assert_eq!(status.actual_len(), 0);
            assert!(!status.contains(TdStatus::SPD));
            assert_eq!(status.contains(TdStatus::IOC), i == 2);
            assert_eq!(entry.is_last_of_transaction(), i == 2);
        }
        // Inner links are depth first, the last one terminates.
        assert_eq!(
            bed.ctx.pool.td(tds[0]).hw().link(),
            td_link(&bed.ctx.pool, Some(tds[1]))
        );
        assert!(bed.ctx.pool.td(tds[2]).hw().link().is_terminate());
        assert!(bed.ctx.pool.qh(qh).next_toggle());
        discard_chain(&mut bed.ctx, chain);
        drop(mem);
    }

    #[test]
    fn zero_length_transfer_is_one_td() {
        let mut bed = TestBed::with_schedule();
        let qh = bed.endpoint(info(EndpointType::Interrupt, Direction::In, DeviceSpeed::Low, 8));
        let chain =
            build_transfer(&mut bed.ctx, qh, None, TransferBuffer::empty(), noop()).unwrap();
        assert_eq!(chain.len(), 1);
        let status = bed.ctx.pool.td(chain.first()).hw().status();
        assert!(status.contains(TdStatus::SPD | TdStatus::LOW_SPEED | TdStatus::IOC));
        assert_eq!(bed.ctx.pool.td(chain.first()).hw().token().max_len(), 0);
        discard_chain(&mut bed.ctx, chain);
    }

    #[test]
    fn control_read_has_three_stages() {
        let mut bed = TestBed::with_schedule();
        let qh = bed.endpoint(info(EndpointType::Control, Direction::Out, DeviceSpeed::Full, 8));
        let (buffer, _mem) = bed.dma_buffer(18);
        let setup = ControlSetup {
            direction: Direction::In,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let chain = build_transfer(&mut bed.ctx, qh, Some(setup), buffer, noop()).unwrap();
        let tds = bed.chain_tds(chain.first());
        assert_eq!(tds.len(), 5);

        let setup_td = bed.ctx.pool.td(tds[0]);
        let token = setup_td.hw().token();
        assert_eq!(token.pid(), Some(Pid::Setup));
        assert!(!token.toggle());
        assert_eq!(token.max_len(), 8);
        assert!(setup_td.is_last_of_transaction());
        let bounce = setup_td.align_buffer.unwrap();
        assert_eq!(setup_td.hw().buffer(), bed.ctx.align.get(bounce).phys());
        assert_eq!(bed.ctx.align.contents(bounce, 8), setup.to_bytes());

        let data: Vec<(Option<Pid>, bool, usize)> = tds[1..4]
            .iter()
            .map(|&t| {
                let token = bed.ctx.pool.td(t).hw().token();
                (token.pid(), token.toggle(), token.max_len())
            })
            .collect();
        assert_eq!(
            data,
            [(Some(Pid::In), true, 8), (Some(Pid::In), false, 8), (Some(Pid::In), true, 2)]
        );
        assert!(bed.ctx.pool.td(tds[3]).is_last_of_transaction());
        assert!(!bed.ctx.pool.td(tds[2]).is_last_of_transaction());

        let status_td = bed.ctx.pool.td(tds[4]);
        let token = status_td.hw().token();
        assert_eq!(token.pid(), Some(Pid::Out));
        assert!(token.toggle());
        assert_eq!(token.max_len(), 0);
        assert!(status_td.hw().status().contains(TdStatus::IOC));
        assert!(status_td.is_last_of_transaction());

        let request = bed.ctx.requests.get(chain.request()).unwrap();
        assert_eq!(request.phases_left, 3);
        assert!(request.control_bulk);
        discard_chain(&mut bed.ctx, chain);
        assert_eq!(bed.ctx.align.cbi_free(), PAGE_CBI_BUFFERS);
    }

    const PAGE_CBI_BUFFERS: usize = crate::backend::uhci::dma::PAGE_SIZE / CBI_ALIGN_SIZE;

    #[test]
    fn control_without_data_has_in_status() {
        let mut bed = TestBed::with_schedule();
        let qh = bed.endpoint(info(EndpointType::Control, Direction::Out, DeviceSpeed::Full, 64));
        let setup = ControlSetup {
            direction: Direction::Out,
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: 9,
            value: 1,
            index: 0,
            length: 0,
        };
        let chain =
            build_transfer(&mut bed.ctx, qh, Some(setup), TransferBuffer::empty(), noop())
                .unwrap();
        let tds = bed.chain_tds(chain.first());
        assert_eq!(tds.len(), 2);
        let token = bed.ctx.pool.td(tds[1]).hw().token();
        assert_eq!(token.pid(), Some(Pid::In));
        assert!(token.toggle());
        assert_eq!(bed.ctx.requests.get(chain.request()).unwrap().phases_left, 2);
        discard_chain(&mut bed.ctx, chain);
    }

    #[test]
    fn packets_across_segments_are_bounced() {
        let mut bed = TestBed::with_schedule();
        let qh = bed.endpoint(info(EndpointType::Bulk, Direction::Out, DeviceSpeed::Full, 8));
        let (buffer, a, b) = bed.split_buffer(16, 4);
        a.fill(&[1, 2, 3, 4]);
        b.fill(&[5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let second_phys = buffer.contiguous_phys(8, 8).unwrap();
        let chain = build_transfer(&mut bed.ctx, qh, None, buffer, noop()).unwrap();
        let tds = bed.chain_tds(chain.first());

        let first = bed.ctx.pool.td(tds[0]);
        let bounce = first.align_buffer.unwrap();
        assert_eq!(first.hw().buffer(), bed.ctx.align.get(bounce).phys());
        assert_eq!(bed.ctx.align.contents(bounce, 8), [1, 2, 3, 4, 5, 6, 7, 8]);

        let second = bed.ctx.pool.td(tds[1]);
        assert!(second.align_buffer.is_none());
        assert_eq!(second.hw().buffer(), second_phys);
        discard_chain(&mut bed.ctx, chain);
    }

    #[test]
    fn exhaustion_unwinds_the_partial_chain() {
        let dma = Arc::new(LimitedDma::new(usize::MAX));
        let mut bed = TestBed::with_dma(dma.clone());
        let schedule = Schedule::build(&mut bed.ctx.pool, bed.dma.clone(), 1024).unwrap();
        bed.ctx.schedule = Some(schedule);
        let qh = bed.endpoint(info(EndpointType::Bulk, Direction::In, DeviceSpeed::Full, 8));
        let per_block = bed.ctx.pool.tds_per_block();
        let (buffer, _mem) = bed.dma_buffer((per_block + 1) * 8);

        // One TD block, then nothing.
        dma.set_budget(1);
        let (log, completion) = recorder();
        let err = build_transfer(&mut bed.ctx, qh, None, buffer, completion()).unwrap_err();
        assert_eq!(err, USBError::NoMemory);
        assert_eq!(bed.ctx.pool.free_td_count(), per_block);
        assert_eq!(bed.ctx.outstanding_requests(), 0);
        assert!(!bed.ctx.pool.qh(qh).next_toggle());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn discarding_gives_the_toggles_back() {
        let mut bed = TestBed::with_schedule();
        let qh = bed.endpoint(info(EndpointType::Bulk, Direction::In, DeviceSpeed::Full, 8));
        let (buffer, _mem) = bed.dma_buffer(8);
        let first = build_transfer(&mut bed.ctx, qh, None, buffer, noop()).unwrap();
        assert!(bed.ctx.pool.qh(qh).next_toggle());
        discard_chain(&mut bed.ctx, first);
        assert!(!bed.ctx.pool.qh(qh).next_toggle());
        assert_eq!(bed.ctx.outstanding_requests(), 0);
    }

    #[test]
    fn rejects_mismatched_requests() {
        let mut bed = TestBed::with_schedule();
        let control = bed.endpoint(info(
            EndpointType::Control,
            Direction::Out,
            DeviceSpeed::Full,
            8,
        ));
        let err = build_transfer(&mut bed.ctx, control, None, TransferBuffer::empty(), noop())
            .unwrap_err();
        assert!(matches!(err, USBError::InvalidParameter(_)));

        let bulk = bed.endpoint(EndpointInfo::new(
            EndpointAddress::new(5, 3, Direction::Out),
            EndpointType::Bulk,
            DeviceSpeed::Full,
            8,
        ));
        let (buffer, _mem) = bed.dma_buffer(4);
        let setup = ControlSetup {
            direction: Direction::Out,
            request_type: RequestType::Vendor,
            recipient: Recipient::Device,
            request: 1,
            value: 0,
            index: 0,
            length: 8,
        };
        let err = build_transfer(&mut bed.ctx, bulk, Some(setup), buffer, noop()).unwrap_err();
        assert!(matches!(err, USBError::InvalidParameter(_)));

        // The setup asks for more than the buffer holds.
        let (buffer, _mem) = bed.dma_buffer(4);
        let err = build_transfer(&mut bed.ctx, control, Some(setup), buffer, noop()).unwrap_err();
        assert!(matches!(err, USBError::InvalidParameter(_)));
        assert_eq!(bed.ctx.outstanding_requests(), 0);
    }
}
