use alloc::{string::String, sync::Arc};
use core::time::Duration;

use usb_if::{
    host::EndpointAddress,
    transfer::{ControlSetup, EndpointType},
};

use super::{
    context::Context,
    def::MAX_PACKET,
    descriptor::{EndpointInfo, QhId, QhKind},
    dispatch::return_isoch_done_queue,
    dma::DmaAllocator,
    errata::PciIdentity,
    frame::FrameCounter,
    isoch::{abort_endpoint_frames, add_frames_to_schedule, queue_frames, retire_elapsed_frames},
    queue_head::{TdChain, abort_transaction, append_transaction, clear_halt},
    reg::{
        Command, PORTSC_REG, RegIo, USBCMD_REG, USBINTR, USBSTS_REG, UhciRegisters,
        all_interrupts,
    },
    scavenge::{scavenge_isoch, scavenge_queue_heads},
    schedule::Schedule,
    transfer::{Completion, TransferBuffer},
    work::WorkKind,
};
use crate::{Kernel, RequestId, USBError, err::Result, osal::poll_until};

const GLOBAL_RESET_HOLD: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const RUN_STATE_TRIES: usize = 20;
/// Long enough for the controller to finish the frame it is working on.
const FRAME_SETTLE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct UhciConfig {
    /// Number of distinct interrupt polling slots, a power of two up to 1024.
    pub virtual_frames: usize,
    /// How many frames ahead isochronous iTDs are linked into the frame list.
    pub isoch_schedule_ahead: u64,
    pub reset_timeout: Duration,
    pub enable_interrupts: bool,
    pub pci: PciIdentity,
}

impl Default for UhciConfig {
    fn default() -> Self {
        Self {
            virtual_frames: 1024,
            isoch_schedule_ahead: 64,
            reset_timeout: Duration::from_millis(100),
            enable_interrupts: true,
            pci: PciIdentity::default(),
        }
    }
}

pub struct Uhci<R: RegIo> {
    regs: UhciRegisters<R>,
    kernel: Arc<dyn Kernel>,
    dma: Arc<dyn DmaAllocator>,
    config: UhciConfig,
    frame: FrameCounter,
    ctx: Context,
}

impl<R: RegIo> Uhci<R> {
    pub fn new(
        io: R,
        dma: Arc<dyn DmaAllocator>,
        kernel: Arc<dyn Kernel>,
        config: UhciConfig,
    ) -> Self {
        let errata = config.pci.errata();
        if !errata.is_empty() {
            info!("{}: errata {errata:?}", config.pci.name());
        }
        let ctx = Context::new(dma.clone(), kernel.clone(), errata, config.isoch_schedule_ahead);
        Self {
            regs: UhciRegisters::new(io),
            kernel,
            dma,
            config,
            frame: FrameCounter::new(),
            ctx,
        }
    }

    pub fn name(&self) -> String {
        self.config.pci.name()
    }

    pub fn config(&self) -> &UhciConfig {
        &self.config
    }

    pub fn regs(&self) -> &UhciRegisters<R> {
        &self.regs
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Bring the controller from power-on to running with an empty schedule.
    pub fn init(&mut self) -> Result {
        debug!("{}: init", self.name());
        self.regs.io().write16(USBINTR, 0);
        self.global_reset();
        self.reset(false)?;
        if self.ctx.schedule.is_none() {
            self.initialize_schedule()?;
        }

        let mut cmd = self.regs.command();
        cmd.modify(USBCMD_REG::MAXP::SET + USBCMD_REG::CF::SET);
        self.regs.set_command(cmd);
        if self.config.enable_interrupts {
            self.regs.io().write16(USBINTR, all_interrupts().get());
        }
        self.run(true)?;
        for index in 0..2 {
            let port = self.regs.port(index);
            debug!(
                "port {}: connected {}, low speed {}",
                index + 1,
                port.is_set(PORTSC_REG::CCS),
                port.is_set(PORTSC_REG::LSDA)
            );
        }
        info!("{} running", self.name());
        Ok(())
    }

    /// Reset everything downstream, devices included.
    pub fn global_reset(&self) {
        let mut cmd = Command::new(0);
        cmd.modify(USBCMD_REG::GRESET::SET);
        self.regs.set_command(cmd);
        self.kernel.delay(GLOBAL_RESET_HOLD);
        self.regs.set_command(Command::new(0));
        debug!("global reset done");
    }

    /// Reset the controller itself. An existing schedule is handed back to it
    /// at the frame it had reached.
    pub fn reset(&mut self, enable_interrupts: bool) -> Result {
        let mut cmd = Command::new(0);
        cmd.modify(USBCMD_REG::HCRESET::SET);
        self.regs.set_command(cmd);

        let tries = (self.config.reset_timeout.as_millis() as usize).max(1);
        let regs = &self.regs;
        let done = poll_until(&*self.kernel, tries, POLL_INTERVAL, || {
            !regs.command().is_set(USBCMD_REG::HCRESET)
        });
        if done.is_none() {
            error!("controller reset did not complete in {:?}", self.config.reset_timeout);
            return Err(USBError::Timeout);
        }
        debug!("controller reset done");

        if let Some(schedule) = self.ctx.schedule.as_ref() {
            self.regs.set_frame_list_base(schedule.frame_list_phys());
            self.regs.set_frame_index(self.frame.register_value());
            let mut cmd = self.regs.command();
            cmd.modify(USBCMD_REG::MAXP::SET + USBCMD_REG::CF::SET);
            self.regs.set_command(cmd);
            if enable_interrupts {
                self.regs.io().write16(USBINTR, all_interrupts().get());
            }
        }
        Ok(())
    }

    /// Start or stop the schedule and wait until HCH agrees.
    pub fn run(&mut self, on: bool) -> Result {
        let mut cmd = self.regs.command();
        if on {
            cmd.modify(USBCMD_REG::RS::SET);
        } else {
            cmd.modify(USBCMD_REG::RS::CLEAR);
        }
        self.regs.set_command(cmd);

        let regs = &self.regs;
        let reached = poll_until(&*self.kernel, RUN_STATE_TRIES, POLL_INTERVAL, || {
            regs.is_halted() != on
        });
        if reached.is_none() {
            error!("controller did not {} in time", if on { "start" } else { "halt" });
            return Err(USBError::Timeout);
        }
        debug!("controller {}", if on { "running" } else { "halted" });
        Ok(())
    }

    /// Build the frame list and QH skeleton and hand it to the controller.
    pub fn initialize_schedule(&mut self) -> Result {
        if self.ctx.schedule.is_some() {
            warn!("schedule already initialized");
            return Ok(());
        }
        let schedule =
            Schedule::build(&mut self.ctx.pool, self.dma.clone(), self.config.virtual_frames)?;
        self.regs.set_frame_index(0);
        self.regs.set_frame_list_base(schedule.frame_list_phys());
        debug!(
            "schedule at {:#x}, {} interrupt levels",
            schedule.frame_list_phys(),
            schedule.levels()
        );
        if log_enabled!(log::Level::Trace) {
            schedule.dump_frame(&self.ctx.pool, 0);
        }
        self.ctx.schedule = Some(schedule);
        Ok(())
    }

    /// Monotonic 64-bit frame number, zero while the controller is halted.
    pub fn get_frame_number(&self) -> u64 {
        if self.regs.is_halted() {
            return 0;
        }
        self.frame.update(|| self.regs.frame_index())
    }

    /// Collect finished isochronous frames, then finished TD chains. Returns
    /// the number of descriptors retired.
    pub fn scavenge_completed_transactions(&mut self) -> usize {
        let current = self.get_frame_number();
        let isoch = scavenge_isoch(&mut self.ctx, self.regs.io(), current);
        isoch + scavenge_queue_heads(&mut self.ctx)
    }

    pub fn get_available_isoch_bandwidth(&self) -> u32 {
        self.ctx.isoch.available_bandwidth()
    }

    pub fn create_endpoint(&mut self, info: EndpointInfo) -> Result<QhId> {
        let kind = match info.kind {
            EndpointType::Control => QhKind::Control,
            EndpointType::Bulk => QhKind::Bulk,
            EndpointType::Interrupt => QhKind::Interrupt,
            EndpointType::Isochronous => {
                return Err(USBError::InvalidParameter("use create_isoch_endpoint"));
            }
        };
        if !info.address.is_valid() || info.max_packet == 0 {
            return Err(USBError::InvalidParameter("endpoint"));
        }
        if info.max_packet > MAX_PACKET {
            return Err(USBError::InvalidParameter("max packet size"));
        }
        if self.ctx.endpoints.contains_key(&info.address) {
            return Err(USBError::InvalidParameter("endpoint exists"));
        }
        let Some(schedule) = self.ctx.schedule.as_mut() else {
            return Err(USBError::NotInitialized);
        };

        let qh = self.ctx.pool.alloc_qh(kind)?;
        self.ctx.pool.qh_mut(qh).endpoint = Some(info);
        if let Err(e) = schedule.link_endpoint(&mut self.ctx.pool, qh) {
            self.ctx.pool.dealloc_qh(qh);
            return Err(e);
        }
        self.ctx.endpoints.insert(info.address, qh);
        debug!(
            "endpoint {:?} ({:?}) on QH @{:#x}",
            info.address,
            info.kind,
            self.ctx.pool.qh(qh).phys()
        );
        Ok(qh)
    }

    /// Unlink the endpoint's QH and abort whatever it still carried.
    pub fn delete_endpoint(&mut self, address: EndpointAddress) -> Result {
        let qh = self.endpoint_qh(address)?;
        let Some(schedule) = self.ctx.schedule.as_mut() else {
            return Err(USBError::NotInitialized);
        };
        schedule.unlink_endpoint(&mut self.ctx.pool, qh)?;
        self.ctx.endpoints.remove(&address);
        self.kernel.delay(FRAME_SETTLE);
        abort_transaction(&mut self.ctx, qh);
        self.ctx.pool.dealloc_qh(qh);
        debug!("endpoint {address:?} deleted");
        Ok(())
    }

    pub fn create_isoch_endpoint(&mut self, address: EndpointAddress, max_packet: u16) -> Result {
        if !address.is_valid() {
            return Err(USBError::InvalidParameter("endpoint"));
        }
        self.ctx.isoch.create_endpoint(address, max_packet)
    }

    /// Abort every frame of the endpoint, report them, and give its bandwidth
    /// back.
    pub fn delete_isoch_endpoint(&mut self, address: EndpointAddress) -> Result {
        if self.ctx.isoch.endpoint(&address).is_none() {
            return Err(USBError::NotFound);
        }
        let now = self.kernel.now();
        abort_endpoint_frames(&mut self.ctx, address, now);
        self.kernel.delay(FRAME_SETTLE);
        // Frames already retired by the interrupt filter are reported here.
        let current = self.get_frame_number();
        retire_elapsed_frames(&mut self.ctx, self.regs.io(), current);
        scavenge_isoch(&mut self.ctx, self.regs.io(), current);
        return_isoch_done_queue(&mut self.ctx, address);

        if let Some(ep) = self.ctx.isoch.endpoints.remove(&address) {
            if ep.on_producer_q != 0 || ep.scheduled != 0 {
                warn!(
                    "isoch endpoint {address:?} deleted with {} queued and {} scheduled iTDs",
                    ep.on_producer_q, ep.scheduled
                );
            }
            self.ctx.isoch.bandwidth += ep.max_packet as u32;
        }
        debug!(
            "isoch endpoint {address:?} deleted, {} bytes/frame available",
            self.ctx.isoch.bandwidth
        );
        Ok(())
    }

    /// Build a TD chain for the endpoint without handing it to the controller.
    pub fn build_transfer(
        &mut self,
        address: EndpointAddress,
        setup: Option<ControlSetup>,
        buffer: TransferBuffer,
        completion: Completion,
    ) -> Result<TdChain> {
        let qh = self.endpoint_qh(address)?;
        super::chain::build_transfer(&mut self.ctx, qh, setup, buffer, completion)
    }

    /// Put a built chain on its endpoint's queue.
    pub fn queue_transaction(&mut self, address: EndpointAddress, chain: TdChain) -> Result {
        let qh = match self.endpoint_qh(address) {
            Ok(qh) if qh == chain.qh => qh,
            Ok(_) => {
                super::chain::discard_chain(&mut self.ctx, chain);
                return Err(USBError::InvalidParameter("chain built for another endpoint"));
            }
            Err(e) => {
                super::chain::discard_chain(&mut self.ctx, chain);
                return Err(e);
            }
        };
        let control_bulk = matches!(chain.kind, EndpointType::Control | EndpointType::Bulk);
        if control_bulk {
            self.ctx.control_bulk_started();
        }
        trace!("queue {} TDs on {address:?}", chain.len());
        append_transaction(&mut self.ctx.pool, qh, chain);
        Ok(())
    }

    pub fn discard_chain(&mut self, chain: TdChain) {
        super::chain::discard_chain(&mut self.ctx, chain);
    }

    pub fn submit_control(
        &mut self,
        address: EndpointAddress,
        setup: ControlSetup,
        buffer: TransferBuffer,
        completion: Completion,
    ) -> Result<RequestId> {
        self.submit(address, EndpointType::Control, Some(setup), buffer, completion)
    }

    pub fn submit_bulk(
        &mut self,
        address: EndpointAddress,
        buffer: TransferBuffer,
        completion: Completion,
    ) -> Result<RequestId> {
        self.submit(address, EndpointType::Bulk, None, buffer, completion)
    }

    pub fn submit_interrupt(
        &mut self,
        address: EndpointAddress,
        buffer: TransferBuffer,
        completion: Completion,
    ) -> Result<RequestId> {
        self.submit(address, EndpointType::Interrupt, None, buffer, completion)
    }

    fn submit(
        &mut self,
        address: EndpointAddress,
        kind: EndpointType,
        setup: Option<ControlSetup>,
        buffer: TransferBuffer,
        completion: Completion,
    ) -> Result<RequestId> {
        let qh = self.endpoint_qh(address)?;
        let actual = self.ctx.pool.qh(qh).endpoint().map(|ep| ep.kind);
        if actual != Some(kind) {
            return Err(USBError::InvalidParameter("endpoint type"));
        }
        let chain = self.build_transfer(address, setup, buffer, completion)?;
        let request = chain.request();
        self.queue_transaction(address, chain)?;
        Ok(request)
    }

    /// Complete everything queued on the endpoint with `Aborted`.
    pub fn abort_endpoint(&mut self, address: EndpointAddress) -> Result {
        if self.ctx.isoch.endpoint(&address).is_some() {
            let now = self.kernel.now();
            abort_endpoint_frames(&mut self.ctx, address, now);
            self.kernel.delay(FRAME_SETTLE);
            return_isoch_done_queue(&mut self.ctx, address);
            return Ok(());
        }
        let qh = self.endpoint_qh(address)?;
        abort_transaction(&mut self.ctx, qh);
        Ok(())
    }

    /// Restart a halted endpoint after the device's halt has been cleared.
    pub fn clear_endpoint_halt(&mut self, address: EndpointAddress) -> Result {
        let qh = self.endpoint_qh(address)?;
        clear_halt(&mut self.ctx, qh);
        Ok(())
    }

    /// Queue one isochronous packet per frame starting at `start_frame`.
    pub fn queue_isoch_transfer(
        &mut self,
        address: EndpointAddress,
        start_frame: u64,
        lengths: &[u16],
        buffer: TransferBuffer,
        completion: Completion,
    ) -> Result<RequestId> {
        if self.ctx.schedule.is_none() {
            return Err(USBError::NotInitialized);
        }
        let request =
            queue_frames(&mut self.ctx, address, start_frame, lengths, buffer, completion)?;
        let current = self.get_frame_number();
        let now = self.kernel.now();
        add_frames_to_schedule(&mut self.ctx, address, current, now);
        Ok(request)
    }

    /// Interrupt-time half: acknowledge USBSTS, raise deferred work and move
    /// elapsed isochronous frames to the done queue. Returns false if the
    /// interrupt was not ours.
    pub fn filter_interrupt(&mut self) -> bool {
        let status = self.regs.status();
        let ours = USBSTS_REG::USBINT::SET
            + USBSTS_REG::USBERRINT::SET
            + USBSTS_REG::RD::SET
            + USBSTS_REG::HSE::SET
            + USBSTS_REG::HCPE::SET;
        if status.get() & ours.mask() == 0 {
            return false;
        }
        self.regs.ack_status(status);

        if status.is_set(USBSTS_REG::HSE) || status.is_set(USBSTS_REG::HCPE) {
            error!("host controller error, USBSTS {:#06x}", status.get());
            self.ctx.work.submit(WorkKind::ControllerError);
        }
        if status.is_set(USBSTS_REG::RD) {
            debug!("resume detected");
            self.ctx.work.submit(WorkKind::RootHubStatusChange);
        }
        if status.is_set(USBSTS_REG::USBERRINT) {
            trace!("USB error interrupt");
        }

        let current = self.get_frame_number();
        retire_elapsed_frames(&mut self.ctx, self.regs.io(), current);
        true
    }

    /// One full interrupt-plus-scavenge cycle, for callers without an IRQ line.
    pub fn poll(&mut self) -> usize {
        if !self.filter_interrupt() {
            let current = self.get_frame_number();
            retire_elapsed_frames(&mut self.ctx, self.regs.io(), current);
        }
        self.scavenge_completed_transactions()
    }

    /// Run queued deferred work. Root hub changes and controller errors are
    /// handed to `handler`; babble recovery is handled here. Returns the
    /// number of jobs run.
    pub fn run_deferred_work(&mut self, mut handler: impl FnMut(WorkKind)) -> usize {
        let mut count = 0;
        while let Some(kind) = self.ctx.work.take() {
            match kind {
                WorkKind::ResetAfterBabble => {
                    warn!("resetting controller after babble");
                    if let Err(e) = self.recover() {
                        error!("reset after babble failed: {e}");
                    }
                }
                WorkKind::ControllerError | WorkKind::RootHubStatusChange => handler(kind),
            }
            self.ctx.work.finish(kind);
            count += 1;
        }
        count
    }

    fn recover(&mut self) -> Result {
        self.run(false)?;
        self.reset(self.config.enable_interrupts)?;
        self.run(true)
    }

    fn endpoint_qh(&self, address: EndpointAddress) -> Result<QhId> {
        self.ctx.endpoint_qh(&address).ok_or(USBError::NotFound)
    }
}

impl<R: RegIo> Drop for Uhci<R> {
    fn drop(&mut self) {
        self.regs.io().write16(USBINTR, 0);
        if self.ctx.schedule.is_none() {
            return;
        }
        if let Err(e) = self.run(false) {
            // The controller may still walk the frame list; leak it.
            error!("controller would not halt on shutdown: {e}");
            core::mem::forget(self.ctx.schedule.take());
            return;
        }
        self.regs.set_frame_list_base(crate::PhysAddr::new(0));
        if let Some(schedule) = self.ctx.schedule.take() {
            schedule.release(&mut self.ctx.pool);
        }
    }
}
