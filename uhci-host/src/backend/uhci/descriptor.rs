//! Software side of the schedule's descriptors. Each record pairs the handle
//! to its hardware words with the bookkeeping the controller never sees.

use core::time::Duration;

use id_arena::Id;
use usb_if::{
    err::TransferError,
    host::{DeviceSpeed, EndpointAddress},
    transfer::EndpointType,
};

use super::{
    align::AlignBufferId,
    def::{QhRef, TdRef},
};
use crate::{PhysAddr, RequestId};

pub type TdId = Id<Td>;
pub type ItdId = Id<Itd>;
pub type QhId = Id<Qh>;

/// Any element that can sit on a hardware list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListElement {
    QueueHead(QhId),
    Transfer(TdId),
    Isoch(ItdId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    QueueHead,
    Transfer,
    Isoch,
}

impl ListElement {
    pub fn kind(&self) -> ElementKind {
        match self {
            ListElement::QueueHead(_) => ElementKind::QueueHead,
            ListElement::Transfer(_) => ElementKind::Transfer,
            ListElement::Isoch(_) => ElementKind::Isoch,
        }
    }

    pub fn as_qh(&self) -> Option<QhId> {
        match *self {
            ListElement::QueueHead(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_itd(&self) -> Option<ItdId> {
        match *self {
            ListElement::Isoch(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    pub speed: DeviceSpeed,
    pub max_packet: u16,
    pub kind: EndpointType,
    /// Polling interval in frames, interrupt endpoints only.
    pub interval: u16,
}

impl EndpointInfo {
    pub fn new(
        address: EndpointAddress,
        kind: EndpointType,
        speed: DeviceSpeed,
        max_packet: u16,
    ) -> Self {
        Self {
            address,
            speed,
            max_packet,
            kind,
            interval: 1,
        }
    }

    pub fn with_interval(mut self, interval: u16) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QhKind {
    Control,
    Bulk,
    Interrupt,
    IsochAnchor,
    /// Schedule anchors and the reclamation tail. Never carries TDs.
    Dummy,
}

pub struct Td {
    pub(crate) hw: TdRef,
    pub(crate) phys: PhysAddr,
    pub(crate) allocated: bool,
    pub(crate) next: Option<TdId>,
    pub(crate) qh: Option<QhId>,
    pub(crate) last_of_transaction: bool,
    pub(crate) align_buffer: Option<AlignBufferId>,
    /// Where this packet's data sits inside the request's buffer.
    pub(crate) buffer_offset: usize,
    pub(crate) request: Option<RequestId>,
}

impl Td {
    pub(crate) fn new(hw: TdRef, phys: PhysAddr) -> Self {
        Self {
            hw,
            phys,
            allocated: false,
            next: None,
            qh: None,
            last_of_transaction: false,
            align_buffer: None,
            buffer_offset: 0,
            request: None,
        }
    }

    pub fn hw(&self) -> TdRef {
        self.hw
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn next(&self) -> Option<TdId> {
        self.next
    }

    pub fn qh(&self) -> Option<QhId> {
        self.qh
    }

    pub fn is_last_of_transaction(&self) -> bool {
        self.last_of_transaction
    }

    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub(crate) fn reset(&mut self) {
        self.next = None;
        self.qh = None;
        self.last_of_transaction = false;
        self.align_buffer = None;
        self.buffer_offset = 0;
        self.request = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItdState {
    Free,
    /// Built and waiting for its frame to come within reach.
    Pending,
    /// Linked into the hardware frame list.
    Scheduled,
    /// On the producer (done) queue, newest first.
    OnDoneQueue,
    /// On the scavenger's reversed list, oldest first.
    Reversed,
    /// Finalized and waiting on its endpoint's done list.
    Done,
}

/// Outcome of one isochronous frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameResult {
    pub status: Result<(), TransferError>,
    pub actual: u16,
    pub timestamp: Duration,
}

pub struct Itd {
    pub(crate) hw: TdRef,
    pub(crate) phys: PhysAddr,
    pub(crate) state: ItdState,
    /// Next element in the frame slot this iTD is linked into.
    pub(crate) next: Option<ListElement>,
    /// Done queue link while produced, forward link once reversed.
    pub(crate) done_next: Option<ItdId>,
    pub(crate) endpoint: Option<EndpointAddress>,
    pub(crate) frame_number: u64,
    pub(crate) frame_index: usize,
    pub(crate) align_buffer: Option<AlignBufferId>,
    pub(crate) buffer_offset: usize,
    pub(crate) request: Option<RequestId>,
    /// Position of this frame inside its request.
    pub(crate) request_frame: usize,
    pub(crate) result: Option<FrameResult>,
}

impl Itd {
    pub(crate) fn new(hw: TdRef, phys: PhysAddr) -> Self {
        Self {
            hw,
            phys,
            state: ItdState::Free,
            next: None,
            done_next: None,
            endpoint: None,
            frame_number: 0,
            frame_index: 0,
            align_buffer: None,
            buffer_offset: 0,
            request: None,
            request_frame: 0,
            result: None,
        }
    }

    pub fn hw(&self) -> TdRef {
        self.hw
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn state(&self) -> ItdState {
        self.state
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn result(&self) -> Option<&FrameResult> {
        self.result.as_ref()
    }

    pub(crate) fn reset(&mut self) {
        self.next = None;
        self.done_next = None;
        self.endpoint = None;
        self.frame_number = 0;
        self.frame_index = 0;
        self.align_buffer = None;
        self.buffer_offset = 0;
        self.request = None;
        self.request_frame = 0;
        self.result = None;
    }
}

pub struct Qh {
    pub(crate) hw: QhRef,
    pub(crate) phys: PhysAddr,
    pub(crate) allocated: bool,
    pub(crate) kind: QhKind,
    pub(crate) endpoint: Option<EndpointInfo>,
    pub(crate) next: Option<QhId>,
    pub(crate) first: Option<TdId>,
    pub(crate) last: Option<TdId>,
    pub(crate) stalled: bool,
    /// Data toggle the next queued packet starts with.
    pub(crate) next_toggle: bool,
}

impl Qh {
    pub(crate) fn new(hw: QhRef, phys: PhysAddr) -> Self {
        Self {
            hw,
            phys,
            allocated: false,
            kind: QhKind::Dummy,
            endpoint: None,
            next: None,
            first: None,
            last: None,
            stalled: false,
            next_toggle: false,
        }
    }

    pub fn hw(&self) -> QhRef {
        self.hw
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn kind(&self) -> QhKind {
        self.kind
    }

    pub fn endpoint(&self) -> Option<&EndpointInfo> {
        self.endpoint.as_ref()
    }

    pub fn next(&self) -> Option<QhId> {
        self.next
    }

    pub fn first(&self) -> Option<TdId> {
        self.first
    }

    pub fn last(&self) -> Option<TdId> {
        self.last
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn next_toggle(&self) -> bool {
        self.next_toggle
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub(crate) fn reset(&mut self) {
        self.kind = QhKind::Dummy;
        self.endpoint = None;
        self.next = None;
        self.first = None;
        self.last = None;
        self.stalled = false;
        self.next_toggle = false;
    }
}
