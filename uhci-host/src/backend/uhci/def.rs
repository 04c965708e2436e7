//! Hardware layout of the UHCI frame list, queue heads and transfer
//! descriptors (UHCI 1.1, section 3).
//!
//! Descriptors live in DMA memory shared with the controller. They are only
//! touched through [`TdRef`], [`QhRef`] and [`FrameListRef`], which do volatile
//! little-endian accesses fenced with `mbarrier`.

use core::{fmt, ptr::NonNull};

use bitflags::bitflags;
use mbarrier::{mb, wmb};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::PhysAddr;

pub const FRAME_LIST_LEN: usize = 1024;
pub const FRAME_LIST_BYTES: usize = FRAME_LIST_LEN * 4;
pub const TD_SIZE: usize = core::mem::size_of::<TdHw>();
pub const QH_SIZE: usize = core::mem::size_of::<QhHw>();
pub const DESCRIPTOR_ALIGN: usize = 16;

// Descriptors are packed back to back in a block, each on its own boundary.
const _: () = assert!(TD_SIZE % DESCRIPTOR_ALIGN == 0 && QH_SIZE % DESCRIPTOR_ALIGN == 0);

/// Largest packet a TD token can describe on a full-speed bus.
pub const MAX_PACKET: u16 = 1023;

/// Length fields hold `n - 1`; the all-ones pattern means zero bytes.
pub const NULL_LENGTH: u32 = 0x7FF;

bitflags! {
    /// Low bits of a frame-list entry, QH link or TD link.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkFlags: u32 {
        const TERMINATE = 1 << 0;
        const QH = 1 << 1;
        const DEPTH_FIRST = 1 << 2;
    }
}

const LINK_ADDR_MASK: u32 = !0xF;

/// A hardware link pointer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Link(u32);

impl Link {
    pub const TERMINATE: Self = Self(LinkFlags::TERMINATE.bits());

    pub fn qh(addr: PhysAddr) -> Self {
        Self((addr.raw() & LINK_ADDR_MASK) | LinkFlags::QH.bits())
    }

    pub fn td(addr: PhysAddr) -> Self {
        Self(addr.raw() & LINK_ADDR_MASK)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn flags(self) -> LinkFlags {
        LinkFlags::from_bits_truncate(self.0)
    }

    pub fn with(self, flags: LinkFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    pub fn without(self, flags: LinkFlags) -> Self {
        Self(self.0 & !flags.bits())
    }

    pub fn is_terminate(self) -> bool {
        self.flags().contains(LinkFlags::TERMINATE)
    }

    pub fn is_qh(self) -> bool {
        self.flags().contains(LinkFlags::QH)
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & LINK_ADDR_MASK)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({:#010x} {:?})", self.addr().raw(), self.flags())
    }
}

bitflags! {
    /// TD control and status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TdStatus: u32 {
        const BITSTUFF = 1 << 17;
        const CRC_TIMEOUT = 1 << 18;
        const NAK = 1 << 19;
        const BABBLE = 1 << 20;
        const DATA_BUFFER = 1 << 21;
        const STALLED = 1 << 22;
        const ACTIVE = 1 << 23;
        const IOC = 1 << 24;
        const ISO = 1 << 25;
        const LOW_SPEED = 1 << 26;
        const SPD = 1 << 29;

        const ERRORS = Self::BITSTUFF.bits()
            | Self::CRC_TIMEOUT.bits()
            | Self::BABBLE.bits()
            | Self::DATA_BUFFER.bits()
            | Self::STALLED.bits();

        // ActLen and C_ERR live in the same word.
        const _ = !0;
    }
}

const ACTLEN_MASK: u32 = 0x7FF;
const CERR_SHIFT: u32 = 27;
const CERR_MASK: u32 = 0x3 << CERR_SHIFT;

impl TdStatus {
    /// A freshly armed TD: active, three retries, no bytes transferred yet.
    pub fn armed() -> Self {
        Self::ACTIVE
            .with_error_count(3)
            .with_actual_raw(NULL_LENGTH)
    }

    pub fn actual_len(&self) -> usize {
        ((self.bits() + 1) & ACTLEN_MASK) as usize
    }

    pub fn with_actual_len(self, len: usize) -> Self {
        self.with_actual_raw(encode_len(len))
    }

    fn with_actual_raw(self, raw: u32) -> Self {
        Self::from_bits_retain((self.bits() & !ACTLEN_MASK) | (raw & ACTLEN_MASK))
    }

    pub fn error_count(&self) -> u32 {
        (self.bits() & CERR_MASK) >> CERR_SHIFT
    }

    pub fn with_error_count(self, count: u32) -> Self {
        Self::from_bits_retain((self.bits() & !CERR_MASK) | ((count << CERR_SHIFT) & CERR_MASK))
    }

    pub fn is_active(&self) -> bool {
        self.contains(Self::ACTIVE)
    }

    pub fn is_halted(&self) -> bool {
        self.contains(Self::STALLED)
    }
}

fn encode_len(len: usize) -> u32 {
    if len == 0 {
        NULL_LENGTH
    } else {
        (len as u32 - 1) & ACTLEN_MASK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Pid {
    Setup = 0x2D,
    In = 0x69,
    Out = 0xE1,
}

/// TD token word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token(u32);

const TOKEN_ADDR_SHIFT: u32 = 8;
const TOKEN_ENDP_SHIFT: u32 = 15;
const TOKEN_TOGGLE: u32 = 1 << 19;
const TOKEN_MAXLEN_SHIFT: u32 = 21;

impl Token {
    pub fn new(pid: Pid, address: u8, endpoint: u8, toggle: bool, max_len: usize) -> Self {
        let mut raw = u8::from(pid) as u32
            | ((address as u32 & 0x7F) << TOKEN_ADDR_SHIFT)
            | ((endpoint as u32 & 0xF) << TOKEN_ENDP_SHIFT)
            | (encode_len(max_len) << TOKEN_MAXLEN_SHIFT);
        if toggle {
            raw |= TOKEN_TOGGLE;
        }
        Self(raw)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn pid(self) -> Option<Pid> {
        Pid::try_from((self.0 & 0xFF) as u8).ok()
    }

    pub fn is_in(self) -> bool {
        self.pid() == Some(Pid::In)
    }

    pub fn address(self) -> u8 {
        ((self.0 >> TOKEN_ADDR_SHIFT) & 0x7F) as u8
    }

    pub fn endpoint(self) -> u8 {
        ((self.0 >> TOKEN_ENDP_SHIFT) & 0xF) as u8
    }

    pub fn toggle(self) -> bool {
        self.0 & TOKEN_TOGGLE != 0
    }

    pub fn with_toggle(self, toggle: bool) -> Self {
        if toggle {
            Self(self.0 | TOKEN_TOGGLE)
        } else {
            Self(self.0 & !TOKEN_TOGGLE)
        }
    }

    pub fn max_len(self) -> usize {
        (((self.0 >> TOKEN_MAXLEN_SHIFT) + 1) & ACTLEN_MASK) as usize
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("pid", &self.pid())
            .field("addr", &self.address())
            .field("ep", &self.endpoint())
            .field("toggle", &self.toggle())
            .field("max_len", &self.max_len())
            .finish()
    }
}

/// Transfer descriptor as laid out in memory. The upper four words are
/// reserved for software and left untouched by the controller.
#[repr(C, align(16))]
pub struct TdHw {
    link: u32,
    status: u32,
    token: u32,
    buffer: u32,
    _software: [u32; 4],
}

#[repr(C, align(16))]
pub struct QhHw {
    head: u32,
    element: u32,
    _pad: [u32; 2],
}

unsafe fn load(word: *const u32) -> u32 {
    mb();
    u32::from_le(unsafe { word.read_volatile() })
}

unsafe fn store(word: *mut u32, value: u32) {
    wmb();
    unsafe { word.write_volatile(value.to_le()) };
    mb();
}

/// Handle to a TD in DMA memory.
#[derive(Clone, Copy)]
pub struct TdRef(NonNull<TdHw>);

unsafe impl Send for TdRef {}

impl TdRef {
    /// # Safety
    ///
    /// `ptr` must point at `TD_SIZE` bytes of 16-byte aligned DMA memory that
    /// outlives every copy of the returned handle.
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr.cast())
    }

    fn raw(&self) -> *mut TdHw {
        self.0.as_ptr()
    }

    pub fn link(&self) -> Link {
        Link(unsafe { load(core::ptr::addr_of!((*self.raw()).link)) })
    }

    pub fn set_link(&self, link: Link) {
        unsafe { store(core::ptr::addr_of_mut!((*self.raw()).link), link.0) }
    }

    pub fn status(&self) -> TdStatus {
        TdStatus::from_bits_retain(unsafe { load(core::ptr::addr_of!((*self.raw()).status)) })
    }

    pub fn set_status(&self, status: TdStatus) {
        unsafe { store(core::ptr::addr_of_mut!((*self.raw()).status), status.bits()) }
    }

    pub fn token(&self) -> Token {
        Token(unsafe { load(core::ptr::addr_of!((*self.raw()).token)) })
    }

    pub fn set_token(&self, token: Token) {
        unsafe { store(core::ptr::addr_of_mut!((*self.raw()).token), token.0) }
    }

    pub fn buffer(&self) -> PhysAddr {
        PhysAddr::new(unsafe { load(core::ptr::addr_of!((*self.raw()).buffer)) })
    }

    pub fn set_buffer(&self, addr: PhysAddr) {
        unsafe { store(core::ptr::addr_of_mut!((*self.raw()).buffer), addr.raw()) }
    }

    /// Zero every word the controller looks at.
    pub fn clear(&self) {
        self.set_status(TdStatus::empty());
        self.set_link(Link::TERMINATE);
        self.set_token(Token(0));
        self.set_buffer(PhysAddr::new(0));
    }
}

impl fmt::Debug for TdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Td")
            .field("link", &self.link())
            .field("status", &format_args!("{:#010x}", self.status().bits()))
            .field("token", &self.token())
            .field("buffer", &format_args!("{:#x}", self.buffer()))
            .finish()
    }
}

/// Handle to a QH in DMA memory.
#[derive(Clone, Copy)]
pub struct QhRef(NonNull<QhHw>);

unsafe impl Send for QhRef {}

impl QhRef {
    /// # Safety
    ///
    /// Same contract as [`TdRef::new`] with `QH_SIZE` bytes.
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr.cast())
    }

    fn raw(&self) -> *mut QhHw {
        self.0.as_ptr()
    }

    pub fn head(&self) -> Link {
        Link(unsafe { load(core::ptr::addr_of!((*self.raw()).head)) })
    }

    pub fn set_head(&self, link: Link) {
        unsafe { store(core::ptr::addr_of_mut!((*self.raw()).head), link.0) }
    }

    pub fn element(&self) -> Link {
        Link(unsafe { load(core::ptr::addr_of!((*self.raw()).element)) })
    }

    pub fn set_element(&self, link: Link) {
        unsafe { store(core::ptr::addr_of_mut!((*self.raw()).element), link.0) }
    }

    pub fn clear(&self) {
        self.set_head(Link::TERMINATE);
        self.set_element(Link::TERMINATE);
    }
}

impl fmt::Debug for QhRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qh")
            .field("head", &self.head())
            .field("element", &self.element())
            .finish()
    }
}

/// Handle to the 1024-entry frame list page.
#[derive(Clone, Copy)]
pub struct FrameListRef(NonNull<u32>);

unsafe impl Send for FrameListRef {}

impl FrameListRef {
    /// # Safety
    ///
    /// `ptr` must point at `FRAME_LIST_BYTES` bytes of 4 KiB aligned DMA memory.
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr.cast())
    }

    pub fn get(&self, slot: usize) -> Link {
        assert!(slot < FRAME_LIST_LEN);
        Link(unsafe { load(self.0.as_ptr().add(slot)) })
    }

    pub fn set(&self, slot: usize, link: Link) {
        assert!(slot < FRAME_LIST_LEN);
        unsafe { store(self.0.as_ptr().add(slot), link.0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_sizes() {
        assert_eq!(TD_SIZE, 32);
        assert_eq!(QH_SIZE, 16);
    }

    #[test]
    fn token_fields() {
        let token = Token::new(Pid::In, 5, 2, true, 64);
        assert_eq!(token.raw() & 0xFF, 0x69);
        assert_eq!(token.address(), 5);
        assert_eq!(token.endpoint(), 2);
        assert!(token.toggle());
        assert_eq!(token.max_len(), 64);
        assert_eq!(token.raw() >> 21, 63);
        assert!(!token.with_toggle(false).toggle());
    }

    #[test]
    fn zero_length_encoding() {
        let token = Token::new(Pid::Out, 1, 0, false, 0);
        assert_eq!(token.raw() >> 21, NULL_LENGTH);
        assert_eq!(token.max_len(), 0);

        let status = TdStatus::armed();
        assert_eq!(status.actual_len(), 0);
        assert_eq!(status.error_count(), 3);
        assert_eq!(status.with_actual_len(8).actual_len(), 8);
        assert_eq!(status.with_actual_len(8).bits() & 0x7FF, 7);
    }

    #[test]
    fn link_words() {
        let phys = PhysAddr::new(0x1234_5670);
        let link = Link::qh(phys);
        assert_eq!(link.raw(), 0x1234_5672);
        assert!(link.is_qh());
        assert!(!link.is_terminate());
        assert_eq!(link.addr(), phys);
        assert!(link.with(LinkFlags::TERMINATE).is_terminate());
        assert_eq!(Link::td(phys).raw(), 0x1234_5670);
    }
}
