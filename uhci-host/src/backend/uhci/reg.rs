use core::ptr::NonNull;

use tock_registers::{LocalRegisterCopy, register_bitfields};

use crate::PhysAddr;

pub const USBCMD: u16 = 0x00;
pub const USBSTS: u16 = 0x02;
pub const USBINTR: u16 = 0x04;
pub const FRNUM: u16 = 0x06;
pub const FLBASEADD: u16 = 0x08;
pub const SOFMOD: u16 = 0x0C;
pub const PORTSC1: u16 = 0x10;
pub const PORTSC2: u16 = 0x12;

pub const FRNUM_MASK: u32 = 0x7FF;
pub const FRNUM_COUNT: u32 = 0x800;

register_bitfields![u16,
    pub USBCMD_REG [
        RS OFFSET(0) NUMBITS(1) [],
        HCRESET OFFSET(1) NUMBITS(1) [],
        GRESET OFFSET(2) NUMBITS(1) [],
        EGSM OFFSET(3) NUMBITS(1) [],
        FGR OFFSET(4) NUMBITS(1) [],
        SWDBG OFFSET(5) NUMBITS(1) [],
        CF OFFSET(6) NUMBITS(1) [],
        MAXP OFFSET(7) NUMBITS(1) []
    ],
    pub USBSTS_REG [
        USBINT OFFSET(0) NUMBITS(1) [],
        USBERRINT OFFSET(1) NUMBITS(1) [],
        RD OFFSET(2) NUMBITS(1) [],
        HSE OFFSET(3) NUMBITS(1) [],
        HCPE OFFSET(4) NUMBITS(1) [],
        HCH OFFSET(5) NUMBITS(1) []
    ],
    pub USBINTR_REG [
        TIE OFFSET(0) NUMBITS(1) [],
        RIE OFFSET(1) NUMBITS(1) [],
        IOCE OFFSET(2) NUMBITS(1) [],
        SPIE OFFSET(3) NUMBITS(1) []
    ],
    pub PORTSC_REG [
        CCS OFFSET(0) NUMBITS(1) [],
        CSC OFFSET(1) NUMBITS(1) [],
        PED OFFSET(2) NUMBITS(1) [],
        PEDC OFFSET(3) NUMBITS(1) [],
        RESUME_DETECT OFFSET(6) NUMBITS(1) [],
        LSDA OFFSET(8) NUMBITS(1) [],
        PR OFFSET(9) NUMBITS(1) [],
        SUSP OFFSET(12) NUMBITS(1) []
    ]
];

pub type Command = LocalRegisterCopy<u16, USBCMD_REG::Register>;
pub type Status = LocalRegisterCopy<u16, USBSTS_REG::Register>;
pub type InterruptEnable = LocalRegisterCopy<u16, USBINTR_REG::Register>;
pub type PortStatus = LocalRegisterCopy<u16, PORTSC_REG::Register>;

/// Raw access to the controller's I/O window.
///
/// UHCI exposes its registers through a PCI I/O BAR on most parts, and through
/// memory space on a few embedded ones. Offsets are relative to the window.
pub trait RegIo: Send + Sync {
    fn read8(&self, offset: u16) -> u8;
    fn read16(&self, offset: u16) -> u16;
    fn read32(&self, offset: u16) -> u32;
    fn write8(&self, offset: u16, value: u8);
    fn write16(&self, offset: u16, value: u16);
    fn write32(&self, offset: u16, value: u32);
}

/// Memory-mapped register window.
pub struct Mmio {
    base: NonNull<u8>,
}

unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// # Safety
    ///
    /// `base` must map the controller's register window for the lifetime of
    /// the returned value.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    fn at<T>(&self, offset: u16) -> *mut T {
        unsafe { self.base.as_ptr().add(offset as usize).cast() }
    }
}

impl RegIo for Mmio {
    fn read8(&self, offset: u16) -> u8 {
        unsafe { self.at::<u8>(offset).read_volatile() }
    }

    fn read16(&self, offset: u16) -> u16 {
        u16::from_le(unsafe { self.at::<u16>(offset).read_volatile() })
    }

    fn read32(&self, offset: u16) -> u32 {
        u32::from_le(unsafe { self.at::<u32>(offset).read_volatile() })
    }

    fn write8(&self, offset: u16, value: u8) {
        unsafe { self.at::<u8>(offset).write_volatile(value) }
    }

    fn write16(&self, offset: u16, value: u16) {
        unsafe { self.at::<u16>(offset).write_volatile(value.to_le()) }
    }

    fn write32(&self, offset: u16, value: u32) {
        unsafe { self.at::<u32>(offset).write_volatile(value.to_le()) }
    }
}

/// x86 port I/O window.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub struct PortIo {
    base: u16,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortIo {
    /// # Safety
    ///
    /// `base` must be the controller's I/O BAR and the caller must have I/O
    /// privilege.
    pub unsafe fn new(base: u16) -> Self {
        Self { base }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl RegIo for PortIo {
    fn read8(&self, offset: u16) -> u8 {
        let value: u8;
        unsafe {
            core::arch::asm!("in al, dx", out("al") value, in("dx") self.base + offset,
                options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn read16(&self, offset: u16) -> u16 {
        let value: u16;
        unsafe {
            core::arch::asm!("in ax, dx", out("ax") value, in("dx") self.base + offset,
                options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn read32(&self, offset: u16) -> u32 {
        let value: u32;
        unsafe {
            core::arch::asm!("in eax, dx", out("eax") value, in("dx") self.base + offset,
                options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn write8(&self, offset: u16, value: u8) {
        unsafe {
            core::arch::asm!("out dx, al", in("dx") self.base + offset, in("al") value,
                options(nomem, nostack, preserves_flags));
        }
    }

    fn write16(&self, offset: u16, value: u16) {
        unsafe {
            core::arch::asm!("out dx, ax", in("dx") self.base + offset, in("ax") value,
                options(nomem, nostack, preserves_flags));
        }
    }

    fn write32(&self, offset: u16, value: u32) {
        unsafe {
            core::arch::asm!("out dx, eax", in("dx") self.base + offset, in("eax") value,
                options(nomem, nostack, preserves_flags));
        }
    }
}

/// Typed view over a [`RegIo`] window.
pub struct UhciRegisters<R: RegIo> {
    io: R,
}

impl<R: RegIo> UhciRegisters<R> {
    pub fn new(io: R) -> Self {
        Self { io }
    }

    pub fn io(&self) -> &R {
        &self.io
    }

    pub fn command(&self) -> Command {
        Command::new(self.io.read16(USBCMD))
    }

    pub fn set_command(&self, cmd: Command) {
        self.io.write16(USBCMD, cmd.get());
    }

    pub fn status(&self) -> Status {
        Status::new(self.io.read16(USBSTS))
    }

    /// USBSTS bits are write-one-to-clear.
    pub fn ack_status(&self, status: Status) {
        self.io.write16(USBSTS, status.get());
    }

    pub fn is_halted(&self) -> bool {
        self.status().is_set(USBSTS_REG::HCH)
    }

    pub fn frame_index(&self) -> u32 {
        self.io.read16(FRNUM) as u32 & FRNUM_MASK
    }

    pub fn set_frame_index(&self, frame: u32) {
        self.io.write16(FRNUM, (frame & FRNUM_MASK) as u16);
    }

    pub fn frame_list_base(&self) -> PhysAddr {
        PhysAddr::new(self.io.read32(FLBASEADD))
    }

    pub fn set_frame_list_base(&self, addr: PhysAddr) {
        self.io.write32(FLBASEADD, addr.raw());
    }

    pub fn port(&self, index: usize) -> PortStatus {
        PortStatus::new(self.io.read16(PORTSC1 + 2 * index as u16))
    }
}

/// USBINTR value with every interrupt source enabled.
pub fn all_interrupts() -> InterruptEnable {
    let mut intr = InterruptEnable::new(0);
    intr.modify(
        USBINTR_REG::TIE::SET
            + USBINTR_REG::RIE::SET
            + USBINTR_REG::IOCE::SET
            + USBINTR_REG::SPIE::SET,
    );
    intr
}
