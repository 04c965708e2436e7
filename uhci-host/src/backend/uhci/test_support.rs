//! Fixtures shared by the unit tests of the controller core.

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use std::sync::Once;

use dma_api::{DError, Direction, Osal};
use spin::Mutex;
use usb_if::{err::TransferError, transfer::EndpointType};

use super::{
    context::Context,
    descriptor::{EndpointInfo, QhId, QhKind, TdId},
    dma::{DmaAllocator, DmaRegion, GlobalDma},
    errata::Errata,
    reg::RegIo,
    schedule::Schedule,
    transfer::{Completion, Segment, TransferBuffer},
};

use crate::Kernel;

pub type CompletionLog = Arc<Mutex<Vec<(Result<(), TransferError>, u32)>>>;

/// A log of completions and a factory for callbacks that append to it.
pub fn recorder() -> (CompletionLog, impl Fn() -> Completion) {
    let log: CompletionLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (log, move || {
        let sink = sink.clone();
        Completion::new(move |status, remaining| sink.lock().push((status, remaining)))
    })
}

/// Clock that only moves when someone sleeps.
#[derive(Default)]
pub struct TestKernel {
    now_us: AtomicU64,
}

impl Kernel for TestKernel {
    fn delay(&self, duration: Duration) {
        self.now_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    fn now(&self) -> Duration {
        Duration::from_micros(self.now_us.load(Ordering::SeqCst))
    }
}

/// Register window where every read returns zero.
pub struct NullIo;

impl RegIo for NullIo {
    fn read8(&self, _offset: u16) -> u8 {
        0
    }
    fn read16(&self, _offset: u16) -> u16 {
        0
    }
    fn read32(&self, _offset: u16) -> u32 {
        0
    }
    fn write8(&self, _offset: u16, _value: u8) {}
    fn write16(&self, _offset: u16, _value: u16) {}
    fn write32(&self, _offset: u16, _value: u32) {}
}

pub fn dummy_io() -> NullIo {
    NullIo
}

/// dma-api backend on the global heap. Bus addresses are handed out from a
/// synthetic 32-bit space that is never reused, so regions never touch.
pub struct HeapOsal {
    regions: Mutex<BTreeMap<usize, (u64, usize)>>,
    next_bus: AtomicU64,
}

impl HeapOsal {
    const fn new() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            next_bus: AtomicU64::new(0x0010_0000),
        }
    }
}

impl Osal for HeapOsal {
    fn map(&self, addr: NonNull<u8>, _size: usize, _direction: Direction) -> u64 {
        let addr = addr.as_ptr() as usize;
        let regions = self.regions.lock();
        match regions.range(..=addr).next_back() {
            Some((&base, &(bus, size))) if addr < base + size => bus + (addr - base) as u64,
            _ => addr as u64,
        }
    }

    fn unmap(&self, _addr: NonNull<u8>, _size: usize) {}

    fn flush(&self, _addr: NonNull<u8>, _size: usize) {}

    fn invalidate(&self, _addr: NonNull<u8>, _size: usize) {}

    unsafe fn alloc(&self, _dma_mask: u64, layout: Layout) -> *mut u8 {
        let layout = match layout.align_to(16) {
            Ok(layout) if layout.size() > 0 => layout,
            _ => return core::ptr::null_mut(),
        };
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return ptr;
        }
        let align = layout.align() as u64;
        let size = layout.size() as u64;
        let mut bus = 0;
        let _ = self
            .next_bus
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                bus = next.div_ceil(align) * align;
                Some(bus + size)
            });
        self.regions.lock().insert(ptr as usize, (bus, layout.size()));
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.regions.lock().remove(&(ptr as usize));
        if let Ok(layout) = layout.align_to(16) {
            unsafe { std::alloc::dealloc(ptr, layout) };
        }
    }
}

static HEAP_OSAL: HeapOsal = HeapOsal::new();
static INSTALL: Once = Once::new();

/// Allocator over the heap-backed dma-api layer, registering it on first use.
pub fn heap_dma() -> Arc<dyn DmaAllocator> {
    INSTALL.call_once(|| {
        #[allow(unused_unsafe)]
        unsafe {
            dma_api::init(&HEAP_OSAL)
        };
    });
    Arc::new(GlobalDma)
}

/// DMA that fails once `budget` allocations have been made.
pub struct LimitedDma {
    inner: Arc<dyn DmaAllocator>,
    budget: AtomicUsize,
}

impl LimitedDma {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: heap_dma(),
            budget: AtomicUsize::new(budget),
        }
    }

    pub fn set_budget(&self, budget: usize) {
        self.budget.store(budget, Ordering::SeqCst);
    }
}

impl DmaAllocator for LimitedDma {
    fn alloc(&self, size: usize, align: usize) -> Result<DmaRegion, DError> {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map_err(|_| DError::NoMemory)?;
        self.inner.alloc(size, align)
    }
}

/// DMA memory handed to a transfer, freed when dropped.
pub struct TestMem {
    region: DmaRegion,
    len: usize,
}

impl TestMem {
    pub fn bytes(&self) -> Vec<u8> {
        unsafe { core::slice::from_raw_parts(self.region.virt().as_ptr(), self.len).to_vec() }
    }

    pub fn fill(&self, data: &[u8]) {
        let len = data.len().min(self.len);
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.region.virt().as_ptr(), len);
        }
    }
}

pub struct TestBed {
    pub dma: Arc<dyn DmaAllocator>,
    pub kernel: Arc<TestKernel>,
    pub ctx: Context,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_dma(heap_dma())
    }

    pub fn with_dma(dma: Arc<dyn DmaAllocator>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let kernel = Arc::new(TestKernel::default());
        let ctx = Context::new(dma.clone(), kernel.clone(), Errata::empty(), 64);
        Self { dma, kernel, ctx }
    }

    pub fn with_schedule() -> Self {
        let mut bed = Self::new();
        let schedule = Schedule::build(&mut bed.ctx.pool, bed.dma.clone(), 1024).unwrap();
        bed.ctx.schedule = Some(schedule);
        bed
    }

    /// Allocate a QH for `info` and link it into the schedule.
    pub fn endpoint(&mut self, info: EndpointInfo) -> QhId {
        let kind = match info.kind {
            EndpointType::Control => QhKind::Control,
            EndpointType::Bulk => QhKind::Bulk,
            _ => QhKind::Interrupt,
        };
        let ctx = &mut self.ctx;
        let qh = ctx.pool.alloc_qh(kind).unwrap();
        ctx.pool.qh_mut(qh).endpoint = Some(info);
        ctx.schedule.as_mut().unwrap().link_endpoint(&mut ctx.pool, qh).unwrap();
        ctx.endpoints.insert(info.address, qh);
        qh
    }

    /// Every TD reachable from `first` through the software links.
    pub fn chain_tds(&self, first: TdId) -> Vec<TdId> {
        let mut out = Vec::new();
        let mut td = Some(first);
        while let Some(id) = td {
            out.push(id);
            td = self.ctx.pool.td(id).next();
        }
        out
    }

    /// One physically contiguous buffer of `len` bytes.
    pub fn dma_buffer(&self, len: usize) -> (TransferBuffer, TestMem) {
        let region = self.dma.alloc(len.max(1), 64).unwrap();
        let buffer = unsafe {
            TransferBuffer::from_segments(vec![Segment::new(region.virt(), region.phys(), len)])
        };
        let mem = TestMem { region, len };
        (buffer, mem)
    }

    /// A buffer split into two pieces far apart on the bus, so packets
    /// crossing `split` are not contiguous.
    pub fn split_buffer(&self, len: usize, split: usize) -> (TransferBuffer, TestMem, TestMem) {
        let (_, a) = self.dma_buffer(split);
        let (_, gap) = self.dma_buffer(4096);
        let (_, b) = self.dma_buffer(len - split);
        drop(gap);
        let region_a = &a.region;
        let region_b = &b.region;
        let buffer = unsafe {
            TransferBuffer::from_segments(vec![
                Segment::new(region_a.virt(), region_a.phys(), split),
                Segment::new(region_b.virt(), region_b.phys(), len - split),
            ])
        };
        (buffer, a, b)
    }
}
