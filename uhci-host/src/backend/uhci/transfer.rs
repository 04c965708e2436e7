use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};
use core::ptr::NonNull;

use usb_if::err::TransferError;

use super::{align::DmaContext, descriptor::FrameResult};
use crate::{PhysAddr, RequestId};

/// One physically contiguous piece of caller memory.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    virt: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
}

unsafe impl Send for Segment {}

impl Segment {
    /// # Safety
    ///
    /// `virt..virt+len` must stay valid and be seen by the controller at
    /// `phys` until the transfer using it completes.
    pub unsafe fn new(virt: NonNull<u8>, phys: PhysAddr, len: usize) -> Self {
        Self { virt, phys, len }
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Scatter list describing the data stage of a transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferBuffer {
    segments: Vec<Segment>,
    len: usize,
}

impl TransferBuffer {
    pub fn empty() -> Self {
        Self::default()
    }

    /// # Safety
    ///
    /// See [`Segment::new`] for every segment.
    pub unsafe fn from_segments(segments: Vec<Segment>) -> Self {
        let len = segments.iter().map(|s| s.len).sum();
        Self { segments, len }
    }

    /// # Safety
    ///
    /// `buf` must be seen by the controller at `phys` and outlive the transfer.
    pub unsafe fn from_slice(buf: &mut [u8], phys: PhysAddr) -> Self {
        match NonNull::new(buf.as_mut_ptr()) {
            Some(virt) if !buf.is_empty() => unsafe {
                Self::from_segments(vec![Segment::new(virt, phys, buf.len())])
            },
            _ => Self::empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of `offset..offset+len` when it lies inside one segment.
    pub fn contiguous_phys(&self, offset: usize, len: usize) -> Option<PhysAddr> {
        let mut start = 0;
        for seg in &self.segments {
            if offset >= start && offset < start + seg.len {
                let inner = offset - start;
                return (inner + len <= seg.len).then(|| seg.phys + inner as u32);
            }
            start += seg.len;
        }
        None
    }

    fn for_each_piece(&self, offset: usize, len: usize, mut f: impl FnMut(*mut u8, usize, usize)) {
        let mut start = 0;
        let mut done = 0;
        for seg in &self.segments {
            if done == len {
                break;
            }
            let end = start + seg.len;
            let want = offset + done;
            if want < end {
                let inner = want - start;
                let n = (seg.len - inner).min(len - done);
                f(unsafe { seg.virt.as_ptr().add(inner) }, done, n);
                done += n;
            }
            start = end;
        }
    }

    /// Copy `out.len()` bytes starting at `offset` out of the caller's memory.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        let len = out.len().min(self.len.saturating_sub(offset));
        self.for_each_piece(offset, len, |ptr, at, n| unsafe {
            core::ptr::copy_nonoverlapping(ptr, out[at..].as_mut_ptr(), n);
        });
    }

    /// Copy `data` into the caller's memory at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let len = data.len().min(self.len.saturating_sub(offset));
        self.for_each_piece(offset, len, |ptr, at, n| unsafe {
            core::ptr::copy_nonoverlapping(data[at..].as_ptr(), ptr, n);
        });
    }
}

pub type CompletionFn = Box<dyn FnOnce(Result<(), TransferError>, u32) + Send>;
pub type IsochCompletionFn = Box<dyn FnOnce(Result<(), TransferError>, &[FrameResult]) + Send>;

/// Upstream completion for one transfer. Invoked exactly once.
pub enum Completion {
    /// Receives the status and the number of bytes not transferred.
    Transfer(CompletionFn),
    /// Receives the overall status and the per-frame results.
    Isoch(IsochCompletionFn),
}

impl Completion {
    pub fn new(f: impl FnOnce(Result<(), TransferError>, u32) + Send + 'static) -> Self {
        Self::Transfer(Box::new(f))
    }

    pub fn isoch(
        f: impl FnOnce(Result<(), TransferError>, &[FrameResult]) + Send + 'static,
    ) -> Self {
        Self::Isoch(Box::new(f))
    }
}

pub struct TransferRequest {
    pub(crate) completion: Option<Completion>,
    /// Transactions (control phases, isochronous frames) still outstanding.
    pub(crate) phases_left: usize,
    pub(crate) status: Result<(), TransferError>,
    pub(crate) remaining: u32,
    pub(crate) dma: DmaContext,
    pub(crate) buffer: TransferBuffer,
    /// Counted in the outstanding control/bulk total.
    pub(crate) control_bulk: bool,
    /// Completion already delivered; later phases are retired silently.
    pub(crate) finished: bool,
    pub(crate) frames: Vec<Option<FrameResult>>,
}

impl TransferRequest {
    pub fn new(completion: Completion, buffer: TransferBuffer, phases: usize) -> Self {
        Self {
            completion: Some(completion),
            phases_left: phases,
            status: Ok(()),
            remaining: 0,
            dma: DmaContext::default(),
            buffer,
            control_bulk: false,
            finished: false,
            frames: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Default)]
pub struct RequestTable {
    next: u64,
    requests: BTreeMap<RequestId, TransferRequest>,
}

impl RequestTable {
    pub fn insert(&mut self, request: TransferRequest) -> RequestId {
        self.next += 1;
        let id = RequestId::new(self.next);
        self.requests.insert(id, request);
        id
    }

    pub fn get(&self, id: RequestId) -> Option<&TransferRequest> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut TransferRequest> {
        self.requests.get_mut(&id)
    }

    pub fn remove(&mut self, id: RequestId) -> Option<TransferRequest> {
        self.requests.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguity_follows_segments() {
        let mut a = [0u8; 10];
        let mut b = [0u8; 10];
        let buf = unsafe {
            TransferBuffer::from_segments(vec![
                Segment::new(NonNull::new(a.as_mut_ptr()).unwrap(), PhysAddr::new(0x1000), 10),
                Segment::new(NonNull::new(b.as_mut_ptr()).unwrap(), PhysAddr::new(0x8000), 10),
            ])
        };
        assert_eq!(buf.len(), 20);
        assert_eq!(buf.contiguous_phys(2, 8), Some(PhysAddr::new(0x1002)));
        assert_eq!(buf.contiguous_phys(8, 4), None);
        assert_eq!(buf.contiguous_phys(12, 8), Some(PhysAddr::new(0x8002)));
        assert_eq!(buf.contiguous_phys(20, 1), None);
    }

    #[test]
    fn scatter_copy_crosses_segments() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let buf = unsafe {
            TransferBuffer::from_segments(vec![
                Segment::new(NonNull::new(a.as_mut_ptr()).unwrap(), PhysAddr::new(0x1000), 4),
                Segment::new(NonNull::new(b.as_mut_ptr()).unwrap(), PhysAddr::new(0x8000), 4),
            ])
        };
        buf.write_at(2, &[9, 8, 7, 6]);
        let mut out = [0u8; 6];
        buf.read_at(1, &mut out);
        assert_eq!(out, [0, 9, 8, 7, 6, 0]);
        assert_eq!(a, [0, 0, 9, 8]);
        assert_eq!(b, [7, 6, 0, 0]);
    }
}
