//! Typed-closure envelopes packed into aggregation buffers.
//!
//! Every process in the job runs the same binary in one address space, so a
//! closure travels as its invoke thunk's code address plus its raw capture
//! bytes, optionally followed by an opaque payload. Delivery walks the packed
//! stream and moves each closure out of the buffer exactly once; the buffer
//! holds plain bytes afterwards, so nothing is double-dropped.

use std::mem;
use std::ptr;

/// Thunk invoked at the destination: (closure bytes, payload bytes, payload len).
type InvokeFn = unsafe fn(*const u8, *const u8, usize);

#[repr(C)]
struct Envelope {
    invoke: usize,
    closure_len: u32,
    payload_len: u32,
}

const HEADER: usize = mem::size_of::<Envelope>();
const RECORD_ALIGN: usize = mem::align_of::<Envelope>();

fn align_up(n: usize) -> usize {
    (n + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// Serialize a plain closure into `buf`.
pub(crate) fn push_closure<F>(buf: &mut Vec<u8>, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let invoke: InvokeFn = invoke_plain::<F>;
    push_record(buf, invoke, f, &[]);
}

/// Serialize a closure with a trailing opaque payload into `buf`. The closure
/// is invoked at the destination with the reassembled payload bytes.
pub(crate) fn push_closure_with_payload<F>(buf: &mut Vec<u8>, f: F, payload: &[u8])
where
    F: FnOnce(&[u8]) + Send + 'static,
{
    let invoke: InvokeFn = invoke_payload::<F>;
    push_record(buf, invoke, f, payload);
}

fn push_record<F>(buf: &mut Vec<u8>, invoke: InvokeFn, f: F, payload: &[u8]) {
    let closure_len = mem::size_of::<F>();
    let base = align_up(buf.len());
    buf.resize(base, 0);

    let env = Envelope {
        invoke: invoke as usize,
        closure_len: closure_len as u32,
        payload_len: payload.len() as u32,
    };
    // SAFETY: Envelope is repr(C) plain data; we serialize its bytes as-is.
    let env_bytes =
        unsafe { std::slice::from_raw_parts(&env as *const Envelope as *const u8, HEADER) };
    buf.extend_from_slice(env_bytes);

    // SAFETY: any value may be viewed as its raw bytes; ownership transfers
    // into the buffer, so the original must not be dropped.
    let f_bytes =
        unsafe { std::slice::from_raw_parts(&f as *const F as *const u8, closure_len) };
    buf.extend_from_slice(f_bytes);
    mem::forget(f);

    buf.extend_from_slice(payload);
}

/// Invoke every closure in the packed stream, in order, exactly once.
/// Returns the number of closures delivered. The buffer is cleared: its
/// contents are dead bytes once the closures have been moved out.
pub(crate) fn deliver(buf: &mut Vec<u8>) -> usize {
    let mut off = 0;
    let mut count = 0;
    let len = buf.len();
    let base = buf.as_ptr();
    while off < len {
        off = align_up(off);
        debug_assert!(off + HEADER <= len, "truncated envelope header");
        // SAFETY: records are packed back to back starting at aligned
        // offsets; the header was serialized by push_record. The buffer base
        // itself carries no alignment guarantee, hence the unaligned read.
        let env = unsafe { ptr::read_unaligned(base.add(off) as *const Envelope) };
        let closure_at = off + HEADER;
        let payload_at = closure_at + env.closure_len as usize;
        let end = payload_at + env.payload_len as usize;
        debug_assert!(end <= len, "truncated record body");

        // SAFETY: invoke was produced from a monomorphized thunk in this
        // binary; the closure bytes are moved out by the thunk, which is the
        // single point of consumption for this record.
        unsafe {
            let invoke: InvokeFn = mem::transmute(env.invoke);
            invoke(
                base.add(closure_at),
                base.add(payload_at),
                env.payload_len as usize,
            );
        }
        count += 1;
        off = end;
    }
    buf.clear();
    count
}

unsafe fn invoke_plain<F>(closure: *const u8, _payload: *const u8, _len: usize)
where
    F: FnOnce() + Send + 'static,
{
    // SAFETY: reads the closure out of unaligned buffer storage; the caller
    // guarantees this record is consumed exactly once.
    let f: F = unsafe { ptr::read_unaligned(closure as *const F) };
    f();
}

unsafe fn invoke_payload<F>(closure: *const u8, payload: *const u8, len: usize)
where
    F: FnOnce(&[u8]) + Send + 'static,
{
    // SAFETY: as above; the payload pointer addresses `len` bytes inside the
    // batch buffer.
    let f: F = unsafe { ptr::read_unaligned(closure as *const F) };
    let bytes = if len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(payload, len) }
    };
    f(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_deliver_in_order() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut buf = Vec::new();
        for i in 0..100usize {
            let hits = Arc::clone(&hits);
            push_closure(&mut buf, move || {
                // FIFO: each closure sees exactly the ones before it.
                assert_eq!(hits.fetch_add(1, Ordering::SeqCst), i);
            });
        }
        assert_eq!(deliver(&mut buf), 100);
        assert_eq!(hits.load(Ordering::SeqCst), 100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_exactly_once_ownership() {
        // A closure owning a String is moved out of the buffer and dropped
        // exactly once at invocation.
        let hits = Arc::new(AtomicUsize::new(0));
        let mut buf = Vec::new();
        let s = String::from("payload-owned-capture");
        {
            let hits = Arc::clone(&hits);
            push_closure(&mut buf, move || {
                assert_eq!(s.len(), 21);
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(deliver(&mut buf), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payload_roundtrip() {
        let got = Arc::new(AtomicUsize::new(0));
        let mut buf = Vec::new();
        let value: u32 = 12_345_678;
        {
            let got = Arc::clone(&got);
            push_closure_with_payload(
                &mut buf,
                move |bytes| {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(bytes);
                    got.store(u32::from_le_bytes(raw) as usize, Ordering::SeqCst);
                },
                &value.to_le_bytes(),
            );
        }
        deliver(&mut buf);
        assert_eq!(got.load(Ordering::SeqCst), 12_345_678);
    }

    #[test]
    fn test_empty_buffer() {
        let mut buf = Vec::new();
        assert_eq!(deliver(&mut buf), 0);
    }

    #[test]
    fn test_mixed_records() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut buf = Vec::new();
        let h = Arc::clone(&hits);
        push_closure(&mut buf, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        push_closure_with_payload(
            &mut buf,
            move |bytes| {
                h.fetch_add(bytes.len(), Ordering::SeqCst);
            },
            &[0u8; 7],
        );
        let h = Arc::clone(&hits);
        push_closure(&mut buf, move || {
            h.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(deliver(&mut buf), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 108);
    }
}
