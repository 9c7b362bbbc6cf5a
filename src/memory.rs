// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Field-tagged GPU arrays.
//!
//! [`DeviceAsyncArray`] is the currency of the processing graph: every node
//! output is one device-resident array holding `len` elements of the size
//! dictated by its [`Field`] tag. Arrays grow geometrically and never
//! shrink, so `resize(n, false, false)` is O(1) amortized. All mutating
//! operations are ordered on the stream they are given and asynchronous
//! with respect to the host unless stated otherwise.
//!
//! [`HostPinnedArray`] is the page-locked host-side counterpart used where
//! a node needs the data on the CPU (radar clustering, yield readback).
//!
//! Sharing model: arrays are reference-counted (`Arc`) between the
//! producing node and the run registry that pins them until the run
//! completes. Interior state sits behind a mutex; the device pointer
//! handed out for kernel launches stays valid until the next resize, which
//! only the producing node performs, before any consumer is enqueued on
//! the same stream.

use std::sync::Mutex;

use bytemuck::Pod;
use cust::memory::{
    AsyncCopyDestination, CopyDestination, DeviceBuffer, DevicePointer, DeviceSlice, LockedBuffer,
};
use cust::stream::Stream;

use crate::error::{Error, Result};
use crate::field::Field;

/// Where an array's bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// Device global memory, stream-ordered access.
    DeviceAsync,
    /// Page-locked host memory, participates in async copies.
    HostPinned,
    /// Ordinary host memory; copies involving it synchronize.
    HostPageable,
}

impl MemoryKind {
    /// True if a GPU kernel may dereference pointers into this memory.
    pub const fn is_device_accessible(self) -> bool {
        matches!(self, MemoryKind::DeviceAsync)
    }
}

struct DeviceArrayState {
    buf: Option<DeviceBuffer<u8>>,
    len: usize,
}

/// A typed contiguous device buffer labeled with one [`Field`].
///
/// The element type is dictated by the field tag; typed host access goes
/// through the size-checked [`upload`](Self::upload) /
/// [`download`](Self::download) views.
pub struct DeviceAsyncArray {
    field: Field,
    state: Mutex<DeviceArrayState>,
}

// Device allocations are context-global; access to the handle is
// serialized by the interior mutex.
unsafe impl Send for DeviceAsyncArray {}
unsafe impl Sync for DeviceAsyncArray {}

impl DeviceAsyncArray {
    pub fn new(field: Field) -> Self {
        Self {
            field,
            state: Mutex::new(DeviceArrayState { buf: None, len: 0 }),
        }
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn memory_kind(&self) -> MemoryKind {
        MemoryKind::DeviceAsync
    }

    /// Element size in bytes, from the field tag.
    pub fn elem_size(&self) -> usize {
        self.field.size()
    }

    /// Number of valid elements.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw device address of the first element, or 0 if unallocated.
    ///
    /// Valid until the next `resize` that grows past capacity.
    pub fn device_ptr(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .buf
            .as_ref()
            .map(|b| b.as_device_ptr().as_raw())
            .unwrap_or(0)
    }

    /// Resize to `len` elements.
    ///
    /// Capacity grows geometrically and is never returned. With `preserve`
    /// the old contents are carried over by a stream-ordered device copy.
    /// With `zero` the whole new extent is cleared (host-staged fill, which
    /// synchronizes; nodes use it only for freshly created scratch).
    pub fn resize(&self, len: usize, preserve: bool, zero: bool, stream: &Stream) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let elem = self.field.size();
        let needed = len * elem;
        let capacity = state.buf.as_ref().map(|b| b.len()).unwrap_or(0);

        if needed > capacity {
            let new_cap = needed.max(capacity * 2).max(elem * 16);
            let new_buf = unsafe { DeviceBuffer::<u8>::uninitialized(new_cap)? };
            if preserve && state.len > 0 {
                let old = state.buf.as_ref().expect("non-empty array has a buffer");
                let bytes = state.len * elem;
                unsafe {
                    let src = device_slice_view::<u8>(old.as_device_ptr().as_raw(), bytes);
                    let dst = device_slice_view_mut(new_buf.as_device_ptr().as_raw(), bytes);
                    dst.async_copy_from(src, stream)?;
                }
            }
            state.buf = Some(new_buf);
        }

        if zero && needed > 0 {
            let zeros = vec![0u8; needed];
            let buf = state.buf.as_ref().expect("buffer allocated above");
            let dst = unsafe { device_slice_view_mut(buf.as_device_ptr().as_raw(), needed) };
            dst.copy_from(zeros.as_slice())?;
        }

        state.len = len;
        Ok(())
    }

    /// Replace the contents with a host slice (size-checked against the
    /// field tag). The copy is staged through pageable memory and
    /// synchronizes before returning.
    pub fn upload<T: Pod>(&self, data: &[T], stream: &Stream) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() % self.field.size() != 0 {
            return Err(Error::InvalidArgument(format!(
                "upload of {} bytes is not a multiple of {} element size {}",
                bytes.len(),
                self.field,
                self.field.size()
            )));
        }
        let len = bytes.len() / self.field.size();
        self.resize(len, false, false, stream)?;
        let state = self.state.lock().unwrap();
        if let Some(buf) = state.buf.as_ref() {
            let dst = unsafe { device_slice_view_mut(buf.as_device_ptr().as_raw(), bytes.len()) };
            dst.copy_from(bytes)?;
        }
        Ok(())
    }

    /// Read the contents back as raw bytes with a synchronous copy. The
    /// caller is responsible for having drained every pending write (the
    /// graph waits on the producing node's event first).
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let bytes = state.len * self.field.size();
        let mut out = vec![0u8; bytes];
        if bytes > 0 {
            if let Some(buf) = state.buf.as_ref() {
                let src = unsafe { device_slice_view::<u8>(buf.as_device_ptr().as_raw(), bytes) };
                src.copy_to(out.as_mut_slice())?;
            }
        }
        Ok(out)
    }

    /// Read the contents back as a typed host vector. Drains `stream`
    /// first so every pending write to this array is visible.
    pub fn download<T: Pod + Default + Clone>(&self, stream: &Stream) -> Result<Vec<T>> {
        stream.synchronize()?;
        let state = self.state.lock().unwrap();
        let bytes = state.len * self.field.size();
        if bytes % std::mem::size_of::<T>() != 0 {
            return Err(Error::InvalidArgument(format!(
                "field {} ({} bytes) does not reinterpret as the requested element type",
                self.field, bytes
            )));
        }
        let mut out = vec![T::default(); bytes / std::mem::size_of::<T>()];
        if bytes > 0 {
            if let Some(buf) = state.buf.as_ref() {
                let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
                let src = unsafe { device_slice_view::<u8>(buf.as_device_ptr().as_raw(), bytes) };
                src.copy_to(dst)?;
            }
        }
        Ok(out)
    }

    /// Stream-ordered device-to-device copy of `src` into this array at
    /// element offset `dst_offset`. The destination must already be sized.
    pub fn copy_region_from(
        &self,
        src: &DeviceAsyncArray,
        dst_offset: usize,
        stream: &Stream,
    ) -> Result<()> {
        if src.field.size() != self.field.size() {
            return Err(Error::InvalidArgument(format!(
                "cannot copy {} into {}: element sizes differ",
                src.field, self.field
            )));
        }
        let src_state = src.state.lock().unwrap();
        let dst_state = self.state.lock().unwrap();
        let elem = self.field.size();
        let src_bytes = src_state.len * elem;
        if src_bytes == 0 {
            return Ok(());
        }
        if (dst_offset + src_state.len) > dst_state.len {
            return Err(Error::InvalidArgument(format!(
                "region copy past the end of {} ({} + {} > {})",
                self.field, dst_offset, src_state.len, dst_state.len
            )));
        }
        let src_buf = src_state.buf.as_ref().expect("non-empty source buffer");
        let dst_buf = dst_state.buf.as_ref().expect("sized destination buffer");
        unsafe {
            let src = device_slice_view::<u8>(src_buf.as_device_ptr().as_raw(), src_bytes);
            let dst = device_slice_view_mut(
                dst_buf.as_device_ptr().as_raw() + (dst_offset * elem) as u64,
                src_bytes,
            );
            dst.async_copy_from(src, stream)?;
        }
        Ok(())
    }

    /// Stream-ordered full copy from another device array, resizing first.
    pub fn copy_from(&self, src: &DeviceAsyncArray, stream: &Stream) -> Result<()> {
        self.resize(src.len(), false, false, stream)?;
        self.copy_region_from(src, 0, stream)
    }
}

/// Page-locked host array with the same resize discipline as
/// [`DeviceAsyncArray`].
pub struct HostPinnedArray<T: cust::memory::DeviceCopy + Default + Clone> {
    buf: Option<LockedBuffer<T>>,
    len: usize,
}

impl<T: cust::memory::DeviceCopy + Default + Clone> HostPinnedArray<T> {
    pub fn new() -> Self {
        Self { buf: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory_kind(&self) -> MemoryKind {
        MemoryKind::HostPinned
    }

    /// Resize to exactly `len` elements. Pinned allocations are not on the
    /// per-point hot path, so storage is reallocated to the exact size
    /// whenever the length changes; contents are not preserved.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        let capacity = self.buf.as_ref().map(|b| b.len()).unwrap_or(0);
        if len != capacity {
            self.buf = if len > 0 {
                Some(LockedBuffer::new(&T::default(), len)?)
            } else {
                None
            };
        }
        self.len = len;
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len;
        match &mut self.buf {
            Some(buf) => &mut buf[..len],
            None => &mut [],
        }
    }

    /// Stream-ordered device-to-host copy of the whole of `src`. The
    /// caller must drain the stream before touching the slice.
    pub fn copy_from_device(&mut self, src: &DeviceAsyncArray, stream: &Stream) -> Result<()> {
        let src_state = src.state.lock().unwrap();
        let bytes = src_state.len * src.field.size();
        if bytes % std::mem::size_of::<T>() != 0 {
            return Err(Error::InvalidArgument(format!(
                "field {} does not reinterpret as the pinned element type",
                src.field
            )));
        }
        let elems = bytes / std::mem::size_of::<T>();
        self.resize(elems)?;
        if elems == 0 {
            return Ok(());
        }
        let src_buf = src_state.buf.as_ref().expect("non-empty source buffer");
        let dst = self.buf.as_mut().expect("resized above");
        unsafe {
            let src_view: &DeviceSlice<T> =
                device_slice_view(src_buf.as_device_ptr().as_raw(), elems);
            src_view.async_copy_to(dst, stream)?;
        }
        Ok(())
    }

    /// Stream-ordered host-to-device copy of this array into `dst`.
    pub fn copy_to_device(&self, dst: &DeviceAsyncArray, stream: &Stream) -> Result<()> {
        let bytes = self.len * std::mem::size_of::<T>();
        if bytes % dst.field.size() != 0 {
            return Err(Error::InvalidArgument(format!(
                "pinned data does not reinterpret as field {}",
                dst.field
            )));
        }
        dst.resize(bytes / dst.field.size(), false, false, stream)?;
        if bytes == 0 {
            return Ok(());
        }
        let dst_state = dst.state.lock().unwrap();
        let dst_buf = dst_state.buf.as_ref().expect("sized above");
        let src = self.buf.as_ref().expect("non-empty pinned buffer");
        unsafe {
            let dst_view: &mut DeviceSlice<T> =
                device_slice_view_mut_t(dst_buf.as_device_ptr().as_raw(), self.len);
            dst_view.async_copy_from(src, stream)?;
        }
        Ok(())
    }
}

impl<T: cust::memory::DeviceCopy + Default + Clone> Default for HostPinnedArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reinterpret a raw device address as a byte slice view.
///
/// Safety: `ptr` must point to at least `bytes` of device memory that
/// stays allocated for the lifetime of the view.
unsafe fn device_slice_view<'a, T: cust::memory::DeviceCopy>(
    ptr: u64,
    len: usize,
) -> &'a DeviceSlice<T> {
    DeviceSlice::from_raw_parts(DevicePointer::from_raw(ptr), len)
}

unsafe fn device_slice_view_mut<'a>(ptr: u64, bytes: usize) -> &'a mut DeviceSlice<u8> {
    DeviceSlice::from_raw_parts_mut(DevicePointer::from_raw(ptr), bytes)
}

unsafe fn device_slice_view_mut_t<'a, T: cust::memory::DeviceCopy>(
    ptr: u64,
    len: usize,
) -> &'a mut DeviceSlice<T> {
    DeviceSlice::from_raw_parts_mut(DevicePointer::from_raw(ptr), len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_kind_device_accessibility() {
        assert!(MemoryKind::DeviceAsync.is_device_accessible());
        assert!(!MemoryKind::HostPinned.is_device_accessible());
        assert!(!MemoryKind::HostPageable.is_device_accessible());
    }

    #[test]
    fn fresh_array_reports_empty() {
        let arr = DeviceAsyncArray::new(Field::Distance);
        assert_eq!(arr.len(), 0);
        assert!(arr.is_empty());
        assert_eq!(arr.device_ptr(), 0);
        assert_eq!(arr.elem_size(), 4);
    }
}
