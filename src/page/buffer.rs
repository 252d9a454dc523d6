//! The bounded pool of fixed-size page buffers backing the whole cache.
//!
//! Grounded on the teacher's `cache/buffer.rs` `PageBuffer`: one contiguous
//! allocation sliced into `length` fixed-size slots, a freelist for reuse,
//! and a per-slot reader/writer lock so pages can be read and written
//! without taking a lock over the whole slab.

use core::slice;
use std::{
	alloc::{alloc, dealloc, handle_alloc_error, Layout},
	cell::UnsafeCell,
	iter,
	ops::{Deref, DerefMut},
	ptr::NonNull,
	sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::{lock_api::RawRwLock as _, Mutex, RawRwLock};

pub struct PageReadGuard<'a> {
	lock: &'a RawRwLock,
	page: &'a [u8],
}

impl<'a> Drop for PageReadGuard<'a> {
	fn drop(&mut self) {
		unsafe {
			self.lock.unlock_shared();
		}
	}
}

impl<'a> Deref for PageReadGuard<'a> {
	type Target = [u8];

	#[inline]
	fn deref(&self) -> &Self::Target {
		self.page
	}
}

pub struct PageWriteGuard<'a> {
	lock: &'a RawRwLock,
	page: &'a mut [u8],
}

impl<'a> Drop for PageWriteGuard<'a> {
	fn drop(&mut self) {
		unsafe {
			self.lock.unlock_exclusive();
		}
	}
}

impl<'a> Deref for PageWriteGuard<'a> {
	type Target = [u8];

	#[inline]
	fn deref(&self) -> &Self::Target {
		self.page
	}
}

impl<'a> DerefMut for PageWriteGuard<'a> {
	#[inline]
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.page
	}
}

/// A bounded pool of `length` fixed `page_size`-byte slots.
pub struct PageSlab {
	length: usize,
	page_size: usize,
	page_size_padded: usize,
	meta: Box<[SlotMeta]>,
	freelist: Mutex<Vec<usize>>,
	last_filled: AtomicUsize,
	pages: UnsafeCell<NonNull<u8>>,
}

// Safety: access to the underlying bytes is always mediated by each slot's
// `RawRwLock`; `pages` itself is never read or written without holding it.
unsafe impl Send for PageSlab {}
unsafe impl Sync for PageSlab {}

impl PageSlab {
	const PAGE_ALIGNMENT: usize = 8;

	pub fn new(page_size: usize, length: usize) -> Self {
		let (buf_layout, page_size_padded) = Self::layout(page_size, length);
		let Some(pages) = (unsafe { NonNull::new(alloc(buf_layout)) }) else {
			handle_alloc_error(buf_layout);
		};

		Self {
			length,
			page_size,
			page_size_padded,
			meta: iter::repeat_with(SlotMeta::default).take(length).collect(),
			freelist: Mutex::new(Vec::new()),
			last_filled: AtomicUsize::new(0),
			pages: UnsafeCell::new(pages),
		}
	}

	#[inline]
	pub fn capacity(&self) -> usize {
		self.length
	}

	#[inline]
	pub fn page_size(&self) -> usize {
		self.page_size
	}

	pub fn has_space(&self) -> bool {
		self.last_filled.load(Ordering::Relaxed) < self.length || !self.freelist.lock().is_empty()
	}

	pub fn allocate(&self) -> Option<usize> {
		let last_filled = self.last_filled.load(Ordering::Acquire);
		let index = if last_filled < self.length {
			self.last_filled.store(last_filled + 1, Ordering::Release);
			last_filled
		} else {
			self.freelist.lock().pop()?
		};
		self.meta[index].occupied.store(true, Ordering::Release);
		Some(index)
	}

	pub fn free(&self, index: usize) {
		let meta = &self.meta[index];
		meta.lock.lock_exclusive();
		if meta.occupied.swap(false, Ordering::AcqRel) {
			self.freelist.lock().push(index);
		}
		unsafe { meta.lock.unlock_exclusive() }
	}

	pub fn read(&self, index: usize) -> Option<PageReadGuard> {
		let meta = &self.meta[index];
		if !meta.occupied.load(Ordering::Acquire) {
			return None;
		}
		meta.lock.lock_shared();
		Some(PageReadGuard {
			lock: &meta.lock,
			page: unsafe { slice::from_raw_parts(self.slot_ptr(index), self.page_size) },
		})
	}

	pub fn write(&self, index: usize) -> Option<PageWriteGuard> {
		let meta = &self.meta[index];
		if !meta.occupied.load(Ordering::Acquire) {
			return None;
		}
		meta.lock.lock_exclusive();
		Some(PageWriteGuard {
			lock: &meta.lock,
			page: unsafe { slice::from_raw_parts_mut(self.slot_ptr(index), self.page_size) },
		})
	}

	fn slot_ptr(&self, index: usize) -> *mut u8 {
		assert!(index < self.length, "page slab index {index} out of bounds");
		unsafe { (*self.pages.get()).as_ptr().add(index * self.page_size_padded) }
	}

	fn layout(page_size: usize, length: usize) -> (Layout, usize) {
		let page_layout = Layout::from_size_align(page_size, Self::PAGE_ALIGNMENT).unwrap();
		page_layout.repeat(length).unwrap()
	}
}

impl Drop for PageSlab {
	fn drop(&mut self) {
		unsafe {
			dealloc(
				(*self.pages.get()).as_ptr(),
				Self::layout(self.page_size, self.length).0,
			)
		}
	}
}

struct SlotMeta {
	occupied: AtomicBool,
	lock: RawRwLock,
}

impl Default for SlotMeta {
	fn default() -> Self {
		Self {
			occupied: AtomicBool::new(false),
			lock: RawRwLock::INIT,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocate_read_and_write() {
		let slab = PageSlab::new(4, 10);

		let a = slab.allocate().unwrap();
		let b = slab.allocate().unwrap();

		slab.write(a).unwrap().copy_from_slice(b"moin");
		slab.write(b).unwrap().copy_from_slice(b"tree");

		assert_eq!(&*slab.read(a).unwrap(), b"moin");
		assert_eq!(&*slab.read(b).unwrap(), b"tree");
	}

	#[test]
	fn freed_slot_is_inaccessible() {
		let slab = PageSlab::new(4, 10);
		let idx = slab.allocate().unwrap();
		slab.free(idx);
		assert!(slab.read(idx).is_none());
	}

	#[test]
	fn freed_slot_is_reused() {
		let slab = PageSlab::new(4, 2);
		let a = slab.allocate().unwrap();
		let _b = slab.allocate().unwrap();
		assert!(slab.allocate().is_none());

		slab.free(a);
		assert!(slab.allocate().is_some());
	}
}
