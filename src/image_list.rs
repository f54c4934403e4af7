//! The process-wide list of loaded binary images.
//!
//! Loader callbacks mutate the list; the signal handler reads it while those
//! callbacks may be mid-flight on another thread. The discipline is
//! read-biased: `append` publishes a new head with a single release store,
//! `remove` only sets a tombstone flag, and a node's storage is reclaimed by
//! a later mutation once no reader references remain. Readers pin the list
//! by holding an [`ImageListReader`] guard, treat tombstoned nodes as
//! absent, and never block.
//!
//! Mutators are serialized by the loader's own lock; the internal mutex
//! keeps the structure sound even without it.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::macho::MachImage;

pub use crate::macho::MachImage as Image;

struct Node {
    image: MachImage,
    tombstone: AtomicBool,
    next: AtomicPtr<Node>,
}

pub struct ImageList {
    head: AtomicPtr<Node>,
    /// Number of live reader guards. A node is freed only after it has been
    /// unlinked *and* this count has been observed at zero.
    readers: AtomicUsize,
    /// Writer lock; the guarded Vec holds unlinked nodes whose free had to
    /// be deferred because readers were active.
    writer: Mutex<Vec<*mut Node>>,
}

unsafe impl Send for ImageList {}
unsafe impl Sync for ImageList {}

impl ImageList {
    pub fn new() -> Self {
        ImageList {
            head: AtomicPtr::new(ptr::null_mut()),
            readers: AtomicUsize::new(0),
            writer: Mutex::new(Vec::new()),
        }
    }

    /// Prepend a newly loaded image. Must not be called from a signal
    /// handler (it allocates).
    pub fn append(&self, image: MachImage) {
        tracing::debug!(base = image.base(), path = image.path(), "image loaded");
        let mut garbage = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let node = Box::into_raw(Box::new(Node {
            image,
            tombstone: AtomicBool::new(false),
            next: AtomicPtr::new(self.head.load(Ordering::Relaxed)),
        }));
        self.head.store(node, Ordering::SeqCst);
        self.collect(&mut garbage);
    }

    /// Tombstone the image whose header is at `base`. The node stays linked
    /// until it can be reclaimed without racing a reader.
    pub fn remove(&self, base: u64) {
        let mut garbage = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut cur = self.head.load(Ordering::SeqCst);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.image.base() == base && !node.tombstone.load(Ordering::Relaxed) {
                node.tombstone.store(true, Ordering::SeqCst);
                break;
            }
            cur = node.next.load(Ordering::SeqCst);
        }
        self.collect(&mut garbage);
    }

    /// Unlink tombstoned nodes and free whatever is provably unobserved.
    /// Caller holds the writer lock.
    fn collect(&self, garbage: &mut Vec<*mut Node>) {
        // Unlink pass. Unlinking is always safe: readers that already hold a
        // pointer into the list keep the reader count non-zero.
        let mut prev: Option<&Node> = None;
        let mut cur = self.head.load(Ordering::SeqCst);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            let next = node.next.load(Ordering::SeqCst);
            if node.tombstone.load(Ordering::SeqCst) {
                match prev {
                    Some(p) => p.next.store(next, Ordering::SeqCst),
                    None => self.head.store(next, Ordering::SeqCst),
                }
                garbage.push(cur);
            } else {
                prev = Some(node);
            }
            cur = next;
        }
        // Free pass: only once no reader can still hold a reference. A
        // reader increments the count before loading the head, so observing
        // zero here proves the unlinked nodes are unreachable.
        if self.readers.load(Ordering::SeqCst) == 0 {
            for &node in garbage.iter() {
                drop(unsafe { Box::from_raw(node) });
            }
            garbage.clear();
        }
    }

    /// Pin the current list for reading. Async-signal-safe.
    pub fn reader(&self) -> ImageListReader<'_> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        ImageListReader { list: self }
    }
}

impl Default for ImageList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ImageList {
    fn drop(&mut self) {
        let garbage = self.writer.get_mut().unwrap_or_else(|e| e.into_inner());
        for &node in garbage.iter() {
            drop(unsafe { Box::from_raw(node) });
        }
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

/// A reader reference that pins the list. While any guard is alive, no node
/// reachable through it is freed.
pub struct ImageListReader<'a> {
    list: &'a ImageList,
}

impl<'a> ImageListReader<'a> {
    /// Iterate the images visible in this snapshot, skipping tombstones.
    pub fn iter(&self) -> ImageIter<'_> {
        ImageIter {
            cur: self.list.head.load(Ordering::SeqCst),
            _reader: core::marker::PhantomData,
        }
    }

    /// Find the image containing `addr`, if any. At most one image contains
    /// any given address.
    pub fn find_by_address(&self, addr: u64) -> Option<&MachImage> {
        self.iter().find(|image| image.contains_address(addr))
    }
}

impl Drop for ImageListReader<'_> {
    fn drop(&mut self) {
        self.list.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ImageIter<'a> {
    cur: *mut Node,
    _reader: core::marker::PhantomData<&'a ImageListReader<'a>>,
}

impl<'a> Iterator for ImageIter<'a> {
    type Item = &'a MachImage;

    fn next(&mut self) -> Option<&'a MachImage> {
        while !self.cur.is_null() {
            // The guard's reader count keeps this node alive.
            let node = unsafe { &*self.cur };
            self.cur = node.next.load(Ordering::SeqCst);
            if !node.tombstone.load(Ordering::SeqCst) {
                return Some(&node.image);
            }
        }
        None
    }
}
