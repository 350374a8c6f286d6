//! The code-cache index: a two-level radix hash from application start PCs
//! to block meta-data.
//!
//! The low three bits of the PC are ignored; the next nine select a bucket
//! within a lazily allocated second-level array, and the nine above those
//! select the first-level entry. Buckets chain records through their
//! [`IndexMeta`] sub-record; the distinguished non-null sentinel terminates
//! each chain, so "chained" is observable from the record itself and a
//! record already in the index answers its own request.
//!
//! One readers-writer lock protects the index: lookups take it for read,
//! insertion and removal for write. A cache entry becomes observable only
//! after its bytes are committed and the record is inserted, so the write
//! lock's release pairs with the read lock's acquire to order commit before
//! first execution.

use std::sync::RwLock;

use granary_x64::AppPc;

use crate::meta::{BlockMeta, IndexMeta, UnificationStatus};

const NUM_POINTERS_PER_PAGE: usize = 512;
const NUM_IGNORED_BITS: u32 = 3;
const NUM_BITS_PER_ARRAY: u32 = NUM_POINTERS_PER_PAGE.trailing_zeros();

#[derive(Clone, Copy, PartialEq, Eq)]
struct RadixIndex {
    first: usize,
    second: usize,
}

fn addr_to_index(addr: AppPc) -> RadixIndex {
    RadixIndex {
        first: ((addr >> (NUM_IGNORED_BITS + NUM_BITS_PER_ARRAY)) as usize)
            % NUM_POINTERS_PER_PAGE,
        second: ((addr >> NUM_IGNORED_BITS) as usize) % NUM_POINTERS_PER_PAGE,
    }
}

fn next_index(index: RadixIndex) -> RadixIndex {
    if index.second + 1 == NUM_POINTERS_PER_PAGE {
        RadixIndex {
            first: (index.first + 1) % NUM_POINTERS_PER_PAGE,
            second: 0,
        }
    } else {
        RadixIndex {
            first: index.first,
            second: index.second + 1,
        }
    }
}

/// A lazily allocated second-level page of bucket heads.
///
/// Heads are tagged like the chain links: zero is an empty bucket, the
/// sentinel an empty-but-touched one, anything else the first record.
struct MetaArray {
    heads: [usize; NUM_POINTERS_PER_PAGE],
}

impl MetaArray {
    fn new() -> Box<MetaArray> {
        Box::new(MetaArray {
            heads: [0; NUM_POINTERS_PER_PAGE],
        })
    }
}

/// The result of a lookup.
#[derive(Debug)]
pub struct IndexFindResponse {
    /// The match verdict: accept, adapt or reject.
    pub status: UnificationStatus,
    /// The matched record; `None` on reject.
    ///
    /// The pointer stays valid until a [`Index::remove_range`] covering the
    /// record's PC *and* the caller-provided quiescence step that must
    /// follow it.
    pub meta: Option<*const BlockMeta>,
}

/// The index. Owns every record inserted into it.
pub struct Index {
    arrays: RwLock<Vec<Option<Box<MetaArray>>>>,
}

// Raw record pointers are only reachable through the lock discipline
// described on the methods.
unsafe impl Send for Index {}
unsafe impl Sync for Index {}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Index {
    /// An empty index.
    pub fn new() -> Index {
        let mut arrays = Vec::with_capacity(NUM_POINTERS_PER_PAGE);
        arrays.resize_with(NUM_POINTERS_PER_PAGE, || None);
        Index {
            arrays: RwLock::new(arrays),
        }
    }

    /// Look `meta` up. `Accept` returns an exact match, `Adapt` a
    /// compatible record the caller may re-key against, `Reject` nothing —
    /// the caller proceeds to materialise a fresh translation.
    pub fn request(&self, meta: &BlockMeta) -> IndexFindResponse {
        // Fast path: a record already chained into the index answers
        // itself.
        if meta.get::<IndexMeta>().is_chained() {
            return IndexFindResponse {
                status: UnificationStatus::Accept,
                meta: Some(meta as *const BlockMeta),
            };
        }

        let index = addr_to_index(meta.app_pc());
        let arrays = self.arrays.read().unwrap();
        let Some(array) = arrays[index.first].as_deref() else {
            return IndexFindResponse {
                status: UnificationStatus::Reject,
                meta: None,
            };
        };
        let head = array.heads[index.second];
        if head == 0 {
            return IndexFindResponse {
                status: UnificationStatus::Reject,
                meta: None,
            };
        }
        match_meta_data(head, meta)
    }

    /// Chain `meta` into the head of its bucket, taking ownership.
    ///
    /// Chaining is owned by the index: a record the caller still holds is
    /// by construction unchained (removal unchains before returning
    /// ownership), which is what makes insertion idempotent with respect
    /// to its pre-condition.
    ///
    /// Callers must have committed the record's cache bytes first; the
    /// writer-lock release here is what publishes them to executing
    /// threads.
    pub fn insert(&self, meta: BlockMeta) -> *const BlockMeta {
        assert!(
            !meta.get::<IndexMeta>().is_chained(),
            "caller-held records are never chained"
        );
        debug_assert!(meta.app_pc() != 0, "indexing a record with no app PC");

        let index = addr_to_index(meta.app_pc());
        let ptr = Box::into_raw(Box::new(meta));

        let mut arrays = self.arrays.write().unwrap();
        let array = arrays[index.first].get_or_insert_with(MetaArray::new);
        let head = &mut array.heads[index.second];
        let old = if *head == 0 { IndexMeta::LIST_END } else { *head };
        unsafe {
            (*ptr).get::<IndexMeta>().set_next(old);
        }
        *head = ptr as usize;
        log::trace!("indexed block at {:#x}", unsafe { (*ptr).app_pc() });
        ptr
    }

    /// Unlink every record whose key falls in `[begin, end)` and return
    /// them, so the caller can free the associated cache bytes after a
    /// quiescence step.
    ///
    /// A block that begins before `begin` and extends into the range is
    /// not removed; callers working from unmapping notifications already
    /// operate at page granularity.
    pub fn remove_range(&self, begin: AppPc, end: AppPc) -> Vec<BlockMeta> {
        assert!(begin <= end);
        let mut removed = Vec::new();
        if begin == end {
            return removed;
        }

        let mut arrays = self.arrays.write().unwrap();
        let end_index = addr_to_index(end);
        let mut index = addr_to_index(begin);
        loop {
            if let Some(array) = arrays[index.first].as_deref_mut() {
                let head = &mut array.heads[index.second];
                if *head != 0 {
                    unlink_meta_data(head, begin, end, &mut removed);
                }
            }
            if index == end_index {
                break;
            }
            index = next_index(index);
        }
        if !removed.is_empty() {
            log::debug!(
                "unlinked {} block(s) in [{begin:#x}, {end:#x})",
                removed.len()
            );
        }
        removed
    }
}

/// Walk a bucket chain matching `search`, preferring an exact accept and
/// falling back to the first adaptable record.
fn match_meta_data(head: usize, search: &BlockMeta) -> IndexFindResponse {
    let mut response = IndexFindResponse {
        status: UnificationStatus::Reject,
        meta: None,
    };
    let mut cursor = head;
    while cursor != IndexMeta::LIST_END {
        let meta = unsafe { &*(cursor as *const BlockMeta) };
        if search.equals(meta) {
            match search.can_unify_with(meta) {
                UnificationStatus::Accept => {
                    return IndexFindResponse {
                        status: UnificationStatus::Accept,
                        meta: Some(meta as *const BlockMeta),
                    };
                }
                UnificationStatus::Adapt => {
                    if response.status != UnificationStatus::Adapt {
                        response.status = UnificationStatus::Adapt;
                        response.meta = Some(meta as *const BlockMeta);
                    }
                }
                UnificationStatus::Reject => {}
            }
        }
        cursor = meta.get::<IndexMeta>().next_ptr();
    }
    response
}

/// Unlink chain entries keyed inside `[begin, end)` into `removed`, then
/// relink the survivors in their original order.
fn unlink_meta_data(head: &mut usize, begin: AppPc, end: AppPc, removed: &mut Vec<BlockMeta>) {
    let mut survivors: Vec<*mut BlockMeta> = Vec::new();
    let mut cursor = *head;
    while cursor != 0 && cursor != IndexMeta::LIST_END {
        let ptr = cursor as *mut BlockMeta;
        let (pc, next) = unsafe { ((*ptr).app_pc(), (*ptr).get::<IndexMeta>().next_ptr()) };
        if begin <= pc && pc < end {
            let meta = unsafe { Box::from_raw(ptr) };
            meta.get::<IndexMeta>().set_next(0);
            removed.push(*meta);
        } else {
            survivors.push(ptr);
        }
        cursor = next;
    }

    let mut tail = IndexMeta::LIST_END;
    for ptr in survivors.iter().rev() {
        unsafe { (**ptr).get::<IndexMeta>().set_next(tail) };
        tail = *ptr as usize;
    }
    *head = tail;
}

impl Drop for Index {
    fn drop(&mut self) {
        let mut arrays = self.arrays.write().unwrap();
        for array in arrays.iter_mut().flatten() {
            for head in &mut array.heads {
                let mut cursor = *head;
                while cursor != 0 && cursor != IndexMeta::LIST_END {
                    let meta = unsafe { Box::from_raw(cursor as *mut BlockMeta) };
                    cursor = meta.get::<IndexMeta>().next_ptr();
                    meta.get::<IndexMeta>().set_next(0);
                }
                *head = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{CacheMeta, MetaManager, StackMeta, StackValidity};

    fn manager() -> MetaManager {
        MetaManager::new()
    }

    #[test]
    fn insert_then_request_accepts() {
        let index = Index::new();
        let mut mgr = manager();

        let probe = mgr.allocate_for(0x1000);
        assert_eq!(index.request(&probe).status, UnificationStatus::Reject);

        let mut meta = mgr.allocate_for(0x1000);
        meta.get_mut::<CacheMeta>().start_pc = 0x70_0000;
        index.insert(meta);

        let found = index.request(&probe);
        assert_eq!(found.status, UnificationStatus::Accept);
        let found = unsafe { &*found.meta.unwrap() };
        assert_eq!(found.get::<CacheMeta>().start_pc, 0x70_0000);
    }

    #[test]
    fn chained_record_answers_itself() {
        let index = Index::new();
        let mut mgr = manager();
        let meta = mgr.allocate_for(0x2000);
        let ptr = index.insert(meta);
        let inserted = unsafe { &*ptr };
        let again = index.request(inserted);
        assert_eq!(again.status, UnificationStatus::Accept);
        assert_eq!(again.meta.unwrap(), ptr);
    }

    #[test]
    fn mismatched_stack_hint_adapts() {
        let index = Index::new();
        let mut mgr = manager();
        let mut cached = mgr.allocate_for(0x3000);
        cached.get_mut::<StackMeta>().validity = StackValidity::Valid;
        index.insert(cached);

        let probe = mgr.allocate_for(0x3000);
        let found = index.request(&probe);
        assert_eq!(found.status, UnificationStatus::Adapt);
        assert!(found.meta.is_some());
    }

    #[test]
    fn remove_range_unlinks_and_rejects() {
        let index = Index::new();
        let mut mgr = manager();
        let mut meta = mgr.allocate_for(0x1000);
        meta.get_mut::<CacheMeta>().start_pc = 0x70_0000;
        index.insert(meta);

        let removed = index.remove_range(0x0FF0, 0x1010);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].app_pc(), 0x1000);

        let probe = mgr.allocate_for(0x1000);
        assert_eq!(index.request(&probe).status, UnificationStatus::Reject);
    }

    #[test]
    fn remove_range_leaves_outside_keys() {
        let index = Index::new();
        let mut mgr = manager();
        index.insert(mgr.allocate_for(0x1000));
        index.insert(mgr.allocate_for(0x5000));

        let removed = index.remove_range(0x0F00, 0x2000);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].app_pc(), 0x1000);

        let probe = mgr.allocate_for(0x5000);
        assert_eq!(index.request(&probe).status, UnificationStatus::Accept);
    }

    #[test]
    fn colliding_buckets_chain() {
        // Two PCs that share first and second level indices (differ only in
        // bits above the radix).
        let index = Index::new();
        let mut mgr = manager();
        let stride = 1u64 << (NUM_IGNORED_BITS + 2 * NUM_BITS_PER_ARRAY);
        index.insert(mgr.allocate_for(0x1000));
        index.insert(mgr.allocate_for(0x1000 + stride));

        for pc in [0x1000, 0x1000 + stride] {
            let probe = mgr.allocate_for(pc);
            assert_eq!(
                index.request(&probe).status,
                UnificationStatus::Accept,
                "pc {pc:#x}"
            );
        }
    }
}
