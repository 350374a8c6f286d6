//! Composable per-block meta-data.
//!
//! A block's meta-data is one packed allocation composed of sub-records.
//! Each sub-record type registers a *descriptor* (size, alignment and a
//! small vtable of callbacks) and is assigned a process-global integer id
//! under a lock. Once the manager is finalised the record layout is fixed:
//! each descriptor gets an offset, computed by aligning cumulatively, and
//! every allocated record packs all registered sub-records at those
//! offsets.
//!
//! Four sub-records are always present: [`AppMeta`] (native start PC, the
//! index key), [`CacheMeta`] (compiled start PC), [`StackMeta`] (stack
//! validity tag) and [`IndexMeta`] (the bucket chain link).

use core::any::TypeId;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use granary_x64::{AppPc, CachePc};

/// The verdict of matching one meta-data record against another.
///
/// Ordered best-first: `Accept` means an exact behavioural match, `Adapt`
/// means the cached entry can serve after the requester re-keys against it,
/// `Reject` means no reuse. Joining verdicts across sub-records takes the
/// worst.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnificationStatus {
    /// Exact match.
    Accept,
    /// Compatible; the caller may re-key against the returned entry.
    Adapt,
    /// No match.
    Reject,
}

/// A sub-record of block meta-data.
///
/// Implementations describe their own matching behaviour: `EQUALS` opts
/// into index matching, `UNIFIES` into the adapt/reject join. The default
/// is an inert record that neither matches nor unifies (it rides along).
pub trait MetaUnit: Default + 'static {
    /// Participate in `Equals` (index matching)?
    const EQUALS: bool = false;
    /// Participate in `CanUnify`?
    const UNIFIES: bool = false;

    /// Strict equality, consulted only when `EQUALS` is set.
    fn equals(&self, _other: &Self) -> bool {
        true
    }

    /// Unification verdict, consulted only when `UNIFIES` is set.
    fn can_unify(&self, _other: &Self) -> UnificationStatus {
        UnificationStatus::Accept
    }

    /// Fold this record into a hash of the whole block meta-data.
    fn hash_into(&self, _state: &mut dyn Hasher) {}

    /// Initialise a copy of `self` (a fresh record by default, so links
    /// into process structures are not duplicated).
    fn copy_from(&mut self, other: &Self) {
        let _ = other;
    }
}

struct Descriptor {
    id: usize,
    size: usize,
    align: usize,
    init: unsafe fn(*mut u8),
    drop: unsafe fn(*mut u8),
    equals: Option<unsafe fn(*const u8, *const u8) -> bool>,
    can_unify: Option<unsafe fn(*const u8, *const u8) -> UnificationStatus>,
    hash: unsafe fn(*const u8, &mut dyn Hasher),
    copy: unsafe fn(*mut u8, *const u8),
}

unsafe fn init_shim<T: MetaUnit>(at: *mut u8) {
    unsafe { at.cast::<T>().write(T::default()) }
}

unsafe fn drop_shim<T: MetaUnit>(at: *mut u8) {
    unsafe { at.cast::<T>().drop_in_place() }
}

unsafe fn equals_shim<T: MetaUnit>(a: *const u8, b: *const u8) -> bool {
    unsafe { (*a.cast::<T>()).equals(&*b.cast::<T>()) }
}

unsafe fn can_unify_shim<T: MetaUnit>(a: *const u8, b: *const u8) -> UnificationStatus {
    unsafe { (*a.cast::<T>()).can_unify(&*b.cast::<T>()) }
}

unsafe fn hash_shim<T: MetaUnit>(at: *const u8, state: &mut dyn Hasher) {
    unsafe { (*at.cast::<T>()).hash_into(state) }
}

unsafe fn copy_shim<T: MetaUnit>(to: *mut u8, from: *const u8) {
    unsafe {
        to.cast::<T>().write(T::default());
        (*to.cast::<T>()).copy_from(&*from.cast::<T>());
    }
}

// Descriptor ids are process-global: every manager that registers the same
// type sees the same id, assigned under one lock.
static GLOBAL_IDS: std::sync::OnceLock<Mutex<HashMap<TypeId, usize>>> =
    std::sync::OnceLock::new();

/// Upper bound on registered descriptors.
const MAX_NUM_DESCRIPTORS: usize = 32;

fn global_ids() -> &'static Mutex<HashMap<TypeId, usize>> {
    GLOBAL_IDS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn assign_description_id(ty: TypeId) -> usize {
    let mut ids = global_ids().lock().unwrap();
    if let Some(id) = ids.get(&ty) {
        return *id;
    }
    let id = ids.len();
    assert!(id < MAX_NUM_DESCRIPTORS, "too many meta-data descriptors");
    ids.insert(ty, id);
    id
}

fn lookup_description_id(ty: TypeId) -> usize {
    *global_ids()
        .lock()
        .unwrap()
        .get(&ty)
        .expect("sub-record type was never registered")
}

/// Fixed record layout shared by every record a manager allocates.
struct Layout {
    descriptors: Vec<Descriptor>,
    offsets: Vec<usize>,
    size: usize,
    align: usize,
}

/// Registers descriptors, fixes the record layout, and allocates records.
pub struct MetaManager {
    descriptors: Vec<Descriptor>,
    registered: HashMap<TypeId, usize>,
    layout: Option<Arc<Layout>>,
}

impl Default for MetaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaManager {
    /// A manager with the always-present sub-records registered.
    pub fn new() -> MetaManager {
        let mut manager = MetaManager {
            descriptors: Vec::new(),
            registered: HashMap::new(),
            layout: None,
        };
        manager.register::<AppMeta>();
        manager.register::<CacheMeta>();
        manager.register::<StackMeta>();
        manager.register::<IndexMeta>();
        manager
    }

    /// Register `T` as a sub-record. A no-op if `T` is already registered
    /// or if the layout has been finalised.
    pub fn register<T: MetaUnit>(&mut self) {
        if self.layout.is_some() {
            return;
        }
        let ty = TypeId::of::<T>();
        if self.registered.contains_key(&ty) {
            return;
        }
        let id = assign_description_id(ty);
        self.registered.insert(ty, self.descriptors.len());
        self.descriptors.push(Descriptor {
            id,
            size: core::mem::size_of::<T>(),
            align: core::mem::align_of::<T>(),
            init: init_shim::<T>,
            drop: drop_shim::<T>,
            equals: T::EQUALS.then_some(equals_shim::<T> as unsafe fn(_, _) -> _),
            can_unify: T::UNIFIES.then_some(can_unify_shim::<T> as unsafe fn(_, _) -> _),
            hash: hash_shim::<T>,
            copy: copy_shim::<T>,
        });
    }

    /// Fix the record layout: per-descriptor offsets by cumulative
    /// alignment, then the total record size.
    fn finalize(&mut self) -> Arc<Layout> {
        if let Some(layout) = &self.layout {
            return Arc::clone(layout);
        }
        let mut descriptors = std::mem::take(&mut self.descriptors);
        descriptors.sort_by_key(|d| d.id);

        let mut offsets = Vec::with_capacity(descriptors.len());
        let mut size = 0usize;
        let mut align = 1usize;
        for desc in &descriptors {
            size = size.next_multiple_of(desc.align);
            offsets.push(size);
            size += desc.size;
            align = align.max(desc.align);
        }
        size = size.next_multiple_of(align);

        let layout = Arc::new(Layout {
            descriptors,
            offsets,
            size: size.max(1),
            align,
        });
        self.layout = Some(Arc::clone(&layout));
        log::debug!(
            "meta-data layout finalised: {} descriptors, {} bytes",
            layout.descriptors.len(),
            layout.size
        );
        layout
    }

    /// Allocate a record with every sub-record initialised. The first
    /// allocation finalises the layout.
    pub fn allocate(&mut self) -> BlockMeta {
        let layout = self.finalize();
        BlockMeta::new(layout)
    }

    /// Allocate a record keyed to translate `pc`.
    pub fn allocate_for(&mut self, pc: AppPc) -> BlockMeta {
        let mut meta = self.allocate();
        meta.get_mut::<AppMeta>().start_pc = pc;
        meta
    }
}

/// One packed block meta-data record.
pub struct BlockMeta {
    data: core::ptr::NonNull<u8>,
    layout: Arc<Layout>,
}

// The record is plain bytes plus vtable pointers; the only interior
// mutability is the atomic index link.
unsafe impl Send for BlockMeta {}
unsafe impl Sync for BlockMeta {}

impl BlockMeta {
    fn alloc_layout(layout: &Layout) -> core::alloc::Layout {
        core::alloc::Layout::from_size_align(layout.size, layout.align)
            .expect("invalid meta-data record layout")
    }

    fn new(layout: Arc<Layout>) -> BlockMeta {
        // The record packs sub-records with their own alignments, so it
        // cannot live in a plain byte box.
        let data = unsafe { std::alloc::alloc_zeroed(Self::alloc_layout(&layout)) };
        let data = core::ptr::NonNull::new(data).expect("meta-data allocation failed");
        for (desc, offset) in layout.descriptors.iter().zip(&layout.offsets) {
            unsafe { (desc.init)(data.as_ptr().add(*offset)) };
        }
        BlockMeta { data, layout }
    }

    fn slot_of<T: MetaUnit>(&self) -> usize {
        let id = lookup_description_id(TypeId::of::<T>());
        self.layout
            .descriptors
            .iter()
            .position(|d| d.id == id)
            .expect("sub-record not part of this record's layout")
    }

    /// Shared access to the `T` sub-record.
    pub fn get<T: MetaUnit>(&self) -> &T {
        let offset = self.layout.offsets[self.slot_of::<T>()];
        unsafe { &*self.data.as_ptr().add(offset).cast::<T>() }
    }

    /// Mutable access to the `T` sub-record. Only valid before the record
    /// is shared through the index.
    pub fn get_mut<T: MetaUnit>(&mut self) -> &mut T {
        let offset = self.layout.offsets[self.slot_of::<T>()];
        unsafe { &mut *self.data.as_ptr().add(offset).cast::<T>() }
    }

    /// The application PC this record keys on.
    pub fn app_pc(&self) -> AppPc {
        self.get::<AppMeta>().start_pc
    }

    /// Compare all indexable sub-records; short-circuits on the first
    /// mismatch.
    pub fn equals(&self, other: &BlockMeta) -> bool {
        debug_assert!(Arc::ptr_eq(&self.layout, &other.layout));
        for (desc, offset) in self.layout.descriptors.iter().zip(&self.layout.offsets) {
            if let Some(equals) = desc.equals {
                let a = unsafe { self.data.as_ptr().add(*offset) };
                let b = unsafe { other.data.as_ptr().add(*offset) };
                if !unsafe { equals(a, b) } {
                    return false;
                }
            }
        }
        true
    }

    /// Join the unification verdicts of all unifiable sub-records;
    /// short-circuits on `Reject`.
    pub fn can_unify_with(&self, other: &BlockMeta) -> UnificationStatus {
        debug_assert!(Arc::ptr_eq(&self.layout, &other.layout));
        let mut verdict = UnificationStatus::Accept;
        for (desc, offset) in self.layout.descriptors.iter().zip(&self.layout.offsets) {
            if let Some(can_unify) = desc.can_unify {
                let a = unsafe { self.data.as_ptr().add(*offset) };
                let b = unsafe { other.data.as_ptr().add(*offset) };
                verdict = verdict.max(unsafe { can_unify(a, b) });
                if verdict == UnificationStatus::Reject {
                    return verdict;
                }
            }
        }
        verdict
    }

    /// Hash every sub-record that registered a hasher.
    pub fn hash_into(&self, state: &mut dyn Hasher) {
        for (desc, offset) in self.layout.descriptors.iter().zip(&self.layout.offsets) {
            let at = unsafe { self.data.as_ptr().add(*offset) };
            unsafe { (desc.hash)(at, state) };
        }
    }

    /// A copy of this record, with each sub-record's copy-initialiser
    /// applied (the index link, in particular, comes back unchained).
    pub fn copy(&self) -> BlockMeta {
        let data = unsafe { std::alloc::alloc_zeroed(Self::alloc_layout(&self.layout)) };
        let data = core::ptr::NonNull::new(data).expect("meta-data allocation failed");
        for (desc, offset) in self.layout.descriptors.iter().zip(&self.layout.offsets) {
            unsafe {
                (desc.copy)(data.as_ptr().add(*offset), self.data.as_ptr().add(*offset))
            };
        }
        BlockMeta {
            data,
            layout: Arc::clone(&self.layout),
        }
    }
}

impl Drop for BlockMeta {
    fn drop(&mut self) {
        for (desc, offset) in self.layout.descriptors.iter().zip(&self.layout.offsets) {
            unsafe { (desc.drop)(self.data.as_ptr().add(*offset)) };
        }
        unsafe { std::alloc::dealloc(self.data.as_ptr(), Self::alloc_layout(&self.layout)) };
    }
}

impl core::fmt::Debug for BlockMeta {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BlockMeta")
            .field("app_pc", &format_args!("{:#x}", self.app_pc()))
            .field("cache_pc", &format_args!("{:#x}", self.get::<CacheMeta>().start_pc))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// The always-present sub-records.

/// Native start PC; the index key.
#[derive(Default)]
pub struct AppMeta {
    /// Where the block begins in the application.
    pub start_pc: AppPc,
}

impl MetaUnit for AppMeta {
    const EQUALS: bool = true;

    fn equals(&self, other: &Self) -> bool {
        self.start_pc == other.start_pc
    }

    fn hash_into(&self, state: &mut dyn Hasher) {
        let mut h = HasherBridge(state);
        self.start_pc.hash(&mut h);
    }

    fn copy_from(&mut self, other: &Self) {
        self.start_pc = other.start_pc;
    }
}

/// Compiled start PC, filled in at commit time.
#[derive(Default)]
pub struct CacheMeta {
    /// Where the translation begins in the code cache; zero before commit.
    pub start_pc: CachePc,
}

impl MetaUnit for CacheMeta {}

/// Whether the block is known to run on a valid application stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StackValidity {
    /// The stack pointer references a real stack.
    Valid,
    /// Nothing is known.
    #[default]
    Unknown,
}

/// Stack validity tag.
#[derive(Default)]
pub struct StackMeta {
    /// The tag.
    pub validity: StackValidity,
}

impl MetaUnit for StackMeta {
    const UNIFIES: bool = true;

    fn can_unify(&self, other: &Self) -> UnificationStatus {
        if self.validity == other.validity {
            UnificationStatus::Accept
        } else {
            // A translation made under weaker assumptions still runs
            // correctly; the requester re-keys against it.
            UnificationStatus::Adapt
        }
    }

    fn copy_from(&mut self, other: &Self) {
        self.validity = other.validity;
    }
}

/// The index bucket link.
///
/// Tagged: zero means unchained, [`IndexMeta::LIST_END`] terminates a
/// bucket, anything else is the next record in the bucket. The load/store
/// pairing is acquire/release so a record observed through the chain is
/// fully committed.
#[derive(Default)]
pub struct IndexMeta {
    pub(crate) next: AtomicUsize,
}

impl IndexMeta {
    /// Distinguished non-null end-of-bucket sentinel.
    pub(crate) const LIST_END: usize = 1;

    /// Is this record chained into the index?
    pub fn is_chained(&self) -> bool {
        self.next.load(Ordering::Acquire) != 0
    }

    pub(crate) fn next_ptr(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: usize) {
        self.next.store(next, Ordering::Release);
    }
}

impl MetaUnit for IndexMeta {}

/// Adapter from `&mut dyn Hasher` to the `Hash` machinery.
struct HasherBridge<'a>(&'a mut dyn Hasher);

impl Hasher for HasherBridge<'_> {
    fn finish(&self) -> u64 {
        self.0.finish()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::DefaultHasher;

    #[derive(Default)]
    struct TraceHint {
        hot: bool,
    }

    impl MetaUnit for TraceHint {
        const EQUALS: bool = true;

        fn equals(&self, other: &Self) -> bool {
            self.hot == other.hot
        }

        fn copy_from(&mut self, other: &Self) {
            self.hot = other.hot;
        }
    }

    #[test]
    fn records_pack_registered_units() {
        let mut manager = MetaManager::new();
        manager.register::<TraceHint>();
        let mut meta = manager.allocate_for(0x1234);
        assert_eq!(meta.app_pc(), 0x1234);
        meta.get_mut::<TraceHint>().hot = true;
        assert!(meta.get::<TraceHint>().hot);
        assert!(!meta.get::<IndexMeta>().is_chained());
    }

    #[test]
    fn equals_consults_every_indexable_unit() {
        let mut manager = MetaManager::new();
        manager.register::<TraceHint>();
        let mut a = manager.allocate_for(0x1000);
        let b = manager.allocate_for(0x1000);
        assert!(a.equals(&b));
        a.get_mut::<TraceHint>().hot = true;
        assert!(!a.equals(&b));
        let c = manager.allocate_for(0x2000);
        assert!(!b.equals(&c));
    }

    #[test]
    fn unification_joins_worst_verdict() {
        let mut manager = MetaManager::new();
        let mut a = manager.allocate_for(0x1000);
        let b = manager.allocate_for(0x1000);
        assert_eq!(a.can_unify_with(&b), UnificationStatus::Accept);
        a.get_mut::<StackMeta>().validity = StackValidity::Valid;
        assert_eq!(a.can_unify_with(&b), UnificationStatus::Adapt);
    }

    #[test]
    fn copies_come_back_unchained() {
        let mut manager = MetaManager::new();
        let meta = manager.allocate_for(0x1000);
        meta.get::<IndexMeta>().set_next(IndexMeta::LIST_END);
        assert!(meta.get::<IndexMeta>().is_chained());
        let copy = meta.copy();
        assert!(!copy.get::<IndexMeta>().is_chained());
        assert_eq!(copy.app_pc(), 0x1000);
    }

    #[test]
    fn hash_covers_the_app_pc() {
        let mut manager = MetaManager::new();
        let a = manager.allocate_for(0x1000);
        let b = manager.allocate_for(0x2000);
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash_into(&mut ha);
        b.hash_into(&mut hb);
        assert_ne!(ha.finish(), hb.finish());
    }
}
