//! The long-lived translation context.

use std::sync::Mutex;

use granary_cache::{CodeCache, Index, MetaManager};
use granary_codegen::cfg::Trace;

/// A client's instrumentation entry point, invoked with each freshly
/// materialised trace before mangling.
pub type InstrumentFn = Box<dyn Fn(&mut Trace) + Send + Sync>;

/// Owns everything a translation request needs: the meta-data manager, the
/// code-cache index, the executable memory, and the attached client, if
/// any.
///
/// The translator itself runs on whichever thread took the cache miss; the
/// context only serialises the index and the meta-data layout, never the
/// pipeline.
pub struct Context {
    pub(crate) manager: Mutex<MetaManager>,
    pub(crate) index: Index,
    pub(crate) cache: CodeCache,
    pub(crate) instrument: Option<InstrumentFn>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A context with no client attached.
    pub fn new() -> Context {
        Context {
            manager: Mutex::new(MetaManager::new()),
            index: Index::new(),
            cache: CodeCache::new(),
            instrument: None,
        }
    }

    /// A context whose traces are offered to `instrument` before mangling.
    pub fn with_instrumentation(instrument: InstrumentFn) -> Context {
        Context {
            instrument: Some(instrument),
            ..Context::new()
        }
    }

    /// The code-cache index.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The executable-memory cache.
    pub fn code_cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Register an additional meta-data sub-record type before the first
    /// translation fixes the record layout.
    pub fn register_meta<T: granary_cache::MetaUnit>(&self) {
        self.manager.lock().unwrap().register::<T>();
    }

    /// Allocate meta-data keyed to translate `pc`, for requests built by
    /// hand (indirect entries, client-specialised returns).
    pub fn allocate_meta(&self, pc: granary_x64::AppPc) -> granary_cache::BlockMeta {
        self.manager.lock().unwrap().allocate_for(pc)
    }
}
