//! The module registry: an addressable table of loaded module instances.
//! Instances are addressed by type code and by dotted path; the type-code
//! lookup goes through a lock-free cache so the hot path never takes the
//! table lock after the first hit.

use crate::module::{Module, ModuleFlags, ModuleType, MODULE_TYPE_CORE};
use crate::pool::{Page, Pool};
use crate::support::{PipeError, PipeResult};
use bedrock::logging;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, RwLock};

const CACHE_SLOTS: usize = MODULE_TYPE_CORE as usize;

/// A loaded module instance together with its registry bookkeeping.
pub struct ModuleInstance {
    pub type_code: ModuleType,
    pub path: String,
    pub module: Box<dyn Module>,
    pub log: logging::Logger,
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("type_code", &self.type_code)
            .field("path", &self.path)
            .finish()
    }
}

/// The registry. Installation happens during startup; lookups are safe to
/// call concurrently from any thread afterwards.
pub struct ModuleTab {
    instances: RwLock<Vec<Arc<ModuleInstance>>>,
    paths: RwLock<HashMap<String, ModuleType>>,
    // Cache entries hold a raw strong reference published with CAS so that
    // concurrent first-lookups converge on a single entry without taking a
    // lock. Entries are never unpublished while the tab is alive.
    cache: Box<[AtomicPtr<ModuleInstance>]>,
    pages: Arc<Pool<Page>>,
    log: logging::Logger,
}

impl ModuleTab {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(page_capacity: usize, log: L) -> ModuleTab {
        let tab_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let mut cache = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            cache.push(AtomicPtr::new(std::ptr::null_mut()));
        }

        ModuleTab {
            instances: RwLock::new(Vec::new()),
            paths: RwLock::new(HashMap::new()),
            cache: cache.into_boxed_slice(),
            pages: Arc::new(Pool::new(page_capacity)),
            log: tab_log,
        }
    }

    /// Constructs a module instance: runs the module's init with the given
    /// instantiation arguments, assigns a type code and indexes the
    /// instance path. Errors here are fatal to startup.
    pub fn install(&self, mut module: Box<dyn Module>, argv: &[String]) -> PipeResult<ModuleType> {
        let mut instances = self.instances.write().expect("Module table poisoned");

        if instances.len() >= CACHE_SLOTS {
            return Err(PipeError::Exhausted);
        }

        // A rejected install must never run init: its side effects (bound
        // sockets, spawned loops) belong to an instance that would not be
        // published for cleanup.
        {
            let paths = self.paths.read().expect("Module path index poisoned");
            if paths.contains_key(&module.get_path()) {
                return Err(PipeError::InvalidArgument);
            }
        }

        let type_code = instances.len() as ModuleType;
        let instance_log = self.log.new(logging::o!());

        module.init(argv, &instance_log)?;

        // The instance discriminator may only settle during init, so the
        // final path gets a second look; a collision at this point has to
        // unwind the init before refusing.
        let path = module.get_path();

        let mut paths = self.paths.write().expect("Module path index poisoned");
        if paths.contains_key(&path) {
            drop(paths);

            if module.cleanup().is_err() {
                logging::warn!(self.log, "rejected module cleanup failed";
                               "context" => "install",
                               "path" => %path);
            }
            return Err(PipeError::InvalidArgument);
        }
        paths.insert(path.clone(), type_code);

        logging::info!(self.log, "module instance installed";
                       "context" => "install",
                       "path" => %path,
                       "type_code" => type_code);

        instances.push(Arc::new(ModuleInstance {
            type_code,
            path,
            module,
            log: instance_log,
        }));

        Ok(type_code)
    }

    /// Looks up an instance by type code. The first call per code takes the
    /// table lock and publishes a cache entry; subsequent calls are O(1)
    /// and lock-free. This is the only registry operation that reports
    /// "no such module".
    pub fn lookup(&self, ty: ModuleType) -> PipeResult<Arc<ModuleInstance>> {
        if ty as usize >= CACHE_SLOTS {
            return Err(PipeError::InvalidArgument);
        }

        let slot = &self.cache[ty as usize];
        let cached = slot.load(Ordering::Acquire);

        if !cached.is_null() {
            unsafe {
                Arc::increment_strong_count(cached);
                return Ok(Arc::from_raw(cached));
            }
        }

        let instance = {
            let instances = self.instances.read().expect("Module table poisoned");

            match instances.get(ty as usize) {
                Some(instance) => instance.clone(),
                None => return Err(PipeError::InvalidArgument),
            }
        };

        let raw = Arc::into_raw(instance.clone()) as *mut ModuleInstance;

        // Racing first-lookups converge on whichever entry won the swap;
        // the loser releases its duplicate reference.
        if slot
            .compare_exchange(std::ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            unsafe {
                drop(Arc::from_raw(raw));
            }
        }

        Ok(instance)
    }

    /// Resolves an instance path to its type code.
    pub fn lookup_path(&self, path: &str) -> PipeResult<ModuleType> {
        self.paths
            .read()
            .expect("Module path index poisoned")
            .get(path)
            .copied()
            .ok_or(PipeError::InvalidArgument)
    }

    /// The capability bits of an instance.
    pub fn get_flags(&self, ty: ModuleType) -> PipeResult<ModuleFlags> {
        Ok(self.lookup(ty)?.module.get_flags())
    }

    /// Enumerates the instances whose flags report the event-loop
    /// capability. The dispatcher polls exactly these.
    pub fn event_capable(&self) -> Vec<ModuleType> {
        let instances = self.instances.read().expect("Module table poisoned");

        instances
            .iter()
            .filter(|instance| instance.module.get_flags().contains(ModuleFlags::EVENT_LOOP))
            .map(|instance| instance.type_code)
            .collect()
    }

    /// The shared staging-page pool handed to modules and the egress loop.
    #[inline]
    pub fn page_pool(&self) -> Arc<Pool<Page>> {
        self.pages.clone()
    }

    /// Shuts every instance down. Cleanup failures are logged, not
    /// propagated; there is nothing the caller could do at this point.
    pub fn finalize(&self) {
        let instances = self.instances.read().expect("Module table poisoned");

        for instance in instances.iter() {
            if instance.module.cleanup().is_err() {
                logging::warn!(self.log, "module cleanup failed";
                               "context" => "finalize",
                               "path" => %instance.path);
            }
        }
    }
}

impl Drop for ModuleTab {
    fn drop(&mut self) {
        for slot in self.cache.iter() {
            let cached = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);

            if !cached.is_null() {
                unsafe {
                    drop(Arc::from_raw(cached));
                }
            }
        }
    }
}
