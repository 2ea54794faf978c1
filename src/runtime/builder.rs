//! The top-level driver.
//!
//! [`Builder`] assembles a runtime configuration, boots the domain pool,
//! runs the root task on domain 0 and tears everything down once the root
//! settles. Worker domains are OS threads, joined before `run` returns.

use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::Waker;

use tracing::debug;

use crate::ctx::{shell, Ctx};
use crate::error::{fatal_of_panic, Fatal};
use crate::events::{DefaultEvents, Events};
use crate::record::promise::{make_cancel_slot, PromiseCore, PromiseInner};
use crate::record::task::{StoredFuture, TaskRecord};
use crate::resource::Ledger;
use crate::runtime::config::Config;
use crate::runtime::domain::{Domain, PollWrapper};
use crate::runtime::pool::Pool;
use crate::runtime::shared::{DomainShared, TaskWaker};
use crate::types::{DomainUid, Outcome};

type Factory = Arc<dyn Fn(DomainUid) -> Box<dyn Events> + Send + Sync>;

/// Configures and starts a scheduler run.
pub struct Builder {
    config: Config,
    factory: Option<Factory>,
    hook: Option<PollWrapper>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Starts from the environment-resolved configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Config::from_env(),
            factory: None,
            hook: None,
        }
    }

    /// Sets the scheduling slices granted per task activation.
    #[must_use]
    pub fn quanta(mut self, quanta: u32) -> Self {
        self.config.quanta = quanta.max(1);
        self
    }

    /// Sets the number of worker domains (domain 0 not included).
    #[must_use]
    pub fn domains(mut self, domains: usize) -> Self {
        self.config.domains = domains;
        self
    }

    /// Seeds the deterministic dispatch choices.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Installs the per-domain events-provider factory. The factory is
    /// invoked once per domain, on that domain's thread.
    #[must_use]
    pub fn events<E, F>(mut self, factory: F) -> Self
    where
        E: Events,
        F: Fn(DomainUid) -> E + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(move |uid| Box::new(factory(uid)) as Box<dyn Events>));
        self
    }

    /// Installs a wrapper invoked around every task poll.
    #[must_use]
    pub fn poll_wrapper(mut self, hook: PollWrapper) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Runs `f` as the root task and returns its result.
    ///
    /// A failure of the root task is resumed in the caller; a structural
    /// violation anywhere in the run is returned as `Err`.
    pub fn run<T, F, Fut>(self, f: F) -> Result<T, Fatal>
    where
        T: 'static,
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let Self {
            config,
            factory,
            hook,
        } = self;
        let factory: Factory = factory
            .unwrap_or_else(|| Arc::new(|uid| Box::new(DefaultEvents::new(uid)) as Box<dyn Events>));
        debug!(
            quanta = config.quanta,
            domains = config.domains,
            seed = config.seed,
            "starting scheduler"
        );
        let domains: Vec<Arc<DomainShared>> = (0..=config.domains)
            .map(|index| DomainShared::new(DomainUid::new(index as u32)))
            .collect();
        let pool = Pool::new(domains.clone(), config.seed);

        let mut handles = Vec::with_capacity(config.domains);
        for shared in domains.iter().skip(1) {
            let shared = Arc::clone(shared);
            let pool = Arc::clone(&pool);
            let factory = Arc::clone(&factory);
            let hook = hook.clone();
            let quanta = config.quanta;
            let name = format!("vigil-{}", shared.uid);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_main(shared, pool, quanta, factory, hook))
                .expect("failed to spawn domain thread");
            handles.push(handle);
        }

        let domain0 = Domain::new(
            Arc::clone(&domains[0]),
            Arc::clone(&pool),
            config.quanta,
            factory(DomainUid::MAIN),
            hook,
        );
        let root_uid = domains[0].alloc_task_uid();
        let root_core = PromiseCore::root(root_uid, DomainUid::MAIN, Arc::clone(&domains[0]));
        let root_inner = Arc::new(PromiseInner::new(Arc::clone(&root_core)));
        let root_ctx = Ctx::new(
            Rc::clone(domain0.inner()),
            root_uid,
            Arc::clone(&root_core),
        );
        let stored: StoredFuture = Box::pin(shell(root_ctx, Arc::clone(&root_inner), f));
        let waker = Waker::from(Arc::new(TaskWaker {
            uid: root_uid,
            shared: Arc::clone(&domains[0]),
        }));
        let record = TaskRecord::new(
            Arc::clone(&root_core),
            stored,
            waker,
            Ledger::new(),
            make_cancel_slot(&root_inner),
        );
        domain0.inner().tasks.borrow_mut().insert(root_uid, record);
        domain0.inner().ready.borrow_mut().push_back(root_uid);
        domain0.inner().spawned.set(1);

        let driver = catch_unwind(AssertUnwindSafe(|| domain0.run_root(&root_core)));
        pool.begin_shutdown();
        for handle in handles {
            if let Err(payload) = handle.join() {
                // Worker fatals were already funneled into the pool; any
                // other panic is a scheduler bug and is re-raised.
                if fatal_of_panic(payload.as_ref()).is_none() {
                    resume_unwind(payload);
                }
            }
        }
        if let Err(payload) = driver {
            match fatal_of_panic(payload.as_ref()) {
                Some(fatal) => return Err(fatal),
                None => resume_unwind(payload),
            }
        }
        if let Some(fatal) = pool.take_fatal() {
            return Err(fatal);
        }
        match root_inner.take() {
            Some(Outcome::Resolved(value)) => Ok(value),
            Some(Outcome::Failed(failure)) => std::panic::panic_any(failure.into_message()),
            Some(Outcome::Cancelled) | None => {
                panic!("root promise did not settle")
            }
        }
    }
}

impl core::fmt::Debug for Builder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("events", &self.factory.is_some())
            .field("poll_wrapper", &self.hook.is_some())
            .finish()
    }
}

fn worker_main(
    shared: Arc<DomainShared>,
    pool: Arc<Pool>,
    quanta: u32,
    factory: Factory,
    hook: Option<PollWrapper>,
) {
    let events = factory(shared.uid);
    let domain = Domain::new(shared, Arc::clone(&pool), quanta, events, hook);
    let result = catch_unwind(AssertUnwindSafe(|| domain.run_worker()));
    if let Err(payload) = result {
        match fatal_of_panic(payload.as_ref()) {
            Some(fatal) => pool.report_fatal(fatal),
            None => {
                pool.begin_shutdown();
                resume_unwind(payload);
            }
        }
    }
}
