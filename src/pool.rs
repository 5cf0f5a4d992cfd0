//! Keyed cache of built runners.
//!
//! An entry is keyed by the graph operation type and a structural comparison
//! of its construction parameter. Parameters that only differ in dynamic
//! fields hit the same entry and are patched in through
//! [`GraphOperation::update`] instead of rebuilding the graph.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    config::EngineConfig,
    error::{Error, PoolError, Result},
    graph::{GraphParams, KernelGraph},
    runner::Runner,
};

/// A family of kernel graphs built from one parameter type.
pub trait GraphOperation: 'static {
    type Param: Clone + Debug + PartialEq + Send + Sync + 'static;

    const NAME: &'static str;

    fn build(param: &Self::Param) -> Result<KernelGraph>;

    /// Whether graphs built from `a` and `b` have the same nodes, tensors and
    /// views. Such parameters share a pool entry.
    fn same_topology(a: &Self::Param, b: &Self::Param) -> bool {
        a == b
    }

    /// Patches node parameters so a graph built from an earlier parameter
    /// behaves as if built from `param`. Only called when
    /// [`GraphOperation::same_topology`] holds.
    fn update(_param: &Self::Param, _graph: &mut GraphParams<'_>) -> Result<(), PoolError> {
        Ok(())
    }
}

type Compare = fn(&dyn Any, &dyn Any) -> bool;

#[derive(Clone, Copy)]
struct Registration {
    name: &'static str,
    same_topology: Compare,
}

fn compare<T: GraphOperation>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T::Param>(), b.downcast_ref::<T::Param>()) {
        (Some(a), Some(b)) => T::same_topology(a, b),
        _ => false,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub builds: u64,
    pub hits: u64,
    pub updates: u64,
    pub evictions: u64,
}

struct PoolEntry {
    id: u64,
    type_id: TypeId,
    param: Box<dyn Any + Send + Sync>,
    /// `None` while checked out.
    runner: Option<Runner>,
    last_used: u64,
}

#[derive(Default)]
struct PoolEntries {
    entries: Vec<PoolEntry>,
    clock: u64,
    next_id: u64,
    stats: PoolStats,
}

impl PoolEntries {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict(&mut self, id: u64) {
        self.entries.retain(|entry| entry.id != id);
        self.stats.evictions += 1;
    }
}

pub struct RunnerPoolBuilder {
    config: EngineConfig,
    registered: HashMap<TypeId, Registration>,
}

impl RunnerPoolBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register<T: GraphOperation>(mut self) -> Self {
        self.registered.insert(
            TypeId::of::<T>(),
            Registration {
                name: T::NAME,
                same_topology: compare::<T>,
            },
        );
        self
    }

    pub fn build(self) -> Result<RunnerPool> {
        self.config.validate()?;
        Ok(RunnerPool {
            config: self.config,
            registered: self.registered,
            entries: Mutex::new(PoolEntries::default()),
        })
    }
}

pub struct RunnerPool {
    config: EngineConfig,
    registered: HashMap<TypeId, Registration>,
    entries: Mutex<PoolEntries>,
}

impl RunnerPool {
    pub fn builder() -> RunnerPoolBuilder {
        RunnerPoolBuilder {
            config: EngineConfig::default(),
            registered: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.entries.lock().stats
    }

    /// Pooled runners of type `T`, checked out or not.
    pub fn len_of<T: GraphOperation>(&self) -> usize {
        let type_id = TypeId::of::<T>();
        self.entries
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.type_id == type_id)
            .count()
    }

    /// Checks out the runner for `(T, param)`, building it on a miss.
    pub fn malloc_runner<T: GraphOperation>(&self, param: &T::Param) -> Result<RunnerGuard<'_>> {
        let type_id = TypeId::of::<T>();
        let registration = self.registered.get(&type_id).copied().ok_or_else(|| {
            error!("graph operation `{}` is not registered", T::NAME);
            PoolError::Unregistered(T::NAME)
        })?;

        let mut entries = self.entries.lock();
        let now = entries.tick();
        let hit = entries.entries.iter().position(|entry| {
            let pooled: &dyn Any = &*entry.param;
            entry.type_id == type_id && (registration.same_topology)(pooled, param)
        });

        if let Some(index) = hit {
            let entry = &mut entries.entries[index];
            let Some(mut runner) = entry.runner.take() else {
                error!("runner for `{}` is already checked out", registration.name);
                return Err(PoolError::Busy(registration.name).into());
            };
            let id = entry.id;
            let changed = entry.param.downcast_ref::<T::Param>() != Some(param);
            if changed {
                let mut params = runner.params(T::NAME);
                if let Err(err) = T::update(param, &mut params) {
                    error!("{err}, evicting the pooled runner");
                    entries.evict(id);
                    return Err(err.into());
                }
                let patched: Vec<_> = params
                    .touched()
                    .iter()
                    .filter_map(|id| params.graph().node(*id))
                    .map(|node| node.name())
                    .collect();
                debug!("`{}` update patched nodes {patched:?}", T::NAME);
                let entry = &mut entries.entries[index];
                entry.param = Box::new(param.clone());
                entries.stats.updates += 1;
                debug!("pool hit for `{}` with updated parameters", T::NAME);
            } else {
                debug!("pool hit for `{}`", T::NAME);
            }
            entries.entries[index].last_used = now;
            entries.stats.hits += 1;
            return Ok(RunnerGuard {
                pool: self,
                id,
                runner: Some(runner),
            });
        }

        let pooled = entries
            .entries
            .iter()
            .filter(|entry| entry.type_id == type_id)
            .count();
        // pick the entry to make room for now, evict it only once the new
        // runner exists
        let victim = if pooled >= self.config.pool_capacity {
            let idle = entries
                .entries
                .iter()
                .filter(|entry| entry.type_id == type_id && entry.runner.is_some())
                .min_by_key(|entry| entry.last_used)
                .map(|entry| entry.id);
            let Some(idle) = idle else {
                error!(
                    "all {} pooled runners for `{}` are checked out",
                    self.config.pool_capacity,
                    T::NAME
                );
                return Err(PoolError::Exhausted {
                    name: T::NAME,
                    capacity: self.config.pool_capacity,
                }
                .into());
            };
            Some(idle)
        } else {
            None
        };

        let graph = T::build(param).map_err(|err| {
            error!("building graph for `{}` failed: {err}", T::NAME);
            err
        })?;
        let runner = Runner::new(graph, &self.config).map_err(|err| {
            error!("graph for `{}` is not runnable: {err}", T::NAME);
            err
        })?;
        info!(
            "built graph `{}` for `{}` with {} nodes",
            runner.graph().name(),
            T::NAME,
            runner.graph().nodes().len()
        );
        if let Some(victim) = victim {
            warn!("evicting least recently used runner for `{}`", T::NAME);
            entries.evict(victim);
        }
        let id = entries.next_id;
        entries.next_id += 1;
        entries.stats.builds += 1;
        entries.entries.push(PoolEntry {
            id,
            type_id,
            param: Box::new(param.clone()),
            runner: None,
            last_used: now,
        });
        Ok(RunnerGuard {
            pool: self,
            id,
            runner: Some(runner),
        })
    }

    /// Returns a checked out runner. Dropping the guard does the same.
    pub fn free_runner(&self, guard: RunnerGuard<'_>) {
        drop(guard)
    }

    fn check_in(&self, id: u64, runner: Runner) {
        let mut entries = self.entries.lock();
        match entries.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => entry.runner = Some(runner),
            None => debug!("dropping runner for evicted pool entry {id}"),
        }
    }
}

/// A checked out runner. Goes back to its pool on drop.
#[derive(Debug)]
pub struct RunnerGuard<'a> {
    pool: &'a RunnerPool,
    id: u64,
    runner: Option<Runner>,
}

impl Deref for RunnerGuard<'_> {
    type Target = Runner;

    fn deref(&self) -> &Self::Target {
        self.runner.as_ref().expect("runner is present until the guard drops")
    }
}

impl DerefMut for RunnerGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.runner.as_mut().expect("runner is present until the guard drops")
    }
}

impl Drop for RunnerGuard<'_> {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            self.pool.check_in(self.id, runner);
        }
    }
}

impl Debug for RunnerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("RunnerPool")
            .field(
                "registered",
                &self.registered.values().map(|r| r.name).collect::<Vec<_>>(),
            )
            .field("entries", &entries.entries.len())
            .field("stats", &entries.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::KernelGraphNode,
        op::{ActivationKind, ActivationParam, ElewiseKind, ElewiseParam, OpParam},
    };

    /// `y = act(x) * scale`. The activation kind is structural, the scale is
    /// patched in place.
    struct Scaled;

    #[derive(Clone, Debug, PartialEq)]
    struct ScaledParam {
        kind: ActivationKind,
        scale: f32,
    }

    impl GraphOperation for Scaled {
        type Param = ScaledParam;

        const NAME: &'static str = "scaled";

        fn build(param: &ScaledParam) -> Result<KernelGraph> {
            let mut graph = KernelGraph::new("scaled");
            let x = graph.create_input("x");
            let y = graph.create_output("y");
            let act = graph.create_internal("act");
            graph.add_node(
                KernelGraphNode::new("act", ActivationParam::new(param.kind))
                    .input(x)
                    .output(act),
            );
            graph.add_node(
                KernelGraphNode::new("scale", ElewiseParam::new(ElewiseKind::Muls(param.scale)))
                    .input(act)
                    .output(y),
            );
            Ok(graph)
        }

        fn same_topology(a: &ScaledParam, b: &ScaledParam) -> bool {
            a.kind == b.kind
        }

        fn update(param: &ScaledParam, graph: &mut GraphParams<'_>) -> Result<(), PoolError> {
            graph.get_mut::<ElewiseParam>("scale")?.kind = ElewiseKind::Muls(param.scale);
            Ok(())
        }
    }

    /// Points its dynamic update at the wrong operator family.
    struct Broken;

    impl GraphOperation for Broken {
        type Param = ScaledParam;

        const NAME: &'static str = "broken";

        fn build(param: &ScaledParam) -> Result<KernelGraph> {
            Scaled::build(param)
        }

        fn same_topology(a: &ScaledParam, b: &ScaledParam) -> bool {
            a.kind == b.kind
        }

        fn update(param: &ScaledParam, graph: &mut GraphParams<'_>) -> Result<(), PoolError> {
            graph.get_mut::<ActivationParam>("scale")?.kind = param.kind;
            Ok(())
        }
    }

    fn relu(scale: f32) -> ScaledParam {
        ScaledParam {
            kind: ActivationKind::Relu,
            scale,
        }
    }

    fn pool(capacity: usize) -> RunnerPool {
        RunnerPool::builder()
            .config(EngineConfig {
                pool_capacity: capacity,
                ..Default::default()
            })
            .register::<Scaled>()
            .register::<Broken>()
            .build()
            .unwrap()
    }

    #[test]
    fn test_same_key_builds_once() {
        let pool = pool(4);
        {
            let first = pool.malloc_runner::<Scaled>(&relu(1.0)).unwrap();
            // a second request while the first is live is refused
            assert!(matches!(
                pool.malloc_runner::<Scaled>(&relu(1.0)),
                Err(Error::Pool(PoolError::Busy("scaled")))
            ));
            pool.free_runner(first);
        }
        let _again = pool.malloc_runner::<Scaled>(&relu(1.0)).unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats {
                builds: 1,
                hits: 1,
                updates: 0,
                evictions: 0
            }
        );
    }

    #[test]
    fn test_dynamic_update_patches_params() {
        let pool = pool(4);
        drop(pool.malloc_runner::<Scaled>(&relu(1.0)).unwrap());
        let runner = pool.malloc_runner::<Scaled>(&relu(3.0)).unwrap();
        let scale = runner.graph().node_by_name("scale").unwrap();
        assert_eq!(
            runner.graph().node(scale).unwrap().base_param(),
            &OpParam::from(ElewiseParam::new(ElewiseKind::Muls(3.0)))
        );
        assert_eq!(pool.stats().builds, 1);
        assert_eq!(pool.stats().updates, 1);
        drop(runner);

        // a structural change is a different entry
        let gelu = ScaledParam {
            kind: ActivationKind::Gelu,
            scale: 3.0,
        };
        drop(pool.malloc_runner::<Scaled>(&gelu).unwrap());
        assert_eq!(pool.stats().builds, 2);
        assert_eq!(pool.len_of::<Scaled>(), 2);
    }

    #[test]
    fn test_failed_update_evicts() {
        let pool = pool(4);
        drop(pool.malloc_runner::<Broken>(&relu(1.0)).unwrap());
        let err = pool.malloc_runner::<Broken>(&relu(2.0)).unwrap_err();
        assert!(matches!(
            err,
            Error::Pool(PoolError::Update { name: "broken", ref node, .. }) if node == "scale"
        ));
        assert_eq!(pool.len_of::<Broken>(), 0);
        assert_eq!(pool.stats().evictions, 1);
    }

    #[test]
    fn test_capacity_eviction_and_exhaustion() {
        let pool = pool(1);
        drop(pool.malloc_runner::<Scaled>(&relu(1.0)).unwrap());
        let gelu = ScaledParam {
            kind: ActivationKind::Gelu,
            scale: 1.0,
        };
        let live = pool.malloc_runner::<Scaled>(&gelu).unwrap();
        assert_eq!(pool.stats().evictions, 1);
        assert_eq!(pool.len_of::<Scaled>(), 1);

        let err = pool.malloc_runner::<Scaled>(&relu(1.0)).unwrap_err();
        assert!(matches!(
            err,
            Error::Pool(PoolError::Exhausted {
                name: "scaled",
                capacity: 1
            })
        ));
        drop(live);
    }

    /// Builds a valid graph for `true` and one that never writes its
    /// output for `false`.
    struct Picky;

    impl GraphOperation for Picky {
        type Param = bool;

        const NAME: &'static str = "picky";

        fn build(valid: &bool) -> Result<KernelGraph> {
            if *valid {
                return Scaled::build(&relu(1.0));
            }
            let mut graph = KernelGraph::new("picky");
            graph.create_input("x");
            graph.create_output("y");
            Ok(graph)
        }
    }

    #[test]
    fn test_failed_build_keeps_idle_entry() {
        let pool = RunnerPool::builder()
            .config(EngineConfig {
                pool_capacity: 1,
                ..Default::default()
            })
            .register::<Picky>()
            .build()
            .unwrap();
        drop(pool.malloc_runner::<Picky>(&true).unwrap());

        assert!(matches!(
            pool.malloc_runner::<Picky>(&false),
            Err(Error::InvalidGraph { .. })
        ));
        assert_eq!(pool.len_of::<Picky>(), 1);
        assert_eq!(pool.stats().evictions, 0);

        drop(pool.malloc_runner::<Picky>(&true).unwrap());
        assert_eq!(pool.stats().builds, 1);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_one_live_checkout_across_threads() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        let pool = pool(4);
        let live = AtomicUsize::new(0);
        let granted = AtomicUsize::new(0);
        let busy = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        match pool.malloc_runner::<Scaled>(&relu(1.0)) {
                            Ok(runner) => {
                                assert_eq!(live.fetch_add(1, Ordering::SeqCst), 0);
                                granted.fetch_add(1, Ordering::SeqCst);
                                std::thread::yield_now();
                                live.fetch_sub(1, Ordering::SeqCst);
                                drop(runner);
                            }
                            Err(Error::Pool(PoolError::Busy("scaled"))) => {
                                busy.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(err) => panic!("unexpected pool error: {err}"),
                        }
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.builds, 1);
        assert_eq!(pool.len_of::<Scaled>(), 1);
        assert_eq!(
            granted.load(Ordering::SeqCst) + busy.load(Ordering::SeqCst),
            THREADS * ROUNDS
        );
        assert_eq!(stats.hits + stats.builds, granted.load(Ordering::SeqCst) as u64);
    }

    #[test]
    fn test_unregistered_and_failed_builds() {
        struct Failing;
        impl GraphOperation for Failing {
            type Param = u32;
            const NAME: &'static str = "failing";
            fn build(_: &u32) -> Result<KernelGraph> {
                let mut graph = KernelGraph::new("failing");
                graph.create_output("never_written");
                Ok(graph)
            }
        }

        let pool = pool(4);
        assert!(matches!(
            pool.malloc_runner::<Failing>(&0),
            Err(Error::Pool(PoolError::Unregistered("failing")))
        ));

        let pool = RunnerPool::builder().register::<Failing>().build().unwrap();
        assert!(matches!(
            pool.malloc_runner::<Failing>(&0),
            Err(Error::InvalidGraph { .. })
        ));
        assert_eq!(pool.len_of::<Failing>(), 0);
        assert_eq!(pool.stats().builds, 0);
    }
}
