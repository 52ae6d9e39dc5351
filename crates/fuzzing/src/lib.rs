//! Shared fuzzing and testing infrastructure for `node_pool`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use node_pool::{
    Allocator, Lock, NodeAllocator, PoolAllocator, PoolStats, SingleThreadedLock, ALIGN,
    MAX_BYTES,
};
use std::{collections::BTreeMap, mem, ptr::NonNull};

mod budget;
pub use budget::BudgetAllocator;

#[cfg(test)]
mod scenarios;

/// The layout of a test allocation.
//
// Note: it is easier to define our own layout type here than to reuse
// `std::alloc::Layout` because we want to define a default mutator for `Layout`
// but trait orphan rules make that impossible.
#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct Layout {
    size: usize,
    align: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self { size: 0, align: 1 }
    }
}

impl Layout {
    /// Create a new `Layout` from the given size and alignment.
    pub fn new(size: usize, align: usize) -> Option<Self> {
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        Some(Layout {
            size: layout.size(),
            align: layout.align(),
        })
    }

    /// Like `Layout::new(...).unwrap()`.
    pub fn unwrap_new(size: usize, align: usize) -> Self {
        Self::new(size, align).expect("Layout::unwrap_new on bad size/align")
    }

    fn alloc_layout(&self) -> Option<std::alloc::Layout> {
        std::alloc::Layout::from_size_align(self.size, self.align).ok()
    }
}

impl DefaultMutate for Layout {
    type DefaultMutate = LayoutMutator;
}

/// A mutator for `Layout`s with configurable maximums for size and alignment.
///
/// The defaults straddle the pool's size ceiling and fixed alignment, so that
/// both tiers get exercised.
#[derive(Debug)]
pub struct LayoutMutator {
    pub max_size: usize,
    pub max_align: usize,
}

impl Default for LayoutMutator {
    fn default() -> Self {
        Self {
            max_size: 4 * MAX_BYTES,
            max_align: 4 * ALIGN,
        }
    }
}

fn round_down_to_pow2(x: usize) -> usize {
    if x == 0 {
        1
    } else {
        1 << (mem::size_of::<usize>() * 8 - 1 - (x.leading_zeros() as usize))
    }
}

impl Mutate<Layout> for LayoutMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        layout: &mut Layout,
    ) -> mutatis::Result<()> {
        // Mutate size.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                layout.size
            } else {
                self.max_size
            };
            layout.size = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Mutate alignment.
        c.mutation(|ctx| {
            let max_align_log2 = if ctx.shrink() {
                layout.align.trailing_zeros() as usize
            } else {
                self.max_align.trailing_zeros() as usize
            };
            let align_log2 = ctx.rng().gen_index(max_align_log2 + 1).unwrap();
            layout.align = 1 << align_log2;
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Layout> for LayoutMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Layout> {
        let size = m::range(0..=self.max_size).generate(context)?;
        let align = m::range(1..=self.max_align).generate(context)?;
        let align = round_down_to_pow2(align);
        Ok(Layout { size, align })
    }
}

/// The element type used for typed-facade operations: a typical three-word
/// container node.
#[derive(Clone, Copy, Debug)]
#[allow(dead_code)]
struct Node {
    next: usize,
    prev: usize,
    value: u64,
}

/// A test operation.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Allocate through the `Allocator` trait.
    Alloc { id: u32, layout: Layout },
    /// Allocate `layout.size` bytes through the byte interface.
    AllocBytes { id: u32, layout: Layout },
    /// Allocate `count` nodes through the typed facade.
    AllocNodes { id: u32, count: u8 },
    /// Deallocate, through whichever interface allocated.
    Dealloc { id: u32 },
    /// Resize to `layout.size` bytes, through whichever interface allocated.
    Resize { id: u32, layout: Layout },
}

impl Op {
    fn id_mut(&mut self) -> &mut u32 {
        match self {
            Op::Alloc { id, .. }
            | Op::AllocBytes { id, .. }
            | Op::AllocNodes { id, .. }
            | Op::Dealloc { id }
            | Op::Resize { id, .. } => id,
        }
    }
}

impl DefaultMutate for Op {
    type DefaultMutate = OpMutator;
}

#[derive(Debug, Default)]
pub struct OpMutator;

impl Mutate<Op> for OpMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, op: &mut Op) -> mutatis::Result<()> {
        // Swap in an entirely different operation.
        if !c.shrink() {
            c.mutation(|ctx| {
                *op = OpMutator.generate(ctx)?;
                Ok(())
            })?;
        }

        match op {
            Op::Alloc { layout, .. } | Op::AllocBytes { layout, .. } | Op::Resize { layout, .. } => {
                LayoutMutator::default().mutate(c, layout)?;
            }
            Op::AllocNodes { count, .. } => {
                c.mutation(|ctx| {
                    let max = if ctx.shrink() { *count } else { u8::MAX };
                    *count = ctx.rng().gen_index(max as usize + 1).unwrap() as u8;
                    Ok(())
                })?;
            }
            Op::Dealloc { .. } => {}
        }

        c.mutation(|ctx| {
            *op.id_mut() = ctx.rng().gen_u32();
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::AllocBytes {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::AllocNodes {
                    id: ctx.rng().gen_u32(),
                    count: ctx.rng().gen_u32() as u8,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Resize {
                    id: ctx.rng().gen_u32(),
                    layout: m::default::<Layout>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } | Op::AllocBytes { id, .. } | Op::AllocNodes { id, .. } => {
                    Some((i, *id))
                }
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                *ops.ops[op_index].id_mut() = new_id;
            }
            Ok(())
        })?;

        // Deallocate or resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let new_op = if ctx.rng().gen_bool() {
                        Op::Dealloc { id }
                    } else {
                        Op::Resize {
                            id,
                            layout: m::default::<Layout>().generate(ctx)?,
                        }
                    };
                    let index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(index, new_op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation. Returns `false` if there was none.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        let inner = BudgetAllocator::unlimited();
        let pool = PoolAllocator::new(inner.clone(), SingleThreadedLock::new());
        self.run_with_pool(&pool, allocation_limit)?;
        drop(pool);
        ensure!(
            inner.live() == 0,
            "dropping the pool should return everything to the inner allocator, but {} blocks \
             ({} bytes) are still live",
            inner.live(),
            inner.in_use(),
        );
        Ok(())
    }

    /// Run these test operations with the given pool and allocation limit.
    ///
    /// Every allocation made here is deallocated again before returning.
    pub fn run_with_pool<A, L>(
        &self,
        pool: &PoolAllocator<A, L>,
        allocation_limit: usize,
    ) -> Result<(), String>
    where
        A: Allocator,
        L: Lock,
    {
        log::debug!("========== Running test operations ==========");

        let nodes = NodeAllocator::<Node, A, L>::new(pool);
        let mut live = LiveMap::new(allocation_limit);
        let mut last_stats = pool.stats();

        // Fill an allocation with the given byte pattern.
        let fill = |alloc: &LiveAlloc, byte: u8| unsafe {
            alloc.ptr.write_bytes(byte, alloc.len());
        };

        // Check that an allocation's first `len` bytes hold `byte`.
        let check_bytes = |ptr: NonNull<u8>, len: usize, byte: u8| -> Result<(), String> {
            let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast_const(), len) };
            ensure!(
                slice.iter().all(|b| *b == byte),
                "{:p}'s contents were clobbered while it was live",
                ptr,
            );
            Ok(())
        };

        // Deallocate the allocation with the given id.
        let dealloc = |id: u32, alloc: LiveAlloc| -> Result<(), String> {
            log::debug!("deallocating id{id} -> {alloc:?}");
            check_bytes(alloc.ptr, alloc.len(), LIVE_POISON_PATTERN)?;
            fill(&alloc, FREE_POISON_PATTERN);
            unsafe {
                match alloc.kind {
                    Kind::Layout(layout) => pool.deallocate(alloc.ptr, layout),
                    Kind::Bytes(n) => pool.deallocate_bytes(alloc.ptr, n),
                    Kind::Nodes(n) => nodes.deallocate(alloc.ptr.cast(), n),
                }
            }
            Ok(())
        };

        // Assert that the given allocation is not overlapping with any other
        // live allocations.
        let assert_not_overlapping = |live: &LiveMap, alloc: &LiveAlloc| -> Result<(), String> {
            let start = alloc.ptr.as_ptr() as usize;
            let end = start + alloc.len();
            for other in live.map.values() {
                let other_start = other.ptr.as_ptr() as usize;
                let other_end = other_start + other.len();
                ensure!(
                    end <= other_start || other_end <= start || alloc.len() == 0 || other.len() == 0,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        // Process a new allocation, checking properties and inserting it into
        // the live set.
        let new_alloc = |live: &mut LiveMap, id: u32, alloc: LiveAlloc| -> Result<(), String> {
            if let Some(old_alloc) = live.remove(id) {
                dealloc(id, old_alloc)?;
            }

            log::debug!("new allocation: id{id} -> {alloc:?}");

            ensure!(
                (alloc.ptr.as_ptr() as usize) % alloc.align() == 0,
                "{:p} is not aligned to {}",
                alloc.ptr,
                alloc.align(),
            );
            assert_not_overlapping(live, &alloc)?;
            fill(&alloc, LIVE_POISON_PATTERN);
            live.insert(id, alloc);
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            // Whether this op only ever touches the system tier.
            let mut large_only = false;

            match op {
                Op::Alloc { id, layout } => {
                    let Some(layout) = layout.alloc_layout() else {
                        continue;
                    };
                    if live.beyond_allocation_limit(layout.size()) {
                        continue;
                    }
                    large_only = layout.size() > MAX_BYTES && !live.replaces_small(*id);
                    if let Ok(ptr) = pool.allocate(layout) {
                        ensure!(ptr.len() >= layout.size(), "allocation is too small");
                        let alloc = LiveAlloc {
                            ptr: ptr.cast(),
                            kind: Kind::Layout(layout),
                        };
                        new_alloc(&mut live, *id, alloc)?;
                    }
                }

                Op::AllocBytes { id, layout } => {
                    let n = layout.size;
                    if live.beyond_allocation_limit(n) {
                        continue;
                    }
                    large_only = n > MAX_BYTES && !live.replaces_small(*id);
                    if let Ok(ptr) = pool.allocate_bytes(n) {
                        let alloc = LiveAlloc {
                            ptr,
                            kind: Kind::Bytes(n),
                        };
                        new_alloc(&mut live, *id, alloc)?;
                    }
                }

                Op::AllocNodes { id, count } => {
                    let n = usize::from(*count);
                    if live.beyond_allocation_limit(n * mem::size_of::<Node>()) {
                        continue;
                    }
                    if let Ok(ptr) = nodes.allocate(n) {
                        let alloc = LiveAlloc {
                            ptr: ptr.cast(),
                            kind: Kind::Nodes(n),
                        };
                        new_alloc(&mut live, *id, alloc)?;
                    }
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        large_only = alloc.len() > MAX_BYTES;
                        dealloc(*id, alloc)?;
                    }
                }

                Op::Resize { id, layout } => {
                    let Some(old_alloc) = live.remove(*id) else {
                        continue;
                    };
                    let new_size = layout.size;
                    if live.beyond_allocation_limit(new_size) {
                        live.insert(*id, old_alloc);
                        continue;
                    }
                    check_bytes(old_alloc.ptr, old_alloc.len(), LIVE_POISON_PATTERN)?;

                    let resized = match old_alloc.kind {
                        Kind::Layout(old) => {
                            let Ok(new) = std::alloc::Layout::from_size_align(new_size, old.align())
                            else {
                                live.insert(*id, old_alloc);
                                continue;
                            };
                            let result = unsafe {
                                if new.size() >= old.size() {
                                    pool.grow(old_alloc.ptr, old, new)
                                } else {
                                    pool.shrink(old_alloc.ptr, old, new)
                                }
                            };
                            result.map(|ptr| LiveAlloc {
                                ptr: ptr.cast(),
                                kind: Kind::Layout(new),
                            })
                        }
                        Kind::Bytes(old) => unsafe {
                            pool.reallocate_bytes(old_alloc.ptr, old, new_size).map(|ptr| {
                                LiveAlloc {
                                    ptr,
                                    kind: Kind::Bytes(new_size),
                                }
                            })
                        },
                        // Typed storage is never resized.
                        Kind::Nodes(_) => {
                            live.insert(*id, old_alloc);
                            continue;
                        }
                    };

                    match resized {
                        Ok(resized) => {
                            check_bytes(
                                resized.ptr,
                                old_alloc.len().min(resized.len()),
                                LIVE_POISON_PATTERN,
                            )?;
                            log::debug!("resized id{id}: {old_alloc:?} -> {resized:?}");
                            assert_not_overlapping(&live, &resized)?;
                            fill(&resized, LIVE_POISON_PATTERN);
                            live.insert(*id, resized);
                        }
                        // Resizing failed; just put it back unmodified.
                        Err(_) => live.insert(*id, old_alloc),
                    }
                }
            }

            let stats = pool.stats();
            check_stats(&last_stats, &stats, large_only)?;
            last_stats = stats;
        }

        // Finally, deallocate any remaining live allocations.
        for (id, alloc) in mem::take(&mut live.map) {
            dealloc(id, alloc)?;
        }

        Ok(())
    }
}

/// Check the invariants relating two consecutive snapshots of a pool's
/// accounting.
fn check_stats(before: &PoolStats, after: &PoolStats, large_only: bool) -> Result<(), String> {
    ensure!(
        after.heap_size >= before.heap_size,
        "heap size shrank from {} to {}",
        before.heap_size,
        after.heap_size,
    );
    ensure!(
        after.regions >= before.regions,
        "region count shrank from {} to {}",
        before.regions,
        after.regions,
    );
    if large_only {
        ensure!(
            before == after,
            "an operation above the size ceiling changed pool state: {:?} -> {:?}",
            before,
            after,
        );
    }
    Ok(())
}

// We fill live memory with a poison pattern and check it is intact when the
// allocation is resized or freed, to catch overlapping or clobbered blocks.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// Which interface an allocation came from, and so must be returned through.
#[derive(Clone, Copy, Debug)]
enum Kind {
    Layout(std::alloc::Layout),
    Bytes(usize),
    Nodes(usize),
}

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    kind: Kind,
}

impl LiveAlloc {
    /// The number of bytes the test may use.
    fn len(&self) -> usize {
        match self.kind {
            Kind::Layout(layout) => layout.size(),
            Kind::Bytes(n) => n,
            Kind::Nodes(n) => n * mem::size_of::<Node>(),
        }
    }

    /// The alignment the allocation must have.
    fn align(&self) -> usize {
        match self.kind {
            Kind::Layout(layout) => layout.align(),
            Kind::Bytes(_) => ALIGN,
            Kind::Nodes(_) => mem::align_of::<Node>(),
        }
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, kind } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("kind", &kind)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes.saturating_add(size) > self.allocation_limit
    }

    /// Insert a new live allocation.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.len();
        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    /// Would allocating under `id` free a block that might be pooled?
    fn replaces_small(&self, id: u32) -> bool {
        self.map.get(&id).is_some_and(|a| a.len() <= MAX_BYTES)
    }

    /// Remove a live allocation for deallocation.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.len();
        Some(alloc)
    }
}
