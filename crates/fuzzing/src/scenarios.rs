use super::*;
use allocator_api2::{boxed::Box as ApiBox, vec::Vec as ApiVec};
use node_pool::{AllocError, GrowthPolicy, PoolConfig, SizeClass, SystemAllocator, NUM_CLASSES};
use std::{
    alloc::Layout as StdLayout,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

type TestPool = PoolAllocator<BudgetAllocator, SingleThreadedLock>;

fn pool_over(inner: &BudgetAllocator) -> TestPool {
    PoolAllocator::new(inner.clone(), SingleThreadedLock::new())
}

fn pool_with(inner: &BudgetAllocator, config: PoolConfig) -> TestPool {
    PoolAllocator::with_config(inner.clone(), SingleThreadedLock::new(), config)
}

fn class(bytes: usize) -> SizeClass {
    SizeClass::for_size(bytes).unwrap()
}

fn addr(p: NonNull<u8>) -> usize {
    p.as_ptr() as usize
}

fn free_blocks(pool: &TestPool, c: SizeClass) -> Vec<usize> {
    let mut blocks = vec![];
    pool.for_each_free_block(c, |p| blocks.push(addr(p)));
    blocks
}

#[test]
fn size_classes() {
    assert_eq!(NUM_CLASSES, 16);
    assert_eq!(SizeClass::all().count(), NUM_CLASSES);
    assert_eq!(class(0).index(), 0);
    assert_eq!(class(1).index(), 0);
    assert_eq!(class(8).index(), 0);
    assert_eq!(class(9).index(), 1);
    assert_eq!(class(32).index(), 3);
    assert_eq!(class(128).index(), 15);
    assert_eq!(class(128).block_size(), 128);
    assert!(SizeClass::for_size(129).is_none());
    assert!(SizeClass::from_index(NUM_CLASSES).is_none());
    for c in SizeClass::all() {
        assert_eq!(SizeClass::from_index(c.index()), Some(c));
        assert_eq!(class(c.block_size()), c);
    }
}

#[test]
fn every_small_size_is_aligned_and_rounded_up() {
    let _ = env_logger::try_init();
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);

    for n in 1..=MAX_BYTES {
        let c = class(n);
        assert!(c.block_size() >= n && c.block_size() < n + ALIGN);

        let p = pool.allocate_bytes(n).unwrap();
        assert_eq!(addr(p) % ALIGN, 0, "allocate_bytes({n}) returned {p:p}");
        unsafe { p.write_bytes(0x5A, n) };

        let before = pool.stats().free_blocks_in(c);
        unsafe { pool.deallocate_bytes(p, n) };
        assert_eq!(pool.stats().free_blocks_in(c), before + 1);
        assert_eq!(free_blocks(&pool, c)[0], addr(p));
    }
}

#[test]
fn freed_block_is_reused_first() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);

    let p = pool.allocate_bytes(16).unwrap();
    let q = pool.allocate_bytes(16).unwrap();
    assert_ne!(p, q);

    unsafe { pool.deallocate_bytes(p, 16) };
    assert_eq!(pool.allocate_bytes(16).unwrap(), p);

    // Any size in the same class gets the same block back.
    unsafe { pool.deallocate_bytes(q, 16) };
    assert_eq!(pool.allocate_bytes(9).unwrap(), q);

    // Stack discipline: last in, first out.
    unsafe {
        pool.deallocate_bytes(p, 16);
        pool.deallocate_bytes(q, 16);
    }
    assert_eq!(pool.allocate_bytes(16).unwrap(), q);
    assert_eq!(pool.allocate_bytes(16).unwrap(), p);
}

#[test]
fn large_requests_never_touch_free_lists() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);

    // Populate a few free lists first.
    let small: Vec<_> = (1..=MAX_BYTES)
        .step_by(7)
        .map(|n| (pool.allocate_bytes(n).unwrap(), n))
        .collect();
    for &(p, n) in &small[..small.len() / 2] {
        unsafe { pool.deallocate_bytes(p, n) };
    }

    let before = pool.stats();
    let lists_before: Vec<_> = SizeClass::all().map(|c| free_blocks(&pool, c)).collect();

    for i in 0..100 {
        let n = MAX_BYTES + 1 + i * 37;
        let p = pool.allocate_bytes(n).unwrap();
        assert_eq!(addr(p) % ALIGN, 0);
        unsafe {
            p.write_bytes(0xEE, n);
            pool.deallocate_bytes(p, n);
        }
    }

    assert_eq!(pool.stats(), before);
    let lists_after: Vec<_> = SizeClass::all().map(|c| free_blocks(&pool, c)).collect();
    assert_eq!(lists_before, lists_after);
    assert_eq!(inner.in_use(), before.heap_size);
}

#[test]
fn twenty_five_allocations_refill_twice() {
    let _ = env_logger::try_init();
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let c = class(32);
    assert_eq!(c.index(), 3);
    assert_eq!(pool.stats().heap_size, 0);

    // Call 1 refills: one block for us, 19 queued, and 20 more blocks' worth
    // left in the arena thanks to the default growth policy.
    let first = pool.allocate_bytes(32).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.regions, 1);
    assert_eq!(stats.free_blocks_in(c), 19);
    assert_eq!(stats.arena_remaining, 20 * 32);
    let heap_size = stats.heap_size;
    assert!(heap_size > 40 * 32);

    // Calls 2 through 20 come from the free list, in address order.
    for i in 1..20 {
        let p = pool.allocate_bytes(32).unwrap();
        assert_eq!(addr(p), addr(first) + i * 32);
        assert_eq!(pool.stats().free_blocks_in(c), 19 - i);
    }
    assert_eq!(pool.stats().heap_size, heap_size);

    // Call 21 refills again, straight from the rest of the arena.
    let p = pool.allocate_bytes(32).unwrap();
    assert_eq!(addr(p), addr(first) + 20 * 32);
    let stats = pool.stats();
    assert_eq!(stats.free_blocks_in(c), 19);
    assert_eq!(stats.arena_remaining, 0);
    assert_eq!(stats.heap_size, heap_size);

    for _ in 21..25 {
        pool.allocate_bytes(32).unwrap();
    }
    assert_eq!(pool.stats().free_blocks_in(c), 15);
}

#[test]
fn refill_links_a_well_formed_chain() {
    let inner = BudgetAllocator::unlimited();
    let config = PoolConfig {
        refill_batch: 3,
        growth: GrowthPolicy::Amortized { multiplier: 2 },
    };
    let pool = pool_with(&inner, config);

    // 6 blocks' worth of arena: 3 carved, 2 of those queued.
    let p = pool.allocate_bytes(48).unwrap();
    let chain = free_blocks(&pool, class(48));
    assert_eq!(chain, vec![addr(p) + 48, addr(p) + 96]);
    assert_eq!(pool.stats().arena_remaining, 144);

    // Only one 96-byte block fits in what is left, so it is handed out
    // directly and its free list stays empty.
    let q = pool.allocate_bytes(96).unwrap();
    assert_eq!(addr(q), addr(p) + 144);
    assert!(free_blocks(&pool, class(96)).is_empty());
    assert_eq!(pool.stats().arena_remaining, 48);
    assert_eq!(pool.stats().regions, 1);
}

#[test]
fn single_block_batches_never_queue() {
    let inner = BudgetAllocator::unlimited();
    let config = PoolConfig {
        refill_batch: 0,
        ..PoolConfig::default()
    };
    let pool = pool_with(&inner, config);

    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..10 {
        let p = pool.allocate_bytes(64).unwrap();
        assert!(seen.insert(addr(p)));
        assert_eq!(pool.stats().free_blocks_in(class(64)), 0);
    }
}

#[test]
fn arena_tail_is_donated_before_growing() {
    let inner = BudgetAllocator::unlimited();
    let config = PoolConfig {
        refill_batch: 2,
        growth: GrowthPolicy::Amortized { multiplier: 2 },
    };
    let pool = pool_with(&inner, config);

    // 160 bytes of arena, 80 carved.
    let p = pool.allocate_bytes(40).unwrap();
    assert_eq!(pool.stats().arena_remaining, 80);

    // Only one 56-byte block fits, leaving a 24-byte tail.
    let q = pool.allocate_bytes(56).unwrap();
    assert_eq!(addr(q), addr(p) + 80);
    assert_eq!(pool.stats().arena_remaining, 24);

    // Growing for 128-byte blocks hands the tail to the 24-byte class.
    pool.allocate_bytes(128).unwrap();
    assert_eq!(free_blocks(&pool, class(24)), vec![addr(p) + 80 + 56]);
    assert_eq!(pool.stats().regions, 2);
}

#[test]
fn heap_size_grows_monotonically_and_matches_regions() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);

    let mut last = 0;
    let mut live = vec![];
    for i in 0..2_000usize {
        let n = 1 + (i * 31) % MAX_BYTES;
        live.push((pool.allocate_bytes(n).unwrap(), n));
        if i % 3 == 0 {
            let (p, n) = live.swap_remove(i % live.len());
            unsafe { pool.deallocate_bytes(p, n) };
        }

        let stats = pool.stats();
        assert!(stats.heap_size >= last);
        last = stats.heap_size;

        // Regions are the only thing the pool takes from the inner allocator
        // for small requests, so every byte is counted exactly once.
        assert_eq!(inner.in_use(), stats.heap_size);
        assert_eq!(inner.live(), stats.regions);
    }
    assert!(pool.stats().regions > 1);
}

#[test]
fn exhausted_system_without_handler_fails() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    inner.exhaust();

    assert_eq!(pool.allocate_bytes(32), Err(AllocError));
    assert_eq!(pool.allocate_bytes(4096), Err(AllocError));
    assert!(inner.failures() >= 3);
    assert_eq!(pool.stats().heap_size, 0);
    assert!(!pool.system().has_oom_handler());
}

/// Install a handler that frees a reserved block on its first invocation and
/// counts how often it runs.
fn install_reserve_handler(pool: &TestPool, inner: &BudgetAllocator) -> Arc<AtomicUsize> {
    let mut reserve = Some(ApiVec::<u8, _>::with_capacity_in(1 << 16, inner.clone()));
    inner.exhaust();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let previous = pool.set_oom_handler(Box::new(move || {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        drop(reserve.take());
    }));
    assert!(previous.is_none());
    calls
}

#[test]
fn oom_handler_recovers_large_allocation() {
    let _ = env_logger::try_init();
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let calls = install_reserve_handler(&pool, &inner);

    let p = pool.allocate_bytes(4096).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    unsafe { pool.deallocate_bytes(p, 4096) };

    // The handler stays installed.
    assert!(pool.system().has_oom_handler());
}

#[test]
fn oom_handler_recovers_arena_growth() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let calls = install_reserve_handler(&pool, &inner);

    let p = pool.allocate_bytes(32).unwrap();
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(addr(p) % ALIGN, 0);
    assert_eq!(pool.stats().regions, 1);
    assert_eq!(pool.stats().free_blocks_in(class(32)), 19);
}

#[test]
fn oom_handler_recovers_reallocation() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let p = pool.allocate_bytes(1000).unwrap();
    unsafe { p.write_bytes(7, 1000) };
    let calls = install_reserve_handler(&pool, &inner);

    let q = unsafe { pool.reallocate_bytes(p, 1000, 3000).unwrap() };
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 1000) };
    assert!(bytes.iter().all(|b| *b == 7));
    unsafe { pool.deallocate_bytes(q, 3000) };
}

#[test]
fn oom_handlers_are_swapped() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let which = Arc::new(AtomicUsize::new(0));

    let w = which.clone();
    assert!(pool
        .set_oom_handler(Box::new(move || w.store(1, Ordering::SeqCst)))
        .is_none());
    let w = which.clone();
    let mut previous = pool
        .set_oom_handler(Box::new(move || w.store(2, Ordering::SeqCst)))
        .unwrap();
    previous();
    assert_eq!(which.load(Ordering::SeqCst), 1);

    let mut current = pool.system().take_oom_handler().unwrap();
    current();
    assert_eq!(which.load(Ordering::SeqCst), 2);
    assert!(!pool.system().has_oom_handler());
}

#[test]
fn scavenges_a_larger_class_when_the_system_is_exhausted() {
    let _ = env_logger::try_init();
    let inner = BudgetAllocator::unlimited();
    let config = PoolConfig {
        refill_batch: 2,
        growth: GrowthPolicy::Exact,
    };
    let pool = pool_with(&inner, config);

    let _p = pool.allocate_bytes(128).unwrap();
    let spare = free_blocks(&pool, class(128));
    assert_eq!(spare.len(), 1);
    assert_eq!(pool.stats().arena_remaining, 0);

    inner.exhaust();
    let q = pool.allocate_bytes(64).unwrap();
    assert_eq!(addr(q), spare[0]);

    let stats = pool.stats();
    assert_eq!(stats.free_blocks_in(class(128)), 0);
    assert_eq!(free_blocks(&pool, class(64)), vec![spare[0] + 64]);
    assert_eq!(stats.arena_remaining, 0);
    assert_eq!(stats.regions, 1);

    // Nothing left to scavenge for a class larger than any spare block.
    assert_eq!(pool.allocate_bytes(128), Err(AllocError));
}

#[test]
fn oversized_refill_batches_fail_without_panicking() {
    let inner = BudgetAllocator::unlimited();
    for growth in [GrowthPolicy::Exact, GrowthPolicy::default()] {
        let config = PoolConfig {
            refill_batch: usize::MAX,
            growth,
        };
        let pool = pool_with(&inner, config);

        // No region that size can exist, and there is nothing to scavenge.
        assert_eq!(pool.allocate_bytes(16), Err(AllocError));
        assert_eq!(pool.stats().heap_size, 0);

        // The system tier still serves large requests.
        let p = pool.allocate_bytes(4096).unwrap();
        unsafe { pool.deallocate_bytes(p, 4096) };
    }
    assert_eq!(inner.live(), 0);
}

#[test]
fn reallocate_bytes_within_and_across_tiers() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let pattern: Vec<u8> = (1..=20).collect();

    unsafe {
        let p = pool.allocate_bytes(17).unwrap();
        assert_eq!(pool.reallocate_bytes(p, 17, 24).unwrap(), p);

        p.copy_from_nonoverlapping(NonNull::from(&pattern[..]).cast(), 20);
        let q = pool.reallocate_bytes(p, 24, 100).unwrap();
        assert_ne!(p, q);
        assert_eq!(std::slice::from_raw_parts(q.as_ptr(), 20), &pattern[..]);
        assert_eq!(free_blocks(&pool, class(24))[0], addr(p));

        // Pool to system and back again.
        let r = pool.reallocate_bytes(q, 100, 1000).unwrap();
        assert_eq!(std::slice::from_raw_parts(r.as_ptr(), 20), &pattern[..]);
        let s = pool.reallocate_bytes(r, 1000, 5000).unwrap();
        assert_eq!(std::slice::from_raw_parts(s.as_ptr(), 20), &pattern[..]);
        let t = pool.reallocate_bytes(s, 5000, 10).unwrap();
        assert_eq!(std::slice::from_raw_parts(t.as_ptr(), 10), &pattern[..10]);
        pool.deallocate_bytes(t, 10);
    }

    assert_eq!(inner.in_use(), pool.stats().heap_size);
}

#[test]
fn dropping_the_pool_releases_every_region() {
    let inner = BudgetAllocator::unlimited();
    {
        let pool = pool_over(&inner);
        for n in 1..=MAX_BYTES {
            for _ in 0..50 {
                pool.allocate_bytes(n).unwrap();
            }
        }
        let big = pool.allocate_bytes(10_000).unwrap();
        unsafe { pool.deallocate_bytes(big, 10_000) };
        assert!(pool.stats().regions > 1);
        assert_eq!(inner.live(), pool.stats().regions);
    }
    assert_eq!(inner.live(), 0);
    assert_eq!(inner.in_use(), 0);
}

#[derive(Debug, PartialEq)]
struct ListNode {
    next: Option<NonNull<ListNode>>,
    value: u64,
}

#[repr(align(64))]
struct CacheLine([u8; 16]);

#[test]
fn node_allocator_routes_by_total_size() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let nodes = NodeAllocator::<ListNode, _, _>::new(&pool);

    let a = nodes.allocate_one().unwrap();
    unsafe {
        a.write(ListNode {
            next: None,
            value: 42,
        });
        assert_eq!(a.as_ref().value, 42);
        nodes.deallocate_one(a);
    }
    assert_eq!(nodes.allocate_one().unwrap(), a);
    assert_eq!(
        pool.stats().free_blocks_in(class(mem::size_of::<ListNode>())),
        19
    );

    // Zero-sized requests never touch the pool.
    let before = pool.stats();
    let empty = nodes.allocate(0).unwrap();
    unsafe { nodes.deallocate(empty, 0) };
    assert_eq!(pool.stats(), before);

    // Arrays that outgrow the ceiling go to the system tier.
    let many = nodes.allocate(100).unwrap();
    assert_eq!(pool.stats(), before);
    unsafe { nodes.deallocate(many, 100) };

    // So do over-aligned types, however small.
    let lines = NodeAllocator::<CacheLine, _, _>::new(&pool);
    let line = lines.allocate_one().unwrap();
    assert_eq!(line.as_ptr() as usize % 64, 0);
    assert_eq!(pool.stats(), before);
    unsafe { lines.deallocate_one(line) };

    assert_eq!(nodes.allocate(usize::MAX), Err(AllocError));
}

#[test]
fn backs_allocator_aware_collections() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);

    let mut v = ApiVec::new_in(&pool);
    for i in 0..1000u32 {
        v.push(i);
    }
    assert!(v.iter().copied().eq(0..1000));

    let boxes: Vec<_> = (0..100u64).map(|i| ApiBox::new_in(i, &pool)).collect();
    assert!(boxes.iter().map(|b| **b).eq(0..100));
    drop(boxes);
    assert!(pool.stats().free_blocks_in(class(8)) >= 100);

    drop(v);
    assert_eq!(inner.in_use(), pool.stats().heap_size);
}

#[test]
fn allocator_resizes_in_place_within_a_class() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let old = StdLayout::from_size_align(10, 2).unwrap();
    let new = StdLayout::from_size_align(16, 2).unwrap();

    let p = pool.allocate(old).unwrap();
    assert_eq!(p.len(), 16);
    let q = unsafe { pool.grow(p.cast(), old, new).unwrap() };
    assert_eq!(q.cast::<u8>(), p.cast::<u8>());
    let r = unsafe { pool.shrink(q.cast(), new, old).unwrap() };
    assert_eq!(r.cast::<u8>(), p.cast::<u8>());
    unsafe { pool.deallocate(r.cast(), old) };
}

#[test]
#[should_panic(expected = "re-entrant")]
fn single_threaded_lock_rejects_reentrance() {
    let lock = SingleThreadedLock::new();
    lock.lock();
    lock.lock();
}

#[test]
fn growth_policies() {
    let amortized = GrowthPolicy::default();
    assert_eq!(amortized, GrowthPolicy::Amortized { multiplier: 2 });
    assert_eq!(amortized.region_size(640, 0), 1280);
    assert_eq!(amortized.region_size(640, 1600), 1280 + 104);
    assert_eq!(GrowthPolicy::Exact.region_size(640, 1600), 640);
    assert_eq!(
        GrowthPolicy::Amortized { multiplier: 0 }.region_size(64, 0),
        64
    );
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "was not allocated by this pool")]
fn returning_a_foreign_block_is_caught() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let _p = pool.allocate_bytes(16).unwrap();

    let foreign = inner
        .allocate(StdLayout::from_size_align(16, ALIGN).unwrap())
        .unwrap();
    unsafe { pool.deallocate_bytes(foreign.cast(), 16) };
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "is not aligned to 8")]
fn returning_a_misaligned_block_is_caught() {
    let inner = BudgetAllocator::unlimited();
    let pool = pool_over(&inner);
    let p = pool.allocate_bytes(16).unwrap();
    unsafe { pool.deallocate_bytes(p.add(1), 16) };
}

#[test]
fn has_oom_handler_is_false_while_the_handler_runs() {
    let inner = BudgetAllocator::unlimited();
    let system = Arc::new(SystemAllocator::new(inner.clone(), SpinLock::default()));
    let mut reserve = Some(ApiVec::<u8, _>::with_capacity_in(1 << 16, inner.clone()));
    inner.exhaust();

    let installed_during_call = Arc::new(AtomicBool::new(true));
    let (sys, installed) = (system.clone(), installed_during_call.clone());
    system.set_oom_handler(Box::new(move || {
        installed.store(sys.has_oom_handler(), Ordering::SeqCst);
        drop(reserve.take());
    }));

    let p = system.allocate(4096).unwrap();
    assert!(!installed_during_call.load(Ordering::SeqCst));
    assert!(system.has_oom_handler());
    unsafe { system.deallocate(p, 4096) };

    // The handler holds a reference to the system tier.
    drop(system.take_oom_handler());
    assert_eq!(Arc::strong_count(&system), 1);
}

/// A minimal spin lock, so that a pool can be shared between threads.
#[derive(Default)]
struct SpinLock(AtomicBool);

unsafe impl Lock for SpinLock {
    fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[test]
fn spin_locked_pool_is_shared_across_threads() {
    fn assert_send_sync<T: Send + Sync>(_: &T) {}

    let inner = BudgetAllocator::unlimited();
    let pool = PoolAllocator::new(inner.clone(), SpinLock::default());
    assert_send_sync(&pool);

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let pool = &pool;
            s.spawn(move || {
                let blocks: Vec<_> = (0..1_000usize)
                    .map(|i| {
                        let n = 1 + (i * 13 + usize::from(t)) % MAX_BYTES;
                        let p = pool.allocate_bytes(n).unwrap();
                        unsafe { p.write_bytes(t, n) };
                        (p, n)
                    })
                    .collect();
                for (p, n) in blocks {
                    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), n) };
                    assert!(bytes.iter().all(|b| *b == t), "block shared between threads");
                    unsafe { pool.deallocate_bytes(p, n) };
                }
            });
        }
    });

    let stats = pool.stats();
    assert_eq!(inner.in_use(), stats.heap_size);
    assert_eq!(inner.live(), stats.regions);
}
