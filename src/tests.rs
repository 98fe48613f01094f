use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crate::{
    api::{Collectable, Field, Finalize, Gc, Trace, Visitor},
    header::{ReferenceKind, RB_WHITE},
    heap::{GcCause, Heap, HeapOptions},
    letroot,
    region_space::{RegionType, REGION_SIZE},
};

fn test_heap() -> Box<Heap> {
    let _ = env_logger::builder().is_test(true).try_init();
    Heap::new(HeapOptions {
        region_space_capacity: 32 * REGION_SIZE,
        non_moving_space_initial_size: crate::MB,
        non_moving_space_capacity: 8 * crate::MB,
        large_object_space_capacity: 8 * crate::MB,
        boot_image_space_capacity: crate::MB,
        ..Default::default()
    })
}

struct Foo {
    bar: Option<Gc<Bar>>,
}

unsafe impl Trace for Foo {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.bar.trace(vis);
    }
}
unsafe impl Finalize for Foo {}
impl Collectable for Foo {}

struct Bar {
    x: u32,
}

unsafe impl Trace for Bar {}
unsafe impl Finalize for Bar {}
impl Collectable for Bar {}

#[test]
fn single_object_evacuation() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    letroot!(foo = stack, heap.allocate(thread, Foo { bar: None }));
    foo.bar = Some(heap.allocate(thread, Bar { x: 420 }));
    let old_foo = foo.header() as usize;
    let old_bar = foo.bar.unwrap().header() as usize;

    heap.collect_garbage(thread, false);

    let new_foo = foo.header();
    let new_bar = foo.bar.unwrap().header();
    assert_ne!(new_foo as usize, old_foo);
    assert_ne!(new_bar as usize, old_bar);
    assert_eq!(foo.bar.unwrap().x, 420);
    // Both copies live in to-space; the old regions were released.
    assert_eq!(
        heap.region_space().get_region_type(new_foo),
        RegionType::ToSpace
    );
    assert_eq!(
        heap.region_space().get_region_type(old_foo as *mut _),
        RegionType::None
    );
    assert_eq!(heap.collector().objects_moved(), 2);
    // The color law held: nothing stays gray.
    unsafe {
        assert_eq!((*new_foo).rb_state(), RB_WHITE);
        assert_eq!((*new_bar).rb_state(), RB_WHITE);
    }

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn unevacuated_regions_mark_in_place() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    letroot!(foo = stack, heap.allocate(thread, Foo { bar: None }));
    // First cycle evacuates the freshly allocated region.
    heap.collect_garbage(thread, false);
    let addr_after_first = foo.header();

    // The survivor's region is no longer newly allocated, so a
    // non-forcing cycle marks it in place instead of copying.
    heap.collect_garbage_internal(thread, GcCause::Background, false);
    assert_eq!(foo.header(), addr_after_first);
    assert_eq!(
        heap.region_space().get_region_type(foo.header()),
        RegionType::ToSpace
    );

    heap.detach_current_thread(thread_ptr);
}

struct Holder {
    bar: Option<Gc<Bar>>,
}

unsafe impl Trace for Holder {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.bar.trace(vis);
    }
}
unsafe impl Finalize for Holder {}
impl Collectable for Holder {}

#[test]
fn dirty_immune_objects_keep_their_targets_alive() {
    let mut heap = test_heap();
    let mut holder = heap.allocate_in_boot_space(Holder { bar: None });
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };

    // The only path to bar is a field of an immune object; the write
    // barrier's dirty card is what keeps it alive.
    let bar = heap.allocate(thread, Bar { x: 31 });
    let old_bar = bar.header() as usize;
    holder.bar = Some(bar);
    heap.write_barrier(holder);

    heap.collect_garbage(thread, false);

    let new_bar = holder.bar.unwrap();
    assert_ne!(new_bar.header() as usize, old_bar);
    assert_eq!(new_bar.x, 31);
    unsafe {
        // The grayed immune object was whitened before marking ended.
        assert_eq!((*holder.header()).rb_state(), RB_WHITE);
        assert_eq!((*new_bar.header()).rb_state(), RB_WHITE);
    }

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn weak_reference_clears_when_referent_dies() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    let doomed = heap.allocate(thread, Bar { x: 7 });
    letroot!(
        weak = stack,
        heap.allocate_reference(thread, ReferenceKind::Weak, Some(doomed))
    );
    heap.collect_garbage(thread, false);

    assert!(weak.get_referent().is_none());
    let cleared = heap.collect_cleared_references();
    assert!(cleared.iter().any(|&r| r == weak.header()));

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn weak_reference_forwards_live_referent() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    letroot!(bar = stack, heap.allocate(thread, Bar { x: 5 }));
    letroot!(
        weak = stack,
        heap.allocate_reference(thread, ReferenceKind::Weak, Some(*bar))
    );
    heap.collect_garbage(thread, false);

    let referent = weak.get_referent().expect("rooted referent died");
    assert_eq!(referent.x, 5);
    assert_eq!(referent.header(), bar.header());

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn soft_references_survive_until_cleared() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    let value = heap.allocate(thread, Bar { x: 9 });
    letroot!(
        soft = stack,
        heap.allocate_reference(thread, ReferenceKind::Soft, Some(value))
    );

    // A normal cycle preserves soft referents even without strong roots.
    heap.collect_garbage(thread, false);
    assert_eq!(soft.get_referent().expect("soft referent dropped").x, 9);

    // Clearing soft references treats them like weak ones.
    heap.collect_garbage(thread, true);
    assert!(soft.get_referent().is_none());

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn finalizer_references_resurrect_their_referent() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    let doomed = heap.allocate(thread, Bar { x: 11 });
    letroot!(
        finalizer = stack,
        heap.allocate_reference(thread, ReferenceKind::Finalizer, Some(doomed))
    );
    heap.collect_garbage(thread, false);

    // The referent is kept alive for finalization and the reference was
    // handed to the cleared queue.
    assert_eq!(finalizer.get_referent().expect("referent lost").x, 11);
    let cleared = heap.collect_cleared_references();
    assert!(cleared.iter().any(|&r| r == finalizer.header()));

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn system_weaks_are_swept_and_forwarded() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    let dead = heap.new_weak(heap.allocate(thread, Bar { x: 1 }));
    letroot!(live = stack, heap.allocate(thread, Bar { x: 2 }));
    let forwarded = heap.new_weak(*live);

    heap.collect_garbage(thread, false);

    assert!(dead.upgrade().is_none());
    let upgraded = forwarded.upgrade().expect("live weak died");
    assert_eq!(upgraded.x, 2);
    assert_eq!(upgraded.header(), live.header());

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn large_objects_survive_without_moving() {
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };
    let stack = thread.shadow_stack();

    letroot!(big = stack, heap.allocate(thread, [0u64; 4096]));
    big[0] = 0xfeed;
    big[4095] = 0xbeef;
    let addr = big.header();

    heap.collect_garbage(thread, false);

    assert_eq!(big.header(), addr);
    assert_eq!(big[0], 0xfeed);
    assert_eq!(big[4095], 0xbeef);

    // An unreachable large object is reclaimed.
    let bytes_before = heap.large_object_space().bytes_allocated();
    heap.allocate(thread, [0u64; 4096]);
    heap.collect_garbage(thread, false);
    assert_eq!(heap.large_object_space().bytes_allocated(), bytes_before);

    heap.detach_current_thread(thread_ptr);
}

struct Node {
    value: u32,
    next: Option<Field<Node>>,
}

unsafe impl Trace for Node {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.next.trace(vis);
    }
}
unsafe impl Finalize for Node {}
impl Collectable for Node {}

#[test]
fn stop_running_threads() {
    const THREADS: usize = 8;
    const ITERATIONS: u32 = 10_000;
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };

    let counter = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let counter = counter.clone();
        handles.push(heap.spawn_mutator(move |mutator| {
            for i in 0..ITERATIONS {
                counter.fetch_add(1, Ordering::AcqRel);
                if i % 100 == 0 {
                    mutator.safepoint();
                }
            }
        }));
    }
    for _ in 0..3 {
        heap.collect_garbage(thread, false);
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), THREADS as u32 * ITERATIONS);

    heap.detach_current_thread(thread_ptr);
}

#[test]
fn concurrent_list_building_survives_collections() {
    const THREADS: usize = 4;
    const NODES: u32 = 4_000;
    let heap = test_heap();
    let thread_ptr = heap.attach_current_thread();
    let thread = unsafe { &*thread_ptr };

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        handles.push(heap.spawn_mutator(move |mutator| {
            let heap = mutator.heap();
            let stack = mutator.shadow_stack();
            letroot!(
                list = stack,
                heap.allocate(
                    mutator,
                    Node {
                        value: 0,
                        next: None,
                    },
                )
            );
            for i in 1..NODES {
                let node = heap.allocate(
                    mutator,
                    Node {
                        value: i,
                        next: Some(list.to_field()),
                    },
                );
                *list = node;
                if i % 64 == 0 {
                    mutator.safepoint();
                }
            }
            // Walk the chain with barriered loads; every value must be
            // intact and descending.
            let mut cur = Some(*list);
            let mut expect = NODES - 1;
            while let Some(node) = cur {
                assert_eq!(node.value, expect);
                expect = expect.wrapping_sub(1);
                cur = node.next.as_ref().map(|f| f.load());
            }
            assert_eq!(expect, u32::MAX);
        }));
    }
    for _ in 0..4 {
        heap.collect_garbage(thread, false);
        std::thread::yield_now();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(heap.collector().total_freed_objects() > 0 || heap.collector().objects_moved() > 0);

    heap.detach_current_thread(thread_ptr);
}
