use bolide::{
    api::{Collectable, Finalize, Gc, Trace, Visitor},
    heap::{Heap, HeapOptions},
    letroot,
    thread::Thread,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

struct TreeNode {
    left: Option<Gc<TreeNode>>,
    right: Option<Gc<TreeNode>>,
}

unsafe impl Trace for TreeNode {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        self.left.trace(vis);
        self.right.trace(vis);
    }
}
unsafe impl Finalize for TreeNode {}
impl Collectable for TreeNode {}

fn bottom_up_tree(thread: &Thread, depth: u32) -> Gc<TreeNode> {
    let heap = thread.heap();
    if depth == 0 {
        return heap.allocate(
            thread,
            TreeNode {
                left: None,
                right: None,
            },
        );
    }
    let stack = thread.shadow_stack();
    letroot!(left = stack, bottom_up_tree(thread, depth - 1));
    letroot!(right = stack, bottom_up_tree(thread, depth - 1));
    heap.allocate(
        thread,
        TreeNode {
            left: Some(*left),
            right: Some(*right),
        },
    )
}

fn item_check(node: Gc<TreeNode>) -> usize {
    match (node.left, node.right) {
        (Some(left), Some(right)) => 1 + item_check(left) + item_check(right),
        _ => 1,
    }
}

pub fn bench_gcs(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(10);

    for depth in [10u32, 12, 14] {
        group.bench_function(BenchmarkId::new("concurrent copying", depth), |b| {
            b.iter(|| {
                let heap = Heap::new(HeapOptions::default());
                let thread_ptr = heap.attach_current_thread();
                let thread = unsafe { &*thread_ptr };
                let stack = thread.shadow_stack();
                letroot!(tree = stack, bottom_up_tree(thread, depth));
                assert_eq!(item_check(*tree), (1usize << (depth + 1)) - 1);
                heap.collect_garbage(thread, false);
                assert_eq!(item_check(*tree), (1usize << (depth + 1)) - 1);
                drop(tree);
                heap.detach_current_thread(thread_ptr);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gcs);
criterion_main!(benches);
