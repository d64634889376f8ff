//! Kernel smoke tests
//!
//! The stock set of tests a playground page binds: an API support probe,
//! no-op dispatches of increasing size, buffer copies, thread attribute
//! checks and a threadgroup barrier check. [`register_all`] installs them
//! against a [`ComputeHost`].

use crate::gpu::{
    ComputeContext, ComputeHost, KernelSource, Size, COMMAND_ENCODER_INTERFACE,
    PIPELINE_STATE_INTERFACE, RENDERING_CONTEXT_INTERFACE,
};
use crate::playground::Playground;
use crate::registry::{TestFailure, TestRegistry};

/// Identifiers of every smoke test, in page order.
pub const TEST_IDS: [&str; 10] = [
    "browser_support",
    "simplest_kernel_1",
    "simplest_kernel_2",
    "simplest_kernel_3",
    "simplest_kernel_4",
    "simplest_kernel_5",
    "copy_kernel",
    "thread_position_qualifier1",
    "thread_position_qualifier2",
    "memory_barrier",
];

/// Grid / threadgroup sizes of `simplest_kernel_1` through `_5`.
const NOOP_DISPATCHES: [([u32; 3], [u32; 3]); 5] = [
    ([1, 1, 1], [1, 1, 1]),
    ([1, 1, 1], [8, 1, 1]),
    ([1, 1, 1], [8, 8, 1]),
    ([1, 1, 1], [8, 8, 8]),
    ([8, 1, 1], [1024, 1, 1]),
];

const NOOP_SOURCE: &str = "void kernel noop(){}";

const COPY_SOURCE: &str = r#"
kernel void copy(const device float *A[[buffer(0)]],
                 device float *B[[buffer(1)]])
{
    for (int i = 0; i < 100; i++)
        B[i] = A[i];
}
"#;

const POSITION_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

kernel void copy(device float *A[[buffer(0)]],
                 uint3 thread_position_in_grid[[thread_position_in_grid]],
                 uint3 thread_position_in_threadgroup[[thread_position_in_threadgroup]],
                 uint thread_index_in_threadgroup[[thread_index_in_threadgroup]],
                 uint3 threadgroup_position_in_grid[[threadgroup_position_in_grid]],
                 uint3 threads_per_grid[[threads_per_grid]],
                 uint3 threads_per_threadgroup[[threads_per_threadgroup]],
                 uint3 threadgroups_per_grid[[threadgroups_per_grid]],
                 uint thread_execution_width[[thread_execution_width]])
{
    if (thread_position_in_grid[0] != 9 ||
        thread_position_in_grid[1] != 17 ||
        thread_position_in_grid[2] != 27) return;

    // A[0..19] = every attribute above, component by component.
}
"#;

const STRIDE_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

kernel void copy(const device float *A[[buffer(0)]],
                 device float *B[[buffer(1)]],
                 uint gid[[thread_position_in_grid]],
                 uint num_threads[[threads_per_grid]])
{
    for (uint i = gid; i < 4096; i += num_threads)
        B[i] = A[i];
}
"#;

const BARRIER_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

kernel void copy(device float *A[[buffer(0)]],
                 uint gid[[thread_position_in_grid]])
{
    for (uint i = 0; i < 4; i++) {
        uint pos = i * 1024 + gid;
        float v = (pos < 4095) ? A[pos + 1] : 0;
        threadgroup_barrier(mem_flags::mem_device);
        if (pos < 4095) A[pos] = v;
    }
}
"#;

type TestResult = Result<(), TestFailure>;

/// Register every smoke test in `registry`, bound to `host`.
pub fn register_all(registry: &TestRegistry, host: &ComputeHost) {
    let probe = host.clone();
    registry.register("browser_support", move |playground| {
        browser_support(probe.clone(), playground)
    });

    for (n, (grid, group)) in NOOP_DISPATCHES.into_iter().enumerate() {
        let host = host.clone();
        registry.register(format!("simplest_kernel_{}", n + 1), move |_| {
            run_noop_kernel(host.clone(), grid.into(), group.into())
        });
    }

    let copy = host.clone();
    registry.register("copy_kernel", move |_| copy_kernel(copy.clone()));

    let position = host.clone();
    registry.register("thread_position_qualifier1", move |playground| {
        thread_position_qualifier1(position.clone(), playground)
    });

    let stride = host.clone();
    registry.register("thread_position_qualifier2", move |_| {
        thread_position_qualifier2(stride.clone())
    });

    let barrier = host.clone();
    registry.register("memory_barrier", move |_| memory_barrier(barrier.clone()));
}

fn context(host: &ComputeHost) -> Result<ComputeContext, TestFailure> {
    host.create_context()
        .ok_or_else(|| TestFailure::new("WebGPURenderingContext initialization failed."))
}

async fn browser_support(host: ComputeHost, playground: Playground) -> TestResult {
    let mut missing = None;
    for (interface, failure) in [
        (RENDERING_CONTEXT_INTERFACE, "WebGPU is not supported."),
        (PIPELINE_STATE_INTERFACE, "WebGPUComputePipelineState is not supported."),
        (COMMAND_ENCODER_INTERFACE, "isComputeCommandEncoder is not supported."),
    ] {
        let supported = host.supports(interface);
        playground.print(format!("('{}' in window) == {}", interface, supported));
        if !supported && missing.is_none() {
            missing = Some(failure);
        }
    }
    match missing {
        Some(failure) => Err(TestFailure::new(failure)),
        None => Ok(()),
    }
}

async fn run_noop_kernel(host: ComputeHost, grid: Size, group: Size) -> TestResult {
    let ctx = context(&host)?;
    let library = ctx.create_library(KernelSource::new(NOOP_SOURCE).entry("noop", |_, _| async {}))?;
    let pipeline = ctx.create_compute_pipeline_state(&library.function_with_name("noop")?)?;

    let mut command_buffer = ctx.create_command_queue().create_command_buffer();
    let mut encoder = command_buffer.compute_command_encoder();
    encoder.set_compute_pipeline_state(&pipeline);
    encoder.dispatch(grid, group)?;
    encoder.end_encoding();

    command_buffer.commit().await?;
    Ok(())
}

async fn copy_kernel(host: ComputeHost) -> TestResult {
    let ctx = context(&host)?;
    let source = KernelSource::new(COPY_SOURCE).entry("copy", |_, args| async move {
        for i in 0..100 {
            args.write(1, i, args.read(0, i));
        }
    });
    let library = ctx.create_library(source)?;
    let pipeline = ctx.create_compute_pipeline_state(&library.function_with_name("copy")?)?;

    let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let a = ctx.create_buffer(&input)?;
    let b = ctx.create_buffer(&[0.0; 100])?;

    let mut command_buffer = ctx.create_command_queue().create_command_buffer();
    let mut encoder = command_buffer.compute_command_encoder();
    encoder.set_compute_pipeline_state(&pipeline);
    encoder.set_buffer(&a, 0, 0)?;
    encoder.set_buffer(&b, 0, 1)?;
    encoder.dispatch(Size::new(1, 1, 1), Size::new(1, 1, 1))?;
    encoder.end_encoding();
    command_buffer.commit().await?;

    assert_copied(&a.contents(), &b.contents())
}

async fn thread_position_qualifier1(host: ComputeHost, playground: Playground) -> TestResult {
    let ctx = context(&host)?;
    let source = KernelSource::new(POSITION_SOURCE).entry("copy", |thread, args| async move {
        if thread.thread_position_in_grid != [9, 17, 27] {
            return;
        }
        let values = thread
            .thread_position_in_grid
            .into_iter()
            .chain(thread.thread_position_in_threadgroup)
            .chain([thread.thread_index_in_threadgroup])
            .chain(thread.threadgroup_position_in_grid)
            .chain(thread.threads_per_grid)
            .chain(thread.threads_per_threadgroup)
            .chain(thread.threadgroups_per_grid)
            .chain([thread.thread_execution_width]);
        for (i, value) in values.enumerate() {
            args.write(0, i, value as f32);
        }
    });
    let library = ctx.create_library(source)?;
    let pipeline = ctx.create_compute_pipeline_state(&library.function_with_name("copy")?)?;
    let a = ctx.create_buffer(&[0.0; 20])?;

    let mut command_buffer = ctx.create_command_queue().create_command_buffer();
    let mut encoder = command_buffer.compute_command_encoder();
    encoder.set_compute_pipeline_state(&pipeline);
    encoder.set_buffer(&a, 0, 0)?;
    encoder.dispatch(Size::new(2, 3, 4), Size::new(5, 6, 7))?;
    encoder.end_encoding();
    command_buffer.commit().await?;

    let expected: [f32; 20] = [
        (2 * 5 - 1) as f32,
        (3 * 6 - 1) as f32,
        (4 * 7 - 1) as f32,
        4.0,
        5.0,
        6.0,
        (5 * 6 * 7 - 1) as f32,
        1.0,
        2.0,
        3.0,
        (2 * 5) as f32,
        (3 * 6) as f32,
        (4 * 7) as f32,
        5.0,
        6.0,
        7.0,
        2.0,
        3.0,
        4.0,
        32.0,
    ];
    let actual = a.contents();
    for (i, value) in actual.iter().enumerate() {
        playground.print(format!("A[{}] = {}", i, value));
    }
    for (i, (value, expect)) in actual.iter().zip(expected).enumerate() {
        if *value != expect {
            return Err(TestFailure::new(format!(
                "Assertion failed: A[{}](={}) !== {}",
                i, value, expect
            )));
        }
    }
    Ok(())
}

async fn thread_position_qualifier2(host: ComputeHost) -> TestResult {
    let ctx = context(&host)?;
    let source = KernelSource::new(STRIDE_SOURCE).entry("copy", |thread, args| async move {
        let gid = thread.thread_position_in_grid[0] as usize;
        let num_threads = thread.threads_per_grid[0] as usize;
        for i in (gid..4096).step_by(num_threads) {
            args.write(1, i, args.read(0, i));
        }
    });
    let library = ctx.create_library(source)?;
    let pipeline = ctx.create_compute_pipeline_state(&library.function_with_name("copy")?)?;

    let input: Vec<f32> = (0..4096).map(|i| i as f32).collect();
    let a = ctx.create_buffer(&input)?;
    let b = ctx.create_buffer(&vec![0.0; 4096])?;

    let mut command_buffer = ctx.create_command_queue().create_command_buffer();
    let mut encoder = command_buffer.compute_command_encoder();
    encoder.set_compute_pipeline_state(&pipeline);
    encoder.set_buffer(&a, 0, 0)?;
    encoder.set_buffer(&b, 0, 1)?;
    encoder.dispatch(Size::new(1, 1, 1), Size::new(8, 1, 1))?;
    encoder.end_encoding();
    command_buffer.commit().await?;

    assert_copied(&a.contents(), &b.contents())
}

async fn memory_barrier(host: ComputeHost) -> TestResult {
    let ctx = context(&host)?;
    let source = KernelSource::new(BARRIER_SOURCE).entry("copy", |thread, args| async move {
        let gid = thread.thread_position_in_grid[0] as usize;
        for round in 0..4 {
            let pos = round * 1024 + gid;
            let v = if pos < 4095 { args.read(0, pos + 1) } else { 0.0 };
            args.threadgroup_barrier().await;
            if pos < 4095 {
                args.write(0, pos, v);
            }
        }
    });
    let library = ctx.create_library(source)?;
    let pipeline = ctx.create_compute_pipeline_state(&library.function_with_name("copy")?)?;

    let input: Vec<f32> = (0..4096).map(|i| i as f32).collect();
    let a = ctx.create_buffer(&input)?;

    let mut command_buffer = ctx.create_command_queue().create_command_buffer();
    let mut encoder = command_buffer.compute_command_encoder();
    encoder.set_compute_pipeline_state(&pipeline);
    encoder.set_buffer(&a, 0, 0)?;
    encoder.dispatch(Size::new(1, 1, 1), Size::new(1024, 1, 1))?;
    encoder.end_encoding();
    command_buffer.commit().await?;

    let shifted = a.contents();
    for i in 1..4095 {
        if shifted[i - 1] != i as f32 {
            return Err(TestFailure::new(format!(
                "Assertion failed: A[{} - 1](={}) !== {}",
                i,
                shifted[i - 1],
                i
            )));
        }
    }
    Ok(())
}

fn assert_copied(a: &[f32], b: &[f32]) -> TestResult {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        if x != y {
            return Err(TestFailure::new(format!(
                "Assertion failed: A[{}](={}) !== B[{}](={})",
                i, x, i, y
            )));
        }
    }
    Ok(())
}
