//! The stock kernel smoke tests, run through real controllers.

mod common;

use common::ready_playground;
use futures::executor::LocalPool;
use kernel_playground::gpu::{ComputeHost, ComputeLimits};
use kernel_playground::prelude::*;
use pretty_assertions::assert_eq;
use std::rc::Rc;

fn registry(host: &ComputeHost) -> Rc<TestRegistry> {
    let registry = Rc::new(TestRegistry::new());
    smoke::register_all(&registry, host);
    registry
}

fn run_one(host: &ComputeHost, test_id: &str) -> (Option<RunResult>, String) {
    let mut pool = LocalPool::new();
    let playground = ready_playground(&mut pool, registry(host), test_id);
    let result = pool.run_until(playground.run());
    (result, playground.log_text())
}

#[test]
fn test_every_smoke_test_passes_on_simulated_device() {
    let host = ComputeHost::simulated();
    for id in smoke::TEST_IDS {
        let (result, log) = run_one(&host, id);
        assert_eq!(result, Some(RunResult::Success), "{} failed:\n{}", id, log);
    }
}

#[test]
fn test_browser_support_prints_probes() {
    let (result, log) = run_one(&ComputeHost::simulated(), "browser_support");
    assert_eq!(result, Some(RunResult::Success));
    assert_eq!(
        log,
        "('WebGPURenderingContext' in window) == true\n\
         ('WebGPUComputePipelineState' in window) == true\n\
         ('WebGPUComputeCommandEncoder' in window) == true\n"
    );
}

#[test]
fn test_browser_support_reports_first_missing_interface() {
    let host = ComputeHost::with_interfaces(
        ["WebGPURenderingContext", "WebGPUComputePipelineState"],
        ComputeLimits::default(),
    );
    let (result, log) = run_one(&host, "browser_support");
    assert_eq!(result, Some(RunResult::Failed));
    assert_eq!(
        log.lines().last(),
        Some("isComputeCommandEncoder is not supported.")
    );

    let (_, log) = run_one(&ComputeHost::unsupported(), "browser_support");
    assert_eq!(log.lines().last(), Some("WebGPU is not supported."));
}

#[test]
fn test_kernels_fail_without_context() {
    let host = ComputeHost::unsupported();
    for id in smoke::TEST_IDS.iter().filter(|id| **id != "browser_support") {
        let (result, log) = run_one(&host, id);
        assert_eq!(result, Some(RunResult::Failed));
        assert_eq!(log, "WebGPURenderingContext initialization failed.\n", "{}", id);
    }
}

#[test]
fn test_thread_position_qualifier1_prints_attributes() {
    let (result, log) = run_one(&ComputeHost::simulated(), "thread_position_qualifier1");
    assert_eq!(result, Some(RunResult::Success));
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 20);
    assert_eq!(lines[0], "A[0] = 9");
    assert_eq!(lines[6], "A[6] = 209");
    assert_eq!(lines[19], "A[19] = 32");
}

#[test]
fn test_thread_position_qualifier1_checks_execution_width() {
    let limits = ComputeLimits {
        thread_execution_width: 64,
        ..ComputeLimits::default()
    };
    let (result, log) = run_one(&ComputeHost::with_limits(limits), "thread_position_qualifier1");
    assert_eq!(result, Some(RunResult::Failed));
    assert_eq!(log.lines().last(), Some("Assertion failed: A[19](=64) !== 32"));
}

#[test]
fn test_dispatch_beyond_limits_fails_the_run() {
    let limits = ComputeLimits {
        max_threads_per_threadgroup: 512,
        ..ComputeLimits::default()
    };
    let host = ComputeHost::with_limits(limits);
    let (result, log) = run_one(&host, "simplest_kernel_5");
    assert_eq!(result, Some(RunResult::Failed));
    assert_eq!(
        log,
        "Threadgroup of 1024 threads exceeds the limit of 512.\n"
    );
    let (result, _) = run_one(&host, "simplest_kernel_4");
    assert_eq!(result, Some(RunResult::Success));
}
