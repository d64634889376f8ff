//! Simulated compute device
//!
//! Provides the experimental browser compute API that the smoke tests drive
//! (`createLibrary`, `createComputePipelineState`, command queues, command
//! buffers, compute command encoders, `dispatch`, `commit`) with a CPU
//! backend. The API surface keeps the browser's shape so that the test
//! bodies read the same as they would against real hardware.
//!
//! The CPU cannot compile kernel source text, so a [`KernelSource`] carries
//! the text together with a host implementation of each entry point. The
//! text is still scanned for `kernel` declarations, and an entry point that
//! the text does not declare is rejected.
//!
//! Each threadgroup executes its threads as cooperative futures, which lets
//! [`KernelArgs::threadgroup_barrier`] suspend a thread until its whole group
//! has arrived. Every thread of a group must reach each barrier.

mod barrier;

pub use barrier::{Barrier, BarrierWait};

use futures::future::{join_all, FutureExt, LocalBoxFuture};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

/// Interface name probed for the rendering context.
pub const RENDERING_CONTEXT_INTERFACE: &str = "WebGPURenderingContext";
/// Interface name probed for compute pipeline states.
pub const PIPELINE_STATE_INTERFACE: &str = "WebGPUComputePipelineState";
/// Interface name probed for compute command encoders.
pub const COMMAND_ENCODER_INTERFACE: &str = "WebGPUComputeCommandEncoder";

static KERNEL_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:kernel\s+void|void\s+kernel)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
        .expect("kernel declaration pattern is valid")
});

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by the compute device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("Entry point '{name}' is not declared in the kernel source.")]
    UndeclaredEntryPoint { name: String },

    #[error("Function '{name}' is not found in the library.")]
    UnknownFunction { name: String },

    #[error("Function '{name}' has no host implementation.")]
    MissingHostImplementation { name: String },

    #[error("Buffer of {len} elements exceeds the limit of {limit}.")]
    BufferTooLarge { len: usize, limit: usize },

    #[error("No compute pipeline state is set.")]
    NoPipelineState,

    #[error("Dispatch size {0} has a zero dimension.")]
    EmptyDispatch(Size),

    #[error("Threadgroup of {threads} threads exceeds the limit of {limit}.")]
    ThreadgroupTooLarge { threads: u64, limit: u32 },

    #[error("{count} threadgroups in one dimension exceeds the limit of {limit}.")]
    GridTooLarge { count: u32, limit: u32 },

    #[error("Grid of {threadgroups} threadgroups of {threads_per_threadgroup} threads overflows a 32-bit thread position.")]
    GridExtentOverflow {
        threadgroups: Size,
        threads_per_threadgroup: Size,
    },

    #[error("Buffer index {index} exceeds the {slots} available slots.")]
    BufferIndexOutOfRange { index: usize, slots: u32 },

    #[error("Buffer offset {offset} is unaligned or past the end of a {len}-byte buffer.")]
    BadOffset { offset: usize, len: usize },

    #[error("No buffer is bound at index {index}.")]
    UnboundBuffer { index: usize },

    #[error("Buffer {index} accessed at element {element}; {len} elements are visible.")]
    OutOfBounds {
        index: usize,
        element: usize,
        len: usize,
    },
}

// ---------------------------------------------------------------------------
// Sizes / limits / stats
// ---------------------------------------------------------------------------

/// A three-dimensional extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Number of cells covered, saturating at `u64::MAX`.
    pub fn count(&self) -> u64 {
        (self.width as u64)
            .saturating_mul(self.height as u64)
            .saturating_mul(self.depth as u64)
    }

    pub fn to_array(self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    fn has_zero(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }
}

impl From<[u32; 3]> for Size {
    fn from([width, height, depth]: [u32; 3]) -> Self {
        Self::new(width, height, depth)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

/// Device limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeLimits {
    pub max_threads_per_threadgroup: u32,
    pub max_threadgroups_per_dimension: u32,
    /// SIMD width reported to kernels.
    pub thread_execution_width: u32,
    pub max_buffer_bindings: u32,
    /// Maximum buffer length, in `f32` elements.
    pub max_buffer_length: usize,
}

impl Default for ComputeLimits {
    fn default() -> Self {
        Self {
            max_threads_per_threadgroup: 1024,
            max_threadgroups_per_dimension: 65535,
            thread_execution_width: 32,
            max_buffer_bindings: 31,
            max_buffer_length: 64 * 1024 * 1024,
        }
    }
}

/// Cumulative statistics for one context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuStats {
    pub libraries_created: u64,
    pub pipelines_created: u64,
    pub buffers_created: u64,
    pub command_buffers_committed: u64,
    pub dispatches: u64,
    pub threadgroups_executed: u64,
    pub threads_executed: u64,
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// The environment a test probes for compute support.
#[derive(Debug, Clone)]
pub struct ComputeHost {
    interfaces: Vec<String>,
    limits: ComputeLimits,
}

impl ComputeHost {
    /// A host exposing every interface, backed by the CPU device.
    pub fn simulated() -> Self {
        Self::with_limits(ComputeLimits::default())
    }

    pub fn with_limits(limits: ComputeLimits) -> Self {
        Self::with_interfaces(
            [
                RENDERING_CONTEXT_INTERFACE,
                PIPELINE_STATE_INTERFACE,
                COMMAND_ENCODER_INTERFACE,
            ],
            limits,
        )
    }

    /// A host without any compute interface.
    pub fn unsupported() -> Self {
        Self::with_interfaces(Vec::<String>::new(), ComputeLimits::default())
    }

    pub fn with_interfaces<I, S>(interfaces: I, limits: ComputeLimits) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            interfaces: interfaces.into_iter().map(Into::into).collect(),
            limits,
        }
    }

    /// Whether the named interface exists (`'<name>' in window`).
    pub fn supports(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    pub fn limits(&self) -> &ComputeLimits {
        &self.limits
    }

    /// Create a fresh device context, or `None` without a rendering context.
    pub fn create_context(&self) -> Option<ComputeContext> {
        self.supports(RENDERING_CONTEXT_INTERFACE)
            .then(|| ComputeContext::new(self.limits.clone()))
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// Future produced by one kernel thread.
pub type KernelFuture = LocalBoxFuture<'static, ()>;

type KernelFn = Rc<dyn Fn(ThreadPosition, KernelArgs) -> KernelFuture>;

/// Built-in thread attributes, as seen by one kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPosition {
    pub thread_position_in_grid: [u32; 3],
    pub thread_position_in_threadgroup: [u32; 3],
    pub thread_index_in_threadgroup: u32,
    pub threadgroup_position_in_grid: [u32; 3],
    pub threads_per_grid: [u32; 3],
    pub threads_per_threadgroup: [u32; 3],
    pub threadgroups_per_grid: [u32; 3],
    pub thread_execution_width: u32,
}

#[derive(Clone)]
struct Binding {
    data: Rc<RefCell<Vec<f32>>>,
    /// Offset in elements.
    offset: usize,
}

/// Buffers and synchronisation available to a kernel thread.
///
/// Accesses outside a bound buffer, or to an empty slot, do not panic: the
/// first such fault is recorded and fails the dispatch once the threadgroup
/// finishes. Faulting reads yield `0.0`; faulting writes are dropped.
#[derive(Clone)]
pub struct KernelArgs {
    bindings: Rc<[Option<Binding>]>,
    barrier: Barrier,
    fault: Rc<RefCell<Option<GpuError>>>,
}

impl KernelArgs {
    pub fn read(&self, index: usize, element: usize) -> f32 {
        self.locate(index, element)
            .map(|(binding, at)| binding.data.borrow()[at])
            .unwrap_or(0.0)
    }

    pub fn write(&self, index: usize, element: usize, value: f32) {
        if let Some((binding, at)) = self.locate(index, element) {
            binding.data.borrow_mut()[at] = value;
        }
    }

    /// Elements visible through slot `index` (zero when unbound).
    pub fn buffer_len(&self, index: usize) -> usize {
        match self.bindings.get(index).and_then(Option::as_ref) {
            Some(binding) => binding.data.borrow().len().saturating_sub(binding.offset),
            None => 0,
        }
    }

    /// `threadgroup_barrier`: resolves once every thread of the group arrives.
    pub fn threadgroup_barrier(&self) -> BarrierWait {
        self.barrier.wait()
    }

    fn locate(&self, index: usize, element: usize) -> Option<(&Binding, usize)> {
        let Some(binding) = self.bindings.get(index).and_then(Option::as_ref) else {
            self.record(GpuError::UnboundBuffer { index });
            return None;
        };
        let len = binding.data.borrow().len().saturating_sub(binding.offset);
        if element >= len {
            self.record(GpuError::OutOfBounds {
                index,
                element,
                len,
            });
            return None;
        }
        Some((binding, binding.offset + element))
    }

    fn record(&self, err: GpuError) {
        let mut fault = self.fault.borrow_mut();
        if fault.is_none() {
            *fault = Some(err);
        }
    }
}

/// Kernel source text plus host implementations of its entry points.
pub struct KernelSource {
    text: String,
    entries: Vec<(String, KernelFn)>,
}

impl fmt::Debug for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSource")
            .field("text", &self.text)
            .field("entries", &self.entries.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl KernelSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entries: Vec::new(),
        }
    }

    /// Attach the host implementation of entry point `name`.
    pub fn entry<F, Fut>(mut self, name: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(ThreadPosition, KernelArgs) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let kernel: KernelFn = Rc::new(move |thread, args| kernel(thread, args).boxed_local());
        self.entries.push((name.into(), kernel));
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Names of the kernel functions declared in `text`, in source order.
pub fn declared_kernels(text: &str) -> Vec<String> {
    KERNEL_DECLARATION
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// A compiled kernel library.
#[derive(Clone)]
pub struct Library {
    functions: Rc<Vec<(String, Option<KernelFn>)>>,
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("functions", &self.function_names())
            .finish()
    }
}

impl Library {
    pub fn function_names(&self) -> Vec<String> {
        self.functions.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn function_with_name(&self, name: &str) -> Result<KernelFunction, GpuError> {
        let (_, kernel) = self
            .functions
            .iter()
            .find(|(declared, _)| declared == name)
            .ok_or_else(|| GpuError::UnknownFunction {
                name: name.to_string(),
            })?;
        let kernel = kernel
            .clone()
            .ok_or_else(|| GpuError::MissingHostImplementation {
                name: name.to_string(),
            })?;
        Ok(KernelFunction {
            name: name.to_string(),
            kernel,
        })
    }
}

/// One entry point of a [`Library`].
#[derive(Clone)]
pub struct KernelFunction {
    name: String,
    kernel: KernelFn,
}

impl fmt::Debug for KernelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelFunction").field("name", &self.name).finish()
    }
}

impl KernelFunction {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A function ready for dispatch.
#[derive(Debug, Clone)]
pub struct PipelineState {
    id: u64,
    function: KernelFunction,
}

impl PipelineState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn function_name(&self) -> &str {
        self.function.name()
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// Device memory holding `f32` values. Clones share storage.
#[derive(Debug, Clone)]
pub struct Buffer {
    id: u64,
    data: Rc<RefCell<Vec<f32>>>,
}

impl Buffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the buffer contents.
    pub fn contents(&self) -> Vec<f32> {
        self.data.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }
}

// ---------------------------------------------------------------------------
// ComputeContext
// ---------------------------------------------------------------------------

struct Device {
    limits: ComputeLimits,
    stats: RefCell<GpuStats>,
    next_id: Cell<u64>,
}

impl Device {
    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }
}

/// A device context obtained from a [`ComputeHost`].
#[derive(Clone)]
pub struct ComputeContext {
    device: Rc<Device>,
}

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("limits", &self.device.limits)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ComputeContext {
    pub fn new(limits: ComputeLimits) -> Self {
        Self {
            device: Rc::new(Device {
                limits,
                stats: RefCell::new(GpuStats::default()),
                next_id: Cell::new(1),
            }),
        }
    }

    pub fn limits(&self) -> &ComputeLimits {
        &self.device.limits
    }

    pub fn stats(&self) -> GpuStats {
        self.device.stats.borrow().clone()
    }

    /// Compile `source` into a library.
    ///
    /// Every declared kernel becomes a library function; entries without a
    /// matching declaration are rejected.
    pub fn create_library(&self, source: KernelSource) -> Result<Library, GpuError> {
        let declared = declared_kernels(&source.text);
        for (name, _) in &source.entries {
            if !declared.contains(name) {
                return Err(GpuError::UndeclaredEntryPoint { name: name.clone() });
            }
        }
        let functions = declared
            .into_iter()
            .map(|name| {
                let kernel = source
                    .entries
                    .iter()
                    .find(|(entry, _)| *entry == name)
                    .map(|(_, kernel)| Rc::clone(kernel));
                (name, kernel)
            })
            .collect::<Vec<_>>();
        let names: Vec<&str> = functions.iter().map(|(name, _)| name.as_str()).collect();
        debug!(functions = ?names, "library created");
        self.device.stats.borrow_mut().libraries_created += 1;
        Ok(Library {
            functions: Rc::new(functions),
        })
    }

    pub fn create_compute_pipeline_state(
        &self,
        function: &KernelFunction,
    ) -> Result<PipelineState, GpuError> {
        let id = self.device.next_id();
        self.device.stats.borrow_mut().pipelines_created += 1;
        debug!(id, function = %function.name, "pipeline state created");
        Ok(PipelineState {
            id,
            function: function.clone(),
        })
    }

    /// Allocate a buffer initialised with a copy of `data`.
    pub fn create_buffer(&self, data: &[f32]) -> Result<Buffer, GpuError> {
        let limit = self.device.limits.max_buffer_length;
        if data.len() > limit {
            return Err(GpuError::BufferTooLarge {
                len: data.len(),
                limit,
            });
        }
        self.device.stats.borrow_mut().buffers_created += 1;
        Ok(Buffer {
            id: self.device.next_id(),
            data: Rc::new(RefCell::new(data.to_vec())),
        })
    }

    pub fn create_command_queue(&self) -> CommandQueue {
        CommandQueue {
            device: Rc::clone(&self.device),
        }
    }
}

// ---------------------------------------------------------------------------
// Command submission
// ---------------------------------------------------------------------------

/// Creates command buffers for one context.
#[derive(Clone)]
pub struct CommandQueue {
    device: Rc<Device>,
}

impl CommandQueue {
    pub fn create_command_buffer(&self) -> CommandBuffer {
        CommandBuffer {
            device: Rc::clone(&self.device),
            commands: Vec::new(),
        }
    }
}

struct DispatchCommand {
    function: KernelFunction,
    bindings: Rc<[Option<Binding>]>,
    threadgroups: Size,
    threads_per_threadgroup: Size,
}

/// Resolves once every dispatch of a committed command buffer has run.
pub type Completion = LocalBoxFuture<'static, Result<(), GpuError>>;

/// An ordered list of encoded dispatches.
pub struct CommandBuffer {
    device: Rc<Device>,
    commands: Vec<DispatchCommand>,
}

impl CommandBuffer {
    pub fn compute_command_encoder(&mut self) -> ComputeCommandEncoder<'_> {
        ComputeCommandEncoder {
            command_buffer: self,
            pipeline: None,
            bindings: Vec::new(),
            encoded: Vec::new(),
        }
    }

    /// Number of dispatches encoded so far.
    pub fn dispatch_count(&self) -> usize {
        self.commands.len()
    }

    /// Submit the buffer. The encoded work executes as the returned future
    /// is polled, dispatches in encoding order.
    pub fn commit(self) -> Completion {
        let device = self.device;
        let commands = self.commands;
        device.stats.borrow_mut().command_buffers_committed += 1;
        async move {
            for command in commands {
                execute(&device, command).await?;
            }
            Ok(())
        }
        .boxed_local()
    }
}

/// Records dispatches into a [`CommandBuffer`].
///
/// Dispatches reach the command buffer only through
/// [`end_encoding`](ComputeCommandEncoder::end_encoding).
pub struct ComputeCommandEncoder<'a> {
    command_buffer: &'a mut CommandBuffer,
    pipeline: Option<PipelineState>,
    bindings: Vec<Option<Binding>>,
    encoded: Vec<DispatchCommand>,
}

impl ComputeCommandEncoder<'_> {
    pub fn set_compute_pipeline_state(&mut self, pipeline: &PipelineState) {
        self.pipeline = Some(pipeline.clone());
    }

    /// Bind `buffer` at slot `index`, starting `offset` bytes in.
    pub fn set_buffer(&mut self, buffer: &Buffer, offset: usize, index: usize) -> Result<(), GpuError> {
        let slots = self.command_buffer.device.limits.max_buffer_bindings;
        if index >= slots as usize {
            return Err(GpuError::BufferIndexOutOfRange { index, slots });
        }
        let element = std::mem::size_of::<f32>();
        if offset % element != 0 || offset > buffer.byte_len() {
            return Err(GpuError::BadOffset {
                offset,
                len: buffer.byte_len(),
            });
        }
        if self.bindings.len() <= index {
            self.bindings.resize(index + 1, None);
        }
        self.bindings[index] = Some(Binding {
            data: Rc::clone(&buffer.data),
            offset: offset / element,
        });
        Ok(())
    }

    /// Encode a dispatch of `threadgroups` groups of `threads_per_threadgroup`
    /// threads each, using the current pipeline state and bindings.
    pub fn dispatch(&mut self, threadgroups: Size, threads_per_threadgroup: Size) -> Result<(), GpuError> {
        let limits = &self.command_buffer.device.limits;
        let pipeline = self.pipeline.as_ref().ok_or(GpuError::NoPipelineState)?;
        for size in [threadgroups, threads_per_threadgroup] {
            if size.has_zero() {
                return Err(GpuError::EmptyDispatch(size));
            }
        }
        let threads = threads_per_threadgroup.count();
        if threads > limits.max_threads_per_threadgroup as u64 {
            return Err(GpuError::ThreadgroupTooLarge {
                threads,
                limit: limits.max_threads_per_threadgroup,
            });
        }
        if let Some(&count) = threadgroups
            .to_array()
            .iter()
            .find(|&&count| count > limits.max_threadgroups_per_dimension)
        {
            return Err(GpuError::GridTooLarge {
                count,
                limit: limits.max_threadgroups_per_dimension,
            });
        }
        let mut extents = threadgroups
            .to_array()
            .into_iter()
            .zip(threads_per_threadgroup.to_array());
        if extents.any(|(groups, threads)| groups.checked_mul(threads).is_none()) {
            return Err(GpuError::GridExtentOverflow {
                threadgroups,
                threads_per_threadgroup,
            });
        }
        debug!(
            function = %pipeline.function.name,
            %threadgroups,
            %threads_per_threadgroup,
            "dispatch encoded"
        );
        self.encoded.push(DispatchCommand {
            function: pipeline.function.clone(),
            bindings: Rc::from(self.bindings.clone()),
            threadgroups,
            threads_per_threadgroup,
        });
        Ok(())
    }

    pub fn end_encoding(self) {
        self.command_buffer.commands.extend(self.encoded);
    }
}

async fn execute(device: &Device, command: DispatchCommand) -> Result<(), GpuError> {
    let groups = command.threadgroups;
    let local = command.threads_per_threadgroup;
    let width = device.limits.thread_execution_width;
    let fault = Rc::new(RefCell::new(None));
    let threads_per_grid = [
        groups.width * local.width,
        groups.height * local.height,
        groups.depth * local.depth,
    ];

    for gz in 0..groups.depth {
        for gy in 0..groups.height {
            for gx in 0..groups.width {
                let barrier = Barrier::new(local.count() as usize);
                let mut threads = Vec::with_capacity(local.count() as usize);
                for lz in 0..local.depth {
                    for ly in 0..local.height {
                        for lx in 0..local.width {
                            let position = ThreadPosition {
                                thread_position_in_grid: [
                                    gx * local.width + lx,
                                    gy * local.height + ly,
                                    gz * local.depth + lz,
                                ],
                                thread_position_in_threadgroup: [lx, ly, lz],
                                thread_index_in_threadgroup: (lz * local.height + ly) * local.width
                                    + lx,
                                threadgroup_position_in_grid: [gx, gy, gz],
                                threads_per_grid,
                                threads_per_threadgroup: local.to_array(),
                                threadgroups_per_grid: groups.to_array(),
                                thread_execution_width: width,
                            };
                            let args = KernelArgs {
                                bindings: Rc::clone(&command.bindings),
                                barrier: barrier.clone(),
                                fault: Rc::clone(&fault),
                            };
                            threads.push((command.function.kernel)(position, args));
                        }
                    }
                }
                join_all(threads).await;
                if let Some(err) = fault.borrow_mut().take() {
                    return Err(err);
                }
            }
        }
    }

    let mut stats = device.stats.borrow_mut();
    stats.dispatches += 1;
    stats.threadgroups_executed = stats.threadgroups_executed.saturating_add(groups.count());
    stats.threads_executed = stats
        .threads_executed
        .saturating_add(groups.count().saturating_mul(local.count()));
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    const COPY_SOURCE: &str = "kernel void copy(const device float *A[[buffer(0)]], device float *B[[buffer(1)]]) {}";

    fn copy_library(ctx: &ComputeContext) -> Library {
        let source = KernelSource::new(COPY_SOURCE).entry("copy", |thread, args| async move {
            let i = thread.thread_position_in_grid[0] as usize;
            args.write(1, i, args.read(0, i));
        });
        ctx.create_library(source).unwrap()
    }

    #[test]
    fn test_declared_kernels_both_orders() {
        let text = "void kernel noop(){}\nkernel void copy(device float *A) {}\nvoid helper() {}";
        assert_eq!(declared_kernels(text), vec!["noop", "copy"]);
    }

    #[test]
    fn test_undeclared_entry_point_rejected() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let source = KernelSource::new("void kernel noop(){}").entry("other", |_, _| async {});
        assert_eq!(
            ctx.create_library(source).unwrap_err(),
            GpuError::UndeclaredEntryPoint { name: "other".into() }
        );
    }

    #[test]
    fn test_function_lookup_errors() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let library = ctx
            .create_library(KernelSource::new("void kernel noop(){}"))
            .unwrap();
        assert_eq!(library.function_names(), vec!["noop"]);
        assert!(matches!(
            library.function_with_name("noop"),
            Err(GpuError::MissingHostImplementation { .. })
        ));
        assert!(matches!(
            library.function_with_name("copy"),
            Err(GpuError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_copy_dispatch() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let library = copy_library(&ctx);
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("copy").unwrap())
            .unwrap();
        let a = ctx.create_buffer(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = ctx.create_buffer(&[0.0; 4]).unwrap();

        let queue = ctx.create_command_queue();
        let mut command_buffer = queue.create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.set_buffer(&a, 0, 0).unwrap();
        encoder.set_buffer(&b, 0, 1).unwrap();
        encoder.dispatch(Size::new(2, 1, 1), Size::new(2, 1, 1)).unwrap();
        encoder.end_encoding();
        assert_eq!(command_buffer.dispatch_count(), 1);

        block_on(command_buffer.commit()).unwrap();
        assert_eq!(b.contents(), vec![1.0, 2.0, 3.0, 4.0]);

        let stats = ctx.stats();
        assert_eq!(stats.dispatches, 1);
        assert_eq!(stats.threadgroups_executed, 2);
        assert_eq!(stats.threads_executed, 4);
        assert_eq!(stats.command_buffers_committed, 1);
    }

    #[test]
    fn test_buffer_offset_shifts_view() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let library = copy_library(&ctx);
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("copy").unwrap())
            .unwrap();
        let a = ctx.create_buffer(&[1.0, 2.0, 3.0]).unwrap();
        let b = ctx.create_buffer(&[0.0; 2]).unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.set_buffer(&a, 4, 0).unwrap();
        encoder.set_buffer(&b, 0, 1).unwrap();
        encoder.dispatch(Size::new(1, 1, 1), Size::new(2, 1, 1)).unwrap();
        encoder.end_encoding();
        block_on(command_buffer.commit()).unwrap();
        assert_eq!(b.contents(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_buffer_len_reports_visible_elements() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let lengths = Rc::new(RefCell::new(Vec::new()));
        let record = Rc::clone(&lengths);
        let source = KernelSource::new("kernel void lengths() {}").entry("lengths", move |_, args| {
            record.borrow_mut().push((args.buffer_len(0), args.buffer_len(1)));
            async {}
        });
        let library = ctx.create_library(source).unwrap();
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("lengths").unwrap())
            .unwrap();
        let a = ctx.create_buffer(&[1.0, 2.0, 3.0]).unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.set_buffer(&a, 4, 0).unwrap();
        encoder.dispatch(Size::new(1, 1, 1), Size::new(1, 1, 1)).unwrap();
        encoder.end_encoding();

        // An unbound slot reads as empty without faulting the dispatch.
        block_on(command_buffer.commit()).unwrap();
        assert_eq!(*lengths.borrow(), vec![(2, 0)]);
    }

    #[test]
    fn test_dispatch_validation() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let library = copy_library(&ctx);
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("copy").unwrap())
            .unwrap();
        let buffer = ctx.create_buffer(&[0.0; 4]).unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();

        assert_eq!(
            encoder.dispatch(Size::new(1, 1, 1), Size::new(1, 1, 1)),
            Err(GpuError::NoPipelineState)
        );
        encoder.set_compute_pipeline_state(&pipeline);
        assert_eq!(
            encoder.dispatch(Size::new(1, 0, 1), Size::new(1, 1, 1)),
            Err(GpuError::EmptyDispatch(Size::new(1, 0, 1)))
        );
        assert_eq!(
            encoder.dispatch(Size::new(1, 1, 1), Size::new(1024, 2, 1)),
            Err(GpuError::ThreadgroupTooLarge { threads: 2048, limit: 1024 })
        );
        assert_eq!(
            encoder.dispatch(Size::new(70000, 1, 1), Size::new(1, 1, 1)),
            Err(GpuError::GridTooLarge { count: 70000, limit: 65535 })
        );
        assert!(matches!(
            encoder.set_buffer(&buffer, 2, 0),
            Err(GpuError::BadOffset { offset: 2, len: 16 })
        ));
        assert!(matches!(
            encoder.set_buffer(&buffer, 0, 31),
            Err(GpuError::BufferIndexOutOfRange { index: 31, slots: 31 })
        ));
        encoder.end_encoding();
        assert_eq!(command_buffer.dispatch_count(), 0);
    }

    #[test]
    fn test_oversized_threadgroup_is_rejected() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let library = copy_library(&ctx);
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("copy").unwrap())
            .unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);

        let huge = Size::new(u32::MAX, u32::MAX, u32::MAX);
        assert_eq!(huge.count(), u64::MAX);
        assert_eq!(
            encoder.dispatch(Size::new(1, 1, 1), huge),
            Err(GpuError::ThreadgroupTooLarge { threads: u64::MAX, limit: 1024 })
        );
        encoder.end_encoding();
        assert_eq!(command_buffer.dispatch_count(), 0);
    }

    #[test]
    fn test_grid_extent_overflow_is_rejected() {
        let limits: ComputeLimits =
            serde_json::from_str(r#"{"max_threadgroups_per_dimension": 4294967295}"#).unwrap();
        let ctx = ComputeContext::new(limits);
        let library = copy_library(&ctx);
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("copy").unwrap())
            .unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);

        assert_eq!(
            encoder.dispatch(Size::new(u32::MAX, 1, 1), Size::new(2, 1, 1)),
            Err(GpuError::GridExtentOverflow {
                threadgroups: Size::new(u32::MAX, 1, 1),
                threads_per_threadgroup: Size::new(2, 1, 1),
            })
        );
        encoder.end_encoding();
        assert_eq!(command_buffer.dispatch_count(), 0);

        // Nothing was encoded, so the commit has no work to run.
        block_on(command_buffer.commit()).unwrap();
        assert_eq!(ctx.stats().dispatches, 0);
        assert_eq!(ctx.stats().threads_executed, 0);
    }

    #[test]
    fn test_out_of_bounds_access_fails_completion() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let library = copy_library(&ctx);
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("copy").unwrap())
            .unwrap();
        let a = ctx.create_buffer(&[1.0, 2.0]).unwrap();
        let b = ctx.create_buffer(&[0.0; 2]).unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.set_buffer(&a, 0, 0).unwrap();
        encoder.set_buffer(&b, 0, 1).unwrap();
        encoder.dispatch(Size::new(1, 1, 1), Size::new(3, 1, 1)).unwrap();
        encoder.end_encoding();
        assert_eq!(
            block_on(command_buffer.commit()),
            Err(GpuError::OutOfBounds { index: 0, element: 2, len: 2 })
        );
    }

    #[test]
    fn test_unbound_slot_fails_completion() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let library = copy_library(&ctx);
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("copy").unwrap())
            .unwrap();
        let a = ctx.create_buffer(&[1.0]).unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.set_buffer(&a, 0, 0).unwrap();
        encoder.dispatch(Size::new(1, 1, 1), Size::new(1, 1, 1)).unwrap();
        encoder.end_encoding();
        assert_eq!(
            block_on(command_buffer.commit()),
            Err(GpuError::UnboundBuffer { index: 1 })
        );
    }

    #[test]
    fn test_thread_positions() {
        let ctx = ComputeContext::new(ComputeLimits::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = Rc::clone(&seen);
        let source = KernelSource::new("kernel void record() {}").entry("record", move |thread, _| {
            record.borrow_mut().push(thread);
            async {}
        });
        let library = ctx.create_library(source).unwrap();
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("record").unwrap())
            .unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.dispatch(Size::new(2, 1, 1), Size::new(2, 2, 1)).unwrap();
        encoder.end_encoding();
        block_on(command_buffer.commit()).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 8);
        let last = seen[7];
        assert_eq!(last.thread_position_in_grid, [3, 1, 0]);
        assert_eq!(last.thread_position_in_threadgroup, [1, 1, 0]);
        assert_eq!(last.thread_index_in_threadgroup, 3);
        assert_eq!(last.threadgroup_position_in_grid, [1, 0, 0]);
        assert_eq!(last.threads_per_grid, [4, 2, 1]);
        assert_eq!(last.threadgroups_per_grid, [2, 1, 1]);
        assert_eq!(last.thread_execution_width, 32);
    }

    #[test]
    fn test_barrier_orders_reads_before_writes() {
        // Reverse a buffer in place: without the barrier, early writers would
        // clobber values later readers still need.
        let ctx = ComputeContext::new(ComputeLimits::default());
        let source = KernelSource::new("kernel void reverse() {}").entry("reverse", |thread, args| async move {
            let n = thread.threads_per_threadgroup[0] as usize;
            let i = thread.thread_index_in_threadgroup as usize;
            let value = args.read(0, n - 1 - i);
            args.threadgroup_barrier().await;
            args.write(0, i, value);
        });
        let library = ctx.create_library(source).unwrap();
        let pipeline = ctx
            .create_compute_pipeline_state(&library.function_with_name("reverse").unwrap())
            .unwrap();
        let data: Vec<f32> = (0..64).map(|v| v as f32).collect();
        let buffer = ctx.create_buffer(&data).unwrap();
        let mut command_buffer = ctx.create_command_queue().create_command_buffer();
        let mut encoder = command_buffer.compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        encoder.set_buffer(&buffer, 0, 0).unwrap();
        encoder.dispatch(Size::new(1, 1, 1), Size::new(64, 1, 1)).unwrap();
        encoder.end_encoding();
        block_on(command_buffer.commit()).unwrap();

        let expected: Vec<f32> = data.into_iter().rev().collect();
        assert_eq!(buffer.contents(), expected);
    }

    #[test]
    fn test_buffer_limit() {
        let limits = ComputeLimits {
            max_buffer_length: 2,
            ..ComputeLimits::default()
        };
        let ctx = ComputeContext::new(limits);
        assert_eq!(
            ctx.create_buffer(&[0.0; 3]).unwrap_err(),
            GpuError::BufferTooLarge { len: 3, limit: 2 }
        );
    }

    #[test]
    fn test_host_interfaces() {
        let host = ComputeHost::simulated();
        assert!(host.supports(RENDERING_CONTEXT_INTERFACE));
        assert!(host.supports(COMMAND_ENCODER_INTERFACE));
        assert!(host.create_context().is_some());

        let host = ComputeHost::unsupported();
        assert!(!host.supports(PIPELINE_STATE_INTERFACE));
        assert!(host.create_context().is_none());
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: ComputeLimits = serde_json::from_str(r#"{"thread_execution_width": 64}"#).unwrap();
        assert_eq!(limits.thread_execution_width, 64);
        assert_eq!(limits.max_threads_per_threadgroup, 1024);
    }
}
