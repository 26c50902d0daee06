// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
PageRank by power iteration.

Each iteration runs three kernels over the node vector:

```text
store:  rank    ← updated
matmul: updated ← (1 - d) / n + d · M · rank
diff:   delta   ← |updated - rank|
```

`delta` is read back after every iteration and the loop stops once its largest element is
below the tolerance.  `M` is the dense column-stochastic link matrix; a node without outgoing
links spreads its rank evenly over every node.
*/

use crate::device::Device;
use crate::error::Error;
use crate::handles::BufferHandle;
use crate::kernel::{Kernel, dispatch_grid};
use crate::program::{BindingSlot, HostComputeContext, HostShader, ProgramDescriptor, ShaderStage};
use crate::resources::{BufferDescriptor, BufferUsage};
use crate::sys::time::Instant;

const WORKGROUP: u32 = 64;

const STORE_WGSL: &str = r#"
struct Info { n: u32, damping: f32, pad0: u32, pad1: u32 }
@group(0) @binding(0) var<storage, read> updated: array<f32>;
@group(0) @binding(1) var<storage, read_write> rank: array<f32>;
@group(0) @binding(2) var<uniform> info: Info;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= info.n) {
        return;
    }
    rank[i] = updated[i];
}
"#;

const MATMUL_WGSL: &str = r#"
struct Info { n: u32, damping: f32, pad0: u32, pad1: u32 }
@group(0) @binding(0) var<storage, read> links: array<f32>;
@group(0) @binding(1) var<storage, read> rank: array<f32>;
@group(0) @binding(2) var<storage, read_write> updated: array<f32>;
@group(0) @binding(3) var<uniform> info: Info;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= info.n) {
        return;
    }
    var sum = 0.0;
    for (var j = 0u; j < info.n; j = j + 1u) {
        sum = sum + links[i * info.n + j] * rank[j];
    }
    updated[i] = (1.0 - info.damping) / f32(info.n) + info.damping * sum;
}
"#;

const DIFF_WGSL: &str = r#"
struct Info { n: u32, damping: f32, pad0: u32, pad1: u32 }
@group(0) @binding(0) var<storage, read> updated: array<f32>;
@group(0) @binding(1) var<storage, read> rank: array<f32>;
@group(0) @binding(2) var<storage, read_write> delta: array<f32>;
@group(0) @binding(3) var<uniform> info: Info;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= info.n) {
        return;
    }
    delta[i] = abs(updated[i] - rank[i]);
}
"#;

/// Uniform block shared by the three kernels.  Padded to 16 bytes for std140.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Info {
    n: u32,
    damping: f32,
    pad: [u32; 2],
}

const fn slot(binding: u32) -> BindingSlot {
    BindingSlot::new(0, binding)
}

const INFO_SIZE: u64 = std::mem::size_of::<Info>() as u64;

fn info(ctx: &HostComputeContext<'_>, binding: u32) -> Info {
    ctx.read::<Info>(slot(binding))[0]
}

/// Indices of the invocations inside the node range.
fn nodes(ctx: &HostComputeContext<'_>, n: u32) -> impl Iterator<Item = usize> + 'static {
    ctx.invocations()
        .filter(move |[x, y, z]| *x < n && *y == 0 && *z == 0)
        .map(|[x, _, _]| x as usize)
}

fn store_program() -> ProgramDescriptor {
    let host = HostShader::compute([WORKGROUP, 1, 1], |ctx| {
        let info = info(ctx, 2);
        let updated: Vec<f32> = ctx.read(slot(0));
        let mut rank: Vec<f32> = ctx.read(slot(1));
        for i in nodes(ctx, info.n) {
            rank[i] = updated[i];
        }
        ctx.write(slot(1), 0, &rank);
    })
    .storage(slot(0), true, 4, "updated")
    .storage(slot(1), false, 4, "rank")
    .uniform(slot(2), INFO_SIZE, "info");
    ProgramDescriptor::compute(ShaderStage::new().wgsl(STORE_WGSL).host(host))
}

fn matmul_program() -> ProgramDescriptor {
    let host = HostShader::compute([WORKGROUP, 1, 1], |ctx| {
        let info = info(ctx, 3);
        let n = info.n as usize;
        let links: Vec<f32> = ctx.read(slot(0));
        let rank: Vec<f32> = ctx.read(slot(1));
        let mut updated: Vec<f32> = ctx.read(slot(2));
        for i in nodes(ctx, info.n) {
            let sum: f32 = (0..n).map(|j| links[i * n + j] * rank[j]).sum();
            updated[i] = (1.0 - info.damping) / n as f32 + info.damping * sum;
        }
        ctx.write(slot(2), 0, &updated);
    })
    .storage(slot(0), true, 4, "links")
    .storage(slot(1), true, 4, "rank")
    .storage(slot(2), false, 4, "updated")
    .uniform(slot(3), INFO_SIZE, "info");
    ProgramDescriptor::compute(ShaderStage::new().wgsl(MATMUL_WGSL).host(host))
}

fn diff_program() -> ProgramDescriptor {
    let host = HostShader::compute([WORKGROUP, 1, 1], |ctx| {
        let info = info(ctx, 3);
        let updated: Vec<f32> = ctx.read(slot(0));
        let rank: Vec<f32> = ctx.read(slot(1));
        let mut delta: Vec<f32> = ctx.read(slot(2));
        for i in nodes(ctx, info.n) {
            delta[i] = (updated[i] - rank[i]).abs();
        }
        ctx.write(slot(2), 0, &delta);
    })
    .storage(slot(0), true, 4, "updated")
    .storage(slot(1), true, 4, "rank")
    .storage(slot(2), false, 4, "delta")
    .uniform(slot(3), INFO_SIZE, "info");
    ProgramDescriptor::compute(ShaderStage::new().wgsl(DIFF_WGSL).host(host))
}

/// A directed graph over nodes `0..node_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    node_count: u32,
    edges: Vec<(u32, u32)>,
}

impl Graph {
    /// `edges` are `(from, to)` pairs.  Repeated edges count once per occurrence.
    pub fn new(node_count: u32, edges: &[(u32, u32)]) -> Self {
        Graph {
            node_count,
            edges: edges.to_vec(),
        }
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn edges(&self) -> &[(u32, u32)] {
        &self.edges
    }

    fn validate(&self) -> Result<(), Error> {
        match self
            .edges
            .iter()
            .find(|(from, to)| *from >= self.node_count || *to >= self.node_count)
        {
            Some((from, to)) => Err(Error::invalid_descriptor(
                "graph",
                format!(
                    "edge {from} -> {to} leaves the {}-node graph",
                    self.node_count
                ),
            )),
            None => Ok(()),
        }
    }

    /// Row-major `n × n` matrix; entry `(i, j)` is the share of `j`'s rank that flows to `i`.
    fn link_matrix(&self) -> Vec<f64> {
        let n = self.node_count as usize;
        let mut out_degree = vec![0u32; n];
        for (from, _) in &self.edges {
            out_degree[*from as usize] += 1;
        }
        let mut matrix = vec![0.0; n * n];
        for (from, to) in &self.edges {
            let (from, to) = (*from as usize, *to as usize);
            matrix[to * n + from] += 1.0 / out_degree[from] as f64;
        }
        for (j, degree) in out_degree.iter().enumerate() {
            if *degree == 0 {
                for i in 0..n {
                    matrix[i * n + j] = 1.0 / n as f64;
                }
            }
        }
        matrix
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageRankOptions {
    pub damping: f32,
    /// Iteration stops once no node's rank moves by this much or more.
    pub tolerance: f32,
    pub max_iterations: u32,
}

impl Default for PageRankOptions {
    fn default() -> Self {
        PageRankOptions {
            damping: 0.85,
            tolerance: 1e-6,
            max_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRankResult {
    pub ranks: Vec<f32>,
    pub iterations: u32,
    /// False when `max_iterations` ran out first.
    pub converged: bool,
}

impl PageRankResult {
    /// Node indices from highest to lowest rank.  Ties keep index order.
    pub fn ordering(&self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.ranks.len() as u32).collect();
        order.sort_by(|a, b| {
            self.ranks[*b as usize]
                .total_cmp(&self.ranks[*a as usize])
                .then(a.cmp(b))
        });
        order
    }
}

/// Power iteration on the CPU, with the same update and stopping rule as [`page_rank`].
pub fn page_rank_reference(graph: &Graph, options: &PageRankOptions) -> Result<PageRankResult, Error> {
    graph.validate()?;
    let n = graph.node_count as usize;
    if n == 0 {
        return Ok(PageRankResult {
            ranks: Vec::new(),
            iterations: 0,
            converged: true,
        });
    }
    let matrix = graph.link_matrix();
    let damping = options.damping as f64;
    let mut rank = vec![1.0 / n as f64; n];
    for iteration in 1..=options.max_iterations {
        let updated: Vec<f64> = (0..n)
            .map(|i| {
                let sum: f64 = (0..n).map(|j| matrix[i * n + j] * rank[j]).sum();
                (1.0 - damping) / n as f64 + damping * sum
            })
            .collect();
        let delta = updated
            .iter()
            .zip(&rank)
            .map(|(u, r)| (u - r).abs())
            .fold(0.0, f64::max);
        rank = updated;
        if delta < options.tolerance as f64 {
            return Ok(PageRankResult {
                ranks: rank.iter().map(|r| *r as f32).collect(),
                iterations: iteration,
                converged: true,
            });
        }
    }
    Ok(PageRankResult {
        ranks: rank.iter().map(|r| *r as f32).collect(),
        iterations: options.max_iterations,
        converged: false,
    })
}

const STORE: usize = 0;
const MATMUL: usize = 1;
const DIFF: usize = 2;

const INFO: usize = 0;
const LINKS: usize = 1;
const RANK: usize = 2;
const UPDATED: usize = 3;
const DELTA: usize = 4;

/// `(kernel, binding, buffer)` for every slot the three kernels read or write.
const BINDINGS: [(usize, u32, usize); 11] = [
    (STORE, 0, UPDATED),
    (STORE, 1, RANK),
    (STORE, 2, INFO),
    (MATMUL, 0, LINKS),
    (MATMUL, 1, RANK),
    (MATMUL, 2, UPDATED),
    (MATMUL, 3, INFO),
    (DIFF, 0, UPDATED),
    (DIFF, 1, RANK),
    (DIFF, 2, DELTA),
    (DIFF, 3, INFO),
];

/// Buffers and kernels of one run, indexed by the constants above.  Released whether or not
/// the run succeeded, including when building it failed halfway.
#[derive(Default)]
struct Run {
    kernels: Vec<Kernel>,
    buffers: Vec<BufferHandle>,
}

impl Run {
    fn new(device: &mut Device, graph: &Graph, options: &PageRankOptions) -> Result<Self, Error> {
        Run::with_programs(
            device,
            graph,
            options,
            [store_program(), matmul_program(), diff_program()],
        )
    }

    fn with_programs(
        device: &mut Device,
        graph: &Graph,
        options: &PageRankOptions,
        programs: [ProgramDescriptor; 3],
    ) -> Result<Self, Error> {
        let n = graph.node_count;
        if !device.limits().supports_compute() {
            return Err(Error::unsupported(device.backend_kind(), "compute shaders"));
        }
        let links: Vec<f32> = graph.link_matrix().into_iter().map(|v| v as f32).collect();
        let matrix_bytes = links.len() as u64 * 4;
        let limit = device.limits().max_storage_buffer_binding_size;
        if matrix_bytes > limit {
            return Err(Error::invalid_descriptor(
                "graph",
                format!("{n} nodes need a {matrix_bytes}-byte link matrix; the device binds at most {limit}"),
            ));
        }

        let mut run = Run::default();
        match run.build(device, n, options, &links, programs) {
            Ok(()) => Ok(run),
            Err(e) => {
                // the build error is the one worth reporting
                let _ = run.release(device);
                Err(e)
            }
        }
    }

    fn build(
        &mut self,
        device: &mut Device,
        n: u32,
        options: &PageRankOptions,
        links: &[f32],
        programs: [ProgramDescriptor; 3],
    ) -> Result<(), Error> {
        for program in &programs {
            self.kernels.push(Kernel::compile(device, program)?);
        }
        let info = Info {
            n,
            damping: options.damping,
            pad: [0; 2],
        };
        let storage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let initial = vec![1.0f32 / n as f32; n as usize];
        let zeros = vec![0.0f32; n as usize];
        let contents: [(&[u8], BufferUsage, &str); 5] = [
            (bytemuck::bytes_of(&info), BufferUsage::UNIFORM, "page rank info"),
            (bytemuck::cast_slice(links), BufferUsage::STORAGE, "page rank links"),
            (bytemuck::cast_slice(&zeros), storage, "page rank rank"),
            (bytemuck::cast_slice(&initial), storage, "page rank updated"),
            (bytemuck::cast_slice(&zeros), storage, "page rank delta"),
        ];
        for (data, usage, name) in contents {
            let buffer = device.create_buffer(&BufferDescriptor::with_data(data, usage))?;
            self.buffers.push(buffer);
            device.set_resource_name(buffer, name)?;
        }
        Ok(())
    }

    fn bind(&mut self) -> Result<(), Error> {
        for (kernel, binding, buffer) in BINDINGS {
            self.kernels[kernel].set_binding(slot(binding), self.buffers[buffer])?;
        }
        Ok(())
    }

    async fn iterate(
        &mut self,
        device: &mut Device,
        n: u32,
        options: &PageRankOptions,
    ) -> Result<PageRankResult, Error> {
        self.bind()?;
        let grid = dispatch_grid(n, WORKGROUP);
        let readback = device.create_readback();
        let mut iterations = 0;
        let mut converged = false;
        while iterations < options.max_iterations {
            iterations += 1;
            for kernel in [STORE, MATMUL, DIFF] {
                self.kernels[kernel].dispatch(device, grid, 1)?;
            }
            let delta = readback.read_buffer(device, self.buffers[DELTA])?.await?;
            let largest = delta.to_vec::<f32>().into_iter().fold(0.0, f32::max);
            logwise::trace_sync!(
                "page rank iteration {iteration}: largest change {largest}",
                iteration = iterations,
                largest = logwise::privacy::LogIt(&largest)
            );
            if largest < options.tolerance {
                converged = true;
                break;
            }
        }
        let ranks = readback
            .read_buffer(device, self.buffers[UPDATED])?
            .await?
            .to_vec::<f32>();
        Ok(PageRankResult {
            ranks,
            iterations,
            converged,
        })
    }

    /// Destroys everything, then reports the first failure.
    fn release(self, device: &mut Device) -> Result<(), Error> {
        let mut first = None;
        for kernel in self.kernels {
            if let Err(e) = kernel.destroy(device) {
                first.get_or_insert(e);
            }
        }
        for buffer in self.buffers {
            if let Err(e) = device.destroy(buffer) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Ranks the nodes of `graph` on `device`.
///
/// Every kernel and buffer the run creates is destroyed before this returns.
pub async fn page_rank(
    device: &mut Device,
    graph: &Graph,
    options: &PageRankOptions,
) -> Result<PageRankResult, Error> {
    graph.validate()?;
    if graph.node_count == 0 {
        return Ok(PageRankResult {
            ranks: Vec::new(),
            iterations: 0,
            converged: true,
        });
    }
    let started = Instant::now();
    let mut run = Run::new(device, graph, options)?;
    let result = run.iterate(device, graph.node_count, options).await;
    match (result, run.release(device)) {
        (Ok(result), Ok(())) => {
            logwise::info_sync!(
                "page rank over {nodes} nodes finished after {iterations} iterations in {elapsed}",
                nodes = graph.node_count,
                iterations = result.iterations,
                elapsed = logwise::privacy::LogIt(&started.elapsed())
            );
            Ok(result)
        }
        // the run's own error explains a failed release too
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap_chain::{BackendKind, HeadlessSurface, SwapChainConfig, create_swap_chain};

    /// Node 2 hands all of its rank to node 0, which ends up first; node 4 links nowhere.
    fn five_nodes() -> Graph {
        Graph::new(
            5,
            &[(0, 1), (0, 2), (1, 2), (2, 0), (3, 2), (3, 4), (1, 3)],
        )
    }

    #[test]
    fn reference_converges_and_sums_to_one() {
        let result = page_rank_reference(&five_nodes(), &PageRankOptions::default()).unwrap();
        assert!(result.converged);
        let total: f32 = result.ranks.iter().sum();
        assert!((total - 1.0).abs() < 1e-4, "ranks sum to {total}");
        assert_eq!(result.ordering(), vec![0, 2, 1, 3, 4]);
    }

    #[test]
    fn reference_reports_exhaustion() {
        let options = PageRankOptions {
            max_iterations: 2,
            ..Default::default()
        };
        let result = page_rank_reference(&five_nodes(), &options).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 2);
    }

    #[test]
    fn dangling_nodes_spread_evenly() {
        let graph = Graph::new(3, &[]);
        let matrix = graph.link_matrix();
        assert!(matrix.iter().all(|v| (*v - 1.0 / 3.0).abs() < 1e-12));
    }

    #[test]
    fn ordering_breaks_ties_by_index() {
        let result = PageRankResult {
            ranks: vec![0.25, 0.5, 0.25],
            iterations: 1,
            converged: true,
        };
        assert_eq!(result.ordering(), vec![1, 0, 2]);
    }

    #[test]
    fn edges_outside_the_graph_are_rejected() {
        let graph = Graph::new(2, &[(0, 2)]);
        assert!(matches!(
            page_rank_reference(&graph, &PageRankOptions::default()),
            Err(Error::InvalidDescriptor { .. })
        ));
    }

    #[test_executors::async_test]
    async fn a_failed_build_releases_what_it_created() {
        let surface = HeadlessSurface::new(1, 1);
        let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
        let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
        let device = swap_chain.get_device();
        let before = device.live_object_count();
        let no_host = ProgramDescriptor::compute(ShaderStage::new().wgsl(MATMUL_WGSL));
        let built = Run::with_programs(
            device,
            &five_nodes(),
            &PageRankOptions::default(),
            [store_program(), no_host, diff_program()],
        );
        assert!(built.is_err());
        assert_eq!(device.live_object_count(), before);
        assert!(device.check_for_leaks().is_empty());
    }

    #[test_executors::async_test]
    async fn software_matches_reference() {
        let surface = HeadlessSurface::new(1, 1);
        let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
        let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
        let device = swap_chain.get_device();
        let options = PageRankOptions::default();
        let gpu = page_rank(device, &five_nodes(), &options).await.unwrap();
        let cpu = page_rank_reference(&five_nodes(), &options).unwrap();
        assert!(gpu.converged);
        assert_eq!(gpu.ordering(), cpu.ordering());
        for (g, c) in gpu.ranks.iter().zip(&cpu.ranks) {
            assert!((g - c).abs() < 1e-4, "{g} vs {c}");
        }
        assert!(device.check_for_leaks().is_empty());
    }
}
