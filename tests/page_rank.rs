// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! PageRank on the compute backends, checked against the f64 host reference.

use passes_and_kernels::algorithms::{Graph, PageRankOptions, page_rank, page_rank_reference};
use passes_and_kernels::*;

fn five_nodes() -> Graph {
    Graph::new(
        5,
        &[(0, 1), (0, 2), (1, 2), (2, 0), (3, 2), (3, 4), (1, 3)],
    )
}

/// Every other node links to node 0, which links back to node 1.
fn star() -> Graph {
    Graph::new(5, &[(1, 0), (2, 0), (3, 0), (4, 0), (0, 1)])
}

/// Every node links to the next one.
fn ring(n: u32) -> Graph {
    let edges: Vec<(u32, u32)> = (0..n).map(|i| (i, (i + 1) % n)).collect();
    Graph::new(n, &edges)
}

async fn open(backend: BackendKind) -> Option<SwapChain> {
    let surface = HeadlessSurface::new(1, 1);
    let config = SwapChainConfig::default()
        .with_targets(vec![backend])
        .with_leak_policy(LeakPolicy::Panic);
    match create_swap_chain(&surface, config).await {
        Ok(swap_chain) => Some(swap_chain),
        Err(e) if backend == BackendKind::WebGPU => {
            eprintln!("skipping {backend}: {e}");
            None
        }
        Err(e) => panic!("{backend} should always open: {e}"),
    }
}

async fn matches_reference(backend: BackendKind) {
    let Some(mut swap_chain) = open(backend).await else {
        return;
    };
    let device = swap_chain.get_device();
    let options = PageRankOptions::default();
    for graph in [five_nodes(), ring(37)] {
        let gpu = page_rank(device, &graph, &options).await.unwrap();
        let cpu = page_rank_reference(&graph, &options).unwrap();
        assert!(gpu.converged, "{backend} did not converge");
        assert_eq!(gpu.ranks.len(), graph.node_count() as usize);
        for (g, c) in gpu.ranks.iter().zip(&cpu.ranks) {
            assert!((g - c).abs() < 1e-4, "{backend}: {g} vs {c}");
        }
        assert_eq!(gpu.ordering(), cpu.ordering());
        assert!(
            gpu.iterations.abs_diff(cpu.iterations) <= 1,
            "{backend}: {} iterations, the reference took {}",
            gpu.iterations,
            cpu.iterations
        );
    }
    assert!(device.check_for_leaks().is_empty());
}

#[test_executors::async_test]
async fn software_matches_reference() {
    matches_reference(BackendKind::Software).await;
}

#[test_executors::async_test]
async fn webgpu_matches_reference() {
    matches_reference(BackendKind::WebGPU).await;
}

#[test_executors::async_test]
async fn the_best_linked_node_wins() {
    let mut swap_chain = open(BackendKind::Software).await.unwrap();
    let device = swap_chain.get_device();
    let options = PageRankOptions::default();
    let result = page_rank(device, &star(), &options).await.unwrap();
    assert_eq!(result.ordering()[0], 0);
    assert_eq!(result.ordering()[1], 1);
    let total: f32 = result.ranks.iter().sum();
    assert!((total - 1.0).abs() < 1e-3, "ranks sum to {total}");

    // node 2 feeds node 0, so node 0 outranks the node with the most in-links
    let result = page_rank(device, &five_nodes(), &options).await.unwrap();
    let expected = page_rank_reference(&five_nodes(), &options).unwrap();
    assert_eq!(result.ordering(), expected.ordering());
    assert_eq!(result.ordering()[0], 0);
}

#[test_executors::async_test]
async fn iteration_counts_follow_the_reference() {
    let mut swap_chain = open(BackendKind::Software).await.unwrap();
    let device = swap_chain.get_device();
    // loose enough that f32 rounding cannot move the stopping iteration
    let options = PageRankOptions {
        tolerance: 1e-3,
        ..Default::default()
    };
    for graph in [five_nodes(), star(), ring(8)] {
        let result = page_rank(device, &graph, &options).await.unwrap();
        let expected = page_rank_reference(&graph, &options).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, expected.iterations);
        assert!(result.iterations >= 1);
    }
    assert!(device.check_for_leaks().is_empty());
}

#[test_executors::async_test]
async fn a_ring_ranks_every_node_equally() {
    let mut swap_chain = open(BackendKind::Software).await.unwrap();
    let result = page_rank(swap_chain.get_device(), &ring(8), &PageRankOptions::default())
        .await
        .unwrap();
    for rank in &result.ranks {
        assert!((rank - 0.125).abs() < 1e-5, "{rank}");
    }
}

#[test_executors::async_test]
async fn the_iteration_cap_is_reported() {
    let mut swap_chain = open(BackendKind::Software).await.unwrap();
    let options = PageRankOptions {
        max_iterations: 3,
        tolerance: 0.0,
        ..Default::default()
    };
    let result = page_rank(swap_chain.get_device(), &five_nodes(), &options)
        .await
        .unwrap();
    assert!(!result.converged);
    assert_eq!(result.iterations, 3);
    assert!(swap_chain.get_device().check_for_leaks().is_empty());
}

#[test_executors::async_test]
async fn an_empty_graph_has_no_ranks() {
    let mut swap_chain = open(BackendKind::Software).await.unwrap();
    let result = page_rank(
        swap_chain.get_device(),
        &Graph::new(0, &[]),
        &PageRankOptions::default(),
    )
    .await
    .unwrap();
    assert!(result.ranks.is_empty());
    assert!(result.converged);
}

#[test_executors::async_test]
async fn webgl_cannot_run_kernels() {
    let mut swap_chain = open(BackendKind::WebGL2).await.unwrap();
    let device = swap_chain.get_device();
    assert!(matches!(
        page_rank(device, &five_nodes(), &PageRankOptions::default()).await,
        Err(Error::Unsupported { .. })
    ));
    assert!(device.check_for_leaks().is_empty());
}
