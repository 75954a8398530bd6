//! # Registry Concurrency Tests
//!
//! Exercises the shared registry from many OS threads at once:
//! - round-robin selections are never lost or duplicated under contention
//! - least-connections reservations and releases balance out
//! - whole-pool replacement racing incremental updates never leaves a half-written entry

use discovery_gateway::load_balancing::{BalancerState, StrategyKind};
use discovery_gateway::ServiceRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

fn endpoints(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("10.0.0.{}:80", i + 1)).collect()
}

/// N threads × K selections each on a K-endpoint round-robin pool hit every endpoint N times
#[test]
fn test_round_robin_selection_is_exact_under_contention() {
    const THREADS: usize = 16;
    const ENDPOINTS: usize = 8;

    let registry = Arc::new(ServiceRegistry::new());
    registry.replace("api", endpoints(ENDPOINTS), StrategyKind::RoundRobin);

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..ENDPOINTS)
                    .map(|_| registry.next_endpoint("api").unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for handle in handles {
        for endpoint in handle.join().unwrap() {
            *counts.entry(endpoint).or_default() += 1;
        }
    }

    assert_eq!(counts.len(), ENDPOINTS);
    assert!(counts.values().all(|&count| count == THREADS));
}

/// Every reservation released by its caller leaves all counters at zero
#[test]
fn test_least_connections_releases_balance_out() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let registry = Arc::new(ServiceRegistry::new());
    registry.replace("api", endpoints(4), StrategyKind::LeastConnections);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let endpoint = registry.next_endpoint("api").unwrap();
                    registry.release_endpoint("api", &endpoint);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    match registry.snapshot("api").unwrap().state {
        BalancerState::LeastConnections { in_flight } => {
            assert_eq!(in_flight.len(), 4);
            assert!(in_flight.values().all(|&count| count == 0));
        }
        other => panic!("unexpected balancer state: {:?}", other),
    }
}

/// Held reservations are spread evenly: no endpoint exceeds the minimum by more than one
#[test]
fn test_least_connections_spreads_held_reservations() {
    const THREADS: usize = 6;
    const PER_THREAD: usize = 10;

    let registry = Arc::new(ServiceRegistry::new());
    registry.replace("api", endpoints(4), StrategyKind::LeastConnections);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    registry.next_endpoint("api").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    match registry.snapshot("api").unwrap().state {
        BalancerState::LeastConnections { in_flight } => {
            let total: u64 = in_flight.values().sum();
            let min = in_flight.values().min().copied().unwrap();
            let max = in_flight.values().max().copied().unwrap();
            assert_eq!(total, (THREADS * PER_THREAD) as u64);
            assert!(max - min <= 1, "uneven spread: {:?}", in_flight);
        }
        other => panic!("unexpected balancer state: {:?}", other),
    }
}

/// Replacement and incremental updates on one key are serialized; the entry always stays valid
#[test]
fn test_replace_and_incremental_updates_are_serialized() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.replace("api", endpoints(2), StrategyKind::RoundRobin);

    let writer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for round in 0..500 {
                registry.replace("api", endpoints(1 + round % 3), StrategyKind::RoundRobin);
            }
        })
    };
    let adder = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..500 {
                registry.add_instance("api", "10.9.9.9:80").unwrap();
                registry.remove_instance("api", "10.9.9.9:80").unwrap();
            }
        })
    };
    let reader = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..2000 {
                let snapshot = registry.snapshot("api").unwrap();
                if let BalancerState::RoundRobin { cursor } = snapshot.state {
                    assert!(snapshot.endpoints.is_empty() || cursor < snapshot.endpoints.len());
                }
                registry.next_endpoint("api").unwrap();
            }
        })
    };

    writer.join().unwrap();
    adder.join().unwrap();
    reader.join().unwrap();

    let final_endpoints = registry.snapshot("api").unwrap().endpoints;
    assert!(!final_endpoints.contains("10.9.9.9:80"));
    assert!(!final_endpoints.is_empty());
}

/// Selection on one service proceeds while another service is being rewritten
#[test]
fn test_services_are_independent() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.replace("api", endpoints(3), StrategyKind::RoundRobin);
    registry.replace("web", endpoints(3), StrategyKind::RoundRobin);

    let churn = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..1000 {
                registry.replace("web", endpoints(3), StrategyKind::LeastConnections);
            }
        })
    };

    let picks: Vec<String> = (0..9).map(|_| registry.next_endpoint("api").unwrap()).collect();
    churn.join().unwrap();

    let expected: Vec<String> = endpoints(3).into_iter().cycle().take(9).collect();
    assert_eq!(picks, expected);
}
