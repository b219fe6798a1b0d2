//! TCP port allocation for instance channels.
//!
//! Every candidate port is probed with a real bind-and-release attempt; the
//! bind is the claim check, so concurrent launches racing over the same
//! range cannot both be told a port is free at the same instant. A port can
//! still be grabbed by an unrelated process between release and use; the VM
//! spawn surfaces that as a launch failure rather than a silent collision.

use std::net::TcpListener;

use crate::error::{HarnessError, Result};

/// Find the first free TCP port in the inclusive range, scanning ascending.
pub fn find_available_port(low: u16, high: u16) -> Result<u16> {
    allocate_distinct(low, high, 1).map(|ports| ports[0])
}

/// Allocate `count` distinct free ports in one pass.
///
/// All successful binds are held until the full set is found, so one call
/// never hands out the same port twice and two concurrent calls cannot
/// overlap within the scan.
pub fn allocate_distinct(low: u16, high: u16, count: usize) -> Result<Vec<u16>> {
    let mut held: Vec<(u16, TcpListener)> = Vec::with_capacity(count);
    for port in low..=high {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            held.push((port, listener));
            if held.len() == count {
                return Ok(held.into_iter().map(|(p, _)| p).collect());
            }
        }
    }
    Err(HarnessError::PortExhausted { low, high })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_port_in_open_range() {
        let port = find_available_port(23000, 23100).unwrap();
        assert!((23000..=23100).contains(&port));
        // The returned port must be bindable after release.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_distinct_allocation() {
        let ports = allocate_distinct(23200, 23300, 3).unwrap();
        assert_eq!(ports.len(), 3);
        assert_ne!(ports[0], ports[1]);
        assert_ne!(ports[1], ports[2]);
        assert_ne!(ports[0], ports[2]);
    }

    #[test]
    fn test_saturated_range_is_port_exhausted() {
        // Occupy a tiny range completely, then ask for one more.
        let range = 23400..=23402u16;
        let _held: Vec<TcpListener> = range
            .clone()
            .filter_map(|p| TcpListener::bind(("127.0.0.1", p)).ok())
            .collect();

        let err = find_available_port(*range.start(), *range.end()).unwrap_err();
        assert!(matches!(err, HarnessError::PortExhausted { .. }));
    }

    #[test]
    fn test_concurrent_callers_all_succeed() {
        // Concurrent scans over the same range must each produce a full,
        // internally distinct set. Cross-call disjointness only holds while
        // the binds are held, so it is not asserted here.
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| allocate_distinct(23500, 23700, 3).unwrap()))
            .collect();

        for handle in handles {
            let mut ports = handle.join().unwrap();
            assert_eq!(ports.len(), 3);
            assert!(ports.iter().all(|p| (23500..=23700).contains(p)));
            ports.sort_unstable();
            ports.dedup();
            assert_eq!(ports.len(), 3);
        }
    }
}
