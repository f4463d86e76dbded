use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use rand::Rng;
use thiserror::Error;

use crate::media::types::RelayPorts;

/// Random probes before falling back to a linear scan of the range.
const RANDOM_ATTEMPTS: usize = 64;

#[derive(Debug, Error)]
#[error("relay port range {0}-{1} exhausted")]
pub struct PortsExhausted(pub u16, pub u16);

#[derive(Debug, Error)]
#[error("invalid relay port range {0}-{1}: need room for one even pair")]
pub struct InvalidPortRange(pub u16, pub u16);

/// Hands out non-colliding loopback UDP port pairs for concurrently
/// running sessions. Each pair occupies a 4-port slot (audio on the
/// base, video on base+2) so pairs can never overlap.
#[derive(Debug)]
pub struct PortAllocator {
    lo: u16,
    hi: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// `lo` is rounded up to even; the range must fit at least one
    /// pair. The bounds come from the environment, so a bad range is a
    /// configuration error rather than a panic.
    pub fn new(lo: u16, hi: u16) -> Result<Self, InvalidPortRange> {
        // u32 arithmetic so ranges near u16::MAX cannot wrap.
        let base = lo as u32 + (lo as u32 % 2);
        if base + 2 > hi as u32 {
            return Err(InvalidPortRange(lo, hi));
        }
        Ok(Self {
            lo: base as u16,
            hi,
            in_use: Mutex::new(HashSet::new()),
        })
    }

    pub fn allocate(&self) -> Result<RelayPorts, PortsExhausted> {
        let slots = ((self.hi - self.lo - 2) / 4) as usize + 1;
        let mut in_use = self.in_use.lock().unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ATTEMPTS {
            let base = self.lo + 4 * rng.gen_range(0..slots) as u16;
            if let Some(ports) = Self::claim(&mut in_use, base) {
                return Ok(ports);
            }
        }
        for slot in 0..slots {
            let base = self.lo + 4 * slot as u16;
            if let Some(ports) = Self::claim(&mut in_use, base) {
                return Ok(ports);
            }
        }
        Err(PortsExhausted(self.lo, self.hi))
    }

    fn claim(in_use: &mut HashSet<u16>, base: u16) -> Option<RelayPorts> {
        if in_use.contains(&base) || in_use.contains(&(base + 2)) {
            return None;
        }
        in_use.insert(base);
        in_use.insert(base + 2);
        Some(RelayPorts {
            audio: base,
            video: base + 2,
        })
    }

    /// Safe to call repeatedly, and with pairs that were never allocated.
    pub fn release(&self, ports: RelayPorts) {
        let mut in_use = self.in_use.lock().unwrap();
        in_use.remove(&ports.audio);
        in_use.remove(&ports.video);
    }

    /// Number of ports currently held by live sessions.
    #[allow(dead_code)]
    pub fn held(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }
}

/// Creates the per-session output directory if absent (recursive).
pub async fn ensure_output_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_distinct_across_randomized_trials() {
        let alloc = PortAllocator::new(50000, 50998).unwrap();
        for _ in 0..1000 {
            let a = alloc.allocate().unwrap();
            let b = alloc.allocate().unwrap();
            let c = alloc.allocate().unwrap();
            let held = [a.audio, a.video, b.audio, b.video, c.audio, c.video];
            let unique: HashSet<u16> = held.iter().copied().collect();
            assert_eq!(unique.len(), held.len());
            alloc.release(a);
            alloc.release(b);
            alloc.release(c);
        }
        assert_eq!(alloc.held(), 0);
    }

    #[test]
    fn test_released_ports_are_reusable() {
        // Range with exactly two slots.
        let alloc = PortAllocator::new(50000, 50006).unwrap();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert!(alloc.allocate().is_err());
        alloc.release(a);
        let c = alloc.allocate().unwrap();
        assert_eq!(a, c);
        alloc.release(b);
        alloc.release(c);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = PortAllocator::new(50000, 50006).unwrap();
        let a = alloc.allocate().unwrap();
        alloc.release(a);
        alloc.release(a);
        assert_eq!(alloc.held(), 0);
        // A never-allocated pair is also fine.
        alloc.release(RelayPorts {
            audio: 50004,
            video: 50006,
        });
    }

    #[test]
    fn test_exhaustion_surfaces_as_error() {
        let alloc = PortAllocator::new(50000, 50002).unwrap();
        let _a = alloc.allocate().unwrap();
        let err = alloc.allocate().unwrap_err();
        assert_eq!(err.to_string(), "relay port range 50000-50002 exhausted");
    }

    #[test]
    fn test_invalid_range_rejected_without_panicking() {
        assert!(PortAllocator::new(50000, 50001).is_err());
        // Extremes near u16::MAX must not wrap.
        assert!(PortAllocator::new(65535, 65535).is_err());
        assert!(PortAllocator::new(65533, 65535).is_err());
        assert!(PortAllocator::new(65532, 65535).is_ok());
        let err = PortAllocator::new(100, 10).unwrap_err();
        assert!(err.to_string().contains("100-10"));
    }

    #[test]
    fn test_ports_are_even_and_in_range() {
        let alloc = PortAllocator::new(50001, 50999).unwrap();
        for _ in 0..100 {
            let p = alloc.allocate().unwrap();
            assert_eq!(p.audio % 2, 0);
            assert_eq!(p.video, p.audio + 2);
            assert!(p.audio >= 50002 && p.video <= 50999);
            alloc.release(p);
        }
    }
}
