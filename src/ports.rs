use std::fmt;

/// Contiguous local port block `[base, base + len)`, one port per dispatch index.
///
/// Each dispatch index is handed to exactly one lifecycle, so two lifecycles can
/// never share a port within one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    base: u16,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRangeError {
    pub base: u16,
    pub len: usize,
}

impl fmt::Display for PortRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidates do not fit in the local port range starting at {}",
            self.len, self.base
        )
    }
}

impl std::error::Error for PortRangeError {}

impl PortAllocator {
    pub fn new(base: u16, len: usize) -> Result<Self, PortRangeError> {
        let last = usize::from(base) + len.saturating_sub(1);
        if last > usize::from(u16::MAX) {
            return Err(PortRangeError { base, len });
        }
        Ok(Self { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Port for the `index`-th dispatched candidate.
    pub fn port_for(&self, index: usize) -> Option<u16> {
        if index >= self.len {
            return None;
        }
        u16::try_from(usize::from(self.base) + index).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_follow_dispatch_index() {
        let ports = PortAllocator::new(10808, 3).unwrap();
        assert_eq!(ports.port_for(0), Some(10808));
        assert_eq!(ports.port_for(2), Some(10810));
        assert_eq!(ports.port_for(3), None);
    }

    #[test]
    fn every_index_gets_a_distinct_port() {
        let ports = PortAllocator::new(20000, 500).unwrap();
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..ports.len() {
            assert!(seen.insert(ports.port_for(i).unwrap()));
        }
    }

    #[test]
    fn range_past_u16_max_is_rejected() {
        assert!(PortAllocator::new(65535, 1).is_ok());
        let err = PortAllocator::new(65530, 7).unwrap_err();
        assert_eq!(err, PortRangeError { base: 65530, len: 7 });
    }

    #[test]
    fn empty_range_is_fine() {
        let ports = PortAllocator::new(10808, 0).unwrap();
        assert!(ports.is_empty());
        assert_eq!(ports.port_for(0), None);
    }
}
