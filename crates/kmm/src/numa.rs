//! NUMA memory topology.
//!
//! Only memory affinity is tracked: which physical ranges belong to which proximity
//! domain. Firmware proximity domain numbers are sparse, so they are renumbered densely
//! in order of first appearance and capped at [`MAX_NUMA_DOMAINS`].

use core::fmt;

/// Maximum number of NUMA domains that get their own zone.
pub const MAX_NUMA_DOMAINS: usize = 8;

/// Maximum number of memory affinity ranges tracked.
pub const MAX_AFFINITY_RANGES: usize = 64;

/// SRAT structure type of a memory affinity entry.
const SRAT_MEMORY_AFFINITY: u8 = 1;

/// Size of a memory affinity entry.
const SRAT_MEMORY_AFFINITY_LEN: usize = 40;

/// Size of the SRAT header: the common SDT header plus twelve reserved bytes.
pub const SRAT_HEADER_LEN: usize = 48;

/// Why a topology entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaError {
    /// Every range slot is taken.
    TooManyRanges,
    /// The entry names more distinct proximity domains than there are zones.
    TooManyDomains,
}

impl fmt::Display for NumaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumaError::TooManyRanges => f.write_str("too many memory affinity ranges"),
            NumaError::TooManyDomains => f.write_str("too many proximity domains"),
        }
    }
}

/// One physical range owned by a NUMA domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAffinity {
    pub base: usize,
    pub length: usize,
    /// Dense domain number, `0..MAX_NUMA_DOMAINS`.
    pub domain: u8,
    pub enabled: bool,
}

impl MemoryAffinity {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.length
    }
}

/// Memory affinity ranges of the machine.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    ranges: [Option<MemoryAffinity>; MAX_AFFINITY_RANGES],
    proximity: [u32; MAX_NUMA_DOMAINS],
    domains: usize,
}

impl NumaTopology {
    /// Creates an empty topology; every high address resolves to the UMA zone.
    pub const fn new() -> Self {
        Self {
            ranges: [None; MAX_AFFINITY_RANGES],
            proximity: [0; MAX_NUMA_DOMAINS],
            domains: 0,
        }
    }

    /// Whether any enabled affinity range was recorded.
    pub fn is_numa(&self) -> bool {
        self.ranges().any(|range| range.enabled)
    }

    /// Number of distinct domains seen.
    pub fn domain_count(&self) -> usize {
        self.domains
    }

    /// Iterates over the recorded ranges.
    pub fn ranges(&self) -> impl Iterator<Item = &MemoryAffinity> {
        self.ranges.iter().flatten()
    }

    /// Records that `[base, base + length)` belongs to firmware proximity domain `proximity`.
    pub fn add(&mut self, base: usize, length: usize, proximity: u32, enabled: bool) -> Result<(), NumaError> {
        let slot = self
            .ranges
            .iter()
            .position(Option::is_none)
            .ok_or(NumaError::TooManyRanges)?;
        let domain = self.domain_for(proximity)?;
        self.ranges[slot] = Some(MemoryAffinity {
            base,
            length,
            domain,
            enabled,
        });
        log::debug!(
            "numa: {:#x}..{:#x} -> domain {} (proximity {}){}",
            base,
            base + length,
            domain,
            proximity,
            if enabled { "" } else { " disabled" }
        );
        Ok(())
    }

    /// Dense domain owning `addr`, if an enabled range covers it.
    pub fn domain_of(&self, addr: usize) -> Option<u8> {
        self.ranges()
            .find(|range| range.enabled && range.contains(addr))
            .map(|range| range.domain)
    }

    /// Reads every memory affinity entry of a raw SRAT, header included.
    ///
    /// Malformed trailing entries end the scan; the ranges read so far are kept.
    pub fn from_srat(table: &[u8]) -> Result<Self, NumaError> {
        let mut topology = Self::new();
        let mut offset = SRAT_HEADER_LEN;
        while offset + 2 <= table.len() {
            let kind = table[offset];
            let len = table[offset + 1] as usize;
            if len < 2 || offset + len > table.len() {
                log::warn!("numa: malformed SRAT entry at offset {}", offset);
                break;
            }

            if kind == SRAT_MEMORY_AFFINITY && len >= SRAT_MEMORY_AFFINITY_LEN {
                let entry = &table[offset..offset + len];
                let proximity = read_u32(entry, 2);
                let base = read_u64_split(entry, 8);
                let length = read_u64_split(entry, 16);
                let flags = read_u32(entry, 28);
                if length != 0 {
                    topology.add(base as usize, length as usize, proximity, flags & 1 != 0)?;
                }
            }
            offset += len;
        }
        Ok(topology)
    }

    fn domain_for(&mut self, proximity: u32) -> Result<u8, NumaError> {
        if let Some(domain) = self.proximity[..self.domains].iter().position(|&p| p == proximity) {
            return Ok(domain as u8);
        }
        if self.domains == MAX_NUMA_DOMAINS {
            return Err(NumaError::TooManyDomains);
        }
        self.proximity[self.domains] = proximity;
        self.domains += 1;
        Ok((self.domains - 1) as u8)
    }
}

impl Default for NumaTopology {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Reads a 64-bit value stored as low and high 32-bit halves.
fn read_u64_split(bytes: &[u8], offset: usize) -> u64 {
    read_u32(bytes, offset) as u64 | (read_u32(bytes, offset + 4) as u64) << 32
}
