//! Memory overlay allocator
//!
//! Computes, once per configuration, where every working buffer of the
//! pipeline lives inside the three fixed-size memory tiers. Buffers are
//! tagged with the pipeline phases during which they hold live data; buffers
//! that are never live at the same time may share address ranges.
//!
//! The pipeline sizes its working buffers from the resulting
//! [`MemoryLayout`], so a configuration that does not fit is rejected before
//! the first chirp is processed.
use std::mem::size_of;

use crate::config::DssConfig;
use crate::errors::ConfigError;
use crate::fixed::{Cplx16, Cplx32};
use crate::objects::{CandidateObject, DetectedObject};
use crate::AngleMode;

/// Memory tiers, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    L1,
    L2,
    L3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::L1, Tier::L2, Tier::L3];
}

/// Pipeline phases a buffer can be live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Chirp,
    Doppler,
    Cfar,
    Grouping,
    Angle,
}

/// Set of phases during which a buffer holds live data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lifetime(u8);

impl Lifetime {
    /// Live during every phase.
    pub const PERSISTENT: Lifetime = Lifetime(0b1_1111);

    pub const fn of(phases: &[Phase]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < phases.len() {
            bits |= 1 << (phases[i] as u8);
            i += 1;
        }
        Lifetime(bits)
    }

    pub fn overlaps(self, other: Lifetime) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, phase: Phase) -> bool {
        self.0 & (1 << phase as u8) != 0
    }
}

/// Names of the buffers the pipeline allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
    AdcData,
    AdcIn,
    RangeFftIn,
    FftOut1D,
    RadarCube,
    DopplerIn,
    FftOut2D,
    WindowingBuf2D,
    Log2Abs,
    SumAbs,
    Heatmap,
    DetMatrix,
    DopplerLineMask,
    CfarIndexBuf,
    SumAbsRange,
    Candidates,
    AzimuthIn,
    AzimuthOut,
    AzimuthMagSqr,
    DoaGrid,
    Window1D,
    Window2D,
    DftTable,
    DetectedObjects,
    DcRangeSigMean,
}

/// One buffer the allocator has to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub id: BufferId,
    pub tier: Tier,
    pub lifetime: Lifetime,
    pub count: usize,
    pub elem_size: usize,
    pub align: usize,
}

impl BufferRequest {
    pub fn new<T>(id: BufferId, tier: Tier, lifetime: Lifetime, count: usize, align: usize) -> Self {
        Self {
            id,
            tier,
            lifetime,
            count,
            elem_size: size_of::<T>(),
            align,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.count * self.elem_size
    }
}

/// Where a buffer ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub id: BufferId,
    pub tier: Tier,
    pub lifetime: Lifetime,
    pub offset: usize,
    pub len_bytes: usize,
    pub count: usize,
}

impl Placement {
    pub fn end(&self) -> usize {
        self.offset + self.len_bytes
    }

    /// Whether two placements share at least one byte.
    pub fn intersects(&self, other: &Placement) -> bool {
        self.tier == other.tier && self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierUsage {
    pub tier: Tier,
    pub used: usize,
    pub capacity: usize,
}

/// Result of the overlay allocation.
#[derive(Debug, Clone)]
pub struct MemoryLayout {
    placements: Vec<Placement>,
    usage: Vec<TierUsage>,
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

impl MemoryLayout {
    /// Places all requests, grouped per tier and lifetime.
    ///
    /// Within a tier each distinct lifetime forms a group, laid out in order
    /// of first appearance. A group starts after every earlier group whose
    /// lifetime intersects its own; members of a group are bump-allocated.
    pub fn plan(
        requests: &[BufferRequest],
        capacities: &crate::ArenaCapacities,
    ) -> Result<Self, ConfigError> {
        if let Some(req) = requests.iter().find(|r| !r.align.is_power_of_two()) {
            return Err(ConfigError::InvalidAlignment { align: req.align });
        }

        let mut placements = Vec::with_capacity(requests.len());
        let mut usage = Vec::with_capacity(Tier::ALL.len());

        for tier in Tier::ALL {
            let in_tier: Vec<&BufferRequest> = requests.iter().filter(|r| r.tier == tier).collect();

            let mut lifetimes: Vec<Lifetime> = Vec::new();
            for req in &in_tier {
                if !lifetimes.contains(&req.lifetime) {
                    lifetimes.push(req.lifetime);
                }
            }

            // (lifetime, end offset) of groups already laid out
            let mut groups: Vec<(Lifetime, usize)> = Vec::with_capacity(lifetimes.len());
            for lifetime in lifetimes {
                let base = groups
                    .iter()
                    .filter(|(other, _)| other.overlaps(lifetime))
                    .map(|(_, end)| *end)
                    .max()
                    .unwrap_or(0);

                let mut cursor = base;
                for req in in_tier.iter().filter(|r| r.lifetime == lifetime) {
                    let offset = align_up(cursor, req.align);
                    placements.push(Placement {
                        id: req.id,
                        tier,
                        lifetime,
                        offset,
                        len_bytes: req.len_bytes(),
                        count: req.count,
                    });
                    cursor = offset + req.len_bytes();
                }
                groups.push((lifetime, cursor));
            }

            let used = groups.iter().map(|(_, end)| *end).max().unwrap_or(0);
            let capacity = match tier {
                Tier::L1 => capacities.l1,
                Tier::L2 => capacities.l2,
                Tier::L3 => capacities.l3,
            };
            if used > capacity {
                return Err(ConfigError::ArenaOverflow {
                    tier,
                    required: used,
                    capacity,
                });
            }
            usage.push(TierUsage {
                tier,
                used,
                capacity,
            });
        }

        Ok(Self { placements, usage })
    }

    /// Declares and places every buffer the pipeline uses for `cfg`.
    pub fn for_config(cfg: &DssConfig) -> Result<Self, ConfigError> {
        Self::plan(&Self::requests(cfg), &cfg.arena)
    }

    /// Buffer requests of the pipeline for `cfg`.
    pub fn requests(cfg: &DssConfig) -> Vec<BufferRequest> {
        use BufferId::*;
        use Phase::*;
        use Tier::*;

        const CHIRP: Lifetime = Lifetime::of(&[Chirp]);
        const DOPPLER: Lifetime = Lifetime::of(&[Doppler]);
        const DOPPLER_ANGLE: Lifetime = Lifetime::of(&[Doppler, Angle]);
        const DOPPLER_CFAR: Lifetime = Lifetime::of(&[Doppler, Cfar]);
        const CFAR: Lifetime = Lifetime::of(&[Cfar]);
        const CFAR_GROUPING: Lifetime = Lifetime::of(&[Cfar, Grouping]);
        const ANGLE: Lifetime = Lifetime::of(&[Angle]);
        const PERSISTENT: Lifetime = Lifetime::PERSISTENT;

        let num_rx = cfg.num_rx_antennas;
        let num_virtual = cfg.num_virtual_antennas();
        let nr = cfg.num_range_bins;
        let nd = cfg.num_doppler_bins;
        let na = cfg.num_angle_bins;
        let bpm_factor = if cfg.bpm_enabled { 2 } else { 1 };

        let mut requests = vec![
            // L1: per-chirp and per-column working sets
            BufferRequest::new::<Cplx16>(AdcIn, L1, CHIRP, 2 * nr, 8),
            BufferRequest::new::<Cplx16>(RangeFftIn, L1, CHIRP, nr, 8),
            BufferRequest::new::<Cplx16>(DopplerIn, L1, DOPPLER_ANGLE, 2 * nd, 8),
            BufferRequest::new::<Cplx32>(FftOut2D, L1, DOPPLER_ANGLE, bpm_factor * nd, 8),
            BufferRequest::new::<Cplx32>(WindowingBuf2D, L1, DOPPLER_ANGLE, nd, 8),
            BufferRequest::new::<u16>(Log2Abs, L1, DOPPLER, nd, 8),
            BufferRequest::new::<u16>(SumAbs, L1, DOPPLER_CFAR, nd, 8),
            BufferRequest::new::<Cplx32>(AzimuthIn, L1, ANGLE, 2 * na, 8),
            BufferRequest::new::<Cplx32>(AzimuthOut, L1, ANGLE, 2 * na, 8),
            BufferRequest::new::<f32>(AzimuthMagSqr, L1, ANGLE, 2 * na, 8),
            // L2: range spectra, detection scratch, tables
            BufferRequest::new::<Cplx16>(FftOut1D, L2, CHIRP, 2 * num_rx * nr, 8),
            BufferRequest::new::<u32>(DopplerLineMask, L2, DOPPLER_CFAR, (nd / 32).max(1), 4),
            BufferRequest::new::<u16>(CfarIndexBuf, L2, DOPPLER_CFAR, nr.max(nd), 4),
            BufferRequest::new::<u16>(SumAbsRange, L2, CFAR, 2 * nr, 8),
            BufferRequest::new::<CandidateObject>(
                Candidates,
                L2,
                CFAR_GROUPING,
                cfg.max_raw_candidates,
                8,
            ),
        ];

        if let AngleMode::AzimuthElevation(_) = cfg.angle_mode {
            requests.push(BufferRequest::new::<Cplx32>(DoaGrid, L2, ANGLE, na * na, 8));
        }

        requests.extend([
            BufferRequest::new::<i16>(Window1D, L2, PERSISTENT, cfg.num_adc_samples / 2, 8),
            BufferRequest::new::<i32>(Window2D, L2, PERSISTENT, nd / 2, 8),
            BufferRequest::new::<Cplx16>(DftTable, L2, PERSISTENT, nd, 8),
            BufferRequest::new::<DetectedObject>(
                DetectedObjects,
                L2,
                PERSISTENT,
                cfg.max_detected_objects,
                8,
            ),
        ]);

        if cfg.dc_range_sig.enabled {
            requests.push(BufferRequest::new::<Cplx32>(
                DcRangeSigMean,
                L2,
                PERSISTENT,
                num_virtual * cfg.dc_range_sig.num_bins(),
                8,
            ));
        }

        // L3: frame-long storage
        requests.extend([
            BufferRequest::new::<Cplx16>(AdcData, L3, PERSISTENT, num_rx * cfg.num_adc_samples, 8),
            BufferRequest::new::<Cplx16>(RadarCube, L3, PERSISTENT, nr * nd * num_virtual, 8),
            BufferRequest::new::<Cplx16>(Heatmap, L3, PERSISTENT, nr * num_virtual, 8),
            BufferRequest::new::<u16>(DetMatrix, L3, PERSISTENT, nr * nd, 8),
        ]);

        requests
    }

    pub fn placement(&self, id: BufferId) -> Option<&Placement> {
        self.placements.iter().find(|p| p.id == id)
    }

    /// Number of elements reserved for `id`, zero if the buffer is not used
    /// by this configuration.
    pub fn count(&self, id: BufferId) -> usize {
        self.placement(id).map(|p| p.count).unwrap_or(0)
    }

    /// Creates the working buffer for `id` with the planned element count.
    pub fn alloc<T: Clone + Default>(&self, id: BufferId) -> Vec<T> {
        vec![T::default(); self.count(id)]
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn usage(&self) -> &[TierUsage] {
        &self.usage
    }

    /// Logs the per-tier usage.
    pub fn log_stats(&self) {
        for u in &self.usage {
            log::info!(
                "{:?} heap: size {} bytes, used {} bytes, free {} bytes",
                u.tier,
                u.capacity,
                u.used,
                u.capacity - u.used
            );
        }
        for p in &self.placements {
            log::trace!(
                "{:?} {:?}: offset {:#07x}, {} bytes",
                p.tier,
                p.id,
                p.offset,
                p.len_bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArenaCapacities;

    fn assert_live_buffers_disjoint(layout: &MemoryLayout) {
        let placements = layout.placements();
        for (i, a) in placements.iter().enumerate() {
            for b in &placements[i + 1..] {
                if a.lifetime.overlaps(b.lifetime) && a.len_bytes > 0 && b.len_bytes > 0 {
                    assert!(
                        !a.intersects(b),
                        "{:?} and {:?} are live together but overlap",
                        a.id,
                        b.id
                    );
                }
            }
        }
    }

    #[test]
    fn test_default_layout_fits_and_is_disjoint() {
        let cfg = DssConfig::default();
        let layout = MemoryLayout::for_config(&cfg).unwrap();
        assert_live_buffers_disjoint(&layout);
        for u in layout.usage() {
            assert!(u.used <= u.capacity);
        }
    }

    #[test]
    fn test_layouts_disjoint_for_several_configs() {
        let mut configs = vec![
            DssConfig::with_antennas(1, 1),
            DssConfig::with_antennas(1, 4),
            DssConfig::with_antennas(2, 2),
        ];
        let mut bpm = DssConfig::default();
        bpm.bpm_enabled = true;
        bpm.dc_range_sig.enabled = true;
        configs.push(bpm);

        for cfg in configs {
            let layout = MemoryLayout::for_config(&cfg).unwrap();
            assert_live_buffers_disjoint(&layout);
        }
    }

    /// The range stage input and the angle stage buffers are never live
    /// together and start at the same base.
    #[test]
    fn test_exclusive_lifetimes_alias() {
        let layout = MemoryLayout::for_config(&DssConfig::default()).unwrap();
        let fft_1d = layout.placement(BufferId::FftOut1D).unwrap();
        let grid = layout.placement(BufferId::DoaGrid).unwrap();
        assert!(fft_1d.intersects(grid));
        assert_eq!(fft_1d.offset, 0);
        assert_eq!(grid.offset, 0);
    }

    #[test]
    fn test_alignment_rounding() {
        let reqs = [
            BufferRequest::new::<u8>(BufferId::Log2Abs, Tier::L1, Lifetime::PERSISTENT, 3, 1),
            BufferRequest::new::<u8>(BufferId::SumAbs, Tier::L1, Lifetime::PERSISTENT, 5, 8),
        ];
        let layout = MemoryLayout::plan(&reqs, &ArenaCapacities::default()).unwrap();
        assert_eq!(layout.placement(BufferId::SumAbs).unwrap().offset, 8);
        assert_eq!(layout.usage()[0].used, 13);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let reqs = [BufferRequest::new::<u8>(
            BufferId::Log2Abs,
            Tier::L1,
            Lifetime::PERSISTENT,
            3,
            3,
        )];
        assert_eq!(
            MemoryLayout::plan(&reqs, &ArenaCapacities::default()).unwrap_err(),
            ConfigError::InvalidAlignment { align: 3 }
        );
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut cfg = DssConfig::default();
        cfg.arena.l3 = 64 * 1024;
        match MemoryLayout::for_config(&cfg) {
            Err(ConfigError::ArenaOverflow { tier, capacity, .. }) => {
                assert_eq!(tier, Tier::L3);
                assert_eq!(capacity, 64 * 1024);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_pipeline_buffers_sized_from_plan() {
        let layout = MemoryLayout::for_config(&DssConfig::default()).unwrap();
        let cube: Vec<Cplx16> = layout.alloc(BufferId::RadarCube);
        assert_eq!(cube.len(), 256 * 16 * 8);
        assert_eq!(layout.count(BufferId::DcRangeSigMean), 0);
        assert_eq!(layout.count(BufferId::RangeFftIn), 256);
        assert_eq!(layout.count(BufferId::DftTable), 16);
        assert_eq!(layout.count(BufferId::DopplerLineMask), 1);
    }
}
