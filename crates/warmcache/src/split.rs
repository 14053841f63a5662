//! Routing of resident requests around the trailing metadata region
//!
//! Once every cacheable block a request touches is resident, the request
//! is served by plain pass-through I/O. Requests that stay below the
//! caching frontier go to the cache device whole; requests that cross it
//! are split in two, with the suffix served from the origin device at its
//! original address so it never reads the metadata trailer as data.

use crate::layout::CacheLayout;

/// How a fully resident request is routed to the physical devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePlan {
    /// Whole request from the cache device, same sector address
    Cache,
    /// Whole request from the origin device (starts at or past the frontier)
    Origin,
    /// Split at the frontier: first `cache_sectors` from the cache device,
    /// the remainder from the origin device
    Split { cache_sectors: u64 },
}

/// Plan the route for the request at `sector` covering `count` sectors.
///
/// `count` must be non-zero and the range must lie within the device.
pub fn plan_route(layout: &CacheLayout, sector: u64, count: u64) -> RoutePlan {
    let end_block = layout.sector_to_block(sector + count - 1);
    if end_block <= layout.last_caching_block() {
        return RoutePlan::Cache;
    }

    let frontier = layout.frontier_sector();
    if sector >= frontier {
        RoutePlan::Origin
    } else {
        RoutePlan::Split {
            cache_sectors: frontier - sector,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 512B blocks on a 100 sector device: blocks 0..=97 cacheable,
    // frontier at sector 98, trailer in sectors 98..100.
    fn layout() -> CacheLayout {
        CacheLayout::new(512, 100).unwrap()
    }

    #[test]
    fn test_request_below_frontier_goes_to_cache() {
        let layout = layout();
        assert_eq!(plan_route(&layout, 0, 10), RoutePlan::Cache);
        assert_eq!(plan_route(&layout, 90, 8), RoutePlan::Cache);
    }

    #[test]
    fn test_request_past_frontier_goes_to_origin() {
        let layout = layout();
        assert_eq!(plan_route(&layout, 98, 2), RoutePlan::Origin);
        assert_eq!(plan_route(&layout, 99, 1), RoutePlan::Origin);
    }

    #[test]
    fn test_request_crossing_frontier_splits() {
        let layout = layout();
        assert_eq!(
            plan_route(&layout, 96, 4),
            RoutePlan::Split { cache_sectors: 2 }
        );
        // One sector on each side
        assert_eq!(
            plan_route(&layout, 97, 2),
            RoutePlan::Split { cache_sectors: 1 }
        );
    }

    #[test]
    fn test_boundary_scenario_with_multi_sector_blocks() {
        // 4KB blocks on a 754 sector device: 95 blocks total, one bitmap
        // sector, 752 data sectors -> blocks 0..=93 cacheable, frontier at
        // sector 752.
        let layout = CacheLayout::new(4096, 754).unwrap();
        assert_eq!(layout.last_caching_block(), 93);
        assert_eq!(layout.frontier_sector(), 752);

        // Blocks 88..=92: 92 <= 93, entirely cacheable
        assert_eq!(plan_route(&layout, 88 * 8, 5 * 8), RoutePlan::Cache);
        // Blocks 90..=94 cross the frontier
        assert_eq!(
            plan_route(&layout, 90 * 8, 5 * 8),
            RoutePlan::Split {
                cache_sectors: 752 - 720
            }
        );
        // Entirely past the frontier
        assert_eq!(plan_route(&layout, 752, 2), RoutePlan::Origin);
    }
}
