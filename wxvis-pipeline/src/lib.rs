//! Demand-driven data sources built on top of `wxvis-cache` and
//! `wxvis-scheduler` (spec.md §4 "Pipeline sources").

pub mod difference;
pub mod ensemble_filter;
pub mod exporter;
pub mod pass_through;
pub mod reader;
pub mod source;
pub mod trajectory_source;

pub use difference::DifferenceSource;
pub use ensemble_filter::EnsembleFilterSource;
pub use exporter::export_lagranto2;
pub use pass_through::PassThroughFilter;
pub use reader::StaticGridSource;
pub use source::{DataSource, SourceCore};
pub use trajectory_source::{ConformanceOptions, PrecomputedTrajectorySource};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wxvis_cache::new_host_cache;
    use wxvis_core::item::{LevelType, StructuredGrid, MISSING_VALUE};
    use wxvis_core::keys::{ENS_OPERATION, INIT_TIME, LEVELTYPE, MEMBER, SELECTED_MEMBERS, VALID_TIME, VARIABLE};
    use wxvis_core::request::Request;
    use wxvis_scheduler::Scheduler;

    use super::*;

    fn base_request() -> Request {
        Request::new()
            .with(VARIABLE, "T")
            .with(LEVELTYPE, "PRESSURE")
            .with(INIT_TIME, "0")
            .with(VALID_TIME, "10800")
    }

    fn fixture_grid(fill: f64, request: &Request) -> StructuredGrid {
        StructuredGrid {
            nlon: 2,
            nlat: 2,
            nlev: 1,
            data: vec![fill; 4],
            lons: vec![0.0, 1.0],
            lats: vec![0.0, 1.0],
            levels: vec![1000.0],
            level_type: LevelType::Pressure,
            missing_value: MISSING_VALUE,
            generating_request: request.clone(),
            contributing_members: None,
            companion: None,
        }
    }

    fn register_members(reader: &Arc<StaticGridSource>, base: &Request, values: &[f64]) {
        for (m, &v) in values.iter().enumerate() {
            let mut req = base.clone();
            req.insert(MEMBER, m.to_string());
            reader.register(&req, fixture_grid(v, &req));
        }
    }

    // spec.md §8 seed scenario 1: MEAN of a uniform ensemble returns the
    // shared constant, and STDDEV of that same ensemble is zero.
    #[test]
    fn ensemble_mean_of_identical_members_is_identity() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(4);
        let reader = StaticGridSource::new("reader", cache.clone(), scheduler.clone());
        let base = base_request();
        register_members(&reader, &base, &[5.0, 5.0, 5.0]);

        let ensemble = EnsembleFilterSource::new("ens", cache.clone(), scheduler.clone(), reader.clone());

        let mut mean_req = base.clone();
        mean_req.insert(SELECTED_MEMBERS, Request::encode_uint_set(&[0, 1, 2].into_iter().collect()));
        mean_req.insert(ENS_OPERATION, "MEAN");

        let mean_item = ensemble.get_data(&mean_req).unwrap();
        let mean_grid = mean_item.as_structured_grid().unwrap();
        assert!(mean_grid.data.iter().all(|&v| (v - 5.0).abs() < 1e-9));
        ensemble.release_data(&mean_req);

        let mut stddev_req = base;
        stddev_req.insert(SELECTED_MEMBERS, Request::encode_uint_set(&[0, 1, 2].into_iter().collect()));
        stddev_req.insert(ENS_OPERATION, "STDDEV");
        let stddev_item = ensemble.get_data(&stddev_req).unwrap();
        let stddev_grid = stddev_item.as_structured_grid().unwrap();
        assert!(stddev_grid.data.iter().all(|&v| v.abs() < 1e-9));
        ensemble.release_data(&stddev_req);
    }

    // spec.md §8 seed scenario 2: P>x reports the fraction of members
    // exceeding the threshold at each grid cell.
    #[test]
    fn probability_greater_counts_exceeding_members() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(4);
        let reader = StaticGridSource::new("reader", cache.clone(), scheduler.clone());
        let base = base_request();
        register_members(&reader, &base, &[1.0, 6.0, 9.0, 2.0]);

        let ensemble = EnsembleFilterSource::new("ens", cache.clone(), scheduler.clone(), reader.clone());
        let mut req = base;
        req.insert(SELECTED_MEMBERS, Request::encode_uint_set(&[0, 1, 2, 3].into_iter().collect()));
        req.insert(ENS_OPERATION, "P>5");

        let item = ensemble.get_data(&req).unwrap();
        let grid = item.as_structured_grid().unwrap();
        assert!(grid.data.iter().all(|&v| (v - 0.5).abs() < 1e-9));
        ensemble.release_data(&req);
    }

    // spec.md §8 seed scenario 3: a difference source propagates a missing
    // value from either operand rather than computing a bogus difference.
    #[test]
    fn difference_propagates_missing_values() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(4);

        let reader_a = StaticGridSource::new("a", cache.clone(), scheduler.clone());
        let reader_b = StaticGridSource::new("b", cache.clone(), scheduler.clone());

        let base = base_request();
        let mut grid_a = fixture_grid(10.0, &base);
        grid_a.data[0] = MISSING_VALUE;
        reader_a.register(&base, grid_a);
        reader_b.register(&base, fixture_grid(3.0, &base));

        let base_req_a = Request::new()
            .with(VARIABLE, "REQUESTED_VARIABLE")
            .with(LEVELTYPE, "REQUESTED_LEVELTYPE")
            .with(INIT_TIME, "REQUESTED_INIT_TIME")
            .with(VALID_TIME, "REQUESTED_VALID_TIME");
        let base_req_b = base_req_a.clone();

        let diff = difference::DifferenceSource::new(
            "diff",
            cache.clone(),
            scheduler.clone(),
            [reader_a.clone(), reader_b.clone()],
            [base_req_a, base_req_b],
        );

        let item = diff.get_data(&base).unwrap();
        let grid = item.as_structured_grid().unwrap();
        assert!(grid.is_missing(grid.data[0]));
        assert!((grid.data[1] - 7.0).abs() < 1e-9);
        diff.release_data(&base);
    }

    // MAX-MIN's per-cell bitmap is the intersection, not the union, of the
    // max-grid's and min-grid's contributing-member bitmaps (matching
    // `structuredgridensemblefilter.cpp`'s `MAX_MIN` branch): a member only
    // appears when it set both the max and the min at that cell, which only
    // happens when it was the sole valid contributor there.
    #[test]
    fn max_min_bitmap_is_the_intersection_of_the_extrema_bitmaps() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(4);
        let reader = StaticGridSource::new("reader", cache.clone(), scheduler.clone());
        let base = base_request();

        let mut member0 = fixture_grid(0.0, &{
            let mut r = base.clone();
            r.insert(MEMBER, "0");
            r
        });
        member0.data = vec![1.0, MISSING_VALUE, 5.0, 2.0];
        let mut member1 = fixture_grid(0.0, &{
            let mut r = base.clone();
            r.insert(MEMBER, "1");
            r
        });
        member1.data = vec![3.0, 4.0, MISSING_VALUE, 2.0];

        let req0 = member0.generating_request.clone();
        let req1 = member1.generating_request.clone();
        reader.register(&req0, member0);
        reader.register(&req1, member1);

        let ensemble = EnsembleFilterSource::new("ens", cache.clone(), scheduler.clone(), reader.clone());
        let mut req = base;
        req.insert(SELECTED_MEMBERS, Request::encode_uint_set(&[0, 1].into_iter().collect()));
        req.insert(ENS_OPERATION, "MAX-MIN");

        let item = ensemble.get_data(&req).unwrap();
        let grid = item.as_structured_grid().unwrap();
        let bitmaps = grid.contributing_members.as_ref().unwrap();

        assert!(!bitmaps[0].is_set(0) && !bitmaps[0].is_set(1), "cell 0: different members set max and min, intersection is empty");
        assert!(bitmaps[1].is_set(1) && !bitmaps[1].is_set(0), "cell 1: only member 1 is valid, it sets both extrema");
        assert!(bitmaps[2].is_set(0) && !bitmaps[2].is_set(1), "cell 2: only member 0 is valid, it sets both extrema");
        assert!(bitmaps[3].is_set(0) && !bitmaps[3].is_set(1), "cell 3: tied values, the first-processed member keeps both extrema");
        ensemble.release_data(&req);
    }

    // Regression test: after a single caller's blocking `get_data` resolves
    // and it calls `release_data`, the produced item must be fully released
    // (back to evictable) rather than left pinned with a residual reference
    // `release_data` never accounts for. `SourceCore::get_data`'s producer
    // path owns exactly one reference -- the one `store()` creates with
    // refcount 1 -- and must hand that same reference back rather than
    // acquiring a second one of its own.
    #[test]
    fn get_data_does_not_leak_a_reference_once_released() {
        let cache = new_host_cache("host", 1 << 20);
        let scheduler = Scheduler::new(4);
        let reader = StaticGridSource::new("reader", cache.clone(), scheduler.clone());
        let base = base_request();
        register_members(&reader, &base, &[5.0, 5.0, 5.0]);

        let ensemble = EnsembleFilterSource::new("ens", cache.clone(), scheduler.clone(), reader.clone());
        let mut mean_req = base;
        mean_req.insert(SELECTED_MEMBERS, Request::encode_uint_set(&[0, 1, 2].into_iter().collect()));
        mean_req.insert(ENS_OPERATION, "MEAN");

        let before = cache.usage_kb();
        ensemble.get_data(&mean_req).unwrap();
        ensemble.release_data(&mean_req);
        cache.clear_released();
        assert_eq!(
            cache.usage_kb(),
            before,
            "a single caller's get_data/release_data pair must not leave a residual reference"
        );
    }
}
