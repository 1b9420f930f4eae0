//! Single-pass ensemble statistics over a selected set of members (spec.md
//! §4.3 "Ensemble filter"), grounded on
//! `structuredgridensemblefilter.cpp`'s `produceData()`.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use wxvis_cache::HostCache;
use wxvis_core::error::PipelineError;
use wxvis_core::item::{
    CacheSized, CompanionRef, CompanionReleaser, ContributingMemberBitmap, DataItem, EnsembleOperation,
    LevelType, StructuredGrid,
};
use wxvis_core::keys::{
    ENS_OPERATION, INIT_TIME, LEVELTYPE, MEMBER, MULTIMEMBER_AUX_REFERENCE, SELECTED_MEMBERS, VALID_TIME,
    VARIABLE,
};
use wxvis_core::request::Request;
use wxvis_scheduler::{Scheduler, TaskSource};

use crate::source::{DataSource, SourceCore};

const OWN_KEYS: &[&str] = &[LEVELTYPE, VARIABLE, INIT_TIME, VALID_TIME, SELECTED_MEMBERS, ENS_OPERATION];

/// Computes MEAN, STDDEV, MIN, MAX, MAX-MIN, and P>x/P<x across a set of
/// ensemble members of a single upstream grid source.
pub struct EnsembleFilterSource {
    core: SourceCore,
    input: Arc<dyn DataSource>,
    self_weak: Weak<EnsembleFilterSource>,
}

impl EnsembleFilterSource {
    pub fn new(
        id: impl Into<String>,
        cache: Arc<HostCache>,
        scheduler: Arc<Scheduler>,
        input: Arc<dyn DataSource>,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|weak| EnsembleFilterSource {
            core: SourceCore::new(id, cache, scheduler),
            input,
            self_weak: weak.clone(),
        })
    }

    fn self_handle(&self) -> Arc<dyn TaskSource> {
        self.self_weak.upgrade().expect("source dropped while request in flight")
    }

    fn member_request(base: &Request, member: u32) -> Request {
        let mut req = base.clone();
        req.remove(SELECTED_MEMBERS);
        req.remove(ENS_OPERATION);
        req.insert(MEMBER, member.to_string());
        req
    }

    /// Allocates a result grid with the same axes/metadata as `template`,
    /// filled with `fill`. Contributing-member bitmaps are allocated only
    /// when `with_flags` is set (MIN/MAX/MAX-MIN/probability results).
    fn new_result_grid(template: &StructuredGrid, generating_request: Request, fill: f64, with_flags: bool) -> StructuredGrid {
        let n = template.data.len();
        StructuredGrid {
            nlon: template.nlon,
            nlat: template.nlat,
            nlev: template.nlev,
            data: vec![fill; n],
            lons: template.lons.clone(),
            lats: template.lats.clone(),
            levels: template.levels.clone(),
            level_type: template.level_type,
            missing_value: template.missing_value,
            generating_request,
            contributing_members: if with_flags { Some(vec![ContributingMemberBitmap::empty(); n]) } else { None },
            companion: None,
        }
    }

    /// Computes the ensemble-mean companion field (surface pressure or
    /// auxiliary pressure) across `selected` members of `template`, when
    /// `template`'s level type needs one. Stores it in the shared cache
    /// under this source's own id and returns a held reference (spec.md
    /// open question resolution: companion is stored before the dependent
    /// grid is returned).
    fn build_companion(
        &self,
        template: &StructuredGrid,
        selected: &BTreeSet<u32>,
        filtered: &Request,
    ) -> Option<CompanionRef> {
        if !matches!(template.level_type, LevelType::HybridSigma | LevelType::AuxiliaryPressure) {
            return None;
        }
        let companion = template.companion.as_ref()?;

        let mut aux_request = companion.request().clone();
        aux_request.remove(MEMBER);
        aux_request.insert(SELECTED_MEMBERS, Request::encode_uint_set(selected));
        aux_request.insert(ENS_OPERATION, MULTIMEMBER_AUX_REFERENCE);

        let shared_cache = self.core.cache();
        let mut mean: Option<StructuredGrid> = None;
        let mut valid_counts: Vec<u32> = Vec::new();

        for &m in selected {
            let member_req = Self::member_request(filtered, m);
            let member_item = self.input.get_data(&member_req).ok()?;
            let member_grid = member_item.as_structured_grid()?;
            let member_companion = member_grid.companion.as_ref()?;
            let member_aux = shared_cache.get(member_companion.owner(), member_companion.request())?;
            let member_aux_grid = member_aux.as_structured_grid()?;

            if mean.is_none() {
                valid_counts = vec![0; member_aux_grid.data.len()];
                mean = Some(Self::new_result_grid(member_aux_grid, aux_request.clone(), 0.0, false));
            }
            let mean_grid = mean.as_mut().unwrap();
            for v in 0..mean_grid.data.len() {
                let x = member_aux_grid.data[v];
                if !member_aux_grid.is_missing(x) {
                    valid_counts[v] += 1;
                    let prev = mean_grid.data[v];
                    mean_grid.data[v] = prev + (x - prev) / valid_counts[v] as f64;
                }
            }

            shared_cache.release(member_companion.owner(), member_companion.request()).ok()?;
            self.input.release_data(&member_req);
        }

        let mut mean_grid = mean?;
        for v in 0..mean_grid.data.len() {
            if valid_counts[v] == 0 {
                mean_grid.data[v] = mean_grid.missing_value;
            }
        }

        let item = DataItem::StructuredGrid(mean_grid);
        let size_kb = item.size_kb();
        shared_cache.store(self.core.id(), &aux_request, item, size_kb).ok()?;
        Some(CompanionRef::new(
            self.core.id().to_string(),
            aux_request,
            shared_cache.clone() as Arc<dyn CompanionReleaser>,
        ))
    }

    fn produce_and_store(&self, request: &Request) -> Result<(), PipelineError> {
        let filtered = SourceCore::filter(request, OWN_KEYS);
        let selected = filtered.get_uint_set(SELECTED_MEMBERS)?;
        if selected.is_empty() {
            return Err(PipelineError::BadRequest("SELECTED_MEMBERS is empty".to_string()));
        }
        let op_str = filtered.get(ENS_OPERATION).ok_or_else(|| PipelineError::Key(ENS_OPERATION.to_string()))?;
        let op = EnsembleOperation::parse(op_str)
            .ok_or_else(|| PipelineError::BadRequest(format!("unsupported ENS_OPERATION: {}", op_str)))?;

        match op {
            EnsembleOperation::Mean | EnsembleOperation::StdDev => self.produce_mean_stddev(&filtered, &selected),
            EnsembleOperation::Min | EnsembleOperation::Max | EnsembleOperation::MaxMin => {
                self.produce_min_max(&filtered, &selected, op)
            }
            EnsembleOperation::ProbabilityGreater(x) => self.produce_probability(&filtered, &selected, x, true),
            EnsembleOperation::ProbabilityLess(x) => self.produce_probability(&filtered, &selected, x, false),
        }
    }

    fn produce_mean_stddev(&self, filtered: &Request, selected: &BTreeSet<u32>) -> Result<(), PipelineError> {
        let mut mean: Option<StructuredGrid> = None;
        let mut stddev_data: Vec<f64> = Vec::new();
        let mut valid_counts: Vec<u32> = Vec::new();
        let mut companion = None;

        for &m in selected {
            let member_req = Self::member_request(filtered, m);
            let member_item = self.input.get_data(&member_req)?;
            let member_grid = member_item
                .as_structured_grid()
                .ok_or_else(|| PipelineError::Value("ensemble filter input is not a grid".to_string()))?;

            if mean.is_none() {
                companion = self.build_companion(member_grid, selected, filtered);
                let mean_req = filtered.clone().with(ENS_OPERATION, "MEAN");
                let mut m0 = Self::new_result_grid(member_grid, mean_req, 0.0, false);
                valid_counts = vec![0; m0.data.len()];
                stddev_data = vec![0.0; m0.data.len()];
                for v in 0..m0.data.len() {
                    if !member_grid.is_missing(member_grid.data[v]) {
                        valid_counts[v] = 1;
                        m0.data[v] = member_grid.data[v];
                    }
                }
                mean = Some(m0);
            } else {
                let mean_grid = mean.as_mut().unwrap();
                for v in 0..mean_grid.data.len() {
                    let x = member_grid.data[v];
                    if member_grid.is_missing(x) {
                        continue;
                    }
                    valid_counts[v] += 1;
                    let prev_mean = mean_grid.data[v];
                    let k = valid_counts[v] as f64;
                    mean_grid.data[v] = prev_mean + (x - prev_mean) / k;
                    stddev_data[v] += (x - prev_mean) * (x - mean_grid.data[v]);
                }
            }
            self.input.release_data(&member_req);
        }

        let mut mean_grid = mean.ok_or_else(|| PipelineError::Value("no ensemble members produced a grid".to_string()))?;
        mean_grid.companion = companion;
        let mut stddev_grid =
            Self::new_result_grid(&mean_grid, filtered.clone().with(ENS_OPERATION, "STDDEV"), 0.0, false);

        for v in 0..stddev_data.len() {
            if valid_counts[v] > 1 {
                stddev_grid.data[v] = (stddev_data[v] / (valid_counts[v] as f64 - 1.0)).sqrt();
            } else {
                stddev_grid.data[v] = mean_grid.missing_value;
                if valid_counts[v] == 0 {
                    mean_grid.data[v] = mean_grid.missing_value;
                }
            }
        }

        let requested_op = filtered.get(ENS_OPERATION).unwrap_or("MEAN").to_string();
        if requested_op == "MEAN" {
            self.store_sibling(stddev_grid.generating_request.clone(), DataItem::StructuredGrid(stddev_grid))?;
            self.store_primary(filtered, DataItem::StructuredGrid(mean_grid))?;
        } else {
            self.store_sibling(mean_grid.generating_request.clone(), DataItem::StructuredGrid(mean_grid))?;
            self.store_primary(filtered, DataItem::StructuredGrid(stddev_grid))?;
        }
        Ok(())
    }

    fn produce_min_max(&self, filtered: &Request, selected: &BTreeSet<u32>, requested_op: EnsembleOperation) -> Result<(), PipelineError> {
        let mut min_grid: Option<StructuredGrid> = None;
        let mut max_grid: Option<StructuredGrid> = None;

        for &m in selected {
            let member_req = Self::member_request(filtered, m);
            let member_item = self.input.get_data(&member_req)?;
            let member_grid = member_item
                .as_structured_grid()
                .ok_or_else(|| PipelineError::Value("ensemble filter input is not a grid".to_string()))?;

            if min_grid.is_none() {
                min_grid = Some(Self::new_result_grid(
                    member_grid,
                    filtered.clone().with(ENS_OPERATION, "MIN"),
                    member_grid.missing_value,
                    true,
                ));
                max_grid = Some(Self::new_result_grid(
                    member_grid,
                    filtered.clone().with(ENS_OPERATION, "MAX"),
                    member_grid.missing_value,
                    true,
                ));
            }
            let min_g = min_grid.as_mut().unwrap();
            let max_g = max_grid.as_mut().unwrap();
            for v in 0..member_grid.data.len() {
                let x = member_grid.data[v];
                if member_grid.is_missing(x) {
                    continue;
                }
                if min_g.is_missing(min_g.data[v]) || x < min_g.data[v] {
                    min_g.data[v] = x;
                    let bitmap = &mut min_g.contributing_members.as_mut().unwrap()[v];
                    *bitmap = ContributingMemberBitmap::empty();
                    bitmap.set(m);
                }
                if max_g.is_missing(max_g.data[v]) || x > max_g.data[v] {
                    max_g.data[v] = x;
                    let bitmap = &mut max_g.contributing_members.as_mut().unwrap()[v];
                    *bitmap = ContributingMemberBitmap::empty();
                    bitmap.set(m);
                }
            }
            self.input.release_data(&member_req);
        }

        let min_grid = min_grid.ok_or_else(|| PipelineError::Value("no ensemble members produced a grid".to_string()))?;
        let max_grid = max_grid.unwrap();

        let mut maxmin_grid = Self::new_result_grid(&min_grid, filtered.clone().with(ENS_OPERATION, "MAX-MIN"), min_grid.missing_value, true);
        for v in 0..maxmin_grid.data.len() {
            if !max_grid.is_missing(max_grid.data[v]) && !min_grid.is_missing(min_grid.data[v]) {
                maxmin_grid.data[v] = max_grid.data[v] - min_grid.data[v];
                // Intersection, not union: a cell's MAX-MIN bitmap only
                // records a member when that same member set both the max
                // and the min at that cell.
                let intersection = max_grid.contributing_members.as_ref().unwrap()[v].intersect(min_grid.contributing_members.as_ref().unwrap()[v]);
                maxmin_grid.contributing_members.as_mut().unwrap()[v] = intersection;
            }
        }

        match requested_op {
            EnsembleOperation::Min => {
                self.store_sibling(max_grid.generating_request.clone(), DataItem::StructuredGrid(max_grid))?;
                self.store_sibling(maxmin_grid.generating_request.clone(), DataItem::StructuredGrid(maxmin_grid))?;
                self.store_primary(filtered, DataItem::StructuredGrid(min_grid))?;
            }
            EnsembleOperation::Max => {
                self.store_sibling(min_grid.generating_request.clone(), DataItem::StructuredGrid(min_grid))?;
                self.store_sibling(maxmin_grid.generating_request.clone(), DataItem::StructuredGrid(maxmin_grid))?;
                self.store_primary(filtered, DataItem::StructuredGrid(max_grid))?;
            }
            _ => {
                self.store_sibling(min_grid.generating_request.clone(), DataItem::StructuredGrid(min_grid))?;
                self.store_sibling(max_grid.generating_request.clone(), DataItem::StructuredGrid(max_grid))?;
                self.store_primary(filtered, DataItem::StructuredGrid(maxmin_grid))?;
            }
        }
        Ok(())
    }

    fn produce_probability(&self, filtered: &Request, selected: &BTreeSet<u32>, threshold: f64, greater: bool) -> Result<(), PipelineError> {
        let mut result: Option<StructuredGrid> = None;
        let mut valid_counts: Vec<u32> = Vec::new();

        for &m in selected {
            let member_req = Self::member_request(filtered, m);
            let member_item = self.input.get_data(&member_req)?;
            let member_grid = member_item
                .as_structured_grid()
                .ok_or_else(|| PipelineError::Value("ensemble filter input is not a grid".to_string()))?;

            if result.is_none() {
                valid_counts = vec![0; member_grid.data.len()];
                result = Some(Self::new_result_grid(member_grid, filtered.clone(), 0.0, true));
            }
            let result_grid = result.as_mut().unwrap();
            for v in 0..result_grid.data.len() {
                let x = member_grid.data[v];
                if member_grid.is_missing(x) {
                    continue;
                }
                valid_counts[v] += 1;
                let satisfies = if greater { x > threshold } else { x < threshold };
                if satisfies {
                    result_grid.data[v] += 1.0;
                    result_grid.contributing_members.as_mut().unwrap()[v].set(m);
                }
            }
            self.input.release_data(&member_req);
        }

        let mut result_grid = result.ok_or_else(|| PipelineError::Value("no ensemble members produced a grid".to_string()))?;
        for v in 0..result_grid.data.len() {
            if valid_counts[v] > 0 {
                result_grid.data[v] /= valid_counts[v] as f64;
            } else {
                result_grid.data[v] = result_grid.missing_value;
            }
        }
        self.store_primary(filtered, DataItem::StructuredGrid(result_grid))
    }

    fn store_primary(&self, filtered: &Request, item: DataItem) -> Result<(), PipelineError> {
        let size_kb = item.size_kb();
        self.core.cache().store(self.core.id(), filtered, item, size_kb)?;
        Ok(())
    }

    /// Stores a by-product result (e.g. STDDEV alongside a requested MEAN)
    /// so a later request for it is a cache hit, then immediately releases
    /// the store-intrinsic reference -- mirrors the original's "get/release
    /// ... necessary to avoid blocking the item in the active cache".
    fn store_sibling(&self, request: Request, item: DataItem) -> Result<(), PipelineError> {
        let size_kb = item.size_kb();
        let (_, inserted) = self.core.cache().store(self.core.id(), &request, item, size_kb)?;
        if inserted {
            self.core.cache().release(self.core.id(), &request)?;
        }
        Ok(())
    }
}

impl DataSource for EnsembleFilterSource {
    fn source_id(&self) -> &str {
        self.core.id()
    }

    fn locally_required_keys(&self) -> &'static [&'static str] {
        OWN_KEYS
    }

    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>, PipelineError> {
        let filtered = SourceCore::filter(request, OWN_KEYS);
        self.core.get_data(&filtered, self.self_handle())
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }
}

impl TaskSource for EnsembleFilterSource {
    fn source_id(&self) -> &str {
        self.core.id()
    }

    fn process_request(&self, request: &Request) -> Result<(), PipelineError> {
        self.produce_and_store(request)
    }

    fn acquire_additional_reference(&self, request: &Request) {
        self.core.acquire_additional_reference(request);
    }

    fn notify_completion(&self, request: &Request) {
        self.core.notify_completion(request);
    }
}
