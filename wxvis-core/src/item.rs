//! Cacheable data item variants (spec.md §3 "DataItem variants").
//!
//! Tagged variants are used instead of an inheritance hierarchy (spec.md §9
//! "Deep inheritance" design note): a flat [`DataItem`] enum covers every
//! host-resident artifact the pipeline produces, and [`GpuBufferItem`]
//! covers the device-resident counterpart kept in the separate GPU cache.

use std::sync::Arc;

use crate::request::Request;

/// Sentinel written into a grid cell that has no valid value.
pub const MISSING_VALUE: f64 = -999.0;

/// How a [`StructuredGrid`]'s vertical axis should be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelType {
    /// Levels are given in hPa directly.
    Pressure,
    /// Levels are hybrid-sigma coefficients; a companion 2D surface-pressure
    /// grid is required to resolve actual pressure at a grid point.
    HybridSigma,
    /// Levels index into a companion 3D auxiliary-pressure grid.
    AuxiliaryPressure,
    /// Levels are given as log(pressure).
    LogPressure,
    /// A single 2D surface-level field.
    Surface,
}

/// A callback back into whichever cache owns the companion field, invoked
/// when a dependent grid holding a companion reference is finally dropped.
///
/// This indirection exists so that [`StructuredGrid`] (a plain data type)
/// does not need to depend on the cache crate that actually implements
/// reference counting -- the cache crate supplies the implementation and
/// hands itself to the grid as a trait object (spec.md §5 "shared-resource
/// policy": "a dependent grid ... must release that reference in its
/// destructor").
pub trait CompanionReleaser: Send + Sync + std::fmt::Debug {
    /// Releases one reference previously acquired on `(owner, request)`.
    fn release_companion(&self, owner: &str, request: &Request);
}

/// A live reference to a companion field, held for the full lifetime of
/// the dependent grid that owns it.
#[derive(Debug)]
pub struct CompanionRef {
    owner: String,
    request: Request,
    releaser: Arc<dyn CompanionReleaser>,
}

impl CompanionRef {
    /// Constructs a companion reference. Callers must have already
    /// acquired the corresponding reference count on `(owner, request)`
    /// before constructing this -- dropping a `CompanionRef` always
    /// releases exactly one reference.
    pub fn new(owner: impl Into<String>, request: Request, releaser: Arc<dyn CompanionReleaser>) -> Self {
        CompanionRef {
            owner: owner.into(),
            request,
            releaser,
        }
    }

    /// The owning source id of the companion field.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The canonical request identifying the companion field.
    pub fn request(&self) -> &Request {
        &self.request
    }
}

impl Drop for CompanionRef {
    fn drop(&mut self) {
        self.releaser.release_companion(&self.owner, &self.request);
    }
}

/// A 2D or 3D lat/lon grid.
#[derive(Debug)]
pub struct StructuredGrid {
    pub nlon: usize,
    pub nlat: usize,
    pub nlev: usize,
    /// Row-major `[lev][lat][lon]` flattened data.
    pub data: Vec<f64>,
    pub lons: Vec<f64>,
    pub lats: Vec<f64>,
    /// Vertical coordinate values; empty for `LevelType::Surface`.
    pub levels: Vec<f64>,
    pub level_type: LevelType,
    pub missing_value: f64,
    pub generating_request: Request,
    /// Per-cell bitmap of which ensemble member set the value, populated
    /// only for MIN/MAX/MAX-MIN ensemble operation results.
    pub contributing_members: Option<Vec<ContributingMemberBitmap>>,
    /// A live reference into the host cache for the surface-pressure (for
    /// `HybridSigma`) or 3D pressure (for `AuxiliaryPressure`) companion
    /// field. Held for this grid's full lifetime; released on drop.
    pub companion: Option<CompanionRef>,
}

impl StructuredGrid {
    /// Index into `data`/`contributing_members` for grid point `(lev, lat, lon)`.
    pub fn index(&self, lev: usize, lat: usize, lon: usize) -> usize {
        (lev * self.nlat + lat) * self.nlon + lon
    }

    /// Value at `(lev, lat, lon)`.
    pub fn at(&self, lev: usize, lat: usize, lon: usize) -> f64 {
        self.data[self.index(lev, lat, lon)]
    }

    /// True if `v` is the missing-value sentinel for this grid.
    pub fn is_missing(&self, v: f64) -> bool {
        v == self.missing_value
    }

    /// Samples this grid at an arbitrary geographic point: bilinear in
    /// lon/lat, nearest level in pressure. Returns `None` (propagated by
    /// callers as a missing value) if the point falls outside the grid's
    /// coordinate axes, or if any of the four horizontal corners are
    /// themselves missing.
    pub fn interpolate(&self, lon: f64, lat: f64, pressure_hpa: f64) -> Option<f64> {
        let lon_idx = bracket(&self.lons, lon)?;
        let lat_idx = bracket(&self.lats, lat)?;
        let lev = nearest_index(&self.levels, pressure_hpa);

        let (i0, i1, fx) = lon_idx;
        let (j0, j1, fy) = lat_idx;

        let v00 = self.at(lev, j0, i0);
        let v10 = self.at(lev, j0, i1);
        let v01 = self.at(lev, j1, i0);
        let v11 = self.at(lev, j1, i1);
        if [v00, v10, v01, v11].iter().any(|v| self.is_missing(*v)) {
            return None;
        }

        let top = v00 * (1.0 - fx) + v10 * fx;
        let bottom = v01 * (1.0 - fx) + v11 * fx;
        Some(top * (1.0 - fy) + bottom * fy)
    }

    fn approx_size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
            + self.lons.len() * std::mem::size_of::<f64>()
            + self.lats.len() * std::mem::size_of::<f64>()
            + self.levels.len() * std::mem::size_of::<f64>()
            + self
                .contributing_members
                .as_ref()
                .map(|v| v.len() * std::mem::size_of::<u64>())
                .unwrap_or(0)
    }
}

/// Finds the pair of ascending-sorted `axis` indices bracketing `value`,
/// plus the fractional position between them. `None` if `value` is outside
/// `[axis[0], axis[last]]` or `axis` has fewer than two points.
fn bracket(axis: &[f64], value: f64) -> Option<(usize, usize, f64)> {
    if axis.len() < 2 || value < axis[0] || value > axis[axis.len() - 1] {
        return None;
    }
    let hi = axis.iter().position(|&x| x >= value).unwrap_or(axis.len() - 1);
    if hi == 0 {
        return Some((0, 0, 0.0));
    }
    let lo = hi - 1;
    let span = axis[hi] - axis[lo];
    let frac = if span == 0.0 { 0.0 } else { (value - axis[lo]) / span };
    Some((lo, hi, frac))
}

/// Index of the closest value in `axis` to `value`; `0` for an empty or
/// single-element axis (e.g. a 2D surface grid).
fn nearest_index(axis: &[f64], value: f64) -> usize {
    axis.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (**a - value).abs().partial_cmp(&(**b - value).abs()).unwrap()
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Per-cell flag set recording which ensemble members set an extremum, or
/// satisfied a threshold predicate. Supports up to 64 members.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContributingMemberBitmap(pub u64);

impl ContributingMemberBitmap {
    pub fn empty() -> Self {
        ContributingMemberBitmap(0)
    }

    pub fn set(&mut self, member: u32) {
        self.0 |= 1u64 << member;
    }

    pub fn is_set(&self, member: u32) -> bool {
        (self.0 & (1u64 << member)) != 0
    }

    pub fn union(self, other: Self) -> Self {
        ContributingMemberBitmap(self.0 | other.0)
    }

    pub fn intersect(self, other: Self) -> Self {
        ContributingMemberBitmap(self.0 & other.0)
    }
}

/// Ensemble operations accepted by the ensemble filter source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EnsembleOperation {
    Mean,
    StdDev,
    Min,
    Max,
    MaxMin,
    /// `P>x`: fraction of members exceeding `x`.
    ProbabilityGreater(f64),
    /// `P<x`: fraction of members below `x`.
    ProbabilityLess(f64),
}

impl EnsembleOperation {
    /// Parses the `ENS_OPERATION` request value.
    pub fn parse(raw: &str) -> Option<EnsembleOperation> {
        match raw {
            "MEAN" => Some(EnsembleOperation::Mean),
            "STDDEV" => Some(EnsembleOperation::StdDev),
            "MIN" => Some(EnsembleOperation::Min),
            "MAX" => Some(EnsembleOperation::Max),
            "MAX-MIN" => Some(EnsembleOperation::MaxMin),
            _ => {
                if let Some(rest) = raw.strip_prefix("P>") {
                    rest.parse::<f64>().ok().map(EnsembleOperation::ProbabilityGreater)
                } else if let Some(rest) = raw.strip_prefix("P<") {
                    rest.parse::<f64>().ok().map(EnsembleOperation::ProbabilityLess)
                } else {
                    None
                }
            }
        }
    }

    /// The companion operation computed alongside this one in a single
    /// pass, if any (spec.md: STDDEV is computed together with MEAN).
    pub fn companion(&self) -> Option<EnsembleOperation> {
        match self {
            EnsembleOperation::Mean => Some(EnsembleOperation::StdDev),
            EnsembleOperation::StdDev => Some(EnsembleOperation::Mean),
            _ => None,
        }
    }

    /// The request-value text form.
    pub fn to_request_value(self) -> String {
        match self {
            EnsembleOperation::Mean => "MEAN".to_string(),
            EnsembleOperation::StdDev => "STDDEV".to_string(),
            EnsembleOperation::Min => "MIN".to_string(),
            EnsembleOperation::Max => "MAX".to_string(),
            EnsembleOperation::MaxMin => "MAX-MIN".to_string(),
            EnsembleOperation::ProbabilityGreater(x) => format!("P>{}", x),
            EnsembleOperation::ProbabilityLess(x) => format!("P<{}", x),
        }
    }
}

/// A single vertex of a trajectory: geographic position plus pressure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrajectoryVertex {
    pub lon: f64,
    pub lat: f64,
    pub pressure: f64,
}

/// A batch of particle trajectories, laid out contiguously for a
/// render-batched draw call (spec.md §6 "Render artifact formats").
#[derive(Debug)]
pub struct Trajectories {
    /// `[traj0_t0..traj0_tN, traj1_t0..traj1_tN, ...]`
    pub vertices: Vec<TrajectoryVertex>,
    /// One timestamp (seconds since `start_time_unix`) per time step.
    pub times_seconds: Vec<f64>,
    /// `[num_trajectories][num_timesteps][num_aux_vars]` flattened,
    /// row-major by trajectory then timestep then variable.
    pub aux_variables: Vec<f64>,
    pub aux_variable_names: Vec<String>,
    pub num_trajectories: usize,
    pub timesteps_per_trajectory: usize,
    pub start_time_unix: i64,
    pub generating_request: Request,
}

impl Trajectories {
    /// Render-batch start index for trajectory `i`.
    pub fn start_index(&self, i: usize) -> usize {
        i * self.timesteps_per_trajectory
    }

    /// Render-batch vertex count for trajectory `i`.
    pub fn count(&self, _i: usize) -> usize {
        self.timesteps_per_trajectory
    }

    /// All start indices, spec.md §6: `startIndices[i] = i * timestepsPerTraj`.
    pub fn start_indices(&self) -> Vec<u32> {
        (0..self.num_trajectories)
            .map(|i| self.start_index(i) as u32)
            .collect()
    }

    /// All per-trajectory counts.
    pub fn counts(&self) -> Vec<u32> {
        vec![self.timesteps_per_trajectory as u32; self.num_trajectories]
    }

    /// Value of aux variable `var` for trajectory `traj` at time step `t`.
    pub fn aux_value(&self, traj: usize, t: usize, var: usize) -> f64 {
        let num_vars = self.aux_variable_names.len();
        let vertex_index = traj * self.timesteps_per_trajectory + t;
        self.aux_variables[vertex_index * num_vars + var]
    }
}

/// A filtered view over a [`Trajectories`] item: which trajectories (and,
/// for the read-only default, which full-length runs of them) survive a
/// pressure/time/bbox filter.
#[derive(Clone, Debug)]
pub struct TrajectorySelection {
    pub start_indices: Vec<u32>,
    pub counts: Vec<u32>,
    pub num_selected: usize,
    pub referenced_request: Request,
    max_allocated: usize,
}

impl TrajectorySelection {
    pub fn new(start_indices: Vec<u32>, counts: Vec<u32>, referenced_request: Request) -> Self {
        let max_allocated = start_indices.len();
        TrajectorySelection {
            num_selected: max_allocated,
            start_indices,
            counts,
            referenced_request,
            max_allocated,
        }
    }

    pub fn max_allocated(&self) -> usize {
        self.max_allocated
    }

    /// Shrinks the number of currently-selected entries. Per spec.md
    /// invariant, a selection's `numSelected` may only decrease.
    pub fn set_num_selected(&mut self, n: usize) -> Result<(), crate::error::PipelineError> {
        if n > self.max_allocated {
            return Err(crate::error::PipelineError::Value(format!(
                "numSelected {} exceeds maxAllocated {}",
                n, self.max_allocated
            )));
        }
        if n > self.num_selected {
            return Err(crate::error::PipelineError::Value(
                "numSelected may only decrease".to_string(),
            ));
        }
        self.num_selected = n;
        Ok(())
    }
}

/// Per-vertex unit normals for one scene view's pressure-to-world-z
/// parameterization.
#[derive(Debug)]
pub struct TrajectoryNormals {
    /// One `(x, y, z)` unit vector per vertex, flattened.
    pub normals: Vec<[f32; 3]>,
    pub generating_request: Request,
}

/// A device-resident buffer. The core never allocates real GPU memory
/// (OpenGL rendering is out of scope, spec.md §1); this models the
/// bookkeeping the GPU cache needs: byte size and a resize hook.
#[derive(Debug, Clone)]
pub struct GpuBufferItem {
    pub byte_len: usize,
    pub label: String,
    pub generating_request: Request,
}

impl GpuBufferItem {
    pub fn size_kb(&self) -> u64 {
        ((self.byte_len + 1023) / 1024) as u64
    }
}

/// Anything that can report its own footprint for cache accounting.
pub trait CacheSized {
    fn size_kb(&self) -> u64;
}

/// Tagged union of everything the host cache stores.
#[derive(Debug)]
pub enum DataItem {
    StructuredGrid(StructuredGrid),
    Trajectories(Trajectories),
    TrajectorySelection(TrajectorySelection),
    TrajectoryNormals(TrajectoryNormals),
}

impl DataItem {
    pub fn generating_request(&self) -> &Request {
        match self {
            DataItem::StructuredGrid(g) => &g.generating_request,
            DataItem::Trajectories(t) => &t.generating_request,
            DataItem::TrajectorySelection(s) => &s.referenced_request,
            DataItem::TrajectoryNormals(n) => &n.generating_request,
        }
    }

    pub fn as_structured_grid(&self) -> Option<&StructuredGrid> {
        match self {
            DataItem::StructuredGrid(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_trajectories(&self) -> Option<&Trajectories> {
        match self {
            DataItem::Trajectories(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_trajectory_selection(&self) -> Option<&TrajectorySelection> {
        match self {
            DataItem::TrajectorySelection(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_trajectory_normals(&self) -> Option<&TrajectoryNormals> {
        match self {
            DataItem::TrajectoryNormals(n) => Some(n),
            _ => None,
        }
    }
}

impl CacheSized for DataItem {
    fn size_kb(&self) -> u64 {
        let bytes = match self {
            DataItem::StructuredGrid(g) => g.approx_size_bytes(),
            DataItem::Trajectories(t) => {
                t.vertices.len() * std::mem::size_of::<TrajectoryVertex>()
                    + t.times_seconds.len() * std::mem::size_of::<f64>()
                    + t.aux_variables.len() * std::mem::size_of::<f64>()
            }
            DataItem::TrajectorySelection(s) => {
                (s.start_indices.len() + s.counts.len()) * std::mem::size_of::<u32>()
            }
            DataItem::TrajectoryNormals(n) => n.normals.len() * std::mem::size_of::<[f32; 3]>(),
        };
        ((bytes + 1023) / 1024) as u64
    }
}

impl CacheSized for GpuBufferItem {
    fn size_kb(&self) -> u64 {
        GpuBufferItem::size_kb(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensemble_operation_parses_and_round_trips() {
        assert_eq!(EnsembleOperation::parse("MEAN"), Some(EnsembleOperation::Mean));
        assert_eq!(
            EnsembleOperation::parse("P>10"),
            Some(EnsembleOperation::ProbabilityGreater(10.0))
        );
        assert_eq!(EnsembleOperation::Mean.companion(), Some(EnsembleOperation::StdDev));
        assert_eq!(EnsembleOperation::Min.companion(), None);
    }

    #[test]
    fn trajectory_selection_rejects_growth() {
        let mut sel = TrajectorySelection::new(vec![0, 4], vec![4, 4], Request::new());
        assert_eq!(sel.num_selected, 2);
        sel.set_num_selected(1).unwrap();
        assert!(sel.set_num_selected(2).is_err());
    }

    #[test]
    fn contributing_member_bitmap_union() {
        let mut a = ContributingMemberBitmap::empty();
        a.set(1);
        let mut b = ContributingMemberBitmap::empty();
        b.set(3);
        let u = a.union(b);
        assert!(u.is_set(1));
        assert!(u.is_set(3));
        assert!(!u.is_set(2));
    }

    #[test]
    fn contributing_member_bitmap_intersect() {
        let mut a = ContributingMemberBitmap::empty();
        a.set(1);
        a.set(2);
        let mut b = ContributingMemberBitmap::empty();
        b.set(2);
        b.set(3);
        let i = a.intersect(b);
        assert!(i.is_set(2));
        assert!(!i.is_set(1));
        assert!(!i.is_set(3));
    }
}
