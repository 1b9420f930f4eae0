//! Well-known request keys (spec.md §6 "DataSource input contract").
//!
//! Collected in one place so that sources and the orchestrator never
//! hand-type a key string more than once.

pub const INIT_TIME: &str = "INIT_TIME";
pub const VALID_TIME: &str = "VALID_TIME";
pub const MEMBER: &str = "MEMBER";
pub const SELECTED_MEMBERS: &str = "SELECTED_MEMBERS";
pub const ENS_OPERATION: &str = "ENS_OPERATION";
pub const VARIABLE: &str = "VARIABLE";
pub const LEVELTYPE: &str = "LEVELTYPE";
pub const NORMALS_LOGP_SCALED: &str = "NORMALS_LOGP_SCALED";
pub const MULTIVARTRAJECTORIES_LOGP_SCALED: &str = "MULTIVARTRAJECTORIES_LOGP_SCALED";
pub const FILTER_PRESSURE_TIME: &str = "FILTER_PRESSURE_TIME";
pub const FILTER_BBOX: &str = "FILTER_BBOX";
pub const FILTER_TIMESTEP: &str = "FILTER_TIMESTEP";
pub const TRY_PRECOMPUTED: &str = "TRY_PRECOMPUTED";
pub const TIME_SPAN: &str = "TIME_SPAN";

pub const LINE_TYPE: &str = "LINE_TYPE";
pub const END_TIME: &str = "END_TIME";
pub const INTEGRATION_METHOD: &str = "INTEGRATION_METHOD";
pub const INTERPOLATION_METHOD: &str = "INTERPOLATION_METHOD";
pub const SUBTIMESTEPS_PER_DATATIMESTEP: &str = "SUBTIMESTEPS_PER_DATATIMESTEP";
pub const STREAMLINE_DELTA_S: &str = "STREAMLINE_DELTA_S";
pub const STREAMLINE_LENGTH: &str = "STREAMLINE_LENGTH";
pub const SEED_TYPE: &str = "SEED_TYPE";
pub const SEED_MIN_POSITION: &str = "SEED_MIN_POSITION";
pub const SEED_MAX_POSITION: &str = "SEED_MAX_POSITION";
pub const SEED_STEP_SIZE_LON_LAT: &str = "SEED_STEP_SIZE_LON_LAT";
pub const SEED_PRESSURE_LEVELS: &str = "SEED_PRESSURE_LEVELS";

/// Internal-only key used by [`crate::request::Request`] pass-through
/// signaling between a filter and its downstream source (spec.md §4.2
/// "Pass-through").
pub const PASS: &str = "PASS";

/// Placeholder values resolved by difference sources (spec.md §4.3
/// "Difference") before dispatching to inputs.
pub const REQUESTED_VALID_TIME: &str = "REQUESTED_VALID_TIME";
pub const REQUESTED_INIT_TIME: &str = "REQUESTED_INIT_TIME";
pub const REQUESTED_INIT_TIME_FROM_VALID_TIME_OF_DAY: &str =
    "REQUESTED_INIT_TIME_FROM_VALID_TIME_OF_DAY";

/// Sentinel value for keys that mean "every timestep" / "every time",
/// e.g. `FILTER_TIMESTEP=ALL` or `TIME_SPAN=ALL`.
pub const ALL: &str = "ALL";

/// The companion request for an ensemble operation that produces an
/// auxiliary-pressure reference grid alongside the top-level result
/// (spec.md §4.3 "Ensemble filter").
pub const MULTIMEMBER_AUX_REFERENCE: &str = "MULTIMEMBER_AUX_REFERENCE";
