//! LAGRANTO-2 ASCII trajectory export (spec.md §6 "LAGRANTO-2 ASCII
//! export"). A one-shot text dump, unrelated to the cache -- callers pull a
//! [`Trajectories`] item out themselves and hand it here.

use chrono::{TimeZone, Utc};

use wxvis_core::item::Trajectories;

/// Renders `trajectories` as LAGRANTO-2 ASCII text.
///
/// `aux_var_widths` is not needed: column widths follow the original
/// tool's loose whitespace-separated convention rather than fixed-width
/// fields.
pub fn export_lagranto2(trajectories: &Trajectories) -> String {
    let mut out = String::new();

    let reference = Utc.timestamp_opt(trajectories.start_time_unix, 0).single().unwrap_or_else(Utc::now);
    let range_minutes = trajectories
        .times_seconds
        .last()
        .copied()
        .unwrap_or(0.0)
        / 60.0;
    out.push_str(&format!(
        "Reference date {} / Time range {} min\n",
        reference.format("%Y%m%d_%H%M"),
        range_minutes as i64
    ));

    out.push_str("time [h]   lon   lat   p");
    for name in &trajectories.aux_variable_names {
        out.push_str("  ");
        out.push_str(name);
    }
    out.push('\n');

    let num_vars = trajectories.aux_variable_names.len();
    for traj in 0..trajectories.num_trajectories {
        for t in 0..trajectories.timesteps_per_trajectory {
            let vertex_index = traj * trajectories.timesteps_per_trajectory + t;
            let vertex = trajectories.vertices[vertex_index];
            let hours = trajectories.times_seconds[t] / 3600.0;
            out.push_str(&format!("{:.2}   {:.3}   {:.3}   {:.2}", hours, vertex.lon, vertex.lat, vertex.pressure));
            for var in 0..num_vars {
                out.push_str(&format!("  {:.3}", trajectories.aux_value(traj, t, var)));
            }
            out.push('\n');
        }
    }

    out
}
