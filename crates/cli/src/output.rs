use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use kiln_core::conditions::Condition;
use kiln_core::RawObject;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output { Human, Json, Yaml }

pub fn render(output: Output, objects: &[RawObject], now: DateTime<Utc>) -> Result<String> {
    Ok(match output {
        Output::Human => table(objects, now),
        Output::Json => serde_json::to_string_pretty(objects)?,
        Output::Yaml => serde_yaml::to_string(objects)?,
    })
}

fn table(objects: &[RawObject], now: DateTime<Utc>) -> String {
    let mut out = format!("{:<10} {:<28} {:<34} {}", "KIND", "NAMESPACE/NAME", "CONDITIONS", "AGE");
    for o in objects {
        let name = format!("{}/{}", o.metadata.namespace, o.metadata.name);
        let age = o.metadata.creation_timestamp.map(|t| render_age(now, t)).unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("\n{:<10} {:<28} {:<34} {}", o.kind.as_str(), name, conditions(o), age));
    }
    out
}

fn conditions(o: &RawObject) -> String {
    let conds: Vec<Condition> = o
        .status
        .get("conditions")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default();
    if conds.is_empty() {
        return "-".to_string();
    }
    conds.iter().map(|c| format!("{}={}", c.type_, c.status)).collect::<Vec<_>>().join(",")
}

/// Coarse age in the two largest units, e.g. `3d4h` or `12m`.
fn render_age(now: DateTime<Utc>, created: DateTime<Utc>) -> String {
    let age = (now - created).max(chrono::Duration::zero());
    match (age.num_days(), age.num_hours() % 24, age.num_minutes() % 60) {
        (0, 0, 0) => format!("{}s", age.num_seconds()),
        (0, 0, mins) => format!("{mins}m"),
        (0, hours, mins) => format!("{hours}h{mins}m"),
        (days, hours, _) => format!("{days}d{hours}h"),
    }
}
