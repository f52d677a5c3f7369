//! `shipline plan` - Show which stages would run
//!
//! Evaluates every stage condition against the environment a run would see,
//! without executing anything.

use shipline::pipeline::{Environment, Pipeline};
use std::fmt::Write as _;

/// Eligibility of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub stage: String,
    pub condition: Option<String>,
    pub eligible: bool,
    /// Condition variables that are unset or blank
    pub unset: Vec<String>,
}

/// Evaluates stage conditions over pipeline defaults, site defaults and
/// run overrides, layered in that order.
pub fn plan(pipeline: &Pipeline, site: &Environment, overrides: &Environment) -> Vec<PlanEntry> {
    let mut env = pipeline.environment.clone();
    env.extend(site);
    env.extend(overrides);

    pipeline
        .stages
        .iter()
        .map(|stage| {
            let unset = stage
                .when
                .as_ref()
                .map(|when| {
                    let mut keys: Vec<String> = when
                        .keys()
                        .into_iter()
                        .filter(|key| env.get(key).is_none_or(|v| v.trim().is_empty()))
                        .map(str::to_string)
                        .collect();
                    keys.dedup();
                    keys
                })
                .unwrap_or_default();

            PlanEntry {
                stage: stage.name.clone(),
                condition: stage.when.as_ref().map(ToString::to_string),
                eligible: stage.is_eligible(&env),
                unset,
            }
        })
        .collect()
}

/// Renders the plan as an aligned table
pub fn format_plan(pipeline: &Pipeline, entries: &[PlanEntry]) -> String {
    let width = entries.iter().map(|e| e.stage.len()).max().unwrap_or(0);
    let mut out = format!("{}\n", pipeline.name);

    for entry in entries {
        let verdict = if entry.eligible { "run" } else { "skip" };
        let _ = write!(out, "  {:<width$}  {verdict:<4}", entry.stage);
        if let Some(condition) = &entry.condition {
            let _ = write!(out, "  when {condition}");
        }
        if !entry.eligible && !entry.unset.is_empty() {
            let _ = write!(out, "  (unset: {})", entry.unset.join(", "));
        }
        out.push('\n');
    }

    let runnable = entries.iter().filter(|e| e.eligible).count();
    let _ = writeln!(out, "{runnable} of {} stages eligible", entries.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shipline::delivery::DeliveryConfig;

    #[test]
    fn test_plan_local_environment() {
        let pipeline = DeliveryConfig::default().pipeline().unwrap();
        let entries = plan(&pipeline, &Environment::new(), &Environment::new());

        let eligible: Vec<&str> = entries
            .iter()
            .filter(|e| e.eligible)
            .map(|e| e.stage.as_str())
            .collect();
        assert_eq!(eligible, vec!["Build & Test", "Dependency Check", "Docker Build"]);

        let push = entries.iter().find(|e| e.stage == "Docker Push").unwrap();
        assert_eq!(
            push.unset,
            vec!["DOCKER_REGISTRY", "DOCKER_USERNAME", "DOCKER_PASSWORD"]
        );
    }

    #[test]
    fn test_overrides_win_over_site_defaults() {
        let pipeline = DeliveryConfig::default().pipeline().unwrap();
        let site = Environment::new().set("STAGING_URL", "http://staging:8080");
        let overrides = Environment::new().set("STAGING_URL", " ");

        let entries = plan(&pipeline, &site, &overrides);
        let deploy = entries.iter().find(|e| e.stage == "Deploy Staging").unwrap();
        assert!(!deploy.eligible);
        assert_eq!(deploy.unset, vec!["STAGING_URL"]);

        let entries = plan(&pipeline, &site, &Environment::new());
        let deploy = entries.iter().find(|e| e.stage == "Deploy Staging").unwrap();
        assert!(deploy.eligible);
    }

    #[test]
    fn test_format_plan() {
        let pipeline = DeliveryConfig::default().pipeline().unwrap();
        let entries = plan(&pipeline, &Environment::new(), &Environment::new());
        let text = format_plan(&pipeline, &entries);

        assert!(text.starts_with("app\n"));
        assert!(text.contains("(unset: STAGING_URL)"));
        assert!(text.ends_with("3 of 8 stages eligible\n"));
    }
}
