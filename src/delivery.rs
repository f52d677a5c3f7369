//! Reference delivery pipeline
//!
//! Build, scan, package, publish, deploy to staging and scan the running
//! deployment. Optional stages are gated on the environment variables that
//! carry their endpoints and credentials, so the same definition runs on a
//! developer machine (build and scans only) and on a fully wired CI host.
//!
//! | Stage | Runs when |
//! |---|---|
//! | Build & Test | always |
//! | Dependency Check | always |
//! | Static Analysis | `SONAR_HOST_URL` and `SONAR_TOKEN` set, `SKIP_STATIC_ANALYSIS` not true |
//! | Docker Build | always |
//! | Docker Push | `DOCKER_REGISTRY`, `DOCKER_USERNAME`, `DOCKER_PASSWORD` set |
//! | Publish Artifact | `NEXUS_URL`, `NEXUS_REPO_PATH`, `NEXUS_USERNAME`, `NEXUS_PASSWORD` set |
//! | Deploy Staging | `STAGING_URL` set |
//! | DAST | `STAGING_URL` set |
//!
//! Shell commands read run variables through the shell (`"$VAR"`), so a
//! value is never parsed as shell syntax. Registry and analysis server
//! secrets are bound only around the steps that use them, through the
//! `docker` and `sonar` credentials.

use crate::executor::{HEALTH_ATTEMPTS, HEALTH_INTERVAL};
use crate::pipeline::options::duration_format;
use crate::pipeline::{
    Condition, Pipeline, PipelineOptions, PostCondition, Stage, StageBuilder, Step,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stage names, in execution order
pub const STAGES: [&str; 8] = [
    "Build & Test",
    "Dependency Check",
    "Static Analysis",
    "Docker Build",
    "Docker Push",
    "Publish Artifact",
    "Deploy Staging",
    "DAST",
];

/// Exit code of the ZAP baseline scan when it only raised warnings
const ZAP_WARNINGS_EXIT: i32 = 2;

/// Knobs of the delivery pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Project name; also the pipeline name and analysis project key
    pub project: String,
    /// Local image repository, without registry or tag
    pub image_repository: String,
    /// Name of the staging container
    pub staging_container: String,
    /// Port the application listens on inside and outside the container
    pub staging_port: u16,
    /// Health endpoint path appended to `STAGING_URL`
    pub health_path: String,
    /// Health check attempts after deploying
    pub health_attempts: u32,
    /// Pause between health check attempts
    #[serde(with = "duration_format")]
    pub health_interval: Duration,
    /// Fail the dependency scan at or above this CVSS score; `None` fails on
    /// any finding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_threshold: Option<f32>,
    /// How long to wait for the quality gate verdict
    #[serde(with = "duration_format")]
    pub gate_timeout: Duration,
    /// Glob locating the artifact to publish
    pub artifact_pattern: String,
    /// Dependency-Check image
    pub dependency_check_image: String,
    /// ZAP image
    pub zap_image: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            project: "app".to_string(),
            image_repository: "app".to_string(),
            staging_container: "app-staging".to_string(),
            staging_port: 8080,
            health_path: "/actuator/health".to_string(),
            health_attempts: HEALTH_ATTEMPTS,
            health_interval: HEALTH_INTERVAL,
            cvss_threshold: Some(7.0),
            gate_timeout: Duration::from_secs(300),
            artifact_pattern: "target/*.jar".to_string(),
            dependency_check_image: "owasp/dependency-check:latest".to_string(),
            zap_image: "ghcr.io/zaproxy/zaproxy:stable".to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Config for `project`, with the image and container named after it
    pub fn for_project(project: impl Into<String>) -> Self {
        let project = project.into();
        Self {
            image_repository: project.clone(),
            staging_container: format!("{project}-staging"),
            project,
            ..Self::default()
        }
    }

    /// Builds the pipeline definition
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the project name is not a valid
    /// pipeline name.
    pub fn pipeline(&self) -> Result<Pipeline, ValidationError> {
        Pipeline::builder()
            .name(&self.project)
            .description(format!("Delivery pipeline for {}", self.project))
            .options(PipelineOptions::new())
            .stages(vec![
                self.build_and_test(),
                self.dependency_check(),
                self.static_analysis(),
                self.docker_build(),
                self.docker_push(),
                self.publish_artifact(),
                self.deploy_staging(),
                self.dast(),
            ])
            .post(PostCondition::always(vec![Step::remove_container(
                &self.staging_container,
            )]))
            .post(PostCondition::success(vec![Step::echo(format!(
                "{} #${{BUILD_NUMBER}} delivered",
                self.project
            ))]))
            .post(PostCondition::failure(vec![Step::echo(format!(
                "{} #${{BUILD_NUMBER}} failed, see ${{RUN_ARTIFACTS_DIR}}",
                self.project
            ))]))
            .build()
    }

    /// Double-quoted image reference; `tag` may hold a `$VAR` for the shell
    fn image(&self, tag: &str) -> String {
        format!("\"{}:{tag}\"", self.image_repository)
    }

    fn build_and_test(&self) -> Stage {
        StageBuilder::new(STAGES[0])
            .step(Step::shell("mvn -B clean verify"))
            .post(PostCondition::always(vec![Step::archive_optional(
                "target/surefire-reports/*.xml",
                "test-reports",
            )]))
            .build_unchecked()
    }

    fn dependency_check(&self) -> Stage {
        let threshold = self.cvss_threshold.unwrap_or(0.0);
        let command = format!(
            "mkdir -p dependency-check-report && docker run --rm \
             -v \"$WORKSPACE\":/src -v \"$WORKSPACE/dependency-check-report\":/report \
             {} --scan /src --project {} --format HTML --format XML --out /report \
             --failOnCVSS {threshold}",
            self.dependency_check_image,
            crate::executor::quote(&self.project),
        );
        StageBuilder::new(STAGES[1])
            .step(Step::shell(command))
            .post(PostCondition::always(vec![Step::archive_optional(
                "dependency-check-report/*",
                "dependency-check",
            )]))
            .build_unchecked()
    }

    fn static_analysis(&self) -> Stage {
        StageBuilder::new(STAGES[2])
            .when(Condition::all(vec![
                Condition::all_present(["SONAR_HOST_URL", "SONAR_TOKEN"]),
                Condition::not(Condition::is_true("SKIP_STATIC_ANALYSIS")),
            ]))
            .step(Step::with_token(
                "sonar",
                "SONAR_TOKEN",
                vec![Step::shell(format!(
                    "mvn -B sonar:sonar -Dsonar.projectKey={} \
                     -Dsonar.host.url=\"$SONAR_HOST_URL\" -Dsonar.token=\"$SONAR_TOKEN\"",
                    self.project
                ))],
            ))
            .step(Step::quality_gate(&self.project, self.gate_timeout))
            .build_unchecked()
    }

    fn docker_build(&self) -> Stage {
        StageBuilder::new(STAGES[3])
            .step(Step::shell(format!(
                "docker build -t {} -t {} .",
                self.image("$REVISION"),
                self.image("latest")
            )))
            .build_unchecked()
    }

    fn docker_push(&self) -> Stage {
        let mut steps = vec![Step::with_credentials(
            "docker",
            "DOCKER_USERNAME",
            "DOCKER_PASSWORD",
            vec![Step::shell(
                "echo \"$DOCKER_PASSWORD\" | docker login \"$DOCKER_REGISTRY\" \
                 -u \"$DOCKER_USERNAME\" --password-stdin",
            )],
        )];
        for tag in ["$REVISION", "latest"] {
            let local = self.image(tag);
            let remote = format!("\"$DOCKER_REGISTRY/{}:{tag}\"", self.image_repository);
            steps.push(Step::shell(format!("docker tag {local} {remote}")));
            steps.push(Step::shell(format!("docker push {remote}")));
        }

        StageBuilder::new(STAGES[4])
            .when(Condition::all_present([
                "DOCKER_REGISTRY",
                "DOCKER_USERNAME",
                "DOCKER_PASSWORD",
            ]))
            .steps(steps)
            .post(PostCondition::always(vec![Step::shell(
                "docker logout \"$DOCKER_REGISTRY\" || true",
            )]))
            .build_unchecked()
    }

    fn publish_artifact(&self) -> Stage {
        StageBuilder::new(STAGES[5])
            .when(Condition::all_present([
                "NEXUS_URL",
                "NEXUS_REPO_PATH",
                "NEXUS_USERNAME",
                "NEXUS_PASSWORD",
            ]))
            .step(Step::publish(
                &self.artifact_pattern,
                format!("${{NEXUS_URL}}/${{NEXUS_REPO_PATH}}/{}/${{BUILD_NUMBER}}", self.project),
                "nexus",
            ))
            .build_unchecked()
    }

    fn deploy_staging(&self) -> Stage {
        StageBuilder::new(STAGES[6])
            .when(Condition::all_present(["STAGING_URL"]))
            .step(Step::remove_container(&self.staging_container))
            .step(Step::shell(format!(
                "docker run -d --name {} -p {port}:{port} {}",
                self.staging_container,
                self.image("$REVISION"),
                port = self.staging_port
            )))
            .step(Step::health_check(
                format!("${{STAGING_URL}}{}", self.health_path),
                self.health_attempts,
                self.health_interval,
            ))
            .build_unchecked()
    }

    fn dast(&self) -> Stage {
        StageBuilder::new(STAGES[7])
            .when(Condition::all_present(["STAGING_URL"]))
            .step(Step::shell("mkdir -p zap-report"))
            .step(Step::shell_tolerating(
                format!(
                    "docker run --rm --network host -v \"$WORKSPACE/zap-report\":/zap/wrk:rw \
                     {} zap-baseline.py -t \"$STAGING_URL\" \
                     -r zap-report.html -x zap-report.xml -J zap-report.json",
                    self.zap_image
                ),
                [ZAP_WARNINGS_EXIT],
            ))
            .post(PostCondition::always(vec![Step::archive_optional(
                "zap-report/*",
                "zap",
            )]))
            .build_unchecked()
    }
}
