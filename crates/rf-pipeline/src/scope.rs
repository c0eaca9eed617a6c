//! Per-job capability scoping.
//!
//! [`CapabilityScoper::scope`] turns a stage's [`CapabilityTemplate`]s into a
//! concrete [`CapabilitySet`] for one job. It is a pure function of the
//! templates, the deployment's [`ResourceContext`] and the job id; nothing is
//! cached between jobs. Templates that would grant more than the stage needs
//! are rejected rather than narrowed.

use rf_core::{Action, Capability, CapabilitySet, Error, JobId, ResourceKind, Result};

use crate::stage::{CapabilityTemplate, StageSpec};

/// Concrete identifiers of the deployment a job runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContext {
    pub bucket: String,
    pub region: String,
}

impl ResourceContext {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
        }
    }
}

/// Resolves capability templates against a job.
#[derive(Debug, Clone)]
pub struct CapabilityScoper {
    context: ResourceContext,
}

impl CapabilityScoper {
    pub fn new(context: ResourceContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ResourceContext {
        &self.context
    }

    /// Compute the capability set `spec` holds while working on `job_id`.
    pub fn scope(&self, spec: &StageSpec, job_id: &JobId) -> Result<CapabilitySet> {
        spec.capabilities
            .iter()
            .map(|t| self.resolve(spec, t, job_id))
            .collect()
    }

    /// Check every template of `spec` without a concrete job.
    pub fn check_templates(&self, spec: &StageSpec) -> Result<()> {
        let sample = JobId::parse("template-check")?;
        self.scope(spec, &sample).map(|_| ())
    }

    fn resolve(
        &self,
        spec: &StageSpec,
        template: &CapabilityTemplate,
        job_id: &JobId,
    ) -> Result<Capability> {
        let reject = |why: &str| {
            Error::Validation(format!(
                "stage '{}' capability {}:{} rejected: {why}",
                spec.name, template.kind, template.pattern
            ))
        };

        if template.actions.is_empty() {
            return Err(reject("no actions"));
        }
        if template.pattern.trim_end_matches('*').is_empty() {
            return Err(reject("pattern matches every resource"));
        }
        let fixed = template
            .pattern
            .strip_suffix('*')
            .unwrap_or(&template.pattern);
        if fixed.contains('*') {
            return Err(reject("wildcard allowed only as the final character"));
        }

        match template.kind {
            ResourceKind::ObjectStore => {
                if !template.pattern.starts_with("{bucket}/{job_id}/") {
                    return Err(reject("object access must be confined to the job prefix"));
                }
            }
            ResourceKind::Secret => {
                if template.actions.iter().any(|a| *a != Action::Read) {
                    return Err(reject("secrets may only be read"));
                }
                if template.pattern.contains('*') {
                    return Err(reject("secrets must be named exactly"));
                }
            }
            _ => {}
        }

        let pattern = template
            .pattern
            .replace("{bucket}", &self.context.bucket)
            .replace("{region}", &self.context.region)
            .replace("{job_id}", job_id.as_str());

        if pattern.contains('{') || pattern.contains('}') {
            return Err(reject("unresolved placeholder"));
        }

        Ok(Capability::new(
            template.kind,
            pattern,
            template.actions.iter().copied(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::PipelineDefinition;
    use assert_matches::assert_matches;
    use rf_core::config::PipelineConfig;
    use rf_core::StageName;
    use std::time::Duration;

    fn scoper() -> CapabilityScoper {
        CapabilityScoper::new(ResourceContext::new("media", "eu-west-1"))
    }

    fn id(s: &str) -> JobId {
        JobId::parse(s).unwrap()
    }

    fn spec_with(template: CapabilityTemplate) -> StageSpec {
        StageSpec::function(StageName::Script, Duration::from_secs(1)).grant(template)
    }

    #[test]
    fn resolves_job_prefix() {
        let spec = spec_with(CapabilityTemplate::job_objects([Action::Read, Action::Write]));
        let caps = scoper().scope(&spec, &id("job-001")).unwrap();
        assert!(caps.permits(
            ResourceKind::ObjectStore,
            "media/job-001/script.txt",
            Action::Write
        ));
        assert!(!caps.permits(
            ResourceKind::ObjectStore,
            "media/job-002/script.txt",
            Action::Read
        ));
    }

    #[test]
    fn standard_pipeline_scopes_cleanly() {
        let def = PipelineDefinition::standard(&PipelineConfig::default()).unwrap();
        for spec in def.stages() {
            let caps = scoper().scope(spec, &id("job-001")).unwrap();
            assert_eq!(caps.len(), spec.capabilities.len());
        }
    }

    #[test]
    fn render_gets_only_its_task_definition() {
        let def = PipelineDefinition::standard(&PipelineConfig::default()).unwrap();
        let caps = scoper()
            .scope(def.get(StageName::Render).unwrap(), &id("job-001"))
            .unwrap();
        assert!(caps.permits(
            ResourceKind::ContainerTask,
            "eu-west-1/reelforge-renderer",
            Action::Run
        ));
        assert!(!caps.permits(ResourceKind::ContainerTask, "eu-west-1/other-task", Action::Run));
    }

    #[test]
    fn distinct_jobs_never_share_object_identifiers() {
        let def = PipelineDefinition::standard(&PipelineConfig::default()).unwrap();
        for spec in def.stages() {
            let a = scoper().scope(spec, &id("job-1")).unwrap();
            let b = scoper().scope(spec, &id("job-10")).unwrap();
            let shared: Vec<_> = a
                .overlapping(&b)
                .into_iter()
                .filter(|(c, _)| c.kind == ResourceKind::ObjectStore)
                .collect();
            assert!(shared.is_empty(), "{}: {shared:?}", spec.name);
        }
    }

    #[test]
    fn rejects_bucket_wide_object_access() {
        for pattern in ["{bucket}/*", "*", "{bucket}/shared/{job_id}/*"] {
            let spec = spec_with(CapabilityTemplate::new(
                ResourceKind::ObjectStore,
                pattern,
                [Action::Read],
            ));
            assert_matches!(
                scoper().scope(&spec, &id("job-001")),
                Err(Error::Validation(_)),
                "{pattern}"
            );
        }
    }

    #[test]
    fn rejects_secret_write() {
        let spec = spec_with(CapabilityTemplate::new(
            ResourceKind::Secret,
            "youtube/oauth",
            [Action::Read, Action::Write],
        ));
        assert!(scoper().scope(&spec, &id("job-001")).is_err());
    }

    #[test]
    fn rejects_wildcard_secret() {
        let spec = spec_with(CapabilityTemplate::new(
            ResourceKind::Secret,
            "youtube/*",
            [Action::Read],
        ));
        assert!(scoper().scope(&spec, &id("job-001")).is_err());
    }

    #[test]
    fn rejects_empty_actions() {
        let spec = spec_with(CapabilityTemplate::new(
            ResourceKind::InferenceModel,
            "{region}/text-generation",
            [],
        ));
        assert!(scoper().scope(&spec, &id("job-001")).is_err());
    }

    #[test]
    fn rejects_unresolved_placeholders() {
        let spec = spec_with(CapabilityTemplate::new(
            ResourceKind::ContainerTask,
            "{account}/renderer",
            [Action::Run],
        ));
        assert_matches!(
            scoper().scope(&spec, &id("job-001")),
            Err(Error::Validation(msg)) if msg.contains("unresolved")
        );
    }

    #[test]
    fn rejects_inner_wildcards() {
        let spec = spec_with(CapabilityTemplate::new(
            ResourceKind::ContainerTask,
            "{region}/*/renderer",
            [Action::Run],
        ));
        assert!(scoper().scope(&spec, &id("job-001")).is_err());
    }

    #[test]
    fn scope_is_pure() {
        let spec = spec_with(CapabilityTemplate::job_objects([Action::Read]));
        let s = scoper();
        assert_eq!(
            s.scope(&spec, &id("job-001")).unwrap(),
            s.scope(&spec, &id("job-001")).unwrap()
        );
    }
}
