//! Static stage declarations and the pipeline definition.
//!
//! A [`StageSpec`] says how a stage runs ([`ExecutionModel`]), how long it may
//! take, which capabilities it is granted (as templates resolved per job by
//! the [`scoper`](crate::scope)), which earlier stages' outputs it consumes and
//! which files it must leave behind. A [`PipelineDefinition`] is the validated,
//! ordered list of specs fixed at orchestrator construction.

use std::collections::BTreeSet;
use std::time::Duration;

use rf_core::config::PipelineConfig;
use rf_core::{Action, Error, ResourceKind, Result, StageName};
use serde::{Deserialize, Serialize};

/// Task definition the render stage launches.
pub const RENDER_TASK_DEFINITION: &str = "reelforge-renderer";
/// Hosted model the script stage calls.
pub const SCRIPT_MODEL: &str = "text-generation";
/// Speech endpoint the tts stage calls.
pub const SPEECH_ENDPOINT: &str = "speech-synthesis";
/// Publishing channel the upload stage posts to.
pub const PUBLISH_CHANNEL: &str = "youtube/videos.insert";

/// Compute footprint of a container task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFootprint {
    /// CPU share in units of 1/1024 vCPU.
    pub cpu_units: u32,
    pub memory_mib: u32,
    pub ephemeral_storage_gib: u32,
}

impl ResourceFootprint {
    /// CPU share as fractional cores, e.g. `2` for 2048 units.
    pub fn cpus(&self) -> String {
        let whole = self.cpu_units / 1024;
        let frac = self.cpu_units % 1024;
        if frac == 0 {
            whole.to_string()
        } else {
            format!("{:.2}", f64::from(self.cpu_units) / 1024.0)
        }
    }
}

impl Default for ResourceFootprint {
    fn default() -> Self {
        Self {
            cpu_units: 2048,
            memory_mib: 4096,
            ephemeral_storage_gib: 50,
        }
    }
}

/// How a stage is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionModel {
    /// Short, stateless request/response call.
    Function,
    /// Long-running containerized task with its own footprint.
    Container(ResourceFootprint),
}

impl ExecutionModel {
    pub fn is_container(&self) -> bool {
        matches!(self, ExecutionModel::Container(_))
    }
}

/// Capability with placeholders (`{bucket}`, `{region}`, `{job_id}`) that the
/// scoper resolves for one job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityTemplate {
    pub kind: ResourceKind,
    pub pattern: String,
    pub actions: BTreeSet<Action>,
}

impl CapabilityTemplate {
    pub fn new(
        kind: ResourceKind,
        pattern: impl Into<String>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            actions: actions.into_iter().collect(),
        }
    }

    /// Read/write access to the job's own prefix in the media bucket.
    pub fn job_objects(actions: impl IntoIterator<Item = Action>) -> Self {
        Self::new(ResourceKind::ObjectStore, "{bucket}/{job_id}/*", actions)
    }

    /// Read access to one named secret.
    pub fn secret(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Secret, name, [Action::Read])
    }
}

/// Static declaration of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: StageName,
    pub model: ExecutionModel,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub capabilities: Vec<CapabilityTemplate>,
    /// Stages whose outputs this stage reads.
    #[serde(default)]
    pub consumes: Vec<StageName>,
    /// File names that must exist under the job prefix when the stage ends.
    #[serde(default)]
    pub required_outputs: Vec<String>,
}

impl StageSpec {
    pub fn function(name: StageName, timeout: Duration) -> Self {
        Self {
            name,
            model: ExecutionModel::Function,
            timeout,
            capabilities: Vec::new(),
            consumes: Vec::new(),
            required_outputs: Vec::new(),
        }
    }

    pub fn container(name: StageName, timeout: Duration, footprint: ResourceFootprint) -> Self {
        Self {
            model: ExecutionModel::Container(footprint),
            ..Self::function(name, timeout)
        }
    }

    pub fn grant(mut self, template: CapabilityTemplate) -> Self {
        self.capabilities.push(template);
        self
    }

    pub fn consumes(mut self, stages: impl IntoIterator<Item = StageName>) -> Self {
        self.consumes.extend(stages);
        self
    }

    pub fn requires_output(mut self, name: impl Into<String>) -> Self {
        self.required_outputs.push(name.into());
        self
    }

    pub fn footprint(&self) -> Option<&ResourceFootprint> {
        match &self.model {
            ExecutionModel::Container(fp) => Some(fp),
            ExecutionModel::Function => None,
        }
    }
}

/// Ordered, validated list of stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDefinition {
    stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    /// Validate and wrap an ordered list of stage specs.
    ///
    /// Stages must be unique and appear in pipeline order; exactly one stage
    /// runs as a container; every stage comes after each stage it consumes.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::Validation("pipeline has no stages".into()));
        }

        for pair in stages.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(Error::Validation(format!(
                    "stage '{}' must come before '{}' and appear once",
                    pair[1].name, pair[0].name
                )));
            }
        }

        let containers = stages.iter().filter(|s| s.model.is_container()).count();
        if containers != 1 {
            return Err(Error::Validation(format!(
                "pipeline must have exactly one container stage, found {containers}"
            )));
        }

        for (i, spec) in stages.iter().enumerate() {
            if spec.timeout.is_zero() {
                return Err(Error::Validation(format!(
                    "stage '{}' has a zero timeout",
                    spec.name
                )));
            }
            if let Some(fp) = spec.footprint() {
                if fp.cpu_units == 0 || fp.memory_mib == 0 {
                    return Err(Error::Validation(format!(
                        "stage '{}' has an empty footprint",
                        spec.name
                    )));
                }
            }
            for consumed in &spec.consumes {
                if !stages[..i].iter().any(|s| s.name == *consumed) {
                    return Err(Error::Validation(format!(
                        "stage '{}' consumes '{}', which does not run before it",
                        spec.name, consumed
                    )));
                }
            }
        }

        Ok(Self { stages })
    }

    /// The standard five-stage pipeline with timings from `config`.
    pub fn standard(config: &PipelineConfig) -> Result<Self> {
        let function = Duration::from_secs(config.function_timeout_secs);
        let footprint = ResourceFootprint {
            cpu_units: config.render_cpu_units,
            memory_mib: config.render_memory_mib,
            ephemeral_storage_gib: config.render_ephemeral_storage_gib,
        };

        Self::new(vec![
            StageSpec::function(StageName::Script, function)
                .grant(CapabilityTemplate::job_objects([Action::Read, Action::Write]))
                .grant(CapabilityTemplate::new(
                    ResourceKind::InferenceModel,
                    format!("{{region}}/{SCRIPT_MODEL}"),
                    [Action::Invoke],
                ))
                .requires_output("script.txt"),
            StageSpec::function(StageName::Tts, function)
                .grant(CapabilityTemplate::job_objects([Action::Read, Action::Write]))
                .grant(CapabilityTemplate::new(
                    ResourceKind::SpeechSynthesis,
                    format!("{{region}}/{SPEECH_ENDPOINT}"),
                    [Action::Invoke],
                ))
                .grant(CapabilityTemplate::secret("elevenlabs/apiKey"))
                .consumes([StageName::Script])
                .requires_output("voice.wav"),
            StageSpec::function(StageName::Broll, function)
                .grant(CapabilityTemplate::job_objects([Action::Read, Action::Write]))
                .grant(CapabilityTemplate::secret("pexels/apiKey"))
                .consumes([StageName::Script])
                .requires_output("edl.json"),
            StageSpec::container(
                StageName::Render,
                Duration::from_secs(config.render_timeout_secs),
                footprint,
            )
            .grant(CapabilityTemplate::job_objects([Action::Read, Action::Write]))
            .grant(CapabilityTemplate::new(
                ResourceKind::ContainerTask,
                format!("{{region}}/{RENDER_TASK_DEFINITION}"),
                [Action::Run, Action::Stop],
            ))
            .consumes([StageName::Tts, StageName::Broll])
            .requires_output("out.mp4"),
            StageSpec::function(
                StageName::Upload,
                Duration::from_secs(config.upload_timeout_secs),
            )
            .grant(CapabilityTemplate::job_objects([Action::Read]))
            .grant(CapabilityTemplate::secret("youtube/oauth"))
            .grant(CapabilityTemplate::new(
                ResourceKind::VideoPlatform,
                PUBLISH_CHANNEL,
                [Action::Invoke],
            ))
            .consumes([StageName::Render]),
        ])
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn get(&self, name: StageName) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stages that run before the stage at `index`.
    pub fn predecessors(&self, index: usize) -> Vec<StageName> {
        self.stages[..index].iter().map(|s| s.name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn standard() -> PipelineDefinition {
        PipelineDefinition::standard(&PipelineConfig::default()).unwrap()
    }

    #[test]
    fn standard_pipeline_shape() {
        let def = standard();
        let names: Vec<StageName> = def.stages().iter().map(|s| s.name).collect();
        assert_eq!(names, StageName::ALL);

        let render = def.get(StageName::Render).unwrap();
        assert_eq!(render.timeout, Duration::from_secs(900));
        assert_eq!(render.footprint(), Some(&ResourceFootprint::default()));
        assert_eq!(def.get(StageName::Upload).unwrap().timeout, Duration::from_secs(120));
        assert_eq!(def.get(StageName::Tts).unwrap().timeout, Duration::from_secs(60));
        assert_eq!(
            def.predecessors(3),
            [StageName::Script, StageName::Tts, StageName::Broll]
        );
    }

    #[test]
    fn upload_is_read_only_on_objects() {
        let def = standard();
        let upload = def.get(StageName::Upload).unwrap();
        let store = upload
            .capabilities
            .iter()
            .find(|c| c.kind == ResourceKind::ObjectStore)
            .unwrap();
        assert_eq!(store.actions, BTreeSet::from([Action::Read]));
    }

    #[test]
    fn rejects_two_containers() {
        let fp = ResourceFootprint::default();
        let err = PipelineDefinition::new(vec![
            StageSpec::container(StageName::Script, Duration::from_secs(1), fp),
            StageSpec::container(StageName::Render, Duration::from_secs(1), fp),
        ])
        .unwrap_err();
        assert_matches!(err, Error::Validation(msg) if msg.contains("exactly one"));
    }

    #[test]
    fn rejects_no_container() {
        assert!(PipelineDefinition::new(vec![StageSpec::function(
            StageName::Script,
            Duration::from_secs(1)
        )])
        .is_err());
    }

    #[test]
    fn rejects_out_of_order_or_duplicate_stages() {
        let fp = ResourceFootprint::default();
        let out_of_order = PipelineDefinition::new(vec![
            StageSpec::container(StageName::Render, Duration::from_secs(1), fp),
            StageSpec::function(StageName::Script, Duration::from_secs(1)),
        ]);
        assert!(out_of_order.is_err());

        let duplicate = PipelineDefinition::new(vec![
            StageSpec::function(StageName::Script, Duration::from_secs(1)),
            StageSpec::function(StageName::Script, Duration::from_secs(1)),
            StageSpec::container(StageName::Render, Duration::from_secs(1), fp),
        ]);
        assert!(duplicate.is_err());
    }

    #[test]
    fn rejects_container_consuming_a_later_stage() {
        let fp = ResourceFootprint::default();
        let err = PipelineDefinition::new(vec![
            StageSpec::function(StageName::Script, Duration::from_secs(1)),
            StageSpec::container(StageName::Render, Duration::from_secs(1), fp)
                .consumes([StageName::Tts]),
        ])
        .unwrap_err();
        assert_matches!(err, Error::Validation(msg) if msg.contains("consumes 'tts'"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let fp = ResourceFootprint::default();
        assert!(PipelineDefinition::new(vec![StageSpec::container(
            StageName::Render,
            Duration::ZERO,
            fp
        )])
        .is_err());
    }

    #[test]
    fn footprint_cpus() {
        assert_eq!(ResourceFootprint::default().cpus(), "2");
        let half = ResourceFootprint {
            cpu_units: 512,
            ..ResourceFootprint::default()
        };
        assert_eq!(half.cpus(), "0.50");
    }

    #[test]
    fn spec_serializes_timeout_as_seconds() {
        let def = standard();
        let json = serde_json::to_value(def.get(StageName::Render).unwrap()).unwrap();
        assert_eq!(json["timeout"], 900);
        assert_eq!(json["model"]["kind"], "container");
        assert_eq!(json["model"]["cpu_units"], 2048);
    }
}
