use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, Volume, VolumeMount,
};
use serde_json::Value;
use thiserror::Error;

use crate::annotations::InjectionConfig;
use crate::config::{self, AGENT_INIT_CONTAINER_NAME, AGENT_VOLUME_NAME};

pub const JAVA_TOOL_OPTIONS: &str = "JAVA_TOOL_OPTIONS";
pub const COLLECTOR_ENV: &str = "KUBEDB_MONITOR_COLLECTOR";
pub const ENDPOINT_ENV: &str = "KUBEDB_MONITOR_ENDPOINT";

#[derive(Debug, Error)]
pub enum PatchBuildFailure {
    #[error("pod has no spec")]
    MissingSpec,
    #[error("failed to encode patched state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Knobs the mutator needs beyond the per-pod annotations.
#[derive(Debug, Clone)]
pub struct MutationSettings {
    pub agent_image: String,
    pub jar_source_path: String,
    pub mount_path: String,
    pub skip_image_markers: Vec<String>,
}

impl From<&config::Config> for MutationSettings {
    fn from(config: &config::Config) -> Self {
        Self {
            agent_image: config.agent_image.clone(),
            jar_source_path: config.agent_jar_source_path.clone(),
            mount_path: config.agent_mount_path.clone(),
            skip_image_markers: config.skip_image_markers.clone(),
        }
    }
}

impl MutationSettings {
    /// The `-javaagent` marker; its presence in `JAVA_TOOL_OPTIONS` means the
    /// container is already wired.
    pub fn javaagent_flag(&self) -> String {
        format!("-javaagent:{}/agent.jar", self.mount_path)
    }

    fn javaagent_option(&self, config: &InjectionConfig) -> String {
        let suffix = config.agent_option_string();
        if suffix.is_empty() {
            self.javaagent_flag()
        } else {
            format!("{}={suffix}", self.javaagent_flag())
        }
    }

    fn skips_image(&self, image: &str) -> bool {
        self.skip_image_markers.iter().any(|m| image.contains(m))
    }
}

#[derive(Debug)]
pub struct MutationOutcome {
    pub patch: Patch,
    pub warnings: Vec<String>,
}

impl MutationOutcome {
    pub fn unchanged() -> Self {
        Self {
            patch: Patch(Vec::new()),
            warnings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patch.0.is_empty()
    }
}

fn add(ops: &mut Vec<PatchOperation>, path: String, value: Value) {
    ops.push(PatchOperation::Add(AddOperation { path, value }));
}

fn replace(ops: &mut Vec<PatchOperation>, path: String, value: Value) {
    ops.push(PatchOperation::Replace(ReplaceOperation { path, value }));
}

fn has_volume(spec_volumes: &Option<Vec<Volume>>) -> bool {
    spec_volumes
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|v| v.name == AGENT_VOLUME_NAME)
}

fn has_init_container(init: &Option<Vec<Container>>) -> bool {
    init.as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.name == AGENT_INIT_CONTAINER_NAME)
}

/// Builds the minimal ordered patch that attaches the agent to an opted-in
/// pod: shared volume, staging init container, and per-container mount plus
/// `JAVA_TOOL_OPTIONS`. Anything already in place is left alone, so feeding
/// the mutator its own output yields an empty patch.
pub fn build_patch(
    pod: &Pod,
    config: &InjectionConfig,
    settings: &MutationSettings,
) -> Result<MutationOutcome, PatchBuildFailure> {
    if !config.enabled {
        return Ok(MutationOutcome::unchanged());
    }
    let spec = pod.spec.as_ref().ok_or(PatchBuildFailure::MissingSpec)?;

    if has_init_container(&spec.init_containers) && has_volume(&spec.volumes) {
        return Ok(MutationOutcome::unchanged());
    }

    let mut ops = Vec::new();
    let mut warnings = Vec::new();

    if !has_volume(&spec.volumes) {
        let volume = Volume {
            name: AGENT_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        };
        let value = serde_json::to_value(&volume)?;
        match &spec.volumes {
            None => add(&mut ops, "/spec/volumes".into(), Value::Array(vec![value])),
            Some(_) => add(&mut ops, "/spec/volumes/-".into(), value),
        }
    }

    if !has_init_container(&spec.init_containers) {
        let init = Container {
            name: AGENT_INIT_CONTAINER_NAME.to_string(),
            image: Some(settings.agent_image.clone()),
            command: Some(vec![
                "sh".into(),
                "-c".into(),
                format!(
                    "cp {} {}/agent.jar",
                    settings.jar_source_path, settings.mount_path
                ),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: AGENT_VOLUME_NAME.to_string(),
                mount_path: settings.mount_path.clone(),
                ..VolumeMount::default()
            }]),
            ..Container::default()
        };
        let value = serde_json::to_value(&init)?;
        match &spec.init_containers {
            None => add(
                &mut ops,
                "/spec/initContainers".into(),
                Value::Array(vec![value]),
            ),
            Some(_) => add(&mut ops, "/spec/initContainers/0".into(), value),
        }
    }

    for (index, container) in spec.containers.iter().enumerate() {
        if let Some(image) = &container.image {
            if settings.skips_image(image) {
                tracing::debug!(container = %container.name, %image, "skipping sidecar image");
                continue;
            }
        }
        mutate_container(settings, config, index, container, &mut ops, &mut warnings)?;
    }

    Ok(MutationOutcome {
        patch: Patch(ops),
        warnings,
    })
}

fn mutate_container(
    settings: &MutationSettings,
    config: &InjectionConfig,
    index: usize,
    container: &Container,
    ops: &mut Vec<PatchOperation>,
    warnings: &mut Vec<String>,
) -> Result<(), PatchBuildFailure> {
    let mounts = container.volume_mounts.as_deref().unwrap_or_default();
    if !mounts.iter().any(|m| m.name == AGENT_VOLUME_NAME) {
        let mount = VolumeMount {
            name: AGENT_VOLUME_NAME.to_string(),
            mount_path: settings.mount_path.clone(),
            read_only: Some(true),
            ..VolumeMount::default()
        };
        let value = serde_json::to_value(&mount)?;
        match &container.volume_mounts {
            None => add(
                ops,
                format!("/spec/containers/{index}/volumeMounts"),
                Value::Array(vec![value]),
            ),
            Some(_) => add(ops, format!("/spec/containers/{index}/volumeMounts/-"), value),
        }
    }

    let env = container.env.as_deref().unwrap_or_default();
    let flag = settings.javaagent_flag();
    let option = settings.javaagent_option(config);
    let mut new_entries: Vec<EnvVar> = Vec::new();

    match env.iter().position(|e| e.name == JAVA_TOOL_OPTIONS) {
        Some(position) => {
            let existing = &env[position];
            if existing.value_from.is_some() {
                warnings.push(format!(
                    "container {}: {JAVA_TOOL_OPTIONS} uses valueFrom; agent not attached",
                    container.name
                ));
                return Ok(());
            }
            let current = existing.value.as_deref().unwrap_or_default();
            if !current.contains(&flag) {
                let merged = if current.is_empty() {
                    option.clone()
                } else {
                    format!("{current} {option}")
                };
                replace(
                    ops,
                    format!("/spec/containers/{index}/env/{position}/value"),
                    Value::String(merged),
                );
            }
        }
        None => new_entries.push(EnvVar {
            name: JAVA_TOOL_OPTIONS.to_string(),
            value: Some(option.clone()),
            ..EnvVar::default()
        }),
    }

    if !env.iter().any(|e| e.name == COLLECTOR_ENV) {
        new_entries.push(EnvVar {
            name: COLLECTOR_ENV.to_string(),
            value: Some(config.collector_kind.as_str().to_string()),
            ..EnvVar::default()
        });
    }
    if let Some(endpoint) = &config.collector_endpoint {
        if !env.iter().any(|e| e.name == ENDPOINT_ENV) {
            new_entries.push(EnvVar {
                name: ENDPOINT_ENV.to_string(),
                value: Some(endpoint.as_str().to_string()),
                ..EnvVar::default()
            });
        }
    }

    if new_entries.is_empty() {
        return Ok(());
    }
    match &container.env {
        None => {
            let values = new_entries
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            add(
                ops,
                format!("/spec/containers/{index}/env"),
                Value::Array(values),
            );
        }
        Some(_) => {
            for entry in &new_entries {
                add(
                    ops,
                    format!("/spec/containers/{index}/env/-"),
                    serde_json::to_value(entry)?,
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::parse_annotations;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn settings() -> MutationSettings {
        MutationSettings {
            agent_image: "ghcr.io/kubedb-monitor/agent:latest".into(),
            jar_source_path: "/opt/kubedb/agent.jar".into(),
            mount_path: "/opt/kubedb/agent".into(),
            skip_image_markers: vec!["istio/proxyv2".into()],
        }
    }

    fn pod(containers: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": "app-1", "namespace": "default"},
            "spec": {"containers": containers}
        }))
        .unwrap()
    }

    fn enabled_config(extra: &[(&str, &str)]) -> InjectionConfig {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        map.insert("kubedb.monitor/enable".into(), "true".into());
        for (k, v) in extra {
            map.insert(format!("kubedb.monitor/{k}"), v.to_string());
        }
        parse_annotations(Some(&map)).unwrap().config
    }

    fn apply(pod: &Pod, patch: &Patch) -> Pod {
        let mut doc = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut doc, patch).expect("patch applies");
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn disabled_config_yields_empty_patch() {
        let pod = pod(json!([{"name": "app", "image": "corp/app:1"}]));
        let config = InjectionConfig::default();
        let outcome = build_patch(&pod, &config, &settings()).unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn injects_volume_init_container_and_env() {
        let pod = pod(json!([
            {"name": "app", "image": "corp/app:1"},
            {"name": "worker", "image": "corp/worker:1"}
        ]));
        let config = enabled_config(&[
            ("collector-type", "http"),
            ("collector-endpoint", "http://cp:8080/api/metrics"),
        ]);
        let outcome = build_patch(&pod, &config, &settings()).unwrap();
        let mutated = apply(&pod, &outcome.patch);
        let spec = mutated.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, AGENT_VOLUME_NAME);

        let init = spec.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, AGENT_INIT_CONTAINER_NAME);

        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert!(mounts.iter().any(|m| m.name == AGENT_VOLUME_NAME
                && m.mount_path == "/opt/kubedb/agent"
                && m.read_only == Some(true)));
            let env = container.env.as_ref().unwrap();
            let opts = env
                .iter()
                .find(|e| e.name == JAVA_TOOL_OPTIONS)
                .and_then(|e| e.value.as_deref())
                .unwrap();
            assert_eq!(
                opts.matches("-javaagent:").count(),
                1,
                "exactly one javaagent marker"
            );
            assert!(opts.contains(
                "-javaagent:/opt/kubedb/agent/agent.jar=collector-type=http,collector-endpoint=http%3A%2F%2Fcp%3A8080%2Fapi%2Fmetrics"
            ));
            assert!(env
                .iter()
                .any(|e| e.name == COLLECTOR_ENV && e.value.as_deref() == Some("http")));
            assert!(env.iter().any(|e| e.name == ENDPOINT_ENV));
        }
    }

    #[test]
    fn mutator_is_idempotent_over_its_own_output() {
        let pod = pod(json!([{"name": "app", "image": "corp/app:1"}]));
        let config = enabled_config(&[]);
        let first = build_patch(&pod, &config, &settings()).unwrap();
        let mutated = apply(&pod, &first.patch);
        let second = build_patch(&mutated, &config, &settings()).unwrap();
        assert!(second.is_empty(), "second pass must be a no-op");
    }

    #[test]
    fn existing_java_tool_options_is_extended_once() {
        let pod = pod(json!([{
            "name": "app",
            "image": "corp/app:1",
            "env": [{"name": "JAVA_TOOL_OPTIONS", "value": "-Xmx512m"}]
        }]));
        let config = enabled_config(&[]);
        let outcome = build_patch(&pod, &config, &settings()).unwrap();
        let mutated = apply(&pod, &outcome.patch);
        let env = mutated.spec.unwrap().containers[0].env.clone().unwrap();
        let opts = env
            .iter()
            .find(|e| e.name == JAVA_TOOL_OPTIONS)
            .and_then(|e| e.value.clone())
            .unwrap();
        assert!(opts.starts_with("-Xmx512m "));
        assert_eq!(opts.matches("-javaagent:").count(), 1);
    }

    #[test]
    fn sidecar_images_are_left_alone() {
        let pod = pod(json!([
            {"name": "app", "image": "corp/app:1"},
            {"name": "istio-proxy", "image": "docker.io/istio/proxyv2:1.20"}
        ]));
        let config = enabled_config(&[]);
        let outcome = build_patch(&pod, &config, &settings()).unwrap();
        let mutated = apply(&pod, &outcome.patch);
        let spec = mutated.spec.unwrap();
        assert!(spec.containers[1].env.is_none());
        assert!(spec.containers[1].volume_mounts.is_none());
        assert!(spec.containers[0].env.is_some());
    }

    #[test]
    fn value_from_java_tool_options_yields_warning_not_failure() {
        let pod = pod(json!([{
            "name": "app",
            "image": "corp/app:1",
            "env": [{
                "name": "JAVA_TOOL_OPTIONS",
                "valueFrom": {"configMapKeyRef": {"name": "jvm", "key": "opts"}}
            }]
        }]));
        let config = enabled_config(&[]);
        let outcome = build_patch(&pod, &config, &settings()).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn missing_spec_is_a_patch_build_failure() {
        let pod: Pod = serde_json::from_value(json!({"metadata": {"name": "p"}})).unwrap();
        let config = enabled_config(&[]);
        assert!(matches!(
            build_patch(&pod, &config, &settings()),
            Err(PatchBuildFailure::MissingSpec)
        ));
    }
}
