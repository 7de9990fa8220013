use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use chhoe_types::DatasetDescriptor;

use crate::validity::DEFAULT_RETRY_BUDGET;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Retries permitted per (dataset, generation) after a transient search
    /// failure.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Whether searches issued automatically when a dataset finishes loading
    /// late also get a retry budget.
    #[serde(default)]
    pub retry_on_late_load: bool,
    #[serde(default)]
    pub datasets: Vec<DatasetDescriptor>,
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_on_late_load: false,
            datasets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered config: global file, project file, environment, CLI overrides —
/// later layers win. Project edits persist; the rest are read-only.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let global_path = resolve_global_config_path().await?;

        let global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> SearchConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("CHHOE_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("chhoe").join("config.json"));
    }
    Ok(PathBuf::from(".chhoe/global_config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(raw) = std::env::var("CHHOE_RETRY_BUDGET") {
        if let Ok(budget) = raw.trim().parse::<u32>() {
            deep_merge(&mut root, &serde_json::json!({ "retry_budget": budget }));
        }
    }
    if let Ok(raw) = std::env::var("CHHOE_RETRY_ON_LATE_LOAD") {
        if let Some(enabled) = parse_bool_like(&raw) {
            deep_merge(
                &mut root,
                &serde_json::json!({ "retry_on_late_load": enabled }),
            );
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
