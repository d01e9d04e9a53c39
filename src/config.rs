use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cascade::{CascadeSpec, FallbackTrigger, StageKind, StageSpec};
use crate::classes::{ClassKeyTable, UnknownClassPolicy};
use crate::detect::{validate_candidate_name, InferenceParams, LoadPolicy};
use crate::frame::MAX_COMPRESSED_BYTES;

const DEFAULT_API_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MODEL_DIR: &str = "model";
const DEFAULT_MODE: &str = "real";
/// Multipart framing on top of the largest accepted image.
const DEFAULT_MAX_BODY_BYTES: usize = MAX_COMPRESSED_BYTES + 64 * 1024;

const DEFAULT_MODELS: [(&str, &[&str]); 3] = [
    ("filter", &["best_m1_bgv8s.onnx"]),
    ("real", &["best_modelv8sbg.onnx", "best_modelv8nbg.onnx"]),
    ("real_fallback", &["best_modelv8nbg.onnx"]),
];

#[derive(Debug, Deserialize, Default)]
struct BananaConfigFile {
    api: Option<ApiConfigFile>,
    models: Option<ModelsConfigFile>,
    default_mode: Option<String>,
    cascade: Option<CascadeConfigFile>,
    modes: Option<BTreeMap<String, CascadeConfigFile>>,
    unknown_class: Option<String>,
    classes: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    dir: Option<PathBuf>,
    on_missing: Option<String>,
    loading: Option<String>,
    input_size: Option<u32>,
    entries: Option<Vec<ModelEntry>>,
}

#[derive(Debug, Deserialize, Default)]
struct CascadeConfigFile {
    acceptance_threshold: Option<f32>,
    fallback_trigger: Option<String>,
    stages: Option<Vec<StageConfigFile>>,
    fallback: Option<StageConfigFile>,
    disable_fallback: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StageConfigFile {
    model: String,
    name: Option<String>,
    kind: Option<String>,
    confidence: Option<f32>,
    iou: Option<f32>,
    augment: Option<bool>,
}

/// When models are loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadingMode {
    /// All models at startup.
    #[default]
    Eager,
    /// Each model on the first request that needs it.
    Lazy,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    /// File names inside the model directory, in search order.
    pub candidates: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ModelSettings {
    pub dir: PathBuf,
    pub on_missing: LoadPolicy,
    pub loading: LoadingMode,
    pub input_size: u32,
    pub entries: Vec<ModelEntry>,
}

#[derive(Clone, Debug)]
pub struct BananaConfig {
    pub api_addr: String,
    pub max_body_bytes: usize,
    pub models: ModelSettings,
    pub default_mode: String,
    /// Cascade per inference mode; always contains `default_mode`.
    pub cascades: BTreeMap<String, CascadeSpec>,
    pub unknown_class: UnknownClassPolicy,
    pub classes: ClassKeyTable,
}

impl Default for BananaConfig {
    fn default() -> Self {
        let mut cascades = BTreeMap::new();
        cascades.insert(DEFAULT_MODE.to_string(), CascadeSpec::default());
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            models: ModelSettings {
                dir: PathBuf::from(DEFAULT_MODEL_DIR),
                on_missing: LoadPolicy::default(),
                loading: LoadingMode::default(),
                input_size: InferenceParams::default().input_size,
                entries: default_model_entries(),
            },
            default_mode: DEFAULT_MODE.to_string(),
            cascades,
            unknown_class: UnknownClassPolicy::default(),
            classes: ClassKeyTable::default(),
        }
    }
}

impl BananaConfig {
    /// Defaults, then `BANANA_CONFIG` file, then `BANANA_*` env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("BANANA_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file without consulting `BANANA_CONFIG`; env overrides still apply.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BananaConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let api = file.api.unwrap_or_default();
        let models_file = file.models.unwrap_or_default();
        let input_size = models_file
            .input_size
            .unwrap_or(defaults.models.input_size);

        let models = ModelSettings {
            dir: models_file.dir.unwrap_or(defaults.models.dir),
            on_missing: match models_file.on_missing {
                Some(value) => parse_load_policy(&value)?,
                None => defaults.models.on_missing,
            },
            loading: match models_file.loading {
                Some(value) => parse_loading_mode(&value)?,
                None => defaults.models.loading,
            },
            input_size,
            entries: models_file.entries.unwrap_or(defaults.models.entries),
        };

        let unknown_class = match file.unknown_class {
            Some(value) => UnknownClassPolicy::parse(&value)?,
            None => defaults.unknown_class,
        };

        let default_mode = file
            .default_mode
            .map(|m| m.trim().to_lowercase())
            .unwrap_or(defaults.default_mode);
        let mut cascades = BTreeMap::new();
        cascades.insert(
            default_mode.clone(),
            cascade_from_file(file.cascade.unwrap_or_default(), input_size)?,
        );
        for (mode, cascade) in file.modes.unwrap_or_default() {
            let mode = mode.trim().to_lowercase();
            if cascades.contains_key(&mode) {
                return Err(anyhow!("inference mode '{}' is defined twice", mode));
            }
            cascades.insert(mode, cascade_from_file(cascade, input_size)?);
        }
        for cascade in cascades.values_mut() {
            cascade.unknown_class = unknown_class;
        }

        let classes = match file.classes {
            Some(map) => {
                let entries = map
                    .into_iter()
                    .map(|(id, key)| {
                        let id: u32 = id
                            .trim()
                            .parse()
                            .map_err(|_| anyhow!("class id '{}' is not a non-negative integer", id))?;
                        Ok((id, key))
                    })
                    .collect::<Result<Vec<_>>>()?;
                ClassKeyTable::new(entries)?
            }
            None => defaults.classes,
        };

        Ok(Self {
            api_addr: api.addr.unwrap_or(defaults.api_addr),
            max_body_bytes: api.max_body_bytes.unwrap_or(defaults.max_body_bytes),
            models,
            default_mode,
            cascades,
            unknown_class,
            classes,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("BANANA_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("BANANA_MODEL_DIR") {
            if !dir.trim().is_empty() {
                self.models.dir = PathBuf::from(dir);
            }
        }
        if let Ok(policy) = std::env::var("BANANA_MODEL_POLICY") {
            self.models.on_missing = parse_load_policy(&policy)?;
        }
        if let Ok(loading) = std::env::var("BANANA_MODEL_LOADING") {
            self.models.loading = parse_loading_mode(&loading)?;
        }
        if let Ok(threshold) = std::env::var("BANANA_ACCEPTANCE_THRESHOLD") {
            let threshold: f32 = threshold.trim().parse().map_err(|_| {
                anyhow!("BANANA_ACCEPTANCE_THRESHOLD must be a number between 0 and 1")
            })?;
            for cascade in self.cascades.values_mut() {
                cascade.acceptance_threshold = threshold;
            }
        }
        if let Ok(trigger) = std::env::var("BANANA_FALLBACK_TRIGGER") {
            let trigger = FallbackTrigger::parse(&trigger)?;
            for cascade in self.cascades.values_mut() {
                cascade.fallback_trigger = trigger;
            }
        }
        if let Ok(policy) = std::env::var("BANANA_UNKNOWN_CLASS") {
            self.unknown_class = UnknownClassPolicy::parse(&policy)?;
            for cascade in self.cascades.values_mut() {
                cascade.unknown_class = self.unknown_class;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_body_bytes == 0 {
            return Err(anyhow!("api.max_body_bytes must be greater than zero"));
        }
        if self.models.input_size == 0 || self.models.input_size % 32 != 0 {
            return Err(anyhow!(
                "models.input_size must be a positive multiple of 32, got {}",
                self.models.input_size
            ));
        }
        let mut names = Vec::new();
        for entry in &self.models.entries {
            if entry.name.trim().is_empty() {
                return Err(anyhow!("model entries need a name"));
            }
            if names.contains(&entry.name.as_str()) {
                return Err(anyhow!("model '{}' is declared twice", entry.name));
            }
            if entry.candidates.is_empty() {
                return Err(anyhow!("model '{}' has no candidate files", entry.name));
            }
            for candidate in &entry.candidates {
                validate_candidate_name(candidate).map_err(|e| anyhow!(e))?;
            }
            names.push(entry.name.as_str());
        }
        if !self.cascades.contains_key(&self.default_mode) {
            return Err(anyhow!("default mode '{}' has no cascade", self.default_mode));
        }
        for (mode, cascade) in &self.cascades {
            let stages = cascade.stages.iter().chain(cascade.fallback.iter());
            for stage in stages {
                if !names.contains(&stage.model.as_str()) {
                    return Err(anyhow!(
                        "mode '{}' stage '{}' uses undeclared model '{}'",
                        mode,
                        stage.name,
                        stage.model
                    ));
                }
            }
        }
        Ok(())
    }
}

fn cascade_from_file(file: CascadeConfigFile, input_size: u32) -> Result<CascadeSpec> {
    let defaults = CascadeSpec::default();
    let stages = match file.stages {
        Some(stages) => {
            let last = stages.len().saturating_sub(1);
            stages
                .into_iter()
                .enumerate()
                .map(|(idx, stage)| {
                    let default_kind = if idx == last {
                        StageKind::Terminal
                    } else {
                        StageKind::Gating
                    };
                    stage_from_file(stage, default_kind, input_size)
                })
                .collect::<Result<Vec<_>>>()?
        }
        None => defaults
            .stages
            .into_iter()
            .map(|stage| with_input_size(stage, input_size))
            .collect(),
    };
    let fallback = if file.disable_fallback.unwrap_or(false) {
        None
    } else {
        match file.fallback {
            Some(stage) => Some(stage_from_file(stage, StageKind::Terminal, input_size)?),
            None => defaults
                .fallback
                .map(|stage| with_input_size(stage, input_size)),
        }
    };
    Ok(CascadeSpec {
        stages,
        fallback,
        fallback_trigger: match file.fallback_trigger {
            Some(value) => FallbackTrigger::parse(&value)?,
            None => defaults.fallback_trigger,
        },
        acceptance_threshold: file
            .acceptance_threshold
            .unwrap_or(defaults.acceptance_threshold),
        unknown_class: defaults.unknown_class,
    })
}

fn stage_from_file(file: StageConfigFile, default_kind: StageKind, input_size: u32) -> Result<StageSpec> {
    let kind = match file.kind.as_deref().map(|k| k.trim().to_ascii_lowercase()) {
        None => default_kind,
        Some(k) if k == "gating" => StageKind::Gating,
        Some(k) if k == "terminal" => StageKind::Terminal,
        Some(other) => {
            return Err(anyhow!(
                "stage kind must be 'gating' or 'terminal', got '{}'",
                other
            ))
        }
    };
    let defaults = InferenceParams::default();
    let params = InferenceParams {
        confidence_threshold: file.confidence.unwrap_or(defaults.confidence_threshold),
        iou_threshold: file.iou.unwrap_or(defaults.iou_threshold),
        input_size,
        augment: file.augment.unwrap_or(defaults.augment),
    };
    let name = file.name.unwrap_or_else(|| file.model.clone());
    Ok(StageSpec {
        name,
        model: file.model,
        kind,
        params,
    })
}

fn with_input_size(mut stage: StageSpec, input_size: u32) -> StageSpec {
    stage.params.input_size = input_size;
    stage
}

fn default_model_entries() -> Vec<ModelEntry> {
    DEFAULT_MODELS
        .iter()
        .map(|(name, candidates)| ModelEntry {
            name: name.to_string(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
        })
        .collect()
}

fn parse_load_policy(value: &str) -> Result<LoadPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fatal" => Ok(LoadPolicy::Fatal),
        "degrade" => Ok(LoadPolicy::Degrade),
        other => Err(anyhow!(
            "model policy must be 'fatal' or 'degrade', got '{}'",
            other
        )),
    }
}

fn parse_loading_mode(value: &str) -> Result<LoadingMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "eager" => Ok(LoadingMode::Eager),
        "lazy" => Ok(LoadingMode::Lazy),
        other => Err(anyhow!(
            "model loading must be 'eager' or 'lazy', got '{}'",
            other
        )),
    }
}

fn read_config_file(path: &Path) -> Result<BananaConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg: BananaConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
