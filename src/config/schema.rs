//! Configuration schema for byoe
//!
//! The site configuration lives in `byoe.toml` next to a `conf.d/envs/`
//! directory holding one environment per file. Every table rejects
//! unknown keys so typos fail at load time instead of mid-build.

use crate::ecosystem::Ecosystem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Phase name used for install batches
pub const INSTALL_PHASE: &str = "install";

/// Phase name used as the fallback for unlisted phases
pub const DEFAULT_PHASE: &str = "default";

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    /// General settings
    pub general: GeneralConfig,

    /// Where snapshots, logs and channel pointers live
    pub storage: StorageConfig,

    /// Build scheduling
    pub build: BuildConfig,

    /// Shared build cache
    pub cache: CacheConfig,

    /// Cache lease timing
    pub lease: LeaseConfig,

    /// Snapshot retention
    pub retention: RetentionConfig,

    /// Site-wide ecosystem settings and pins
    pub ecosystems: EcosystemsConfig,

    /// Per layer-kind option defaults
    pub defaults: LayerDefaults,

    /// Environment name to specification
    pub envs: BTreeMap<String, EnvironmentSpec>,

    /// Isolated apps offered to every environment
    pub apps: BTreeMap<String, AppSpec>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Append lifecycle events to `logs/events.log`
    pub event_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            event_log: true,
        }
    }
}

/// Release channel, named after how often it moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Bloody,
    #[default]
    Fresh,
    Stable,
    Stale,
    Old,
}

impl Channel {
    /// Length of the channel's update period in months
    pub fn update_months(&self) -> u32 {
        match self {
            Self::Bloody => 1,
            Self::Fresh => 3,
            Self::Stable => 6,
            Self::Stale => 12,
            Self::Old => 24,
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Bloody, Self::Fresh, Self::Stable, Self::Stale, Self::Old]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bloody => "bloody",
            Self::Fresh => "fresh",
            Self::Stable => "stable",
            Self::Stale => "stale",
            Self::Old => "old",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                format!("unknown channel '{s}', expected one of bloody, fresh, stable, stale, old")
            })
    }
}

/// Storage layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root of the installation tree
    pub base_dir: PathBuf,

    /// Channel that `update` publishes to
    pub channel: Channel,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("byoe"),
            channel: Channel::default(),
        }
    }
}

impl StorageConfig {
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn licenses_dir(&self) -> PathBuf {
        self.base_dir.join("licenses")
    }

    pub fn channels_dir(&self) -> PathBuf {
        self.base_dir.join("channels")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.base_dir.join("work")
    }

    /// Path of the JSON-lines event journal
    pub fn event_log_path(&self) -> PathBuf {
        self.logs_dir().join("events.log")
    }
}

/// Build scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Concurrent installs for the local backend
    pub max_tasks: usize,

    /// Interval between job status polls
    pub poll_interval_ms: u64,

    /// How long an aborted run waits for in-flight jobs to finish
    pub abort_grace_secs: u64,

    /// Scratch directory exported as TMPDIR to installs
    pub scratch_dir: Option<PathBuf>,

    /// Backend retry policy
    pub retry: RetryConfig,

    /// Batch backend (Slurm) settings
    pub batch: BatchConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            max_tasks: (cpus / 2).max(1),
            poll_interval_ms: 30_000,
            abort_grace_secs: 60,
            scratch_dir: None,
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Bounded exponential backoff for backend calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Batch backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Submit installs through Slurm instead of running them locally
    pub enabled: bool,

    pub sbatch: String,
    pub squeue: String,
    pub scancel: String,

    /// Per-phase resource templates, keyed by phase name
    pub phases: BTreeMap<String, PhaseConfig>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            scancel: "scancel".to_string(),
            phases: BTreeMap::new(),
        }
    }
}

impl BatchConfig {
    /// Settings for a phase, falling back to the `default` phase
    pub fn phase(&self, name: &str) -> PhaseConfig {
        self.phases
            .get(name)
            .or_else(|| self.phases.get(DEFAULT_PHASE))
            .cloned()
            .unwrap_or_default()
    }
}

/// Resource template for one build phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhaseConfig {
    /// Send this phase to the batch backend
    pub enabled: bool,

    /// Nodes per job, also the job's cpu count
    pub tasks_per_job: usize,

    /// Concurrent jobs in flight
    pub max_jobs: usize,

    /// Extra sbatch arguments, whitespace separated
    pub args: String,

    /// Scratch directory on the compute nodes
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tasks_per_job: 16,
            max_jobs: 4,
            args: String::new(),
            scratch_dir: None,
        }
    }
}

/// Build cache settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Shared cache root (defaults to `<base_dir>/cache`)
    pub root: Option<PathBuf>,
}

/// Cache lease timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    /// A lease without a heartbeat for this long is stale
    pub stale_after_secs: u64,

    /// How often holders refresh their leases
    pub heartbeat_secs: u64,

    /// Longest wait for a node another process is building
    pub wait_timeout_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 600,
            heartbeat_secs: 60,
            wait_timeout_secs: 24 * 3600,
        }
    }
}

/// Snapshot retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Published snapshots kept with full artifacts, per channel
    pub keep: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep: 3 }
    }
}

/// Site-wide ecosystem settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EcosystemsConfig {
    pub base: BaseEcosystemConfig,
    pub index: IndexEcosystemConfig,
    pub app: AppEcosystemConfig,
    pub venv: VenvEcosystemConfig,
    pub apptainer: ApptainerEcosystemConfig,
}

/// Base ecosystem (Spack) settings and global pins
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseEcosystemConfig {
    pub command: String,
    pub target: Option<String>,
    pub compiler: Option<String>,
    pub providers: BTreeMap<String, Vec<String>>,

    /// Binary mirror that built packages are pushed to
    pub mirror: Option<String>,
}

impl Default for BaseEcosystemConfig {
    fn default() -> Self {
        Self {
            command: "spack".to_string(),
            target: None,
            compiler: None,
            providers: BTreeMap::new(),
            mirror: None,
        }
    }
}

/// Language package index (uv) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexEcosystemConfig {
    pub command: String,
    pub index_url: Option<String>,
}

impl Default for IndexEcosystemConfig {
    fn default() -> Self {
        Self {
            command: "uv".to_string(),
            index_url: None,
        }
    }
}

/// Isolated app ecosystem (micromamba) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppEcosystemConfig {
    pub command: String,
    pub channels: Vec<String>,
}

impl Default for AppEcosystemConfig {
    fn default() -> Self {
        Self {
            command: "micromamba".to_string(),
            channels: vec!["conda-forge".to_string()],
        }
    }
}

/// Python app ecosystem settings, one uv-built venv per app
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VenvEcosystemConfig {
    pub command: String,
    pub index_url: Option<String>,
}

impl Default for VenvEcosystemConfig {
    fn default() -> Self {
        Self {
            command: "uv".to_string(),
            index_url: None,
        }
    }
}

/// Container app ecosystem settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApptainerEcosystemConfig {
    pub command: String,
}

impl Default for ApptainerEcosystemConfig {
    fn default() -> Self {
        Self {
            command: "apptainer".to_string(),
        }
    }
}

/// Option defaults applied under each layer's own options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerDefaults {
    pub base: LayerOptions,
    pub index: LayerOptions,
    pub app: LayerOptions,
}

impl LayerDefaults {
    pub fn for_kind(&self, kind: LayerKind) -> &LayerOptions {
        match kind {
            LayerKind::Base => &self.base,
            LayerKind::PackageIndex => &self.index,
            LayerKind::App => &self.app,
        }
    }
}

/// One environment: an ordered stack of ecosystem layers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentSpec {
    pub layers: Vec<LayerSpec>,

    /// The snapshot fails if this environment fails
    pub required: bool,

    /// Accept partially built required layers
    pub best_effort: bool,

    /// Non-default apps to add
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include_apps: Vec<String>,

    /// Default apps to leave out
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_apps: Vec<String>,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            required: true,
            best_effort: false,
            include_apps: Vec::new(),
            exclude_apps: Vec::new(),
        }
    }
}

/// Tool an app layer installs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppTool {
    #[default]
    Conda,
    Venv,
    Apptainer,
}

impl AppTool {
    pub fn ecosystem(&self) -> Ecosystem {
        match self {
            Self::Conda => Ecosystem::Conda,
            Self::Venv => Ecosystem::Venv,
            Self::Apptainer => Ecosystem::Apptainer,
        }
    }
}

/// A named app, appended to environments as its own optional layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppSpec {
    pub tool: AppTool,

    /// Requests in the tool's syntax; apptainer takes image references
    pub packages: Vec<String>,

    pub options: LayerOptions,

    /// Added to every environment that does not exclude it
    pub default: bool,
}

impl Default for AppSpec {
    fn default() -> Self {
        Self {
            tool: AppTool::default(),
            packages: Vec::new(),
            options: LayerOptions::default(),
            default: true,
        }
    }
}

impl AppSpec {
    pub fn to_layer(&self) -> LayerSpec {
        LayerSpec {
            kind: LayerKind::App,
            packages: self.packages.clone(),
            options: self.options.clone(),
            required: None,
            tool: Some(self.tool),
        }
    }
}

/// Kind of ecosystem a layer resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "index")]
    PackageIndex,
    #[serde(rename = "app")]
    App,
}

impl LayerKind {
    /// Ecosystem of the kind; app layers may pick another tool
    pub fn ecosystem(&self) -> Ecosystem {
        match self {
            Self::Base => Ecosystem::Spack,
            Self::PackageIndex => Ecosystem::Pip,
            Self::App => Ecosystem::Conda,
        }
    }

    /// Base and package-index layers hold linkable software
    pub fn required_by_default(&self) -> bool {
        !matches!(self, Self::App)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::PackageIndex => "index",
            Self::App => "app",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One layer of an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    pub kind: LayerKind,

    /// Abstract package requests in the ecosystem's own syntax
    pub packages: Vec<String>,

    #[serde(default)]
    pub options: LayerOptions,

    /// Overrides the kind's default requiredness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    /// App layers only: which tool installs the apps (default conda)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<AppTool>,
}

impl LayerSpec {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or_else(|| self.kind.required_by_default())
    }

    pub fn ecosystem(&self) -> Ecosystem {
        match self.kind {
            LayerKind::App => self.tool.unwrap_or_default().ecosystem(),
            kind => kind.ecosystem(),
        }
    }
}

/// GPU runtime bound into container apps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuRuntime {
    Nvidia,
    Rocm,
}

impl GpuRuntime {
    pub fn apptainer_flag(&self) -> &'static str {
        match self {
            Self::Nvidia => "--nv",
            Self::Rocm => "--rocm",
        }
    }
}

/// What to do when a package-index pin disagrees with the base layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Reject,
    Warn,
}

/// Ecosystem options for a layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Virtual package to preferred providers
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, Vec<String>>,

    /// Package to variant string, e.g. `hdf5 = "+mpi ~fortran"`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, String>,

    /// Package to external installation prefix
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub externals: BTreeMap<String, PathBuf>,

    /// Upstream node the package-index layer runs on (default `python`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,

    /// Interpreter version for venv apps, e.g. "3.12"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,

    /// Let venv apps see the interpreter's site-packages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_site_packages: Option<bool>,

    /// Commands an app puts on PATH; empty means the app's own name
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exported: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuRuntime>,
}

impl LayerOptions {
    /// Overlay `self` on top of `under`: scalars win, variant strings
    /// concatenate, provider lists keep `self` entries first.
    pub fn over(&self, under: &LayerOptions) -> LayerOptions {
        let mut merged = under.clone();

        if self.compiler.is_some() {
            merged.compiler = self.compiler.clone();
        }
        if self.target.is_some() {
            merged.target = self.target.clone();
        }
        if self.toolchain.is_some() {
            merged.toolchain = self.toolchain.clone();
        }
        if self.conflict_policy.is_some() {
            merged.conflict_policy = self.conflict_policy;
        }
        if self.python.is_some() {
            merged.python = self.python.clone();
        }
        if self.system_site_packages.is_some() {
            merged.system_site_packages = self.system_site_packages;
        }
        if self.gpu.is_some() {
            merged.gpu = self.gpu;
        }
        if !self.exported.is_empty() {
            merged.exported = self.exported.clone();
        }

        for (virt, providers) in &self.providers {
            let entry = merged.providers.entry(virt.clone()).or_default();
            let mut list = providers.clone();
            list.extend(entry.iter().filter(|p| !providers.contains(p)).cloned());
            *entry = list;
        }

        for (pkg, variant) in &self.variants {
            merged
                .variants
                .entry(pkg.clone())
                .and_modify(|v| {
                    v.push(' ');
                    v.push_str(variant);
                })
                .or_insert_with(|| variant.clone());
        }

        merged
            .externals
            .extend(self.externals.iter().map(|(k, v)| (k.clone(), v.clone())));

        merged
    }
}

impl SiteConfig {
    /// Root of the shared build cache
    pub fn cache_root(&self) -> PathBuf {
        self.cache
            .root
            .clone()
            .unwrap_or_else(|| self.storage.base_dir.join("cache"))
    }

    /// The environment's own layers followed by one layer per selected app
    pub fn env_layers(&self, env: &EnvironmentSpec) -> Vec<LayerSpec> {
        let mut layers = env.layers.clone();
        layers.extend(
            self.apps
                .iter()
                .filter(|(name, app)| {
                    (app.default || env.include_apps.contains(name))
                        && !env.exclude_apps.contains(name)
                })
                .map(|(_, app)| app.to_layer()),
        );
        layers
    }

    /// Check cross-field rules that serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.retention.keep == 0 {
            return Err("retention.keep must be at least 1".to_string());
        }
        if self.build.max_tasks == 0 {
            return Err("build.max_tasks must be at least 1".to_string());
        }
        if self.build.poll_interval_ms == 0 {
            return Err("build.poll_interval_ms must be positive".to_string());
        }
        if self.build.retry.max_attempts == 0 {
            return Err("build.retry.max_attempts must be at least 1".to_string());
        }
        let lease = &self.lease;
        if lease.heartbeat_secs == 0 || lease.heartbeat_secs >= lease.stale_after_secs {
            return Err(format!(
                "lease.heartbeat_secs ({}) must be positive and below lease.stale_after_secs ({})",
                lease.heartbeat_secs, lease.stale_after_secs
            ));
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            ));
        }
        for (phase, cfg) in &self.build.batch.phases {
            if cfg.tasks_per_job == 0 || cfg.max_jobs == 0 {
                return Err(format!(
                    "build.batch.phases.{phase}: tasks_per_job and max_jobs must be at least 1"
                ));
            }
        }
        for (name, app) in &self.apps {
            if !is_valid_name(name) {
                return Err(format!(
                    "app name '{name}' may only contain letters, digits, '_' and '-'"
                ));
            }
            if self.envs.contains_key(name) {
                return Err(format!("'{name}' names both an environment and an app"));
            }
            if app.packages.is_empty() {
                return Err(format!("app '{name}' requests no packages"));
            }
        }
        for (name, env) in &self.envs {
            validate_env(name, env)?;
            if let Some(unknown) = env
                .include_apps
                .iter()
                .chain(&env.exclude_apps)
                .find(|app| !self.apps.contains_key(*app))
            {
                return Err(format!("environment '{name}' refers to unknown app '{unknown}'"));
            }
        }
        Ok(())
    }
}

/// Environment names end up in paths and shell variables
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_env(name: &str, env: &EnvironmentSpec) -> Result<(), String> {
    if !is_valid_name(name) {
        return Err(format!(
            "environment name '{name}' may only contain letters, digits, '_' and '-'"
        ));
    }
    if env.layers.is_empty() {
        return Err(format!("environment '{name}' has no layers"));
    }

    let mut seen_app = false;
    for (index, layer) in env.layers.iter().enumerate() {
        if layer.packages.is_empty() {
            return Err(format!("environment '{name}' layer {index} requests no packages"));
        }
        if layer.tool.is_some() && layer.kind != LayerKind::App {
            return Err(format!(
                "environment '{name}' layer {index}: only app layers take a tool"
            ));
        }
        match layer.kind {
            LayerKind::Base if index != 0 => {
                return Err(format!(
                    "environment '{name}': the base layer must come first and appear once"
                ));
            }
            LayerKind::App => seen_app = true,
            _ if seen_app => {
                return Err(format!(
                    "environment '{name}': app layers must come after all other layers"
                ));
            }
            _ => {}
        }
    }
    Ok(())
}
