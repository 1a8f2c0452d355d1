use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, floating_type_mod::FT, V3};

/// How neighbor ids handed to the solver are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexingMode {
    /// The solver keeps its particle data in original order. `part_idx` translates through the
    /// permutation and neighbors are reported as original indices.
    Indirect,

    /// The solver works on cell-sorted data. `part_idx` is the identity and neighbors are reported
    /// as sorted slots; the sorted positions are read back to the host after every step.
    Reordered,
}

impl Default for IndexingMode {
    fn default() -> Self {
        IndexingMode::Indirect
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainParams {
    #[serde(default = "default_origin")]
    pub origin: V3,
    pub width: FT,
    pub height: FT,
    pub depth: FT,
}

impl DomainParams {
    pub fn new(width: FT, height: FT, depth: FT) -> Self {
        DomainParams {
            origin: default_origin(),
            width,
            height,
            depth,
        }
    }

    pub fn with_origin(mut self, origin: V3) -> Self {
        self.origin = origin;
        self
    }

    pub fn origin(&self) -> V3 {
        self.origin
    }

    pub fn extent(&self) -> [FT; 3] {
        [self.width, self.height, self.depth]
    }
}

/// Limits of the emulated accelerator. The defaults resemble a mid-range discrete GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorParams {
    // number of worker threads, `None` lets rayon decide
    #[serde(default)]
    pub compute_units: Option<usize>,
    #[serde(default = "default_max_threads_per_group")]
    pub max_threads_per_group: usize,
    #[serde(default = "default_shared_memory_per_group")]
    pub shared_memory_per_group: usize,
    #[serde(default = "default_device_memory_bytes")]
    pub device_memory_bytes: usize,
    #[serde(default = "default_pinned_memory_bytes")]
    pub pinned_memory_bytes: usize,
}

impl Default for AcceleratorParams {
    fn default() -> Self {
        AcceleratorParams {
            compute_units: None,
            max_threads_per_group: default_max_threads_per_group(),
            shared_memory_per_group: default_shared_memory_per_group(),
            device_memory_bytes: default_device_memory_bytes(),
            pinned_memory_bytes: default_pinned_memory_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub radius: FT,
    pub domain: DomainParams,

    // fluid + boundary particles, allocated once
    pub capacity: usize,

    #[serde(default)]
    pub indexing_mode: IndexingMode,

    #[serde(default = "default_work_group_size")]
    pub work_group_size: usize,

    // upper bound for the particles of one block task, further capped by the work-group size
    #[serde(default = "default_max_block_particles")]
    pub max_block_particles: usize,

    // initial size of the flat neighbor array is `capacity * neighbors_per_particle_hint`
    #[serde(default = "default_neighbors_per_particle_hint")]
    pub neighbors_per_particle_hint: usize,

    #[serde(default = "default_check_invariants")]
    pub check_invariants: bool,

    #[serde(default)]
    pub statistics_enabled: bool,

    #[serde(default)]
    pub accelerator: AcceleratorParams,
}

fn default_origin() -> V3 {
    V3::zeros()
}
fn default_max_threads_per_group() -> usize {
    1024
}
fn default_shared_memory_per_group() -> usize {
    64 * 1024
}
fn default_device_memory_bytes() -> usize {
    4 << 30
}
fn default_pinned_memory_bytes() -> usize {
    1 << 30
}
fn default_work_group_size() -> usize {
    256
}
fn default_max_block_particles() -> usize {
    256
}
fn default_neighbors_per_particle_hint() -> usize {
    48
}
fn default_check_invariants() -> bool {
    cfg!(debug_assertions)
}

impl SearchParams {
    pub fn new(radius: FT, domain: DomainParams, capacity: usize) -> Self {
        SearchParams {
            radius,
            domain,
            capacity,
            indexing_mode: IndexingMode::default(),
            work_group_size: default_work_group_size(),
            max_block_particles: default_max_block_particles(),
            neighbors_per_particle_hint: default_neighbors_per_particle_hint(),
            check_invariants: default_check_invariants(),
            statistics_enabled: false,
            accelerator: AcceleratorParams::default(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let params: SearchParams = serde_yaml::from_str(yaml)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Parses `base` and replaces its top-level keys with the values from `overrides`.
    /// Every overridden key has to exist in `base`.
    pub fn from_yaml_str_with_overrides(base: &str, overrides: &str) -> Result<Self, ConfigError> {
        let mut params_serde: serde_yaml::Value = serde_yaml::from_str(base)?;
        let overrides: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(overrides)?;

        for (k, v) in overrides.into_iter() {
            let slot = params_serde
                .as_mapping_mut()
                .and_then(|mapping| mapping.get_mut(&serde_yaml::Value::String(k.clone())))
                .ok_or_else(|| ConfigError::UnknownOverride(k.clone()))?;
            *slot = v;
        }

        let params: SearchParams = serde_yaml::from_value(params_serde)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.radius.is_finite() && self.radius > 0.) {
            return Err(ConfigError::InvalidRadius(self.radius));
        }
        let extent = self.domain.extent();
        if extent.iter().any(|e| !(e.is_finite() && *e > 0.)) || self.domain.origin.iter().any(|o| !o.is_finite()) {
            return Err(ConfigError::InvalidDomain(extent));
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroParameter("capacity"));
        }
        if self.work_group_size == 0 {
            return Err(ConfigError::ZeroParameter("work_group_size"));
        }
        if self.max_block_particles == 0 {
            return Err(ConfigError::ZeroParameter("max_block_particles"));
        }
        if self.accelerator.max_threads_per_group == 0 {
            return Err(ConfigError::ZeroParameter("accelerator.max_threads_per_group"));
        }
        if self.accelerator.compute_units == Some(0) {
            return Err(ConfigError::ZeroParameter("accelerator.compute_units"));
        }
        Ok(())
    }

    /// Particles per block task after applying the work-group limit.
    pub fn block_particle_limit(&self) -> usize {
        self.max_block_particles
            .min(self.work_group_size)
            .min(self.accelerator.max_threads_per_group)
    }
}
