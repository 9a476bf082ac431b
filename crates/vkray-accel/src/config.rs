//! Ray tracer configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Shader files of one hit group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitGroupConfig {
    pub closest_hit: PathBuf,
    pub any_hit: Option<PathBuf>,
    /// Makes the group procedural.
    pub intersection: Option<PathBuf>,
}

impl HitGroupConfig {
    pub fn new(closest_hit: impl Into<PathBuf>) -> Self {
        Self {
            closest_hit: closest_hit.into(),
            any_hit: None,
            intersection: None,
        }
    }

    pub fn with_any_hit(mut self, path: impl Into<PathBuf>) -> Self {
        self.any_hit = Some(path.into());
        self
    }

    pub fn with_intersection(mut self, path: impl Into<PathBuf>) -> Self {
        self.intersection = Some(path.into());
        self
    }
}

/// Ray tracer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RayTracerConfig {
    /// Compact bottom-level structures after building them.
    pub compact: bool,
    /// Build the top-level structure on the host.
    pub host_build: bool,
    /// Requested recursion depth, clamped to the device limit.
    pub max_recursion_depth: u32,
    pub raygen_shader: PathBuf,
    pub miss_shaders: Vec<PathBuf>,
    pub hit_groups: Vec<HitGroupConfig>,
    pub callable_shaders: Vec<PathBuf>,
    /// Size of the texture array binding.
    pub texture_capacity: u32,
}

impl Default for RayTracerConfig {
    fn default() -> Self {
        Self {
            compact: true,
            host_build: false,
            max_recursion_depth: 3,
            raygen_shader: "shaders/spirv/raytrace.rgen.spv".into(),
            miss_shaders: vec![
                "shaders/spirv/raytrace.rmiss.spv".into(),
                "shaders/spirv/raytrace.2.rmiss.spv".into(),
                "shaders/spirv/raytrace.shadow.rmiss.spv".into(),
            ],
            hit_groups: vec![
                HitGroupConfig::new("shaders/spirv/raytrace.rchit.spv"),
                HitGroupConfig::new("shaders/spirv/raytrace.2.rchit.spv"),
            ],
            callable_shaders: Vec::new(),
            texture_capacity: 0,
        }
    }
}

impl RayTracerConfig {
    /// Enable or disable compaction.
    pub fn with_compaction(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    /// Enable or disable host builds of the top-level structure.
    pub fn with_host_build(mut self, host_build: bool) -> Self {
        self.host_build = host_build;
        self
    }

    /// Set the requested recursion depth.
    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Set the ray generation shader.
    pub fn with_raygen_shader(mut self, path: impl Into<PathBuf>) -> Self {
        self.raygen_shader = path.into();
        self
    }

    /// Replace the miss shaders.
    pub fn with_miss_shaders<P: Into<PathBuf>>(mut self, paths: impl IntoIterator<Item = P>) -> Self {
        self.miss_shaders = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the hit groups.
    pub fn with_hit_groups(mut self, groups: impl IntoIterator<Item = HitGroupConfig>) -> Self {
        self.hit_groups = groups.into_iter().collect();
        self
    }

    /// Replace the callable shaders.
    pub fn with_callable_shaders<P: Into<PathBuf>>(
        mut self,
        paths: impl IntoIterator<Item = P>,
    ) -> Self {
        self.callable_shaders = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Set the texture array size.
    pub fn with_texture_capacity(mut self, capacity: u32) -> Self {
        self.texture_capacity = capacity;
        self
    }

    /// Resolve every shader path against `root`.
    pub fn with_shader_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let join = |path: &mut PathBuf| *path = root.join(&*path);
        join(&mut self.raygen_shader);
        self.miss_shaders.iter_mut().for_each(join);
        self.callable_shaders.iter_mut().for_each(join);
        for group in &mut self.hit_groups {
            join(&mut group.closest_hit);
            group.any_hit.iter_mut().for_each(join);
            group.intersection.iter_mut().for_each(join);
        }
        self
    }
}
