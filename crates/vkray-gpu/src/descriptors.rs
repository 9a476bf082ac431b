//! Descriptor set layout declaration.

use crate::device::RayTracingDevice;
use crate::error::Result;
use ash::vk;

/// One declared binding point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDecl {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
}

/// Descriptor set layout builder.
///
/// Bindings are kept sorted by binding number. The same declaration produces
/// the layout bindings, their binding flags and the pool sizes.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<BindingDecl>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a binding.
    ///
    /// Returns the declaration that was replaced, if any.
    pub fn insert(&mut self, decl: BindingDecl) -> Option<BindingDecl> {
        match self.bindings.binary_search_by_key(&decl.binding, |b| b.binding) {
            Ok(i) => Some(std::mem::replace(&mut self.bindings[i], decl)),
            Err(i) => {
                self.bindings.insert(i, decl);
                None
            }
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.insert(BindingDecl {
            binding,
            descriptor_type,
            count,
            stages,
            flags: vk::DescriptorBindingFlags::empty(),
        });
        self
    }

    /// Add an acceleration structure binding.
    pub fn acceleration_structure(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stages,
        )
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stages)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
    }

    /// Look up a declared binding.
    pub fn get(&self, binding: u32) -> Option<&BindingDecl> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .ok()
            .map(|i| &self.bindings[i])
    }

    /// All declarations in binding order.
    pub fn declarations(&self) -> &[BindingDecl] {
        &self.bindings
    }

    /// Pool sizes with one entry per descriptor type, enough for one set.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for decl in &self.bindings {
            match sizes.iter_mut().find(|s| s.ty == decl.descriptor_type) {
                Some(size) => size.descriptor_count += decl.count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(decl.descriptor_type)
                        .descriptor_count(decl.count),
                ),
            }
        }
        sizes
    }

    /// Create the descriptor set layout.
    pub fn build(&self, device: &dyn RayTracingDevice) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = self
            .bindings
            .iter()
            .map(|decl| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(decl.binding)
                    .descriptor_type(decl.descriptor_type)
                    .descriptor_count(decl.count)
                    .stage_flags(decl.stages)
            })
            .collect();
        let flags: Vec<vk::DescriptorBindingFlags> =
            self.bindings.iter().map(|decl| decl.flags).collect();

        device.create_descriptor_set_layout(&bindings, &flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_merge_by_type() {
        let builder = DescriptorSetLayoutBuilder::new()
            .acceleration_structure(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .uniform_buffer(2, vk::ShaderStageFlags::RAYGEN_KHR)
            .binding(
                3,
                vk::DescriptorType::STORAGE_BUFFER,
                4,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )
            .binding(
                4,
                vk::DescriptorType::STORAGE_BUFFER,
                4,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )
            .uniform_buffer(7, vk::ShaderStageFlags::CLOSEST_HIT_KHR);

        let sizes = builder.pool_sizes();
        assert_eq!(sizes.len(), 4);
        let storage = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .unwrap();
        assert_eq!(storage.descriptor_count, 8);
        let uniform = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 2);
    }

    #[test]
    fn insert_replaces_and_keeps_order() {
        let mut builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(5, vk::ShaderStageFlags::MISS_KHR)
            .storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR);

        let old = builder.insert(BindingDecl {
            binding: 5,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            count: 2,
            stages: vk::ShaderStageFlags::MISS_KHR,
            flags: vk::DescriptorBindingFlags::empty(),
        });

        assert_eq!(
            old.map(|d| d.descriptor_type),
            Some(vk::DescriptorType::UNIFORM_BUFFER)
        );
        let order: Vec<u32> = builder.declarations().iter().map(|d| d.binding).collect();
        assert_eq!(order, vec![1, 5]);
        assert_eq!(builder.get(5).map(|d| d.count), Some(2));
    }
}
