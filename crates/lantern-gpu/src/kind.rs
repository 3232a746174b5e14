//! Buffer kinds.
//!
//! One concrete buffer type covers vertex, index, uniform and storage data;
//! the kind only decides usage flags and carries the kind-specific metadata.

use ash::vk;

/// One attribute of a vertex layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Per-vertex layout of a vertex buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Create an empty layout with the given stride.
    pub fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: Vec::new(),
        }
    }

    /// Add an attribute.
    pub fn attribute(mut self, location: u32, format: vk::Format, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }

    /// Pipeline vertex input descriptions for this layout bound at `binding`.
    pub fn input_descriptions(
        &self,
        binding: u32,
    ) -> (
        vk::VertexInputBindingDescription,
        Vec<vk::VertexInputAttributeDescription>,
    ) {
        let binding_desc = vk::VertexInputBindingDescription {
            binding,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        };
        let attributes = self
            .attributes
            .iter()
            .map(|attr| vk::VertexInputAttributeDescription {
                location: attr.location,
                binding,
                format: attr.format,
                offset: attr.offset,
            })
            .collect();
        (binding_desc, attributes)
    }
}

/// Index element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    /// Vulkan index type.
    pub fn vk(self) -> vk::IndexType {
        match self {
            Self::U16 => vk::IndexType::UINT16,
            Self::U32 => vk::IndexType::UINT32,
        }
    }

    /// Bytes per index.
    pub fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// What a buffer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferKind {
    Vertex(VertexLayout),
    Index(IndexFormat),
    Uniform,
    Storage,
}

impl BufferKind {
    /// Usage flags for the backing buffer.
    ///
    /// Every buffer can be a transfer source and destination so that staging
    /// uploads, scratch flushes, resizes and read-back all work regardless of
    /// kind.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        let kind = match self {
            Self::Vertex(_) => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index(_) => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        };
        kind | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
    }

    /// Number of elements `bytes` holds, for kinds with a fixed element size.
    pub fn element_count(&self, bytes: u64) -> Option<u64> {
        match self {
            Self::Vertex(layout) if layout.stride > 0 => Some(bytes / u64::from(layout.stride)),
            Self::Index(format) => Some(bytes / format.size()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_includes_transfer_bits() {
        let usage = BufferKind::Uniform.usage();
        assert!(usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(usage.contains(
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
        ));
    }

    #[test]
    fn vertex_layout_descriptions() {
        let layout = VertexLayout::new(20)
            .attribute(0, vk::Format::R32G32B32_SFLOAT, 0)
            .attribute(1, vk::Format::R32G32_SFLOAT, 12);
        let (binding, attributes) = layout.input_descriptions(2);
        assert_eq!(binding.stride, 20);
        assert_eq!(binding.binding, 2);
        assert_eq!(attributes.len(), 2);
        assert!(attributes.iter().all(|a| a.binding == 2));
        assert_eq!(attributes[1].offset, 12);

        assert_eq!(BufferKind::Vertex(layout).element_count(100), Some(5));
    }

    #[test]
    fn index_element_count() {
        assert_eq!(BufferKind::Index(IndexFormat::U16).element_count(10), Some(5));
        assert_eq!(BufferKind::Index(IndexFormat::U32).element_count(10), Some(2));
        assert_eq!(BufferKind::Storage.element_count(10), None);
    }
}
