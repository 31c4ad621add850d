use ash::vk;
use std::sync::Arc;

use super::state::{ImageStates, SubresourceRange};
use super::ImageHandle;

#[derive(Clone, Copy, Debug)]
pub struct ImageInfo {
    pub raw: vk::Image,
    pub ty: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
}

impl ImageInfo {
    pub fn new_2d(raw: vk::Image, format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            raw,
            ty: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
        }
    }
    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }
    pub fn array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }
}

pub struct Image {
    pub(crate) info: ImageInfo,
    pub(crate) aspect: vk::ImageAspectFlags,
    pub(crate) states: ImageStates,
}

impl Image {
    pub(crate) fn new(info: ImageInfo) -> Self {
        Self {
            aspect: infer_aspect(info.format),
            states: ImageStates::new(info.mip_levels, info.array_layers),
            info,
        }
    }
    pub fn raw(&self) -> vk::Image {
        self.info.raw
    }
    pub fn ty(&self) -> vk::ImageType {
        self.info.ty
    }
    pub fn format(&self) -> vk::Format {
        self.info.format
    }
    pub fn extent(&self) -> vk::Extent3D {
        self.info.extent
    }
    pub fn mip_levels(&self) -> u32 {
        self.info.mip_levels
    }
    pub fn array_layers(&self) -> u32 {
        self.info.array_layers
    }
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }
    pub fn states(&self) -> &ImageStates {
        &self.states
    }
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange::full(self.info.mip_levels, self.info.array_layers)
    }
    pub fn mip_extent(&self, mip_level: u32) -> vk::Extent3D {
        let extent = self.info.extent;
        vk::Extent3D {
            width: (extent.width >> mip_level).max(1),
            height: (extent.height >> mip_level).max(1),
            depth: (extent.depth >> mip_level).max(1),
        }
    }
    pub fn subresource_layers(&self, mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect,
            mip_level,
            base_array_layer: 0,
            layer_count: self.info.array_layers,
        }
    }
}

impl HasImage for Image {
    fn raw_image(&self) -> vk::Image {
        self.info.raw
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageViewInfo {
    pub raw: vk::ImageView,
    pub image: ImageHandle,
    pub ty: vk::ImageViewType,
    pub format: vk::Format,
    pub base_mip_level: u32,
    /// Zero or `vk::REMAINING_MIP_LEVELS` means every mip from `base_mip_level` on.
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    /// Zero or `vk::REMAINING_ARRAY_LAYERS` means every layer from `base_array_layer` on.
    pub array_layer_count: u32,
}

impl ImageViewInfo {
    pub fn whole(raw: vk::ImageView, image: ImageHandle, format: vk::Format) -> Self {
        Self {
            raw,
            image,
            ty: vk::ImageViewType::TYPE_2D,
            format,
            base_mip_level: 0,
            mip_level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            array_layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }
}

/// A non-owning slice of an image. Views never hold barrier state; the generational
/// `image` handle is the weak link back to the owning image's entry.
pub struct ImageView {
    pub(crate) raw: vk::ImageView,
    pub(crate) image: ImageHandle,
    pub(crate) ty: vk::ImageViewType,
    pub(crate) format: vk::Format,
    pub(crate) range: SubresourceRange,
}

impl ImageView {
    pub fn raw(&self) -> vk::ImageView {
        self.raw
    }
    pub fn image(&self) -> ImageHandle {
        self.image
    }
    pub fn ty(&self) -> vk::ImageViewType {
        self.ty
    }
    pub fn format(&self) -> vk::Format {
        self.format
    }
    pub fn range(&self) -> SubresourceRange {
        self.range
    }
}

pub trait HasImage: Send + Sync + 'static {
    fn raw_image(&self) -> vk::Image;
}

impl HasImage for vk::Image {
    fn raw_image(&self) -> vk::Image {
        *self
    }
}

impl<T: HasImage> HasImage for Arc<T> {
    fn raw_image(&self) -> vk::Image {
        let r: &T = self.as_ref();
        r.raw_image()
    }
}

pub fn infer_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}
