//! Swapchain management.
//!
//! [`SwapchainManager`] owns the presentable image chain and its state
//! machine. Each acquire compares the requested (width, height, vsync, hdr)
//! against the chain it has; a mismatch, a missing chain or a stale flag
//! rebuilds the chain before acquiring. Per-frame presentation anomalies are
//! classified into [`FrameError`] and handled here; callers only see
//! [`FrameStatus`].

use crate::error::{FrameError, GpuError, Result, VkResultExt};
use ash::prelude::VkResult;
use ash::vk;

/// Upper bound on how long an acquire may block.
pub const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Surface properties a chain is negotiated from.
#[derive(Debug, Clone, Default)]
pub struct SurfaceInfo {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// What a chain was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainKey {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub hdr: bool,
}

/// Negotiated chain parameters.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Select the surface format.
///
/// HDR asks for 16-bit float with extended linear sRGB when offered. The
/// default is 8-bit BGRA unorm with non-linear sRGB; otherwise the first
/// listed format is used.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    hdr: bool,
) -> Option<vk::SurfaceFormatKHR> {
    let find = |format: vk::Format, color_space: vk::ColorSpaceKHR| {
        available
            .iter()
            .find(|f| f.format == format && f.color_space == color_space)
            .copied()
    };

    let hdr_format = if hdr {
        find(
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        )
    } else {
        None
    };

    hdr_format
        .or_else(|| find(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR))
        .or_else(|| available.first().copied())
}

/// Select the present mode.
///
/// With vsync: FIFO_RELAXED when supported, else FIFO. Without: MAILBOX,
/// then IMMEDIATE, then FIFO, which is always supported.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = if vsync {
        &[vk::PresentModeKHR::FIFO_RELAXED]
    } else {
        &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
    };
    preference
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
///
/// A defined current extent wins; otherwise the request is clamped into the
/// supported range.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width.max(capabilities.min_image_extent.width),
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height.max(capabilities.min_image_extent.height),
            ),
        }
    }
}

/// Two images with vsync, three without, kept inside the surface's range.
/// A `max_image_count` of zero means unbounded.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, vsync: bool) -> u32 {
    let desired = if vsync { 2 } else { 3 };
    let max = if capabilities.max_image_count == 0 {
        u32::MAX
    } else {
        capabilities.max_image_count
    };
    desired.max(capabilities.min_image_count).min(max)
}

/// Negotiate chain parameters, or `None` when the extent is zero.
pub fn negotiate(info: &SurfaceInfo, key: ChainKey) -> Result<Option<SwapchainConfig>> {
    if key.width == 0 || key.height == 0 {
        return Ok(None);
    }
    let extent = calculate_extent(&info.capabilities, key.width, key.height);
    if extent.width == 0 || extent.height == 0 {
        return Ok(None);
    }
    let format = select_surface_format(&info.formats, key.hdr)
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".into()))?;

    Ok(Some(SwapchainConfig {
        format,
        present_mode: select_present_mode(&info.present_modes, key.vsync),
        extent,
        image_count: choose_image_count(&info.capabilities, key.vsync),
        pre_transform: info.capabilities.current_transform,
    }))
}

/// Presentation operations the manager drives.
pub trait SwapchainBackend {
    type Chain;

    /// Query the surface.
    fn surface_info(&mut self) -> VkResult<SurfaceInfo>;

    /// Build a chain, passing the current one as the old-swapchain hint.
    fn create_chain(
        &mut self,
        config: &SwapchainConfig,
        old: Option<&Self::Chain>,
    ) -> VkResult<Self::Chain>;

    /// Destroy a chain and its image views.
    fn destroy_chain(&mut self, chain: Self::Chain);

    /// Acquire the next image; `Ok((index, suboptimal))`.
    fn acquire(
        &mut self,
        chain: &Self::Chain,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)>;

    /// Queue an image for presentation; `Ok(suboptimal)`.
    fn present(
        &mut self,
        chain: &Self::Chain,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> VkResult<bool>;
}

/// Observable state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    NoSwapchain,
    Valid,
    /// The chain works but must be rebuilt before the next acquire.
    Stale,
}

/// Why no image was acquired this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ZeroExtent,
    OutOfDate,
    SurfaceLost,
    NotReady,
    Timeout,
}

/// Result of [`SwapchainManager::acquire_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ready { image_index: u32, suboptimal: bool },
    Skipped(SkipReason),
}

/// Outcome of one rebuild attempt.
enum Rebuild {
    Built,
    ZeroExtent,
    /// The surface refused; try again next frame.
    Deferred(FrameError),
}

/// Owns the chain and its recreation.
pub struct SwapchainManager<B: SwapchainBackend> {
    backend: B,
    chain: Option<B::Chain>,
    config: Option<SwapchainConfig>,
    key: Option<ChainKey>,
    stale: bool,
    generation: u64,
}

impl<B: SwapchainBackend> SwapchainManager<B> {
    /// Create a manager with no chain; the first acquire builds one.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            chain: None,
            config: None,
            key: None,
            stale: false,
            generation: 0,
        }
    }

    pub fn state(&self) -> SwapchainState {
        match (&self.chain, self.stale) {
            (None, _) => SwapchainState::NoSwapchain,
            (Some(_), true) => SwapchainState::Stale,
            (Some(_), false) => SwapchainState::Valid,
        }
    }

    /// Current chain.
    pub fn chain(&self) -> Option<&B::Chain> {
        self.chain.as_ref()
    }

    /// Parameters of the current chain.
    pub fn config(&self) -> Option<&SwapchainConfig> {
        self.config.as_ref()
    }

    /// Incremented on every successful recreation.
    ///
    /// Per-image resources (render-finished semaphores, framebuffers) are
    /// rebuilt when this changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Force a rebuild on the next acquire.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    fn needs_recreate(&self, key: ChainKey) -> bool {
        self.chain.is_none() || self.stale || self.key != Some(key)
    }

    /// Rebuild the chain for `key`. A zero extent leaves no chain at all.
    fn recreate(&mut self, key: ChainKey) -> Result<Rebuild> {
        let info = match self.backend.surface_info() {
            Ok(info) => info,
            Err(result) => {
                return self.rebuild_refused(result, "vkGetPhysicalDeviceSurfaceCapabilitiesKHR");
            }
        };
        let Some(config) = negotiate(&info, key)? else {
            if let Some(old) = self.chain.take() {
                tracing::debug!("Surface has zero extent; dropping swapchain");
                self.backend.destroy_chain(old);
            }
            self.config = None;
            self.key = Some(key);
            self.stale = false;
            return Ok(Rebuild::ZeroExtent);
        };

        let new = match self.backend.create_chain(&config, self.chain.as_ref()) {
            Ok(chain) => chain,
            Err(result) => return self.rebuild_refused(result, "vkCreateSwapchainKHR"),
        };
        if let Some(old) = self.chain.replace(new) {
            self.backend.destroy_chain(old);
        }

        self.generation += 1;
        tracing::info!(
            width = config.extent.width,
            height = config.extent.height,
            format = ?config.format.format,
            color_space = ?config.format.color_space,
            present_mode = ?config.present_mode,
            images = config.image_count,
            generation = self.generation,
            "Swapchain created"
        );

        self.config = Some(config);
        self.key = Some(key);
        self.stale = false;
        Ok(Rebuild::Built)
    }

    /// A lost or out-of-date surface postpones the rebuild; anything else is
    /// fatal. The current chain, if any, is kept and marked stale.
    fn rebuild_refused(&mut self, result: vk::Result, operation: &'static str) -> Result<Rebuild> {
        match result {
            vk::Result::ERROR_SURFACE_LOST_KHR | vk::Result::ERROR_OUT_OF_DATE_KHR => {
                tracing::debug!("{operation} reported {result}; rebuild postponed");
                self.stale = true;
                FrameError::classify(result, operation).map(Rebuild::Deferred)
            }
            result if operation == "vkCreateSwapchainKHR" => {
                Err(GpuError::SwapchainCreation(result.to_string()))
            }
            result => Err(GpuError::Call { operation, result }),
        }
    }

    /// Rebuild for `key`; `Some` carries the status of a frame that cannot
    /// go ahead.
    fn rebuild(&mut self, key: ChainKey) -> Result<Option<FrameStatus>> {
        Ok(match self.recreate(key)? {
            Rebuild::Built => None,
            Rebuild::ZeroExtent => Some(FrameStatus::Skipped(SkipReason::ZeroExtent)),
            Rebuild::Deferred(error) => Some(self.skip(error)),
        })
    }

    /// Acquire the next image, rebuilding the chain first when needed.
    ///
    /// An out-of-date chain is rebuilt and the acquire retried once.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire_image(
        &mut self,
        width: u32,
        height: u32,
        vsync: bool,
        hdr: bool,
        semaphore: vk::Semaphore,
    ) -> Result<FrameStatus> {
        let key = ChainKey {
            width,
            height,
            vsync,
            hdr,
        };
        if self.needs_recreate(key) {
            if let Some(status) = self.rebuild(key)? {
                return Ok(status);
            }
        }

        match self.try_acquire(semaphore)? {
            Err(FrameError::OutOfDate) => {
                tracing::debug!("Swapchain out of date on acquire; recreating");
                if let Some(status) = self.rebuild(key)? {
                    return Ok(status);
                }
                match self.try_acquire(semaphore)? {
                    Ok(status) => Ok(status),
                    Err(error) => Ok(self.skip(error)),
                }
            }
            Err(error) => Ok(self.skip(error)),
            Ok(status) => Ok(status),
        }
    }

    fn try_acquire(
        &mut self,
        semaphore: vk::Semaphore,
    ) -> Result<std::result::Result<FrameStatus, FrameError>> {
        let chain = self
            .chain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("acquire without a swapchain".into()))?;
        match self.backend.acquire(chain, semaphore, ACQUIRE_TIMEOUT_NS) {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    self.stale = true;
                }
                Ok(Ok(FrameStatus::Ready {
                    image_index,
                    suboptimal,
                }))
            }
            Err(result) => FrameError::classify(result, "vkAcquireNextImageKHR").map(Err),
        }
    }

    fn skip(&mut self, error: FrameError) -> FrameStatus {
        let reason = match error {
            FrameError::Suboptimal | FrameError::OutOfDate => {
                self.stale = true;
                SkipReason::OutOfDate
            }
            FrameError::SurfaceLost => {
                tracing::warn!("Surface lost; swapchain will be rebuilt");
                self.stale = true;
                SkipReason::SurfaceLost
            }
            FrameError::NotReady => SkipReason::NotReady,
            FrameError::Timeout => SkipReason::Timeout,
        };
        FrameStatus::Skipped(reason)
    }

    /// Present an acquired image.
    ///
    /// Suboptimal, out-of-date and lost surfaces only mark the chain stale.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> Result<()> {
        let chain = self
            .chain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("present without a swapchain".into()))?;
        match self.backend.present(chain, image_index, wait) {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.stale = true;
                Ok(())
            }
            Err(result) => match FrameError::classify(result, "vkQueuePresentKHR")? {
                FrameError::Suboptimal | FrameError::OutOfDate | FrameError::SurfaceLost => {
                    tracing::debug!("Present reported {result}; marking swapchain stale");
                    self.stale = true;
                    Ok(())
                }
                FrameError::NotReady | FrameError::Timeout => Err(result).op("vkQueuePresentKHR"),
            },
        }
    }

    /// Destroy the chain, keeping the backend.
    pub fn destroy_chain(&mut self) {
        if let Some(chain) = self.chain.take() {
            self.backend.destroy_chain(chain);
        }
        self.config = None;
        self.key = None;
    }
}

impl<B: SwapchainBackend> Drop for SwapchainManager<B> {
    fn drop(&mut self) {
        self.destroy_chain();
    }
}

/// Vulkan swapchain with its images and views.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain and one view per image.
    ///
    /// Partially created state is destroyed before the raw error returns.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        config: &SwapchainConfig,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> VkResult<Self> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(config.image_count)
            .image_format(config.format.format)
            .image_color_space(config.format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let swapchain = swapchain_loader.create_swapchain(&create_info, None)?;

        let images = match swapchain_loader.get_swapchain_images(swapchain) {
            Ok(images) => images,
            Err(result) => {
                swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(result);
            }
        };

        let mut this = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::with_capacity(images.len()),
            format: config.format.format,
            extent: config.extent,
        };

        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(config.format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            match device.create_image_view(&view_info, None) {
                Ok(view) => this.image_views.push(view),
                Err(result) => {
                    this.destroy(device, swapchain_loader);
                    return Err(result);
                }
            }
        }
        this.images = images;

        Ok(this)
    }

    /// Number of images in the chain.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPresenter, PresenterEvent};

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn hdr_format_only_when_requested_and_available() {
        let hdr = surface_format(
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        );
        let sdr = surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let other = surface_format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);

        let available = [other, hdr, sdr];
        assert_eq!(select_surface_format(&available, true).map(|f| f.format), Some(hdr.format));
        assert_eq!(select_surface_format(&available, false).map(|f| f.format), Some(sdr.format));
        assert_eq!(select_surface_format(&[other, sdr], true).map(|f| f.format), Some(sdr.format));
        assert_eq!(select_surface_format(&[other], false).map(|f| f.format), Some(other.format));
        assert!(select_surface_format(&[], false).is_none());
    }

    #[test]
    fn present_mode_preferences() {
        use vk::PresentModeKHR as M;
        let all = [M::IMMEDIATE, M::MAILBOX, M::FIFO, M::FIFO_RELAXED];
        assert_eq!(select_present_mode(&all, true), M::FIFO_RELAXED);
        assert_eq!(select_present_mode(&[M::FIFO, M::MAILBOX], true), M::FIFO);
        assert_eq!(select_present_mode(&all, false), M::MAILBOX);
        assert_eq!(select_present_mode(&[M::FIFO, M::IMMEDIATE], false), M::IMMEDIATE);
        assert_eq!(select_present_mode(&[M::FIFO], false), M::FIFO);
    }

    #[test]
    fn image_count_respects_surface_range() {
        assert_eq!(choose_image_count(&caps(1, 0), true), 2);
        assert_eq!(choose_image_count(&caps(1, 0), false), 3);
        assert_eq!(choose_image_count(&caps(2, 2), false), 2);
        assert_eq!(choose_image_count(&caps(3, 8), true), 3);
        assert_eq!(choose_image_count(&caps(4, 0), false), 4);
    }

    #[test]
    fn extent_is_clamped() {
        let extent = calculate_extent(&caps(1, 0), 10_000, 0);
        assert_eq!((extent.width, extent.height), (4096, 1));

        let mut fixed = caps(1, 0);
        fixed.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = calculate_extent(&fixed, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn identical_acquires_do_not_recreate() {
        let mut manager = SwapchainManager::new(MockPresenter::new());
        let sem = vk::Semaphore::null();
        assert!(matches!(
            manager.acquire_image(800, 600, true, false, sem).unwrap(),
            FrameStatus::Ready { .. }
        ));
        manager.present(0, &[]).unwrap();
        manager.acquire_image(800, 600, true, false, sem).unwrap();
        manager.acquire_image(800, 600, true, false, sem).unwrap();

        assert_eq!(manager.backend().created(), 1);
        assert_eq!(manager.generation(), 1);
        assert_eq!(manager.state(), SwapchainState::Valid);
    }

    #[test]
    fn size_change_recreates_once_and_destroys_old_views_once() {
        let mut manager = SwapchainManager::new(MockPresenter::new());
        let sem = vk::Semaphore::null();
        manager.acquire_image(800, 600, false, false, sem).unwrap();
        let first = manager.chain().unwrap().id;

        manager.acquire_image(1024, 768, false, false, sem).unwrap();
        manager.acquire_image(1024, 768, false, false, sem).unwrap();

        let backend = manager.backend();
        assert_eq!(backend.created(), 2);
        assert_eq!(backend.destroyed_views(first), 1);
        // The new chain was created with the old one as hint, then the old
        // one was destroyed.
        let events = backend.events();
        let create = events
            .iter()
            .position(|e| matches!(e, PresenterEvent::Create { old: Some(old), .. } if *old == first))
            .unwrap();
        let destroy = events
            .iter()
            .position(|e| *e == PresenterEvent::Destroy(first))
            .unwrap();
        assert!(create < destroy);
        assert_eq!(manager.config().unwrap().extent.width, 1024);
    }

    #[test]
    fn vsync_or_hdr_toggle_recreates() {
        let mut manager = SwapchainManager::new(MockPresenter::new());
        let sem = vk::Semaphore::null();
        manager.acquire_image(640, 480, false, false, sem).unwrap();
        manager.acquire_image(640, 480, true, false, sem).unwrap();
        assert_eq!(
            manager.config().unwrap().present_mode,
            vk::PresentModeKHR::FIFO_RELAXED
        );
        manager.acquire_image(640, 480, true, true, sem).unwrap();
        assert_eq!(
            manager.config().unwrap().format.format,
            vk::Format::R16G16B16A16_SFLOAT
        );
        assert_eq!(manager.backend().created(), 3);
    }

    #[test]
    fn out_of_date_acquire_recreates_and_retries() {
        let mut presenter = MockPresenter::new();
        presenter.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let mut manager = SwapchainManager::new(presenter);

        let status = manager
            .acquire_image(800, 600, true, false, vk::Semaphore::null())
            .unwrap();

        assert!(matches!(status, FrameStatus::Ready { .. }));
        assert_eq!(manager.backend().created(), 2);
        assert_eq!(manager.generation(), 2);
        assert_eq!(manager.state(), SwapchainState::Valid);
    }

    #[test]
    fn out_of_date_twice_skips_without_error() {
        let mut presenter = MockPresenter::new();
        presenter.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        presenter.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let mut manager = SwapchainManager::new(presenter);

        let status = manager
            .acquire_image(800, 600, true, false, vk::Semaphore::null())
            .unwrap();
        assert_eq!(status, FrameStatus::Skipped(SkipReason::OutOfDate));
        assert_eq!(manager.state(), SwapchainState::Stale);
    }

    #[test]
    fn zero_extent_skips_and_drops_chain() {
        let mut manager = SwapchainManager::new(MockPresenter::new());
        let sem = vk::Semaphore::null();
        manager.acquire_image(800, 600, true, false, sem).unwrap();
        let first = manager.chain().unwrap().id;

        let status = manager.acquire_image(0, 600, true, false, sem).unwrap();
        assert_eq!(status, FrameStatus::Skipped(SkipReason::ZeroExtent));
        assert_eq!(manager.state(), SwapchainState::NoSwapchain);
        assert_eq!(manager.backend().destroyed_views(first), 1);

        assert!(matches!(
            manager.acquire_image(800, 600, true, false, sem).unwrap(),
            FrameStatus::Ready { .. }
        ));
    }

    #[test]
    fn suboptimal_acquire_is_presentable_and_marks_stale() {
        let mut presenter = MockPresenter::new();
        presenter.script_acquire(Ok((1, true)));
        let mut manager = SwapchainManager::new(presenter);
        let sem = vk::Semaphore::null();

        let status = manager.acquire_image(800, 600, true, false, sem).unwrap();
        assert_eq!(
            status,
            FrameStatus::Ready {
                image_index: 1,
                suboptimal: true
            }
        );
        assert_eq!(manager.state(), SwapchainState::Stale);
        manager.present(1, &[]).unwrap();

        manager.acquire_image(800, 600, true, false, sem).unwrap();
        assert_eq!(manager.backend().created(), 2);
    }

    #[test]
    fn transient_acquire_results_skip() {
        let mut presenter = MockPresenter::new();
        presenter.script_acquire(Err(vk::Result::NOT_READY));
        presenter.script_acquire(Err(vk::Result::TIMEOUT));
        presenter.script_acquire(Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        let mut manager = SwapchainManager::new(presenter);
        let sem = vk::Semaphore::null();

        let mut next = || manager.acquire_image(800, 600, true, false, sem).unwrap();
        assert_eq!(next(), FrameStatus::Skipped(SkipReason::NotReady));
        assert_eq!(next(), FrameStatus::Skipped(SkipReason::Timeout));
        assert_eq!(next(), FrameStatus::Skipped(SkipReason::SurfaceLost));
        assert_eq!(manager.state(), SwapchainState::Stale);
    }

    #[test]
    fn lost_surface_skips_frames_until_it_comes_back() {
        let mut manager = SwapchainManager::new(MockPresenter::new());
        let sem = vk::Semaphore::null();
        manager.acquire_image(800, 600, true, false, sem).unwrap();

        let presenter = manager.backend_mut();
        presenter.script_acquire(Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        presenter.script_surface_failure(vk::Result::ERROR_SURFACE_LOST_KHR);
        presenter.script_create_failure(vk::Result::ERROR_SURFACE_LOST_KHR);

        // Acquire, then the surface query, then chain creation all report a
        // lost surface; every frame is skipped and the old chain survives.
        for _ in 0..3 {
            assert_eq!(
                manager.acquire_image(800, 600, true, false, sem).unwrap(),
                FrameStatus::Skipped(SkipReason::SurfaceLost)
            );
            assert_eq!(manager.state(), SwapchainState::Stale);
        }
        assert_eq!(manager.backend().created(), 1);
        assert_eq!(manager.generation(), 1);

        assert!(matches!(
            manager.acquire_image(800, 600, true, false, sem).unwrap(),
            FrameStatus::Ready { .. }
        ));
        assert_eq!(manager.backend().created(), 2);
        assert_eq!(manager.state(), SwapchainState::Valid);
    }

    #[test]
    fn out_of_date_surface_query_postpones_first_chain() {
        let mut presenter = MockPresenter::new();
        presenter.script_surface_failure(vk::Result::ERROR_OUT_OF_DATE_KHR);
        let mut manager = SwapchainManager::new(presenter);
        let sem = vk::Semaphore::null();

        assert_eq!(
            manager.acquire_image(800, 600, true, false, sem).unwrap(),
            FrameStatus::Skipped(SkipReason::OutOfDate)
        );
        assert_eq!(manager.state(), SwapchainState::NoSwapchain);
        assert!(matches!(
            manager.acquire_image(800, 600, true, false, sem).unwrap(),
            FrameStatus::Ready { .. }
        ));
    }

    #[test]
    fn other_rebuild_failures_are_fatal() {
        let mut presenter = MockPresenter::new();
        presenter.script_create_failure(vk::Result::ERROR_INITIALIZATION_FAILED);
        presenter.script_surface_failure(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let mut manager = SwapchainManager::new(presenter);
        let sem = vk::Semaphore::null();

        assert!(matches!(
            manager.acquire_image(800, 600, true, false, sem),
            Err(GpuError::Call {
                result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                ..
            })
        ));
        assert!(matches!(
            manager.acquire_image(800, 600, true, false, sem),
            Err(GpuError::SwapchainCreation(_))
        ));
    }

    #[test]
    fn fatal_acquire_results_propagate() {
        let mut presenter = MockPresenter::new();
        presenter.script_acquire(Err(vk::Result::ERROR_DEVICE_LOST));
        let mut manager = SwapchainManager::new(presenter);
        let result = manager.acquire_image(800, 600, true, false, vk::Semaphore::null());
        assert!(matches!(
            result,
            Err(GpuError::Call {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            })
        ));
    }

    #[test]
    fn present_marks_stale_on_recoverable_results() {
        let mut presenter = MockPresenter::new();
        presenter.script_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        presenter.script_present(Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        let mut manager = SwapchainManager::new(presenter);
        manager
            .acquire_image(800, 600, true, false, vk::Semaphore::null())
            .unwrap();

        manager.present(0, &[]).unwrap();
        assert_eq!(manager.state(), SwapchainState::Stale);
        assert!(manager.present(0, &[]).is_err());
    }

    #[test]
    fn dropping_manager_destroys_chain() {
        let mut manager = SwapchainManager::new(MockPresenter::new());
        manager
            .acquire_image(800, 600, true, false, vk::Semaphore::null())
            .unwrap();
        let log = manager.backend().log();
        drop(manager);
        assert_eq!(log.borrow().destroyed, 1);
    }
}
