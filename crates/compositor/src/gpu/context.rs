use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::dpi::PhysicalSize;

/// Surface and adapter preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuOptions {
    pub power_preference: wgpu::PowerPreference,
    /// Clamped to 1..=3.
    pub frame_latency: u32,
    pub vsync: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            frame_latency: 2,
            vsync: true,
        }
    }
}

pub(crate) struct GpuContext {
    instance: wgpu::Instance,
    pub surface: wgpu::Surface<'static>,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub config: wgpu::SurfaceConfiguration,
    pub size: PhysicalSize<u32>,
    options: GpuOptions,
    /// Set from the device-lost callback of the current device.
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    /// `target` must outlive the returned context.
    pub(crate) fn new<T>(target: &T, initial_size: PhysicalSize<u32>, options: GpuOptions) -> Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let window_handle = target
            .window_handle()
            .map_err(|err| anyhow!("failed to acquire window handle: {err}"))?;
        let display_handle = target
            .display_handle()
            .map_err(|err| anyhow!("failed to acquire display handle: {err}"))?;

        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: display_handle.as_raw(),
                raw_window_handle: window_handle.as_raw(),
            })
        }
        .context("failed to create rendering surface")?;

        let adapter = request_adapter(&instance, &surface, options.power_preference)?;
        let lost = Arc::new(AtomicBool::new(false));
        let (device, queue) = request_device(&adapter, &lost)?;

        let size = PhysicalSize::new(initial_size.width.max(1), initial_size.height.max(1));
        let max_dimension = adapter.limits().max_texture_dimension_2d;
        if size.width > max_dimension || size.height > max_dimension {
            anyhow::bail!(
                "GPU max texture dimension is {max_dimension}, requested surface is {}x{}",
                size.width,
                size.height
            );
        }

        let config = surface_configuration(&surface, &adapter, size, options);
        surface.configure(&device, &config);

        Ok(Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            config,
            size,
            options,
            lost,
        })
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    pub(crate) fn surface_format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub(crate) fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }

        self.size = new_size;
        self.config.width = new_size.width;
        self.config.height = new_size.height;
        self.surface.configure(&self.device, &self.config);
    }

    pub(crate) fn reconfigure(&self) {
        self.surface.configure(&self.device, &self.config);
    }

    /// Requests a fresh adapter and device for the same surface.
    pub(crate) fn restore(&mut self) -> Result<()> {
        let adapter = request_adapter(&self.instance, &self.surface, self.options.power_preference)?;
        let lost = Arc::new(AtomicBool::new(false));
        let (device, queue) = request_device(&adapter, &lost)?;
        let config = surface_configuration(&self.surface, &adapter, self.size, self.options);
        self.surface.configure(&device, &config);

        self.adapter = adapter;
        self.device = device;
        self.queue = queue;
        self.config = config;
        self.lost = lost;
        Ok(())
    }

    /// Whether targets of `format` can be rendered to and filtered.
    pub(crate) fn supports_target(&self, format: wgpu::TextureFormat) -> bool {
        let features = self.adapter.get_texture_format_features(format);
        features.allowed_usages.contains(
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        ) && features
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE)
    }

    pub(crate) fn max_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }
}

fn request_adapter(
    instance: &wgpu::Instance,
    surface: &wgpu::Surface<'static>,
    power_preference: wgpu::PowerPreference,
) -> Result<wgpu::Adapter> {
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference,
        compatible_surface: Some(surface),
        force_fallback_adapter: false,
    }))
    .context("failed to find a suitable GPU adapter")?;

    let info = adapter.get_info();
    tracing::debug!(
        name = %info.name,
        backend = ?info.backend,
        device_type = ?info.device_type,
        "selected GPU adapter"
    );
    Ok(adapter)
}

fn request_device(adapter: &wgpu::Adapter, lost: &Arc<AtomicBool>) -> Result<(wgpu::Device, wgpu::Queue)> {
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("shaderdeck device"),
        required_features: wgpu::Features::empty(),
        required_limits: adapter.limits(),
        memory_hints: wgpu::MemoryHints::Performance,
        trace: wgpu::Trace::default(),
    }))
    .context("failed to create GPU device")?;

    let flag = Arc::clone(lost);
    device.set_device_lost_callback(move |reason, message| {
        tracing::warn!(?reason, %message, "GPU device lost");
        flag.store(true, Ordering::Release);
    });
    device.on_uncaptured_error(Box::new(|err| {
        tracing::error!(error = %err, "uncaptured GPU error");
    }));
    Ok((device, queue))
}

fn surface_configuration(
    surface: &wgpu::Surface<'static>,
    adapter: &wgpu::Adapter,
    size: PhysicalSize<u32>,
    options: GpuOptions,
) -> wgpu::SurfaceConfiguration {
    let caps = surface.get_capabilities(adapter);

    // Shaders write display-ready values, so prefer a format without sRGB encoding.
    let format = caps
        .formats
        .iter()
        .copied()
        .find(|format| !format.is_srgb())
        .or_else(|| caps.formats.first().copied())
        .unwrap_or(wgpu::TextureFormat::Bgra8Unorm);

    let fifo = wgpu::PresentMode::Fifo;
    let present_mode = if options.vsync {
        fifo
    } else {
        [wgpu::PresentMode::Immediate, wgpu::PresentMode::Mailbox]
            .into_iter()
            .find(|mode| caps.present_modes.contains(mode))
            .unwrap_or(fifo)
    };

    let desired_maximum_frame_latency = options.frame_latency.clamp(1, 3);
    if desired_maximum_frame_latency != options.frame_latency {
        tracing::warn!(
            requested = options.frame_latency,
            clamped = desired_maximum_frame_latency,
            "GPU frame latency clamped to valid range (1-3)"
        );
    }
    tracing::debug!(?format, ?present_mode, "configuring surface");

    wgpu::SurfaceConfiguration {
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        format,
        width: size.width.max(1),
        height: size.height.max(1),
        present_mode,
        alpha_mode: caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto),
        view_formats: vec![],
        desired_maximum_frame_latency,
    }
}
