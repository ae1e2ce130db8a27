use std::borrow::Cow;
use std::collections::HashMap;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use wgpu::naga;
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalSize;

use crate::device::{
    DeviceError, GpuDevice, LoadAction, ProgramId, RenderOutput, ShaderStage, StageId, TargetFormat, TargetId,
    TextureId, Uniform, UniformLocation,
};

use super::context::{GpuContext, GpuOptions};
use super::reflect::{self, MemberKind, Reflection};

struct Stage {
    stage: ShaderStage,
    source: String,
    module: naga::Module,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Member { offset: usize, kind: MemberKind },
    Texture { index: usize },
}

struct Program {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    layout: wgpu::PipelineLayout,
    texture_layout: wgpu::BindGroupLayout,
    uniform_bind_group: wgpu::BindGroup,
    uniform_buffer: wgpu::Buffer,
    reflection: Reflection,
    /// CPU copy of the uniform block, staged into `uniform_buffer` per draw.
    data: Vec<u8>,
    textures: Vec<Option<TextureId>>,
    slots: HashMap<String, UniformLocation>,
    locations: Vec<Slot>,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

struct Texture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
}

struct Frame {
    encoder: wgpu::CommandEncoder,
    surface: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
}

/// [`GpuDevice`] backed by a wgpu device presenting to a window surface.
pub struct WgpuDevice {
    context: GpuContext,
    next_handle: u32,
    stages: HashMap<StageId, Stage>,
    programs: HashMap<ProgramId, Program>,
    targets: HashMap<TargetId, TextureId>,
    textures: HashMap<TextureId, Texture>,
    sampler: wgpu::Sampler,
    neutral: wgpu::TextureView,
    frame: Option<Frame>,
}

impl WgpuDevice {
    /// Opens a device presenting to `target`, which must outlive it.
    pub fn new<T>(target: &T, size: PhysicalSize<u32>, options: GpuOptions) -> Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let context = GpuContext::new(target, size, options)?;
        let sampler = create_sampler(&context.device);
        let neutral = create_neutral(&context.device, &context.queue);
        Ok(Self {
            context,
            next_handle: 0,
            stages: HashMap::new(),
            programs: HashMap::new(),
            targets: HashMap::new(),
            textures: HashMap::new(),
            sampler,
            neutral,
            frame: None,
        })
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.context.size
    }

    pub fn resize(&mut self, size: PhysicalSize<u32>) {
        self.context.resize(size);
    }

    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn texture_format(format: TargetFormat) -> wgpu::TextureFormat {
        match format {
            TargetFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TargetFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        }
    }

    fn allocate(&self, width: u32, height: u32, format: wgpu::TextureFormat, label: &str) -> Texture {
        let texture = self.context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Texture {
            texture,
            view,
            format,
            width,
            height,
        }
    }

    fn clear_resources(&mut self) {
        self.frame = None;
        self.stages.clear();
        self.programs.clear();
        self.targets.clear();
        self.textures.clear();
    }

    fn frame(&mut self) -> &mut Frame {
        let device = &self.context.device;
        self.frame.get_or_insert_with(|| Frame {
            encoder: device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("offscreen encoder"),
            }),
            surface: None,
        })
    }

    fn pipeline(&mut self, program: ProgramId, format: wgpu::TextureFormat) -> Option<wgpu::RenderPipeline> {
        let device = &self.context.device;
        let state = self.programs.get_mut(&program)?;
        let pipeline = state
            .pipelines
            .entry(format)
            .or_insert_with(|| create_pipeline(device, &state.layout, &state.vertex, &state.fragment, format));
        Some(pipeline.clone())
    }
}

fn create_sampler(device: &wgpu::Device) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("layer sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

/// 1x1 transparent texture bound wherever a texture uniform is unset.
fn create_neutral(device: &wgpu::Device, queue: &wgpu::Queue) -> wgpu::TextureView {
    let texture = device.create_texture_with_data(
        queue,
        &wgpu::TextureDescriptor {
            label: Some("neutral texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        },
        wgpu::util::TextureDataOrder::LayerMajor,
        &[0, 0, 0, 0],
    );
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("layer pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}

fn shader_module(device: &wgpu::Device, stage: &Stage) -> wgpu::ShaderModule {
    let (label, naga_stage) = match stage.stage {
        ShaderStage::Vertex => ("layer vertex", naga::ShaderStage::Vertex),
        ShaderStage::Fragment => ("layer fragment", naga::ShaderStage::Fragment),
    };
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(stage.source.clone()),
            stage: naga_stage,
            defines: &[],
        },
    })
}

fn texture_layout_entries(reflection: &Reflection) -> Vec<wgpu::BindGroupLayoutEntry> {
    let samplers = reflection.samplers.iter().map(|&binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    });
    let textures = reflection.textures.iter().map(|slot| wgpu::BindGroupLayoutEntry {
        binding: slot.binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    });
    samplers.chain(textures).collect()
}

fn write_member(data: &mut [u8], offset: usize, kind: MemberKind, value: Uniform) {
    let mut floats = [0f32; 4];
    let count = match (kind, value) {
        (MemberKind::Int, Uniform::Int(v)) => {
            if let Some(dst) = data.get_mut(offset..offset + 4) {
                dst.copy_from_slice(&v.to_ne_bytes());
            }
            return;
        }
        (MemberKind::Int, Uniform::Float(v)) => {
            if let Some(dst) = data.get_mut(offset..offset + 4) {
                dst.copy_from_slice(&(v.round() as i32).to_ne_bytes());
            }
            return;
        }
        (MemberKind::Float, Uniform::Float(v)) => {
            floats[0] = v;
            1
        }
        (MemberKind::Float, Uniform::Int(v)) => {
            floats[0] = v as f32;
            1
        }
        (MemberKind::Vec2, Uniform::Vec2(v)) => {
            floats[..2].copy_from_slice(&v);
            2
        }
        (MemberKind::Vec3, Uniform::Vec3(v)) => {
            floats[..3].copy_from_slice(&v);
            3
        }
        (MemberKind::Vec4, Uniform::Vec4(v)) => {
            floats = v;
            4
        }
        _ => {
            tracing::trace!(?kind, ?value, "uniform type mismatch ignored");
            return;
        }
    };
    let bytes: &[u8] = bytemuck::cast_slice(&floats[..count]);
    if let Some(dst) = data.get_mut(offset..offset + bytes.len()) {
        dst.copy_from_slice(bytes);
    }
}

fn to_color(rgba: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: f64::from(rgba[0]),
        g: f64::from(rgba[1]),
        b: f64::from(rgba[2]),
        a: f64::from(rgba[3]),
    }
}

impl GpuDevice for WgpuDevice {
    fn compile_stage(&mut self, stage: ShaderStage, source: &str) -> Result<StageId, String> {
        if self.context.is_lost() {
            return Err("ERROR: 0:0: GPU device lost".into());
        }
        let module = reflect::parse(stage, source)?;
        let id = StageId::new(self.handle());
        self.stages.insert(
            id,
            Stage {
                stage,
                source: source.to_owned(),
                module,
            },
        );
        Ok(id)
    }

    fn link_program(&mut self, vertex: StageId, fragment: StageId) -> Result<ProgramId, String> {
        let (Some(vertex), Some(fragment)) = (self.stages.get(&vertex), self.stages.get(&fragment)) else {
            return Err("invalid stage handle".into());
        };
        if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
            return Err("stages attached in the wrong order".into());
        }
        let reflection = reflect::reflect(&fragment.module);
        let device = &self.context.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let vertex_module = shader_module(device, vertex);
        let fragment_module = shader_module(device, fragment);

        let block_size = u64::from(reflection.block_size.max(16));
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("texture layout"),
            entries: &texture_layout_entries(&reflection),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("layer pipeline layout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("uniform buffer"),
            size: block_size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("uniform bind group"),
            layout: &uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });
        let probe_format = wgpu::TextureFormat::Rgba8Unorm;
        let pipeline = create_pipeline(device, &layout, &vertex_module, &fragment_module, probe_format);
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(format!("ERROR: 0:0: {error}"));
        }

        let mut locations = Vec::new();
        let mut slots = HashMap::new();
        for member in &reflection.members {
            slots.insert(member.name.clone(), UniformLocation::new(locations.len() as u32));
            locations.push(Slot::Member {
                offset: member.offset as usize,
                kind: member.kind,
            });
        }
        for (index, slot) in reflection.textures.iter().enumerate() {
            slots.insert(slot.name.clone(), UniformLocation::new(locations.len() as u32));
            locations.push(Slot::Texture { index });
        }

        let id = ProgramId::new(self.handle());
        let program = Program {
            vertex: vertex_module,
            fragment: fragment_module,
            layout,
            texture_layout,
            uniform_bind_group,
            uniform_buffer,
            data: vec![0; block_size as usize],
            textures: vec![None; reflection.textures.len()],
            slots,
            locations,
            pipelines: HashMap::from([(probe_format, pipeline)]),
            reflection,
        };
        tracing::debug!(
            program = id.raw(),
            members = program.reflection.members.len(),
            textures = program.reflection.textures.len(),
            "linked program"
        );
        self.programs.insert(id, program);
        Ok(id)
    }

    fn release_stage(&mut self, stage: StageId) {
        self.stages.remove(&stage);
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        self.programs.get(&program)?.slots.get(name).copied()
    }

    fn set_uniform(&mut self, program: ProgramId, location: UniformLocation, value: Uniform) {
        let Some(program) = self.programs.get_mut(&program) else {
            return;
        };
        match (program.locations.get(location.raw() as usize), value) {
            (Some(Slot::Texture { index }), Uniform::Texture(texture)) => {
                program.textures[*index] = texture;
            }
            (Some(Slot::Member { offset, kind }), value) => write_member(&mut program.data, *offset, *kind, value),
            _ => {}
        }
    }

    fn create_target(&mut self, width: u32, height: u32, format: TargetFormat) -> Result<TargetId, DeviceError> {
        if self.context.is_lost() {
            return Err(DeviceError::Lost);
        }
        let texture_format = Self::texture_format(format);
        let max = self.context.max_dimension();
        if width == 0 || height == 0 || width > max || height > max || !self.context.supports_target(texture_format)
        {
            return Err(DeviceError::Incomplete { width, height, format });
        }
        let texture = self.allocate(width, height, texture_format, "render target");
        let texture_id = TextureId::new(self.handle());
        self.textures.insert(texture_id, texture);
        let id = TargetId::new(self.handle());
        self.targets.insert(id, texture_id);
        Ok(id)
    }

    fn destroy_target(&mut self, target: TargetId) {
        if let Some(texture) = self.targets.remove(&target) {
            self.textures.remove(&texture);
        }
    }

    fn target_texture(&self, target: TargetId) -> Option<TextureId> {
        self.targets.get(&target).copied()
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, DeviceError> {
        if self.context.is_lost() {
            return Err(DeviceError::Lost);
        }
        let max = self.context.max_dimension();
        let (width, height) = (width.clamp(1, max), height.clamp(1, max));
        let texture = self.allocate(width, height, wgpu::TextureFormat::Rgba8Unorm, "media texture");
        let id = TextureId::new(self.handle());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn upload_texture(&mut self, texture: TextureId, width: u32, height: u32, rgba: &[u8]) {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || rgba.len() < expected {
            tracing::warn!(
                texture = texture.raw(),
                width,
                height,
                bytes = rgba.len(),
                "ignoring texture upload with mismatched size"
            );
            return;
        }
        let Some(current) = self.textures.get(&texture) else {
            return;
        };
        if current.width != width || current.height != height {
            let resized = self.allocate(width, height, current.format, "media texture");
            self.textures.insert(texture, resized);
        }
        let Some(entry) = self.textures.get(&texture) else {
            return;
        };
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &rgba[..expected],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn begin_frame(&mut self) -> Result<(), DeviceError> {
        if self.context.is_lost() {
            return Err(DeviceError::Lost);
        }
        let surface = match self.context.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.context.reconfigure();
                return Err(DeviceError::Surface("surface lost or outdated; reconfigured".into()));
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                self.context.mark_lost();
                return Err(DeviceError::Lost);
            }
            Err(err) => return Err(DeviceError::Surface(err.to_string())),
        };
        let view = surface.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });
        self.frame = Some(Frame {
            encoder,
            surface: Some((surface, view)),
        });
        Ok(())
    }

    fn draw(&mut self, program: ProgramId, output: RenderOutput, load: LoadAction) {
        if self.context.is_lost() {
            return;
        }
        let (output_texture, format) = match output {
            RenderOutput::Target(target) => {
                let Some(texture) = self.targets.get(&target).copied() else {
                    return;
                };
                let Some(entry) = self.textures.get(&texture) else {
                    return;
                };
                (Some(texture), entry.format)
            }
            RenderOutput::Surface => (None, self.context.surface_format()),
        };
        let Some(pipeline) = self.pipeline(program, format) else {
            return;
        };
        let Some(state) = self.programs.get(&program) else {
            return;
        };

        let mut entries = Vec::with_capacity(state.reflection.samplers.len() + state.textures.len());
        for &binding in &state.reflection.samplers {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            });
        }
        for (slot, texture) in state.reflection.textures.iter().zip(&state.textures) {
            // A target cannot be sampled while it is being written.
            let view = texture
                .filter(|id| Some(*id) != output_texture)
                .and_then(|id| self.textures.get(&id))
                .map_or(&self.neutral, |entry| &entry.view);
            entries.push(wgpu::BindGroupEntry {
                binding: slot.binding,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        let device = &self.context.device;
        let texture_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("texture bind group"),
            layout: &state.texture_layout,
            entries: &entries,
        });

        // Staged through the encoder so every draw sees its own values.
        let staging = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("uniform staging"),
            contents: &state.data,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        let uniform_buffer = state.uniform_buffer.clone();
        let uniform_bind_group = state.uniform_bind_group.clone();
        let size = state.data.len() as u64;
        let target_view = output_texture
            .and_then(|id| self.textures.get(&id))
            .map(|entry| entry.view.clone());

        let frame = self.frame();
        let view = match (&target_view, &frame.surface) {
            (Some(view), _) => view.clone(),
            (None, Some((_, view))) => view.clone(),
            (None, None) => return,
        };
        frame
            .encoder
            .copy_buffer_to_buffer(&staging, 0, &uniform_buffer, 0, size);

        let load = match load {
            LoadAction::Clear(rgba) => wgpu::LoadOp::Clear(to_color(rgba)),
            LoadAction::Load => wgpu::LoadOp::Load,
        };
        let mut render_pass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("layer pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        render_pass.set_pipeline(&pipeline);
        render_pass.set_bind_group(0, &uniform_bind_group, &[]);
        render_pass.set_bind_group(1, &texture_bind_group, &[]);
        render_pass.draw(0..3, 0..1);
    }

    fn end_frame(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        if self.context.is_lost() {
            return;
        }
        self.context.queue.submit(std::iter::once(frame.encoder.finish()));
        if let Some((surface, _)) = frame.surface {
            surface.present();
        }
    }

    fn is_lost(&self) -> bool {
        self.context.is_lost()
    }

    fn try_restore(&mut self) -> Result<bool, DeviceError> {
        if !self.context.is_lost() {
            return Ok(true);
        }
        self.clear_resources();
        if let Err(err) = self.context.restore() {
            tracing::warn!(error = %err, "GPU device not yet restorable");
            return Ok(false);
        }
        self.sampler = create_sampler(&self.context.device);
        self.neutral = create_neutral(&self.context.device, &self.context.queue);
        tracing::info!("GPU device restored");
        Ok(true)
    }
}
