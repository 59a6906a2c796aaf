//! `wgpu` implementation of the GPU seam.
//!
//! The renderer draws into an `Rgba8Unorm` texture. A compute pass packs the
//! capture source (the frame, or the blended frame when motion blur is on)
//! into a storage buffer in the session's capture layout, bottom row first.
//! Each readback copies that buffer into the slot's mappable buffer and maps
//! it asynchronously; the fence is the submission index plus the map state.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use super::{GpuBackend, ReadbackBuffer, SessionGeometry};
use crate::error::{PipelineError, PipelineResult};
use crate::format::PixelLayout;

/// Format of the render target and the blend ring.
pub const FRAME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const PACK_WORKGROUP: u32 = 256;
const BLEND_WORKGROUP: u32 = 8;
const MAX_GROUPS_PER_DIM: u32 = 65535;

const MAP_IDLE: u8 = 0;
const MAP_PENDING: u8 = 1;
const MAP_READY: u8 = 2;
const MAP_FAILED: u8 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PackParams {
    width: u32,
    height: u32,
    pixel_layout: u32,
    total: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlendParams {
    count: u32,
    head: u32,
    capacity: u32,
    padding: u32,
}

/// Layout selector understood by the pack shader.
fn layout_code(layout: PixelLayout) -> PipelineResult<u32> {
    match layout {
        PixelLayout::Rgb24 => Ok(0),
        PixelLayout::I420 => Ok(1),
        PixelLayout::I444 => Ok(2),
        other => Err(PipelineError::UnsupportedConversion {
            from: "rgba8".to_string(),
            to: other.to_string(),
        }),
    }
}

/// Buffer copies must be a multiple of 4 bytes.
fn align_copy(size: usize) -> u64 {
    ((size + 3) & !3) as u64
}

fn no_session() -> PipelineError {
    PipelineError::Gpu("no capture session started".to_string())
}

fn compute_entry(binding: u32, ty: wgpu::BindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    compute_entry(
        binding,
        wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    )
}

fn texture_entry(binding: u32, view_dimension: wgpu::TextureViewDimension) -> wgpu::BindGroupLayoutEntry {
    compute_entry(
        binding,
        wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension,
            multisampled: false,
        },
    )
}

/// Mappable readback region owned by one slot.
pub struct WgpuReadback {
    buffer: wgpu::Buffer,
    /// Frame bytes; the buffer itself is padded to the copy alignment.
    len: usize,
    state: Arc<AtomicU8>,
}

impl ReadbackBuffer for WgpuReadback {
    fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        if self.state.load(Ordering::Acquire) != MAP_READY {
            log::error!("[GPU] Readback region read before it was mapped");
            return f(&[]);
        }
        let view = self.buffer.slice(..).get_mapped_range();
        f(&view[..self.len])
    }

    fn recycle(&mut self) {
        if self.state.swap(MAP_IDLE, Ordering::AcqRel) == MAP_READY {
            self.buffer.unmap();
        }
    }
}

#[derive(Debug)]
pub struct WgpuFence {
    submission: wgpu::SubmissionIndex,
    state: Arc<AtomicU8>,
}

struct FrameTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct PackPass {
    pipeline: wgpu::ComputePipeline,
    params: wgpu::Buffer,
    output: wgpu::Buffer,
    output_size: u64,
    frame_group: wgpu::BindGroup,
    blended_group: Option<wgpu::BindGroup>,
}

struct BlendPass {
    pipeline: wgpu::ComputePipeline,
    ring: wgpu::Texture,
    output_view: wgpu::TextureView,
    group: wgpu::BindGroup,
    params: wgpu::Buffer,
    weights: wgpu::Buffer,
    capacity: u32,
    /// Next layer to write.
    head: u32,
}

struct GpuSession {
    geometry: SessionGeometry,
    pack: PackPass,
    blend: Option<BlendPass>,
    use_blended: bool,
    /// Layout the pack output currently holds, consumed by the next readback.
    packed: Option<PixelLayout>,
}

impl GpuSession {
    fn encode_pack(
        &self,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        layout: PixelLayout,
    ) -> PipelineResult<()> {
        let (width, height) = (self.geometry.width, self.geometry.height);
        let total = layout.frame_size(width, height) as u32;
        queue.write_buffer(
            &self.pack.params,
            0,
            bytemuck::bytes_of(&PackParams {
                width,
                height,
                pixel_layout: layout_code(layout)?,
                total,
            }),
        );

        let groups = total.div_ceil(4).div_ceil(PACK_WORKGROUP).max(1);
        let groups_x = groups.min(MAX_GROUPS_PER_DIM);
        let groups_y = groups.div_ceil(groups_x);

        let bind_group = match (&self.pack.blended_group, self.use_blended) {
            (Some(blended), true) => blended,
            _ => &self.pack.frame_group,
        };

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Pack Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pack.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(groups_x, groups_y, 1);
        Ok(())
    }
}

/// GPU backend on a `wgpu` device.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    frame: FrameTarget,
    session: Option<GpuSession>,
    /// First uncaptured device error, set only on devices we created.
    device_error: Arc<Mutex<Option<String>>>,
}

impl WgpuBackend {
    /// Use a device owned by the caller's renderer.
    ///
    /// The caller's uncaptured error handler is left in place.
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let frame = create_frame(&device, 1, 1);
        Self {
            device,
            queue,
            frame,
            session: None,
            device_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a device on the best available adapter, without a surface.
    ///
    /// Device errors outside an error scope are recorded and fail the next
    /// fence check instead of panicking the render thread.
    pub fn headless() -> PipelineResult<Self> {
        let (device, queue) = pollster::block_on(request_device())?;

        let device_error = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&device_error);
        device.on_uncaptured_error(Box::new(move |e: wgpu::Error| {
            log::error!("[GPU] Uncaptured device error: {}", e);
            sink.lock().get_or_insert_with(|| e.to_string());
        }));

        let backend = Self {
            device_error,
            ..Self::new(Arc::new(device), Arc::new(queue))
        };
        backend.check_device()?;
        Ok(backend)
    }

    /// Fail if the device reported an error outside an error scope.
    fn check_device(&self) -> PipelineResult<()> {
        match self.device_error.lock().as_ref() {
            Some(e) => Err(PipelineError::Gpu(format!("device error: {}", e))),
            None => Ok(()),
        }
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// The render target texture.
    pub fn frame_texture(&self) -> &wgpu::Texture {
        &self.frame.texture
    }

    /// Replace the render target contents with tightly packed RGBA8 pixels.
    pub fn upload_frame(&self, rgba: &[u8]) -> PipelineResult<()> {
        let size = self.frame.texture.size();
        let expected = size.width as usize * size.height as usize * 4;
        if rgba.len() != expected {
            return Err(PipelineError::Gpu(format!(
                "frame upload of {} bytes, target {}x{} needs {}",
                rgba.len(),
                size.width,
                size.height,
                expected
            )));
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.frame.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * size.width),
                rows_per_image: Some(size.height),
            },
            size,
        );
        Ok(())
    }

    /// Create a shader module from WGSL source.
    fn create_shader(&self, source: &str, label: &str) -> wgpu::ShaderModule {
        self.device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
    }

    fn create_compute_pipeline(
        &self,
        source: &str,
        label: &str,
        layout: &wgpu::BindGroupLayout,
    ) -> wgpu::ComputePipeline {
        let shader = self.create_shader(source, label);
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[layout],
                push_constant_ranges: &[],
            });

        self.device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
    }

    fn create_blend_pass(&self, geometry: &SessionGeometry, capacity: u32) -> PipelineResult<BlendPass> {
        let max_layers = self.device.limits().max_texture_array_layers;
        if capacity == 0 || capacity > max_layers {
            return Err(PipelineError::Gpu(format!(
                "blend ring of {} frames, device supports 1..={}",
                capacity, max_layers
            )));
        }

        let ring = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Blend Ring"),
            size: wgpu::Extent3d {
                width: geometry.width,
                height: geometry.height,
                depth_or_array_layers: capacity,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let ring_view = ring.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });

        let output = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Blended Frame"),
            size: wgpu::Extent3d {
                width: geometry.width,
                height: geometry.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());

        let params = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Blend Params"),
            size: std::mem::size_of::<BlendParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let weights = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Blend Weights"),
            size: 4 * capacity as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Blend Bind Group Layout"),
                entries: &[
                    texture_entry(0, wgpu::TextureViewDimension::D2Array),
                    compute_entry(
                        1,
                        wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: FRAME_FORMAT,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                    ),
                    buffer_entry(2, wgpu::BufferBindingType::Uniform),
                    buffer_entry(3, wgpu::BufferBindingType::Storage { read_only: true }),
                ],
            });
        let pipeline =
            self.create_compute_pipeline(include_str!("shaders/blend.wgsl"), "Blend Pipeline", &layout);

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Blend Bind Group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&ring_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: weights.as_entire_binding(),
                },
            ],
        });

        Ok(BlendPass {
            pipeline,
            ring,
            output_view,
            group,
            params,
            weights,
            capacity,
            head: 0,
        })
    }

    fn create_pack_pass(
        &self,
        frame_view: &wgpu::TextureView,
        output_size: u64,
        blend: Option<&BlendPass>,
    ) -> PackPass {
        let params = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pack Params"),
            size: std::mem::size_of::<PackParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let output = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pack Output"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Pack Bind Group Layout"),
                entries: &[
                    texture_entry(0, wgpu::TextureViewDimension::D2),
                    buffer_entry(1, wgpu::BufferBindingType::Storage { read_only: false }),
                    buffer_entry(2, wgpu::BufferBindingType::Uniform),
                ],
            });
        let pipeline =
            self.create_compute_pipeline(include_str!("shaders/pack.wgsl"), "Pack Pipeline", &layout);

        let bind = |label: &str, source: &wgpu::TextureView| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(source),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: output.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: params.as_entire_binding(),
                    },
                ],
            })
        };
        let frame_group = bind("Pack Frame Bind Group", frame_view);
        let blended_group = blend.map(|b| bind("Pack Blended Bind Group", &b.output_view));

        PackPass {
            pipeline,
            params,
            output,
            output_size,
            frame_group,
            blended_group,
        }
    }

    /// Run `create` inside validation and out-of-memory error scopes.
    ///
    /// Errors wgpu would otherwise hand to the device's uncaptured error
    /// handler are returned as `PipelineError::Gpu`.
    fn validated<T>(
        &self,
        what: &str,
        create: impl FnOnce(&Self) -> PipelineResult<T>,
    ) -> PipelineResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = create(self);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        match validation.or(out_of_memory) {
            Some(e) => Err(PipelineError::Gpu(format!("{} failed: {}", what, e))),
            None => result,
        }
    }

    /// Whether the fence's mapping has completed, without polling.
    fn map_state(&self, fence: &WgpuFence) -> PipelineResult<bool> {
        match fence.state.load(Ordering::Acquire) {
            MAP_READY => Ok(true),
            MAP_FAILED => Err(PipelineError::Gpu("readback mapping failed".to_string())),
            _ => Ok(false),
        }
    }

    fn poll(&self, mode: wgpu::PollType) -> PipelineResult<()> {
        self.device
            .poll(mode)
            .map(|_| ())
            .map_err(|e| PipelineError::Gpu(format!("device poll failed: {}", e)))
    }
}

fn create_frame(device: &wgpu::Device, width: u32, height: u32) -> FrameTarget {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Capture Frame"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: FRAME_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    FrameTarget { texture, view }
}

async fn request_device() -> PipelineResult<(wgpu::Device, wgpu::Queue)> {
    // Create wgpu instance
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    // Request adapter
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| PipelineError::Gpu(format!("no suitable GPU adapter: {}", e)))?;

    log::info!("[GPU] Using GPU adapter: {:?}", adapter.get_info().name);

    adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("Capture Device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        })
        .await
        .map_err(|e| PipelineError::Gpu(format!("failed to create device: {}", e)))
}

impl GpuBackend for WgpuBackend {
    type Buffer = WgpuReadback;
    type Fence = WgpuFence;
    type Target<'a> = &'a wgpu::TextureView;

    fn start_session(&mut self, geometry: &SessionGeometry) -> PipelineResult<()> {
        layout_code(geometry.capture_layout)?;

        let limits = self.device.limits();
        if geometry.width > limits.max_texture_dimension_2d
            || geometry.height > limits.max_texture_dimension_2d
        {
            return Err(PipelineError::Gpu(format!(
                "{}x{} exceeds the device texture limit of {}",
                geometry.width, geometry.height, limits.max_texture_dimension_2d
            )));
        }
        let output_size = align_copy(geometry.readback_size());
        if output_size > limits.max_storage_buffer_binding_size as u64 {
            return Err(PipelineError::Gpu(format!(
                "{} byte frames exceed the device storage binding limit of {}",
                output_size, limits.max_storage_buffer_binding_size
            )));
        }

        let (frame, blend, pack) = self.validated("capture session setup", |backend| {
            let frame = create_frame(&backend.device, geometry.width, geometry.height);
            let blend = geometry
                .blend_frames
                .map(|n| backend.create_blend_pass(geometry, n))
                .transpose()?;
            let pack = backend.create_pack_pass(&frame.view, output_size, blend.as_ref());
            Ok((frame, blend, pack))
        })?;
        self.frame = frame;

        log::debug!(
            "[GPU] wgpu session {}x{} capture={} ring={}",
            geometry.width,
            geometry.height,
            geometry.capture_layout,
            blend.as_ref().map(|b| b.capacity).unwrap_or(0)
        );

        self.session = Some(GpuSession {
            geometry: *geometry,
            pack,
            blend,
            use_blended: false,
            packed: None,
        });
        Ok(())
    }

    fn allocate_readback(&mut self) -> PipelineResult<WgpuReadback> {
        let session = self.session.as_ref().ok_or_else(no_session)?;
        let buffer = self.validated("readback allocation", |backend| {
            Ok(backend.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Readback Slot"),
                size: session.pack.output_size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }))
        })?;
        Ok(WgpuReadback {
            buffer,
            len: session.geometry.readback_size(),
            state: Arc::new(AtomicU8::new(MAP_IDLE)),
        })
    }

    fn begin_frame(&mut self) -> &wgpu::TextureView {
        if let Some(session) = self.session.as_mut() {
            session.use_blended = false;
        }
        &self.frame.view
    }

    fn accumulate(&mut self) -> PipelineResult<()> {
        let session = self.session.as_mut().ok_or_else(no_session)?;
        let blend = session.blend.as_mut().ok_or_else(|| {
            PipelineError::Gpu("accumulation is not enabled for this session".to_string())
        })?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Accumulate Encoder"),
            });
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.frame.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &blend.ring,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: blend.head,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: session.geometry.width,
                height: session.geometry.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        blend.head = (blend.head + 1) % blend.capacity;
        Ok(())
    }

    fn blend(&mut self, weights: &[f32]) -> PipelineResult<()> {
        let session = self.session.as_mut().ok_or_else(no_session)?;
        let geometry = session.geometry;
        let blend = session.blend.as_ref().ok_or_else(|| {
            PipelineError::Gpu("accumulation is not enabled for this session".to_string())
        })?;

        let count = weights.len() as u32;
        if count == 0 || count > blend.capacity {
            return Err(PipelineError::Gpu(format!(
                "cannot blend {} frames from a ring of {}",
                count, blend.capacity
            )));
        }

        self.queue
            .write_buffer(&blend.weights, 0, bytemuck::cast_slice(weights));
        self.queue.write_buffer(
            &blend.params,
            0,
            bytemuck::bytes_of(&BlendParams {
                count,
                head: blend.head,
                capacity: blend.capacity,
                padding: 0,
            }),
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Blend Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Blend Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&blend.pipeline);
            pass.set_bind_group(0, &blend.group, &[]);
            pass.dispatch_workgroups(
                geometry.width.div_ceil(BLEND_WORKGROUP),
                geometry.height.div_ceil(BLEND_WORKGROUP),
                1,
            );
        }
        self.queue.submit(Some(encoder.finish()));

        session.use_blended = true;
        Ok(())
    }

    fn color_transform(&mut self, layout: PixelLayout) -> PipelineResult<()> {
        let session = self.session.as_mut().ok_or_else(no_session)?;
        if layout != session.geometry.capture_layout || !layout.is_yuv() {
            return Err(PipelineError::Gpu(format!(
                "color transform to {} in a {} session",
                layout, session.geometry.capture_layout
            )));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Color Transform Encoder"),
            });
        session.encode_pack(&self.queue, &mut encoder, layout)?;
        self.queue.submit(Some(encoder.finish()));

        session.packed = Some(layout);
        Ok(())
    }

    fn issue_readback(
        &mut self,
        buffer: &mut WgpuReadback,
        layout: PixelLayout,
    ) -> PipelineResult<WgpuFence> {
        let session = self.session.as_mut().ok_or_else(no_session)?;
        let expected = session.geometry.readback_size();
        if buffer.len != expected || layout != session.geometry.capture_layout {
            return Err(PipelineError::Gpu(format!(
                "readback of {} into a {} byte region, session expects {} ({} bytes)",
                layout, buffer.len, session.geometry.capture_layout, expected
            )));
        }
        if buffer.state.load(Ordering::Acquire) != MAP_IDLE {
            return Err(PipelineError::Gpu(
                "readback region was not recycled".to_string(),
            ));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        if layout.is_yuv() {
            if session.packed.take() != Some(layout) {
                return Err(PipelineError::Gpu(
                    "readback issued before the color transform".to_string(),
                ));
            }
        } else {
            session.encode_pack(&self.queue, &mut encoder, layout)?;
        }
        encoder.copy_buffer_to_buffer(
            &session.pack.output,
            0,
            &buffer.buffer,
            0,
            session.pack.output_size,
        );
        let submission = self.queue.submit(Some(encoder.finish()));

        buffer.state.store(MAP_PENDING, Ordering::Release);
        let state = Arc::clone(&buffer.state);
        buffer
            .buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let next = match result {
                    Ok(()) => MAP_READY,
                    Err(e) => {
                        log::error!("[GPU] Readback mapping failed: {}", e);
                        MAP_FAILED
                    },
                };
                state.store(next, Ordering::Release);
            });

        Ok(WgpuFence {
            submission,
            state: Arc::clone(&buffer.state),
        })
    }

    fn is_signaled(&self, fence: &WgpuFence) -> PipelineResult<bool> {
        self.check_device()?;
        if self.map_state(fence)? {
            return Ok(true);
        }
        self.poll(wgpu::PollType::Poll)?;
        self.map_state(fence)
    }

    fn wait(&self, fence: &WgpuFence) -> PipelineResult<()> {
        self.check_device()?;
        if self.map_state(fence)? {
            return Ok(());
        }
        self.poll(wgpu::PollType::WaitForSubmissionIndex(fence.submission.clone()))?;
        if self.map_state(fence)? {
            return Ok(());
        }

        // Map callbacks can trail the submission by one poll
        self.poll(wgpu::PollType::Wait)?;
        if self.map_state(fence)? {
            Ok(())
        } else {
            Err(PipelineError::Gpu(
                "readback did not complete after waiting".to_string(),
            ))
        }
    }
}
