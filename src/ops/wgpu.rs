//! GPU-accelerated matrix products using WGPU.
//!
//! One WGSL compute kernel (`shaders/matmul.wgsl`) serves the forward pass of
//! `MatMul` and `Linear` when [`Backend::Wgpu`](crate::backend::Backend) is
//! selected. The device, shader and pipeline are created once, lazily; if no
//! adapter is available the context is absent and every call reports an
//! error so the dispatcher can fall back to the CPU.
//!
//! Data is converted to `f32` for the device and back to `f64` afterwards, so
//! results are close to, but not bit-identical with, the CPU kernel.

use briny::prelude::*;
use thiserror::Error;
use wgpu::util::DeviceExt;

const MATMUL: &str = include_str!("shaders/matmul.wgsl");
const WORKGROUP: u32 = 16;

/// Failures of the GPU path.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no gpu adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("gpu device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("shader source failed validation")]
    Shader,
    #[error("gpu context unavailable")]
    Unavailable,
    #[error("matrix dimension {0} does not fit the kernel")]
    TooLarge(usize),
    #[error("gpu readback failed: {0}")]
    Readback(String),
}

/// WGSL source checked before it reaches the driver.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }
        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Device, queue and the compiled matmul pipeline.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuContext {
    /// Selects the default adapter and compiles the matmul pipeline.
    ///
    /// # Errors
    /// Adapter or device acquisition failure, or a shader that fails
    /// validation.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("tapegrad"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        WgslSource(MATMUL).validate().map_err(|_| GpuError::Shader)?;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("matmul"),
            source: wgpu::ShaderSource::Wgsl(MATMUL.into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("matmul_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("matmul_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("matmul_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        Ok(Self {
            device,
            queue,
            layout,
            pipeline,
        })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Option<GpuContext> = match GpuContext::new() {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            tracing::warn!(%err, "gpu backend unavailable");
            None
        }
    };
}

fn to_f32_bytes(values: &[f64]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| (v as f32).to_le_bytes())
        .collect()
}

fn dim(value: usize) -> Result<u32, GpuError> {
    u32::try_from(value).map_err(|_| GpuError::TooLarge(value))
}

/// `C = A × B` on the GPU for row-major `A: m×k`, `B: k×n`.
///
/// # Errors
/// [`GpuError`] when no device is available or the readback fails.
pub fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Result<Vec<f64>, GpuError> {
    let ctx = GPU_CONTEXT.as_ref().ok_or(GpuError::Unavailable)?;
    let (m32, k32, n32) = (dim(m)?, dim(k)?, dim(n)?);
    let out_bytes = (m * n * 4) as u64;

    let dims: Vec<u8> = [m32, k32, n32, 0]
        .iter()
        .flat_map(|d| d.to_le_bytes())
        .collect();
    let dims_buffer = ctx
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dims"),
            contents: &dims,
            usage: wgpu::BufferUsages::UNIFORM,
        });
    let a_buffer = ctx
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("A"),
            contents: &to_f32_bytes(a),
            usage: wgpu::BufferUsages::STORAGE,
        });
    let b_buffer = ctx
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("B"),
            contents: &to_f32_bytes(b),
            usage: wgpu::BufferUsages::STORAGE,
        });
    let c_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("C"),
        size: out_bytes,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size: out_bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("matmul_bind_group"),
        layout: &ctx.layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: dims_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: a_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: b_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: c_buffer.as_entire_binding(),
            },
        ],
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("matmul_encoder"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("matmul_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&ctx.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(n32.div_ceil(WORKGROUP), m32.div_ceil(WORKGROUP), 1);
    }
    encoder.copy_buffer_to_buffer(&c_buffer, 0, &staging, 0, out_bytes);
    ctx.queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    ctx.device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| GpuError::Readback(e.to_string()))?;
    rx.recv()
        .map_err(|e| GpuError::Readback(e.to_string()))?
        .map_err(|e| GpuError::Readback(e.to_string()))?;

    let out = {
        let bytes = slice.get_mapped_range();
        bytes
            .chunks_exact(4)
            .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect()
    };
    staging.unmap();
    Ok(out)
}
