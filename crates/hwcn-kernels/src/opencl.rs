//! OpenCL-backed kernel dispatcher.
//!
//! Implements [`KernelDispatcher`] with the `opencl3` crate. The program
//! assembled by [`crate::kernels::program_source`] is built once at
//! construction; every launch creates its buffers, uploads, runs one nd-range
//! and blocks until the results are read back.

use crate::dispatch::{KernelDispatcher, LaunchRequest};
use crate::kernels::program_source;
use half::slice::HalfFloatSliceExt;
use hwcn_common::{KernelError, Result};
use log::{debug, info, warn};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_GPU, Device};
use opencl3::error_codes::{
    CL_MEM_OBJECT_ALLOCATION_FAILURE, CL_OUT_OF_HOST_MEMORY, CL_OUT_OF_RESOURCES, ClError,
};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, ClMem};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_device_type, cl_mem_flags};

/// Map a runtime error from a launch step to the kernel taxonomy.
fn launch_error(step: &str, err: ClError) -> KernelError {
    match err.0 {
        CL_OUT_OF_RESOURCES | CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_HOST_MEMORY => {
            KernelError::OutOfResources { reason: format!("{step}: {err}") }
        }
        _ => KernelError::LaunchFailed { reason: format!("{step}: {err}") },
    }
}

fn unavailable(reason: impl Into<String>) -> KernelError {
    KernelError::DeviceUnavailable { reason: reason.into() }
}

/// Dispatcher running the device program on an OpenCL GPU or accelerator.
pub struct OpenClDispatcher {
    platform_name: String,
    device_name: String,
    compute_units: u32,
    context: Context,
    queue: CommandQueue,
    program: Program,
}

// SAFETY: OpenCL handles may be used from any thread. The dispatcher is
// driven through `&mut self`, so launches on one instance never overlap.
unsafe impl Send for OpenClDispatcher {}

impl std::fmt::Debug for OpenClDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClDispatcher")
            .field("platform_name", &self.platform_name)
            .field("device_name", &self.device_name)
            .field("compute_units", &self.compute_units)
            .finish()
    }
}

impl OpenClDispatcher {
    /// Select the first GPU, or failing that the first accelerator, and
    /// build the convolution program for it.
    pub fn new() -> Result<Self> {
        match Self::try_init() {
            Ok(dispatcher) => {
                info!(
                    "OpenCL dispatcher initialized: {} on {} ({} compute units)",
                    dispatcher.device_name, dispatcher.platform_name, dispatcher.compute_units
                );
                Ok(dispatcher)
            }
            Err(e) => {
                debug!("OpenCL initialization failed: {e}");
                Err(e)
            }
        }
    }

    fn try_init() -> Result<Self> {
        let platforms = get_platforms()
            .map_err(|e| unavailable(format!("failed to get OpenCL platforms: {e}")))?;
        if platforms.is_empty() {
            return Err(unavailable("no OpenCL platforms found").into());
        }

        let device_types: [cl_device_type; 2] = [CL_DEVICE_TYPE_GPU, CL_DEVICE_TYPE_ACCELERATOR];
        for device_type in device_types {
            for platform in &platforms {
                let platform_name = platform.name().unwrap_or_default();
                debug!("Checking OpenCL platform: {platform_name}");
                let Some(&device_id) = platform.get_devices(device_type).unwrap_or_default().first()
                else {
                    continue;
                };

                let device = Device::new(device_id);
                let device_name = device.name().unwrap_or_default();
                let compute_units = device.max_compute_units().unwrap_or(0);

                let context = Context::from_device(&device)
                    .map_err(|e| unavailable(format!("failed to create context: {e}")))?;
                let queue = CommandQueue::create_default_with_properties(&context, 0, 0)
                    .map_err(|e| unavailable(format!("failed to create command queue: {e}")))?;
                let program = Program::create_and_build_from_source(&context, &program_source(), "")
                    .map_err(|log| KernelError::ProgramBuild { reason: log.to_string() })?;

                return Ok(Self { platform_name, device_name, compute_units, context, queue, program });
            }
        }
        Err(unavailable("no OpenCL GPU or accelerator device found").into())
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// Device buffer holding a copy of `data`. Empty slices get a one-element
    /// buffer so every argument slot is bound.
    fn upload<T>(&self, data: &[T], flags: cl_mem_flags, what: &str) -> Result<Buffer<T>> {
        // SAFETY: no host pointer is passed; the buffer is sized from `data`.
        let mut buffer = unsafe {
            Buffer::<T>::create(&self.context, flags, data.len().max(1), std::ptr::null_mut())
                .map_err(|e| launch_error(&format!("create {what} buffer"), e))?
        };
        if !data.is_empty() {
            // SAFETY: blocking write of `data.len()` elements into a buffer at
            // least that large.
            unsafe {
                self.queue
                    .enqueue_write_buffer(&mut buffer, CL_BLOCKING, 0, data, &[])
                    .map_err(|e| launch_error(&format!("write {what}"), e))?;
            }
        }
        Ok(buffer)
    }

    fn download<T>(&self, buffer: &Buffer<T>, out: &mut [T], what: &str) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        // SAFETY: blocking read into a host slice no larger than the buffer.
        unsafe {
            self.queue
                .enqueue_read_buffer(buffer, CL_BLOCKING, 0, out, &[])
                .map_err(|e| launch_error(&format!("read {what}"), e))?;
        }
        Ok(())
    }
}

impl KernelDispatcher for OpenClDispatcher {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn launch(&mut self, mut request: LaunchRequest<'_>) -> Result<()> {
        let params = request.validate()?;
        if params.num_cu > self.compute_units as usize {
            warn!(
                "topology asks for {} compute units, device {} reports {}",
                params.num_cu, self.device_name, self.compute_units
            );
        }
        let entry = params.pass.entry_point();
        debug!("OpenCL launch {entry}: {params}");

        let input = self.upload(request.input.reinterpret_cast(), CL_MEM_READ_ONLY, "input")?;
        let filter = self.upload(request.filter.reinterpret_cast(), CL_MEM_READ_ONLY, "filter")?;
        let bias = self.upload(request.bias.reinterpret_cast(), CL_MEM_READ_ONLY, "bias")?;
        let words = self.upload(request.params, CL_MEM_READ_ONLY, "params")?;
        let output =
            self.upload(&vec![0u16; request.output.len()], CL_MEM_READ_WRITE, "output")?;
        let tags = self.upload(&*request.tags, CL_MEM_READ_WRITE, "tags")?;
        let groups = i32::try_from(request.groups)
            .map_err(|_| KernelError::ParamOverflow { field: "groups", value: request.groups as i64 })?;

        let kernel = Kernel::create(&self.program, entry)
            .map_err(|e| KernelError::ProgramBuild { reason: format!("kernel {entry}: {e}") })?;
        let lanes = params.num_cu * params.num_pe;

        // SAFETY: argument order matches the program's entry signatures and
        // every buffer outlives the blocking wait below.
        let event = unsafe {
            ExecuteKernel::new(&kernel)
                .set_arg(&input.get())
                .set_arg(&filter.get())
                .set_arg(&bias.get())
                .set_arg(&output.get())
                .set_arg(&tags.get())
                .set_arg(&words.get())
                .set_arg(&groups)
                .set_global_work_size(lanes)
                .enqueue_nd_range(&self.queue)
                .map_err(|e| launch_error(&format!("enqueue {entry}"), e))?
        };
        event.wait().map_err(|e| launch_error(&format!("wait {entry}"), e))?;

        self.download(&output, request.output.reinterpret_cast_mut(), "output")?;
        self.download(&tags, request.tags, "tags")?;
        Ok(())
    }
}
