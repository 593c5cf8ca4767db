#![deny(missing_docs)]

//! Bindless, triple-buffered graphics runtime core.
//!
//! The portable layer owns GPU devices, sub-allocates their memory, tracks
//! resource states, stages CPU-authored data onto the device and sequences
//! command execution across three frames in flight. Every GPU-touching
//! operation routes through the [`Backend`] trait, implemented by the
//! Vulkan and Direct3D 12 backend crates (and a headless mock for tests).

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod adapter;
pub mod backend;
pub mod barrier;
pub mod buffer;
pub mod cmd;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod format;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod resource;
pub mod rtas;
pub mod sampler;
mod submit;
pub mod swapchain;
pub mod texture;

pub use crate::{
    adapter::{Capabilities, DeviceInfo, DeviceType, Limits, TypeMask, VendorMask},
    backend::{
        Backend, BackendCommandBuffer, BackendDevice, BackendInstance, ClearValue, DeviceFlags,
        DrawArgs, LoadOp, Rect, StoreOp, Viewport, WindowHandle,
    },
    barrier::{StageHint, TransitionType},
    buffer::{BufferUsage, DeviceBuffer},
    cmd::{Attachment, CommandList, Transition},
    descriptor::{DescriptorType, ResourceHandle},
    device::{Device, FrameConstants, APP_DATA_SIZE, FRAMES_IN_FLIGHT, MAX_SWAPCHAINS},
    error::{Error, Result},
    format::{Format, IndexFormat, WindowFormat},
    instance::Instance,
    pipeline::{
        ComputePipelineDesc, GraphicsPipelineDesc, Pipeline, PipelineKind, RaytracingPipelineDesc,
        ShaderStage,
    },
    resource::ResourceFlags,
    rtas::{
        Blas, BlasGeometry, RtasBuildFlags, Tlas, TlasInstanceHeader, TlasInstanceMotion,
        TlasInstanceStatic, TlasInstances,
    },
    sampler::{Sampler, SamplerDesc},
    swapchain::{PresentMode, Swapchain, SwapchainDesc},
    texture::{DeviceTexture, TextureDesc, TextureType, TextureUsage},
};

#[cfg(test)]
pub(crate) mod test_stubs {
    //! An uninhabited backend for unit tests that never touch the GPU.

    use crate::{
        backend::*,
        barrier::{BufferBarrier, ImageBarrier, SubresourceRange},
        error::{Error, Result},
    };
    use std::{fmt, ops::Range};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum NullBackend {}

    pub enum Never {}

    impl fmt::Debug for Never {
        fn fmt(&self, _: &mut fmt::Formatter) -> fmt::Result {
            match *self {}
        }
    }

    impl Backend for NullBackend {
        type Instance = Never;
        type Surface = ();
        type Device = Never;
        type Memory = ();
        type Buffer = ();
        type Image = ();
        type Sampler = ();
        type Swapchain = ();
        type Pipeline = ();
        type AccelerationStructure = ();
        type CommandPool = ();
        type CommandBuffer = Never;
    }

    impl BackendInstance<NullBackend> for Never {
        fn create(_: &str, _: u32, _: DeviceFlags) -> Result<Self> {
            Err(Error::UnsupportedOperation("null backend"))
        }
        fn enumerate_devices(&self) -> Result<Vec<crate::adapter::DeviceInfo>> {
            match *self {}
        }
        fn create_surface(&self, _: &WindowHandle) -> Result<()> {
            match *self {}
        }
        unsafe fn destroy_surface(&self, _: ()) {
            match *self {}
        }
        fn open_device(&self, _: &crate::adapter::DeviceInfo, _: DeviceFlags) -> Result<Never> {
            match *self {}
        }
    }

    impl BackendDevice<NullBackend> for Never {
        unsafe fn allocate_memory(&self, _: u32, _: u64, _: &str) -> Result<()> {
            match *self {}
        }
        unsafe fn free_memory(&self, _: ()) {
            match *self {}
        }
        unsafe fn map_memory(&self, _: &()) -> Result<*mut u8> {
            match *self {}
        }
        unsafe fn flush_mapped(&self, _: &(), _: &[Range<u64>]) -> Result<()> {
            match *self {}
        }
        fn memory_budget(&self, _: bool) -> Option<u64> {
            match *self {}
        }
        unsafe fn create_buffer(
            &self,
            _: u64,
            _: crate::buffer::BufferUsage,
            _: crate::resource::ResourceFlags,
            _: &str,
        ) -> Result<()> {
            match *self {}
        }
        unsafe fn buffer_requirements(&self, _: &()) -> crate::memory::Requirements {
            match *self {}
        }
        unsafe fn bind_buffer_memory(&self, _: &(), _: &(), _: u64) -> Result<()> {
            match *self {}
        }
        unsafe fn buffer_address(&self, _: &()) -> u64 {
            match *self {}
        }
        unsafe fn destroy_buffer(&self, _: ()) {
            match *self {}
        }
        unsafe fn create_image(&self, _: &crate::texture::TextureDesc, _: &str) -> Result<()> {
            match *self {}
        }
        unsafe fn image_requirements(&self, _: &()) -> crate::memory::Requirements {
            match *self {}
        }
        unsafe fn bind_image_memory(
            &self,
            _: &(),
            _: &crate::texture::TextureDesc,
            _: &(),
            _: u64,
        ) -> Result<()> {
            match *self {}
        }
        unsafe fn destroy_image(&self, _: ()) {
            match *self {}
        }
        unsafe fn create_sampler(&self, _: &crate::sampler::SamplerDesc, _: &str) -> Result<()> {
            match *self {}
        }
        unsafe fn destroy_sampler(&self, _: ()) {
            match *self {}
        }
        unsafe fn write_buffer_descriptor(
            &self,
            _: crate::descriptor::ResourceHandle,
            _: &(),
            _: u64,
            _: u64,
        ) {
            match *self {}
        }
        unsafe fn write_image_descriptor(&self, _: crate::descriptor::ResourceHandle, _: &()) {
            match *self {}
        }
        unsafe fn write_sampler_descriptor(&self, _: crate::descriptor::ResourceHandle, _: &()) {
            match *self {}
        }
        unsafe fn write_tlas_descriptor(&self, _: crate::descriptor::ResourceHandle, _: &()) {
            match *self {}
        }
        unsafe fn init_frame_uniforms(&self, _: [&(); 3], _: u64) -> Result<()> {
            match *self {}
        }
        fn surface_capabilities(&self, _: &()) -> Result<crate::swapchain::SurfaceCapabilities> {
            match *self {}
        }
        unsafe fn create_swapchain(
            &self,
            _: &(),
            _: &crate::swapchain::SwapchainConfig,
            _: Option<()>,
        ) -> Result<((), Vec<()>)> {
            match *self {}
        }
        unsafe fn destroy_swapchain(&self, _: ()) {
            match *self {}
        }
        unsafe fn acquire_image(&self, _: &(), _: usize) -> Result<u32> {
            match *self {}
        }
        unsafe fn present(&self, _: &[(&(), u32)], _: usize, _: bool) -> Result<()> {
            match *self {}
        }
        unsafe fn create_command_pool(&self, _: &str) -> Result<()> {
            match *self {}
        }
        unsafe fn destroy_command_pool(&self, _: ()) {
            match *self {}
        }
        unsafe fn reset_command_pool(&self, _: &mut ()) -> Result<()> {
            match *self {}
        }
        unsafe fn allocate_command_buffer(&self, _: &mut ()) -> Result<Never> {
            match *self {}
        }
        unsafe fn begin_command_buffer(&self, _: &mut Never) -> Result<()> {
            match *self {}
        }
        unsafe fn end_command_buffer(&self, _: &mut Never) -> Result<()> {
            match *self {}
        }
        unsafe fn submit(&self, _: Option<&Never>, _: &SubmitDesc<NullBackend>) -> Result<()> {
            match *self {}
        }
        unsafe fn wait_timeline(&self, _: u64) -> Result<()> {
            match *self {}
        }
        unsafe fn wait_idle(&self) -> Result<()> {
            match *self {}
        }
        unsafe fn create_compute_pipeline(
            &self,
            _: &crate::pipeline::ComputePipelineDesc,
            _: &str,
        ) -> Result<()> {
            match *self {}
        }
        unsafe fn create_graphics_pipeline(
            &self,
            _: &crate::pipeline::GraphicsPipelineDesc,
            _: &str,
        ) -> Result<()> {
            match *self {}
        }
        unsafe fn create_raytracing_pipeline(
            &self,
            _: &crate::pipeline::RaytracingPipelineDesc,
            _: &str,
        ) -> Result<()> {
            match *self {}
        }
        unsafe fn sbt_group_handles(&self, _: &(), _: u32) -> Result<Vec<u8>> {
            match *self {}
        }
        unsafe fn destroy_pipeline(&self, _: ()) {
            match *self {}
        }
        unsafe fn rtas_build_sizes(
            &self,
            _: &crate::rtas::RtasBuildInputs<NullBackend>,
        ) -> Result<crate::rtas::RtasSizes> {
            match *self {}
        }
        unsafe fn create_rtas(&self, _: &(), _: u64, _: u64, _: bool) -> Result<()> {
            match *self {}
        }
        unsafe fn rtas_address(&self, _: &()) -> u64 {
            match *self {}
        }
        unsafe fn destroy_rtas(&self, _: ()) {
            match *self {}
        }
    }

    impl BackendCommandBuffer<NullBackend> for Never {
        unsafe fn pipeline_barrier(
            &mut self,
            _: &[BufferBarrier<NullBackend>],
            _: &[ImageBarrier<NullBackend>],
        ) {
            match *self {}
        }
        unsafe fn copy_buffer(&mut self, _: &(), _: &(), _: &[BufferCopy]) {
            match *self {}
        }
        unsafe fn copy_buffer_to_image(
            &mut self,
            _: &(),
            _: &(),
            _: &crate::texture::TextureDesc,
            _: &[BufferImageCopy],
        ) {
            match *self {}
        }
        unsafe fn copy_image(&mut self, _: &(), _: &(), _: &[ImageCopy]) {
            match *self {}
        }
        unsafe fn clear_image(&mut self, _: &(), _: ClearValue, _: SubresourceRange) {
            match *self {}
        }
        unsafe fn begin_rendering(&mut self, _: &RenderingDesc<NullBackend>) {
            match *self {}
        }
        unsafe fn end_rendering(&mut self) {
            match *self {}
        }
        unsafe fn bind_pipeline(&mut self, _: crate::pipeline::PipelineKind, _: &()) {
            match *self {}
        }
        unsafe fn bind_frame_descriptors(&mut self, _: &Never, _: usize) {
            match *self {}
        }
        unsafe fn set_viewport(&mut self, _: &Viewport) {
            match *self {}
        }
        unsafe fn set_scissor(&mut self, _: &Rect) {
            match *self {}
        }
        unsafe fn set_stencil_reference(&mut self, _: u32) {
            match *self {}
        }
        unsafe fn set_blend_constants(&mut self, _: [f32; 4]) {
            match *self {}
        }
        unsafe fn bind_index_buffer(&mut self, _: &(), _: u64, _: crate::format::IndexFormat) {
            match *self {}
        }
        unsafe fn bind_vertex_buffers(&mut self, _: u32, _: &[(&(), u64)]) {
            match *self {}
        }
        unsafe fn draw(&mut self, _: &DrawArgs) {
            match *self {}
        }
        unsafe fn draw_indirect(&mut self, _: &(), _: u64, _: u32, _: u32, _: bool) {
            match *self {}
        }
        unsafe fn draw_indirect_count(
            &mut self,
            _: &(),
            _: u64,
            _: &(),
            _: u64,
            _: u32,
            _: u32,
            _: bool,
        ) {
            match *self {}
        }
        unsafe fn dispatch(&mut self, _: [u32; 3]) {
            match *self {}
        }
        unsafe fn dispatch_indirect(&mut self, _: &(), _: u64) {
            match *self {}
        }
        unsafe fn trace_rays(&mut self, _: &SbtRegions, _: [u32; 3]) {
            match *self {}
        }
        unsafe fn trace_rays_indirect(&mut self, _: &SbtRegions, _: u64) {
            match *self {}
        }
        unsafe fn build_rtas(&mut self, _: &crate::rtas::RtasBuildCmd<NullBackend>) {
            match *self {}
        }
        unsafe fn begin_debug_region(&mut self, _: &str, _: [f32; 4]) {
            match *self {}
        }
        unsafe fn end_debug_region(&mut self) {
            match *self {}
        }
        unsafe fn insert_debug_marker(&mut self, _: &str) {
            match *self {}
        }
    }
}
