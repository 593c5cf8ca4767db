//! Portable command lists.
//!
//! Command lists are recorded API-agnostically as a tagged op stream plus a
//! table of referenced resources, then translated into backend calls at
//! submit. Latched state ops (viewport, scissor, pipeline, primitive
//! buffers, ...) are committed lazily by the translator on the next draw or
//! dispatch.

use std::{ops::Range, sync::Arc};

use parking_lot::Mutex;

use crate::{
    backend::{ClearValue, DrawArgs, ImageCopy, LoadOp, Rect, StoreOp, Viewport},
    barrier::{StageHint, TransitionType},
    buffer::{BufferInner, DeviceBuffer},
    device::DeviceShared,
    error::{Error, Result},
    format::IndexFormat,
    pipeline::{Pipeline, PipelineInner, PipelineKind},
    resource::AnyResource,
    rtas::{BlasInner, Tlas, TlasInner},
    swapchain::{Swapchain, SwapchainInner},
    texture::{DeviceTexture, TextureInner},
    Backend, Blas,
};

/// A resource named by a scope transition.
pub(crate) enum TransitionResource<B: Backend> {
    Buffer(Arc<BufferInner<B>>, Range<u64>),
    Texture(Arc<TextureInner<B>>),
    Swapchain(Arc<SwapchainInner<B>>),
    Tlas(Arc<TlasInner<B>>),
}

/// One entry of a scope's transition list.
pub(crate) struct ScopeTransition<B: Backend> {
    pub resource: TransitionResource<B>,
    pub ty: TransitionType,
    pub stage: StageHint,
}

/// Rendering attachment target: a texture or the current swapchain image.
pub(crate) enum RenderTargetRef<B: Backend> {
    Texture(Arc<TextureInner<B>>),
    Swapchain(Arc<SwapchainInner<B>>),
}

pub(crate) struct RenderTarget<B: Backend> {
    pub target: RenderTargetRef<B>,
    pub load: LoadOp,
    pub store: StoreOp,
    pub clear: ClearValue,
    pub resolve: Option<Arc<TextureInner<B>>>,
}

pub(crate) struct RenderingInfo<B: Backend> {
    pub colors: Vec<RenderTarget<B>>,
    pub depth: Option<RenderTarget<B>>,
    pub stencil: Option<RenderTarget<B>>,
    pub area: Rect,
}

pub(crate) enum CommandOp<B: Backend> {
    // Latched state, committed on the next draw/dispatch.
    SetViewport(Viewport),
    SetScissor(Rect),
    SetStencilRef(u32),
    SetBlendConstants([f32; 4]),
    SetPipeline(Arc<PipelineInner<B>>),
    SetPrimitiveBuffers {
        vertex: Option<(Arc<BufferInner<B>>, Range<u64>)>,
        index: Option<(Arc<BufferInner<B>>, u64, IndexFormat)>,
    },

    // Direct ops.
    ClearImage(Arc<TextureInner<B>>, ClearValue),
    CopyImage {
        src: Arc<TextureInner<B>>,
        dst: Arc<TextureInner<B>>,
        regions: Vec<ImageCopy>,
    },
    StartRendering(RenderingInfo<B>),
    EndRendering,
    Draw(DrawArgs),
    DrawIndirect {
        buffer: Arc<BufferInner<B>>,
        offset: u64,
        draw_count: u32,
        stride: u32,
        indexed: bool,
    },
    DrawIndirectCount {
        buffer: Arc<BufferInner<B>>,
        offset: u64,
        count_buffer: Arc<BufferInner<B>>,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
        indexed: bool,
    },
    Dispatch([u32; 3]),
    DispatchIndirect {
        buffer: Arc<BufferInner<B>>,
        offset: u64,
    },
    DispatchRays {
        extent: [u32; 3],
        raygen_id: u32,
    },
    DispatchRaysIndirect {
        buffer: Arc<BufferInner<B>>,
        offset: u64,
        raygen_id: u32,
    },
    UpdateBlas(Arc<BlasInner<B>>),
    UpdateTlas(Arc<TlasInner<B>>),
    StartScope(Vec<ScopeTransition<B>>),
    EndScope,
    StartDebugRegion(String, [f32; 4]),
    EndDebugRegion,
    AddDebugMarker(String),
}

/// Recording lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordState {
    New,
    Open,
    Closed,
}

pub(crate) struct CommandListState<B: Backend> {
    pub ops: Vec<CommandOp<B>>,
    pub record: RecordState,
    pub resources: Vec<AnyResource<B>>,
    pub active_swapchains: Vec<(Arc<SwapchainInner<B>>, u64)>,
    pub in_scope: bool,
    pub in_rendering: bool,
    pub debug_depth: u32,
    pub bound_kind: Option<PipelineKind>,
}

pub(crate) struct CommandListInner<B: Backend> {
    pub(crate) device: Arc<DeviceShared<B>>,
    pub(crate) state: Mutex<CommandListState<B>>,
    /// Held across submission to prevent concurrent re-submit.
    pub(crate) submit_lock: Mutex<()>,
}

/// A recorded, portable command list.
pub struct CommandList<B: Backend> {
    pub(crate) inner: Arc<CommandListInner<B>>,
}

impl<B: Backend> Clone for CommandList<B> {
    fn clone(&self) -> Self {
        CommandList {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A transition named while opening a scope.
pub struct Transition<B: Backend> {
    pub(crate) resource: TransitionResource<B>,
    pub(crate) ty: TransitionType,
    pub(crate) stage: StageHint,
}

impl<B: Backend> Transition<B> {
    /// Transition a buffer range; a zero-length range covers the whole
    /// buffer.
    pub fn buffer(
        buffer: &DeviceBuffer<B>,
        range: Range<u64>,
        ty: TransitionType,
        stage: StageHint,
    ) -> Self {
        let range = if range.start == range.end {
            0..buffer.size()
        } else {
            range
        };
        Transition {
            resource: TransitionResource::Buffer(Arc::clone(&buffer.inner), range),
            ty,
            stage,
        }
    }

    /// Transition a whole texture.
    pub fn texture(texture: &DeviceTexture<B>, ty: TransitionType, stage: StageHint) -> Self {
        Transition {
            resource: TransitionResource::Texture(Arc::clone(&texture.inner)),
            ty,
            stage,
        }
    }

    /// Transition the swapchain's acquired image.
    pub fn swapchain(swapchain: &Swapchain<B>, ty: TransitionType, stage: StageHint) -> Self {
        Transition {
            resource: TransitionResource::Swapchain(Arc::clone(&swapchain.inner)),
            ty,
            stage,
        }
    }

    /// Make a TLAS (and the BLASes it references) readable for traversal.
    pub fn tlas(tlas: &Tlas<B>, stage: StageHint) -> Self {
        Transition {
            resource: TransitionResource::Tlas(Arc::clone(&tlas.inner)),
            ty: TransitionType::RtasRead,
            stage,
        }
    }
}

/// Attachment description used by [`CommandList::start_rendering`].
pub struct Attachment<B: Backend> {
    pub(crate) target: RenderTargetRef<B>,
    /// Load behavior.
    pub load: LoadOp,
    /// Store behavior.
    pub store: StoreOp,
    /// Clear payload when `load == Clear`.
    pub clear: ClearValue,
    /// MSAA resolve target.
    pub resolve: Option<DeviceTexture<B>>,
}

impl<B: Backend> Attachment<B> {
    /// Attach a texture.
    pub fn texture(texture: &DeviceTexture<B>, load: LoadOp, store: StoreOp) -> Self {
        Attachment {
            target: RenderTargetRef::Texture(Arc::clone(&texture.inner)),
            load,
            store,
            clear: ClearValue::Color([0.0; 4]),
            resolve: None,
        }
    }

    /// Attach the swapchain's acquired image.
    pub fn swapchain(swapchain: &Swapchain<B>, load: LoadOp, store: StoreOp) -> Self {
        Attachment {
            target: RenderTargetRef::Swapchain(Arc::clone(&swapchain.inner)),
            load,
            store,
            clear: ClearValue::Color([0.0; 4]),
            resolve: None,
        }
    }

    /// Set the clear payload.
    pub fn with_clear(mut self, clear: ClearValue) -> Self {
        self.clear = clear;
        self
    }
}

impl<B: Backend> CommandList<B> {
    fn record<R>(
        &self,
        f: impl FnOnce(&mut CommandListState<B>) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.inner.state.lock();
        if state.record != RecordState::Open {
            return Err(Error::InvalidOperation(
                "command list is not open for recording",
            ));
        }
        f(&mut state)
    }

    /// Begin recording. Re-beginning a closed list clears it.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.record == RecordState::Open {
            return Err(Error::InvalidOperation("command list is already open"));
        }
        state.ops.clear();
        state.resources.clear();
        state.active_swapchains.clear();
        state.in_scope = false;
        state.in_rendering = false;
        state.debug_depth = 0;
        state.bound_kind = None;
        state.record = RecordState::Open;
        Ok(())
    }

    /// Finish recording. Submitting a non-closed list is rejected.
    pub fn end(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.record != RecordState::Open {
            return Err(Error::InvalidOperation("command list is not open"));
        }
        if state.in_rendering {
            return Err(Error::InvalidOperation(
                "command list ended inside a rendering scope",
            ));
        }
        if state.in_scope {
            return Err(Error::InvalidOperation("command list ended inside a scope"));
        }
        if state.debug_depth != 0 {
            return Err(Error::InvalidOperation(
                "command list ended inside a debug region",
            ));
        }
        state.record = RecordState::Closed;
        Ok(())
    }

    /// Open a scope, naming every resource the scope touches and how.
    pub fn start_scope(&self, transitions: Vec<Transition<B>>) -> Result<()> {
        self.record(|state| {
            if state.in_scope {
                return Err(Error::InvalidOperation("scopes cannot nest"));
            }
            state.in_scope = true;
            let mut list = Vec::with_capacity(transitions.len());
            for transition in transitions {
                match &transition.resource {
                    TransitionResource::Buffer(inner, _) => {
                        state.resources.push(AnyResource::Buffer(Arc::clone(inner)));
                    }
                    TransitionResource::Texture(inner) => {
                        state
                            .resources
                            .push(AnyResource::Texture(Arc::clone(inner)));
                    }
                    TransitionResource::Swapchain(inner) => {
                        let version = inner.state.lock().version;
                        state
                            .resources
                            .push(AnyResource::Swapchain(Arc::clone(inner)));
                        if !state
                            .active_swapchains
                            .iter()
                            .any(|(s, _)| Arc::ptr_eq(s, inner))
                        {
                            state.active_swapchains.push((Arc::clone(inner), version));
                        }
                    }
                    TransitionResource::Tlas(inner) => {
                        state.resources.push(AnyResource::Tlas(Arc::clone(inner)));
                    }
                }
                list.push(ScopeTransition {
                    resource: transition.resource,
                    ty: transition.ty,
                    stage: transition.stage,
                });
            }
            state.ops.push(CommandOp::StartScope(list));
            Ok(())
        })
    }

    /// Close the current scope.
    pub fn end_scope(&self) -> Result<()> {
        self.record(|state| {
            if !state.in_scope {
                return Err(Error::InvalidOperation("no scope to end"));
            }
            if state.in_rendering {
                return Err(Error::InvalidOperation(
                    "scope ended inside a rendering scope",
                ));
            }
            state.in_scope = false;
            state.ops.push(CommandOp::EndScope);
            Ok(())
        })
    }

    /// Latch the viewport.
    pub fn set_viewport(&self, viewport: Viewport) -> Result<()> {
        self.record(|state| {
            state.ops.push(CommandOp::SetViewport(viewport));
            Ok(())
        })
    }

    /// Latch the scissor rectangle.
    pub fn set_scissor(&self, rect: Rect) -> Result<()> {
        self.record(|state| {
            state.ops.push(CommandOp::SetScissor(rect));
            Ok(())
        })
    }

    /// Latch viewport and scissor together.
    pub fn set_viewport_and_scissor(&self, viewport: Viewport, rect: Rect) -> Result<()> {
        self.record(|state| {
            state.ops.push(CommandOp::SetViewport(viewport));
            state.ops.push(CommandOp::SetScissor(rect));
            Ok(())
        })
    }

    /// Latch the stencil reference.
    pub fn set_stencil(&self, reference: u32) -> Result<()> {
        self.record(|state| {
            state.ops.push(CommandOp::SetStencilRef(reference));
            Ok(())
        })
    }

    /// Latch blend constants.
    pub fn set_blend_constants(&self, constants: [f32; 4]) -> Result<()> {
        self.record(|state| {
            state.ops.push(CommandOp::SetBlendConstants(constants));
            Ok(())
        })
    }

    /// Latch a pipeline; its kind selects the bind point.
    pub fn set_pipeline(&self, pipeline: &Pipeline<B>) -> Result<()> {
        self.record(|state| {
            state.bound_kind = Some(pipeline.inner.kind);
            state
                .resources
                .push(AnyResource::Pipeline(Arc::clone(&pipeline.inner)));
            state
                .ops
                .push(CommandOp::SetPipeline(Arc::clone(&pipeline.inner)));
            Ok(())
        })
    }

    /// Latch vertex/index buffer bindings.
    pub fn set_primitive_buffers(
        &self,
        vertex: Option<(&DeviceBuffer<B>, Range<u64>)>,
        index: Option<(&DeviceBuffer<B>, u64, IndexFormat)>,
    ) -> Result<()> {
        self.record(|state| {
            let vertex = vertex.map(|(buffer, range)| {
                state
                    .resources
                    .push(AnyResource::Buffer(Arc::clone(&buffer.inner)));
                (Arc::clone(&buffer.inner), range)
            });
            let index = index.map(|(buffer, offset, format)| {
                state
                    .resources
                    .push(AnyResource::Buffer(Arc::clone(&buffer.inner)));
                (Arc::clone(&buffer.inner), offset, format)
            });
            state
                .ops
                .push(CommandOp::SetPrimitiveBuffers { vertex, index });
            Ok(())
        })
    }

    /// Clear a texture outside a rendering scope.
    pub fn clear_image(&self, texture: &DeviceTexture<B>, value: ClearValue) -> Result<()> {
        self.record(|state| {
            if state.in_rendering {
                return Err(Error::InvalidOperation(
                    "clear_image inside a rendering scope",
                ));
            }
            state
                .resources
                .push(AnyResource::Texture(Arc::clone(&texture.inner)));
            state
                .ops
                .push(CommandOp::ClearImage(Arc::clone(&texture.inner), value));
            Ok(())
        })
    }

    /// Copy between two textures.
    pub fn copy_image(
        &self,
        src: &DeviceTexture<B>,
        dst: &DeviceTexture<B>,
        regions: Vec<ImageCopy>,
    ) -> Result<()> {
        self.record(|state| {
            state
                .resources
                .push(AnyResource::Texture(Arc::clone(&src.inner)));
            state
                .resources
                .push(AnyResource::Texture(Arc::clone(&dst.inner)));
            state.ops.push(CommandOp::CopyImage {
                src: Arc::clone(&src.inner),
                dst: Arc::clone(&dst.inner),
                regions,
            });
            Ok(())
        })
    }

    /// Open a dynamic rendering scope over the given attachments.
    pub fn start_rendering(
        &self,
        area: Rect,
        colors: Vec<Attachment<B>>,
        depth: Option<Attachment<B>>,
        stencil: Option<Attachment<B>>,
    ) -> Result<()> {
        self.record(|state| {
            if !state.in_scope {
                return Err(Error::InvalidOperation(
                    "rendering must start inside a scope",
                ));
            }
            if state.in_rendering {
                return Err(Error::InvalidOperation("rendering scopes cannot nest"));
            }
            if colors.is_empty() && depth.is_none() && stencil.is_none() {
                return Err(Error::InvalidParameter(
                    "rendering needs at least one attachment",
                ));
            }
            state.in_rendering = true;

            fn convert<B: Backend>(
                attachment: Attachment<B>,
                state: &mut CommandListState<B>,
            ) -> RenderTarget<B> {
                match &attachment.target {
                    RenderTargetRef::Texture(inner) => {
                        state
                            .resources
                            .push(AnyResource::Texture(Arc::clone(inner)));
                    }
                    RenderTargetRef::Swapchain(inner) => {
                        let version = inner.state.lock().version;
                        state
                            .resources
                            .push(AnyResource::Swapchain(Arc::clone(inner)));
                        if !state
                            .active_swapchains
                            .iter()
                            .any(|(s, _)| Arc::ptr_eq(s, inner))
                        {
                            state.active_swapchains.push((Arc::clone(inner), version));
                        }
                    }
                }
                if let Some(resolve) = &attachment.resolve {
                    state
                        .resources
                        .push(AnyResource::Texture(Arc::clone(&resolve.inner)));
                }
                RenderTarget {
                    target: attachment.target,
                    load: attachment.load,
                    store: attachment.store,
                    clear: attachment.clear,
                    resolve: attachment.resolve.map(|t| Arc::clone(&t.inner)),
                }
            }

            let mut color_targets = Vec::with_capacity(colors.len());
            for attachment in colors {
                color_targets.push(convert(attachment, state));
            }
            let depth = depth.map(|a| convert(a, state));
            let stencil = stencil.map(|a| convert(a, state));
            let colors = color_targets;

            state.ops.push(CommandOp::StartRendering(RenderingInfo {
                colors,
                depth,
                stencil,
                area,
            }));
            Ok(())
        })
    }

    /// Close the current rendering scope.
    pub fn end_rendering(&self) -> Result<()> {
        self.record(|state| {
            if !state.in_rendering {
                return Err(Error::InvalidOperation("no rendering scope to end"));
            }
            state.in_rendering = false;
            state.ops.push(CommandOp::EndRendering);
            Ok(())
        })
    }

    fn check_draw(state: &CommandListState<B>) -> Result<()> {
        if !state.in_rendering {
            return Err(Error::InvalidOperation("draw outside a rendering scope"));
        }
        if state.bound_kind != Some(PipelineKind::Graphics) {
            return Err(Error::InvalidOperation("draw without a graphics pipeline"));
        }
        Ok(())
    }

    fn check_dispatch(state: &CommandListState<B>, kind: PipelineKind) -> Result<()> {
        if state.in_rendering {
            return Err(Error::InvalidOperation(
                "dispatch inside a rendering scope",
            ));
        }
        if state.bound_kind != Some(kind) {
            return Err(Error::InvalidOperation(
                "dispatch without the matching pipeline",
            ));
        }
        Ok(())
    }

    /// Draw.
    pub fn draw(&self, args: DrawArgs) -> Result<()> {
        self.record(|state| {
            Self::check_draw(state)?;
            state.ops.push(CommandOp::Draw(args));
            Ok(())
        })
    }

    /// Draw with GPU-provided arguments.
    pub fn draw_indirect(
        &self,
        buffer: &DeviceBuffer<B>,
        offset: u64,
        draw_count: u32,
        stride: u32,
        indexed: bool,
    ) -> Result<()> {
        self.record(|state| {
            Self::check_draw(state)?;
            state
                .resources
                .push(AnyResource::Buffer(Arc::clone(&buffer.inner)));
            state.ops.push(CommandOp::DrawIndirect {
                buffer: Arc::clone(&buffer.inner),
                offset,
                draw_count,
                stride,
                indexed,
            });
            Ok(())
        })
    }

    /// Draw with GPU-provided arguments and count.
    pub fn draw_indirect_count(
        &self,
        buffer: &DeviceBuffer<B>,
        offset: u64,
        count_buffer: &DeviceBuffer<B>,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
        indexed: bool,
    ) -> Result<()> {
        self.record(|state| {
            Self::check_draw(state)?;
            state
                .resources
                .push(AnyResource::Buffer(Arc::clone(&buffer.inner)));
            state
                .resources
                .push(AnyResource::Buffer(Arc::clone(&count_buffer.inner)));
            state.ops.push(CommandOp::DrawIndirectCount {
                buffer: Arc::clone(&buffer.inner),
                offset,
                count_buffer: Arc::clone(&count_buffer.inner),
                count_offset,
                max_draw_count,
                stride,
                indexed,
            });
            Ok(())
        })
    }

    /// Dispatch compute groups.
    pub fn dispatch(&self, groups: [u32; 3]) -> Result<()> {
        self.record(|state| {
            Self::check_dispatch(state, PipelineKind::Compute)?;
            state.ops.push(CommandOp::Dispatch(groups));
            Ok(())
        })
    }

    /// Dispatch with GPU-provided group counts.
    pub fn dispatch_indirect(&self, buffer: &DeviceBuffer<B>, offset: u64) -> Result<()> {
        self.record(|state| {
            Self::check_dispatch(state, PipelineKind::Compute)?;
            state
                .resources
                .push(AnyResource::Buffer(Arc::clone(&buffer.inner)));
            state.ops.push(CommandOp::DispatchIndirect {
                buffer: Arc::clone(&buffer.inner),
                offset,
            });
            Ok(())
        })
    }

    /// Trace rays over `extent`, launching from raygen record `raygen_id`.
    pub fn dispatch_rays(&self, extent: [u32; 3], raygen_id: u32) -> Result<()> {
        self.record(|state| {
            Self::check_dispatch(state, PipelineKind::RayTracing)?;
            state.ops.push(CommandOp::DispatchRays { extent, raygen_id });
            Ok(())
        })
    }

    /// Trace rays with GPU-provided dimensions.
    pub fn dispatch_rays_indirect(
        &self,
        buffer: &DeviceBuffer<B>,
        offset: u64,
        raygen_id: u32,
    ) -> Result<()> {
        self.record(|state| {
            Self::check_dispatch(state, PipelineKind::RayTracing)?;
            state
                .resources
                .push(AnyResource::Buffer(Arc::clone(&buffer.inner)));
            state.ops.push(CommandOp::DispatchRaysIndirect {
                buffer: Arc::clone(&buffer.inner),
                offset,
                raygen_id,
            });
            Ok(())
        })
    }

    /// Re-queue a refit-capable BLAS for building this frame.
    pub fn update_blas(&self, blas: &Blas<B>) -> Result<()> {
        self.record(|state| {
            if state.in_rendering {
                return Err(Error::InvalidOperation(
                    "acceleration structure builds inside a rendering scope",
                ));
            }
            state
                .resources
                .push(AnyResource::Blas(Arc::clone(&blas.inner)));
            state
                .ops
                .push(CommandOp::UpdateBlas(Arc::clone(&blas.inner)));
            Ok(())
        })
    }

    /// Re-queue a refit-capable TLAS for building this frame.
    pub fn update_tlas(&self, tlas: &Tlas<B>) -> Result<()> {
        self.record(|state| {
            if state.in_rendering {
                return Err(Error::InvalidOperation(
                    "acceleration structure builds inside a rendering scope",
                ));
            }
            state
                .resources
                .push(AnyResource::Tlas(Arc::clone(&tlas.inner)));
            state
                .ops
                .push(CommandOp::UpdateTlas(Arc::clone(&tlas.inner)));
            Ok(())
        })
    }

    /// Open a named debug region.
    pub fn start_debug_region(&self, name: &str, color: [f32; 4]) -> Result<()> {
        self.record(|state| {
            state.debug_depth += 1;
            state
                .ops
                .push(CommandOp::StartDebugRegion(name.to_owned(), color));
            Ok(())
        })
    }

    /// Close the innermost debug region.
    pub fn end_debug_region(&self) -> Result<()> {
        self.record(|state| {
            if state.debug_depth == 0 {
                return Err(Error::InvalidOperation("no debug region to end"));
            }
            state.debug_depth -= 1;
            state.ops.push(CommandOp::EndDebugRegion);
            Ok(())
        })
    }

    /// Drop a point marker.
    pub fn add_debug_marker(&self, name: &str) -> Result<()> {
        self.record(|state| {
            state.ops.push(CommandOp::AddDebugMarker(name.to_owned()));
            Ok(())
        })
    }

    /// Number of recorded ops. Useful for tooling and tests.
    pub fn op_count(&self) -> usize {
        self.inner.state.lock().ops.len()
    }
}
