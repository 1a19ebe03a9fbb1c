use ash::vk;
use itertools::Itertools;
use profiling::scope;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::renderer::{
    alloc::align_up,
    config::BackendConfig,
    device::{BlasBuild, TriangleGeometry},
    error::BackendError,
    graph::{BufferUsageToken, CommandRecorder, ComputePass, RenderGraph},
    resources::{format_size, AccelerationStructureHandle, BufferHandle, BufferUsage, ResourceAllocator},
};

const BLAS_LABEL_COLOR: [f32; 4] = [0.6, 0.2, 0.8, 1.0];

/// Indexed triangle list living in device buffers.
#[derive(Clone, Copy, Debug)]
pub struct BlasGeometry {
    pub vertex_buffer: BufferHandle,
    pub vertex_offset: vk::DeviceSize,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub vertex_count: u32,
    pub index_buffer: BufferHandle,
    pub index_offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
    pub triangle_count: u32,
    pub opaque: bool,
}

impl BlasGeometry {
    fn resolve(&self, resources: &ResourceAllocator) -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: resources.buffer(self.vertex_buffer).address + self.vertex_offset,
            vertex_stride: self.vertex_stride,
            vertex_format: self.vertex_format,
            max_vertex: self.vertex_count.saturating_sub(1),
            index_address: resources.buffer(self.index_buffer).address + self.index_offset,
            index_type: self.index_type,
            primitive_count: self.triangle_count,
            opaque: self.opaque,
        }
    }
}

struct ResolvedBuild {
    destination: vk::AccelerationStructureKHR,
    backing: BufferHandle,
    inputs: [BufferHandle; 2],
    geometry: TriangleGeometry,
    scratch_size: vk::DeviceSize,
}

/// Bottom-level builds requested since the last flush. Builds are independent of each other, so
/// a batch of them shares one scratch buffer and one native build call.
pub struct BlasBuildQueue {
    pending: Vec<(AccelerationStructureHandle, BlasGeometry)>,
    batch_size: usize,
    max_scratch_size: vk::DeviceSize,
}

impl BlasBuildQueue {
    pub fn new(config: &BackendConfig) -> BlasBuildQueue {
        BlasBuildQueue {
            pending: vec![],
            batch_size: config.blas_batch_size.max(1),
            max_scratch_size: config.max_blas_scratch_size,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// `structure` must be large enough for `geometry`, see [`BlasBuildQueue::create_and_enqueue`].
    pub fn enqueue(&mut self, structure: AccelerationStructureHandle, geometry: BlasGeometry) {
        self.pending.push((structure, geometry));
    }

    /// Creates a bottom-level structure sized for `geometry` and queues its build.
    pub fn create_and_enqueue(
        &mut self,
        resources: &mut ResourceAllocator,
        name: &str,
        geometry: BlasGeometry,
    ) -> Result<AccelerationStructureHandle, BackendError> {
        let sizes = resources.device().blas_build_sizes(&geometry.resolve(resources));
        let structure = resources.create_acceleration_structure(
            name,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.acceleration_structure_size,
        )?;
        self.enqueue(structure, geometry);
        Ok(structure)
    }

    /// Adds one pass per batch to `graph` and returns the number of batches. Scratch buffers are
    /// released once the graph's frame slot comes around again.
    pub fn flush_pending_builds<'g>(
        &mut self,
        graph: &mut RenderGraph<'g>,
        resources: &mut ResourceAllocator,
    ) -> Result<usize, BackendError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        scope!("acceleration_structures", "flush_pending_builds");

        let device = resources.device().clone();
        let alignment = device
            .properties()
            .min_acceleration_structure_scratch_offset_alignment
            .max(1);

        let requests = self
            .pending
            .drain(..)
            .map(|(structure, geometry)| {
                let native = resources.acceleration_structure(structure);
                let triangles = geometry.resolve(resources);
                let sizes = device.blas_build_sizes(&triangles);
                ResolvedBuild {
                    destination: native.handle,
                    backing: native.buffer,
                    inputs: [geometry.vertex_buffer, geometry.index_buffer],
                    geometry: triangles,
                    scratch_size: align_up(sizes.build_scratch_size.max(1), alignment),
                }
            })
            .collect_vec();

        let max_scratch = requests
            .iter()
            .map(|request| request.scratch_size)
            .max()
            .unwrap_or(alignment);
        let batch_size = self
            .batch_size
            .min((self.max_scratch_size / max_scratch).max(1) as usize);

        let mut batches = 0;
        for (ix, batch) in requests.chunks(batch_size).enumerate() {
            let batch_max = batch.iter().map(|request| request.scratch_size).max().unwrap_or(alignment);
            let scratch_size = batch_max * batch.len() as vk::DeviceSize;
            // Buffer addresses only follow the memory requirements, leave room to align the base.
            let scratch = resources.create_buffer(
                "BLAS scratch",
                scratch_size + alignment - 1,
                BufferUsage::AccelerationStructureScratch,
            )?;
            let scratch_address = align_up(resources.buffer(scratch).address, alignment);

            let mut offset = 0;
            let mut buffers = vec![BufferUsageToken::new(
                scratch,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            )];
            let builds = batch
                .iter()
                .map(|request| {
                    let build = BlasBuild {
                        destination: request.destination,
                        geometry: request.geometry,
                        scratch_address: scratch_address + offset,
                    };
                    trace!(offset, size = request.scratch_size, "blas scratch region");
                    offset += request.scratch_size;

                    buffers.push(BufferUsageToken::new(
                        request.backing,
                        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                    ));
                    buffers.extend(request.inputs.iter().map(|&input| {
                        BufferUsageToken::new(
                            input,
                            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                            vk::AccessFlags2::SHADER_READ,
                        )
                    }));
                    build
                })
                .collect::<SmallVec<[BlasBuild; 8]>>();
            debug_assert!(offset <= scratch_size);

            graph.begin_label(&format!("BLAS batch {ix}"), BLAS_LABEL_COLOR);
            graph.add_pass(ComputePass {
                name: "Build BLAS",
                buffers,
                textures: vec![],
                descriptor_sets: vec![],
                execute: Box::new(move |recorder: &mut CommandRecorder<'_>| {
                    recorder.build_acceleration_structures(&builds)
                }),
            });
            graph.end_label();
            resources.destroy_buffer(scratch);

            debug!(
                batch = ix,
                builds = batch.len(),
                scratch = %format_size(scratch_size),
                "queued blas batch"
            );
            batches += 1;
        }

        Ok(batches)
    }
}
