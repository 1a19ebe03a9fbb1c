use ash::vk;
use tracing::{debug, trace};

use crate::renderer::{
    alloc::{VirtualAllocation, VirtualBlock},
    device::DoubleBuffered,
    error::BackendError,
    resources::{format_size, BufferHandle, BufferUsage, ResourceAllocator},
    systems::acceleration_structures::BlasGeometry,
    upload::{BufferUploadJob, UploadQueue},
};

const VERTEX_ALIGNMENT: vk::DeviceSize = 16;

/// Vertex ranges start on a whole vertex so the first vertex can be addressed by index, and stay
/// 16 byte aligned for the upload copies.
fn vertex_alignment(stride: vk::DeviceSize) -> vk::DeviceSize {
    let (mut a, mut b) = (VERTEX_ALIGNMENT, stride.max(1));
    while b != 0 {
        (a, b) = (b, a % b);
    }
    VERTEX_ALIGNMENT / a * stride.max(1)
}

fn index_size(index_type: vk::IndexType) -> vk::DeviceSize {
    match index_type {
        vk::IndexType::UINT16 => 2,
        vk::IndexType::UINT8_EXT => 1,
        _ => 4,
    }
}

/// Ranges of one mesh inside the shared vertex and index buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshAllocation {
    pub vertices: VirtualAllocation,
    pub indices: VirtualAllocation,
    pub vertex_stride: vk::DeviceSize,
    pub index_type: vk::IndexType,
}

impl MeshAllocation {
    pub fn vertex_count(&self) -> u32 {
        (self.vertices.size / self.vertex_stride) as u32
    }

    pub fn index_count(&self) -> u32 {
        (self.indices.size / index_size(self.index_type)) as u32
    }

    /// Index of the first index, for indexed draws against the shared index buffer.
    pub fn first_index(&self) -> u32 {
        (self.indices.offset / index_size(self.index_type)) as u32
    }
}

/// Fixed-capacity vertex and index buffers shared by every mesh.
pub struct MeshStorage {
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    vertex_block: VirtualBlock,
    index_block: VirtualBlock,
    pending_frees: DoubleBuffered<Vec<(u64, MeshAllocation)>>,
    frame_number: u64,
}

impl MeshStorage {
    pub fn new(
        resources: &mut ResourceAllocator,
        vertex_capacity: vk::DeviceSize,
        index_capacity: vk::DeviceSize,
        frames_in_flight: usize,
    ) -> Result<MeshStorage, BackendError> {
        let vertex_buffer = resources.create_buffer("Mesh storage vertices", vertex_capacity, BufferUsage::Vertex)?;
        let index_buffer = match resources.create_buffer("Mesh storage indices", index_capacity, BufferUsage::Index) {
            Ok(buffer) => buffer,
            Err(error) => {
                resources.destroy_buffer(vertex_buffer);
                return Err(error);
            }
        };
        debug!(
            vertices = %format_size(vertex_capacity),
            indices = %format_size(index_capacity),
            "created mesh storage"
        );

        Ok(MeshStorage {
            vertex_buffer,
            index_buffer,
            vertex_block: VirtualBlock::new(vertex_capacity),
            index_block: VirtualBlock::new(index_capacity),
            pending_frees: DoubleBuffered::new(frames_in_flight, |_| vec![]),
            frame_number: 0,
        })
    }

    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    pub fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    pub fn live_meshes(&self) -> usize {
        self.vertex_block.live_allocations()
    }

    pub fn free_vertex_bytes(&self) -> vk::DeviceSize {
        self.vertex_block.free_bytes()
    }

    /// Carves ranges for the mesh and queues uploads of its data into them.
    pub fn add_mesh(
        &mut self,
        uploads: &mut UploadQueue,
        vertices: &[u8],
        vertex_stride: vk::DeviceSize,
        indices: &[u8],
        index_type: vk::IndexType,
    ) -> Result<MeshAllocation, BackendError> {
        debug_assert_eq!(vertices.len() as vk::DeviceSize % vertex_stride, 0);
        debug_assert_eq!(indices.len() as vk::DeviceSize % index_size(index_type), 0);

        let vertex_range = self
            .vertex_block
            .allocate(vertices.len() as vk::DeviceSize, vertex_alignment(vertex_stride))?;
        let index_range = match self
            .index_block
            .allocate(indices.len() as vk::DeviceSize, index_size(index_type))
        {
            Ok(range) => range,
            Err(error) => {
                self.vertex_block.free(vertex_range);
                return Err(error);
            }
        };

        uploads.enqueue_buffer(BufferUploadJob {
            buffer: self.vertex_buffer,
            dest_offset: vertex_range.offset,
            data: vertices.to_vec(),
        });
        uploads.enqueue_buffer(BufferUploadJob {
            buffer: self.index_buffer,
            dest_offset: index_range.offset,
            data: indices.to_vec(),
        });
        trace!(
            vertex_offset = vertex_range.offset,
            index_offset = index_range.offset,
            "added mesh"
        );

        Ok(MeshAllocation {
            vertices: vertex_range,
            indices: index_range,
            vertex_stride,
            index_type,
        })
    }

    /// The ranges stay reserved until this frame slot comes around again.
    pub fn free_mesh(&mut self, mesh: MeshAllocation) {
        self.pending_frees
            .current_mut(self.frame_number)
            .push((self.frame_number, mesh));
    }

    /// Call once per frame after the frame's fence was waited on.
    pub fn begin_frame(&mut self, frame_number: u64) {
        self.frame_number = frame_number;
        let retired = frame_number.checked_sub(self.pending_frees.len() as u64);
        let pending = std::mem::take(self.pending_frees.current_mut(frame_number));
        for (epoch, mesh) in pending {
            debug_assert!(retired.map_or(false, |retired| epoch <= retired));
            self.vertex_block.free(mesh.vertices);
            self.index_block.free(mesh.indices);
        }
    }

    pub fn blas_geometry(&self, mesh: &MeshAllocation, vertex_format: vk::Format) -> BlasGeometry {
        BlasGeometry {
            vertex_buffer: self.vertex_buffer,
            vertex_offset: mesh.vertices.offset,
            vertex_stride: mesh.vertex_stride,
            vertex_format,
            vertex_count: mesh.vertex_count(),
            index_buffer: self.index_buffer,
            index_offset: mesh.indices.offset,
            index_type: mesh.index_type,
            triangle_count: mesh.index_count() / 3,
            opaque: true,
        }
    }

    pub fn destroy(self, resources: &mut ResourceAllocator) {
        resources.destroy_buffer(self.vertex_buffer);
        resources.destroy_buffer(self.index_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{config::BackendConfig, device::test_device::TestDevice};

    fn storage(resources: &mut ResourceAllocator) -> MeshStorage {
        MeshStorage::new(resources, 1024, 256, 2).unwrap()
    }

    #[test]
    fn meshes_get_disjoint_ranges_and_uploads() {
        let device = TestDevice::new();
        let mut resources = ResourceAllocator::new(device.clone(), &BackendConfig::default());
        let mut meshes = storage(&mut resources);
        let mut uploads = UploadQueue::default();

        let a = meshes
            .add_mesh(&mut uploads, &[1; 36], 12, &[0; 12], vk::IndexType::UINT32)
            .unwrap();
        let b = meshes
            .add_mesh(&mut uploads, &[2; 24], 12, &[0; 6], vk::IndexType::UINT16)
            .unwrap();

        assert_eq!(a.vertex_count(), 3);
        assert_eq!(a.index_count(), 3);
        assert!(b.vertices.offset >= a.vertices.offset + a.vertices.size);
        // Whole 12 byte vertices, 16 byte aligned.
        assert_eq!(b.vertices.offset, 48);
        assert_eq!(b.vertices.offset % 12, 0);
        assert_eq!(b.vertices.offset % VERTEX_ALIGNMENT, 0);
        assert_eq!(b.indices.offset % 2, 0);
        assert_eq!(b.first_index() as u64 * 2, b.indices.offset);
        assert_eq!(uploads.pending_bytes(), 36 + 12 + 24 + 6);

        let geometry = meshes.blas_geometry(&a, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(geometry.triangle_count, 1);
        assert_eq!(geometry.vertex_buffer, meshes.vertex_buffer());
    }

    #[test]
    fn vertex_alignment_covers_the_stride() {
        assert_eq!(vertex_alignment(12), 48);
        assert_eq!(vertex_alignment(32), 32);
        assert_eq!(vertex_alignment(8), 16);
        assert_eq!(vertex_alignment(20), 80);
    }

    #[test]
    fn exhaustion_rolls_back_the_vertex_range() {
        let device = TestDevice::new();
        let mut resources = ResourceAllocator::new(device.clone(), &BackendConfig::default());
        let mut meshes = storage(&mut resources);
        let mut uploads = UploadQueue::default();

        let error = meshes
            .add_mesh(&mut uploads, &[0; 48], 12, &[0; 512], vk::IndexType::UINT32)
            .unwrap_err();
        assert!(matches!(error, BackendError::CapacityExhausted { requested: 512, .. }));
        assert_eq!(meshes.live_meshes(), 0);
        assert_eq!(meshes.free_vertex_bytes(), 1024);
        assert!(uploads.is_empty());
    }

    #[test]
    fn freed_ranges_return_when_the_slot_comes_around() {
        let device = TestDevice::new();
        let mut resources = ResourceAllocator::new(device.clone(), &BackendConfig::default());
        let mut meshes = storage(&mut resources);
        let mut uploads = UploadQueue::default();

        meshes.begin_frame(0);
        let mesh = meshes
            .add_mesh(&mut uploads, &[0; 1024], 16, &[0; 12], vk::IndexType::UINT32)
            .unwrap();
        meshes.free_mesh(mesh);

        meshes.begin_frame(1);
        assert_eq!(meshes.free_vertex_bytes(), 0);
        assert!(meshes
            .add_mesh(&mut uploads, &[0; 16], 16, &[0; 12], vk::IndexType::UINT32)
            .is_err());

        meshes.begin_frame(2);
        assert_eq!(meshes.free_vertex_bytes(), 1024);
        assert_eq!(meshes.live_meshes(), 0);
    }
}
