// Staging uploads
//
// Device-local data always takes the same route: fill a host-visible
// staging buffer, copy it across with a one-shot command buffer, wait, and
// release the staging buffer. Images add a layout transition on either side
// of the copy. `UploadTarget` is the seam between that protocol and the
// Vulkan calls that carry it out.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;
use super::image::{record_transition, transition_masks, GpuImage};
use super::{CommandPool, GpuBuffer, VulkanDevice};

pub trait UploadTarget {
    type Buffer;
    type Image;

    fn create_staging(&mut self, size: vk::DeviceSize) -> Result<Self::Buffer>;

    fn write(&mut self, buffer: &mut Self::Buffer, data: &[u8]) -> Result<()>;

    fn create_device_local(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self::Buffer>;

    /// Copy `size` bytes and block until the copy has completed
    fn copy(&mut self, src: &Self::Buffer, dst: &Self::Buffer, size: vk::DeviceSize) -> Result<()>;

    /// Device-local sampled image in UNDEFINED layout
    fn create_image(&mut self, extent: vk::Extent2D, format: vk::Format) -> Result<Self::Image>;

    /// Record and wait for a layout transition barrier
    fn transition(
        &mut self,
        image: &Self::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()>;

    /// Copy tightly packed texels into an image in TRANSFER_DST_OPTIMAL and wait
    fn copy_to_image(
        &mut self,
        src: &Self::Buffer,
        dst: &Self::Image,
        extent: vk::Extent2D,
    ) -> Result<()>;
}

/// Create a device-local buffer holding `data`
pub fn upload_buffer<T: UploadTarget>(
    target: &mut T,
    usage: vk::BufferUsageFlags,
    data: &[u8],
) -> Result<T::Buffer> {
    if data.is_empty() {
        anyhow::bail!("Refusing to upload an empty buffer");
    }
    let size = data.len() as vk::DeviceSize;

    let mut staging = target.create_staging(size)?;
    target.write(&mut staging, data)?;

    let buffer = target.create_device_local(size, usage | vk::BufferUsageFlags::TRANSFER_DST)?;
    target.copy(&staging, &buffer, size)?;

    // The copy has completed, staging can go
    drop(staging);
    Ok(buffer)
}

/// Create a shader-readable image holding `texels`
pub fn upload_image<T: UploadTarget>(
    target: &mut T,
    extent: vk::Extent2D,
    format: vk::Format,
    texels: &[u8],
) -> Result<T::Image> {
    if texels.is_empty() || extent.width == 0 || extent.height == 0 {
        anyhow::bail!("Refusing to upload an empty image");
    }

    let mut staging = target.create_staging(texels.len() as vk::DeviceSize)?;
    target.write(&mut staging, texels)?;

    let image = target.create_image(extent, format)?;
    target.transition(
        &image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )?;
    target.copy_to_image(&staging, &image, extent)?;
    target.transition(
        &image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )?;

    drop(staging);
    Ok(image)
}

/// Device-local buffer with a persistent staging twin, for data rewritten
/// at runtime (the per-frame uniform block)
pub struct StagedBuffer<B> {
    staging: B,
    pub buffer: B,
    size: vk::DeviceSize,
}

impl<B> StagedBuffer<B> {
    pub fn new<T>(target: &mut T, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<Self>
    where
        T: UploadTarget<Buffer = B>,
    {
        Ok(Self {
            staging: target.create_staging(size)?,
            buffer: target.create_device_local(size, usage | vk::BufferUsageFlags::TRANSFER_DST)?,
            size,
        })
    }

    pub fn update<T>(&mut self, target: &mut T, data: &[u8]) -> Result<()>
    where
        T: UploadTarget<Buffer = B>,
    {
        if data.len() as vk::DeviceSize != self.size {
            anyhow::bail!("Expected {} bytes, got {}", self.size, data.len());
        }
        target.write(&mut self.staging, data)?;
        target.copy(&self.staging, &self.buffer, self.size)
    }
}

/// Carries out uploads on the graphics queue
pub struct Uploader<'a> {
    pub device: &'a Arc<VulkanDevice>,
    pub commands: &'a CommandPool,
}

impl<'a> Uploader<'a> {
    pub fn new(device: &'a Arc<VulkanDevice>, commands: &'a CommandPool) -> Self {
        Self { device, commands }
    }
}

impl UploadTarget for Uploader<'_> {
    type Buffer = GpuBuffer;
    type Image = GpuImage;

    fn create_staging(&mut self, size: vk::DeviceSize) -> Result<GpuBuffer> {
        GpuBuffer::staging(self.device, size)
    }

    fn write(&mut self, buffer: &mut GpuBuffer, data: &[u8]) -> Result<()> {
        buffer.write(data)
    }

    fn create_device_local(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        GpuBuffer::new(self.device, "device-local", size, usage, gpu_allocator::MemoryLocation::GpuOnly)
    }

    fn copy(&mut self, src: &GpuBuffer, dst: &GpuBuffer, size: vk::DeviceSize) -> Result<()> {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        self.commands.one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
        })
    }

    fn create_image(&mut self, extent: vk::Extent2D, format: vk::Format) -> Result<GpuImage> {
        GpuImage::new(
            self.device,
            "texture",
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )
    }

    fn transition(
        &mut self,
        image: &GpuImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let masks = transition_masks(old, new)?;
        self.commands.one_shot(|device, cmd| unsafe {
            record_transition(device, cmd, image.image, old, new, &masks);
        })
    }

    fn copy_to_image(
        &mut self,
        src: &GpuBuffer,
        dst: &GpuImage,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .build();
        self.commands.one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                src.buffer,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        CreateStaging(usize),
        CreateDeviceLocal(usize, vk::BufferUsageFlags),
        Write(usize),
        Copy { src: usize, dst: usize },
        CreateImage(usize, vk::Format),
        Transition(usize, vk::ImageLayout, vk::ImageLayout),
        CopyToImage { src: usize, dst: usize },
        Released(usize),
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    /// Host memory standing in for a GPU allocation. The copy only gets a
    /// shared reference to its destination, as with a real command buffer.
    struct MockBuffer {
        id: usize,
        host_visible: bool,
        bytes: RefCell<Vec<u8>>,
        log: Log,
    }

    impl Drop for MockBuffer {
        fn drop(&mut self) {
            self.log.borrow_mut().push(Event::Released(self.id));
        }
    }

    /// Tracks the layout the way the driver would, so a copy or transition
    /// from the wrong layout fails
    struct MockImage {
        id: usize,
        layout: RefCell<vk::ImageLayout>,
        texels: RefCell<Vec<u8>>,
    }

    #[derive(Default)]
    struct MockTarget {
        next_id: usize,
        log: Log,
    }

    impl MockTarget {
        fn buffer(&mut self, size: vk::DeviceSize, host_visible: bool) -> MockBuffer {
            let id = self.next_id;
            self.next_id += 1;
            MockBuffer {
                id,
                host_visible,
                bytes: RefCell::new(vec![0xCD; size as usize]),
                log: self.log.clone(),
            }
        }

        fn events(&self) -> Vec<Event> {
            self.log.borrow().clone()
        }
    }

    impl UploadTarget for MockTarget {
        type Buffer = MockBuffer;
        type Image = MockImage;

        fn create_staging(&mut self, size: vk::DeviceSize) -> Result<MockBuffer> {
            let buffer = self.buffer(size, true);
            self.log.borrow_mut().push(Event::CreateStaging(buffer.id));
            Ok(buffer)
        }

        fn write(&mut self, buffer: &mut MockBuffer, data: &[u8]) -> Result<()> {
            anyhow::ensure!(buffer.host_visible, "device-local memory is not mappable");
            buffer.bytes.get_mut()[..data.len()].copy_from_slice(data);
            self.log.borrow_mut().push(Event::Write(buffer.id));
            Ok(())
        }

        fn create_device_local(
            &mut self,
            size: vk::DeviceSize,
            usage: vk::BufferUsageFlags,
        ) -> Result<MockBuffer> {
            let buffer = self.buffer(size, false);
            self.log.borrow_mut().push(Event::CreateDeviceLocal(buffer.id, usage));
            Ok(buffer)
        }

        fn copy(&mut self, src: &MockBuffer, dst: &MockBuffer, size: vk::DeviceSize) -> Result<()> {
            let size = size as usize;
            dst.bytes.borrow_mut()[..size].copy_from_slice(&src.bytes.borrow()[..size]);
            self.log.borrow_mut().push(Event::Copy { src: src.id, dst: dst.id });
            Ok(())
        }

        fn create_image(&mut self, _extent: vk::Extent2D, format: vk::Format) -> Result<MockImage> {
            let id = self.next_id;
            self.next_id += 1;
            self.log.borrow_mut().push(Event::CreateImage(id, format));
            Ok(MockImage {
                id,
                layout: RefCell::new(vk::ImageLayout::UNDEFINED),
                texels: RefCell::new(Vec::new()),
            })
        }

        fn transition(
            &mut self,
            image: &MockImage,
            old: vk::ImageLayout,
            new: vk::ImageLayout,
        ) -> Result<()> {
            anyhow::ensure!(*image.layout.borrow() == old, "image is not in {:?}", old);
            crate::backend::image::transition_masks(old, new)?;
            *image.layout.borrow_mut() = new;
            self.log.borrow_mut().push(Event::Transition(image.id, old, new));
            Ok(())
        }

        fn copy_to_image(
            &mut self,
            src: &MockBuffer,
            dst: &MockImage,
            extent: vk::Extent2D,
        ) -> Result<()> {
            anyhow::ensure!(
                *dst.layout.borrow() == vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                "copy into an image outside TRANSFER_DST_OPTIMAL"
            );
            let size = (extent.width * extent.height * 4) as usize;
            *dst.texels.borrow_mut() = src.bytes.borrow()[..size].to_vec();
            self.log.borrow_mut().push(Event::CopyToImage { src: src.id, dst: dst.id });
            Ok(())
        }
    }

    #[test]
    fn upload_round_trip_is_bit_identical() {
        let mut target = MockTarget::default();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let buffer = upload_buffer(&mut target, vk::BufferUsageFlags::VERTEX_BUFFER, &data).unwrap();

        assert_eq!(*buffer.bytes.borrow(), data);
    }

    #[test]
    fn staging_is_released_after_copy_completes() {
        let mut target = MockTarget::default();

        let buffer = upload_buffer(&mut target, vk::BufferUsageFlags::INDEX_BUFFER, &[1, 2, 3, 4]).unwrap();

        assert_eq!(
            target.events(),
            vec![
                Event::CreateStaging(0),
                Event::Write(0),
                Event::CreateDeviceLocal(
                    1,
                    vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
                ),
                Event::Copy { src: 0, dst: 1 },
                Event::Released(0),
            ]
        );
        assert_eq!(buffer.id, 1);
    }

    #[test]
    fn empty_upload_is_rejected() {
        let mut target = MockTarget::default();
        assert!(upload_buffer(&mut target, vk::BufferUsageFlags::VERTEX_BUFFER, &[]).is_err());
        assert!(target.events().is_empty());
    }

    #[test]
    fn staged_buffer_reuses_its_staging_allocation() {
        let mut target = MockTarget::default();
        let mut staged = StagedBuffer::new(&mut target, 8, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();

        staged.update(&mut target, &[1; 8]).unwrap();
        staged.update(&mut target, &[7, 6, 5, 4, 3, 2, 1, 0]).unwrap();

        assert_eq!(*staged.buffer.bytes.borrow(), vec![7, 6, 5, 4, 3, 2, 1, 0]);
        let creations = target
            .events()
            .iter()
            .filter(|e| matches!(e, Event::CreateStaging(_) | Event::CreateDeviceLocal(..)))
            .count();
        assert_eq!(creations, 2);
    }

    #[test]
    fn staged_buffer_rejects_wrong_size() {
        let mut target = MockTarget::default();
        let mut staged = StagedBuffer::new(&mut target, 8, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        assert!(staged.update(&mut target, &[0; 4]).is_err());
    }

    #[test]
    fn texture_upload_order() {
        let mut target = MockTarget::default();
        let extent = vk::Extent2D { width: 2, height: 2 };
        let texels: Vec<u8> = (0..16).collect();

        let image = upload_image(&mut target, extent, vk::Format::R8G8B8A8_SRGB, &texels).unwrap();

        assert_eq!(
            target.events(),
            vec![
                Event::CreateStaging(0),
                Event::Write(0),
                Event::CreateImage(1, vk::Format::R8G8B8A8_SRGB),
                Event::Transition(
                    1,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL
                ),
                Event::CopyToImage { src: 0, dst: 1 },
                Event::Transition(
                    1,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                ),
                Event::Released(0),
            ]
        );
        assert_eq!(*image.layout.borrow(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(*image.texels.borrow(), texels);
    }

    #[test]
    fn empty_image_is_rejected() {
        let mut target = MockTarget::default();
        let extent = vk::Extent2D { width: 0, height: 4 };
        assert!(upload_image(&mut target, extent, vk::Format::R8G8B8A8_SRGB, &[]).is_err());
        assert!(target.events().is_empty());
    }
}
