// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash. Every handle lives in an owner that
// destroys it on drop and keeps the device alive via Arc.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod physical;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use buffer::GpuBuffer;
pub use command::CommandPool;
pub use device::VulkanDevice;
pub use swapchain::Swapchain;
