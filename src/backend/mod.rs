// Backend module - Vulkan abstraction layer
//
// Thin wrapper around ash: device setup, manual buffer memory management,
// and acceleration structure builds.

pub mod buffer;
pub mod command;
pub mod device;
pub mod geometry;
pub mod raytracing;
pub mod swapchain;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
