use ash::extensions::khr;
use ash::{prelude::VkResult, vk};
use std::{ffi::CStr, ops::Deref, sync::Arc};

pub mod accel_struct;
pub mod capability;
pub mod command;
mod debug;
pub use debug::DebugUtilsMessenger;
pub mod descriptor;
pub mod fence;
pub mod queue;
pub mod resources;

use resources::{AccelStructHandle, ResourceRegistry};

pub struct Instance {
    entry: Arc<ash::Entry>,
    instance: ash::Instance,
    debug_utils: DebugUtilsMessenger,
}

impl Instance {
    pub fn create(entry: Arc<ash::Entry>, info: &vk::InstanceCreateInfo) -> VkResult<Self> {
        // Safety: No Host Syncronization rules for vkCreateInstance.
        let mut instance = unsafe { entry.create_instance(info, None)? };
        let debug_utils = DebugUtilsMessenger::new(&entry, &mut instance)?;
        tracing::info!(instance = ?instance.handle(), "create instance");
        Ok(Instance {
            entry,
            instance,
            debug_utils,
        })
    }
    pub fn entry(&self) -> &Arc<ash::Entry> {
        &self.entry
    }
    pub fn debug_utils(&self) -> &DebugUtilsMessenger {
        &self.debug_utils
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.instance.handle(), "drop instance");
        // Safety: Host Syncronization rule for vkDestroyInstance:
        // - Host access to instance must be externally synchronized.
        // - Host access to all VkPhysicalDevice objects enumerated from instance must be externally synchronized.
        // We have &mut self and therefore exclusive control on instance.
        // Device retains an Arc to Instance, so no device created from this instance is alive.
        unsafe {
            self.debug_utils
                .debug_utils
                .destroy_debug_utils_messenger(self.debug_utils.messenger, None);
            self.instance.destroy_instance(None);
        }
    }
}

pub trait HasDevice {
    fn device(&self) -> &Arc<Device>;
}

/// A logical device with the extension loaders the command core uses. A loader is only
/// present when its extension was enabled at device creation.
pub struct Device {
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    accel_struct: Option<khr::AccelerationStructure>,
    ray_tracing: Option<khr::RayTracingPipeline>,
}

impl Device {
    pub fn create(
        instance: Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        info: &vk::DeviceCreateInfo,
    ) -> VkResult<Arc<Self>> {
        // Safety: No Host Syncronization rules for vkCreateDevice.
        // Device retains a reference to Instance, ensuring that Instance is dropped later than Device.
        let device = unsafe { instance.create_device(physical_device, info, None)? };
        // Safety: the extension names were provided by the caller as valid, nul-terminated
        // strings for the duration of vkCreateDevice, which outlives this read.
        let enabled: Vec<&CStr> = unsafe {
            (0..info.enabled_extension_count as usize)
                .map(|i| CStr::from_ptr(*info.pp_enabled_extension_names.add(i)))
                .collect()
        };
        let accel_struct = enabled
            .contains(&khr::AccelerationStructure::name())
            .then(|| khr::AccelerationStructure::new(&instance, &device));
        let ray_tracing = enabled
            .contains(&khr::RayTracingPipeline::name())
            .then(|| khr::RayTracingPipeline::new(&instance, &device));
        tracing::info!(
            device = ?device.handle(),
            acceleration_structure = accel_struct.is_some(),
            ray_tracing = ray_tracing.is_some(),
            "create device"
        );
        Ok(Arc::new(Self {
            instance,
            physical_device,
            device,
            accel_struct,
            ray_tracing,
        }))
    }
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }
    pub fn accel_struct_loader(&self) -> Option<&khr::AccelerationStructure> {
        self.accel_struct.as_ref()
    }
    pub fn ray_tracing_loader(&self) -> Option<&khr::RayTracingPipeline> {
        self.ray_tracing.as_ref()
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        // Safety: Host Syncronization rule for vkDestroyDevice:
        // - Host access to device must be externally synchronized.
        // - Host access to all VkQueue objects created from device must be externally synchronized
        // We have &mut self and therefore exclusive control on device.
        // VkQueue objects may not exist at this point, because Queue retains an Arc to Device.
        // If there still exist a Queue, the Device wouldn't be dropped.
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextOptions {
    /// Emit barriers through `vkCmdPipelineBarrier2`. When off, the legacy split-stage
    /// path is used.
    pub synchronization2: bool,
    /// Forward debug labels to the native command buffer.
    pub debug_labels: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            synchronization2: true,
            debug_labels: cfg!(debug_assertions),
        }
    }
}

/// The graphics context threaded through recording and submission.
///
/// Recording borrows it shared, so any number of threads may record at once. Submission
/// borrows it exclusively: the state table only ever observes transitions in submission
/// order.
#[derive(Default)]
pub struct Context {
    pub(crate) resources: ResourceRegistry,
    pub(crate) options: ContextOptions,
}

impl Context {
    pub fn new(options: ContextOptions) -> Self {
        tracing::info!(?options, "create context");
        Self {
            resources: ResourceRegistry::new(),
            options,
        }
    }
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }
    pub fn resources_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.resources
    }
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// Size `accel_struct` compacts to. `None` until the build that requested compaction
    /// has completed on the device, or if no compaction was requested.
    pub fn compacted_size(&self, accel_struct: AccelStructHandle) -> VkResult<Option<vk::DeviceSize>> {
        match self
            .resources
            .accel_struct(accel_struct)
            .and_then(|a| a.pending_compaction())
        {
            Some(pending) => pending.compacted_size(),
            None => Ok(None),
        }
    }
}
