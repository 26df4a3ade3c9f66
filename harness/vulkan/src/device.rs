//! Vulkan instance creation, physical device selection, and logical device setup.
//!
//! [`DeviceContext`] owns every device-level object the benchmark needs: the
//! instance (plus an optional validation messenger), the selected physical
//! device and its capability tables, the logical device, one compute queue,
//! the single completion fence, and the command pool.

use std::ffi::{c_void, CStr};
use std::time::{Duration, Instant};

use ash::vk;
use tracing::{debug, error, info, trace, warn};

use crate::error::{BenchError, Result};

/// Upper bound on a single fence wait.
pub const FENCE_TIMEOUT: Duration = Duration::from_secs(100);

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Whether the Khronos validation layer and its message forwarding are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiagnosticsMode {
    #[default]
    Disabled,
    Validation,
}

type DebugMessenger = (ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT);

/// Manages a Vulkan instance, physical device, logical device, compute queue,
/// completion fence and command pool.
pub struct DeviceContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) device: ash::Device,
    queue: vk::Queue,
    fence: vk::Fence,
    pub(crate) command_pool: vk::CommandPool,
}

impl DeviceContext {
    /// Initialize Vulkan: create instance, pick the GPU at `device_index`,
    /// create the logical device, fence and command pool.
    pub fn new(device_index: usize, diagnostics: DiagnosticsMode) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BenchError::Initialization(format!("failed to load Vulkan loader: {e}")))?;

        let instance = create_instance(&entry, diagnostics)?;
        let debug_messenger = match diagnostics {
            DiagnosticsMode::Validation => install_debug_messenger(&entry, &instance),
            DiagnosticsMode::Disabled => None,
        };

        let destroy_instance = |messenger: Option<DebugMessenger>| unsafe {
            if let Some((loader, messenger)) = messenger {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        };

        let physical_device = match select_device(&instance, device_index) {
            Ok(pd) => pd,
            Err(e) => {
                destroy_instance(debug_messenger);
                return Err(e);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        info!(
            "Using device {}: {} (vendor {:#06x}, API {}.{}.{})",
            device_index,
            device_name_of(&properties),
            properties.vendor_id,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let (device, queue_family_index) = match create_logical_device(&instance, physical_device)
        {
            Ok(d) => d,
            Err(e) => {
                destroy_instance(debug_messenger);
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let fence = match create_fence(&device) {
            Ok(f) => f,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                destroy_instance(debug_messenger);
                return Err(e);
            }
        };

        let command_pool = match create_command_pool(&device, queue_family_index) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    device.destroy_fence(fence, None);
                    device.destroy_device(None);
                }
                destroy_instance(debug_messenger);
                return Err(e);
            }
        };

        Ok(Self {
            _entry: entry,
            instance,
            debug_messenger,
            properties,
            memory_properties,
            device,
            queue,
            fence,
            command_pool,
        })
    }

    /// Return the GPU device name.
    pub fn device_name(&self) -> String {
        device_name_of(&self.properties)
    }

    /// PCI vendor id of the selected GPU.
    pub fn vendor_id(&self) -> u32 {
        self.properties.vendor_id
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// True if the completion fence is currently signaled.
    ///
    /// Between operations the fence is always observed unsignaled.
    pub fn fence_signaled(&self) -> Result<bool> {
        unsafe { self.device.get_fence_status(self.fence) }.map_err(BenchError::Submission)
    }

    /// Submit one recorded command buffer, block until the fence signals, and
    /// reset the fence.
    ///
    /// Returns the wall-clock time from just before submission to fence signal.
    pub(crate) fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<Duration> {
        ensure_unsignaled(self.fence_signaled()?)?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        let start = Instant::now();
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], self.fence)
                .map_err(BenchError::Submission)?;
        }
        let waited = unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, FENCE_TIMEOUT.as_nanos() as u64)
        };
        let elapsed = start.elapsed();
        match waited {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                return Err(BenchError::FenceTimeout {
                    timeout: FENCE_TIMEOUT,
                })
            }
            Err(e) => return Err(BenchError::Submission(e)),
        }

        unsafe { self.device.reset_fences(&[self.fence]) }.map_err(BenchError::Submission)?;
        trace!("Submission completed in {:?}", elapsed);
        Ok(elapsed)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn device_name_of(properties: &vk::PhysicalDeviceProperties) -> String {
    properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed device>".to_string())
}

/// Create the instance, enabling the validation layer and debug-utils
/// extension when diagnostics are requested.
fn create_instance(entry: &ash::Entry, diagnostics: DiagnosticsMode) -> Result<ash::Instance> {
    let validation = diagnostics == DiagnosticsMode::Validation;
    if validation {
        check_validation_support(entry)?;
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"Vulkan Transposition Test")
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"VulkanTransposition")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_0);

    let layers = [VALIDATION_LAYER.as_ptr()];
    let extensions = [ash::ext::debug_utils::NAME.as_ptr()];
    let mut debug_info = debug_messenger_info();

    let mut create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
    if validation {
        // Chaining the messenger info also reports instance creation itself.
        create_info = create_info
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions)
            .push_next(&mut debug_info);
    }

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| BenchError::Initialization(format!("vkCreateInstance failed: {e}")))?;
    debug!("Created Vulkan instance (validation: {})", validation);
    Ok(instance)
}

fn check_validation_support(entry: &ash::Entry) -> Result<()> {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .map_err(|e| BenchError::Initialization(format!("failed to enumerate layers: {e}")))?;
    let has_layer = layers
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
    if !has_layer {
        return Err(BenchError::Initialization(format!(
            "validation requested but {} is not installed",
            VALIDATION_LAYER.to_string_lossy()
        )));
    }
    info!("Found validation layer");

    let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
        .map_err(|e| BenchError::Initialization(format!("failed to enumerate extensions: {e}")))?;
    let has_debug_utils = extensions.iter().any(|ext| {
        ext.extension_name_as_c_str()
            .is_ok_and(|name| name == ash::ext::debug_utils::NAME)
    });
    if !has_debug_utils {
        return Err(BenchError::Initialization(format!(
            "validation requested but {} is not available",
            ash::ext::debug_utils::NAME.to_string_lossy()
        )));
    }
    Ok(())
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_validation_message))
}

/// Best effort: a messenger that cannot be installed is logged and skipped.
fn install_debug_messenger(entry: &ash::Entry, instance: &ash::Instance) -> Option<DebugMessenger> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
    match unsafe { loader.create_debug_utils_messenger(&debug_messenger_info(), None) } {
        Ok(messenger) => Some((loader, messenger)),
        Err(e) => {
            warn!("Debug messenger unavailable: {e}");
            None
        }
    }
}

unsafe extern "system" fn forward_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan::validation", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan::validation", "{message}");
    } else {
        debug!(target: "vulkan::validation", "{message}");
    }
    vk::FALSE
}

/// Pick the physical device at `index` in enumeration order.
fn select_device(instance: &ash::Instance, index: usize) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| BenchError::Initialization(format!("failed to enumerate GPUs: {e}")))?;
    checked_device_index(index, devices.len()).map(|i| devices[i])
}

/// Single-outstanding-submission rule: a fence that is still signaled means
/// the previous wait was never reset.
fn ensure_unsignaled(signaled: bool) -> Result<()> {
    if signaled {
        error!("Completion fence is still signaled; refusing to submit");
        return Err(BenchError::Submission(vk::Result::NOT_READY));
    }
    Ok(())
}

pub(crate) fn checked_device_index(index: usize, count: usize) -> Result<usize> {
    if index < count {
        Ok(index)
    } else {
        Err(BenchError::DeviceNotFound { index, count })
    }
}

/// First queue family that advertises compute and has at least one queue.
pub fn compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(ash::Device, u32)> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let queue_family_index = compute_queue_family(&families).ok_or(BenchError::NoComputeQueue)?;

    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities)];
    let features = vk::PhysicalDeviceFeatures::default();
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &device_info, None) }
        .map_err(|e| BenchError::Initialization(format!("vkCreateDevice failed: {e}")))?;
    debug!("Created logical device on queue family {}", queue_family_index);
    Ok((device, queue_family_index))
}

fn create_fence(device: &ash::Device) -> Result<vk::Fence> {
    unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
        .map_err(|e| BenchError::Initialization(format!("vkCreateFence failed: {e}")))
}

fn create_command_pool(device: &ash::Device, queue_family_index: u32) -> Result<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family_index);
    unsafe { device.create_command_pool(&info, None) }
        .map_err(|e| BenchError::Initialization(format!("vkCreateCommandPool failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn picks_first_compute_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::COMPUTE, 4),
        ];
        assert_eq!(compute_queue_family(&families), Some(1));
    }

    #[test]
    fn skips_compute_family_without_queues() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        assert_eq!(compute_queue_family(&families), Some(1));
    }

    #[test]
    fn no_compute_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        assert_eq!(compute_queue_family(&families), None);
        assert_eq!(compute_queue_family(&[]), None);
    }

    #[test]
    fn device_index_bounds() {
        assert_eq!(checked_device_index(0, 1).unwrap(), 0);
        assert!(matches!(
            checked_device_index(1, 1),
            Err(BenchError::DeviceNotFound { index: 1, count: 1 })
        ));
        assert!(matches!(
            checked_device_index(0, 0),
            Err(BenchError::DeviceNotFound { index: 0, count: 0 })
        ));
    }

    #[test]
    fn signaled_fence_blocks_submission() {
        assert!(ensure_unsignaled(false).is_ok());
        let err = ensure_unsignaled(true).unwrap_err();
        assert!(matches!(err, BenchError::Submission(vk::Result::NOT_READY)));
        assert_eq!(err.exit_code(), 8);
    }

    #[test]
    fn context_rejects_out_of_range_device() {
        // Skip if no Vulkan loader is present.
        let err = match DeviceContext::new(usize::MAX, DiagnosticsMode::Disabled) {
            Ok(_) => panic!("device index usize::MAX cannot exist"),
            Err(e) => e,
        };
        if matches!(err, BenchError::Initialization(_)) {
            return;
        }
        assert!(matches!(err, BenchError::DeviceNotFound { index: usize::MAX, .. }));
    }

    #[test]
    fn fresh_context_fence_is_unsignaled() {
        let ctx = match DeviceContext::new(0, DiagnosticsMode::Disabled) {
            Ok(c) => c,
            Err(_) => return, // skip if no GPU
        };
        assert!(!ctx.fence_signaled().unwrap());
        assert!(!ctx.device_name().is_empty());
    }
}
