use ash::extensions::ext;
use ash::{prelude::VkResult, vk};
use std::ffi::{CStr, CString};

/// Validation-layer messages routed into `tracing`, plus the command buffer label calls
/// of `VK_EXT_debug_utils`.
pub struct DebugUtilsMessenger {
    pub(crate) debug_utils: ext::DebugUtils,
    pub(crate) messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugUtilsMessenger {
    pub fn new(entry: &ash::Entry, instance: &mut ash::Instance) -> VkResult<Self> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let messenger = unsafe {
            // Safety:
            // The application must ensure that vkCreateDebugUtilsMessengerEXT is not executed in parallel
            // with any Vulkan command that is also called with instance or child of instance as the dispatchable argument.
            // We do this by taking a mutable reference to Instance.
            debug_utils.create_debug_utils_messenger(
                &vk::DebugUtilsMessengerCreateInfoEXT::builder()
                    .message_severity(
                        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                    )
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(debug_utils_callback)),
                None,
            )?
        };
        Ok(Self {
            debug_utils,
            messenger,
        })
    }

    /// # Safety
    /// `command_buffer` must be in the recording state and externally synchronized.
    pub(crate) unsafe fn begin_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        let name = label_name(name);
        self.debug_utils.cmd_begin_debug_utils_label(
            command_buffer,
            &vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color),
        );
    }

    /// # Safety
    /// `command_buffer` must be in the recording state, externally synchronized, and
    /// have an open label region.
    pub(crate) unsafe fn end_label(&self, command_buffer: vk::CommandBuffer) {
        self.debug_utils.cmd_end_debug_utils_label(command_buffer);
    }

    /// # Safety
    /// `command_buffer` must be in the recording state and externally synchronized.
    pub(crate) unsafe fn insert_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        let name = label_name(name);
        self.debug_utils.cmd_insert_debug_utils_label(
            command_buffer,
            &vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color),
        );
    }
}

// Interior nul bytes would truncate the label; drop them.
fn label_name(name: &str) -> CString {
    CString::new(name.replace('\0', "")).unwrap_or_default()
}

unsafe extern "system" fn debug_utils_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = &*callback_data;
    // The strings are only valid for the duration of the callback.
    let message_id_name = if callback_data.p_message_id_name.is_null() {
        CStr::from_bytes_with_nul_unchecked(b"\0")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name)
    };
    let message_id_number = callback_data.message_id_number;
    let message = if callback_data.p_message.is_null() {
        CStr::from_bytes_with_nul_unchecked(b"\0")
    } else {
        CStr::from_ptr(callback_data.p_message)
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(?types, message = ?message_id_name, id = message_id_number, detail = ?message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(?types, message = ?message_id_name, id = message_id_number, detail = ?message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(?types, message = ?message_id_name, id = message_id_number, detail = ?message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::debug!(?types, message = ?message_id_name, id = message_id_number, detail = ?message)
        }
        _ => tracing::trace!(?types, message = ?message_id_name, id = message_id_number, detail = ?message),
    };

    // The callback returns a VkBool32, which is interpreted in a layer-specified manner.
    // The application should always return VK_FALSE. The VK_TRUE value is reserved for use in layer development.
    vk::FALSE
}
