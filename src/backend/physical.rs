// Physical device selection
//
// The Vulkan queries live in device.rs; this module holds the decisions made
// from their results so they can run against synthetic descriptors.

use anyhow::Result;
use ash::vk;
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::fmt;

/// Graphics and present queue family indices. Both may name the same family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan queue families in order, keeping the earliest family for each role.
    ///
    /// `supports_present` is asked about every family with at least one queue
    /// until both roles are filled.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Self>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let index = i as u32;
            if family.queue_count == 0 {
                continue;
            }

            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }
            if indices.present.is_none() && supports_present(index)? {
                indices.present = Some(index);
            }

            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Both indices, if complete
    pub fn pair(&self) -> Option<(u32, u32)> {
        Some((self.graphics?, self.present?))
    }

    /// Distinct families, one queue create info is needed per entry
    pub fn unique(&self) -> BTreeSet<u32> {
        self.graphics.into_iter().chain(self.present).collect()
    }
}

/// What the selector needs to know about one physical device
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub geometry_shader: bool,
    pub queue_families: QueueFamilyIndices,
    pub missing_extensions: Vec<String>,
    pub format_count: usize,
    pub present_mode_count: usize,
}

/// Hard requirements a device must meet. Both default to on.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRequirements {
    pub discrete_gpu: bool,
    pub geometry_shader: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            discrete_gpu: true,
            geometry_shader: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotDiscrete(vk::PhysicalDeviceType),
    NoGeometryShader,
    IncompleteQueueFamilies(QueueFamilyIndices),
    MissingExtensions(Vec<String>),
    InadequateSwapchain { formats: usize, present_modes: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotDiscrete(ty) => write!(f, "not a discrete GPU ({:?})", ty),
            Rejection::NoGeometryShader => write!(f, "geometry shaders unsupported"),
            Rejection::IncompleteQueueFamilies(q) => write!(
                f,
                "missing queue family (graphics: {:?}, present: {:?})",
                q.graphics, q.present
            ),
            Rejection::MissingExtensions(names) => {
                write!(f, "missing device extensions: {}", names.join(", "))
            }
            Rejection::InadequateSwapchain { formats, present_modes } => write!(
                f,
                "inadequate swapchain support ({} formats, {} present modes)",
                formats, present_modes
            ),
        }
    }
}

impl DeviceCandidate {
    /// First requirement the device fails, or `None` if it is usable
    pub fn rejection(&self, requirements: &DeviceRequirements) -> Option<Rejection> {
        if requirements.discrete_gpu && self.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            return Some(Rejection::NotDiscrete(self.device_type));
        }
        if requirements.geometry_shader && !self.geometry_shader {
            return Some(Rejection::NoGeometryShader);
        }
        if !self.queue_families.is_complete() {
            return Some(Rejection::IncompleteQueueFamilies(self.queue_families));
        }
        if !self.missing_extensions.is_empty() {
            return Some(Rejection::MissingExtensions(self.missing_extensions.clone()));
        }
        if self.format_count == 0 || self.present_mode_count == 0 {
            return Some(Rejection::InadequateSwapchain {
                formats: self.format_count,
                present_modes: self.present_mode_count,
            });
        }
        None
    }
}

/// Index of the first suitable candidate. Not scored: enumeration order wins.
pub fn select_first_suitable(
    candidates: &[DeviceCandidate],
    requirements: &DeviceRequirements,
) -> Option<usize> {
    candidates.iter().position(|candidate| match candidate.rejection(requirements) {
        None => true,
        Some(reason) => {
            log::info!("Skipping GPU '{}': {}", candidate.name, reason);
            false
        }
    })
}

/// Names from `required` that do not appear in `available`
pub fn missing_names(required: &[&CStr], available: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !available.contains(name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// View a fixed-size Vulkan name array as a `CStr`
pub fn name_from_raw(raw: &[std::ffi::c_char]) -> &CStr {
    // Vulkan guarantees these arrays are NUL-terminated
    unsafe { CStr::from_ptr(raw.as_ptr()) }
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

    fn good_candidate(name: &str) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            geometry_shader: true,
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            missing_extensions: Vec::new(),
            format_count: 2,
            present_mode_count: 1,
        }
    }

    #[test]
    fn queue_families_pick_earliest_indices() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 4),
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 2),
        ];

        let indices = QueueFamilyIndices::find(&families, |i| Ok(i >= 2)).unwrap();

        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(2));
        assert!(indices.is_complete());
        assert_eq!(indices.unique().into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn queue_families_may_alias() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1), family(vk::QueueFlags::GRAPHICS, 1)];

        let indices = QueueFamilyIndices::find(&families, |_| Ok(true)).unwrap();

        assert_eq!(indices.pair(), Some((0, 0)));
        assert_eq!(indices.unique().len(), 1);
    }

    #[test]
    fn empty_families_are_ignored() {
        let families = [family(vk::QueueFlags::GRAPHICS, 0), family(vk::QueueFlags::GRAPHICS, 1)];

        let indices = QueueFamilyIndices::find(&families, |_| Ok(true)).unwrap();

        assert_eq!(indices.pair(), Some((1, 1)));
    }

    #[test]
    fn incomplete_without_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];

        let indices = QueueFamilyIndices::find(&families, |_| Ok(false)).unwrap();

        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, None);
        assert!(!indices.is_complete());
        assert_eq!(indices.pair(), None);
    }

    #[test]
    fn stops_querying_once_complete() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1); 3];
        let mut asked = Vec::new();

        QueueFamilyIndices::find(&families, |i| {
            asked.push(i);
            Ok(true)
        })
        .unwrap();

        assert_eq!(asked, vec![0]);
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        let result = QueueFamilyIndices::find(&families, |_| anyhow::bail!("surface lost"));
        assert!(result.is_err());
    }

    #[test]
    fn selects_first_fully_suitable_device() {
        let integrated = DeviceCandidate {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            ..good_candidate("integrated")
        };
        let no_geometry = DeviceCandidate {
            geometry_shader: false,
            ..good_candidate("no-geometry")
        };
        let no_present = DeviceCandidate {
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: None,
            },
            ..good_candidate("no-present")
        };
        let no_swapchain_ext = DeviceCandidate {
            missing_extensions: vec!["VK_KHR_swapchain".to_string()],
            ..good_candidate("no-ext")
        };
        let no_formats = DeviceCandidate {
            format_count: 0,
            ..good_candidate("no-formats")
        };
        let no_modes = DeviceCandidate {
            present_mode_count: 0,
            ..good_candidate("no-modes")
        };

        let candidates = vec![
            integrated,
            no_geometry,
            no_present,
            no_swapchain_ext,
            no_formats,
            no_modes,
            good_candidate("first-good"),
            good_candidate("second-good"),
        ];

        let selected = select_first_suitable(&candidates, &DeviceRequirements::default());
        assert_eq!(selected, Some(6));
        assert_eq!(candidates[6].name, "first-good");
    }

    #[test]
    fn each_predicate_rejects_on_its_own() {
        let requirements = DeviceRequirements::default();

        let cpu = DeviceCandidate {
            device_type: vk::PhysicalDeviceType::CPU,
            ..good_candidate("cpu")
        };
        assert_eq!(
            cpu.rejection(&requirements),
            Some(Rejection::NotDiscrete(vk::PhysicalDeviceType::CPU))
        );

        let no_geometry = DeviceCandidate {
            geometry_shader: false,
            ..good_candidate("a")
        };
        assert_eq!(no_geometry.rejection(&requirements), Some(Rejection::NoGeometryShader));

        let no_modes = DeviceCandidate {
            present_mode_count: 0,
            ..good_candidate("b")
        };
        assert_eq!(
            no_modes.rejection(&requirements),
            Some(Rejection::InadequateSwapchain { formats: 2, present_modes: 0 })
        );

        assert_eq!(good_candidate("c").rejection(&requirements), None);
    }

    #[test]
    fn no_suitable_device_yields_none() {
        let candidates = vec![DeviceCandidate {
            device_type: vk::PhysicalDeviceType::VIRTUAL_GPU,
            ..good_candidate("virtual")
        }];
        assert_eq!(select_first_suitable(&candidates, &DeviceRequirements::default()), None);
        assert_eq!(select_first_suitable(&[], &DeviceRequirements::default()), None);
    }

    #[test]
    fn relaxed_requirements_accept_integrated_gpus() {
        let requirements = DeviceRequirements {
            discrete_gpu: false,
            geometry_shader: false,
        };
        let candidates = vec![DeviceCandidate {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            geometry_shader: false,
            ..good_candidate("laptop")
        }];
        assert_eq!(select_first_suitable(&candidates, &requirements), Some(0));
    }

    #[test]
    fn reports_missing_names() {
        let required = [c"VK_KHR_surface", c"VK_EXT_debug_utils"];
        let available = [c"VK_KHR_surface", c"VK_KHR_xcb_surface"];

        assert_eq!(missing_names(&required, &available), vec!["VK_EXT_debug_utils".to_string()]);
        assert!(missing_names(&required[..1], &available).is_empty());
    }
}
