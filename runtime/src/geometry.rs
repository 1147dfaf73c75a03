//! Mapping of elementwise work onto worker groups.

/// One worker per element, grouped for the device.
///
/// `groups * group_size` may exceed `elements` by less than one group; the
/// kernel masks the surplus workers of the last group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchGeometry {
    pub elements: usize,
    pub group_size: usize,
    pub groups: usize,
}

impl LaunchGeometry {
    /// Geometry for `elements` workers with groups of at most `max_group_size`.
    ///
    /// Returns `None` for zero elements: there is nothing to launch.
    pub fn for_elements(elements: usize, max_group_size: usize) -> Option<Self> {
        if elements == 0 {
            return None;
        }
        let group_size = max_group_size.clamp(1, elements);
        Some(Self { elements, group_size, groups: elements.div_ceil(group_size) })
    }

    /// Total number of workers launched, including masked ones.
    pub fn workers(&self) -> usize {
        self.groups * self.group_size
    }

    /// Number of workers in the last group that map to an element.
    pub fn tail(&self) -> usize {
        self.elements - (self.groups - 1) * self.group_size
    }

    /// `(elements, groups, group_size)` as 32-bit launch parameters, or `None`
    /// if any of them does not fit.
    ///
    /// The surplus workers of the last group can push worker indices past
    /// `u32::MAX`, so kernels compute their index in 64 bits.
    pub fn dims_u32(&self) -> Option<(u32, u32, u32)> {
        Some((
            u32::try_from(self.elements).ok()?,
            u32::try_from(self.groups).ok()?,
            u32::try_from(self.group_size).ok()?,
        ))
    }
}
