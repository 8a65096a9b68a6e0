use bytemuck::{Pod, Zeroable};

use crate::util::Color;

const SPIN_UP_COLOR: Color = Color::rgb(24, 24, 27);
const SPIN_DOWN_COLOR: Color = Color::rgb(244, 244, 245);

/// Uniform block for the display pass; mirrors the WGSL `DisplayParams`
/// struct.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DisplayUniforms {
    pub up_color: [f32; 4],
    pub down_color: [f32; 4],
}

impl Default for DisplayUniforms {
    fn default() -> Self {
        Self {
            up_color: SPIN_UP_COLOR.as_rgba_f32(),
            down_color: SPIN_DOWN_COLOR.as_rgba_f32(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uniforms_match_wgsl_layout() {
        assert_eq!(std::mem::size_of::<DisplayUniforms>(), 32);
        assert_eq!(std::mem::size_of::<DisplayUniforms>() % 16, 0);
    }
}
