use bytemuck::{Pod, Zeroable};
use watch::{WatchReceiver, WatchSender};

pub mod lattice;

/// Neighbor-adjacency rule applied by the update shader. The discriminant is
/// the selector uploaded as the `topology` uniform.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    Grid4 = 0,
    Tri6 = 1,
    Hex3 = 2,
    SmallWorld = 3,
    Random5 = 4,
}

impl Topology {
    pub fn all() -> &'static [Topology] {
        &[
            Topology::Grid4,
            Topology::Tri6,
            Topology::Hex3,
            Topology::SmallWorld,
            Topology::Random5,
        ]
    }

    pub fn from_index(index: u32) -> Option<Topology> {
        Self::all().get(index as usize).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Topology::Grid4 => "Regular grid (4 neighbors)",
            Topology::Tri6 => "Triangular lattice (6 neighbors)",
            Topology::Hex3 => "Hexagonal lattice (3 neighbors)",
            Topology::SmallWorld => "Small-world network (4 regular + 1 long-range connection)",
            Topology::Random5 => "Random graph (5 random connections)",
        }
    }
}

/// The parameters controlling the simulation.
///
/// Values are taken as given: out-of-range settings (say, a negative
/// temperature) are uploaded unchanged and simply alter the numerical
/// evolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationParameters {
    /// Temperature T in units of J/k_B. The square-lattice critical point
    /// sits near 2.27.
    pub temperature: f32,
    /// Spin-spin coupling strength J.
    pub coupling: f32,
    /// External magnetic field H.
    pub field: f32,
    /// Evolution speed: a multiplier on the base sub-step rate of
    /// [`BASE_STEPS_PER_SECOND`]. Fractional values accumulate across frames.
    pub speed: f32,
    pub topology: Topology,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            temperature: 2.27,
            coupling: 1.0,
            field: 0.0,
            speed: 0.5,
            topology: Topology::Grid4,
        }
    }
}

/// Sub-steps per second at speed 1.0.
pub const BASE_STEPS_PER_SECOND: f64 = 60.0;

/// A partial parameter change; unset fields keep their current value.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParameterUpdate {
    pub temperature: Option<f32>,
    pub coupling: Option<f32>,
    pub field: Option<f32>,
    pub speed: Option<f32>,
    pub topology: Option<Topology>,
}

/// Create the bridge carrying parameter snapshots from the UI into the frame
/// loop. Single writer, single reader; the reader always observes a complete
/// snapshot, never a half-applied update.
pub fn parameter_bridge(
    initial: SimulationParameters,
) -> (ParameterWriter, ParameterReader) {
    let (tx, rx) = watch::channel(initial);
    (
        ParameterWriter {
            current: initial,
            tx,
        },
        ParameterReader { rx },
    )
}

/// Write half of the parameter bridge, owned by the UI side.
pub struct ParameterWriter {
    current: SimulationParameters,
    tx: WatchSender<SimulationParameters>,
}

impl ParameterWriter {
    /// Merge a partial update and publish the resulting snapshot atomically.
    pub fn apply(&mut self, update: ParameterUpdate) {
        if let Some(t) = update.temperature {
            self.current.temperature = t;
        }
        if let Some(j) = update.coupling {
            self.current.coupling = j;
        }
        if let Some(h) = update.field {
            self.current.field = h;
        }
        if let Some(s) = update.speed {
            self.current.speed = s;
        }
        if let Some(topology) = update.topology {
            self.current.topology = topology;
        }
        self.tx.send(self.current);
    }

    pub fn current(&self) -> SimulationParameters {
        self.current
    }
}

/// Read half of the parameter bridge, polled once per frame by the driver.
pub struct ParameterReader {
    rx: WatchReceiver<SimulationParameters>,
}

impl ParameterReader {
    pub fn snapshot(&mut self) -> SimulationParameters {
        self.rx.get()
    }
}

/// Per-sub-step uniform block for the update shader. Layout mirrors the WGSL
/// `StepParams` struct; uniform buffers require the size to be a multiple of
/// 16 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct StepUniforms {
    pub resolution: [f32; 2],
    pub coupling: f32,
    pub field: f32,
    pub temperature: f32,
    pub seed: f32,
    pub iteration: u32,
    pub topology: u32,
}

impl StepUniforms {
    pub fn new(
        parameters: &SimulationParameters,
        width: u32,
        height: u32,
        iteration: u32,
        seed: f32,
    ) -> Self {
        Self {
            resolution: [width as f32, height as f32],
            coupling: parameters.coupling,
            field: parameters.field,
            temperature: parameters.temperature,
            seed,
            iteration,
            topology: parameters.topology as u32,
        }
    }
}

/// RGBA texels for a freshly randomized lattice: each cell is spin-up or
/// spin-down with probability 0.5, encoded as 255 or 0 in the red channel.
pub fn random_spin_texels(width: u32, height: u32) -> Vec<u8> {
    let cells = width as usize * height as usize;
    let mut texels = Vec::with_capacity(cells * 4);
    for _ in 0..cells {
        let spin = if fastrand::bool() { 255 } else { 0 };
        texels.extend_from_slice(&[spin, 0, 0, 255]);
    }
    texels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_selector_round_trips() {
        for &t in Topology::all() {
            assert_eq!(Topology::from_index(t as u32), Some(t));
        }
        assert_eq!(Topology::from_index(5), None);
    }

    #[test]
    fn step_uniforms_match_wgsl_layout() {
        // Uniform-address-space structs are padded to 16-byte multiples.
        assert_eq!(std::mem::size_of::<StepUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<StepUniforms>(), 32);
    }

    #[test]
    fn random_texels_encode_boolean_spins() {
        let texels = random_spin_texels(128, 128);
        assert_eq!(texels.len(), 128 * 128 * 4);
        let mut up = 0usize;
        for cell in texels.chunks_exact(4) {
            assert!(cell[0] == 0 || cell[0] == 255);
            assert_eq!(cell[1], 0);
            assert_eq!(cell[2], 0);
            assert_eq!(cell[3], 255);
            if cell[0] == 255 {
                up += 1;
            }
        }
        // p = 0.5 per cell; for 16384 cells a 0.45..0.55 band is ~13 sigma.
        let fraction = up as f64 / (128.0 * 128.0);
        assert!((0.45..=0.55).contains(&fraction), "fraction {fraction}");
    }

    #[test]
    fn partial_updates_merge_into_full_snapshots() {
        let (mut writer, mut reader) = parameter_bridge(SimulationParameters::default());
        writer.apply(ParameterUpdate {
            temperature: Some(1.5),
            ..Default::default()
        });
        writer.apply(ParameterUpdate {
            topology: Some(Topology::SmallWorld),
            field: Some(-0.25),
            ..Default::default()
        });

        let snapshot = reader.snapshot();
        assert_eq!(snapshot.temperature, 1.5);
        assert_eq!(snapshot.field, -0.25);
        assert_eq!(snapshot.topology, Topology::SmallWorld);
        // Untouched fields keep their defaults.
        assert_eq!(snapshot.coupling, 1.0);
        assert_eq!(snapshot.speed, 0.5);
    }

    #[test]
    fn same_frame_updates_are_never_observed_half_applied() {
        let (mut writer, mut reader) = parameter_bridge(SimulationParameters::default());
        // Two updates land between frames; the next snapshot must reflect both.
        writer.apply(ParameterUpdate {
            temperature: Some(9.0),
            ..Default::default()
        });
        writer.apply(ParameterUpdate {
            coupling: Some(3.0),
            ..Default::default()
        });
        let snapshot = reader.snapshot();
        assert_eq!((snapshot.temperature, snapshot.coupling), (9.0, 3.0));
    }

    #[test]
    fn defaults_sit_at_the_critical_point() {
        let p = SimulationParameters::default();
        assert_eq!(p.temperature, 2.27);
        assert_eq!(p.coupling, 1.0);
        assert_eq!(p.field, 0.0);
        assert_eq!(p.topology, Topology::Grid4);
    }
}
