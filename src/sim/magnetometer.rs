//! Simulated SQUID magnetometer controller.

use super::{DeviceModel, SimEvent, WorldState};
use crate::measurement::Axis;
use crate::protocol::Range;

/// Count reported by a saturated axis.
const SATURATED_COUNT: i64 = 9_999;

/// Magnetometer command handling.
///
/// Analog data is the sensed moment in flux quanta. Counts are zero unless
/// an axis has been told to saturate and the sample is being measured on a
/// range that is too sensitive.
pub struct MagnetometerModel;

fn targets(letter: char) -> Option<Vec<Axis>> {
    match letter {
        'A' => Some(Axis::ALL.to_vec()),
        'X' => Some(vec![Axis::X]),
        'Y' => Some(vec![Axis::Y]),
        'Z' => Some(vec![Axis::Z]),
        _ => None,
    }
}

impl DeviceModel for MagnetometerModel {
    const NAME: &'static str = "sim-magnetometer";
    const TERMINATOR: char = '\r';

    fn handle(world: &mut WorldState, command: &str) -> Option<String> {
        let mut chars = command.chars();
        let axes = targets(chars.next()?)?;
        let first = axes[0].index();
        match chars.as_str() {
            "LC" => {
                for axis in axes {
                    let i = axis.index();
                    let saturated = world.at_measurement()
                        && world.saturate_below[i].is_some_and(|limit| world.ranges[i] < limit);
                    world.latched_count[i] = if saturated { SATURATED_COUNT } else { 0 };
                }
                None
            }
            "LD" => {
                let moment = world.sensed_moment();
                for axis in axes {
                    world.latched_flux[axis.index()] = moment[axis] / world.emu_per_flux[axis];
                }
                world.events.push(SimEvent::DataLatched {
                    translation: world.translation,
                    quarter: world.quarter(),
                });
                None
            }
            "SC" => Some(format!("{}\r\n", world.latched_count[first])),
            "SD" => Some(format!("{:+.6E}\r\n", world.latched_flux[first])),
            "CLP" | "CLC" | "RC" => None,
            rest if rest.starts_with("CR") => {
                let range = rest[2..].chars().next().and_then(Range::from_code)?;
                for axis in axes {
                    world.ranges[axis.index()] = range;
                    world.events.push(SimEvent::RangeSet { axis, range });
                }
                Some(format!("{command}\r\n"))
            }
            rest if rest.starts_with('C') => Some(format!("{command}\r\n")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{SimMagnetometer, SimWorld};
    use super::*;
    use crate::config::Settings;
    use crate::measurement::{AxisSet, Vec3};
    use crate::protocol::{AxisConfig, MagnetometerProtocol};

    #[tokio::test(start_paused = true)]
    async fn reports_background_in_flux_quanta() {
        let settings = Settings::default();
        let world = SimWorld::new(&settings);
        world.set_background(Vec3::new(2.0e-5, 0.0, -1.0e-5));
        let mut mag = MagnetometerProtocol::new(Box::new(SimMagnetometer::new(world)));

        assert_eq!(mag.read_counts(AxisSet::all()).await.unwrap(), [0, 0, 0]);
        let flux = mag.read_analog_mean(AxisSet::all(), 2).await.unwrap();
        assert!((flux.x + 1.0).abs() < 1e-6);
        assert!((flux.z - 1.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn range_commands_are_echoed_and_applied() {
        let world = SimWorld::new(&Settings::default());
        let mut mag = MagnetometerProtocol::new(Box::new(SimMagnetometer::new(world.clone())));
        let config = AxisConfig {
            range: Range::X100,
            ..AxisConfig::default()
        };
        mag.configure_axis(Axis::Y, &config).await.unwrap();
        assert_eq!(world.range(Axis::Y), Range::X100);
        assert_eq!(world.range(Axis::X), Range::X1);
    }
}
