//! Simulated AF demagnetizer controller.

use super::{DeviceModel, SimEvent, WorldState};
use crate::measurement::Axis;

/// Status polls a ramp cycle stays busy for.
const RAMP_POLLS: u32 = 2;

/// Demagnetizer command handling.
///
/// A ramp applies its peak field to the sample at once; later status polls
/// report busy, then `DONE`, or a queued fault.
pub struct DemagnetizerModel;

impl DeviceModel for DemagnetizerModel {
    const NAME: &'static str = "sim-demagnetizer";
    const TERMINATOR: char = '\r';

    fn handle(world: &mut WorldState, command: &str) -> Option<String> {
        if let Some(field) = command.strip_prefix("DCA") {
            let gauss: u32 = field.parse().ok()?;
            world.amplitude_mt = f64::from(gauss) / 10.0;
            return Some(format!("{command}\r\n"));
        }
        if let Some(coil) = command.strip_prefix("DCC") {
            world.coil = Some(match coil {
                "X" => Axis::X,
                "Y" => Axis::Y,
                "Z" => Axis::Z,
                _ => return None,
            });
            return Some(format!("{command}\r\n"));
        }
        match command {
            "DERC" => {
                start_ramp(world);
                None
            }
            "DSS" => Some(status(world)),
            _ => None,
        }
    }
}

fn start_ramp(world: &mut WorldState) {
    world.ramp_polls = RAMP_POLLS;
    let Some(coil) = world.coil else {
        return;
    };
    if world.ramp_error.is_none() {
        world.max_af_mt = world.max_af_mt.max(world.amplitude_mt);
    }
    world.events.push(SimEvent::Ramp {
        coil,
        level_mt: world.amplitude_mt,
        translation: world.translation,
        quarter: world.quarter(),
    });
}

fn status(world: &mut WorldState) -> String {
    if let Some(token) = world.ramp_error.take() {
        return format!("{token}\r\n");
    }
    if world.ramp_polls > 0 {
        world.ramp_polls -= 1;
        "BUSY\r\n".to_string()
    } else {
        "DONE\r\n".to_string()
    }
}
