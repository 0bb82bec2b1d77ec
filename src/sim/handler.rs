//! Simulated stepper indexer.

use super::{DeviceModel, SimEvent, WorldState};
use crate::protocol::{Direction, MotionAxis};

/// Indexer command handling.
///
/// Parameter registers are stored as sent and echoed by verify commands.
/// Moves complete instantly but report busy for a few status polls;
/// translation stops at the limit switches.
pub struct HandlerModel;

impl DeviceModel for HandlerModel {
    const NAME: &'static str = "sim-handler";
    const TERMINATOR: char = ',';

    fn continues(partial: &str) -> bool {
        partial == "O1"
    }

    fn handle(world: &mut WorldState, command: &str) -> Option<String> {
        let mut chars = command.chars();
        let register = chars.next()?;
        let contents = chars.as_str();
        match register {
            'O' => {
                world.selected = match contents.strip_prefix("1,")? {
                    "1" => MotionAxis::Rotation,
                    _ => MotionAxis::Translation,
                };
                None
            }
            'A' | 'D' | 'N' => {
                world.registers.insert(register, contents.to_string());
                None
            }
            'M' => {
                let stored = match (world.velocity_step, contents.parse::<u32>()) {
                    (Some(step), Ok(v)) => (((v + step / 2) / step) * step).to_string(),
                    _ => contents.to_string(),
                };
                world.registers.insert('M', stored);
                None
            }
            '+' => {
                world.direction = Direction::Positive;
                None
            }
            '-' => {
                world.direction = Direction::Negative;
                None
            }
            'G' => {
                start_move(world);
                None
            }
            'H' => {
                seek_home(world);
                None
            }
            'F' => {
                let status = if world.moving_polls > 0 {
                    world.moving_polls -= 1;
                    "F1,"
                } else {
                    "F0,"
                };
                Some(status.to_string())
            }
            'V' => verify(world, contents),
            _ => None,
        }
    }
}

fn verify(world: &WorldState, contents: &str) -> Option<String> {
    let register = contents.chars().next()?;
    match register {
        'O' => {
            let selected = match world.selected {
                MotionAxis::Translation => '0',
                MotionAxis::Rotation => '1',
            };
            Some(format!("O1,{selected},"))
        }
        'A' | 'D' | 'M' | 'N' => {
            let value = world.registers.get(&register).map_or("", String::as_str);
            Some(format!("{register}{value},"))
        }
        _ => None,
    }
}

fn start_move(world: &mut WorldState) {
    let pulses = world
        .registers
        .get(&'N')
        .and_then(|n| n.parse::<i64>().ok())
        .unwrap_or(0);
    let delta = match world.direction {
        Direction::Positive => pulses,
        Direction::Negative => -pulses,
    };
    let axis = world.selected;
    let (from, to) = match axis {
        MotionAxis::Translation => {
            let from = world.translation;
            let (lo, hi) = world.limits;
            world.translation = (from + delta).clamp(lo, hi);
            (from, world.translation)
        }
        MotionAxis::Rotation => {
            let from = world.rotation;
            world.rotation += delta;
            (from, world.rotation)
        }
    };
    world.moving_polls = world.busy_polls;
    world.events.push(SimEvent::Moved { axis, from, to });
}

fn seek_home(world: &mut WorldState) {
    let axis = world.selected;
    match axis {
        MotionAxis::Translation => world.translation = 0,
        MotionAxis::Rotation => world.rotation = 0,
    }
    world.moving_polls = world.busy_polls;
    world.events.push(SimEvent::Homed { axis });
}

#[cfg(test)]
mod tests {
    use super::super::{SimHandler, SimWorld};
    use super::*;
    use crate::config::Settings;
    use crate::protocol::{HandlerProtocol, MoveParams};

    fn params(axis: MotionAxis, pulses: u64, direction: Direction) -> MoveParams {
        MoveParams {
            axis,
            acceleration: 20,
            deceleration: 10,
            velocity: 6000,
            pulses,
            direction,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn configured_move_runs_and_reports_busy() {
        let world = SimWorld::new(&Settings::default());
        let mut handler = HandlerProtocol::new(Box::new(SimHandler::new(world.clone())));

        handler
            .configure_move(&params(MotionAxis::Translation, 1500, Direction::Positive))
            .await
            .unwrap();
        handler.go().await.unwrap();
        assert_eq!(world.translation_pulses(), 1500);
        assert!(handler.is_moving().await.unwrap());
        assert!(handler.is_moving().await.unwrap());
        assert!(!handler.is_moving().await.unwrap());

        handler
            .configure_move(&params(MotionAxis::Rotation, 1000, Direction::Positive))
            .await
            .unwrap();
        handler.go().await.unwrap();
        assert_eq!(world.rotation_quarter(), 2);
        assert_eq!(world.translation_pulses(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn translation_stops_at_limit() {
        let world = SimWorld::new(&Settings::default());
        let mut handler = HandlerProtocol::new(Box::new(SimHandler::new(world.clone())));
        handler
            .configure_move(&params(MotionAxis::Translation, 1_000_000, Direction::Negative))
            .await
            .unwrap();
        handler.go().await.unwrap();
        assert_eq!(world.translation_pulses(), -45_000);
    }

    #[tokio::test(start_paused = true)]
    async fn coerced_velocity_still_configures() {
        let world = SimWorld::new(&Settings::default());
        world.coerce_velocity(7);
        let mut handler = HandlerProtocol::new(Box::new(SimHandler::new(world)));
        handler
            .configure_move(&params(MotionAxis::Translation, 10, Direction::Positive))
            .await
            .unwrap();
        assert!(handler.is_armed());
    }
}
