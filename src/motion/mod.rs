//! Sample handler motion.
//!
//! [`MotionController`] tracks where the handler is as a pair of named
//! positions and turns "go to position P" into a relative move: the pulse
//! delta between the two positions' configured offsets. Exactly one
//! translation and one rotation position is current at any time, or the
//! position is unknown and only a home seek can recover it.
//!
//! [`SampleHandler`] wraps either a motorised controller or a manual handler
//! that is moved by the operator on request.

mod positions;

pub use positions::{RotationPosition, TranslationPosition};

use crate::config::HandlerConfig;
use crate::error::{DaqError, MotionError};
use crate::operator::{CancelFlag, Operator, Prompt};
use crate::protocol::{Direction, HandlerProtocol, MotionAxis, MoveParams};
use tokio::time::{sleep, Instant};
use tracing::instrument;

/// Motorised sample handler with position tracking.
pub struct MotionController {
    protocol: HandlerProtocol,
    config: HandlerConfig,
    cancel: CancelFlag,
    translation: Option<TranslationPosition>,
    rotation: Option<RotationPosition>,
    net_translation: i64,
}

impl MotionController {
    /// Controller over `protocol`. The position starts unknown.
    pub fn new(protocol: HandlerProtocol, config: HandlerConfig, cancel: CancelFlag) -> Self {
        Self {
            protocol,
            config,
            cancel,
            translation: None,
            rotation: None,
            net_translation: 0,
        }
    }

    /// Current translation position, if known.
    pub fn translation(&self) -> Option<TranslationPosition> {
        self.translation
    }

    /// Current rotation position, if known.
    pub fn rotation(&self) -> Option<RotationPosition> {
        self.rotation
    }

    /// Whether both positions are known.
    pub fn is_homed(&self) -> bool {
        self.translation.is_some() && self.rotation.is_some()
    }

    /// Translation pulses commanded since the last home seek.
    pub fn net_translation_pulses(&self) -> i64 {
        self.net_translation
    }

    /// Motion parameters in use.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Put the indexer online.
    pub async fn initialize(&mut self) -> Result<(), MotionError> {
        self.protocol.set_online().await?;
        Ok(())
    }

    fn right_limit_direction(&self) -> Direction {
        if self.config.right_limit_positive {
            Direction::Positive
        } else {
            Direction::Negative
        }
    }

    fn limit_direction(&self, limit: TranslationPosition) -> Direction {
        match limit {
            TranslationPosition::LeftLimit => self.right_limit_direction().reversed(),
            _ => self.right_limit_direction(),
        }
    }

    fn translation_params(&self, pulses: u64, direction: Direction, velocity: u32) -> MoveParams {
        MoveParams {
            axis: MotionAxis::Translation,
            acceleration: self.config.acceleration,
            deceleration: self.config.deceleration,
            velocity,
            pulses,
            direction,
        }
    }

    fn check_cancel(&self) -> Result<(), MotionError> {
        if self.cancel.is_cancelled() {
            Err(MotionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Poll the status register until the move finishes, the watchdog
    /// expires, or the operator cancels.
    async fn wait_for_completion(&mut self) -> Result<(), MotionError> {
        let watchdog = self.config.watchdog();
        let started = Instant::now();
        loop {
            self.check_cancel()?;
            sleep(self.config.poll_interval()).await;
            if !self.protocol.is_moving().await? {
                return Ok(());
            }
            if started.elapsed() >= watchdog {
                tracing::error!(?watchdog, "Handler move watchdog expired");
                return Err(MotionError::Timeout(watchdog));
            }
        }
    }

    /// Run a configured translation move. The position is unknown from the
    /// moment the move starts until it completes.
    async fn run_translation(
        &mut self,
        params: MoveParams,
        seek_home: bool,
        target: TranslationPosition,
    ) -> Result<(), MotionError> {
        self.protocol.configure_move(&params).await?;
        self.translation = None;
        if seek_home {
            self.protocol.seek_home().await?;
        } else {
            self.protocol.go().await?;
        }
        self.wait_for_completion().await?;
        self.translation = Some(target);
        Ok(())
    }

    /// Seek home from a limit switch.
    async fn home_from_limit(&mut self, limit: TranslationPosition) -> Result<(), MotionError> {
        let direction = self.limit_direction(limit).reversed();
        let params = self.translation_params(
            u64::from(self.config.limit_seek_pulses),
            direction,
            self.config.translation_velocity,
        );
        self.run_translation(params, true, TranslationPosition::Home)
            .await?;
        self.net_translation = 0;
        Ok(())
    }

    /// Home the translation axis: run onto the right limit, then seek home
    /// from there so zero is calibrated from a known side.
    #[instrument(skip(self))]
    pub async fn home_translation(&mut self) -> Result<(), MotionError> {
        self.check_cancel()?;
        let params = self.translation_params(
            u64::from(self.config.limit_seek_pulses),
            self.right_limit_direction(),
            self.config.translation_velocity,
        );
        self.run_translation(params, false, TranslationPosition::RightLimit)
            .await?;
        self.check_cancel()?;
        self.home_from_limit(TranslationPosition::RightLimit).await?;
        tracing::info!("Translation homed");
        Ok(())
    }

    /// Home the rotation axis directly.
    #[instrument(skip(self))]
    pub async fn home_rotation(&mut self) -> Result<(), MotionError> {
        self.check_cancel()?;
        let params = MoveParams {
            axis: MotionAxis::Rotation,
            acceleration: self.config.acceleration,
            deceleration: self.config.deceleration,
            velocity: self.config.rotation_velocity,
            pulses: u64::from(self.config.pulses_per_revolution),
            direction: Direction::Positive,
        };
        self.protocol.configure_move(&params).await?;
        self.rotation = None;
        self.protocol.seek_home().await?;
        self.wait_for_completion().await?;
        self.rotation = Some(RotationPosition::Home);
        tracing::info!("Rotation homed");
        Ok(())
    }

    /// Home both axes.
    pub async fn home(&mut self) -> Result<(), MotionError> {
        self.home_translation().await?;
        self.home_rotation().await
    }

    /// Translate to `target`.
    ///
    /// A protocol failure while configuring leaves the tracked position as it
    /// was; any failure after the move starts leaves it unknown.
    #[instrument(skip(self), fields(from = ?self.translation))]
    pub async fn move_to(&mut self, target: TranslationPosition) -> Result<(), MotionError> {
        if self.translation == Some(target) {
            return Ok(());
        }
        let mut current = self.translation.ok_or(MotionError::PositionUnknown)?;
        self.check_cancel()?;

        if current.is_limit() {
            self.home_from_limit(current).await?;
            current = TranslationPosition::Home;
            if target == current {
                return Ok(());
            }
            self.check_cancel()?;
        }

        if target.is_limit() {
            let params = self.translation_params(
                u64::from(self.config.limit_seek_pulses),
                self.limit_direction(target),
                self.config.translation_velocity,
            );
            return self.run_translation(params, false, target).await;
        }

        let offsets = self.config.positions;
        let (Some(from), Some(to)) = (current.offset(&offsets), target.offset(&offsets)) else {
            return Err(MotionError::PositionUnknown);
        };
        let delta = to - from;
        let velocity = if is_measurement_region(current, target) {
            self.config.measurement_velocity
        } else {
            self.config.translation_velocity
        };
        tracing::debug!(%current, %target, delta, velocity, "Translating");

        let params = self.translation_params(delta.unsigned_abs(), Direction::of(delta), velocity);
        self.run_translation(params, target == TranslationPosition::Home, target)
            .await?;
        self.net_translation += delta;
        Ok(())
    }

    /// Rotate forward to `target`.
    #[instrument(skip(self), fields(from = ?self.rotation))]
    pub async fn rotate_to(&mut self, target: RotationPosition) -> Result<(), MotionError> {
        if self.rotation == Some(target) {
            return Ok(());
        }
        let current = self.rotation.ok_or(MotionError::PositionUnknown)?;
        self.check_cancel()?;

        let quarter = u64::from(self.config.pulses_per_revolution / 4);
        let pulses = u64::from(current.quarters_to(target)) * quarter;
        let params = MoveParams {
            axis: MotionAxis::Rotation,
            acceleration: self.config.acceleration,
            deceleration: self.config.deceleration,
            velocity: self.config.rotation_velocity,
            pulses,
            direction: Direction::Positive,
        };
        self.protocol.configure_move(&params).await?;
        self.rotation = None;
        self.protocol.go().await?;
        self.wait_for_completion().await?;
        self.rotation = Some(target);
        Ok(())
    }

    /// Close the handler link.
    pub async fn close(&mut self) -> Result<(), MotionError> {
        self.protocol.close().await?;
        Ok(())
    }
}

fn is_measurement_region(a: TranslationPosition, b: TranslationPosition) -> bool {
    use TranslationPosition::{Background, Measurement};
    matches!((a, b), (Background, Measurement) | (Measurement, Background))
}

/// The station's sample handler: motorised, or moved by hand.
pub enum SampleHandler {
    /// Driven over its serial port
    Automatic(MotionController),
    /// Moved by the operator on request
    Manual {
        /// Last confirmed translation position
        translation: Option<TranslationPosition>,
        /// Last confirmed rotation position
        rotation: Option<RotationPosition>,
    },
}

impl SampleHandler {
    /// A manual handler with unknown position.
    pub fn manual() -> Self {
        SampleHandler::Manual {
            translation: None,
            rotation: None,
        }
    }

    /// Current positions, if known.
    pub fn position(&self) -> (Option<TranslationPosition>, Option<RotationPosition>) {
        match self {
            SampleHandler::Automatic(controller) => (controller.translation(), controller.rotation()),
            SampleHandler::Manual {
                translation,
                rotation,
            } => (*translation, *rotation),
        }
    }

    /// Whether both positions are known.
    pub fn is_homed(&self) -> bool {
        let (t, r) = self.position();
        t.is_some() && r.is_some()
    }

    /// Home both axes (or have the operator do it).
    pub async fn home(&mut self, operator: &dyn Operator) -> Result<(), DaqError> {
        match self {
            SampleHandler::Automatic(controller) => Ok(controller.home().await?),
            SampleHandler::Manual { .. } => {
                self.go_to(TranslationPosition::Home, RotationPosition::Home, operator)
                    .await
            }
        }
    }

    /// Bring the sample to `translation` and `rotation`.
    pub async fn go_to(
        &mut self,
        translation: TranslationPosition,
        rotation: RotationPosition,
        operator: &dyn Operator,
    ) -> Result<(), DaqError> {
        match self {
            SampleHandler::Automatic(controller) => {
                controller.move_to(translation).await?;
                controller.rotate_to(rotation).await?;
                Ok(())
            }
            SampleHandler::Manual {
                translation: current_t,
                rotation: current_r,
            } => {
                if *current_t == Some(translation) && *current_r == Some(rotation) {
                    return Ok(());
                }
                let prompt = Prompt::ManualMove {
                    translation,
                    rotation,
                };
                if !operator.confirm(&prompt).await {
                    return Err(DaqError::Cancelled);
                }
                *current_t = Some(translation);
                *current_r = Some(rotation);
                Ok(())
            }
        }
    }

    /// Rotate without translating.
    pub async fn rotate_to(
        &mut self,
        rotation: RotationPosition,
        operator: &dyn Operator,
    ) -> Result<(), DaqError> {
        match self {
            SampleHandler::Automatic(controller) => Ok(controller.rotate_to(rotation).await?),
            SampleHandler::Manual { translation, .. } => {
                let translation = translation.ok_or(DaqError::Motion(MotionError::PositionUnknown))?;
                self.go_to(translation, rotation, operator).await
            }
        }
    }

    /// Close the handler link, if any.
    pub async fn close(&mut self) -> Result<(), DaqError> {
        if let SampleHandler::Automatic(controller) = self {
            controller.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::operator::AutoOperator;
    use crate::sim::{SimEvent, SimHandler, SimWorld};

    fn controller(world: &SimWorld, config: HandlerConfig) -> MotionController {
        let protocol = HandlerProtocol::new(Box::new(SimHandler::new(world.clone())));
        MotionController::new(protocol, config, CancelFlag::new())
    }

    fn setup() -> (SimWorld, MotionController) {
        let settings = Settings::default();
        let world = SimWorld::new(&settings);
        let controller = controller(&world, settings.handler);
        (world, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn moves_require_a_known_position() {
        let (_world, mut motion) = setup();
        assert!(matches!(
            motion.move_to(TranslationPosition::Load).await,
            Err(MotionError::PositionUnknown)
        ));
        assert!(matches!(
            motion.rotate_to(RotationPosition::Deg90).await,
            Err(MotionError::PositionUnknown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn homing_runs_onto_the_right_limit_first() {
        let (world, mut motion) = setup();
        motion.home().await.unwrap();
        assert!(motion.is_homed());
        assert_eq!(motion.translation(), Some(TranslationPosition::Home));
        assert_eq!(world.translation_pulses(), 0);

        let events = world.events();
        assert!(matches!(
            events[0],
            SimEvent::Moved { axis: MotionAxis::Translation, from: 0, to: 45_000 }
        ));
        assert_eq!(events[1], SimEvent::Homed { axis: MotionAxis::Translation });
        assert_eq!(events[2], SimEvent::Homed { axis: MotionAxis::Rotation });
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_leaves_no_net_pulses() {
        let (world, mut motion) = setup();
        motion.home().await.unwrap();

        motion.move_to(TranslationPosition::Load).await.unwrap();
        assert_eq!(world.translation_pulses(), 1_000);
        motion.move_to(TranslationPosition::Background).await.unwrap();
        motion.move_to(TranslationPosition::Measurement).await.unwrap();
        assert_eq!(world.translation_pulses(), 40_000);
        assert_eq!(motion.net_translation_pulses(), 40_000);
        motion.move_to(TranslationPosition::Home).await.unwrap();

        assert_eq!(motion.translation(), Some(TranslationPosition::Home));
        assert_eq!(motion.net_translation_pulses(), 0);
        assert_eq!(world.translation_pulses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn move_from_a_limit_seeks_home_first() {
        let (world, mut motion) = setup();
        motion.home().await.unwrap();
        motion.move_to(TranslationPosition::RightLimit).await.unwrap();
        assert_eq!(motion.translation(), Some(TranslationPosition::RightLimit));
        let before = world.events().len();

        motion.move_to(TranslationPosition::Load).await.unwrap();

        let events = world.events();
        assert_eq!(
            &events[before..],
            &[
                SimEvent::Homed { axis: MotionAxis::Translation },
                SimEvent::Moved { axis: MotionAxis::Translation, from: 0, to: 1_000 },
            ]
        );
        assert_eq!(motion.translation(), Some(TranslationPosition::Load));
        assert_eq!(motion.net_translation_pulses(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn measurement_region_moves_run_slowly() {
        let config = Settings::default().handler;
        let (world, mut motion) = setup();
        motion.home().await.unwrap();

        motion.move_to(TranslationPosition::Background).await.unwrap();
        assert_eq!(
            world.handler_register('M'),
            Some(config.translation_velocity.to_string())
        );
        motion.move_to(TranslationPosition::Measurement).await.unwrap();
        assert_eq!(
            world.handler_register('M'),
            Some(config.measurement_velocity.to_string())
        );
        motion.move_to(TranslationPosition::Background).await.unwrap();
        assert_eq!(
            world.handler_register('M'),
            Some(config.measurement_velocity.to_string())
        );
        motion.move_to(TranslationPosition::Load).await.unwrap();
        assert_eq!(
            world.handler_register('M'),
            Some(config.translation_velocity.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_only_turns_forward() {
        let (world, mut motion) = setup();
        motion.home().await.unwrap();
        motion.rotate_to(RotationPosition::Deg270).await.unwrap();
        assert_eq!(world.rotation_quarter(), 3);
        motion.rotate_to(RotationPosition::Home).await.unwrap();
        assert_eq!(world.rotation_quarter(), 0);

        let rotations: Vec<i64> = world
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Moved { axis: MotionAxis::Rotation, from, to } => Some(to - from),
                _ => None,
            })
            .collect();
        assert_eq!(rotations, vec![1_500, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_a_move_keeps_the_position() {
        let (_world, mut motion) = setup();
        motion.home().await.unwrap();
        motion.cancel.cancel();
        assert!(matches!(
            motion.move_to(TranslationPosition::Measurement).await,
            Err(MotionError::Cancelled)
        ));
        assert_eq!(motion.translation(), Some(TranslationPosition::Home));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_expiry_loses_the_position() {
        let settings = Settings::default();
        let world = SimWorld::new(&settings);
        let mut config = settings.handler.clone();
        config.watchdog_secs = 1;
        let mut motion = controller(&world, config);
        motion.home().await.unwrap();

        world.set_busy_polls(u32::MAX);
        assert!(matches!(
            motion.move_to(TranslationPosition::Load).await,
            Err(MotionError::Timeout(_))
        ));
        assert_eq!(motion.translation(), None);
        assert!(!motion.is_homed());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_handler_asks_the_operator() {
        let mut handler = SampleHandler::manual();
        let operator = AutoOperator::accepting();
        handler
            .go_to(TranslationPosition::Measurement, RotationPosition::Deg180, &operator)
            .await
            .unwrap();
        assert_eq!(
            handler.position(),
            (Some(TranslationPosition::Measurement), Some(RotationPosition::Deg180))
        );
        // Already there: no second prompt.
        handler
            .go_to(TranslationPosition::Measurement, RotationPosition::Deg180, &operator)
            .await
            .unwrap();
        assert_eq!(operator.prompts().len(), 1);

        let declining = AutoOperator::with_policy(|_| false);
        assert!(handler
            .go_to(TranslationPosition::Load, RotationPosition::Home, &declining)
            .await
            .unwrap_err()
            .is_cancel());
    }
}
