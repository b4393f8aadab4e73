use num_traits::{One, Zero};

use nalgebra::{OMatrix, RealField, U4};

use adskalman::TransitionModelLinearNoControl;

/// Constant velocity motion on the road plane, parameterised by `dt`.
///
/// The state vector is [x y xvel yvel] in world-frame metres. Process noise
/// is split into independent position and velocity terms so that positional
/// jitter (beam quantisation, box-centre wobble) and manoeuvre noise can be
/// tuned separately.
///
/// The important method is `calc_for_dt()`: it returns a model bound to a
/// specific `dt`, usable for the Kalman prediction step.
#[derive(Debug, Clone)]
pub struct GroundPlaneCvModel<R: RealField> {
    process_noise_pos: R,
    process_noise_vel: R,
}

impl<R: RealField + Copy> GroundPlaneCvModel<R> {
    pub fn new(process_noise_pos: R, process_noise_vel: R) -> Self {
        Self {
            process_noise_pos,
            process_noise_vel,
        }
    }

    /// For a given `dt` (seconds), create a fixed-dt motion model.
    pub fn calc_for_dt(&self, dt: R) -> GroundPlaneCvModelFixedDt<R> {
        let zero: R = Zero::zero();
        let one: R = One::one();

        // This is "F" in most Kalman filter descriptions.
        #[rustfmt::skip]
        let transition_model = OMatrix::<R, U4, U4>::new(
             one, zero,   dt, zero,
            zero,  one, zero,   dt,
            zero, zero,  one, zero,
            zero, zero, zero,  one);
        let transition_model_transpose = transition_model.transpose();

        let qp = self.process_noise_pos * dt;
        let qv = self.process_noise_vel * dt;

        // This is "Q". Diagonal per-axis noise; position and velocity terms
        // scale linearly with dt.
        #[rustfmt::skip]
        let transition_noise_covariance = OMatrix::<R, U4, U4>::new(
              qp, zero, zero, zero,
            zero,   qp, zero, zero,
            zero, zero,   qv, zero,
            zero, zero, zero,   qv);
        GroundPlaneCvModelFixedDt {
            transition_model,
            transition_model_transpose,
            transition_noise_covariance,
        }
    }
}

/// Constant velocity road-plane motion model for a fixed dt.
///
/// The state vector is [x y xvel yvel].
#[derive(Debug)]
pub struct GroundPlaneCvModelFixedDt<R: RealField> {
    transition_model: OMatrix<R, U4, U4>,
    transition_model_transpose: OMatrix<R, U4, U4>,
    transition_noise_covariance: OMatrix<R, U4, U4>,
}

impl<R: RealField> TransitionModelLinearNoControl<R, U4> for GroundPlaneCvModelFixedDt<R> {
    fn F(&self) -> &OMatrix<R, U4, U4> {
        &self.transition_model
    }
    fn FT(&self) -> &OMatrix<R, U4, U4> {
        &self.transition_model_transpose
    }
    fn Q(&self) -> &OMatrix<R, U4, U4> {
        &self.transition_noise_covariance
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use adskalman::StateAndCovariance;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector4};

    #[test]
    fn predict_advances_position_by_velocity() {
        let model = GroundPlaneCvModel::new(0.1, 0.1).calc_for_dt(0.5);
        let state = Vector4::new(1.0, 2.0, 2.0, -4.0);
        let prior = StateAndCovariance::new(state, Matrix4::identity());
        let predicted = model.predict(&prior);
        assert_relative_eq!(predicted.state()[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(predicted.state()[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(predicted.state()[2], 2.0, epsilon = 1e-12);
        assert_relative_eq!(predicted.state()[3], -4.0, epsilon = 1e-12);
    }

    #[test]
    fn covariance_grows_without_observations() {
        let model = GroundPlaneCvModel::new(0.5, 2.0).calc_for_dt(0.1);
        let prior = StateAndCovariance::new(Vector4::zeros(), Matrix4::identity());
        let predicted = model.predict(&prior);
        assert!(predicted.covariance()[(0, 0)] > 1.0);
        assert!(predicted.covariance()[(2, 2)] > 1.0);
    }
}
