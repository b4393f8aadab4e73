use num_traits::{One, Zero};

use nalgebra::{OMatrix, OVector, RealField, U2, U4};

use adskalman::{ObservationModel, StateAndCovariance};

/// Direct observation of world-frame (x, y), e.g. a cluster centroid.
///
/// Observation noise is isotropic: `measurement_noise` is the variance on
/// each axis in square metres.
#[derive(Debug, Clone)]
pub struct PlanarPositionModel<R: RealField> {
    observation_matrix: OMatrix<R, U2, U4>,
    observation_matrix_transpose: OMatrix<R, U4, U2>,
    observation_noise_covariance: OMatrix<R, U2, U2>,
}

impl<R: RealField + Copy> PlanarPositionModel<R> {
    pub fn new(measurement_noise: R) -> Self {
        let zero: R = Zero::zero();
        let one: R = One::one();

        #[rustfmt::skip]
        let observation_matrix = OMatrix::<R, U2, U4>::new(
             one, zero, zero, zero,
            zero,  one, zero, zero);
        let observation_matrix_transpose = observation_matrix.transpose();
        let observation_noise_covariance =
            OMatrix::<R, U2, U2>::new(measurement_noise, zero, zero, measurement_noise);
        Self {
            observation_matrix,
            observation_matrix_transpose,
            observation_noise_covariance,
        }
    }
}

impl<R: RealField> ObservationModel<R, U4, U2> for PlanarPositionModel<R> {
    fn H(&self) -> &OMatrix<R, U2, U4> {
        &self.observation_matrix
    }
    fn HT(&self) -> &OMatrix<R, U4, U2> {
        &self.observation_matrix_transpose
    }
    fn R(&self) -> &OMatrix<R, U2, U2> {
        &self.observation_noise_covariance
    }
    fn predict_observation(&self, state: &OVector<R, U4>) -> OVector<R, U2> {
        &self.observation_matrix * state
    }
}

/// Squared Mahalanobis distance of `observation` from the predicted
/// observation of `prior`, under the innovation covariance `S = H P Hᵀ + R`.
///
/// Returns `None` when `S` is not invertible, which callers treat as an
/// inadmissible pairing.
pub fn squared_mahalanobis<R: RealField + Copy>(
    model: &PlanarPositionModel<R>,
    prior: &StateAndCovariance<R, U4>,
    observation: &OVector<R, U2>,
) -> Option<R> {
    let innovation = observation - model.predict_observation(prior.state());
    let s = (model.H() * prior.covariance()) * model.HT() + model.R();
    let s_inv = s.try_inverse()?;
    Some((innovation.transpose() * s_inv * innovation)[(0, 0)])
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector2, Vector4};

    #[test]
    fn update_pulls_estimate_toward_observation() {
        let model = PlanarPositionModel::new(0.25);
        let prior = StateAndCovariance::new(
            Vector4::new(0.0, 0.0, 0.0, 0.0),
            Matrix4::identity() * 10.0,
        );
        let posterior = model
            .update(
                &prior,
                &Vector2::new(1.0, -1.0),
                adskalman::CovarianceUpdateMethod::JosephForm,
            )
            .unwrap();
        // High prior variance: the posterior should land nearly on the
        // observation.
        assert_relative_eq!(posterior.state()[0], 1.0, epsilon = 0.05);
        assert_relative_eq!(posterior.state()[1], -1.0, epsilon = 0.05);
        assert!(posterior.covariance()[(0, 0)] < prior.covariance()[(0, 0)]);
    }

    #[test]
    fn mahalanobis_of_exact_prediction_is_zero() {
        let model = PlanarPositionModel::new(0.25);
        let prior =
            StateAndCovariance::new(Vector4::new(3.0, 4.0, 1.0, 0.0), Matrix4::identity());
        let d2 = squared_mahalanobis(&model, &prior, &Vector2::new(3.0, 4.0)).unwrap();
        assert_relative_eq!(d2, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn mahalanobis_grows_with_distance() {
        let model = PlanarPositionModel::new(0.25);
        let prior = StateAndCovariance::new(Vector4::zeros(), Matrix4::identity());
        let near = squared_mahalanobis(&model, &prior, &Vector2::new(0.5, 0.0)).unwrap();
        let far = squared_mahalanobis(&model, &prior, &Vector2::new(5.0, 0.0)).unwrap();
        assert!(far > near);
    }
}
