pub use nalgebra as na;

pub mod ground_plane_motion;
pub mod position_observation;

pub use ground_plane_motion::{GroundPlaneCvModel, GroundPlaneCvModelFixedDt};
pub use position_observation::{PlanarPositionModel, squared_mahalanobis};
