//! Rule-based object classification from aggregated track features.

use serde::{Deserialize, Serialize};

use sweep_types::{ClassifierParams, ObjectClass};

/// Aggregated features of one track, the classifier's only input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackFeatures {
    pub avg_height: f64,
    pub avg_length: f64,
    pub avg_width: f64,
    pub height_p95: f64,
    pub avg_speed: f64,
    pub peak_speed: f64,
    pub speed_p50: f64,
    pub speed_p85: f64,
    pub speed_p95: f64,
    pub observation_count: u32,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub class: ObjectClass,
    pub confidence: f64,
}

/// Assigns an object class to a track.
pub trait Classifier: Send + Sync {
    fn classify(&self, features: &TrackFeatures) -> Classification;
}

/// The rule set, evaluated in priority order: bird, vehicle, pedestrian,
/// other. Confidence starts at a medium base and is nudged by within-class
/// evidence, clipped to `[confidence_low, confidence_high]`.
pub struct RuleClassifier {
    params: ClassifierParams,
}

impl RuleClassifier {
    pub fn new(params: ClassifierParams) -> Self {
        Self { params }
    }

    fn confidence(&self, adjustments: f64) -> f64 {
        (self.params.base_confidence + adjustments)
            .clamp(self.params.confidence_low, self.params.confidence_high)
    }
}

impl Classifier for RuleClassifier {
    fn classify(&self, f: &TrackFeatures) -> Classification {
        let p = &self.params;

        if f.observation_count < p.min_observations_for_classification {
            return Classification {
                class: ObjectClass::Other,
                confidence: p.confidence_low / 2.0,
            };
        }

        // Bird: small, slow, low.
        if f.avg_height < p.bird_max_height
            && f.avg_speed < p.bird_max_speed
            && f.avg_length < p.bird_max_length
            && f.avg_width < p.bird_max_width
        {
            let mut adjust = 0.0;
            if f.avg_height < p.bird_max_height / 2.0 {
                adjust += 0.05;
            }
            if f.observation_count >= 20 {
                adjust += 0.05;
            }
            return Classification {
                class: ObjectClass::Bird,
                confidence: self.confidence(adjust),
            };
        }

        // Vehicle: (large and fast) or (large and tall).
        let large = f.avg_length > p.vehicle_min_length || f.avg_width > p.vehicle_min_width;
        let fast = f.avg_speed > p.vehicle_fast_avg_speed || f.peak_speed > p.vehicle_fast_peak_speed;
        let tall = f.avg_height > p.vehicle_min_height;
        if (large && fast) || (large && tall) {
            let mut adjust = 0.0;
            // Size typical of a passenger car.
            if (3.5..=6.0).contains(&f.avg_length) && (1.5..=2.2).contains(&f.avg_width) {
                adjust += 0.05;
            }
            if fast {
                adjust += 0.05;
            }
            if f.observation_count >= 20 {
                adjust += 0.05;
            }
            return Classification {
                class: ObjectClass::Car,
                confidence: self.confidence(adjust),
            };
        }

        // Pedestrian: person-sized and walking pace.
        if f.avg_height >= p.pedestrian_min_height
            && f.avg_height <= p.pedestrian_max_height
            && f.avg_speed <= p.pedestrian_max_speed
            && f.avg_length < p.pedestrian_max_length
            && f.avg_width < p.pedestrian_max_width
        {
            let mut adjust = 0.0;
            if (1.4..=2.0).contains(&f.avg_height) {
                adjust += 0.05;
            }
            if (0.3..=2.0).contains(&f.avg_speed) {
                adjust += 0.05;
            }
            if f.observation_count >= 20 {
                adjust += 0.05;
            }
            return Classification {
                class: ObjectClass::Pedestrian,
                confidence: self.confidence(adjust),
            };
        }

        Classification {
            class: ObjectClass::Other,
            confidence: self.confidence(-0.1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn features() -> TrackFeatures {
        TrackFeatures {
            avg_height: 0.0,
            avg_length: 0.0,
            avg_width: 0.0,
            height_p95: 0.0,
            avg_speed: 0.0,
            peak_speed: 0.0,
            speed_p50: 0.0,
            speed_p85: 0.0,
            speed_p95: 0.0,
            observation_count: 30,
            duration_s: 3.0,
        }
    }

    fn classify(f: TrackFeatures) -> Classification {
        RuleClassifier::new(ClassifierParams::default()).classify(&f)
    }

    #[test]
    fn car() {
        let c = classify(TrackFeatures {
            avg_length: 4.5,
            avg_width: 1.8,
            avg_height: 1.5,
            avg_speed: 12.0,
            peak_speed: 15.0,
            ..features()
        });
        assert_eq!(c.class, ObjectClass::Car);
        assert!(c.confidence >= 0.70 && c.confidence <= 0.85);
    }

    #[test]
    fn slow_tall_vehicle_still_car() {
        // Stopped truck: large and tall but not fast.
        let c = classify(TrackFeatures {
            avg_length: 6.0,
            avg_width: 2.2,
            avg_height: 2.8,
            avg_speed: 0.5,
            peak_speed: 1.0,
            ..features()
        });
        assert_eq!(c.class, ObjectClass::Car);
    }

    #[test]
    fn pedestrian() {
        let c = classify(TrackFeatures {
            avg_height: 1.7,
            avg_length: 0.6,
            avg_width: 0.5,
            avg_speed: 1.4,
            peak_speed: 2.0,
            ..features()
        });
        assert_eq!(c.class, ObjectClass::Pedestrian);
        assert!(c.confidence >= 0.5);
    }

    #[test]
    fn bird() {
        let c = classify(TrackFeatures {
            avg_height: 0.2,
            avg_length: 0.3,
            avg_width: 0.3,
            avg_speed: 0.5,
            peak_speed: 0.9,
            ..features()
        });
        assert_eq!(c.class, ObjectClass::Bird);
    }

    #[test]
    fn too_few_observations_is_other() {
        let c = classify(TrackFeatures {
            avg_length: 4.5,
            avg_width: 1.8,
            avg_speed: 12.0,
            observation_count: 3,
            ..features()
        });
        assert_eq!(c.class, ObjectClass::Other);
        assert!(c.confidence < 0.5);
    }

    #[test]
    fn odd_shape_is_other() {
        let c = classify(TrackFeatures {
            avg_height: 0.8,
            avg_length: 2.0,
            avg_width: 1.0,
            avg_speed: 4.0,
            peak_speed: 5.0,
            ..features()
        });
        assert_eq!(c.class, ObjectClass::Other);
    }
}
