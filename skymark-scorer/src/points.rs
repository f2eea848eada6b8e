//! Point-value generation for new matches
//!
//! Each tag becomes a penalty ("mine") tag with probability
//! `penalty_chance`, otherwise it gets a uniform value in
//! `min_points..=max_points`.

use std::collections::HashMap;

use rand::Rng;
use skymark_common::config::PointsConfig;

use crate::store::MatchTable;

/// Generation rules for tag point values
#[derive(Debug, Clone, PartialEq)]
pub struct PointsPolicy {
    pub min_points: i64,
    pub max_points: i64,
    pub penalty_chance: f64,
    pub penalty_value: i64,
}

impl Default for PointsPolicy {
    fn default() -> Self {
        Self::from(&PointsConfig::default())
    }
}

impl From<&PointsConfig> for PointsPolicy {
    fn from(config: &PointsConfig) -> Self {
        Self {
            min_points: config.min_points,
            max_points: config.max_points,
            penalty_chance: config.penalty_chance.clamp(0.0, 1.0),
            penalty_value: config.penalty_value,
        }
    }
}

impl PointsPolicy {
    /// Point value for a single tag
    pub fn roll<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        if rng.gen_bool(self.penalty_chance) {
            self.penalty_value
        } else {
            let (lo, hi) = if self.min_points <= self.max_points {
                (self.min_points, self.max_points)
            } else {
                (self.max_points, self.min_points)
            };
            rng.gen_range(lo..=hi)
        }
    }

    /// Table for a new match; duplicate tag ids collapse to one entry
    pub fn generate<R: Rng + ?Sized>(&self, tag_ids: &[String], rng: &mut R) -> MatchTable {
        let mut points = HashMap::with_capacity(tag_ids.len());
        for tag_id in tag_ids {
            if !points.contains_key(tag_id) {
                let value = self.roll(rng);
                points.insert(tag_id.clone(), value);
            }
        }
        MatchTable::new(points)
    }
}
