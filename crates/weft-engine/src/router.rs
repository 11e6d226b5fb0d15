use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use weft_core::config::RoutingConfig;
use weft_core::error::{Result, WeftError};
use weft_core::state::{RoutingDecision, WorkflowState};

/// Running confidence statistics for one route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    total: f64,
}

impl RouteStats {
    fn first(confidence: f64) -> Self {
        Self {
            count: 1,
            min: confidence,
            max: confidence,
            total: confidence,
        }
    }

    fn record(&mut self, confidence: f64) {
        self.count += 1;
        self.min = self.min.min(confidence);
        self.max = self.max.max(confidence);
        self.total += confidence;
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// Picks among weighted candidate successors by confidence.
pub struct RouterOptimizer {
    threshold: f64,
    stats: Mutex<HashMap<String, RouteStats>>,
}

impl RouterOptimizer {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            threshold: config.low_confidence_threshold,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Argmax over `options`; ties go to the lexicographically smallest name.
    ///
    /// NaN confidences are rejected, everything else is clamped to [0, 1].
    pub fn select(options: &BTreeMap<String, f64>) -> Result<(String, f64)> {
        let mut best: Option<(&String, f64)> = None;
        // BTreeMap iterates in name order, so a strict `>` keeps the smallest name on ties.
        for (route, &raw) in options {
            let confidence = normalize(route, raw)?;
            match best {
                Some((_, best_conf)) if confidence <= best_conf => {}
                _ => best = Some((route, confidence)),
            }
        }
        best.map(|(route, conf)| (route.clone(), conf))
            .ok_or_else(|| WeftError::NoRoute("empty option set".into()))
    }

    /// Choose a route from `node` and record the decision on the workflow.
    ///
    /// A choice below the threshold is flagged `low_confidence` but still
    /// returned; acting on the flag is up to the caller.
    pub fn optimize_routing(
        &self,
        state: &mut WorkflowState,
        node: &str,
        options: &BTreeMap<String, f64>,
    ) -> Result<RoutingDecision> {
        state.ensure_mutable()?;
        if options.is_empty() {
            return Err(WeftError::NoRoute(node.to_string()));
        }
        let (chosen, confidence) = Self::select(options)?;
        let normalized = options
            .iter()
            .map(|(route, &conf)| Ok((route.clone(), normalize(route, conf)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let low_confidence = confidence < self.threshold;
        let decision = RoutingDecision {
            node: node.to_string(),
            options: normalized,
            chosen: chosen.clone(),
            confidence,
            low_confidence,
            timestamp: Utc::now(),
        };
        state.push_routing(decision.clone())?;

        if low_confidence {
            warn!(
                thread_id = %state.thread_id(),
                node,
                route = %chosen,
                confidence,
                threshold = self.threshold,
                "Low-confidence route selected"
            );
        } else {
            debug!(thread_id = %state.thread_id(), node, route = %chosen, confidence, "Route selected");
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats
            .entry(chosen)
            .and_modify(|s| s.record(confidence))
            .or_insert_with(|| RouteStats::first(confidence));

        Ok(decision)
    }

    /// Statistics for routes chosen so far.
    pub fn route_stats(&self, route: &str) -> Option<RouteStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(route)
            .copied()
    }

    pub fn all_stats(&self) -> HashMap<String, RouteStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for RouterOptimizer {
    fn default() -> Self {
        Self::new(RoutingConfig::default())
    }
}

fn normalize(route: &str, confidence: f64) -> Result<f64> {
    if confidence.is_nan() {
        return Err(WeftError::InvalidConfidence {
            subject: format!("route {}", route),
            value: confidence,
        });
    }
    Ok(confidence.clamp(0.0, 1.0))
}
