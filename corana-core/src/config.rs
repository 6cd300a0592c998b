//! Run configuration: parsing and validation of the keys a deployment's
//! config file recognizes (§6). Only a subset actually drives in-scope
//! behavior; the rest (detector I/O, output sinks) are parsed and
//! validated for round-trip fidelity but otherwise unused here.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CoranaError, Result};
use crate::g2::G2Kind;

/// Keys `checkParams`-style validation requires to be present. Matches the
/// source framework's `expectedSystemKeys` set.
const REQUIRED_KEYS: &[&str] = &[
    "dataset",
    "src",
    "psanaType",
    "ndarrayProducerOutKey",
    "ndarrayCalibOutKey",
    "psanaOptions",
    "outputArrayType",
    "workerStoreDtype",
    "maskNdarrayCoords",
    "testMaskNdarrayCoords",
    "numServers",
    "serverHosts",
    "times",
    "update",
    "delays",
    "h5output",
    "testH5output",
    "overwrite",
    "verbosity",
    "numEvents",
    "userClass",
    "testNumEvents",
];

/// Out-of-scope keys that address the detector I/O / output-sink
/// collaborators. Parsed for round-trip fidelity; not threaded into
/// behavior by this crate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExternalIoConfig {
    pub dataset: Option<String>,
    pub src: Option<String>,
    #[serde(rename = "psanaType")]
    pub psana_type: Option<String>,
    #[serde(rename = "ndarrayProducerOutKey")]
    pub ndarray_producer_out_key: Option<String>,
    #[serde(rename = "ndarrayCalibOutKey")]
    pub ndarray_calib_out_key: Option<String>,
    #[serde(rename = "psanaOptions")]
    pub psana_options: Option<serde_json::Value>,
    #[serde(rename = "outputArrayType")]
    pub output_array_type: Option<String>,
    pub h5output: Option<String>,
    #[serde(rename = "testH5output")]
    pub test_h5output: Option<String>,
    pub overwrite: Option<bool>,
}

/// The run configuration this crate actually acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of server ranks (S).
    #[serde(rename = "numServers")]
    pub num_servers: usize,
    /// Preferred server hosts, in priority order. Empty means "any host".
    #[serde(rename = "serverHosts", default)]
    pub server_hosts: Vec<String>,
    /// Ring buffer capacity T (frames retained per worker).
    pub times: usize,
    /// Event cadence between UPDATE broadcasts; 0 disables mid-run updates.
    pub update: u64,
    /// Ordered delay list Δ.
    pub delays: Vec<i64>,
    /// Mask coordinates (flattened indices into the detector shape) for
    /// the production mask and, separately, for test runs.
    #[serde(rename = "maskNdarrayCoords")]
    pub mask_ndarray_coords: Vec<usize>,
    #[serde(rename = "testMaskNdarrayCoords", default)]
    pub test_mask_ndarray_coords: Vec<usize>,
    /// Detector shape (flattened length D; masks/colors are indexed 0..D).
    #[serde(rename = "detectorLen")]
    pub detector_len: usize,
    /// Which G2 engine variant to run.
    #[serde(rename = "userClass")]
    pub user_class: G2Kind,
    /// Selection mode at the master: round-robin vs strict time order.
    #[serde(rename = "serversRoundRobin", default)]
    pub servers_round_robin: bool,
    /// Logging verbosity, as a `tracing`-compatible level name.
    #[serde(default = "RunConfig::default_verbosity")]
    pub verbosity: String,
    /// Number of events to run before stopping (0 = run to source exhaustion).
    #[serde(rename = "numEvents", default)]
    pub num_events: u64,
    #[serde(rename = "testNumEvents", default)]
    pub test_num_events: u64,
    /// Saturation threshold; values at or above this are sticky-flagged.
    #[serde(rename = "saturatedValue", default = "RunConfig::default_saturated_value")]
    pub saturated_value: f32,
    /// Floor value; anything below this is clamped up to it.
    #[serde(default = "RunConfig::default_notzero")]
    pub notzero: f32,
    /// Events between data-rate log lines at the master (0 disables).
    #[serde(rename = "dataRateLogInterval", default = "RunConfig::default_data_rate_log_interval")]
    pub data_rate_log_interval: u64,

    #[serde(flatten)]
    pub external_io: ExternalIoConfig,
}

impl RunConfig {
    fn default_verbosity() -> String { "info".to_string() }
    fn default_saturated_value() -> f32 { 1.0e6 }
    fn default_notzero() -> f32 { 1.0e-6 }
    fn default_data_rate_log_interval() -> u64 { 1200 }

    /// Parse from a JSON document, matching the key set the system
    /// recognizes. Unrecognized top-level keys are warned about, not
    /// rejected — mirroring `CommSystemUtil.checkParams`'s warn-only
    /// handling of `newSystemKeys`.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self> {
        check_params(raw)?;
        serde_json::from_value(raw.clone())
            .map_err(|e| CoranaError::Configuration(format!("failed to parse run config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_servers == 0 {
            return Err(CoranaError::Configuration("numServers must be >= 1".into()));
        }
        if self.times == 0 {
            return Err(CoranaError::Configuration("times (ring capacity) must be >= 1".into()));
        }
        if self.delays.is_empty() {
            return Err(CoranaError::Configuration("delays must be non-empty".into()));
        }
        if self.mask_ndarray_coords.is_empty() {
            return Err(CoranaError::Configuration("mask must have at least one true entry".into()));
        }
        let mut seen = HashSet::new();
        for &c in &self.mask_ndarray_coords {
            if c >= self.detector_len {
                return Err(CoranaError::Data(format!(
                    "mask coordinate {c} out of range for detector_len={}",
                    self.detector_len
                )));
            }
            if !seen.insert(c) {
                return Err(CoranaError::Data(format!("duplicate mask coordinate {c}")));
            }
        }
        let mut sorted_delays = self.delays.clone();
        sorted_delays.sort_unstable();
        if sorted_delays != self.delays {
            return Err(CoranaError::Configuration("delays must be given in ascending order".into()));
        }
        Ok(())
    }
}

/// Validates a raw JSON config against the expected key set:
/// asserts all required keys are present (fatal if not), warns on any
/// unrecognized key (non-fatal). Mirrors `CommSystemUtil.checkParams`.
fn check_params(raw: &serde_json::Value) -> Result<()> {
    let obj = raw.as_object().ok_or_else(|| {
        CoranaError::Configuration("run config must be a JSON object".to_string())
    })?;

    let present: HashSet<&str> = obj.keys().map(|k| k.as_str()).collect();
    let expected: HashSet<&str> = REQUIRED_KEYS.iter().copied().collect();

    let missing: Vec<&str> = expected.difference(&present).copied().collect();
    if !missing.is_empty() {
        return Err(CoranaError::Configuration(format!(
            "required keys missing from run config: {missing:?}"
        )));
    }

    // A handful of keys are always accepted beyond REQUIRED_KEYS because
    // this crate's RunConfig adds in-scope fields the source didn't have.
    const EXTRA_ALLOWED: &[&str] = &[
        "detectorLen",
        "detector_len",
        "serversRoundRobin",
        "saturatedValue",
        "notzero",
        "dataRateLogInterval",
    ];
    let allowed_extra: HashSet<&str> = EXTRA_ALLOWED.iter().copied().collect();
    let unexpected: Vec<&str> = present
        .difference(&expected)
        .copied()
        .filter(|k| !allowed_extra.contains(k))
        .collect();
    if !unexpected.is_empty() {
        tracing::warn!("unexpected keys in run config: {unexpected:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_config_json() -> serde_json::Value {
        json!({
            "dataset": "exp/run", "src": "DetInfo(:Opal1000)", "psanaType": "ndarray",
            "ndarrayProducerOutKey": "calib", "ndarrayCalibOutKey": "calib",
            "psanaOptions": {}, "outputArrayType": "float32", "workerStoreDtype": "float32",
            "maskNdarrayCoords": [0, 1, 2, 3], "testMaskNdarrayCoords": [0, 1, 2, 3],
            "numServers": 1, "serverHosts": [], "times": 20, "update": 10,
            "delays": [1, 2, 3, 5], "h5output": "out.h5", "testH5output": "test.h5",
            "overwrite": true, "verbosity": "info", "numEvents": 0, "testNumEvents": 0,
            "userClass": "AtEnd", "detectorLen": 16
        })
    }

    #[test]
    fn rejects_missing_required_key() {
        let mut raw = minimal_config_json();
        raw.as_object_mut().unwrap().remove("delays");
        let err = RunConfig::from_json(&raw).unwrap_err();
        assert!(matches!(err, CoranaError::Configuration(_)));
    }

    #[test]
    fn accepts_minimal_config_and_warns_on_unexpected_extra() {
        let mut raw = minimal_config_json();
        raw.as_object_mut().unwrap().insert("weirdKey".into(), json!(1));
        let cfg = RunConfig::from_json(&raw).expect("should parse despite unexpected key");
        assert_eq!(cfg.num_servers, 1);
        assert_eq!(cfg.delays, vec![1, 2, 3, 5]);
    }

    #[test]
    fn validate_rejects_unsorted_delays() {
        let mut raw = minimal_config_json();
        raw["delays"] = json!([3, 1, 2]);
        let cfg = RunConfig::from_json(&raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_mask_coordinate() {
        let mut raw = minimal_config_json();
        raw["maskNdarrayCoords"] = json!([0, 1, 99]);
        let cfg = RunConfig::from_json(&raw).unwrap();
        assert!(cfg.validate().is_err());
    }
}
