//! Signal collection for health scoring.
//!
//! Signals come from two places: values published by steps in their detail
//! payload under a `"signals"` object, and [`SignalProvider`]s queried after
//! the maintenance window closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ScoringError;
use crate::health::{SignalSet, SignalValue};

/// Default budget for a single provider read.
pub const DEFAULT_SIGNAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of one named signal.
#[async_trait]
pub trait SignalProvider: Send + Sync {
    /// Name of the signal this provider measures.
    fn signal(&self) -> &str;

    /// Measure the signal. `Ok(None)` means no value exists (e.g. an empty
    /// compress log) and the signal is excluded from scoring.
    async fn read(&self) -> Result<Option<SignalValue>, ScoringError>;
}

/// Extract `{"signals": {"name": value}}` entries from a step detail.
///
/// Numbers and strings are accepted; other JSON types are ignored.
pub fn signals_from_detail(detail: &Value) -> Vec<(String, SignalValue)> {
    let Some(map) = detail.get("signals").and_then(Value::as_object) else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(name, v)| {
            let value = match v {
                Value::Number(n) => SignalValue::Number(n.as_f64()?),
                Value::String(s) => SignalValue::Category(s.clone()),
                _ => return None,
            };
            Some((name.clone(), value))
        })
        .collect()
}

/// Query every provider whose signal is not already known.
///
/// Provider errors, timeouts and empty readings are recorded as unavailable
/// with the reason; they never abort collection.
pub async fn collect_signals(
    providers: &[Arc<dyn SignalProvider>],
    mut signals: SignalSet,
    timeout: Duration,
) -> SignalSet {
    for provider in providers {
        let name = provider.signal();
        if signals.has_value(name) {
            tracing::debug!(signal = name, "Signal already published by a step");
            continue;
        }
        match tokio::time::timeout(timeout, provider.read()).await {
            Ok(Ok(Some(value))) => {
                tracing::debug!(signal = name, ?value, "Signal collected");
                signals.record(name, value);
            }
            Ok(Ok(None)) => {
                signals.mark_unavailable(name, "no value reported");
            }
            Ok(Err(e)) => {
                tracing::warn!(signal = name, error = %e, "Signal collection failed");
                signals.mark_unavailable(name, e.to_string());
            }
            Err(_elapsed) => {
                tracing::warn!(
                    signal = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Signal collection timed out",
                );
                signals.mark_unavailable(
                    name,
                    format!("timed out after {}ms", timeout.as_millis()),
                );
            }
        }
    }
    signals
}
