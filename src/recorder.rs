//! recording of caller api calls
//!
//! A `Recorder` is attached to one `Caller` and sees every public call made through it until it
//! is detached. Nothing is recorded globally.
use std::time::{Duration, SystemTime};

use may::sync::Mutex;

/// one finished caller api call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    /// caller method, e.g. `"call"` or `"start"`
    pub api: &'static str,
    /// procedure involved, empty for `start`/`stop`
    pub procedure: String,
    /// wall clock time the call started
    pub started: SystemTime,
    /// how long the call took
    pub elapsed: Duration,
    /// the error message if the call failed
    pub error: Option<String>,
}

impl ApiCall {
    /// whether the call failed
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// receives a record for every caller api call
pub trait Recorder: Send + Sync {
    /// store one record
    fn record(&self, call: ApiCall);
}

/// recorder keeping every record in memory
pub struct CallRecorder {
    calls: Mutex<Vec<ApiCall>>,
}

impl Default for CallRecorder {
    fn default() -> Self {
        CallRecorder::new()
    }
}

impl CallRecorder {
    /// create an empty recorder
    pub fn new() -> Self {
        CallRecorder {
            calls: Mutex::new(Vec::new()),
        }
    }

    /// the records so far, oldest first
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    /// drop every record
    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Recorder for CallRecorder {
    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let recorder = CallRecorder::new();
        for (i, api) in ["start", "call", "stop"].into_iter().enumerate() {
            recorder.record(ApiCall {
                api,
                procedure: String::new(),
                started: SystemTime::now(),
                elapsed: Duration::from_millis(i as u64),
                error: (i == 1).then(|| "boom".to_owned()),
            });
        }
        let calls = recorder.calls();
        assert_eq!(calls.iter().map(|c| c.api).collect::<Vec<_>>(), ["start", "call", "stop"]);
        assert!(calls[1].is_error());
        recorder.clear();
        assert!(recorder.calls().is_empty());
    }
}
