//! Scripted engine for tests and dry runs

use crate::{DetectionEngine, InferenceError};
use camera_capture::Frame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Arguments of one `detect_analyze` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedCall {
    pub product_count: u64,
    pub shot: u32,
}

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<Result<Vec<Vec<i32>>, String>>,
    calls: Vec<ScriptedCall>,
}

/// Engine replaying queued responses; clones share the script
///
/// Once the queue is empty every target is reported Good.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    targets: usize,
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    pub fn new(targets: usize) -> Self {
        Self {
            targets,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Queue a successful result
    pub fn push_result(&self, result: Vec<Vec<i32>>) {
        if let Ok(mut s) = self.script.lock() {
            s.responses.push_back(Ok(result));
        }
    }

    /// Queue a failure
    pub fn push_failure(&self, message: &str) {
        if let Ok(mut s) = self.script.lock() {
            s.responses.push_back(Err(message.to_string()));
        }
    }

    /// Calls seen so far
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.script.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }
}

impl DetectionEngine for ScriptedEngine {
    fn detect_analyze(
        &mut self,
        _frame: &Frame,
        product_count: u64,
        shot: u32,
    ) -> Result<Vec<Vec<i32>>, InferenceError> {
        let mut s = self
            .script
            .lock()
            .map_err(|e| InferenceError::InferenceFailed(format!("Lock error: {}", e)))?;
        s.calls.push(ScriptedCall { product_count, shot });
        match s.responses.pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(InferenceError::InferenceFailed(message)),
            None => Ok(vec![Vec::new(); self.targets]),
        }
    }

    fn target_count(&self) -> usize {
        self.targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_then_good() {
        let engine = ScriptedEngine::new(2);
        engine.push_result(vec![vec![3], vec![]]);
        engine.push_failure("boom");

        let mut e = engine.clone();
        let frame = Frame::filled(2, 2, 1, 0);
        assert_eq!(e.detect_analyze(&frame, 1, 1).unwrap(), vec![vec![3], vec![]]);
        assert!(e.detect_analyze(&frame, 1, 2).is_err());
        assert_eq!(e.detect_analyze(&frame, 2, 1).unwrap(), vec![Vec::<i32>::new(); 2]);

        let calls = engine.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], ScriptedCall { product_count: 1, shot: 2 });
    }
}
